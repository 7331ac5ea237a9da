//! A safe wrapper over the blosc compression library.
//!
//! Blosc is a block-oriented meta-compressor: every compressed buffer is
//! self-describing, carrying its uncompressed size, block size, and type size
//! in a 16-byte header, and supports decompressing a contiguous item range by
//! decoding only the blocks that contain it.
//!
//! The library has process-wide init/teardown state. It is exposed here as the
//! explicit [`BloscContext`] lifecycle handle: the first
//! [`acquire`](BloscContext::acquire) initialises the library and dropping the
//! last handle tears it down. All (de)compression entry points are methods on
//! the context so the library cannot be driven uninitialised.
//!
//! Whether blosc may parallelise internally is governed by the global
//! [`ThreadPolicy`](crate::config::ThreadPolicy): when threads are permitted
//! the (locked) global-state blosc calls are used, otherwise the serial,
//! context-local `_ctx` call path.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use blosc_src::{
    blosc_cbuffer_complib, blosc_cbuffer_metainfo, blosc_cbuffer_sizes, blosc_cbuffer_validate,
    blosc_cbuffer_versions, blosc_compress, blosc_compress_ctx, blosc_decompress,
    blosc_decompress_ctx, blosc_destroy, blosc_get_complib_info, blosc_getitem, blosc_init,
    blosc_set_compressor, blosc_set_nthreads, BLOSC_MAX_OVERHEAD, BLOSC_MAX_TYPESIZE,
    BLOSC_MIN_HEADER_LENGTH,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::global_config;

/// The maximum type size the codec shuffles on; larger types fall back to a
/// type size of one.
pub const MAX_TYPESIZE: usize = BLOSC_MAX_TYPESIZE as usize;

/// A blosc codec error.
#[derive(Clone, Debug, Error)]
pub enum BloscError {
    /// The named codec is not registered with the linked blosc library.
    #[error("codec `{_0}` is not registered")]
    UnknownCodec(String),
    /// The backing codec reported a non-positive status while compressing.
    #[error("blosc compression failed with status {_0}")]
    CompressionFailed(i32),
    /// A short or negative return while decompressing, or a malformed header.
    #[error("corrupt compressed buffer: {_0}")]
    CorruptBuffer(String),
}

/// The compressors blosc can delegate to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    /// The blosc-internal LZ codec.
    #[display("blosclz")]
    #[serde(rename = "blosclz")]
    BloscLz,
    /// LZ4.
    #[display("lz4")]
    Lz4,
    /// LZ4 in high-compression mode.
    #[display("lz4hc")]
    Lz4Hc,
    /// Snappy.
    #[display("snappy")]
    Snappy,
    /// Zlib.
    #[display("zlib")]
    Zlib,
    /// Zstandard.
    #[display("zstd")]
    Zstd,
}

impl Compressor {
    pub(crate) fn as_cstr(self) -> &'static CStr {
        match self {
            Self::BloscLz => c"blosclz",
            Self::Lz4 => c"lz4",
            Self::Lz4Hc => c"lz4hc",
            Self::Snappy => c"snappy",
            Self::Zlib => c"zlib",
            Self::Zstd => c"zstd",
        }
    }
}

impl FromStr for Compressor {
    type Err = BloscError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blosclz" => Ok(Self::BloscLz),
            "lz4" => Ok(Self::Lz4),
            "lz4hc" => Ok(Self::Lz4Hc),
            "snappy" => Ok(Self::Snappy),
            "zlib" => Ok(Self::Zlib),
            "zstd" => Ok(Self::Zstd),
            _ => Err(BloscError::UnknownCodec(s.to_string())),
        }
    }
}

/// The shuffle filter applied before compression.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Default)]
pub enum ShuffleMode {
    /// No shuffling.
    #[display("noshuffle")]
    None,
    /// Byte-wise shuffling of the type size.
    #[display("shuffle")]
    #[default]
    Byte,
    /// Bit-wise shuffling.
    #[display("bitshuffle")]
    Bit,
}

impl ShuffleMode {
    fn as_c_int(self) -> c_int {
        match self {
            Self::None => blosc_src::BLOSC_NOSHUFFLE as c_int,
            Self::Byte => blosc_src::BLOSC_SHUFFLE as c_int,
            Self::Bit => blosc_src::BLOSC_BITSHUFFLE as c_int,
        }
    }
}

// Persisted as the integer the original storage format uses (0 | 1 | 2).
impl Serialize for ShuffleMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Bit => 2,
        })
    }
}

impl<'de> Deserialize<'de> for ShuffleMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Self::None),
            1 => Ok(Self::Byte),
            2 => Ok(Self::Bit),
            other => Err(serde::de::Error::custom(format!(
                "invalid shuffle mode {other}"
            ))),
        }
    }
}

/// Compression parameters for chunk construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cparams {
    /// Compression level, `0..=9`.
    pub clevel: u8,
    /// The shuffle filter.
    pub shuffle: ShuffleMode,
    /// The delegated compressor.
    pub cname: Compressor,
    /// Optional significant-digit quantization for float element types.
    pub quantize: Option<u32>,
}

impl Default for Cparams {
    fn default() -> Self {
        Self {
            clevel: 5,
            shuffle: ShuffleMode::Byte,
            cname: Compressor::BloscLz,
            quantize: None,
        }
    }
}

/// Metadata decoded from a self-describing compressed buffer's header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    /// Uncompressed size in bytes.
    pub nbytes: usize,
    /// Total compressed buffer size in bytes, header included.
    pub cbytes: usize,
    /// The codec's internal block granularity in bytes.
    pub blocksize: usize,
    /// The type size the buffer was compressed with.
    pub typesize: usize,
    /// Header flags.
    pub flags: i32,
    /// Blosc format version.
    pub version: i32,
    /// Delegated-codec format version.
    pub versionlz: i32,
    /// Name of the compression library that produced the buffer.
    pub complib: String,
}

// The global-state blosc entry points (blosc_compress/blosc_decompress and the
// set_* knobs) are not reentrant; this lock serialises them. The _ctx entry
// points and blosc_getitem need no lock.
static GLOBAL_CODEC: Mutex<()> = Mutex::new(());

static CONTEXT_SLOT: Mutex<Weak<ContextInner>> = Mutex::new(Weak::new());

#[derive(Debug)]
struct ContextInner(());

impl Drop for ContextInner {
    fn drop(&mut self) {
        let _slot = CONTEXT_SLOT.lock();
        unsafe { blosc_destroy() };
    }
}

/// A handle to the process-wide blosc library state.
///
/// The first [`acquire`](Self::acquire) initialises the library; dropping the
/// last clone tears it down. Handles are cheap to clone.
#[derive(Clone, Debug)]
pub struct BloscContext {
    _inner: Arc<ContextInner>,
}

impl BloscContext {
    /// Acquire a handle, initialising the library if no handle is live.
    #[must_use]
    pub fn acquire() -> Self {
        let mut slot = CONTEXT_SLOT.lock().unwrap_or_else(|e| e.into_inner());
        let inner = slot.upgrade().unwrap_or_else(|| {
            unsafe { blosc_init() };
            let inner = Arc::new(ContextInner(()));
            *slot = Arc::downgrade(&inner);
            inner
        });
        Self { _inner: inner }
    }

    /// Compress `src` into a self-describing buffer.
    ///
    /// `typesize` is the codec's shuffle granularity in bytes. The block size
    /// is chosen by the codec.
    ///
    /// # Errors
    /// Returns [`BloscError::UnknownCodec`] if `cparams.cname` is not
    /// registered with the linked library, or
    /// [`BloscError::CompressionFailed`] on a non-positive codec status.
    pub fn compress(
        &self,
        src: &[u8],
        typesize: usize,
        cparams: &Cparams,
    ) -> Result<Vec<u8>, BloscError> {
        let cname = cparams.cname.as_cstr();
        let support = unsafe {
            blosc_get_complib_info(
                cname.as_ptr().cast::<c_char>(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if support < 0 {
            return Err(BloscError::UnknownCodec(cparams.cname.to_string()));
        }

        let mut dest = vec![0u8; src.len() + BLOSC_MAX_OVERHEAD as usize];
        let clevel = c_int::from(cparams.clevel.min(9));
        let shuffle = cparams.shuffle.as_c_int();
        let threads = global_config()
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .resolve_threads();
        let status = match threads {
            Some(n) => {
                let _guard = GLOBAL_CODEC
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                unsafe {
                    blosc_set_nthreads(n.min(c_int::MAX as usize) as c_int);
                    if blosc_set_compressor(cname.as_ptr().cast::<c_char>()) < 0 {
                        return Err(BloscError::UnknownCodec(cparams.cname.to_string()));
                    }
                    blosc_compress(
                        clevel,
                        shuffle,
                        typesize,
                        src.len(),
                        src.as_ptr().cast::<c_void>(),
                        dest.as_mut_ptr().cast::<c_void>(),
                        dest.len(),
                    )
                }
            }
            None => unsafe {
                blosc_compress_ctx(
                    clevel,
                    shuffle,
                    typesize,
                    src.len(),
                    src.as_ptr().cast::<c_void>(),
                    dest.as_mut_ptr().cast::<c_void>(),
                    dest.len(),
                    cname.as_ptr().cast::<c_char>(),
                    0,
                    1,
                )
            },
        };
        if status <= 0 {
            return Err(BloscError::CompressionFailed(status));
        }
        dest.truncate(status as usize);
        Ok(dest)
    }

    /// Decompress the entire buffer `src` into `dest`.
    ///
    /// `dest` must be sized to the buffer's uncompressed byte count.
    ///
    /// # Errors
    /// Returns [`BloscError::CorruptBuffer`] on a short or negative return.
    pub fn decompress(&self, src: &[u8], dest: &mut [u8]) -> Result<(), BloscError> {
        let threads = global_config()
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .resolve_threads();
        let status = match threads {
            Some(n) => {
                let _guard = GLOBAL_CODEC
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                unsafe {
                    blosc_set_nthreads(n.min(c_int::MAX as usize) as c_int);
                    blosc_decompress(
                        src.as_ptr().cast::<c_void>(),
                        dest.as_mut_ptr().cast::<c_void>(),
                        dest.len(),
                    )
                }
            }
            None => unsafe {
                blosc_decompress_ctx(
                    src.as_ptr().cast::<c_void>(),
                    dest.as_mut_ptr().cast::<c_void>(),
                    dest.len(),
                    1,
                )
            },
        };
        if status <= 0 || status as usize != dest.len() {
            return Err(BloscError::CorruptBuffer(format!(
                "decompressed {status} bytes, expected {}",
                dest.len()
            )));
        }
        Ok(())
    }

    /// Decompress items `[start, start + nitems)` into `dest` by decoding only
    /// the blocks that contain them.
    ///
    /// Items are in units of the type size the buffer was compressed with;
    /// `dest` must be sized to `nitems * typesize` bytes.
    ///
    /// # Errors
    /// Returns [`BloscError::CorruptBuffer`] on a short or negative return.
    pub fn decompress_items(
        &self,
        src: &[u8],
        start: usize,
        nitems: usize,
        dest: &mut [u8],
    ) -> Result<(), BloscError> {
        if start > c_int::MAX as usize || nitems > c_int::MAX as usize {
            return Err(BloscError::CorruptBuffer(format!(
                "item range {start}..{} exceeds the codec's addressable range",
                start + nitems
            )));
        }
        // blosc_getitem is serial and keeps no global state.
        let status = unsafe {
            blosc_getitem(
                src.as_ptr().cast::<c_void>(),
                start as c_int,
                nitems as c_int,
                dest.as_mut_ptr().cast::<c_void>(),
            )
        };
        if status < 0 || status as usize != dest.len() {
            return Err(BloscError::CorruptBuffer(format!(
                "item decode returned {status} bytes, expected {}",
                dest.len()
            )));
        }
        Ok(())
    }
}

/// Validate a compressed buffer, returning its uncompressed size.
///
/// Returns [`None`] if the buffer header is malformed or inconsistent with the
/// buffer length.
#[must_use]
pub fn validate(src: &[u8]) -> Option<usize> {
    if src.len() < BLOSC_MIN_HEADER_LENGTH as usize {
        return None;
    }
    let mut nbytes = 0usize;
    let status =
        unsafe { blosc_cbuffer_validate(src.as_ptr().cast::<c_void>(), src.len(), &raw mut nbytes) };
    (status >= 0).then_some(nbytes)
}

/// Read the self-describing header of a compressed buffer.
///
/// # Errors
/// Returns [`BloscError::CorruptBuffer`] if the buffer is shorter than a
/// header or its recorded compressed size disagrees with the buffer length.
pub fn buffer_info(src: &[u8]) -> Result<BufferInfo, BloscError> {
    if src.len() < BLOSC_MIN_HEADER_LENGTH as usize {
        return Err(BloscError::CorruptBuffer(format!(
            "buffer of {} bytes is shorter than a codec header",
            src.len()
        )));
    }
    let mut nbytes = 0usize;
    let mut cbytes = 0usize;
    let mut blocksize = 0usize;
    let mut typesize = 0usize;
    let mut flags = 0 as c_int;
    let mut version = 0 as c_int;
    let mut versionlz = 0 as c_int;
    let complib;
    unsafe {
        blosc_cbuffer_sizes(
            src.as_ptr().cast::<c_void>(),
            &raw mut nbytes,
            &raw mut cbytes,
            &raw mut blocksize,
        );
        blosc_cbuffer_metainfo(
            src.as_ptr().cast::<c_void>(),
            &raw mut typesize,
            &raw mut flags,
        );
        blosc_cbuffer_versions(
            src.as_ptr().cast::<c_void>(),
            &raw mut version,
            &raw mut versionlz,
        );
        let name = blosc_cbuffer_complib(src.as_ptr().cast::<c_void>());
        complib = if name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(name).to_string_lossy().into_owned()
        };
    }
    if cbytes != src.len() {
        return Err(BloscError::CorruptBuffer(format!(
            "header records {cbytes} compressed bytes but the buffer holds {}",
            src.len()
        )));
    }
    Ok(BufferInfo {
        nbytes,
        cbytes,
        blocksize,
        typesize,
        flags,
        version,
        versionlz,
        complib,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn compress_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = BloscContext::acquire();
        let src = sample(64 * 1024);
        let compressed = ctx.compress(&src, 8, &Cparams::default())?;
        assert!(compressed.len() < src.len());

        let info = buffer_info(&compressed)?;
        assert_eq!(info.nbytes, src.len());
        assert_eq!(info.cbytes, compressed.len());
        assert_eq!(info.typesize, 8);
        assert!(info.blocksize > 0);
        assert_eq!(validate(&compressed), Some(src.len()));

        let mut out = vec![0u8; src.len()];
        ctx.decompress(&compressed, &mut out)?;
        assert_eq!(out, src);
        Ok(())
    }

    #[test]
    fn partial_item_decode() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = BloscContext::acquire();
        let src = sample(32 * 1024);
        let compressed = ctx.compress(&src, 4, &Cparams::default())?;

        let mut out = vec![0u8; 40];
        ctx.decompress_items(&compressed, 100, 10, &mut out)?;
        assert_eq!(out, &src[400..440]);
        Ok(())
    }

    #[test]
    fn validate_rejects_garbage() {
        assert_eq!(validate(&[0u8; 4]), None);
        assert!(buffer_info(&[0u8; 4]).is_err());
    }

    #[test]
    fn compressor_names() {
        assert_eq!("zstd".parse::<Compressor>().unwrap(), Compressor::Zstd);
        assert_eq!(Compressor::BloscLz.to_string(), "blosclz");
        assert!(matches!(
            "brotli".parse::<Compressor>(),
            Err(BloscError::UnknownCodec(_))
        ));
    }

    #[test]
    fn cparams_json_shape() -> Result<(), Box<dyn std::error::Error>> {
        let cparams = Cparams::default();
        let json = serde_json::to_value(&cparams)?;
        assert_eq!(
            json,
            serde_json::json!({"clevel": 5, "shuffle": 1, "cname": "blosclz", "quantize": null})
        );
        assert_eq!(serde_json::from_value::<Cparams>(json)?, cparams);
        Ok(())
    }
}
