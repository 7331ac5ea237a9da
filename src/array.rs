//! The compressed, chunked, appendable array.
//!
//! A [`Carray`] stores a homogeneous sequence of rows as an ordered run of
//! compressed [`Chunk`]s plus a mutable uncompressed *leftover* tail holding
//! the rows that have not yet filled a chunk. Appends funnel through the
//! tail; when it fills, a chunk is built (compression happens there) and
//! handed to the chunk store. Reads decode only the chunks, or blocks within
//! chunks, that intersect the request.
//!
//! Arrays are built with [`CarrayBuilder`], either in memory or persistently
//! under a root directory:
//!
//! ```text
//! <root>/
//!   data/     __0.blp, __1.blp, …   one file per chunk
//!   meta/     storage, sizes        JSON descriptors
//!   attrs/    __attrs__             user metadata
//! ```
//!
//! Persistence is crash-visible through explicit [`flush`](Carray::flush);
//! dropping an array does not flush.

mod iter;
mod reduce;
mod slice;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use derive_more::Display;

pub use self::iter::{CarrayIter, WhereIter, WheretrueIter};
pub use self::slice::MaskEvaluator;

use crate::attrs::Attrs;
use crate::blosc::{BloscContext, Cparams};
use crate::chunk::Chunk;
use crate::chunk_store::{ChunkStore, FilesystemChunkStore, MemoryChunkStore};
use crate::dtype::{Dtype, Element};
use crate::error::CarrayError;
use crate::meta::{self, SizesMeta, StorageMeta};

/// The mode an array is opened or created in.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Mode {
    /// Read-only; every mutation fails.
    #[display("r")]
    Read,
    /// Truncate on open, then read-write.
    #[display("w")]
    Write,
    /// Read-write, appending to existing contents.
    #[display("a")]
    Append,
}

/// The single-block decompressed cache backing scalar reads.
///
/// `Dirty` is set by every mutation that may invalidate cached bytes; the
/// next scalar read repopulates exactly as from `Empty`, without touching
/// size bookkeeping.
#[derive(Debug, Default)]
pub(crate) enum BlockCache {
    #[default]
    Empty,
    Valid {
        /// Absolute row of the first cached atom.
        row: usize,
        buf: Vec<u8>,
    },
    Dirty,
}

// The stepped curve of the original implementation: targets grow sub-linearly
// with the expected byte volume so per-chunk overhead stays bounded for small
// arrays while large arrays get chunks big enough to compress and stream well.
fn default_chunksize(expected_nbytes: u64) -> usize {
    const BASESIZE: usize = 64 * 1024;
    const MIB: u64 = 1024 * 1024;
    match expected_nbytes / MIB {
        0..=1 => BASESIZE,
        2..=10 => BASESIZE * 4,
        11..=100 => BASESIZE * 8,
        101..=1000 => BASESIZE * 16,
        _ => BASESIZE * 32,
    }
}

fn chunklen_from_expected(expectedlen: usize, atomsize: usize) -> usize {
    let target = default_chunksize(expectedlen as u64 * atomsize as u64);
    (target / atomsize).max(1)
}

/// A [`Carray`] builder.
///
/// All parameters are optional: the element type and length come from the
/// built data, the chunk length from the expected-length heuristic, and the
/// default value is zeros.
///
/// ```rust
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use carray::CarrayBuilder;
///
/// let a = CarrayBuilder::new()
///     .chunklen(1024)
///     .build_from_slice(&(0i64..100_000).collect::<Vec<_>>())?;
/// assert_eq!(a.len(), 100_000);
/// assert_eq!(a.get::<i64>(-1)?, 99_999);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct CarrayBuilder {
    cparams: Cparams,
    chunklen: Option<usize>,
    expectedlen: Option<usize>,
    dflt: Option<Vec<u8>>,
    rootdir: Option<PathBuf>,
    mode: Option<Mode>,
}

impl CarrayBuilder {
    /// Create a builder with default parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compression parameters.
    #[must_use]
    pub fn cparams(mut self, cparams: Cparams) -> Self {
        self.cparams = cparams;
        self
    }

    /// Fix the rows-per-chunk, bypassing the expected-length heuristic.
    #[must_use]
    pub fn chunklen(mut self, chunklen: usize) -> Self {
        self.chunklen = Some(chunklen);
        self
    }

    /// Hint the final length the array will grow to.
    #[must_use]
    pub fn expectedlen(mut self, expectedlen: usize) -> Self {
        self.expectedlen = Some(expectedlen);
        self
    }

    /// Set the default fill value used by [`Carray::resize`].
    #[must_use]
    pub fn dflt<T: Element>(self, value: T) -> Self {
        self.dflt_bytes(T::to_bytes(std::slice::from_ref(&value)).to_vec())
    }

    /// Set the default fill value from raw atom bytes.
    #[must_use]
    pub fn dflt_bytes(mut self, atom: Vec<u8>) -> Self {
        self.dflt = Some(atom);
        self
    }

    /// Persist the array under `rootdir`.
    #[must_use]
    pub fn rootdir(mut self, rootdir: impl Into<PathBuf>) -> Self {
        self.rootdir = Some(rootdir.into());
        self
    }

    /// Set the open/create mode. Defaults to [`Mode::Append`].
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Build from a slice of scalar elements.
    ///
    /// # Errors
    /// Returns [`CarrayError`] on invalid parameters, an existing root
    /// directory, or a compression/storage failure.
    pub fn build_from_slice<T: Element>(self, data: &[T]) -> Result<Carray, CarrayError> {
        self.build_from_bytes(T::dtype(), T::to_bytes(data))
    }

    /// Build an empty array of element type `T`.
    ///
    /// # Errors
    /// As [`build_from_slice`](Self::build_from_slice).
    pub fn build_empty<T: Element>(self) -> Result<Carray, CarrayError> {
        self.build_from_bytes(T::dtype(), &[])
    }

    /// Build an empty array with an explicit element type.
    ///
    /// # Errors
    /// As [`build_from_slice`](Self::build_from_slice).
    pub fn build_empty_dtype(self, dtype: Dtype) -> Result<Carray, CarrayError> {
        self.build_from_bytes(dtype, &[])
    }

    /// Build from raw bytes of the given element type.
    ///
    /// This is the entry point for byte-string, UCS-4, and opaque-record
    /// element types; `data` must be a whole number of atoms.
    ///
    /// # Errors
    /// As [`build_from_slice`](Self::build_from_slice), plus
    /// [`CarrayError::InvalidArgument`] for a ragged byte length.
    pub fn build_from_bytes(self, dtype: Dtype, data: &[u8]) -> Result<Carray, CarrayError> {
        let mode = self.mode.unwrap_or(Mode::Append);
        if mode == Mode::Read {
            return Err(CarrayError::InvalidArgument(
                "cannot create an array in read-only mode".to_string(),
            ));
        }
        if let Some(quantize) = self.cparams.quantize {
            if quantize > 0 && dtype.kind() != crate::dtype::DtypeKind::Float {
                return Err(CarrayError::InvalidArgument(
                    "quantization requires a float element type".to_string(),
                ));
            }
        }

        if dtype.is_object() {
            if !data.is_empty() {
                return Err(CarrayError::NotSupported(
                    "object arrays are built empty and filled with append_object".to_string(),
                ));
            }
            return self.build_object(mode);
        }

        let atomsize = dtype.checked_atomsize()?;
        if data.len() % atomsize != 0 {
            return Err(CarrayError::InvalidArgument(format!(
                "{} bytes is not a whole number of {atomsize}-byte atoms",
                data.len()
            )));
        }
        let nrows = data.len() / atomsize;

        if let Some(chunklen) = self.chunklen {
            if chunklen < 1 {
                return Err(CarrayError::InvalidArgument(
                    "chunklen must be at least 1".to_string(),
                ));
            }
        }
        let expectedlen = self.expectedlen.unwrap_or(nrows);
        let chunklen = self
            .chunklen
            .unwrap_or_else(|| chunklen_from_expected(expectedlen, atomsize));

        let dflt = match self.dflt {
            Some(atom) => {
                if atom.len() != atomsize {
                    return Err(CarrayError::InvalidArgument(format!(
                        "default value of {} bytes does not match atom size {atomsize}",
                        atom.len()
                    )));
                }
                atom
            }
            None => vec![0u8; atomsize],
        };

        let (chunks, attrs): (ChunkStore, Attrs) = match &self.rootdir {
            Some(rootdir) => {
                prepare_rootdir(rootdir, mode)?;
                let store =
                    FilesystemChunkStore::create(rootdir.join(meta::DATA_DIR), dtype.clone(), mode)?;
                std::fs::create_dir_all(rootdir.join(meta::META_DIR))?;
                let storage = StorageMeta {
                    dtype: dtype.to_string(),
                    cparams: self.cparams.clone(),
                    chunklen,
                    expectedlen,
                    dflt: dtype.atom_to_json(&dflt),
                };
                meta::write_json(&meta::meta_path(rootdir, meta::STORAGE_FILE), &storage)?;
                (Arc::new(store), Attrs::create(rootdir, mode)?)
            }
            None => (Arc::new(MemoryChunkStore::new()), Attrs::new_memory()),
        };

        let mut array = Carray {
            dtype,
            len: 0,
            chunklen,
            cparams: self.cparams,
            dflt,
            expectedlen,
            chunks,
            leftover: vec![0u8; chunklen * atomsize],
            leftover_rows: 0,
            chunks_cbytes: 0,
            block_cache: Mutex::new(BlockCache::Empty),
            mode,
            rootdir: self.rootdir,
            attrs,
            ctx: BloscContext::acquire(),
        };
        array.append_bytes(data)?;
        if array.rootdir.is_some() {
            array.flush()?;
        }
        Ok(array)
    }

    fn build_object(self, mode: Mode) -> Result<Carray, CarrayError> {
        let dtype = Dtype::object();
        let (chunks, attrs): (ChunkStore, Attrs) = match &self.rootdir {
            Some(rootdir) => {
                prepare_rootdir(rootdir, mode)?;
                let store =
                    FilesystemChunkStore::create(rootdir.join(meta::DATA_DIR), dtype.clone(), mode)?;
                std::fs::create_dir_all(rootdir.join(meta::META_DIR))?;
                let storage = StorageMeta {
                    dtype: dtype.to_string(),
                    cparams: self.cparams.clone(),
                    chunklen: 1,
                    expectedlen: self.expectedlen.unwrap_or(0),
                    dflt: serde_json::Value::Null,
                };
                meta::write_json(&meta::meta_path(rootdir, meta::STORAGE_FILE), &storage)?;
                (Arc::new(store), Attrs::create(rootdir, mode)?)
            }
            None => (Arc::new(MemoryChunkStore::new()), Attrs::new_memory()),
        };
        let mut array = Carray {
            dtype,
            len: 0,
            chunklen: 1,
            cparams: self.cparams,
            dflt: Vec::new(),
            expectedlen: self.expectedlen.unwrap_or(0),
            chunks,
            leftover: Vec::new(),
            leftover_rows: 0,
            chunks_cbytes: 0,
            block_cache: Mutex::new(BlockCache::Empty),
            mode,
            rootdir: self.rootdir,
            attrs,
            ctx: BloscContext::acquire(),
        };
        if array.rootdir.is_some() {
            array.flush()?;
        }
        Ok(array)
    }
}

fn prepare_rootdir(rootdir: &Path, mode: Mode) -> Result<(), CarrayError> {
    if rootdir.exists() {
        if mode != Mode::Write {
            return Err(CarrayError::RootExists(rootdir.to_path_buf()));
        }
        std::fs::remove_dir_all(rootdir)?;
    }
    std::fs::create_dir_all(rootdir)?;
    Ok(())
}

/// A chunked, compressed, appendable array of a single element type.
///
/// See the [module docs](self) for the storage model. Most entry points come
/// in a typed flavour generic over [`Element`] and a raw-bytes flavour for
/// the string and opaque-record element types.
#[derive(Debug)]
pub struct Carray {
    dtype: Dtype,
    len: usize,
    chunklen: usize,
    cparams: Cparams,
    dflt: Vec<u8>,
    expectedlen: usize,
    chunks: ChunkStore,
    leftover: Vec<u8>,
    leftover_rows: usize,
    /// Sum of the held chunks' compressed sizes.
    chunks_cbytes: usize,
    block_cache: Mutex<BlockCache>,
    mode: Mode,
    rootdir: Option<PathBuf>,
    attrs: Attrs,
    ctx: BloscContext,
}

impl Carray {
    /// Build an in-memory array from a slice with default parameters.
    ///
    /// # Errors
    /// Returns [`CarrayError`] on a compression failure.
    pub fn from_slice<T: Element>(data: &[T]) -> Result<Self, CarrayError> {
        CarrayBuilder::new().build_from_slice(data)
    }

    /// Open a persistent array in [`Mode::Append`].
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] for a missing or malformed root.
    pub fn open(rootdir: impl Into<PathBuf>) -> Result<Self, CarrayError> {
        Self::open_mode(rootdir, Mode::Append)
    }

    /// Open a persistent array.
    ///
    /// [`Mode::Write`] truncates the array to zero length on open.
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] for a missing or malformed root.
    pub fn open_mode(rootdir: impl Into<PathBuf>, mode: Mode) -> Result<Self, CarrayError> {
        let rootdir = rootdir.into();
        let storage: StorageMeta = meta::read_json(&meta::meta_path(&rootdir, meta::STORAGE_FILE))?;
        let sizes: SizesMeta = meta::read_json(&meta::meta_path(&rootdir, meta::SIZES_FILE))?;

        let dtype = Dtype::parse(&storage.dtype)?;
        let atomsize = dtype.checked_atomsize()?;
        if storage.chunklen < 1 {
            return Err(CarrayError::InvalidArgument(
                "persisted chunklen must be at least 1".to_string(),
            ));
        }
        let len = sizes.shape.first().copied().unwrap_or(0) as usize;
        let trailing: Vec<usize> = sizes
            .shape
            .get(1..)
            .unwrap_or(&[])
            .iter()
            .map(|&d| d as usize)
            .collect();
        if trailing != dtype.shape() {
            return Err(CarrayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "persisted shape disagrees with the element type",
            )));
        }

        let chunklen = if dtype.is_object() { 1 } else { storage.chunklen };
        let (nchunks, leftover_rows) = if dtype.is_object() {
            (len, 0)
        } else {
            (len / chunklen, len % chunklen)
        };
        let store = FilesystemChunkStore::open(
            rootdir.join(meta::DATA_DIR),
            dtype.clone(),
            mode,
            nchunks,
        )?;

        let mut leftover = vec![0u8; chunklen * atomsize];
        if leftover_rows > 0 {
            // A non-chunk-aligned length means a tail was flushed one slot
            // past the packed chunks.
            let tail = store.read_chunk_file(nchunks)?;
            tail.get(
                &mut leftover[..leftover_rows * atomsize],
                0,
                leftover_rows,
                &BloscContext::acquire(),
            )?;
        }

        let dflt = dtype.atom_from_json(&storage.dflt)?;
        let chunksize = chunklen * atomsize;
        let mut array = Self {
            dtype,
            len,
            chunklen,
            cparams: storage.cparams,
            dflt,
            expectedlen: storage.expectedlen,
            chunks: Arc::new(store),
            leftover,
            leftover_rows,
            chunks_cbytes: (sizes.cbytes as usize).saturating_sub(chunksize),
            block_cache: Mutex::new(BlockCache::Empty),
            mode,
            rootdir: Some(rootdir.clone()),
            attrs: Attrs::open(&rootdir, mode)?,
            ctx: BloscContext::acquire(),
        };
        if mode == Mode::Write {
            array.resize(0)?;
            array.flush()?;
        }
        Ok(array)
    }

    /// The number of logical rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The logical shape: the length followed by the atom dimensions.
    #[must_use]
    pub fn shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(1 + self.dtype.shape().len());
        shape.push(self.len);
        shape.extend_from_slice(self.dtype.shape());
        shape
    }

    /// The element type.
    #[must_use]
    pub fn dtype(&self) -> &Dtype {
        &self.dtype
    }

    /// Rows per full chunk.
    #[must_use]
    pub fn chunklen(&self) -> usize {
        self.chunklen
    }

    /// The compression parameters.
    #[must_use]
    pub fn cparams(&self) -> &Cparams {
        &self.cparams
    }

    /// The default fill value, as atom bytes.
    #[must_use]
    pub fn dflt(&self) -> &[u8] {
        &self.dflt
    }

    /// The expected length the chunk length was derived from.
    #[must_use]
    pub fn expectedlen(&self) -> usize {
        self.expectedlen
    }

    /// The open mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The persistence root, if any.
    #[must_use]
    pub fn rootdir(&self) -> Option<&Path> {
        self.rootdir.as_deref()
    }

    /// The number of full chunks currently held.
    #[must_use]
    pub fn nchunks(&self) -> usize {
        self.chunks.len()
    }

    /// Rows sitting in the uncompressed tail.
    #[must_use]
    pub fn leftover_rows(&self) -> usize {
        self.leftover_rows
    }

    /// Borrow chunk `nchunk` for introspection.
    ///
    /// # Errors
    /// Returns [`CarrayError::OutOfRange`] past the held chunks, or an I/O
    /// error reading a persistent chunk.
    pub fn chunk(&self, nchunk: usize) -> Result<Arc<Chunk>, CarrayError> {
        self.chunks.get(nchunk)
    }

    /// The logical uncompressed size in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.len * self.atomsize()
    }

    /// The compressed size in bytes, with the tail accounted at capacity.
    #[must_use]
    pub fn cbytes(&self) -> usize {
        self.chunks_cbytes + self.chunksize()
    }

    /// The attribute bag.
    #[must_use]
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// The attribute bag, mutably.
    pub fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.attrs
    }

    pub(crate) fn atomsize(&self) -> usize {
        self.dtype.atomsize()
    }

    pub(crate) fn chunksize(&self) -> usize {
        self.chunklen * self.atomsize()
    }

    pub(crate) fn context(&self) -> &BloscContext {
        &self.ctx
    }

    fn check_writable(&self) -> Result<(), CarrayError> {
        if self.mode == Mode::Read {
            return Err(CarrayError::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn check_element<T: Element>(&self) -> Result<(), CarrayError> {
        let dt = T::dtype();
        if dt.kind() != self.dtype.kind() || dt.itemsize() != self.dtype.itemsize() {
            return Err(CarrayError::TypeMismatch {
                expected: self.dtype.clone(),
                actual: dt,
            });
        }
        Ok(())
    }

    /// Wrap a possibly-negative index once from the end.
    pub(crate) fn wrap_index(&self, index: isize) -> Result<usize, CarrayError> {
        let wrapped = if index < 0 {
            index + self.len as isize
        } else {
            index
        };
        if wrapped < 0 || wrapped as usize >= self.len {
            return Err(CarrayError::OutOfRange {
                index: index as i64,
                len: self.len,
            });
        }
        Ok(wrapped as usize)
    }

    fn build_chunk(&self, buf: &[u8]) -> Result<Chunk, CarrayError> {
        Chunk::from_bytes(
            buf,
            &self.dtype,
            &self.cparams,
            &self.ctx,
            // Disk-backed chunks never detect constants, keeping the on-disk
            // format uniform.
            self.rootdir.is_none(),
        )
    }

    pub(crate) fn mark_cache_dirty(&self) {
        *self
            .block_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = BlockCache::Dirty;
    }

    /// Append rows of scalar elements.
    ///
    /// For multidimensional atoms `data` is the flattened scalars and must be
    /// a whole number of atoms.
    ///
    /// # Errors
    /// Returns [`CarrayError::ReadOnly`] on a read-only array,
    /// [`CarrayError::TypeMismatch`] for an incompatible element type, or a
    /// compression/storage failure.
    pub fn append<T: Element>(&mut self, data: &[T]) -> Result<(), CarrayError> {
        self.check_element::<T>()?;
        self.append_bytes(T::to_bytes(data))
    }

    /// Append rows given as raw atom bytes.
    ///
    /// # Errors
    /// As [`append`](Self::append), with [`CarrayError::InvalidArgument`] for
    /// a ragged byte length.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), CarrayError> {
        self.check_writable()?;
        if self.dtype.is_object() {
            return Err(CarrayError::NotSupported(
                "object arrays append with append_object".to_string(),
            ));
        }
        let atomsize = self.atomsize();
        if data.len() % atomsize != 0 {
            return Err(CarrayError::InvalidArgument(format!(
                "{} bytes is not a whole number of {atomsize}-byte atoms",
                data.len()
            )));
        }
        let nrows = data.len() / atomsize;
        if nrows == 0 {
            return Ok(());
        }

        let chunksize = self.chunksize();
        let leftover_bytes = self.leftover_rows * atomsize;
        if leftover_bytes + data.len() < chunksize {
            self.leftover[leftover_bytes..leftover_bytes + data.len()].copy_from_slice(data);
            self.leftover_rows += nrows;
        } else {
            // Fill the tail to capacity and promote it to a chunk.
            let fill = chunksize - leftover_bytes;
            self.leftover[leftover_bytes..].copy_from_slice(&data[..fill]);
            let chunk = self.build_chunk(&self.leftover)?;
            self.chunks_cbytes += chunk.cbytes();
            self.chunks.append(chunk)?;

            let mut rest = &data[fill..];
            while rest.len() >= chunksize {
                let chunk = self.build_chunk(&rest[..chunksize])?;
                self.chunks_cbytes += chunk.cbytes();
                self.chunks.append(chunk)?;
                rest = &rest[chunksize..];
            }
            self.leftover[..rest.len()].copy_from_slice(rest);
            self.leftover_rows = rest.len() / atomsize;
        }
        debug_assert!(self.leftover_rows < self.chunklen);
        self.len += nrows;
        Ok(())
    }

    /// Append `nrows` copies of one atom, storing full runs symbolically when
    /// the array is in memory.
    fn append_repeated(&mut self, atom: &[u8], nrows: usize) -> Result<(), CarrayError> {
        let mut remaining = nrows;
        let mut scratch = Vec::new();
        while remaining > 0 {
            if self.leftover_rows == 0 && remaining >= self.chunklen && self.rootdir.is_none() {
                let chunk = Chunk::from_constant(atom, self.chunklen, &self.dtype);
                self.chunks_cbytes += chunk.cbytes();
                self.chunks.append(chunk)?;
                self.len += self.chunklen;
                remaining -= self.chunklen;
            } else {
                let take = remaining.min(self.chunklen - self.leftover_rows);
                scratch.clear();
                for _ in 0..take {
                    scratch.extend_from_slice(atom);
                }
                self.append_bytes(&scratch)?;
                remaining -= take;
            }
        }
        Ok(())
    }

    /// Remove `nrows` rows from the end.
    ///
    /// # Errors
    /// Returns [`CarrayError::OutOfRange`] if `nrows` exceeds the length,
    /// [`CarrayError::ReadOnly`] on a read-only array, or a storage failure.
    pub fn trim(&mut self, nrows: usize) -> Result<(), CarrayError> {
        self.check_writable()?;
        if nrows > self.len {
            return Err(CarrayError::OutOfRange {
                index: nrows as i64,
                len: self.len,
            });
        }
        if nrows == 0 {
            return Ok(());
        }

        if self.dtype.is_object() {
            for _ in 0..nrows {
                let popped = self.chunks.pop()?;
                self.chunks_cbytes -= popped.cbytes();
            }
        } else if nrows <= self.leftover_rows {
            self.leftover_rows -= nrows;
        } else {
            let new_len = self.len - nrows;
            let target_nchunks = new_len / self.chunklen;
            let new_leftover = new_len % self.chunklen;

            let mut last = self.chunks.pop()?;
            self.chunks_cbytes -= last.cbytes();
            while self.chunks.len() > target_nchunks {
                last = self.chunks.pop()?;
                self.chunks_cbytes -= last.cbytes();
            }
            if new_leftover > 0 {
                let atomsize = self.atomsize();
                last.get(
                    &mut self.leftover[..new_leftover * atomsize],
                    0,
                    new_leftover,
                    &self.ctx,
                )?;
            }
            self.leftover_rows = new_leftover;
        }

        self.len -= nrows;
        self.mark_cache_dirty();
        if self.rootdir.is_some() {
            self.flush()?;
        }
        Ok(())
    }

    /// Grow with the default value or shrink by trimming.
    ///
    /// # Errors
    /// As [`trim`](Self::trim) and [`append`](Self::append).
    pub fn resize(&mut self, nrows: usize) -> Result<(), CarrayError> {
        self.check_writable()?;
        if nrows == self.len {
            Ok(())
        } else if nrows > self.len {
            let dflt = self.dflt.clone();
            self.append_repeated(&dflt, nrows - self.len)
        } else {
            self.trim(self.len - nrows)
        }
    }

    /// Return a copy with a new shape holding the same scalars.
    ///
    /// At most one dimension may be `-1`, which is inferred from the total
    /// element count. A persistent array is rebuilt in a sibling temporary
    /// directory which then replaces the original root.
    ///
    /// # Errors
    /// Returns [`CarrayError::InvalidArgument`] for an incompatible shape or
    /// more than one `-1`, [`CarrayError::NotSupported`] for object arrays,
    /// [`CarrayError::ReadOnly`] on a read-only array.
    pub fn reshape(&self, shape: &[isize]) -> Result<Self, CarrayError> {
        self.check_writable()?;
        if self.dtype.is_object() {
            return Err(CarrayError::NotSupported(
                "object arrays cannot be reshaped".to_string(),
            ));
        }
        let total = self.len * self.dtype.items_per_atom();

        let inferred = shape.iter().filter(|&&d| d == -1).count();
        if inferred > 1 {
            return Err(CarrayError::InvalidArgument(
                "at most one dimension can be -1".to_string(),
            ));
        }
        if shape.iter().any(|&d| d < -1 || d == 0) {
            return Err(CarrayError::InvalidArgument(format!(
                "invalid target shape {shape:?}"
            )));
        }
        let known: usize = shape
            .iter()
            .filter(|&&d| d > 0)
            .map(|&d| d as usize)
            .product();
        let resolved: Vec<usize> = if inferred == 1 {
            if known == 0 || total % known != 0 {
                return Err(CarrayError::InvalidArgument(format!(
                    "cannot infer a dimension of {total} elements into {shape:?}"
                )));
            }
            shape
                .iter()
                .map(|&d| if d == -1 { total / known } else { d as usize })
                .collect()
        } else {
            if known != total {
                return Err(CarrayError::InvalidArgument(format!(
                    "cannot reshape {total} elements into {shape:?}"
                )));
            }
            shape.iter().map(|&d| d as usize).collect()
        };

        let new_dtype = Dtype::new(self.dtype.kind(), self.dtype.itemsize())?
            .with_shape(&resolved[1..])?;
        let dflt = if new_dtype.shape() == self.dtype.shape() {
            self.dflt.clone()
        } else {
            vec![0u8; new_dtype.atomsize()]
        };

        // All reshapes go through the flat byte sequence.
        let mut data = Vec::new();
        self.read_slice_bytes(0, self.len, 1, &mut data)?;

        match &self.rootdir {
            Some(rootdir) => {
                let tmpdir = rootdir.with_extension("reshape-tmp");
                let built = CarrayBuilder::new()
                    .cparams(self.cparams.clone())
                    .chunklen(self.chunklen)
                    .expectedlen(self.expectedlen)
                    .dflt_bytes(dflt)
                    .rootdir(&tmpdir)
                    .mode(Mode::Write)
                    .build_from_bytes(new_dtype, &data)?;
                drop(built);
                self.chunks.free_cache();
                // Swap by renames so a failure at any point leaves either the
                // original or the fully-built replacement at the root, never
                // neither. The old root is only deleted once the swap holds.
                let backup = rootdir.with_extension("reshape-old");
                std::fs::rename(rootdir, &backup)?;
                std::fs::rename(&tmpdir, rootdir)?;
                std::fs::remove_dir_all(&backup)?;
                // Truncation is an open-time behavior; reopening the rebuilt
                // root in write mode would empty it again.
                let mode = match self.mode {
                    Mode::Write => Mode::Append,
                    mode => mode,
                };
                Self::open_mode(rootdir, mode)
            }
            None => CarrayBuilder::new()
                .cparams(self.cparams.clone())
                .chunklen(self.chunklen)
                .expectedlen(self.expectedlen)
                .dflt_bytes(dflt)
                .build_from_bytes(new_dtype, &data),
        }
    }

    /// Read one scalar element.
    ///
    /// Negative indices wrap once from the end. Reads go through the
    /// single-block cache, so sequential probes into the same block decode it
    /// once.
    ///
    /// # Errors
    /// Returns [`CarrayError::OutOfRange`] or [`CarrayError::TypeMismatch`],
    /// or a decode failure.
    pub fn get<T: Element>(&self, index: isize) -> Result<T, CarrayError> {
        self.check_element::<T>()?;
        if self.dtype.items_per_atom() != 1 {
            return Err(CarrayError::NotSupported(
                "scalar reads of multidimensional atoms use get_bytes".to_string(),
            ));
        }
        let row = self.wrap_index(index)?;
        let mut atom = vec![0u8; self.atomsize()];
        self.read_atom_into(row, &mut atom)?;
        Ok(T::from_atom(&atom))
    }

    /// Read one atom as raw bytes.
    ///
    /// # Errors
    /// As [`get`](Self::get).
    pub fn get_bytes(&self, index: isize) -> Result<Vec<u8>, CarrayError> {
        let row = self.wrap_index(index)?;
        let mut atom = vec![0u8; self.atomsize()];
        self.read_atom_into(row, &mut atom)?;
        Ok(atom)
    }

    /// Copy the atom at absolute `row` into `out`, consulting the block
    /// cache.
    pub(crate) fn read_atom_into(&self, row: usize, out: &mut [u8]) -> Result<(), CarrayError> {
        if self.dtype.is_object() {
            return Err(CarrayError::NotSupported(
                "object arrays read with get_object".to_string(),
            ));
        }
        let atomsize = self.atomsize();
        let nchunk = row / self.chunklen;
        let off = row % self.chunklen;

        if nchunk == self.chunks.len() {
            let start = off * atomsize;
            out.copy_from_slice(&self.leftover[start..start + atomsize]);
            return Ok(());
        }

        let chunk = self.chunks.get(nchunk)?;
        if let Some(atom) = chunk.constant_atom() {
            out.copy_from_slice(atom);
            return Ok(());
        }

        let blocksize = chunk.blocksize();
        if atomsize > blocksize {
            // The cache cannot hold a single row; fall back to a length-1
            // slice read.
            log::debug!(
                "atom size {atomsize} exceeds block size {blocksize}; bypassing the block cache"
            );
            let mut tmp = Vec::new();
            self.read_slice_bytes(row, row + 1, 1, &mut tmp)?;
            out.copy_from_slice(&tmp);
            return Ok(());
        }

        let blocklen = (blocksize / atomsize).max(1);
        let block_start = (off / blocklen) * blocklen;
        let cache_row = nchunk * self.chunklen + block_start;

        let mut cache = self
            .block_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let BlockCache::Valid { row: cached, buf } = &*cache {
            if *cached == cache_row {
                let start = (off - block_start) * atomsize;
                out.copy_from_slice(&buf[start..start + atomsize]);
                return Ok(());
            }
        }

        let block_rows = blocklen.min(chunk.nrows() - block_start);
        let mut buf = vec![0u8; block_rows * atomsize];
        chunk.get(&mut buf, block_start, block_start + block_rows, &self.ctx)?;
        let start = (off - block_start) * atomsize;
        out.copy_from_slice(&buf[start..start + atomsize]);
        *cache = BlockCache::Valid {
            row: cache_row,
            buf,
        };
        Ok(())
    }

    /// Overwrite one scalar element.
    ///
    /// # Errors
    /// As [`get`](Self::get), plus [`CarrayError::ReadOnly`].
    pub fn set<T: Element>(&mut self, index: isize, value: T) -> Result<(), CarrayError> {
        self.check_element::<T>()?;
        if self.dtype.items_per_atom() != 1 {
            return Err(CarrayError::NotSupported(
                "scalar writes of multidimensional atoms use set_bytes".to_string(),
            ));
        }
        let row = self.wrap_index(index)?;
        let bytes = T::to_bytes(std::slice::from_ref(&value)).to_vec();
        self.set_slice_bytes(row, row + 1, 1, &bytes)
    }

    /// Overwrite one atom with raw bytes.
    ///
    /// # Errors
    /// As [`set`](Self::set).
    pub fn set_bytes(&mut self, index: isize, atom: &[u8]) -> Result<(), CarrayError> {
        if atom.len() != self.atomsize() {
            return Err(CarrayError::InvalidArgument(format!(
                "atom of {} bytes does not match atom size {}",
                atom.len(),
                self.atomsize()
            )));
        }
        let row = self.wrap_index(index)?;
        self.set_slice_bytes(row, row + 1, 1, atom)
    }

    /// Read the elements at `indices`, in order.
    ///
    /// # Errors
    /// As [`get`](Self::get).
    pub fn get_indices<T: Element>(&self, indices: &[isize]) -> Result<Vec<T>, CarrayError> {
        self.check_element::<T>()?;
        let mut out = Vec::with_capacity(indices.len() * self.dtype.items_per_atom());
        let mut atom = vec![0u8; self.atomsize()];
        for &index in indices {
            let row = self.wrap_index(index)?;
            self.read_atom_into(row, &mut atom)?;
            out.extend(T::from_bytes(&atom));
        }
        Ok(out)
    }

    /// Overwrite the elements at `indices` with the matching rows of
    /// `values`.
    ///
    /// # Errors
    /// As [`set`](Self::set), plus [`CarrayError::InvalidArgument`] when the
    /// value count disagrees.
    pub fn set_indices<T: Element>(
        &mut self,
        indices: &[isize],
        values: &[T],
    ) -> Result<(), CarrayError> {
        self.check_element::<T>()?;
        let per_atom = self.dtype.items_per_atom();
        if values.len() != indices.len() * per_atom {
            return Err(CarrayError::InvalidArgument(format!(
                "{} values for {} indices",
                values.len(),
                indices.len()
            )));
        }
        let atomsize = self.atomsize();
        for (&index, atom) in indices.iter().zip(T::to_bytes(values).chunks_exact(atomsize)) {
            let row = self.wrap_index(index)?;
            self.set_slice_bytes(row, row + 1, 1, atom)?;
        }
        Ok(())
    }

    /// Append one opaque value, pre-serialized by the host.
    ///
    /// Each value becomes its own single-element chunk; object arrays have no
    /// uncompressed tail.
    ///
    /// # Errors
    /// Returns [`CarrayError::NotSupported`] on a non-object array, else as
    /// [`append`](Self::append).
    pub fn append_object(&mut self, bytes: &[u8]) -> Result<(), CarrayError> {
        self.check_writable()?;
        if !self.dtype.is_object() {
            return Err(CarrayError::NotSupported(
                "append_object requires an object array".to_string(),
            ));
        }
        let chunk = Chunk::from_object(bytes, &self.cparams, &self.ctx)?;
        self.chunks_cbytes += chunk.cbytes();
        self.chunks.append(chunk)?;
        self.len += 1;
        Ok(())
    }

    /// Read back one opaque value's serialized bytes.
    ///
    /// # Errors
    /// As [`append_object`](Self::append_object).
    pub fn get_object(&self, index: isize) -> Result<Vec<u8>, CarrayError> {
        if !self.dtype.is_object() {
            return Err(CarrayError::NotSupported(
                "get_object requires an object array".to_string(),
            ));
        }
        let row = self.wrap_index(index)?;
        self.chunks.get(row)?.get_object(&self.ctx)
    }

    /// A new array sharing this one's chunk store.
    ///
    /// The view copies the tail buffer at view time and owns its own block
    /// cache and attribute bag. Writing through concurrent views of one store
    /// is not defined.
    #[must_use]
    pub fn view(&self) -> Self {
        Self {
            dtype: self.dtype.clone(),
            len: self.len,
            chunklen: self.chunklen,
            cparams: self.cparams.clone(),
            dflt: self.dflt.clone(),
            expectedlen: self.expectedlen,
            chunks: Arc::clone(&self.chunks),
            leftover: self.leftover.clone(),
            leftover_rows: self.leftover_rows,
            chunks_cbytes: self.chunks_cbytes,
            block_cache: Mutex::new(BlockCache::Empty),
            mode: self.mode,
            rootdir: self.rootdir.clone(),
            attrs: self.attrs.detached(),
            ctx: self.ctx.clone(),
        }
    }

    /// A deep in-memory copy preserving parameters.
    ///
    /// # Errors
    /// Returns a decode or compression failure.
    pub fn copy(&self) -> Result<Self, CarrayError> {
        if self.dtype.is_object() {
            let mut out = CarrayBuilder::new()
                .cparams(self.cparams.clone())
                .build_from_bytes(Dtype::object(), &[])?;
            for i in 0..self.len {
                out.append_object(&self.get_object(i as isize)?)?;
            }
            return Ok(out);
        }
        let mut data = Vec::new();
        self.read_slice_bytes(0, self.len, 1, &mut data)?;
        CarrayBuilder::new()
            .cparams(self.cparams.clone())
            .chunklen(self.chunklen)
            .expectedlen(self.expectedlen)
            .dflt_bytes(self.dflt.clone())
            .build_from_bytes(self.dtype.clone(), &data)
    }

    /// Persist the tail and the size descriptor.
    ///
    /// A no-op for in-memory arrays. Flushing is explicit; dropping the array
    /// does not flush.
    ///
    /// # Errors
    /// Returns [`CarrayError::ReadOnly`] in read-only mode, or a
    /// storage failure.
    pub fn flush(&mut self) -> Result<(), CarrayError> {
        let Some(rootdir) = self.rootdir.clone() else {
            return Ok(());
        };
        self.check_writable()?;
        if self.leftover_rows > 0 && !self.dtype.is_object() {
            let atomsize = self.atomsize();
            let tail = Chunk::from_bytes(
                &self.leftover[..self.leftover_rows * atomsize],
                &self.dtype,
                &self.cparams,
                &self.ctx,
                false,
            )?;
            self.chunks.flush_tail(&tail)?;
        }
        let sizes = SizesMeta {
            shape: self.shape().iter().map(|&d| d as u64).collect(),
            nbytes: self.nbytes() as u64,
            cbytes: self.cbytes() as u64,
        };
        meta::write_json(&meta::meta_path(&rootdir, meta::SIZES_FILE), &sizes)
    }

    /// Release decompressed buffers without touching the array contents.
    pub fn free_cache(&self) {
        *self
            .block_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = BlockCache::Empty;
        self.chunks.free_cache();
    }

    /// Delete the root directory, detaching the array from persistence.
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] if the directory cannot be removed.
    pub fn purge(&mut self) -> Result<(), CarrayError> {
        if let Some(rootdir) = self.rootdir.take() {
            self.chunks.free_cache();
            std::fs::remove_dir_all(&rootdir)?;
            log::debug!("purged array root {}", rootdir.display());
        }
        Ok(())
    }
}
