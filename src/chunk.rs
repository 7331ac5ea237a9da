//! The immutable compressed chunk.
//!
//! A [`Chunk`] holds one fixed-size run of rows of a single element type,
//! either as a self-describing compressed buffer or, when every element is
//! identical, as a symbolic constant. Chunks are immutable after
//! construction; mutation happens by rebuilding and replacing them in the
//! chunk store.

use bytes::Bytes;

use crate::blosc::{self, BloscContext, Cparams};
use crate::dtype::{Dtype, DtypeKind};
use crate::error::CarrayError;

#[derive(Clone, Debug)]
enum ChunkPayload {
    /// Every row equals `atom`; no compressed bytes are stored.
    Constant { atom: Vec<u8> },
    /// A self-describing compressed buffer.
    Compressed { data: Bytes },
}

/// An immutable compressed container for one run of rows.
#[derive(Clone, Debug)]
pub struct Chunk {
    dtype: Dtype,
    nrows: usize,
    nbytes: usize,
    cbytes: usize,
    blocksize: usize,
    true_count: Option<usize>,
    payload: ChunkPayload,
}

impl Chunk {
    /// Build a chunk by compressing `buf`.
    ///
    /// With `constant_detection`, an all-zero buffer is stored symbolically
    /// instead of compressed. Persistent arrays pass `false` so every on-disk
    /// chunk is a uniform compressed file.
    ///
    /// # Errors
    /// Returns [`CarrayError::TypeTooLarge`] for an oversized atom, or a
    /// codec error if compression fails.
    pub fn from_bytes(
        buf: &[u8],
        dtype: &Dtype,
        cparams: &Cparams,
        ctx: &BloscContext,
        constant_detection: bool,
    ) -> Result<Self, CarrayError> {
        debug_assert!(!dtype.is_object(), "object chunks use from_object");
        let atomsize = dtype.checked_atomsize()?;
        debug_assert_eq!(buf.len() % atomsize, 0);
        let nrows = buf.len() / atomsize;

        if constant_detection && buf.iter().all(|&b| b == 0) {
            return Ok(Self::from_constant(&vec![0u8; atomsize], nrows, dtype));
        }

        let true_count =
            (dtype.kind() == DtypeKind::Bool).then(|| buf.iter().filter(|&&b| b != 0).count());

        let quantized;
        let src = match cparams.quantize {
            Some(digits) if digits > 0 && dtype.kind() == DtypeKind::Float => {
                quantized = quantize_floats(buf, dtype.itemsize(), digits);
                quantized.as_slice()
            }
            _ => buf,
        };

        let data = ctx.compress(src, dtype.codec_typesize(), cparams)?;
        let info = blosc::buffer_info(&data)?;
        Ok(Self {
            dtype: dtype.clone(),
            nrows,
            nbytes: buf.len(),
            cbytes: data.len(),
            blocksize: info.blocksize,
            true_count,
            payload: ChunkPayload::Compressed { data: data.into() },
        })
    }

    /// Build a chunk whose every row is `atom`, storing only the scalar.
    ///
    /// This is the stride-0 input path used for broadcast fills.
    #[must_use]
    pub fn from_constant(atom: &[u8], nrows: usize, dtype: &Dtype) -> Self {
        let true_count =
            (dtype.kind() == DtypeKind::Bool).then(|| if atom[0] != 0 { nrows } else { 0 });
        Self {
            dtype: dtype.clone(),
            nrows,
            nbytes: atom.len() * nrows,
            cbytes: atom.len(),
            blocksize: atom.len(),
            true_count,
            payload: ChunkPayload::Constant {
                atom: atom.to_vec(),
            },
        }
    }

    /// Rebuild a chunk from a compressed buffer (the body of a chunk file).
    ///
    /// The uncompressed size, block size, and compressed size are read from
    /// the buffer's own header.
    ///
    /// # Errors
    /// Returns [`CarrayError::Blosc`] if the header is malformed or
    /// inconsistent with the element type.
    pub fn from_compressed(data: Bytes, dtype: &Dtype) -> Result<Self, CarrayError> {
        let info = blosc::buffer_info(&data)?;
        let atomsize = dtype.checked_atomsize()?;
        let nrows = if dtype.is_object() {
            1
        } else {
            if atomsize == 0 || info.nbytes % atomsize != 0 {
                return Err(blosc::BloscError::CorruptBuffer(format!(
                    "uncompressed size {} is not a whole number of {atomsize}-byte rows",
                    info.nbytes
                ))
                .into());
            }
            info.nbytes / atomsize
        };
        Ok(Self {
            dtype: dtype.clone(),
            nrows,
            nbytes: info.nbytes,
            cbytes: data.len(),
            blocksize: info.blocksize,
            true_count: None,
            payload: ChunkPayload::Compressed { data },
        })
    }

    /// Build a single-element chunk from a host-serialized opaque value.
    ///
    /// # Errors
    /// Returns a codec error if compression fails.
    pub fn from_object(
        bytes: &[u8],
        cparams: &Cparams,
        ctx: &BloscContext,
    ) -> Result<Self, CarrayError> {
        let dtype = Dtype::object();
        let data = ctx.compress(bytes, 1, cparams)?;
        let info = blosc::buffer_info(&data)?;
        Ok(Self {
            dtype,
            nrows: 1,
            nbytes: bytes.len(),
            cbytes: data.len(),
            blocksize: info.blocksize,
            true_count: None,
            payload: ChunkPayload::Compressed { data: data.into() },
        })
    }

    /// Rows held by this chunk.
    #[must_use]
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Uncompressed size in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Compressed size in bytes, codec header included. For a constant chunk
    /// this is the size of the stored atom.
    #[must_use]
    pub fn cbytes(&self) -> usize {
        self.cbytes
    }

    /// The codec's random-access granularity within this chunk, in bytes.
    #[must_use]
    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    /// Whether every row is the same value, stored symbolically.
    #[must_use]
    pub fn is_constant(&self) -> bool {
        matches!(self.payload, ChunkPayload::Constant { .. })
    }

    /// The constant atom, when this is a constant chunk.
    #[must_use]
    pub fn constant_atom(&self) -> Option<&[u8]> {
        match &self.payload {
            ChunkPayload::Constant { atom } => Some(atom),
            ChunkPayload::Compressed { .. } => None,
        }
    }

    /// The number of true values, cached for boolean chunks built in memory.
    #[must_use]
    pub fn true_count(&self) -> Option<usize> {
        self.true_count
    }

    /// The compressed buffer, when one is stored.
    #[must_use]
    pub fn compressed_data(&self) -> Option<&Bytes> {
        match &self.payload {
            ChunkPayload::Compressed { data } => Some(data),
            ChunkPayload::Constant { .. } => None,
        }
    }

    /// Decompress rows `[start, stop)` into `dst`.
    ///
    /// Decodes the whole buffer when the range covers the chunk, otherwise
    /// only the blocks containing the range.
    ///
    /// # Errors
    /// Returns [`CarrayError::Blosc`] on a codec failure.
    pub fn get(
        &self,
        dst: &mut [u8],
        start: usize,
        stop: usize,
        ctx: &BloscContext,
    ) -> Result<(), CarrayError> {
        debug_assert!(start <= stop && stop <= self.nrows);
        let atomsize = self.dtype.atomsize();
        debug_assert_eq!(dst.len(), (stop - start) * atomsize);
        match &self.payload {
            ChunkPayload::Constant { atom } => {
                for row in dst.chunks_exact_mut(atomsize) {
                    row.copy_from_slice(atom);
                }
            }
            ChunkPayload::Compressed { data } => {
                if start == 0 && stop == self.nrows {
                    ctx.decompress(data, dst)?;
                } else {
                    let items_per_row = atomsize / self.dtype.codec_typesize();
                    ctx.decompress_items(
                        data,
                        start * items_per_row,
                        (stop - start) * items_per_row,
                        dst,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// The full decompressed byte string of an opaque-element chunk.
    ///
    /// # Errors
    /// Returns [`CarrayError::Blosc`] on a codec failure.
    pub fn get_object(&self, ctx: &BloscContext) -> Result<Vec<u8>, CarrayError> {
        let mut out = vec![0u8; self.nbytes];
        if out.is_empty() {
            return Ok(out);
        }
        match &self.payload {
            ChunkPayload::Compressed { data } => ctx.decompress(data, &mut out)?,
            ChunkPayload::Constant { atom } => out.copy_from_slice(atom),
        }
        Ok(out)
    }
}

fn quantize_floats(buf: &[u8], itemsize: usize, digits: u32) -> Vec<u8> {
    let bits = 10f64.powi(digits as i32).log2().ceil();
    let scale = 2f64.powf(bits);
    let mut out = buf.to_vec();
    if itemsize == 4 {
        for item in out.chunks_exact_mut(4) {
            let v = f64::from(f32::from_ne_bytes([item[0], item[1], item[2], item[3]]));
            let q = (v * scale).round() / scale;
            item.copy_from_slice(&(q as f32).to_ne_bytes());
        }
    } else {
        for item in out.chunks_exact_mut(8) {
            let v = f64::from_ne_bytes(item.try_into().unwrap_or_default());
            let q = (v * scale).round() / scale;
            item.copy_from_slice(&q.to_ne_bytes());
        }
    }
    out
}
