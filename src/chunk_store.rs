//! Chunk storage.
//!
//! A chunk store is an ordered sequence of [`Chunk`]s behind the object-safe
//! [`ChunkStoreTraits`] capability set. Two implementations share the
//! contract: [`MemoryChunkStore`] (a vector) and [`FilesystemChunkStore`]
//! (one file per chunk under a `data/` directory, with a single-slot
//! most-recently-read cache).
//!
//! Methods take `&self` with interior mutability so a store can be shared
//! between an array and its views; stores capture their open mode at
//! construction and reject mutation when read-only.

mod disk;
mod memory;

use std::sync::Arc;

pub use disk::FilesystemChunkStore;
pub use memory::MemoryChunkStore;

use crate::chunk::Chunk;
use crate::error::CarrayError;

/// [`Arc`] wrapped chunk store.
pub type ChunkStore = Arc<dyn ChunkStoreTraits>;

/// The chunk store capability set.
pub trait ChunkStoreTraits: Send + Sync + std::fmt::Debug {
    /// The number of chunks held.
    fn len(&self) -> usize;

    /// Whether the store holds no chunks.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrow chunk `i`.
    ///
    /// # Errors
    /// Returns [`CarrayError::OutOfRange`] if `i` is not a held chunk, or an
    /// I/O / codec error reading a persistent chunk.
    fn get(&self, i: usize) -> Result<Arc<Chunk>, CarrayError>;

    /// Append a chunk.
    ///
    /// # Errors
    /// Returns [`CarrayError::ReadOnly`] on a read-only store, or an I/O
    /// error writing a persistent chunk.
    fn append(&self, chunk: Chunk) -> Result<(), CarrayError>;

    /// Replace chunk `i`, returning the replaced chunk's compressed size.
    ///
    /// # Errors
    /// As [`append`](Self::append), plus [`CarrayError::OutOfRange`].
    fn set(&self, i: usize, chunk: Chunk) -> Result<usize, CarrayError>;

    /// Remove and return the last chunk.
    ///
    /// # Errors
    /// As [`append`](Self::append), plus [`CarrayError::OutOfRange`] on an
    /// empty store.
    fn pop(&self) -> Result<Arc<Chunk>, CarrayError>;

    /// Persist the uncompacted tail without growing the store.
    ///
    /// A no-op for in-memory stores.
    ///
    /// # Errors
    /// As [`append`](Self::append).
    fn flush_tail(&self, chunk: &Chunk) -> Result<(), CarrayError>;

    /// Drop any decompressed or recently-read cache state.
    fn free_cache(&self) {}
}

/// Length of the pack header preceding the codec buffer in a chunk file.
pub const PACK_HEADER_LEN: usize = 16;

const PACK_MAGIC: [u8; 4] = *b"blpk";
const PACK_FORMAT_VERSION: u8 = 1;

/// The 16-byte header of a `.blp` chunk file.
///
/// Layout (little-endian): magic `blpk`, one format version byte, three
/// reserved zero bytes, then a signed 64-bit chunk count. An unknown count is
/// stored as `-1` and skips validation on decode; files written by this crate
/// always carry `1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PackHeader {
    nchunks: i64,
}

impl PackHeader {
    /// A header recording `nchunks` packed chunks, or an unknown count.
    #[must_use]
    pub fn new(nchunks: Option<i64>) -> Self {
        Self {
            nchunks: nchunks.unwrap_or(-1),
        }
    }

    /// The recorded chunk count; [`None`] when unknown.
    #[must_use]
    pub fn nchunks(&self) -> Option<i64> {
        (self.nchunks >= 0).then_some(self.nchunks)
    }

    /// Encode to the on-disk form.
    #[must_use]
    pub fn encode(&self) -> [u8; PACK_HEADER_LEN] {
        let mut header = [0u8; PACK_HEADER_LEN];
        header[..4].copy_from_slice(&PACK_MAGIC);
        header[4] = PACK_FORMAT_VERSION;
        header[8..].copy_from_slice(&self.nchunks.to_le_bytes());
        header
    }

    /// Decode from the on-disk form.
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] for a short buffer, wrong magic, or an
    /// unsupported format version.
    pub fn decode(bytes: &[u8]) -> Result<Self, CarrayError> {
        let corrupt = |msg: String| {
            CarrayError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
        };
        if bytes.len() < PACK_HEADER_LEN {
            return Err(corrupt(format!(
                "chunk file header is {} bytes, expected {PACK_HEADER_LEN}",
                bytes.len()
            )));
        }
        if bytes[..4] != PACK_MAGIC {
            return Err(corrupt("chunk file lacks the pack magic".to_string()));
        }
        if bytes[4] != PACK_FORMAT_VERSION {
            return Err(corrupt(format!(
                "unsupported pack format version {}",
                bytes[4]
            )));
        }
        let nchunks = i64::from_le_bytes(bytes[8..16].try_into().expect("sliced to length"));
        Ok(Self { nchunks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_header_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let header = PackHeader::new(Some(1));
        let encoded = header.encode();
        assert_eq!(&encoded[..4], b"blpk");
        assert_eq!(encoded[4], 1);
        assert_eq!(&encoded[5..8], &[0, 0, 0]);
        assert_eq!(PackHeader::decode(&encoded)?, header);
        assert_eq!(PackHeader::decode(&encoded)?.nchunks(), Some(1));

        let unknown = PackHeader::new(None);
        assert_eq!(PackHeader::decode(&unknown.encode())?.nchunks(), None);
        Ok(())
    }

    #[test]
    fn pack_header_rejects_garbage() {
        assert!(PackHeader::decode(&[0u8; 8]).is_err());
        let mut bad_magic = PackHeader::new(Some(1)).encode();
        bad_magic[0] = b'x';
        assert!(PackHeader::decode(&bad_magic).is_err());
        let mut bad_version = PackHeader::new(Some(1)).encode();
        bad_version[4] = 9;
        assert!(PackHeader::decode(&bad_version).is_err());
    }
}
