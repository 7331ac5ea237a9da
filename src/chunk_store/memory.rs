//! The in-memory chunk store.

use std::sync::{Arc, Mutex, PoisonError};

use super::ChunkStoreTraits;
use crate::chunk::Chunk;
use crate::error::CarrayError;

/// An in-memory chunk store backed by a vector.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    chunks: Mutex<Vec<Arc<Chunk>>>,
}

impl MemoryChunkStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn chunks(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Chunk>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChunkStoreTraits for MemoryChunkStore {
    fn len(&self) -> usize {
        self.chunks().len()
    }

    fn get(&self, i: usize) -> Result<Arc<Chunk>, CarrayError> {
        let chunks = self.chunks();
        chunks.get(i).cloned().ok_or(CarrayError::OutOfRange {
            index: i as i64,
            len: chunks.len(),
        })
    }

    fn append(&self, chunk: Chunk) -> Result<(), CarrayError> {
        self.chunks().push(Arc::new(chunk));
        Ok(())
    }

    fn set(&self, i: usize, chunk: Chunk) -> Result<usize, CarrayError> {
        let mut chunks = self.chunks();
        let len = chunks.len();
        let slot = chunks.get_mut(i).ok_or(CarrayError::OutOfRange {
            index: i as i64,
            len,
        })?;
        let replaced = slot.cbytes();
        *slot = Arc::new(chunk);
        Ok(replaced)
    }

    fn pop(&self) -> Result<Arc<Chunk>, CarrayError> {
        self.chunks()
            .pop()
            .ok_or(CarrayError::OutOfRange { index: -1, len: 0 })
    }

    fn flush_tail(&self, _chunk: &Chunk) -> Result<(), CarrayError> {
        Ok(())
    }
}
