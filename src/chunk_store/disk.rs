//! The on-disk chunk store.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use super::{ChunkStoreTraits, PackHeader, PACK_HEADER_LEN};
use crate::array::Mode;
use crate::chunk::Chunk;
use crate::dtype::Dtype;
use crate::error::CarrayError;

const CHUNK_FILE_EXT: &str = "blp";

#[derive(Debug)]
struct DiskState {
    nchunks: usize,
    /// Single-slot most-recently-read cache, keyed by chunk index.
    cache: Option<(usize, Arc<Chunk>)>,
}

/// An on-disk chunk store: one `__<i>.blp` file per chunk, in order and
/// without gaps, each holding a 16-byte pack header followed by the codec's
/// self-describing buffer.
#[derive(Debug)]
pub struct FilesystemChunkStore {
    data_dir: PathBuf,
    dtype: Dtype,
    mode: Mode,
    state: Mutex<DiskState>,
}

impl FilesystemChunkStore {
    /// Create the `data/` directory and an empty store.
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] if the directory cannot be created.
    pub fn create(data_dir: impl AsRef<Path>, dtype: Dtype, mode: Mode) -> Result<Self, CarrayError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            dtype,
            mode,
            state: Mutex::new(DiskState {
                nchunks: 0,
                cache: None,
            }),
        })
    }

    /// Open an existing store holding `nchunks` chunks.
    ///
    /// # Errors
    /// Returns [`CarrayError::Io`] if the directory is missing.
    pub fn open(
        data_dir: impl AsRef<Path>,
        dtype: Dtype,
        mode: Mode,
        nchunks: usize,
    ) -> Result<Self, CarrayError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        if !data_dir.is_dir() {
            return Err(CarrayError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("chunk data directory {} is missing", data_dir.display()),
            )));
        }
        Ok(Self {
            data_dir,
            dtype,
            mode,
            state: Mutex::new(DiskState {
                nchunks,
                cache: None,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DiskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), CarrayError> {
        if self.mode == Mode::Read {
            return Err(CarrayError::ReadOnly);
        }
        Ok(())
    }

    fn chunk_path(&self, i: usize) -> PathBuf {
        self.data_dir.join(format!("__{i}.{CHUNK_FILE_EXT}"))
    }

    /// Read and decode chunk file `__<i>.blp`, bypassing the count bound.
    ///
    /// This is also the path used to rebuild the leftover tail on open, where
    /// `i` equals the chunk count.
    pub(crate) fn read_chunk_file(&self, i: usize) -> Result<Chunk, CarrayError> {
        let path = self.chunk_path(i);
        let mut bytes = std::fs::read(&path).map_err(|e| {
            CarrayError::Io(std::io::Error::new(
                e.kind(),
                format!("chunk file {}: {e}", path.display()),
            ))
        })?;
        PackHeader::decode(&bytes)?;
        let body: Bytes = bytes.split_off(PACK_HEADER_LEN).into();
        Chunk::from_compressed(body, &self.dtype)
    }

    fn write_chunk_file(&self, i: usize, chunk: &Chunk) -> Result<(), CarrayError> {
        let data = chunk.compressed_data().ok_or_else(|| {
            CarrayError::InvalidArgument(
                "constant chunks are never handed to the on-disk store".to_string(),
            )
        })?;
        let mut file = File::create(self.chunk_path(i))?;
        file.write_all(&PackHeader::new(Some(1)).encode())?;
        file.write_all(data)?;
        Ok(())
    }
}

impl ChunkStoreTraits for FilesystemChunkStore {
    fn len(&self) -> usize {
        self.state().nchunks
    }

    fn get(&self, i: usize) -> Result<Arc<Chunk>, CarrayError> {
        {
            let state = self.state();
            if i >= state.nchunks {
                return Err(CarrayError::OutOfRange {
                    index: i as i64,
                    len: state.nchunks,
                });
            }
            if let Some((cached_i, chunk)) = &state.cache {
                if *cached_i == i {
                    return Ok(Arc::clone(chunk));
                }
            }
        }
        let chunk = Arc::new(self.read_chunk_file(i)?);
        self.state().cache = Some((i, Arc::clone(&chunk)));
        Ok(chunk)
    }

    fn append(&self, chunk: Chunk) -> Result<(), CarrayError> {
        self.check_writable()?;
        let i = self.state().nchunks;
        self.write_chunk_file(i, &chunk)?;
        self.state().nchunks = i + 1;
        Ok(())
    }

    fn set(&self, i: usize, chunk: Chunk) -> Result<usize, CarrayError> {
        self.check_writable()?;
        let nchunks = self.state().nchunks;
        if i >= nchunks {
            return Err(CarrayError::OutOfRange {
                index: i as i64,
                len: nchunks,
            });
        }
        let replaced = std::fs::metadata(self.chunk_path(i))?
            .len()
            .saturating_sub(PACK_HEADER_LEN as u64) as usize;
        self.write_chunk_file(i, &chunk)?;
        let mut state = self.state();
        if state.cache.as_ref().is_some_and(|(ci, _)| *ci == i) {
            state.cache = None;
        }
        Ok(replaced)
    }

    fn pop(&self) -> Result<Arc<Chunk>, CarrayError> {
        self.check_writable()?;
        let nchunks = self.state().nchunks;
        if nchunks == 0 {
            return Err(CarrayError::OutOfRange { index: -1, len: 0 });
        }
        let chunk = self.get(nchunks - 1)?;
        std::fs::remove_file(self.chunk_path(nchunks - 1))?;
        // A tail flushed earlier may sit one slot past the packed chunks.
        let stale_tail = self.chunk_path(nchunks);
        if stale_tail.exists() {
            std::fs::remove_file(stale_tail)?;
        }
        let mut state = self.state();
        state.nchunks = nchunks - 1;
        if state.cache.as_ref().is_some_and(|(ci, _)| *ci >= nchunks - 1) {
            state.cache = None;
        }
        Ok(chunk)
    }

    fn flush_tail(&self, chunk: &Chunk) -> Result<(), CarrayError> {
        self.check_writable()?;
        let i = self.state().nchunks;
        self.write_chunk_file(i, chunk)
    }

    fn free_cache(&self) {
        self.state().cache = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blosc::{BloscContext, Cparams};
    use crate::dtype::{transmute_to_bytes, Element};

    fn chunk_of(base: i32, ctx: &BloscContext) -> Result<Chunk, CarrayError> {
        let values: Vec<i32> = (base..base + 256).collect();
        Chunk::from_bytes(
            transmute_to_bytes(&values),
            &i32::dtype(),
            &Cparams::default(),
            ctx,
            false,
        )
    }

    #[test]
    fn append_get_pop_files() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = BloscContext::acquire();
        let dir = tempfile::TempDir::new()?;
        let store = FilesystemChunkStore::create(dir.path().join("data"), i32::dtype(), Mode::Append)?;

        store.append(chunk_of(0, &ctx)?)?;
        store.append(chunk_of(1000, &ctx)?)?;
        assert_eq!(store.len(), 2);
        assert!(dir.path().join("data/__0.blp").is_file());
        assert!(dir.path().join("data/__1.blp").is_file());

        let chunk = store.get(1)?;
        let mut row = [0u8; 4];
        chunk.get(&mut row, 0, 1, &ctx)?;
        assert_eq!(i32::from_ne_bytes(row), 1000);
        // Second read hits the single-slot cache.
        assert!(Arc::ptr_eq(&chunk, &store.get(1)?));

        // File length is the pack header plus the codec buffer.
        let on_disk = std::fs::metadata(dir.path().join("data/__1.blp"))?.len();
        assert_eq!(on_disk as usize, PACK_HEADER_LEN + chunk.cbytes());

        store.flush_tail(&chunk_of(0, &ctx)?)?;
        assert!(dir.path().join("data/__2.blp").is_file());
        assert_eq!(store.len(), 2);

        // Popping removes the chunk and the stale flushed tail past it.
        store.pop()?;
        assert!(!dir.path().join("data/__1.blp").exists());
        assert!(!dir.path().join("data/__2.blp").exists());
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn set_replaces_and_reports_size() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = BloscContext::acquire();
        let dir = tempfile::TempDir::new()?;
        let store = FilesystemChunkStore::create(dir.path().join("data"), i32::dtype(), Mode::Append)?;
        let first = chunk_of(0, &ctx)?;
        let first_cbytes = first.cbytes();
        store.append(first)?;
        let replaced = store.set(0, chunk_of(7, &ctx)?)?;
        assert_eq!(replaced, first_cbytes);
        assert!(store.set(3, chunk_of(0, &ctx)?).is_err());
        Ok(())
    }

    #[test]
    fn read_only_rejects_mutation() -> Result<(), Box<dyn std::error::Error>> {
        let ctx = BloscContext::acquire();
        let dir = tempfile::TempDir::new()?;
        let writable =
            FilesystemChunkStore::create(dir.path().join("data"), i32::dtype(), Mode::Append)?;
        writable.append(chunk_of(0, &ctx)?)?;

        let store =
            FilesystemChunkStore::open(dir.path().join("data"), i32::dtype(), Mode::Read, 1)?;
        assert!(store.get(0).is_ok());
        assert!(matches!(
            store.append(chunk_of(0, &ctx)?),
            Err(CarrayError::ReadOnly)
        ));
        assert!(matches!(store.pop(), Err(CarrayError::ReadOnly)));
        assert!(matches!(
            store.flush_tail(&chunk_of(0, &ctx)?),
            Err(CarrayError::ReadOnly)
        ));
        Ok(())
    }
}
