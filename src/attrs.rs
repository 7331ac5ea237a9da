//! Per-array user attributes.
//!
//! An attribute bag is a JSON object owned by one array. For persistent
//! arrays it lives at `attrs/__attrs__` under the root directory and every
//! mutation is written through immediately.

use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::array::Mode;
use crate::error::CarrayError;
use crate::meta::ATTRS_DIR;

const ATTRS_FILE: &str = "__attrs__";

/// A JSON attribute bag attached to an array.
#[derive(Clone, Debug, Default)]
pub struct Attrs {
    map: Map<String, Value>,
    rootdir: Option<PathBuf>,
    read_only: bool,
}

impl Attrs {
    /// An empty, in-memory bag.
    pub(crate) fn new_memory() -> Self {
        Self::default()
    }

    /// Create the `attrs/` directory for a new persistent array.
    pub(crate) fn create(rootdir: &std::path::Path, mode: Mode) -> Result<Self, CarrayError> {
        std::fs::create_dir_all(rootdir.join(ATTRS_DIR))?;
        Ok(Self {
            map: Map::new(),
            rootdir: Some(rootdir.to_path_buf()),
            read_only: mode == Mode::Read,
        })
    }

    /// Load the bag of an existing persistent array.
    pub(crate) fn open(rootdir: &std::path::Path, mode: Mode) -> Result<Self, CarrayError> {
        let path = rootdir.join(ATTRS_DIR).join(ATTRS_FILE);
        let map = if path.is_file() {
            let bytes = std::fs::read(&path)?;
            serde_json::from_slice(&bytes)?
        } else {
            Map::new()
        };
        Ok(Self {
            map,
            rootdir: Some(rootdir.to_path_buf()),
            read_only: mode == Mode::Read,
        })
    }

    /// Detach from persistence (used by views and in-memory copies).
    pub(crate) fn detached(&self) -> Self {
        Self {
            map: self.map.clone(),
            rootdir: None,
            read_only: false,
        }
    }

    /// Look up an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.map.get(name)
    }

    /// Set an attribute, writing through for persistent arrays.
    ///
    /// # Errors
    /// Returns [`CarrayError::ReadOnly`] on a read-only array, or an I/O
    /// error writing the bag.
    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Result<(), CarrayError> {
        if self.read_only {
            return Err(CarrayError::ReadOnly);
        }
        self.map.insert(name.into(), value);
        self.persist()
    }

    /// Remove an attribute, writing through for persistent arrays.
    ///
    /// # Errors
    /// Returns [`CarrayError::ReadOnly`] on a read-only array, or an I/O
    /// error writing the bag.
    pub fn remove(&mut self, name: &str) -> Result<Option<Value>, CarrayError> {
        if self.read_only {
            return Err(CarrayError::ReadOnly);
        }
        let removed = self.map.remove(name);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// The number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the bag is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The attribute names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }

    fn persist(&self) -> Result<(), CarrayError> {
        if let Some(rootdir) = &self.rootdir {
            let mut encoded = serde_json::to_string(&self.map)?;
            encoded.push('\n');
            std::fs::write(rootdir.join(ATTRS_DIR).join(ATTRS_FILE), encoded)?;
        }
        Ok(())
    }
}
