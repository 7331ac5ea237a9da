//! `carray` is a columnar, chunked, block-compressed container for
//! homogeneous data, in memory or on disk.
//!
//! An array stores its rows as an ordered run of blosc-compressed chunks
//! plus one mutable uncompressed tail, giving compressed storage that can
//! still be appended to cheaply, sliced, mutated in place, filtered, and
//! reduced. Chunks are block-addressable, so reading a single element only
//! decodes the block containing it.
//!
//! Arrays can live purely in memory or persist under a root directory with
//! one file per chunk and JSON metadata, with crash-visible durability
//! through explicit [`Carray::flush`].
//!
//! ## Examples
//!
//! Build, slice, and reduce an in-memory array:
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use carray::{Carray, Scalar};
//!
//! let a = Carray::from_slice(&(0..1_000i32).collect::<Vec<_>>())?;
//! assert_eq!(a.len(), 1_000);
//! assert_eq!(a.get::<i32>(-1)?, 999);
//! assert_eq!(a.slice::<i32>(10, 20, 3)?, vec![10, 13, 16, 19]);
//! assert_eq!(a.sum()?, Scalar::Int(499_500));
//! # Ok(())
//! # }
//! ```
//!
//! Persist an array and reopen it:
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let tmp = tempfile::TempDir::new()?;
//! # let root = tmp.path().join("a");
//! use carray::{Carray, CarrayBuilder};
//!
//! let mut a = CarrayBuilder::new()
//!     .rootdir(&root)
//!     .build_from_slice(&(0..10_000u32).collect::<Vec<_>>())?;
//! a.append(&[10_000u32])?;
//! a.flush()?;
//!
//! let b = Carray::open(&root)?;
//! assert_eq!(b.len(), 10_001);
//! assert_eq!(b.get::<u32>(10_000)?, 10_000);
//! # Ok(())
//! # }
//! ```
//!
//! Filter a boolean array by index:
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use carray::Carray;
//!
//! let flags = Carray::from_slice(&(0..100).map(|i| i % 30 == 0).collect::<Vec<bool>>())?;
//! let hits: Vec<usize> = flags.wheretrue(None, 0)?.collect::<Result<_, _>>()?;
//! assert_eq!(hits, vec![0, 30, 60, 90]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Logging
//! `carray` logs through the [`log`] crate; enable a logging implementation
//! to capture diagnostics about cache fallbacks and destructive maintenance.

pub mod array;
pub mod attrs;
pub mod blosc;
pub mod chunk;
pub mod chunk_store;
pub mod config;
pub mod dtype;
mod error;
mod meta;

pub use crate::array::{
    Carray, CarrayBuilder, CarrayIter, MaskEvaluator, Mode, WhereIter, WheretrueIter,
};
pub use crate::attrs::Attrs;
pub use crate::blosc::{BloscContext, Compressor, Cparams, ShuffleMode};
pub use crate::dtype::{Dtype, DtypeKind, Element, Scalar};
pub use crate::error::CarrayError;
