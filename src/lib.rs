//! Effective-data extraction for block-level backup of live storage.
//!
//! Given a raw device carrying a known filesystem, this crate decodes the
//! filesystem's own allocation metadata into a per-cluster bitmap, strides
//! over it at a configurable block size, and streams only the allocated
//! blocks to a consumer — optionally diffing per-block XXH64 digests
//! against a previous run's sidecar so unchanged blocks are skipped.
//!
//! The crate never writes to the source and never interprets file contents.
//! Callers needing crash consistency must hand it a point-in-time stable
//! source (snapshot device, frozen volume).

pub mod bitmap;
pub mod bits;
pub mod config;
pub mod copy;
pub mod detect;
pub mod device;
pub mod endian;
pub mod error;
pub mod ext;
pub mod hash;
pub mod iter;
pub mod ntfs;
pub mod reader;
pub mod xfs;

pub use crate::bitmap::Bitmap;
pub use crate::config::{BlockSize, ReaderOptions, MAX_READ_CONCURRENCY};
pub use crate::copy::copy_effective;
pub use crate::detect::FilesystemKind;
pub use crate::device::{ReadAt, WriteAt};
pub use crate::error::{Error, Result};
pub use crate::iter::{BitmapIterator, BlockSpan, EffectiveBlockAddr};
pub use crate::reader::{CancelToken, EffectiveData, EffectiveDataReader};
