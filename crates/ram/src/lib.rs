//! RAM persistence for quicksnap
//!
//! This crate moves guest RAM between host memory and a single RAM file:
//! - zero_page: vectorized and scalar zero-page detection
//! - format: RAM file header and index
//! - codec: page codec seam (identity codec)
//! - queue: bounded hand-off queue for the background workers
//! - saver: RamSaver, background writer thread
//! - loader: RamLoader, background reader thread plus on-demand page loads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod format;
pub mod loader;
pub mod queue;
pub mod saver;
pub mod zero_page;

pub use codec::{get_codec, CodecError, IdentityCodec, PageCodec};
pub use format::{
    FileIndex, IndexBlock, IndexFlags, PageEntry, RamFileHeader, RamFormatError, RAM_FILE_HEADER_SIZE,
    RAM_FILE_MAGIC, RAM_FILE_VERSION,
};
pub use loader::{RamLoadStats, RamLoader};
pub use queue::WorkQueue;
pub use saver::{RamSaveStats, RamSaver};
pub use zero_page::{is_buffer_zeroed, is_buffer_zeroed_scalar};

#[cfg(target_arch = "x86_64")]
pub use zero_page::is_buffer_zeroed_simd;
