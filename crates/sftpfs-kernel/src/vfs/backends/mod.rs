//! VFS backends.
//!
//! Backends implement [`FileSystem`](super::FileSystem) for different storage types.

mod local;
mod memory;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
