//! Virtual filesystem contract for SFTP sessions.
//!
//! Key components:
//!
//! - [`FileSystem`] - the operation set a backend implements
//! - [`MemoryBackend`] - in-memory filesystem (testing, scratch servers)
//! - [`LocalBackend`] - local disk, confined to a root directory
//!
//! ## Design Decisions
//!
//! - **Handle-based I/O**: `open`/`opendir` get a [`Handle`](crate::handle::Handle)
//!   created by the dispatcher; backends park their state on it.
//! - **Unsupported by default**: every operation defaults to
//!   `OpUnsupported`, so partial backends are fine.
//! - **Status taxonomy**: every [`VfsError`] maps to one SFTP status code.

pub mod auth;
pub mod backends;
mod error;
mod ops;
pub mod translate;
mod types;

pub use auth::{AuthMethod, AuthOutcome, AuthRequest, ClientSession, Credentials};
pub use backends::{LocalBackend, MemoryBackend};
pub use error::{StatusCode, VfsError, VfsResult};
pub use ops::{FileSystem, UnsupportedFileSystem};
pub use types::{Attributes, DirEntry, FileType, OpenFlags, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
