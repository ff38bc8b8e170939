//! # sftpfs-kernel
//!
//! Handle lifecycle and the virtual filesystem contract behind an SFTP
//! server.
//!
//! - [`handle`] issues handle ids and owns per-handle backend state and
//!   cleanup.
//! - [`vfs`] defines the [`FileSystem`] trait, the attribute and status
//!   types it speaks, and two backends.

pub mod handle;
pub mod vfs;

pub use handle::{Handle, HandleId, HandleIdAllocator, HandleKind, ParamValue};
pub use vfs::{
    backends::{LocalBackend, MemoryBackend},
    Attributes, AuthMethod, AuthOutcome, AuthRequest, ClientSession, Credentials, DirEntry,
    FileSystem, FileType, OpenFlags, StatusCode, VfsError, VfsResult,
};
