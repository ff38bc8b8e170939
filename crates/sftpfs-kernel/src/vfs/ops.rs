//! The backend contract.
//!
//! A backend implements whichever subset of [`FileSystem`] it supports.
//! Every operation has a default body that fails with
//! [`VfsError::OpUnsupported`], so the dispatcher can always call through and
//! report SSH_FX_OP_UNSUPPORTED for the rest.

use async_trait::async_trait;

use super::auth::{AuthOutcome, AuthRequest, ClientSession};
use super::error::{VfsError, VfsResult};
use super::types::{Attributes, DirEntry, OpenFlags};
use crate::handle::Handle;

/// Core filesystem operations behind an SFTP session.
///
/// Handle-based operations receive the [`Handle`] the dispatcher created;
/// backends keep their private state (descriptors, listing progress) in its
/// parameter bag and register cleanup with [`Handle::add_disposable`].
/// Paths are exactly what the client sent; interpretation is up to the
/// backend.
#[async_trait]
pub trait FileSystem: Send + Sync {
    // ========================================================================
    // Session
    // ========================================================================

    /// Decide one authentication attempt.
    ///
    /// `Err` rejects the attempt outright.
    async fn authenticate(
        &self,
        _session: &ClientSession,
        _request: &AuthRequest,
    ) -> VfsResult<AuthOutcome> {
        Err(VfsError::unsupported("authenticate"))
    }

    // ========================================================================
    // Handles
    // ========================================================================

    /// Open `handle.path()` as a file.
    ///
    /// Must register any cleanup before returning. On `Err` the dispatcher
    /// releases the handle, so nothing is left live.
    async fn open(
        &self,
        _session: &ClientSession,
        _handle: &Handle,
        _flags: OpenFlags,
        _attrs: &Attributes,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("open"))
    }

    /// Read up to `len` bytes at `offset`. `None` means end of file.
    async fn read(
        &self,
        _session: &ClientSession,
        _handle: &Handle,
        _offset: u64,
        _len: u32,
    ) -> VfsResult<Option<Vec<u8>>> {
        Err(VfsError::unsupported("read"))
    }

    /// Write all of `data` at `offset`.
    async fn write(
        &self,
        _session: &ClientSession,
        _handle: &Handle,
        _offset: u64,
        _data: &[u8],
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("write"))
    }

    /// Open `handle.path()` as a directory.
    async fn opendir(&self, _session: &ClientSession, _handle: &Handle) -> VfsResult<()> {
        Err(VfsError::unsupported("opendir"))
    }

    /// Next batch of entries. `None` means the listing is exhausted.
    async fn listdir(
        &self,
        _session: &ClientSession,
        _handle: &Handle,
    ) -> VfsResult<Option<Vec<DirEntry>>> {
        Err(VfsError::unsupported("readdir"))
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    /// Attributes of `path`, following symlinks.
    async fn stat(&self, _session: &ClientSession, _path: &str) -> VfsResult<Attributes> {
        Err(VfsError::unsupported("stat"))
    }

    /// Attributes of `path` itself.
    async fn lstat(&self, _session: &ClientSession, _path: &str) -> VfsResult<Attributes> {
        Err(VfsError::unsupported("lstat"))
    }

    /// Apply only the fields present in `attrs`, each independently.
    async fn setstat(
        &self,
        _session: &ClientSession,
        _path: &str,
        _attrs: &Attributes,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("setstat"))
    }

    // ========================================================================
    // Namespace
    // ========================================================================

    /// Create a directory, then apply any ownership or times in `attrs`.
    async fn mkdir(
        &self,
        _session: &ClientSession,
        _path: &str,
        _attrs: &Attributes,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("mkdir"))
    }

    async fn remove(&self, _session: &ClientSession, _path: &str) -> VfsResult<()> {
        Err(VfsError::unsupported("remove"))
    }

    async fn rmdir(&self, _session: &ClientSession, _path: &str) -> VfsResult<()> {
        Err(VfsError::unsupported("rmdir"))
    }

    async fn rename(
        &self,
        _session: &ClientSession,
        _old_path: &str,
        _new_path: &str,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("rename"))
    }

    /// Create `link_path` pointing at `target_path`.
    async fn symlink(
        &self,
        _session: &ClientSession,
        _target_path: &str,
        _link_path: &str,
    ) -> VfsResult<()> {
        Err(VfsError::unsupported("symlink"))
    }

    async fn readlink(&self, _session: &ClientSession, _path: &str) -> VfsResult<String> {
        Err(VfsError::unsupported("readlink"))
    }

    /// Canonical absolute form of `path`.
    async fn realpath(&self, _session: &ClientSession, _path: &str) -> VfsResult<String> {
        Err(VfsError::unsupported("realpath"))
    }
}

/// A backend that implements nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedFileSystem;

impl FileSystem for UnsupportedFileSystem {}
