//! Decoded SFTP requests and the outbound response primitives.
//!
//! [`Request`] is what the transport hands to a connection; [`ResponseSink`]
//! is what the connection writes replies through. Neither knows anything
//! about SSH or byte layouts.

use sftpfs_kernel::{Attributes, DirEntry, OpenFlags, StatusCode};
use std::fmt;

/// Request types, used as the key of a connection's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Open,
    Close,
    Read,
    Write,
    Lstat,
    Fstat,
    Setstat,
    Fsetstat,
    Opendir,
    Readdir,
    Remove,
    Mkdir,
    Rmdir,
    Realpath,
    Stat,
    Rename,
    Readlink,
    Symlink,
}

impl RequestKind {
    /// Every request type, in wire-number order.
    pub const ALL: [RequestKind; 18] = [
        RequestKind::Open,
        RequestKind::Close,
        RequestKind::Read,
        RequestKind::Write,
        RequestKind::Lstat,
        RequestKind::Fstat,
        RequestKind::Setstat,
        RequestKind::Fsetstat,
        RequestKind::Opendir,
        RequestKind::Readdir,
        RequestKind::Remove,
        RequestKind::Mkdir,
        RequestKind::Rmdir,
        RequestKind::Realpath,
        RequestKind::Stat,
        RequestKind::Rename,
        RequestKind::Readlink,
        RequestKind::Symlink,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Open => "open",
            RequestKind::Close => "close",
            RequestKind::Read => "read",
            RequestKind::Write => "write",
            RequestKind::Lstat => "lstat",
            RequestKind::Fstat => "fstat",
            RequestKind::Setstat => "setstat",
            RequestKind::Fsetstat => "fsetstat",
            RequestKind::Opendir => "opendir",
            RequestKind::Readdir => "readdir",
            RequestKind::Remove => "remove",
            RequestKind::Mkdir => "mkdir",
            RequestKind::Rmdir => "rmdir",
            RequestKind::Realpath => "realpath",
            RequestKind::Stat => "stat",
            RequestKind::Rename => "rename",
            RequestKind::Readlink => "readlink",
            RequestKind::Symlink => "symlink",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded client request. `handle` fields are the raw wire token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Open { id: u32, path: String, flags: OpenFlags, attrs: Attributes },
    Close { id: u32, handle: Vec<u8> },
    Read { id: u32, handle: Vec<u8>, offset: u64, len: u32 },
    Write { id: u32, handle: Vec<u8>, offset: u64, data: Vec<u8> },
    Lstat { id: u32, path: String },
    Fstat { id: u32, handle: Vec<u8> },
    Setstat { id: u32, path: String, attrs: Attributes },
    Fsetstat { id: u32, handle: Vec<u8>, attrs: Attributes },
    Opendir { id: u32, path: String },
    Readdir { id: u32, handle: Vec<u8> },
    Remove { id: u32, path: String },
    Mkdir { id: u32, path: String, attrs: Attributes },
    Rmdir { id: u32, path: String },
    Realpath { id: u32, path: String },
    Stat { id: u32, path: String },
    Rename { id: u32, old_path: String, new_path: String },
    Readlink { id: u32, path: String },
    Symlink { id: u32, target_path: String, link_path: String },
}

impl Request {
    /// The request-correlation id.
    pub fn id(&self) -> u32 {
        match self {
            Request::Open { id, .. }
            | Request::Close { id, .. }
            | Request::Read { id, .. }
            | Request::Write { id, .. }
            | Request::Lstat { id, .. }
            | Request::Fstat { id, .. }
            | Request::Setstat { id, .. }
            | Request::Fsetstat { id, .. }
            | Request::Opendir { id, .. }
            | Request::Readdir { id, .. }
            | Request::Remove { id, .. }
            | Request::Mkdir { id, .. }
            | Request::Rmdir { id, .. }
            | Request::Realpath { id, .. }
            | Request::Stat { id, .. }
            | Request::Rename { id, .. }
            | Request::Readlink { id, .. }
            | Request::Symlink { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Open { .. } => RequestKind::Open,
            Request::Close { .. } => RequestKind::Close,
            Request::Read { .. } => RequestKind::Read,
            Request::Write { .. } => RequestKind::Write,
            Request::Lstat { .. } => RequestKind::Lstat,
            Request::Fstat { .. } => RequestKind::Fstat,
            Request::Setstat { .. } => RequestKind::Setstat,
            Request::Fsetstat { .. } => RequestKind::Fsetstat,
            Request::Opendir { .. } => RequestKind::Opendir,
            Request::Readdir { .. } => RequestKind::Readdir,
            Request::Remove { .. } => RequestKind::Remove,
            Request::Mkdir { .. } => RequestKind::Mkdir,
            Request::Rmdir { .. } => RequestKind::Rmdir,
            Request::Realpath { .. } => RequestKind::Realpath,
            Request::Stat { .. } => RequestKind::Stat,
            Request::Rename { .. } => RequestKind::Rename,
            Request::Readlink { .. } => RequestKind::Readlink,
            Request::Symlink { .. } => RequestKind::Symlink,
        }
    }
}

/// Outbound response primitives.
///
/// Each method queues one reply and returns `true` while the transport can
/// take more; `false` means the caller should stop writing until the
/// transport signals continue.
pub trait ResponseSink: Send + Sync {
    fn status(&self, id: u32, code: StatusCode, message: &str) -> bool;
    fn handle(&self, id: u32, token: &[u8]) -> bool;
    fn data(&self, id: u32, data: &[u8]) -> bool;
    fn attrs(&self, id: u32, attrs: &Attributes) -> bool;
    fn name(&self, id: u32, entries: &[DirEntry]) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_id() {
        let req = Request::Rename {
            id: 9,
            old_path: "a".into(),
            new_path: "b".into(),
        };
        assert_eq!(req.id(), 9);
        assert_eq!(req.kind(), RequestKind::Rename);
        assert_eq!(req.kind().to_string(), "rename");
    }

    #[test]
    fn test_all_kinds_are_distinct() {
        let names: std::collections::HashSet<_> =
            RequestKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), RequestKind::ALL.len());
    }
}
