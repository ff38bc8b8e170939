//! VFS error types and the SFTP status taxonomy they map onto.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// SFTP status codes (`SSH_FX_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK
    Ok = 0,
    /// SSH_FX_EOF
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED
    PermissionDenied = 3,
    /// SSH_FX_FAILURE
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from the wire value.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Default human-readable message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

/// VFS error type.
///
/// Every variant carries exactly one [`StatusCode`] (see [`VfsError::status`]),
/// which is what the dispatcher writes back to the client.
#[derive(Debug, Error)]
pub enum VfsError {
    /// File or directory not found.
    #[error("no such file: {0}")]
    NoSuchFile(String),

    /// Permission denied (also used for rejected authentication).
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Malformed request.
    #[error("bad message: {0}")]
    BadMessage(String),

    /// The backend does not implement this operation.
    #[error("operation not supported: {0}")]
    OpUnsupported(String),

    /// A well-formed handle token that names no live handle.
    #[error("no such handle: {0}")]
    InvalidHandle(u32),

    /// Path already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Expected a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Expected a file.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Directory not empty.
    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl VfsError {
    /// Create a NoSuchFile error.
    pub fn no_such_file(path: impl Into<String>) -> Self {
        Self::NoSuchFile(path.into())
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a BadMessage error.
    pub fn bad_message(msg: impl Into<String>) -> Self {
        Self::BadMessage(msg.into())
    }

    /// Create an OpUnsupported error naming the operation.
    pub fn unsupported(op: impl Into<String>) -> Self {
        Self::OpUnsupported(op.into())
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists(path.into())
    }

    /// Create a NotADirectory error.
    pub fn not_a_directory(path: impl Into<String>) -> Self {
        Self::NotADirectory(path.into())
    }

    /// Create an IsADirectory error.
    pub fn is_a_directory(path: impl Into<String>) -> Self {
        Self::IsADirectory(path.into())
    }

    /// Create a DirectoryNotEmpty error.
    pub fn directory_not_empty(path: impl Into<String>) -> Self {
        Self::DirectoryNotEmpty(path.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// The protocol status code this error is reported as.
    pub fn status(&self) -> StatusCode {
        match self {
            VfsError::NoSuchFile(_) => StatusCode::NoSuchFile,
            VfsError::PermissionDenied(_) => StatusCode::PermissionDenied,
            VfsError::BadMessage(_) => StatusCode::BadMessage,
            VfsError::OpUnsupported(_) => StatusCode::OpUnsupported,
            VfsError::Io(e) => match e.kind() {
                io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                io::ErrorKind::Unsupported => StatusCode::OpUnsupported,
                _ => StatusCode::Failure,
            },
            VfsError::InvalidHandle(_)
            | VfsError::AlreadyExists(_)
            | VfsError::NotADirectory(_)
            | VfsError::IsADirectory(_)
            | VfsError::DirectoryNotEmpty(_)
            | VfsError::Other(_) => StatusCode::Failure,
        }
    }
}

/// VFS result type.
pub type VfsResult<T> = Result<T, VfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_status_codes() {
        assert_eq!(VfsError::no_such_file("x").status(), StatusCode::NoSuchFile);
        assert_eq!(
            VfsError::permission_denied("x").status(),
            StatusCode::PermissionDenied
        );
        assert_eq!(VfsError::bad_message("x").status(), StatusCode::BadMessage);
        assert_eq!(VfsError::unsupported("x").status(), StatusCode::OpUnsupported);
        assert_eq!(VfsError::other("x").status(), StatusCode::Failure);
        assert_eq!(VfsError::InvalidHandle(7).status(), StatusCode::Failure);
    }

    #[test]
    fn test_io_errors_map_by_kind() {
        let missing = VfsError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(missing.status(), StatusCode::NoSuchFile);

        let denied = VfsError::from(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert_eq!(denied.status(), StatusCode::PermissionDenied);

        let other = VfsError::from(io::Error::other("disk on fire"));
        assert_eq!(other.status(), StatusCode::Failure);
    }

    #[test]
    fn test_status_code_wire_values() {
        assert_eq!(StatusCode::from_u32(8), Some(StatusCode::OpUnsupported));
        assert_eq!(StatusCode::from_u32(99), None);
        assert_eq!(StatusCode::Eof as u32, 1);
    }
}
