//! Core VFS types.
//!
//! These are the wire-facing shapes: [`Attributes`] mirrors the SFTP v3
//! ATTRS structure and [`OpenFlags`] mirrors `SSH_FXF_*`.

use serde::{Deserialize, Serialize};

/// File type mask (`S_IFMT`).
pub const S_IFMT: u32 = 0o170000;
/// Regular file (`S_IFREG`).
pub const S_IFREG: u32 = 0o100000;
/// Directory (`S_IFDIR`).
pub const S_IFDIR: u32 = 0o040000;
/// Symbolic link (`S_IFLNK`).
pub const S_IFLNK: u32 = 0o120000;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
    /// Anything else (device, fifo, socket).
    Other,
}

impl FileType {
    /// Classify a raw `st_mode`.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFREG => FileType::File,
            S_IFDIR => FileType::Directory,
            S_IFLNK => FileType::Symlink,
            _ => FileType::Other,
        }
    }

    /// The `S_IF*` bits for this type (zero for [`FileType::Other`]).
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::Symlink => S_IFLNK,
            FileType::Other => 0,
        }
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

/// SFTP attribute record.
///
/// Every field is optional: inbound records (setstat, mkdir, open) only carry
/// what the client set, outbound records (stat, lstat, fstat, readdir) carry
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Size in bytes.
    pub size: Option<u64>,
    /// Owner user id.
    pub uid: Option<u32>,
    /// Owner group id.
    pub gid: Option<u32>,
    /// Permission and type bits.
    pub mode: Option<u32>,
    /// Last access time, seconds since the epoch.
    pub atime: Option<u32>,
    /// Last modification time, seconds since the epoch.
    pub mtime: Option<u32>,
}

impl Attributes {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Set permissions (and optionally type bits).
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Set both owner ids.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    /// Set both timestamps.
    pub fn with_times(mut self, atime: u32, mtime: u32) -> Self {
        self.atime = Some(atime);
        self.mtime = Some(mtime);
        self
    }

    /// Returns true if no field is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Permission bits only (type bits stripped).
    pub fn permissions(&self) -> Option<u32> {
        self.mode.map(|m| m & !S_IFMT)
    }

    /// File type derived from the mode, if present.
    pub fn file_type(&self) -> Option<FileType> {
        self.mode.map(FileType::from_mode)
    }

    /// Returns true if the mode says directory.
    pub fn is_dir(&self) -> bool {
        self.file_type().is_some_and(|t| t.is_dir())
    }

    /// The subset of this record that `mkdir` applies after creation.
    pub fn ownership_and_times(&self) -> Attributes {
        Attributes {
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            mtime: self.mtime,
            ..Default::default()
        }
    }
}

/// Directory entry as sent in an SFTP NAME response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (no path separators).
    pub filename: String,
    /// `ls -l` style listing line.
    pub longname: String,
    /// Entry attributes.
    pub attrs: Attributes,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(filename: impl Into<String>, longname: impl Into<String>, attrs: Attributes) -> Self {
        Self {
            filename: filename.into(),
            longname: longname.into(),
            attrs,
        }
    }

    /// A bare name entry, as used by `realpath` and `readlink` replies.
    pub fn name_only(filename: impl Into<String>) -> Self {
        Self::new(filename, String::new(), Attributes::default())
    }
}

/// Open file flags (`SSH_FXF_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl OpenFlags {
    /// SSH_FXF_READ
    pub const READ: u32 = 0x0000_0001;
    /// SSH_FXF_WRITE
    pub const WRITE: u32 = 0x0000_0002;
    /// SSH_FXF_APPEND
    pub const APPEND: u32 = 0x0000_0004;
    /// SSH_FXF_CREAT
    pub const CREATE: u32 = 0x0000_0008;
    /// SSH_FXF_TRUNC
    pub const TRUNCATE: u32 = 0x0000_0010;
    /// SSH_FXF_EXCL
    pub const EXCLUSIVE: u32 = 0x0000_0020;

    /// Decode the wire bitmask. Unknown bits are ignored.
    pub fn from_bits(bits: u32) -> Self {
        Self {
            read: bits & Self::READ != 0,
            write: bits & Self::WRITE != 0,
            append: bits & Self::APPEND != 0,
            create: bits & Self::CREATE != 0,
            truncate: bits & Self::TRUNCATE != 0,
            exclusive: bits & Self::EXCLUSIVE != 0,
        }
    }

    /// Encode back to the wire bitmask.
    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.read {
            bits |= Self::READ;
        }
        if self.write {
            bits |= Self::WRITE;
        }
        if self.append {
            bits |= Self::APPEND;
        }
        if self.create {
            bits |= Self::CREATE;
        }
        if self.truncate {
            bits |= Self::TRUNCATE;
        }
        if self.exclusive {
            bits |= Self::EXCLUSIVE;
        }
        bits
    }

    /// Read-only access.
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Create with write access.
    pub fn create_write() -> Self {
        Self {
            write: true,
            create: true,
            ..Default::default()
        }
    }

    /// Create and truncate, as `put` does.
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }
}
