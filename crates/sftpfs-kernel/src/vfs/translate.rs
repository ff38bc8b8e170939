//! Attribute and flag translation.
//!
//! Pure functions between POSIX-style metadata and the SFTP wire shapes:
//! open flags to native access modes, `stat` metadata to [`Attributes`], and
//! attributes to an `ls -l` style longname.

use chrono::{DateTime, Duration, Utc};

use super::types::{Attributes, FileType};

/// Roughly six months, the `ls -l` cutoff between showing a time and a year.
const RECENT_WINDOW_DAYS: i64 = 182;

/// Translate SFTP open flags to a native `open(2)` mode.
///
/// READ+WRITE becomes read-write access, READ or WRITE alone the matching
/// single access mode; create/append/exclusive/truncate are ORed on top.
#[cfg(unix)]
pub fn open_mode(flags: super::types::OpenFlags) -> rustix::fs::OFlags {
    use rustix::fs::OFlags;

    let mut mode = if flags.read && flags.write {
        OFlags::RDWR
    } else if flags.write {
        OFlags::WRONLY
    } else {
        OFlags::RDONLY
    };

    if flags.create {
        mode |= OFlags::CREATE;
    }
    if flags.append {
        mode |= OFlags::APPEND;
    }
    if flags.exclusive {
        mode |= OFlags::EXCL;
    }
    if flags.truncate {
        mode |= OFlags::TRUNC;
    }

    mode
}

/// Clamp a signed epoch timestamp into the SFTP v3 `uint32` range.
pub fn epoch_secs(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

/// Seconds since the epoch for "now".
pub fn now_secs() -> u32 {
    epoch_secs(Utc::now().timestamp())
}

impl Attributes {
    /// Build a fully populated record from native metadata.
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            size: Some(meta.size()),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            mode: Some(meta.mode()),
            atime: Some(epoch_secs(meta.atime())),
            mtime: Some(epoch_secs(meta.mtime())),
        }
    }
}

/// The 10-character type and permission column, e.g. `drwxr-xr-x`.
pub fn permission_string(mode: u32) -> String {
    let kind = match FileType::from_mode(mode) {
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let triplet = (mode >> shift) & 0o7;
        out.push(if triplet & 0o4 != 0 { 'r' } else { '-' });
        out.push(if triplet & 0o2 != 0 { 'w' } else { '-' });
        out.push(if triplet & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Render a modification time the way `ls -l` does relative to `now`.
fn format_mtime(mtime: u32, now: DateTime<Utc>) -> String {
    let time = DateTime::<Utc>::from_timestamp(mtime as i64, 0).unwrap_or_default();

    let age = now.signed_duration_since(time);
    let window = Duration::days(RECENT_WINDOW_DAYS);
    if age < window && age > -window {
        time.format("%b %e %H:%M").to_string()
    } else {
        time.format("%b %e  %Y").to_string()
    }
}

/// Format a directory listing line against an explicit "now".
pub fn longname_at(filename: &str, attrs: &Attributes, nlink: u64, now: DateTime<Utc>) -> String {
    format!(
        "{} {:>3} {:<8} {:<8} {:>8} {} {}",
        permission_string(attrs.mode.unwrap_or(0)),
        nlink,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        format_mtime(attrs.mtime.unwrap_or(0), now),
        filename
    )
}

/// Format a directory listing line.
pub fn longname(filename: &str, attrs: &Attributes, nlink: u64) -> String {
    longname_at(filename, attrs, nlink, Utc::now())
}
