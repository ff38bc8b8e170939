//! Local filesystem backend.
//!
//! Serves real files beneath a root directory. Client paths are first
//! resolved lexically against the root, so `..` can never climb above it,
//! then canonicalized on disk: a path that reaches outside the root through
//! a symbolic link is PERMISSION_DENIED.

use async_trait::async_trait;
use std::fs::{File, FileTimes, Permissions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs;

use crate::handle::{params, Handle, ParamValue};
use crate::vfs::auth::{AuthOutcome, AuthRequest, ClientSession, Credentials};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::FileSystem;
use crate::vfs::translate::{longname, open_mode};
use crate::vfs::types::{Attributes, DirEntry, OpenFlags};

const DEFAULT_FILE_MODE: u32 = 0o666;
const DEFAULT_DIR_MODE: u32 = 0o777;
const MAX_SYMLINK_HOPS: u32 = 40;

/// Run blocking filesystem work off the async threads.
async fn blocking<T, F>(f: F) -> VfsResult<T>
where
    F: FnOnce() -> VfsResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VfsError::other(format!("blocking task failed: {e}")))?
}

fn system_time(secs: u32) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs as u64)
}

/// Local filesystem backend.
///
/// All operations are relative to `root`. For example, if `root` is
/// `/srv/files`, then a client `open("/docs/a.txt")` opens
/// `/srv/files/docs/a.txt`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    credentials: Option<Credentials>,
}

impl LocalBackend {
    /// Create a backend rooted at the given path.
    ///
    /// The root is canonicalized at construction time so `realpath` can
    /// strip it reliably (e.g. macOS `/tmp` → `/private/tmp`).
    /// Logins are refused until [`LocalBackend::with_credentials`] sets a
    /// username/password pair.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            credentials: None,
        }
    }

    /// Require this username/password pair.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a client path to a native path, following a final symlink.
    ///
    /// Returns an error if the path escapes the root.
    fn resolve(&self, path: &str) -> VfsResult<PathBuf> {
        self.confine(&self.lexical(path), true, 0)
    }

    /// Like [`LocalBackend::resolve`], but the final component is taken as
    /// is. For operations that act on a link itself.
    fn resolve_entry(&self, path: &str) -> VfsResult<PathBuf> {
        self.confine(&self.lexical(path), false, 0)
    }

    /// Join a client path onto the root without touching the disk.
    fn lexical(&self, path: &str) -> PathBuf {
        let mut full = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(s) => full.push(s),
                Component::ParentDir => {
                    if full != self.root {
                        full.pop();
                    }
                }
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            }
        }
        full
    }

    /// Canonicalize `full` and verify it is still under the root.
    ///
    /// Existing paths are canonicalized whole; for new ones the parent is
    /// canonicalized and the filename appended. A dangling link that would
    /// be followed is chased by hand, since a create through it lands
    /// wherever it points.
    fn confine(&self, full: &Path, follow: bool, hops: u32) -> VfsResult<PathBuf> {
        if full == self.root {
            return Ok(full.to_path_buf());
        }

        let canonical = match full.symlink_metadata() {
            Ok(meta) if meta.is_symlink() && follow => match full.canonicalize() {
                Ok(canonical) => canonical,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    if hops >= MAX_SYMLINK_HOPS {
                        return Err(VfsError::other(format!(
                            "too many levels of symbolic links: {}",
                            full.display()
                        )));
                    }
                    let target = std::fs::read_link(full)?;
                    let base = full.parent().unwrap_or(&self.root);
                    return self.confine(&base.join(target), true, hops + 1);
                }
                Err(e) => return Err(e.into()),
            },
            Ok(meta) if !meta.is_symlink() => full.canonicalize()?,
            // Missing, or a link taken as is.
            _ => {
                let parent = full
                    .parent()
                    .ok_or_else(|| VfsError::permission_denied("no parent"))?;
                let name = full
                    .file_name()
                    .ok_or_else(|| VfsError::bad_message(format!("no filename: {}", full.display())))?;
                parent.canonicalize()?.join(name)
            }
        };

        if !canonical.starts_with(&self.root) {
            return Err(VfsError::permission_denied(format!(
                "path escapes root: {}",
                full.display()
            )));
        }
        Ok(canonical)
    }

    fn descriptor(handle: &Handle) -> VfsResult<Arc<File>> {
        handle
            .file()
            .ok_or_else(|| VfsError::other(format!("{} has no open descriptor", handle.path())))
    }

    /// Apply each present field with its own syscall.
    fn apply_attrs(path: &Path, attrs: &Attributes) -> VfsResult<()> {
        if let Some(size) = attrs.size {
            File::options().write(true).open(path)?.set_len(size)?;
        }
        if let Some(perm) = attrs.permissions() {
            std::fs::set_permissions(path, Permissions::from_mode(perm))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            std::os::unix::fs::chown(path, attrs.uid, attrs.gid)?;
        }
        if attrs.atime.is_some() || attrs.mtime.is_some() {
            let mut times = FileTimes::new();
            if let Some(atime) = attrs.atime {
                times = times.set_accessed(system_time(atime));
            }
            if let Some(mtime) = attrs.mtime {
                times = times.set_modified(system_time(mtime));
            }
            File::open(path)?.set_times(times)?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for LocalBackend {
    async fn authenticate(
        &self,
        _session: &ClientSession,
        request: &AuthRequest,
    ) -> VfsResult<AuthOutcome> {
        match &self.credentials {
            Some(credentials) => credentials.check(request),
            None => Err(VfsError::permission_denied("no credentials configured")),
        }
    }

    async fn open(
        &self,
        _session: &ClientSession,
        handle: &Handle,
        flags: OpenFlags,
        attrs: &Attributes,
    ) -> VfsResult<()> {
        use rustix::fs::{Mode, OFlags};

        let full_path = self.resolve(handle.path())?;
        let mode = open_mode(flags) | OFlags::CLOEXEC;
        let perm = attrs.permissions().unwrap_or(DEFAULT_FILE_MODE);

        let file = blocking(move || {
            let fd = rustix::fs::open(&full_path, mode, Mode::from_bits_truncate(perm as _))
                .map_err(|e| VfsError::Io(e.into()))?;
            Ok(File::from(fd))
        })
        .await?;

        let file = Arc::new(file);
        handle.set_param(params::DESCRIPTOR, ParamValue::File(file.clone()));
        handle.add_disposable(move || async move {
            drop(file);
            Ok(())
        });
        Ok(())
    }

    async fn read(
        &self,
        _session: &ClientSession,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> VfsResult<Option<Vec<u8>>> {
        let file = Self::descriptor(handle)?;

        blocking(move || {
            let size = file.metadata()?.len();
            if offset >= size {
                return Ok(None);
            }

            let want = (len as u64).min(size - offset) as usize;
            let mut buffer = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = file.read_at(&mut buffer[filled..], offset + filled as u64)?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            buffer.truncate(filled);

            if filled == 0 { Ok(None) } else { Ok(Some(buffer)) }
        })
        .await
    }

    async fn write(
        &self,
        _session: &ClientSession,
        handle: &Handle,
        offset: u64,
        data: &[u8],
    ) -> VfsResult<()> {
        let file = Self::descriptor(handle)?;
        let data = data.to_vec();
        blocking(move || Ok(file.write_all_at(&data, offset)?)).await
    }

    async fn opendir(&self, _session: &ClientSession, handle: &Handle) -> VfsResult<()> {
        let full_path = self.resolve(handle.path())?;
        let meta = fs::metadata(&full_path).await?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(handle.path()));
        }
        Ok(())
    }

    async fn listdir(
        &self,
        _session: &ClientSession,
        handle: &Handle,
    ) -> VfsResult<Option<Vec<DirEntry>>> {
        if handle.flag(params::EOF) {
            return Ok(None);
        }

        let full_path = self.resolve(handle.path())?;
        let listing = blocking(move || {
            let mut listing = Vec::new();
            for entry in std::fs::read_dir(&full_path)? {
                let entry = entry?;
                let meta = match entry.path().symlink_metadata() {
                    Ok(meta) => meta,
                    // Raced with a removal.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                let name = entry.file_name().to_string_lossy().into_owned();
                let attrs = Attributes::from_metadata(&meta);
                let line = longname(&name, &attrs, meta.nlink());
                listing.push(DirEntry::new(name, line, attrs));
            }
            listing.sort_by(|a, b| a.filename.cmp(&b.filename));
            Ok(listing)
        })
        .await?;

        handle.set_param(params::EOF, ParamValue::Flag(true));
        Ok(Some(listing))
    }

    async fn stat(&self, _session: &ClientSession, path: &str) -> VfsResult<Attributes> {
        let meta = fs::metadata(self.resolve(path)?).await?;
        Ok(Attributes::from_metadata(&meta))
    }

    async fn lstat(&self, _session: &ClientSession, path: &str) -> VfsResult<Attributes> {
        let meta = fs::symlink_metadata(self.resolve_entry(path)?).await?;
        Ok(Attributes::from_metadata(&meta))
    }

    async fn setstat(
        &self,
        _session: &ClientSession,
        path: &str,
        attrs: &Attributes,
    ) -> VfsResult<()> {
        let full_path = self.resolve(path)?;
        let attrs = attrs.clone();
        blocking(move || Self::apply_attrs(&full_path, &attrs)).await
    }

    async fn mkdir(&self, _session: &ClientSession, path: &str, attrs: &Attributes) -> VfsResult<()> {
        let full_path = self.resolve_entry(path)?;
        let perm = attrs.permissions().unwrap_or(DEFAULT_DIR_MODE);

        fs::DirBuilder::new().mode(perm).create(&full_path).await?;

        let rest = attrs.ownership_and_times();
        if !rest.is_empty() {
            blocking(move || Self::apply_attrs(&full_path, &rest)).await?;
        }
        Ok(())
    }

    async fn remove(&self, _session: &ClientSession, path: &str) -> VfsResult<()> {
        fs::remove_file(self.resolve_entry(path)?).await?;
        Ok(())
    }

    async fn rmdir(&self, _session: &ClientSession, path: &str) -> VfsResult<()> {
        let full_path = self.resolve_entry(path)?;
        if full_path == self.root {
            return Err(VfsError::permission_denied("cannot remove root"));
        }
        fs::remove_dir(full_path).await?;
        Ok(())
    }

    async fn rename(
        &self,
        _session: &ClientSession,
        old_path: &str,
        new_path: &str,
    ) -> VfsResult<()> {
        fs::rename(self.resolve_entry(old_path)?, self.resolve_entry(new_path)?).await?;
        Ok(())
    }

    async fn symlink(
        &self,
        _session: &ClientSession,
        target_path: &str,
        link_path: &str,
    ) -> VfsResult<()> {
        // Absolute targets are client paths, so they point beneath the root.
        // The target itself is checked whenever the link is followed.
        let target = if target_path.starts_with('/') {
            self.lexical(target_path)
        } else {
            PathBuf::from(target_path)
        };
        fs::symlink(target, self.resolve_entry(link_path)?).await?;
        Ok(())
    }

    async fn readlink(&self, _session: &ClientSession, path: &str) -> VfsResult<String> {
        let target = fs::read_link(self.resolve_entry(path)?).await?;
        match target.strip_prefix(&self.root) {
            Ok(relative) => Ok(format!("/{}", relative.display())),
            Err(_) => Ok(target.to_string_lossy().into_owned()),
        }
    }

    async fn realpath(&self, _session: &ClientSession, path: &str) -> VfsResult<String> {
        let canonical = self.resolve(path)?;
        // A missing final component resolves but does not exist.
        fs::symlink_metadata(&canonical).await?;

        let relative = canonical.strip_prefix(&self.root).map_err(|_| {
            VfsError::permission_denied(format!("path escapes root: {path}"))
        })?;
        Ok(format!("/{}", relative.display()))
    }
}
