//! In-memory filesystem backend.
//!
//! Used for scratch servers and testing. All data is ephemeral.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::handle::{params, Handle, ParamValue};
use crate::vfs::auth::{AuthOutcome, AuthRequest, ClientSession, Credentials};
use crate::vfs::error::{VfsError, VfsResult};
use crate::vfs::ops::FileSystem;
use crate::vfs::translate::{longname, now_secs};
use crate::vfs::types::{Attributes, DirEntry, OpenFlags, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

const MAX_SYMLINK_HOPS: usize = 40;
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Largest file this backend will hold.
const MAX_FILE_SIZE: u64 = 1 << 30;

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Entry {
    File { data: Vec<u8>, attrs: Attributes },
    Directory { attrs: Attributes },
    Symlink { target: String, attrs: Attributes },
}

impl Entry {
    fn attrs(&self) -> &Attributes {
        match self {
            Entry::File { attrs, .. } => attrs,
            Entry::Directory { attrs } => attrs,
            Entry::Symlink { attrs, .. } => attrs,
        }
    }

    fn attrs_mut(&mut self) -> &mut Attributes {
        match self {
            Entry::File { attrs, .. } => attrs,
            Entry::Directory { attrs } => attrs,
            Entry::Symlink { attrs, .. } => attrs,
        }
    }

    fn fresh_attrs(kind_bits: u32, perm: u32, size: u64) -> Attributes {
        let now = now_secs();
        Attributes::new()
            .with_mode(kind_bits | (perm & !S_IFMT))
            .with_size(size)
            .with_owner(0, 0)
            .with_times(now, now)
    }
}

/// In-memory filesystem backend.
///
/// Thread-safe via internal `RwLock`. Paths are interpreted lexically from
/// `/`; `..` never climbs above the root.
#[derive(Debug)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<PathBuf, Entry>>,
    credentials: Option<Credentials>,
    open_handles: Arc<AtomicUsize>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create an empty filesystem.
    ///
    /// Every login is refused until [`MemoryBackend::with_credentials`]
    /// configures a username/password pair.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        // Root directory always exists
        entries.insert(
            PathBuf::new(),
            Entry::Directory {
                attrs: Entry::fresh_attrs(S_IFDIR, DEFAULT_DIR_MODE, 0),
            },
        );
        Self {
            entries: RwLock::new(entries),
            credentials: None,
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Require this username/password pair.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Number of handles opened on this backend and not yet released.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    result.pop();
                }
                Component::Normal(s) => result.push(s),
            }
        }
        result
    }

    fn display(path: &Path) -> String {
        format!("/{}", path.display())
    }

    fn read_entries(&self) -> VfsResult<RwLockReadGuard<'_, HashMap<PathBuf, Entry>>> {
        self.entries
            .read()
            .map_err(|_| VfsError::other("lock poisoned"))
    }

    fn write_entries(&self) -> VfsResult<RwLockWriteGuard<'_, HashMap<PathBuf, Entry>>> {
        self.entries
            .write()
            .map_err(|_| VfsError::other("lock poisoned"))
    }

    /// Follow symlinks until a non-link (or missing) path is reached.
    fn follow(entries: &HashMap<PathBuf, Entry>, path: PathBuf) -> VfsResult<PathBuf> {
        let mut current = path;
        for _ in 0..MAX_SYMLINK_HOPS {
            match entries.get(&current) {
                Some(Entry::Symlink { target, .. }) => {
                    let base = current.parent().map(Path::to_path_buf).unwrap_or_default();
                    current = Self::normalize(&base.join(target));
                }
                _ => return Ok(current),
            }
        }
        Err(VfsError::other(format!(
            "too many levels of symbolic links: {}",
            Self::display(&current)
        )))
    }

    /// The parent of `path` must exist and be a directory.
    fn check_parent(entries: &HashMap<PathBuf, Entry>, path: &Path) -> VfsResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| VfsError::permission_denied("cannot replace root"))?;
        match entries.get(parent) {
            Some(Entry::Directory { .. }) => Ok(()),
            Some(_) => Err(VfsError::not_a_directory(Self::display(parent))),
            None => Err(VfsError::no_such_file(Self::display(parent))),
        }
    }

    /// Grow or shrink file contents, zero-filling any gap.
    fn resize(data: &mut Vec<u8>, size: u64) -> VfsResult<()> {
        if size > MAX_FILE_SIZE {
            return Err(VfsError::other(format!(
                "file size {size} exceeds the {MAX_FILE_SIZE} byte limit"
            )));
        }
        let size = usize::try_from(size)
            .map_err(|_| VfsError::other(format!("file size {size} does not fit in memory")))?;
        if size > data.len() {
            data.try_reserve(size - data.len())
                .map_err(|e| VfsError::other(format!("cannot grow file: {e}")))?;
        }
        data.resize(size, 0);
        Ok(())
    }

    fn apply_attrs(entry: &mut Entry, attrs: &Attributes) -> VfsResult<()> {
        if let Some(size) = attrs.size {
            match entry {
                Entry::File { data, attrs } => {
                    Self::resize(data, size)?;
                    attrs.size = Some(size);
                }
                _ => return Err(VfsError::other("size can only be set on regular files")),
            }
        }

        let current = entry.attrs_mut();
        if let Some(perm) = attrs.permissions() {
            let kind = current.mode.unwrap_or(0) & S_IFMT;
            current.mode = Some(kind | perm);
        }
        if let Some(uid) = attrs.uid {
            current.uid = Some(uid);
        }
        if let Some(gid) = attrs.gid {
            current.gid = Some(gid);
        }
        if let Some(atime) = attrs.atime {
            current.atime = Some(atime);
        }
        if let Some(mtime) = attrs.mtime {
            current.mtime = Some(mtime);
        }
        Ok(())
    }

    fn track_handle(&self, handle: &Handle) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        let counter = self.open_handles.clone();
        handle.add_disposable(move || async move {
            counter.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
    }
}

#[async_trait]
impl FileSystem for MemoryBackend {
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
        {
            let mut entries = self.write_entries()?;
            let path = Self::follow(&entries, Self::normalize(Path::new(handle.path())))?;

            if !entries.contains_key(&path) {
                if !flags.create {
                    return Err(VfsError::no_such_file(Self::display(&path)));
                }
                Self::check_parent(&entries, &path)?;
                let perm = attrs.permissions().unwrap_or(DEFAULT_FILE_MODE);
                let mut created = Entry::File {
                    data: Vec::new(),
                    attrs: Entry::fresh_attrs(S_IFREG, perm, 0),
                };
                Self::apply_attrs(&mut created, &attrs.ownership_and_times())?;
                entries.insert(path, created);
            } else {
                match entries.get_mut(&path) {
                    Some(Entry::Directory { .. }) => {
                        return Err(VfsError::is_a_directory(Self::display(&path)));
                    }
                    Some(_) if flags.create && flags.exclusive => {
                        return Err(VfsError::already_exists(Self::display(&path)));
                    }
                    Some(Entry::File { data, attrs }) => {
                        if flags.truncate {
                            data.clear();
                            attrs.size = Some(0);
                            attrs.mtime = Some(now_secs());
                        }
                    }
                    // follow() only stops on a symlink when the hop limit is hit
                    Some(Entry::Symlink { .. }) | None => {
                        return Err(VfsError::no_such_file(Self::display(&path)));
                    }
                }
            }
        }

        if flags.append {
            handle.set_param(params::APPEND, ParamValue::Flag(true));
        }
        self.track_handle(handle);
        Ok(())
    }

    async fn read(
        &self,
        _session: &ClientSession,
        handle: &Handle,
        offset: u64,
        len: u32,
    ) -> VfsResult<Option<Vec<u8>>> {
        let entries = self.read_entries()?;
        let path = Self::follow(&entries, Self::normalize(Path::new(handle.path())))?;

        match entries.get(&path) {
            Some(Entry::File { data, .. }) => {
                if offset >= data.len() as u64 {
                    return Ok(None);
                }
                let start = offset as usize;
                let end = start.saturating_add(len as usize).min(data.len());
                Ok(Some(data[start..end].to_vec()))
            }
            Some(_) => Err(VfsError::is_a_directory(Self::display(&path))),
            None => Err(VfsError::no_such_file(Self::display(&path))),
        }
    }

    async fn write(
        &self,
        _session: &ClientSession,
        handle: &Handle,
        offset: u64,
        data: &[u8],
    ) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let path = Self::follow(&entries, Self::normalize(Path::new(handle.path())))?;

        match entries.get_mut(&path) {
            Some(Entry::File {
                data: file_data,
                attrs,
            }) => {
                let offset = if handle.flag(params::APPEND) {
                    file_data.len() as u64
                } else {
                    offset
                };
                let end = offset
                    .checked_add(data.len() as u64)
                    .ok_or_else(|| VfsError::other(format!("write at offset {offset} overflows")))?;
                if end > file_data.len() as u64 {
                    Self::resize(file_data, end)?;
                }
                // Both bounds are within the resized buffer.
                let start = offset as usize;
                file_data[start..start + data.len()].copy_from_slice(data);
                attrs.size = Some(file_data.len() as u64);
                attrs.mtime = Some(now_secs());
                Ok(())
            }
            Some(_) => Err(VfsError::is_a_directory(Self::display(&path))),
            None => Err(VfsError::no_such_file(Self::display(&path))),
        }
    }

    async fn opendir(&self, _session: &ClientSession, handle: &Handle) -> VfsResult<()> {
        {
            let entries = self.read_entries()?;
            let path = Self::follow(&entries, Self::normalize(Path::new(handle.path())))?;
            match entries.get(&path) {
                Some(Entry::Directory { .. }) => {}
                Some(_) => return Err(VfsError::not_a_directory(Self::display(&path))),
                None => return Err(VfsError::no_such_file(Self::display(&path))),
            }
        }

        self.track_handle(handle);
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

        let entries = self.read_entries()?;
        let dir = Self::follow(&entries, Self::normalize(Path::new(handle.path())))?;

        let mut listing = Vec::new();
        for (entry_path, entry) in entries.iter() {
            if entry_path.parent() != Some(dir.as_path()) {
                continue;
            }
            if let Some(name) = entry_path.file_name() {
                let name = name.to_string_lossy().into_owned();
                let attrs = entry.attrs().clone();
                listing.push(DirEntry::new(name.clone(), longname(&name, &attrs, 1), attrs));
            }
        }

        // Sort for consistent ordering
        listing.sort_by(|a, b| a.filename.cmp(&b.filename));
        handle.set_param(params::EOF, ParamValue::Flag(true));
        Ok(Some(listing))
    }

    async fn stat(&self, _session: &ClientSession, path: &str) -> VfsResult<Attributes> {
        let entries = self.read_entries()?;
        let path = Self::follow(&entries, Self::normalize(Path::new(path)))?;
        entries
            .get(&path)
            .map(|e| e.attrs().clone())
            .ok_or_else(|| VfsError::no_such_file(Self::display(&path)))
    }

    async fn lstat(&self, _session: &ClientSession, path: &str) -> VfsResult<Attributes> {
        let entries = self.read_entries()?;
        let path = Self::normalize(Path::new(path));
        entries
            .get(&path)
            .map(|e| e.attrs().clone())
            .ok_or_else(|| VfsError::no_such_file(Self::display(&path)))
    }

    async fn setstat(
        &self,
        _session: &ClientSession,
        path: &str,
        attrs: &Attributes,
    ) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let path = Self::follow(&entries, Self::normalize(Path::new(path)))?;
        let entry = entries
            .get_mut(&path)
            .ok_or_else(|| VfsError::no_such_file(Self::display(&path)))?;
        Self::apply_attrs(entry, attrs)
    }

    async fn mkdir(&self, _session: &ClientSession, path: &str, attrs: &Attributes) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let path = Self::normalize(Path::new(path));

        if entries.contains_key(&path) {
            return Err(VfsError::already_exists(Self::display(&path)));
        }
        Self::check_parent(&entries, &path)?;

        let perm = attrs.permissions().unwrap_or(DEFAULT_DIR_MODE);
        let mut dir = Entry::Directory {
            attrs: Entry::fresh_attrs(S_IFDIR, perm, 0),
        };
        Self::apply_attrs(&mut dir, &attrs.ownership_and_times())?;
        entries.insert(path, dir);
        Ok(())
    }

    async fn remove(&self, _session: &ClientSession, path: &str) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let path = Self::normalize(Path::new(path));

        match entries.get(&path) {
            Some(Entry::Directory { .. }) => Err(VfsError::is_a_directory(Self::display(&path))),
            Some(_) => {
                entries.remove(&path);
                Ok(())
            }
            None => Err(VfsError::no_such_file(Self::display(&path))),
        }
    }

    async fn rmdir(&self, _session: &ClientSession, path: &str) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let path = Self::normalize(Path::new(path));

        if path.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        match entries.get(&path) {
            Some(Entry::Directory { .. }) => {}
            Some(_) => return Err(VfsError::not_a_directory(Self::display(&path))),
            None => return Err(VfsError::no_such_file(Self::display(&path))),
        }

        if entries.keys().any(|k| k.parent() == Some(path.as_path())) {
            return Err(VfsError::directory_not_empty(Self::display(&path)));
        }

        entries.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _session: &ClientSession,
        old_path: &str,
        new_path: &str,
    ) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let from = Self::normalize(Path::new(old_path));
        let to = Self::normalize(Path::new(new_path));

        if from.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot rename root"));
        }
        if !entries.contains_key(&from) {
            return Err(VfsError::no_such_file(Self::display(&from)));
        }
        if from == to {
            return Ok(());
        }
        if to.starts_with(&from) {
            return Err(VfsError::other(format!(
                "cannot move {} into itself",
                Self::display(&from)
            )));
        }
        Self::check_parent(&entries, &to)?;
        if let Some(Entry::Directory { .. }) = entries.get(&to) {
            return Err(VfsError::already_exists(Self::display(&to)));
        }

        // Move the entry and, for directories, everything beneath it.
        let moved: Vec<PathBuf> = entries
            .keys()
            .filter(|k| k.starts_with(&from))
            .cloned()
            .collect();
        for old in moved {
            if let (Some(entry), Ok(relative)) = (entries.remove(&old), old.strip_prefix(&from)) {
                let target = if relative.as_os_str().is_empty() {
                    to.clone()
                } else {
                    to.join(relative)
                };
                entries.insert(target, entry);
            }
        }
        Ok(())
    }

    async fn symlink(
        &self,
        _session: &ClientSession,
        target_path: &str,
        link_path: &str,
    ) -> VfsResult<()> {
        let mut entries = self.write_entries()?;
        let link = Self::normalize(Path::new(link_path));

        if entries.contains_key(&link) {
            return Err(VfsError::already_exists(Self::display(&link)));
        }
        Self::check_parent(&entries, &link)?;

        entries.insert(
            link,
            Entry::Symlink {
                target: target_path.to_string(),
                attrs: Entry::fresh_attrs(S_IFLNK, 0o777, target_path.len() as u64),
            },
        );
        Ok(())
    }

    async fn readlink(&self, _session: &ClientSession, path: &str) -> VfsResult<String> {
        let entries = self.read_entries()?;
        let path = Self::normalize(Path::new(path));

        match entries.get(&path) {
            Some(Entry::Symlink { target, .. }) => Ok(target.clone()),
            Some(_) => Err(VfsError::other(format!(
                "not a symlink: {}",
                Self::display(&path)
            ))),
            None => Err(VfsError::no_such_file(Self::display(&path))),
        }
    }

    async fn realpath(&self, _session: &ClientSession, path: &str) -> VfsResult<String> {
        Ok(Self::display(&Self::normalize(Path::new(path))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{HandleIdAllocator, HandleKind};
    use crate::vfs::StatusCode;

    struct Fixture {
        fs: MemoryBackend,
        session: ClientSession,
        alloc: HandleIdAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                fs: MemoryBackend::new(),
                session: ClientSession::new("test", None),
                alloc: HandleIdAllocator::new(),
            }
        }

        fn handle(&self, kind: HandleKind, path: &str) -> Handle {
            Handle::new(kind, path, self.alloc.allocate().unwrap())
        }

        async fn put(&self, path: &str, data: &[u8]) {
            let h = self.handle(HandleKind::File, path);
            self.fs
                .open(&self.session, &h, OpenFlags::create_truncate(), &Attributes::new())
                .await
                .unwrap();
            self.fs.write(&self.session, &h, 0, data).await.unwrap();
            h.release().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_write_then_read_until_eof() {
        let fx = Fixture::new();
        fx.put("/hello.txt", b"hello world").await;

        let h = fx.handle(HandleKind::File, "/hello.txt");
        fx.fs
            .open(&fx.session, &h, OpenFlags::read_only(), &Attributes::new())
            .await
            .unwrap();

        let data = fx.fs.read(&fx.session, &h, 6, 100).await.unwrap();
        assert_eq!(data.as_deref(), Some(&b"world"[..]));

        assert_eq!(fx.fs.read(&fx.session, &h, 11, 10).await.unwrap(), None);
        assert_eq!(fx.fs.read(&fx.session, &h, 500, 10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_missing_without_create_fails() {
        let fx = Fixture::new();
        let h = fx.handle(HandleKind::File, "/nope");
        let err = fx
            .fs
            .open(&fx.session, &h, OpenFlags::read_only(), &Attributes::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NoSuchFile);
        assert_eq!(fx.fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_create_rejects_existing() {
        let fx = Fixture::new();
        fx.put("/a", b"x").await;

        let h = fx.handle(HandleKind::File, "/a");
        let flags = OpenFlags::from_bits(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE);
        let err = fx
            .fs
            .open(&fx.session, &h, flags, &Attributes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_append_ignores_offset() {
        let fx = Fixture::new();
        fx.put("/log", b"one").await;

        let h = fx.handle(HandleKind::File, "/log");
        let flags = OpenFlags::from_bits(OpenFlags::WRITE | OpenFlags::APPEND);
        fx.fs
            .open(&fx.session, &h, flags, &Attributes::new())
            .await
            .unwrap();
        fx.fs.write(&fx.session, &h, 0, b"two").await.unwrap();

        let attrs = fx.fs.stat(&fx.session, "/log").await.unwrap();
        assert_eq!(attrs.size, Some(6));
    }

    #[tokio::test]
    async fn test_oversized_write_fails_and_backend_stays_usable() {
        let fx = Fixture::new();
        fx.put("/f", b"abc").await;

        let h = fx.handle(HandleKind::File, "/f");
        fx.fs
            .open(&fx.session, &h, OpenFlags::create_write(), &Attributes::new())
            .await
            .unwrap();

        for offset in [u64::MAX - 2, 1 << 40, MAX_FILE_SIZE] {
            let err = fx.fs.write(&fx.session, &h, offset, b"xyz").await.unwrap_err();
            assert_eq!(err.status(), StatusCode::Failure);
        }

        // Nothing changed and the lock is still healthy.
        let attrs = fx.fs.stat(&fx.session, "/f").await.unwrap();
        assert_eq!(attrs.size, Some(3));
        fx.fs.write(&fx.session, &h, 3, b"def").await.unwrap();
        assert_eq!(fx.fs.stat(&fx.session, "/f").await.unwrap().size, Some(6));
    }

    #[tokio::test]
    async fn test_oversized_setstat_size_fails() {
        let fx = Fixture::new();
        fx.put("/f", b"abc").await;

        for size in [u64::MAX, MAX_FILE_SIZE + 1] {
            let err = fx
                .fs
                .setstat(&fx.session, "/f", &Attributes::new().with_size(size).with_mode(0o600))
                .await
                .unwrap_err();
            assert_eq!(err.status(), StatusCode::Failure);
        }

        let attrs = fx.fs.stat(&fx.session, "/f").await.unwrap();
        assert_eq!(attrs.size, Some(3));
        assert_ne!(attrs.permissions(), Some(0o600));

        fx.fs
            .setstat(&fx.session, "/f", &Attributes::new().with_size(8))
            .await
            .unwrap();
        assert_eq!(fx.fs.stat(&fx.session, "/f").await.unwrap().size, Some(8));
    }

    #[tokio::test]
    async fn test_listdir_is_single_shot() {
        let fx = Fixture::new();
        fx.fs
            .mkdir(&fx.session, "/d", &Attributes::new())
            .await
            .unwrap();
        fx.put("/d/b", b"").await;
        fx.put("/d/a", b"").await;

        let h = fx.handle(HandleKind::Directory, "/d");
        fx.fs.opendir(&fx.session, &h).await.unwrap();

        let first = fx.fs.listdir(&fx.session, &h).await.unwrap().unwrap();
        let names: Vec<_> = first.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(first[0].longname.ends_with(" a"));

        assert!(fx.fs.listdir(&fx.session, &h).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_opendir_on_file_fails() {
        let fx = Fixture::new();
        fx.put("/f", b"").await;
        let h = fx.handle(HandleKind::Directory, "/f");
        let err = fx.fs.opendir(&fx.session, &h).await.unwrap_err();
        assert!(matches!(err, VfsError::NotADirectory(_)));
    }

    #[tokio::test]
    async fn test_setstat_applies_only_given_fields() {
        let fx = Fixture::new();
        fx.put("/f", b"abc").await;
        fx.fs
            .setstat(
                &fx.session,
                "/f",
                &Attributes::new().with_owner(10, 20).with_times(100, 200),
            )
            .await
            .unwrap();
        let before = fx.fs.stat(&fx.session, "/f").await.unwrap();

        fx.fs
            .setstat(&fx.session, "/f", &Attributes::new().with_mode(0o600))
            .await
            .unwrap();
        let after = fx.fs.stat(&fx.session, "/f").await.unwrap();
        assert_eq!(after.mode, Some(S_IFREG | 0o600));
        assert_eq!((after.uid, after.gid), (before.uid, before.gid));
        assert_eq!((after.atime, after.mtime), (Some(100), Some(200)));

        fx.fs
            .setstat(&fx.session, "/f", &Attributes { uid: Some(7), ..Default::default() })
            .await
            .unwrap();
        let owned = fx.fs.stat(&fx.session, "/f").await.unwrap();
        assert_eq!(owned.uid, Some(7));
        assert_eq!(owned.gid, Some(20));
        assert_eq!(owned.mode, Some(S_IFREG | 0o600));
        assert_eq!(owned.mtime, Some(200));
    }

    #[tokio::test]
    async fn test_mkdir_applies_mode_owner_and_times() {
        let fx = Fixture::new();
        let attrs = Attributes::new()
            .with_mode(0o700)
            .with_owner(5, 6)
            .with_times(1, 2);
        fx.fs.mkdir(&fx.session, "/m", &attrs).await.unwrap();

        let got = fx.fs.stat(&fx.session, "/m").await.unwrap();
        assert_eq!(got.mode, Some(S_IFDIR | 0o700));
        assert_eq!((got.uid, got.gid), (Some(5), Some(6)));
        assert_eq!((got.atime, got.mtime), (Some(1), Some(2)));

        let err = fx.fs.mkdir(&fx.session, "/m", &attrs).await.unwrap_err();
        assert!(matches!(err, VfsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_rmdir_requires_empty_directory() {
        let fx = Fixture::new();
        fx.fs
            .mkdir(&fx.session, "/d", &Attributes::new())
            .await
            .unwrap();
        fx.put("/d/x", b"").await;

        let err = fx.fs.rmdir(&fx.session, "/d").await.unwrap_err();
        assert!(matches!(err, VfsError::DirectoryNotEmpty(_)));

        fx.fs.remove(&fx.session, "/d/x").await.unwrap();
        fx.fs.rmdir(&fx.session, "/d").await.unwrap();
        assert!(fx.fs.stat(&fx.session, "/d").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_moves_children() {
        let fx = Fixture::new();
        fx.fs
            .mkdir(&fx.session, "/src", &Attributes::new())
            .await
            .unwrap();
        fx.put("/src/file", b"data").await;

        fx.fs.rename(&fx.session, "/src", "/dst").await.unwrap();
        assert!(fx.fs.stat(&fx.session, "/src").await.is_err());
        let moved = fx.fs.stat(&fx.session, "/dst/file").await.unwrap();
        assert_eq!(moved.size, Some(4));
    }

    #[tokio::test]
    async fn test_symlink_stat_lstat_readlink() {
        let fx = Fixture::new();
        fx.put("/target", b"12345").await;
        fx.fs
            .symlink(&fx.session, "target", "/link")
            .await
            .unwrap();

        let followed = fx.fs.stat(&fx.session, "/link").await.unwrap();
        assert_eq!(followed.size, Some(5));
        let own = fx.fs.lstat(&fx.session, "/link").await.unwrap();
        assert_eq!(own.mode.map(|m| m & S_IFMT), Some(S_IFLNK));
        assert_eq!(fx.fs.readlink(&fx.session, "/link").await.unwrap(), "target");
    }

    #[tokio::test]
    async fn test_realpath_is_lexical() {
        let fx = Fixture::new();
        assert_eq!(fx.fs.realpath(&fx.session, ".").await.unwrap(), "/");
        assert_eq!(fx.fs.realpath(&fx.session, "/a/../b/./c").await.unwrap(), "/b/c");
        assert_eq!(fx.fs.realpath(&fx.session, "/../..").await.unwrap(), "/");
    }

    #[tokio::test]
    async fn test_release_runs_backend_cleanup() {
        let fx = Fixture::new();
        let h = fx.handle(HandleKind::File, "/f");
        fx.fs
            .open(&fx.session, &h, OpenFlags::create_write(), &Attributes::new())
            .await
            .unwrap();
        assert_eq!(fx.fs.open_handles(), 1);

        h.release().await.unwrap();
        assert_eq!(fx.fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_authenticate_with_credentials() {
        let fs = MemoryBackend::new().with_credentials(Credentials::new("amy", "pw"));
        let session = ClientSession::default();

        assert_eq!(
            fs.authenticate(&session, &AuthRequest::password("amy", "pw"))
                .await
                .unwrap(),
            AuthOutcome::Accepted
        );
        assert!(fs
            .authenticate(&session, &AuthRequest::password("amy", "bad"))
            .await
            .is_err());

        // No configured pair: nobody gets in, whatever the method.
        let unconfigured = MemoryBackend::new();
        for request in [AuthRequest::none("anyone"), AuthRequest::password("amy", "pw")] {
            let err = unconfigured.authenticate(&session, &request).await.unwrap_err();
            assert_eq!(err.status(), StatusCode::PermissionDenied);
        }
    }
}
