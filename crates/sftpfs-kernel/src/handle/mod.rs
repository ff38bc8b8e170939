//! Open file and directory handles.
//!
//! A [`Handle`] is what an `open` or `opendir` request produces. The
//! dispatcher creates it (allocating an id) before the backend sees it; the
//! backend then stores whatever private state it needs in the parameter bag
//! and registers cleanup actions. Releasing the handle returns the id and
//! runs those cleanups, in registration order, exactly once.
//!
//! ```ignore
//! handle.set_param(params::DESCRIPTOR, ParamValue::File(Arc::new(file)));
//! handle.add_disposable(move || async move { Ok(()) });
//! ```

mod id;

pub use id::{HANDLE_TOKEN_LEN, HandleId, HandleIdAllocator, HandleLease};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::vfs::VfsResult;

/// Well-known parameter names used by the bundled backends.
pub mod params {
    /// Set once a directory listing has been returned in full.
    pub const EOF: &str = "eof";
    /// Native descriptor backing a file handle.
    pub const DESCRIPTOR: &str = "file";
    /// Every write lands at end of file.
    pub const APPEND: &str = "append";
}

/// What a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    File,
    Directory,
}

/// Backend-private value stored on a handle.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Flag(bool),
    Number(u64),
    Text(String),
    File(Arc<std::fs::File>),
}

/// Cleanup action run on release.
pub type Disposable = Box<dyn FnOnce() -> BoxFuture<'static, VfsResult<()>> + Send>;

/// One open file or directory.
pub struct Handle {
    kind: HandleKind,
    path: String,
    lease: HandleLease,
    params: Mutex<HashMap<&'static str, ParamValue>>,
    disposables: Mutex<Vec<Disposable>>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.lease.id())
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("disposables", &self.disposables.lock().len())
            .finish()
    }
}

impl Handle {
    /// Build a handle around an already reserved id.
    pub fn new(kind: HandleKind, path: impl Into<String>, lease: HandleLease) -> Self {
        Self {
            kind,
            path: path.into(),
            lease,
            params: Mutex::new(HashMap::new()),
            disposables: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> HandleId {
        self.lease.id()
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store a parameter, replacing any previous value.
    pub fn set_param(&self, name: &'static str, value: ParamValue) {
        self.params.lock().insert(name, value);
    }

    /// Read a parameter. Absent keys read as `None`.
    pub fn param(&self, name: &str) -> Option<ParamValue> {
        self.params.lock().get(name).cloned()
    }

    /// Read a boolean parameter; unset reads as false.
    pub fn flag(&self, name: &str) -> bool {
        matches!(self.param(name), Some(ParamValue::Flag(true)))
    }

    /// The native descriptor stored under [`params::DESCRIPTOR`], if any.
    pub fn file(&self) -> Option<Arc<std::fs::File>> {
        match self.param(params::DESCRIPTOR) {
            Some(ParamValue::File(file)) => Some(file),
            _ => None,
        }
    }

    /// Register a cleanup action to run when the handle is released.
    pub fn add_disposable<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = VfsResult<()>> + Send + 'static,
    {
        self.disposables
            .lock()
            .push(Box::new(move || Box::pin(f()) as BoxFuture<'static, _>));
    }

    /// Returns true once [`Handle::release`] has started.
    pub fn is_released(&self) -> bool {
        self.lease.is_released()
    }

    /// Return the id, then run every disposable in registration order.
    ///
    /// A failing disposable does not stop the ones after it; the first
    /// error is returned once all have run. Calling this twice is harmless:
    /// the second call finds nothing left to run.
    pub async fn release(&self) -> VfsResult<()> {
        self.lease.release();

        let disposables = std::mem::take(&mut *self.disposables.lock());
        let mut first_error = None;
        for dispose in disposables {
            if let Err(e) = dispose().await {
                tracing::warn!(handle = %self.id(), path = %self.path, "disposable failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        // Drops any descriptor the backend parked here.
        self.params.lock().clear();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
