//! Per-client SFTP state.
//!
//! A [`Connection`] owns one client's handle table, its dispatch table and
//! the flow-control gate every reply passes through. Requests are
//! dispatched concurrently (one task each); replies are serialized by the
//! gate, which closes when the transport reports its outbound buffer is
//! saturated and reopens on the transport's continue signal.

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use sftpfs_kernel::handle::{Handle, HandleId, HandleIdAllocator, HandleKind};
use sftpfs_kernel::{ClientSession, StatusCode, VfsError, VfsResult};

use crate::protocol::{Request, RequestKind, ResponseSink};

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Writes a typed payload; returns the sink's "can take more" answer.
pub type Responder = Box<dyn FnOnce(&dyn ResponseSink) -> bool + Send>;

/// What an action produced.
pub enum Reply {
    /// Success with no payload: STATUS OK.
    Done,
    /// A bare status, e.g. EOF.
    Status(StatusCode),
    /// A typed payload (handle, data, attrs, name).
    Respond(Responder),
}

impl Reply {
    pub fn respond<F>(f: F) -> Self
    where
        F: FnOnce(&dyn ResponseSink) -> bool + Send + 'static,
    {
        Reply::Respond(Box::new(f))
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Done => f.write_str("Done"),
            Reply::Status(code) => write!(f, "Status({code:?})"),
            Reply::Respond(_) => f.write_str("Respond(..)"),
        }
    }
}

/// A registered request handler.
pub type Action =
    Arc<dyn Fn(Arc<Connection>, Request) -> BoxFuture<'static, VfsResult<Reply>> + Send + Sync>;

// ============================================================================
// Flow-control gate
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct GateState {
    open: bool,
    /// Bumped on every reopen; a close only lands if this is unchanged.
    resumes: u64,
}

/// Single-slot continuation gate.
///
/// Responders queue on a fair mutex, so they pass in the order they
/// arrived at the gate. A responder that reports saturation closes the
/// gate unless a continue already landed while it was writing.
pub struct FlowGate {
    state: watch::Sender<GateState>,
    turn: tokio::sync::Mutex<()>,
}

impl Default for FlowGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState {
            open: true,
            resumes: 0,
        });
        Self {
            state,
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait for the gate, run `f`, close the gate if `f` returns false.
    pub async fn pass<F>(&self, f: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let _turn = self.turn.lock().await;

        let mut rx = self.state.subscribe();
        let epoch = match rx.wait_for(|s| s.open).await {
            Ok(state) => state.resumes,
            // Unreachable while `self` holds the sender.
            Err(_) => return false,
        };

        let more = f();
        if !more {
            self.state.send_modify(|s| {
                if s.resumes == epoch {
                    s.open = false;
                }
            });
        }
        more
    }

    /// Continue signal: open the gate and cancel any close in flight.
    pub fn reopen(&self) {
        self.state.send_modify(|s| {
            s.open = true;
            s.resumes = s.resumes.wrapping_add(1);
        });
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Live handles in creation order. Once `closed` is set nothing new enters.
#[derive(Default)]
struct HandleTable {
    entries: IndexMap<HandleId, Arc<Handle>>,
    closed: bool,
}

/// One client's SFTP session state.
pub struct Connection {
    id: ConnectionId,
    session: ClientSession,
    handles: Mutex<HandleTable>,
    actions: RwLock<HashMap<RequestKind, Action>>,
    gate: FlowGate,
    sink: RwLock<Option<Arc<dyn ResponseSink>>>,
    allocator: HandleIdAllocator,
    shutdown: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("handles", &self.handles.lock().entries.len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Connection {
    pub fn new(id: ConnectionId, session: ClientSession, allocator: HandleIdAllocator) -> Self {
        Self {
            id,
            session,
            handles: Mutex::new(HandleTable::default()),
            actions: RwLock::new(HashMap::new()),
            gate: FlowGate::new(),
            sink: RwLock::new(None),
            allocator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    /// Register the handler for one request type, replacing any previous one.
    pub fn add_action<F, Fut>(&self, kind: RequestKind, f: F)
    where
        F: Fn(Arc<Connection>, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = VfsResult<Reply>> + Send + 'static,
    {
        let action: Action = Arc::new(
            move |conn: Arc<Connection>, req: Request| -> BoxFuture<'static, VfsResult<Reply>> {
                Box::pin(f(conn, req))
            },
        );
        self.actions.write().insert(kind, action);
    }

    pub fn has_action(&self, kind: RequestKind) -> bool {
        self.actions.read().contains_key(&kind)
    }

    /// Bind the outbound stream replies are written to.
    pub fn attach_stream(&self, sink: Arc<dyn ResponseSink>) {
        *self.sink.write() = Some(sink);
    }

    /// The single path replies take to the transport.
    ///
    /// Waits for the gate, then runs `f` against the attached sink.
    pub async fn respond<F>(&self, f: F) -> bool
    where
        F: FnOnce(&dyn ResponseSink) -> bool,
    {
        let Some(sink) = self.sink.read().clone() else {
            tracing::warn!(connection = %self.id, "reply dropped: no stream attached");
            return false;
        };
        self.gate.pass(|| f(sink.as_ref())).await
    }

    /// Run one request through its action and write the reply.
    pub async fn dispatch(self: Arc<Self>, request: Request) {
        let id = request.id();
        let kind = request.kind();
        tracing::debug!(connection = %self.id, id, request = %kind, "dispatch");

        let action = self.actions.read().get(&kind).cloned();
        let result = match action {
            Some(action) => action(self.clone(), request).await,
            None => Err(VfsError::unsupported(kind.as_str())),
        };

        match result {
            Ok(Reply::Done) => self.respond(|s| s.status(id, StatusCode::Ok, "")).await,
            Ok(Reply::Status(code)) => self.respond(|s| s.status(id, code, "")).await,
            Ok(Reply::Respond(write)) => self.respond(write).await,
            Err(e) => {
                let code = e.status();
                if code == StatusCode::Eof {
                    tracing::debug!(connection = %self.id, id, request = %kind, "eof");
                } else {
                    tracing::warn!(connection = %self.id, id, request = %kind, "request failed: {}", e);
                }
                let message = e.to_string();
                self.respond(move |s| s.status(id, code, &message)).await
            }
        };
    }

    /// Transport drained: let waiting replies through.
    pub fn resume(&self) {
        tracing::trace!(connection = %self.id, "continue");
        self.gate.reopen();
    }

    /// True while the gate is closed.
    pub fn is_paused(&self) -> bool {
        !self.gate.is_open()
    }

    pub fn create_file_handle(&self, path: impl Into<String>) -> VfsResult<Arc<Handle>> {
        self.create_handle(HandleKind::File, path.into())
    }

    pub fn create_directory_handle(&self, path: impl Into<String>) -> VfsResult<Arc<Handle>> {
        self.create_handle(HandleKind::Directory, path.into())
    }

    fn create_handle(&self, kind: HandleKind, path: String) -> VfsResult<Arc<Handle>> {
        let handle = {
            let mut table = self.handles.lock();
            if table.closed {
                return Err(VfsError::other("connection closed"));
            }
            let lease = self.allocator.allocate()?;
            let handle = Arc::new(Handle::new(kind, path, lease));
            table.entries.insert(handle.id(), handle.clone());
            handle
        };
        tracing::debug!(connection = %self.id, handle = %handle.id(), kind = ?kind, path = handle.path(), "handle created");
        Ok(handle)
    }

    /// Look up a live handle by its wire token.
    pub fn handle(&self, token: &[u8]) -> VfsResult<Arc<Handle>> {
        let id = HandleId::decode(token)?;
        self.handles
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or(VfsError::InvalidHandle(id.get()))
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().entries.len()
    }

    /// Remove a handle and release it.
    ///
    /// The handle leaves the table even when a disposable fails.
    pub async fn destroy_handle(&self, id: HandleId) -> VfsResult<()> {
        let handle = self
            .handles
            .lock()
            .entries
            .shift_remove(&id)
            .ok_or(VfsError::InvalidHandle(id.get()))?;
        tracing::debug!(connection = %self.id, handle = %id, "handle destroyed");
        handle.release().await
    }

    /// Tear down after a failed `open`/`opendir`: the handle must not survive.
    pub async fn discard_handle(&self, handle: &Handle) {
        self.handles.lock().entries.shift_remove(&handle.id());
        if let Err(e) = handle.release().await {
            tracing::warn!(connection = %self.id, handle = %handle.id(), "cleanup after failed open: {}", e);
        }
    }

    /// Confirm a handle once the backend has finished opening it.
    ///
    /// If the handle left the table while the backend was working (the
    /// connection closed, or the client closed a guessed token), the earlier
    /// release could not see the disposables registered since. Release again
    /// so they run, and fail the open.
    pub async fn activate_handle(&self, handle: &Handle) -> VfsResult<()> {
        if self.handles.lock().entries.contains_key(&handle.id()) {
            return Ok(());
        }

        tracing::debug!(connection = %self.id, handle = %handle.id(), "handle dropped while opening");
        if let Err(e) = handle.release().await {
            tracing::warn!(connection = %self.id, handle = %handle.id(), "cleanup after abandoned open: {}", e);
        }
        Err(VfsError::other(format!("{} was closed while opening", handle.path())))
    }

    /// Release every live handle in insertion order, then end the transport.
    ///
    /// Every handle is released even if an earlier one fails; the first
    /// failure is returned.
    pub async fn close(&self) -> VfsResult<()> {
        let handles: Vec<Arc<Handle>> = {
            let mut table = self.handles.lock();
            table.closed = true;
            table.entries.drain(..).map(|(_, handle)| handle).collect()
        };

        let mut first_error = None;
        for handle in handles {
            if let Err(e) = handle.release().await {
                tracing::warn!(connection = %self.id, handle = %handle.id(), "release failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        self.shutdown.cancel();
        // Responders still queued at the gate drain into the dead sink.
        self.gate.reopen();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Fires once [`Connection::close`] has finished releasing handles.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
