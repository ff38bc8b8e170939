//! Server lifecycle: authentication, connection registry, events.
//!
//! The [`Server`] is transport-agnostic. The SSH adapter feeds it
//! authentication attempts, new SFTP channels, drain signals and
//! disconnects; everything else happens on the [`Connection`]s it owns.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use sftpfs_kernel::{
    AuthMethod, AuthOutcome, AuthRequest, ClientSession, FileSystem, HandleIdAllocator, StatusCode,
};

use crate::actions;
use crate::config::HandleScope;
use crate::connection::{Connection, ConnectionId};

/// Lifecycle events broadcast to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        id: ConnectionId,
        username: Option<String>,
    },
    ClientDisconnected {
        id: ConnectionId,
    },
    Error {
        id: Option<ConnectionId>,
        message: String,
    },
}

/// What the transport should do with an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Accept,
    /// Refuse this method; these may still succeed.
    Retry(Vec<AuthMethod>),
    Reject,
}

pub struct Server {
    fs: Arc<dyn FileSystem>,
    allocator: HandleIdAllocator,
    scope: HandleScope,
    connections: Mutex<IndexMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<ServerEvent>,
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(fs: Arc<dyn FileSystem>, scope: HandleScope) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            fs,
            allocator: HandleIdAllocator::new(),
            scope,
            connections: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Ask the backend about one attempt.
    ///
    /// Any backend error rejects the client; only PERMISSION_DENIED is the
    /// expected kind, anything else is also reported as a server error.
    pub async fn authenticate(&self, session: &ClientSession, request: &AuthRequest) -> AuthDecision {
        match self.fs.authenticate(session, request).await {
            Ok(AuthOutcome::Accepted) => {
                tracing::info!(user = %request.username, method = request.method.as_str(), "authenticated");
                AuthDecision::Accept
            }
            Ok(AuthOutcome::TryMethods(methods)) => {
                tracing::debug!(user = %request.username, method = request.method.as_str(), "method refused");
                AuthDecision::Retry(methods)
            }
            Err(e) => {
                tracing::warn!(user = %request.username, method = request.method.as_str(), "authentication rejected: {}", e);
                if e.status() != StatusCode::PermissionDenied {
                    self.on_error(None, format!("authenticate: {e}"));
                }
                AuthDecision::Reject
            }
        }
    }

    /// Build a connection for a freshly opened SFTP channel.
    ///
    /// The caller attaches the outbound stream before feeding requests.
    pub fn create_connection(&self, session: ClientSession) -> Arc<Connection> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let allocator = match self.scope {
            HandleScope::Shared => self.allocator.clone(),
            HandleScope::Connection => HandleIdAllocator::new(),
        };

        let username = session.username.clone();
        let connection = Arc::new(Connection::new(id, session, allocator));
        actions::register(&connection, self.fs.clone());
        self.connections.lock().insert(id, connection.clone());

        tracing::debug!(connection = %id, user = ?username, "connection created");
        let _ = self.events.send(ServerEvent::ClientConnected { id, username });
        connection
    }

    /// Drain signal from the transport.
    pub fn on_continue(&self, id: ConnectionId) {
        if let Some(connection) = self.connection(id) {
            connection.resume();
        }
    }

    /// Transport-level failure. Does not close anything.
    pub fn on_error(&self, id: Option<ConnectionId>, message: impl Into<String>) {
        let message = message.into();
        match id {
            Some(id) => tracing::error!(connection = %id, "{}", message),
            None => tracing::error!("{}", message),
        }
        let _ = self.events.send(ServerEvent::Error { id, message });
    }

    /// Tear down a connection: release its handles and end its transport.
    ///
    /// A no-op for ids already gone.
    pub async fn destroy_connection(&self, id: ConnectionId) {
        let Some(connection) = self.connections.lock().shift_remove(&id) else {
            return;
        };

        if let Err(e) = connection.close().await {
            self.on_error(Some(id), format!("handle release failed during teardown: {e}"));
        }
        tracing::debug!(connection = %id, "connection destroyed");
        let _ = self.events.send(ServerEvent::ClientDisconnected { id });
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// The process-wide allocator (used by every connection in shared scope).
    pub fn allocator(&self) -> &HandleIdAllocator {
        &self.allocator
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Close every connection, then signal listeners to stop.
    pub async fn stop(&self) {
        let ids: Vec<ConnectionId> = self.connections.lock().keys().copied().collect();
        tracing::info!(connections = ids.len(), "stopping server");
        for id in ids {
            self.destroy_connection(id).await;
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sftpfs_kernel::{Credentials, MemoryBackend};

    fn server(scope: HandleScope) -> Server {
        let fs = MemoryBackend::new().with_credentials(Credentials::new("amy", "secret"));
        Server::new(Arc::new(fs), scope)
    }

    #[tokio::test]
    async fn test_authenticate_decisions() {
        let server = server(HandleScope::Shared);
        let session = ClientSession::anonymous(None);

        let ok = server
            .authenticate(&session, &AuthRequest::password("amy", "secret"))
            .await;
        assert_eq!(ok, AuthDecision::Accept);

        let wrong = server
            .authenticate(&session, &AuthRequest::password("x", "wrong"))
            .await;
        assert_eq!(wrong, AuthDecision::Reject);

        let none = server.authenticate(&session, &AuthRequest::none("amy")).await;
        assert_eq!(none, AuthDecision::Retry(vec![AuthMethod::Password]));
    }

    #[tokio::test]
    async fn test_connection_lifecycle_events() {
        let server = server(HandleScope::Shared);
        let mut events = server.subscribe();

        let conn = server.create_connection(ClientSession::new("amy", None));
        let id = conn.id();
        assert_eq!(server.connection_count(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ServerEvent::ClientConnected {
                id,
                username: Some("amy".into())
            }
        );

        server.destroy_connection(id).await;
        assert_eq!(server.connection_count(), 0);
        assert!(conn.is_closed());
        assert_eq!(events.recv().await.unwrap(), ServerEvent::ClientDisconnected { id });

        // Second teardown is silent.
        server.destroy_connection(id).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_scope() {
        let shared = server(HandleScope::Shared);
        let a = shared.create_connection(ClientSession::default());
        let b = shared.create_connection(ClientSession::default());
        let ha = a.create_file_handle("/x").unwrap();
        let hb = b.create_file_handle("/y").unwrap();
        assert_ne!(ha.id(), hb.id());
        assert_eq!(shared.allocator().live_count(), 2);

        let isolated = server(HandleScope::Connection);
        let c = isolated.create_connection(ClientSession::default());
        let d = isolated.create_connection(ClientSession::default());
        let hc = c.create_file_handle("/x").unwrap();
        let hd = d.create_file_handle("/y").unwrap();
        assert_eq!(hc.id(), hd.id());
        assert_eq!(isolated.allocator().live_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_everything() {
        let server = server(HandleScope::Shared);
        let a = server.create_connection(ClientSession::default());
        let b = server.create_connection(ClientSession::default());
        a.create_file_handle("/x").unwrap();

        server.stop().await;
        assert_eq!(server.connection_count(), 0);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(a.handle_count(), 0);
        assert!(server.shutdown_token().is_cancelled());
    }
}
