//! SSH transport for sftpfs
//!
//! Accepts SSH connections, hands authentication to the [`Server`], and runs
//! the SFTP protocol over any session channel that requests the `sftp`
//! subsystem.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use russh::keys::{HashAlg, ssh_key};
use russh::server::{self, Auth, Msg, Server as _, Session};
use russh::{Channel, ChannelId, ChannelStream, MethodKind, MethodSet};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use sftpfs_kernel::{AuthMethod, AuthRequest, Attributes, ClientSession, DirEntry, StatusCode};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::constants::{SFTP_SUBSYSTEM, SFTP_VERSION, SINK_HIGH_WATER, SINK_LOW_WATER};
use crate::protocol::ResponseSink;
use crate::server::{AuthDecision, Server};
use crate::wire::{self, Inbound, WireError};

/// SSH listener in front of a [`Server`].
pub struct SshServer {
    config: ServerConfig,
    server: Arc<Server>,
}

impl SshServer {
    pub fn new(config: ServerConfig, server: Arc<Server>) -> Self {
        Self { config, server }
    }

    /// Bind the configured address.
    pub async fn listen(&self) -> Result<TcpListener, std::io::Error> {
        TcpListener::bind(self.config.bind_addr).await
    }

    /// Run the SSH server until the [`Server`] is stopped.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let socket = self.listen().await?;
        self.serve(socket).await
    }

    /// Accept connections on an already-bound socket.
    pub async fn serve(&self, socket: TcpListener) -> Result<(), std::io::Error> {
        let config = russh::server::Config {
            auth_rejection_time: self.config.auth_rejection_delay,
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![self.config.host_key.clone()],
            ..Default::default()
        };

        if let Ok(addr) = socket.local_addr() {
            log::info!("Starting SSH server on {}", addr);
        }

        let mut factory = ClientFactory {
            server: self.server.clone(),
        };
        let shutdown = self.server.shutdown_token();

        tokio::select! {
            result = factory.run_on_socket(Arc::new(config), &socket) => {
                result.map_err(std::io::Error::other)
            }
            _ = shutdown.cancelled() => {
                log::info!("SSH server stopped");
                Ok(())
            }
        }
    }
}

/// Creates a handler per TCP connection.
struct ClientFactory {
    server: Arc<Server>,
}

impl server::Server for ClientFactory {
    type Handler = ClientHandler;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        log::debug!("New SSH client from {:?}", peer_addr);
        ClientHandler {
            server: self.server.clone(),
            peer_addr,
            username: None,
            channels: HashMap::new(),
            sftp: HashMap::new(),
        }
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        log::error!("Session error: {:?}", error);
        self.server.on_error(None, format!("ssh session: {error}"));
    }
}

/// Handler for a single SSH connection.
struct ClientHandler {
    server: Arc<Server>,
    peer_addr: Option<SocketAddr>,
    username: Option<String>,
    /// Session channels not yet bound to a subsystem.
    channels: HashMap<ChannelId, Channel<Msg>>,
    /// Channels running SFTP.
    sftp: HashMap<ChannelId, ConnectionId>,
}

impl ClientHandler {
    async fn check(&mut self, request: AuthRequest) -> Result<Auth, russh::Error> {
        let session = ClientSession::anonymous(self.peer_addr);
        match self.server.authenticate(&session, &request).await {
            AuthDecision::Accept => {
                self.username = Some(request.username);
                Ok(Auth::Accept)
            }
            AuthDecision::Retry(methods) => Ok(Auth::Reject {
                proceed_with_methods: Some(method_set(&methods)),
                partial_success: false,
            }),
            AuthDecision::Reject => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    fn end_channel(&mut self, channel: ChannelId) {
        self.channels.remove(&channel);
        if let Some(id) = self.sftp.remove(&channel) {
            let server = self.server.clone();
            tokio::spawn(async move { server.destroy_connection(id).await });
        }
    }
}

fn method_set(methods: &[AuthMethod]) -> MethodSet {
    let kinds: Vec<MethodKind> = methods
        .iter()
        .map(|method| match method {
            AuthMethod::None => MethodKind::None,
            AuthMethod::Password => MethodKind::Password,
            AuthMethod::PublicKey => MethodKind::PublicKey,
        })
        .collect();
    MethodSet::from(kinds.as_slice())
}

impl server::Handler for ClientHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.check(AuthRequest::none(user)).await
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        log::info!("Password auth attempt from user: {}", user);
        self.check(AuthRequest::password(user, password)).await
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
        log::info!("Public key auth attempt from user: {} ({})", user, fingerprint);
        self.check(AuthRequest::public_key(user, fingerprint)).await
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        log::debug!("Channel {} opened", channel.id());
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != SFTP_SUBSYSTEM {
            log::warn!("Unsupported subsystem on channel {}: {}", channel_id, name);
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            log::warn!("Subsystem request on unknown channel {}", channel_id);
            session.channel_failure(channel_id)?;
            return Ok(());
        };
        session.channel_success(channel_id)?;

        let client = ClientSession {
            username: self.username.clone(),
            peer_addr: self.peer_addr,
        };
        let connection = self.server.create_connection(client);
        self.sftp.insert(channel_id, connection.id());

        let (reader, writer) = tokio::io::split(channel.into_stream());
        let sink = ChannelSink::spawn(writer, self.server.clone(), &connection);
        connection.attach_stream(sink.clone());

        log::info!("SFTP session {} started on channel {}", connection.id(), channel_id);
        tokio::spawn(serve_sftp(self.server.clone(), connection, reader, sink));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        log::debug!("Channel {} EOF", channel);
        self.end_channel(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        log::debug!("Channel {} closed", channel);
        self.end_channel(channel);
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let ids: Vec<ConnectionId> = self.sftp.drain().map(|(_, id)| id).collect();
        if ids.is_empty() {
            return;
        }
        // Drop can run after the runtime is gone.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let server = self.server.clone();
        runtime.spawn(async move {
            for id in ids {
                server.destroy_connection(id).await;
            }
        });
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Response sink over an SSH channel.
///
/// Packets go to a writer task through an unbounded queue; the queued byte
/// count is the backpressure signal. A push that reaches the high-water mark
/// reports saturation, and the writer emits continue once it drains to the
/// low-water mark.
struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
    saturated: Arc<AtomicBool>,
}

impl ChannelSink {
    fn spawn(
        writer: WriteHalf<ChannelStream<Msg>>,
        server: Arc<Server>,
        connection: &Connection,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let saturated = Arc::new(AtomicBool::new(false));

        let drain = Drain {
            queued: queued.clone(),
            saturated: saturated.clone(),
            server,
            connection: connection.id(),
        };
        tokio::spawn(write_loop(rx, writer, drain, connection.shutdown_token()));

        Arc::new(Self {
            tx,
            queued,
            saturated,
        })
    }

    fn push(&self, packet: Bytes) -> bool {
        let len = packet.len();
        let queued = self.queued.fetch_add(len, Ordering::SeqCst) + len;
        if self.tx.send(packet).is_err() {
            // Writer gone: the connection is being torn down.
            self.queued.fetch_sub(len, Ordering::SeqCst);
            return true;
        }
        if queued < SINK_HIGH_WATER {
            return true;
        }

        self.saturated.store(true, Ordering::SeqCst);
        // Whoever clears `saturated` owns the continue. If the writer drained
        // before seeing the flag, take it back and keep going.
        if self.queued.load(Ordering::SeqCst) <= SINK_LOW_WATER
            && self.saturated.swap(false, Ordering::SeqCst)
        {
            return true;
        }
        false
    }
}

impl ResponseSink for ChannelSink {
    fn status(&self, id: u32, code: StatusCode, message: &str) -> bool {
        self.push(wire::encode_status(id, code, message))
    }

    fn handle(&self, id: u32, token: &[u8]) -> bool {
        self.push(wire::encode_handle(id, token))
    }

    fn data(&self, id: u32, data: &[u8]) -> bool {
        self.push(wire::encode_data(id, data))
    }

    fn attrs(&self, id: u32, attrs: &Attributes) -> bool {
        self.push(wire::encode_attrs(id, attrs))
    }

    fn name(&self, id: u32, entries: &[DirEntry]) -> bool {
        self.push(wire::encode_name(id, entries))
    }
}

struct Drain {
    queued: Arc<AtomicUsize>,
    saturated: Arc<AtomicBool>,
    server: Arc<Server>,
    connection: ConnectionId,
}

impl Drain {
    fn written(&self, len: usize) {
        let remaining = self.queued.fetch_sub(len, Ordering::SeqCst) - len;
        if remaining <= SINK_LOW_WATER && self.saturated.swap(false, Ordering::SeqCst) {
            self.server.on_continue(self.connection);
        }
    }
}

async fn write_loop(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: WriteHalf<ChannelStream<Msg>>,
    drain: Drain,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => packet,
            _ = shutdown.cancelled() => None,
        };
        let Some(packet) = packet else { break };

        let result = async {
            writer.write_all(&packet).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            log::debug!("SFTP write on {} failed: {}", drain.connection, e);
            break;
        }
        drain.written(packet.len());
    }

    let _ = writer.shutdown().await;
    log::debug!("SFTP writer for {} finished", drain.connection);
}

// ============================================================================
// Inbound
// ============================================================================

/// Read, decode and dispatch packets until EOF or teardown.
async fn serve_sftp(
    server: Arc<Server>,
    connection: Arc<Connection>,
    mut reader: ReadHalf<ChannelStream<Msg>>,
    sink: Arc<ChannelSink>,
) {
    let id = connection.id();
    let shutdown = connection.shutdown_token();

    loop {
        let packet = tokio::select! {
            packet = wire::read_packet(&mut reader) => packet,
            _ = shutdown.cancelled() => break,
        };

        let inbound = match packet {
            Ok(None) => {
                log::debug!("SFTP stream for {} reached EOF", id);
                break;
            }
            Ok(Some(body)) => wire::decode(body),
            Err(e) => Err(e),
        };

        match inbound {
            Ok(Inbound::Init(version)) => {
                log::debug!("{} INIT version {}", id, version);
                sink.push(wire::encode_version(SFTP_VERSION));
            }
            Ok(Inbound::Request(request)) => {
                tokio::spawn(connection.clone().dispatch(request));
            }
            Ok(Inbound::Unsupported { id: request_id, kind }) => {
                log::debug!("{} unsupported packet type {}", id, kind);
                reply_status(&connection, request_id, StatusCode::OpUnsupported, "");
            }
            Err(e) => {
                if !on_wire_error(&server, &connection, e) {
                    break;
                }
            }
        }
    }

    server.destroy_connection(id).await;
}

/// Returns false when the stream is unusable.
fn on_wire_error(server: &Server, connection: &Arc<Connection>, error: WireError) -> bool {
    if error.is_fatal() {
        server.on_error(Some(connection.id()), format!("sftp stream: {error}"));
        return false;
    }

    match error.request_id() {
        Some(request_id) => {
            log::warn!("{} bad request {}: {}", connection.id(), request_id, error);
            reply_status(connection, request_id, StatusCode::BadMessage, &error.to_string());
        }
        None => log::warn!("{} dropped malformed packet: {}", connection.id(), error),
    }
    true
}

fn reply_status(connection: &Arc<Connection>, request_id: u32, code: StatusCode, message: &str) {
    let connection = connection.clone();
    let message = message.to_string();
    tokio::spawn(async move {
        connection
            .respond(|s| s.status(request_id, code, &message))
            .await;
    });
}
