//! sftpfs server binary
//!
//! SSH + SFTP server over a local directory or an in-memory tree.
//!
//! ## Usage
//!
//! ```bash
//! # Serve ~/shared on the default port
//! sftpfs-server --root ~/shared --password hunter2
//!
//! # Scratch server backed by memory
//! SFTPFS_PASSWORD=hunter2 sftpfs-server --backend memory --port 2222
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sftpfs_kernel::{Credentials, FileSystem, LocalBackend, MemoryBackend};
use sftpfs_server::{BackendKind, Cli, Server, ServerConfig, ServerEvent, SshServer};
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = match ServerConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let credentials = Credentials::new(cli.username.clone(), cli.password.clone());
    let fs: Arc<dyn FileSystem> = match cli.backend {
        BackendKind::Local => {
            let backend = LocalBackend::new(&cli.root).with_credentials(credentials);
            tracing::info!("Serving {} for user {}", backend.root().display(), cli.username);
            Arc::new(backend)
        }
        BackendKind::Memory => {
            tracing::info!("Serving an in-memory tree for user {}", cli.username);
            Arc::new(MemoryBackend::new().with_credentials(credentials))
        }
    };

    let server = Arc::new(Server::new(fs, config.handle_scope));
    tokio::spawn(log_events(server.subscribe()));

    {
        let server = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                server.stop().await;
            }
        });
    }

    let ssh = SshServer::new(config, server);
    if let Err(e) = ssh.run().await {
        tracing::error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn log_events(mut events: broadcast::Receiver<ServerEvent>) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::ClientConnected { id, username }) => {
                tracing::info!(connection = %id, user = ?username, "client-connected");
            }
            Ok(ServerEvent::ClientDisconnected { id }) => {
                tracing::info!(connection = %id, "client-disconnected");
            }
            Ok(ServerEvent::Error { id, message }) => {
                tracing::error!(connection = ?id, "error: {}", message);
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("event log lagged, {} events missed", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
