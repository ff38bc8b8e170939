//! Command-line and runtime configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use clap::{Parser, ValueEnum};
use russh::keys::PrivateKey;

use crate::constants::{DEFAULT_BIND_ADDRESS, DEFAULT_PORT, SSH_AUTH_REJECTION_DELAY};

/// Where connections draw handle ids from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum HandleScope {
    /// One allocator for the whole process.
    #[default]
    Shared,
    /// Each connection numbers its handles from 1.
    Connection,
}

/// Storage behind the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum BackendKind {
    /// Local disk, confined to `--root`.
    #[default]
    Local,
    /// Ephemeral in-memory tree.
    Memory,
}

/// sftpfs-server - SFTP over SSH, backed by a pluggable filesystem
#[derive(Debug, Parser)]
#[command(name = "sftpfs-server", version, about)]
pub struct Cli {
    /// SSH listen port
    #[arg(long, env = "SFTPFS_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "SFTPFS_BIND", default_value = DEFAULT_BIND_ADDRESS)]
    pub bind: IpAddr,

    /// OpenSSH private key file; an ephemeral Ed25519 key is generated when absent
    #[arg(long, env = "SFTPFS_HOST_KEY")]
    pub host_key: Option<PathBuf>,

    /// Accepted username
    #[arg(long, env = "SFTPFS_USERNAME", default_value_t = whoami::username())]
    pub username: String,

    /// Accepted password
    #[arg(long, env = "SFTPFS_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Directory served by the local backend
    #[arg(long, env = "SFTPFS_ROOT", default_value = "/")]
    pub root: PathBuf,

    /// Storage backend
    #[arg(long, env = "SFTPFS_BACKEND", value_enum, default_value = "local")]
    pub backend: BackendKind,

    /// Handle id numbering scope
    #[arg(long, env = "SFTPFS_HANDLE_SCOPE", value_enum, default_value = "shared")]
    pub handle_scope: HandleScope,
}

/// Runtime configuration for the SSH listener.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub host_key: PrivateKey,
    pub handle_scope: HandleScope,
    /// Delay before a failed authentication attempt is answered.
    pub auth_rejection_delay: Duration,
}

impl ServerConfig {
    /// Localhost config with a freshly generated host key (for testing).
    ///
    /// Port 0 lets the OS pick.
    pub fn ephemeral(port: u16) -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], port)),
            host_key: generate_host_key()?,
            handle_scope: HandleScope::default(),
            auth_rejection_delay: Duration::ZERO,
        })
    }

    pub fn from_cli(cli: &Cli) -> anyhow::Result<Self> {
        let host_key = match &cli.host_key {
            Some(path) => russh::keys::load_secret_key(path, None)
                .map_err(|e| anyhow!("failed to load host key {}: {}", path.display(), e))?,
            None => {
                tracing::warn!("no host key configured, generating an ephemeral one");
                generate_host_key()?
            }
        };

        Ok(Self {
            bind_addr: SocketAddr::new(cli.bind, cli.port),
            host_key,
            handle_scope: cli.handle_scope,
            auth_rejection_delay: SSH_AUTH_REJECTION_DELAY,
        })
    }
}

fn generate_host_key() -> anyhow::Result<PrivateKey> {
    PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
        .map_err(|e| anyhow!("failed to generate host key: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "sftpfs-server",
            "--password",
            "hunter2",
            "--port",
            "2222",
            "--username",
            "amy",
            "--backend",
            "memory",
            "--handle-scope",
            "connection",
        ])
        .unwrap();
        assert_eq!(cli.port, 2222);
        assert_eq!(cli.username, "amy");
        assert_eq!(cli.password, "hunter2");
        assert_eq!(cli.backend, BackendKind::Memory);
        assert_eq!(cli.handle_scope, HandleScope::Connection);
    }

    #[test]
    fn test_ephemeral_config() {
        let config = ServerConfig::ephemeral(0).unwrap();
        assert_eq!(config.bind_addr.port(), 0);
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.handle_scope, HandleScope::Shared);
    }
}
