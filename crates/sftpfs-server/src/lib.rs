//! sftpfs server library
//!
//! SFTP v3 over SSH in front of any [`sftpfs_kernel::FileSystem`].

pub mod actions;
pub mod config;
pub mod connection;
pub mod constants;
pub mod protocol;
pub mod server;
pub mod ssh;
pub mod wire;

pub use config::{BackendKind, Cli, HandleScope, ServerConfig};
pub use connection::{Connection, ConnectionId, FlowGate, Reply};
pub use protocol::{Request, RequestKind, ResponseSink};
pub use server::{AuthDecision, Server, ServerEvent};
pub use ssh::SshServer;
