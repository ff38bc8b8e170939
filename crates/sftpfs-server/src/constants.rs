//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

use std::time::Duration;

/// Default SSH port for the SFTP server.
pub const DEFAULT_PORT: u16 = 8022;

/// Default bind address (localhost only for security).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// SSH authentication rejection delay (prevents timing attacks).
pub const SSH_AUTH_REJECTION_DELAY: Duration = Duration::from_secs(1);

/// The only SFTP protocol version spoken.
pub const SFTP_VERSION: u32 = 3;

/// Subsystem name clients request on a session channel.
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Largest READ the server will satisfy in one DATA reply.
pub const MAX_READ_LEN: u32 = 256 * 1024;

/// Largest inbound packet body accepted (a full WRITE plus headers).
pub const MAX_PACKET_LEN: u32 = MAX_READ_LEN + 1024;

/// Queued outbound bytes at which the sink reports saturation.
pub const SINK_HIGH_WATER: usize = 256 * 1024;

/// Queued outbound bytes at which a saturated sink signals continue.
pub const SINK_LOW_WATER: usize = 64 * 1024;
