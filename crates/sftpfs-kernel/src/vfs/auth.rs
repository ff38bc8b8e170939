//! Authentication hook types.
//!
//! Authentication is part of the backend contract: the transport hands every
//! attempt to [`FileSystem::authenticate`](super::FileSystem::authenticate)
//! and acts on the [`AuthOutcome`]. [`Credentials`] is the single
//! username/password check the bundled backends use.

use std::net::SocketAddr;

use super::error::{VfsError, VfsResult};

/// Per-connection data visible to backend operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSession {
    /// Username the client authenticated as, once accepted.
    pub username: Option<String>,
    /// Remote address, when the transport knows it.
    pub peer_addr: Option<SocketAddr>,
}

impl ClientSession {
    pub fn new(username: impl Into<String>, peer_addr: Option<SocketAddr>) -> Self {
        Self {
            username: Some(username.into()),
            peer_addr,
        }
    }

    /// A session for an unauthenticated peer.
    pub fn anonymous(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            username: None,
            peer_addr,
        }
    }
}

/// SSH user-authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    None,
    Password,
    PublicKey,
}

impl AuthMethod {
    /// The method name as it appears in SSH_MSG_USERAUTH_REQUEST.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
        }
    }
}

/// One authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub username: String,
    pub method: AuthMethod,
    pub password: Option<String>,
    /// SHA-256 fingerprint of the offered key, for `publickey` attempts.
    pub key_fingerprint: Option<String>,
}

impl AuthRequest {
    pub fn none(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: AuthMethod::None,
            password: None,
            key_fingerprint: None,
        }
    }

    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: AuthMethod::Password,
            password: Some(password.into()),
            key_fingerprint: None,
        }
    }

    pub fn public_key(username: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            method: AuthMethod::PublicKey,
            password: None,
            key_fingerprint: Some(fingerprint.into()),
        }
    }
}

/// What the backend decided about an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The client is in.
    Accepted,
    /// Not this method; the client may retry with one of these.
    TryMethods(Vec<AuthMethod>),
}

/// A single accepted username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Accept only `password` attempts with a matching pair.
    ///
    /// Other methods are steered to `password`; a wrong pair is denied.
    pub fn check(&self, request: &AuthRequest) -> VfsResult<AuthOutcome> {
        if request.method != AuthMethod::Password {
            return Ok(AuthOutcome::TryMethods(vec![AuthMethod::Password]));
        }

        let password_matches = request.password.as_deref() == Some(self.password.as_str());
        if request.username == self.username && password_matches {
            Ok(AuthOutcome::Accepted)
        } else {
            Err(VfsError::permission_denied(format!(
                "authentication failed for {}",
                request.username
            )))
        }
    }
}
