//! Remote-side calls the multiplexer depends on
//!
//! The RPC transport itself lives outside this crate; it is consumed through
//! the `TunnelRpc` trait.

use async_trait::async_trait;
use thiserror::Error;
use tunmux_proto::TunnelId;

/// Errors reported by the RPC collaborator
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Remote rejected request: {0}")]
    Rejected(String),

    #[error("RPC transport error: {0}")]
    Transport(String),
}

/// SOCKS5 credentials the remote side should enforce
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Unary calls made against the remote side
#[async_trait]
pub trait TunnelRpc: Send + Sync {
    /// Create a tunnel in the given session and return its ID
    async fn create_tunnel(&self, session_id: &str) -> Result<TunnelId, RpcError>;

    /// Bind a tunnel to a destination reachable from the remote agent
    async fn bind_port_forward(
        &self,
        session_id: &str,
        tunnel_id: TunnelId,
        host: &str,
        port: u16,
    ) -> Result<(), RpcError>;

    /// Bind a tunnel to a SOCKS5 session on the remote agent
    async fn bind_socks_session(
        &self,
        session_id: &str,
        tunnel_id: TunnelId,
        credentials: &Credentials,
    ) -> Result<(), RpcError>;
}
