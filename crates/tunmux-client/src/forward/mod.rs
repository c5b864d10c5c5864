//! Local socket bridges
//!
//! A bridge owns a local TCP listener and relays every accepted connection
//! to the remote agent: `PortForwarder` over a logical tunnel per connection,
//! `SocksRelay` over a shared SOCKS relay stream.

pub mod port;
pub mod socks;

pub use port::PortForwarder;
pub use socks::SocksRelay;

use crate::registry::MuxError;
use crate::rpc::{Credentials, RpcError};
use crate::tunnel::TunnelError;
use std::net::SocketAddr;
use thiserror::Error;
use tunmux_connection::TransportError;
use tunmux_proto::{ForwarderId, SessionId};

/// Forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Invalid remote address: {0}")]
    InvalidRemoteAddress(String),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// What a forwarder relays to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwarderKind {
    /// TCP port-forward to `remote_addr` (host:port) on the remote side
    PortForward { remote_addr: String },
    /// SOCKS5 proxy served by the remote side
    Socks5 { credentials: Credentials },
}

impl ForwarderKind {
    pub fn forwarder_type(&self) -> ForwarderType {
        match self {
            ForwarderKind::PortForward { .. } => ForwarderType::PortForward,
            ForwarderKind::Socks5 { .. } => ForwarderType::Socks5,
        }
    }
}

/// Forwarder kind without its parameters, for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForwarderType {
    PortForward,
    Socks5,
}

/// Snapshot of a registered forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderInfo {
    pub id: ForwarderId,
    pub session_id: SessionId,
    pub bind_addr: SocketAddr,
    pub kind: ForwarderKind,
}

/// A running local listener bridged to the remote side
pub trait Bridge: Send + Sync {
    fn session_id(&self) -> &str;

    /// Address the listener is bound to
    fn local_addr(&self) -> SocketAddr;

    fn kind(&self) -> ForwarderKind;

    /// Stop accepting connections
    ///
    /// With `close_active` the bridged connections are torn down as well;
    /// otherwise they drain on their own. Idempotent, and a later call with
    /// `close_active` still tears down what is left.
    fn close(&self, close_active: bool);

    /// Whether the listener has stopped
    fn is_closed(&self) -> bool;
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn parse_host_port(address: &str) -> Result<(String, u16), ForwardError> {
    let invalid = || ForwardError::InvalidRemoteAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}
