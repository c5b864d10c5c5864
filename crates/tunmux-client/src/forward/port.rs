//! TCP port-forward bridge
//!
//! Listens locally; every accepted connection gets its own logical tunnel,
//! bound on the remote side to the forward's destination.

use super::{parse_host_port, Bridge, ForwardError, ForwarderKind};
use crate::registry::{MuxError, TunnelRegistry};
use crate::rpc::TunnelRpc;
use crate::tunnel::{LogicalTunnel, TunnelError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunmux_proto::SessionId;

struct PortForwardContext {
    session_id: SessionId,
    remote_addr: String,
    remote_host: String,
    remote_port: u16,
    registry: TunnelRegistry,
    rpc: Arc<dyn TunnelRpc>,
    active: AtomicUsize,
}

/// Local TCP listener forwarding connections through tunnels
pub struct PortForwarder {
    context: Arc<PortForwardContext>,
    local_addr: SocketAddr,
    /// Stops the accept loop
    listener: CancellationToken,
    /// Parent of every bridged connection's token
    connections: CancellationToken,
}

impl PortForwarder {
    /// Bind `bind_addr` and start forwarding accepted connections to
    /// `remote_addr` (host:port, resolved on the remote side)
    pub async fn listen(
        bind_addr: &str,
        remote_addr: &str,
        session_id: impl Into<SessionId>,
        registry: TunnelRegistry,
        rpc: Arc<dyn TunnelRpc>,
    ) -> Result<Self, ForwardError> {
        let (remote_host, remote_port) = parse_host_port(remote_addr)?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ForwardError::Bind {
                address: bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(PortForwardContext {
            session_id: session_id.into(),
            remote_addr: remote_addr.to_string(),
            remote_host,
            remote_port,
            registry,
            rpc,
            active: AtomicUsize::new(0),
        });

        info!(
            session_id = %context.session_id,
            local_addr = %local_addr,
            remote_addr = %context.remote_addr,
            "Port forward listening"
        );

        let stop_listener = CancellationToken::new();
        let connections = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            context.clone(),
            stop_listener.clone(),
            connections.clone(),
        ));

        Ok(Self {
            context,
            local_addr,
            listener: stop_listener,
            connections,
        })
    }

    pub fn remote_addr(&self) -> &str {
        &self.context.remote_addr
    }

    /// Number of connections currently bridged
    pub fn active_connections(&self) -> usize {
        self.context.active.load(Ordering::Relaxed)
    }
}

impl Bridge for PortForwarder {
    fn session_id(&self) -> &str {
        &self.context.session_id
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn kind(&self) -> ForwarderKind {
        ForwarderKind::PortForward {
            remote_addr: self.context.remote_addr.clone(),
        }
    }

    fn close(&self, close_active: bool) {
        if !self.listener.is_cancelled() {
            info!(
                local_addr = %self.local_addr,
                close_active = close_active,
                active_connections = self.active_connections(),
                "Closing port forward"
            );
            self.listener.cancel();
        }
        if close_active && !self.connections.is_cancelled() {
            self.connections.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.listener.is_cancelled()
    }
}

impl Drop for PortForwarder {
    fn drop(&mut self) {
        self.listener.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<PortForwardContext>,
    stop: CancellationToken,
    connections: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "Accepted port forward connection");
                tokio::spawn(handle_connection(
                    context.clone(),
                    socket,
                    peer_addr,
                    connections.child_token(),
                ));
            }
            Err(e) => {
                warn!("Failed to accept port forward connection: {}", e);
            }
        }
    }

    debug!(remote_addr = %context.remote_addr, "Port forward listener stopped");
}

/// Create a tunnel and bind it to the destination, within the dial timeout
///
/// A tunnel registered before a failed bind is closed again.
async fn open_bound_tunnel(context: &PortForwardContext) -> Result<Arc<LogicalTunnel>, MuxError> {
    let dial_timeout = context.registry.config().dial_timeout;
    let deadline = Instant::now() + dial_timeout;

    let create = context.rpc.create_tunnel(&context.session_id);
    let tunnel_id = tokio::time::timeout_at(deadline, create)
        .await
        .map_err(|_| MuxError::Timeout(dial_timeout))??;

    let tunnel = context
        .registry
        .start(tunnel_id, context.session_id.clone())?;

    let bind = context.rpc.bind_port_forward(
        &context.session_id,
        tunnel_id,
        &context.remote_host,
        context.remote_port,
    );
    match tokio::time::timeout_at(deadline, bind).await {
        Ok(Ok(())) => Ok(tunnel),
        Ok(Err(e)) => {
            context.registry.close(tunnel_id);
            Err(e.into())
        }
        Err(_) => {
            context.registry.close(tunnel_id);
            Err(MuxError::Timeout(dial_timeout))
        }
    }
}

async fn handle_connection(
    context: Arc<PortForwardContext>,
    socket: TcpStream,
    peer_addr: SocketAddr,
    shutdown: CancellationToken,
) {
    // Not raced against shutdown: a half-created tunnel must be released
    let tunnel = match open_bound_tunnel(&context).await {
        Ok(tunnel) => tunnel,
        Err(e) => {
            warn!(
                peer_addr = %peer_addr,
                remote_addr = %context.remote_addr,
                "Failed to open tunnel, dropping connection: {}",
                e
            );
            return;
        }
    };
    let tunnel_id = tunnel.id();

    if shutdown.is_cancelled() {
        context.registry.close(tunnel_id);
        return;
    }

    context.active.fetch_add(1, Ordering::Relaxed);
    let chunk_size = context.registry.config().read_chunk_size;

    match bridge(socket, &tunnel, chunk_size, &shutdown).await {
        Ok(direction) => debug!(
            tunnel_id = tunnel_id,
            peer_addr = %peer_addr,
            bytes_sent = tunnel.stats().bytes_sent,
            bytes_received = tunnel.stats().bytes_received,
            "Port forward connection finished ({})",
            direction
        ),
        Err(e) => debug!(
            tunnel_id = tunnel_id,
            peer_addr = %peer_addr,
            "Port forward connection failed: {}",
            e
        ),
    }

    context.registry.close(tunnel_id);
    context.active.fetch_sub(1, Ordering::Relaxed);
}

/// Relay between the socket and the tunnel until either side stops
///
/// Returns which side ended the relay. The socket is closed on return.
async fn bridge(
    socket: TcpStream,
    tunnel: &LogicalTunnel,
    chunk_size: usize,
    shutdown: &CancellationToken,
) -> Result<&'static str, ForwardError> {
    let (mut socket_read, mut socket_write) = socket.into_split();

    let result = tokio::select! {
        result = copy_socket_to_tunnel(&mut socket_read, tunnel, chunk_size) => result,
        result = copy_tunnel_to_socket(tunnel, &mut socket_write, chunk_size) => result,
        _ = shutdown.cancelled() => Ok("forwarder closed"),
    };

    let _ = socket_write.shutdown().await;
    result
}

async fn copy_socket_to_tunnel(
    socket: &mut OwnedReadHalf,
    tunnel: &LogicalTunnel,
    chunk_size: usize,
) -> Result<&'static str, ForwardError> {
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let n = socket.read(&mut buffer).await?;
        if n == 0 {
            return Ok("local closed");
        }
        tunnel.write(&buffer[..n]).await?;
    }
}

async fn copy_tunnel_to_socket(
    tunnel: &LogicalTunnel,
    socket: &mut OwnedWriteHalf,
    chunk_size: usize,
) -> Result<&'static str, ForwardError> {
    let mut buffer = vec![0u8; chunk_size];
    loop {
        let n = match tunnel.read(&mut buffer).await {
            Ok(n) => n,
            Err(TunnelError::Eof(_)) => return Ok("remote closed"),
            Err(e) => return Err(e.into()),
        };
        socket.write_all(&buffer[..n]).await?;
    }
}
