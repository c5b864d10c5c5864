//! SOCKS5 relay bridge
//!
//! The SOCKS5 server runs on the remote agent; locally we only relay bytes.
//! Every accepted connection is assigned a correlation key by the remote side
//! and all connections share one `DuplexStream<SocksFrame>`:
//!
//! - fan-out: one task per connection reads the socket and sends frames
//!   tagged with the key, the next outbound sequence number and credentials
//! - fan-in: one task for the whole relay routes inbound frames to sockets
//!   through the connection pool
//!
//! Sequence numbers are checked for gaps and logged; frames are never
//! reordered since the stream is ordered.

use super::{Bridge, ForwardError, ForwarderKind};
use crate::config::MuxConfig;
use crate::registry::MuxError;
use crate::rpc::{Credentials, TunnelRpc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use tunmux_connection::DuplexStream;
use tunmux_proto::{SessionId, SocksFrame, TunnelId};

/// One local connection in the pool
struct PooledConnection {
    writer: Mutex<OwnedWriteHalf>,
    next_inbound_sequence: AtomicU64,
    closed_by_remote: AtomicBool,
    /// Stops this connection's fan-out task
    cancel: CancellationToken,
}

struct SocksContext {
    session_id: SessionId,
    credentials: Credentials,
    rpc: Arc<dyn TunnelRpc>,
    stream: DuplexStream<SocksFrame>,
    pool: RwLock<HashMap<TunnelId, Arc<PooledConnection>>>,
    /// Set once the listener is closed
    stopped: AtomicBool,
    /// Stops the accept loop
    listener: CancellationToken,
    /// Stops fan-in and every pooled connection
    shutdown: CancellationToken,
    config: MuxConfig,
}

impl SocksContext {
    fn pooled(&self, key: TunnelId) -> Option<Arc<PooledConnection>> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn insert(&self, key: TunnelId, connection: Arc<PooledConnection>) {
        self.pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, connection);
    }

    /// Remove a connection from the pool and stop its fan-out task
    ///
    /// The socket closes once both halves are dropped.
    fn evict(&self, key: TunnelId) -> Option<Arc<PooledConnection>> {
        let evicted = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        if let Some(connection) = &evicted {
            connection.cancel.cancel();
        }
        self.finish_if_drained();
        evicted
    }

    fn pool_len(&self) -> usize {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Once the listener is closed, the last connection leaving the pool
    /// shuts the relay down
    fn finish_if_drained(&self) {
        if self.is_stopped() && !self.shutdown.is_cancelled() && self.pool_len() == 0 {
            debug!(session_id = %self.session_id, "SOCKS5 relay drained");
            self.shutdown.cancel();
        }
    }

    fn evict_all(&self) -> usize {
        let drained: Vec<Arc<PooledConnection>> = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in &drained {
            connection.cancel.cancel();
        }
        drained.len()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn frame(&self, key: TunnelId, sequence: u64, data: Vec<u8>, closed: bool) -> SocksFrame {
        SocksFrame {
            tunnel_id: key,
            sequence,
            data,
            closed,
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
        }
    }
}

/// Local SOCKS5 listener relayed to the remote agent
pub struct SocksRelay {
    context: Arc<SocksContext>,
    local_addr: SocketAddr,
}

impl SocksRelay {
    /// Bind `bind_addr` and relay accepted connections over `stream`
    pub async fn listen(
        bind_addr: &str,
        session_id: impl Into<SessionId>,
        credentials: Credentials,
        stream: DuplexStream<SocksFrame>,
        rpc: Arc<dyn TunnelRpc>,
        config: MuxConfig,
    ) -> Result<Self, ForwardError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| ForwardError::Bind {
                address: bind_addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let context = Arc::new(SocksContext {
            session_id: session_id.into(),
            credentials,
            rpc,
            stream,
            pool: RwLock::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            listener: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            config,
        });

        info!(
            session_id = %context.session_id,
            local_addr = %local_addr,
            "SOCKS5 relay listening"
        );

        tokio::spawn(accept_loop(listener, context.clone()));
        tokio::spawn(fan_in(context.clone()));

        Ok(Self {
            context,
            local_addr,
        })
    }

    /// Number of connections currently in the pool
    pub fn active_connections(&self) -> usize {
        self.context.pool_len()
    }
}

impl Bridge for SocksRelay {
    fn session_id(&self) -> &str {
        &self.context.session_id
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn kind(&self) -> ForwarderKind {
        ForwarderKind::Socks5 {
            credentials: self.context.credentials.clone(),
        }
    }

    fn close(&self, close_active: bool) {
        let already_stopped = self.context.stopped.swap(true, Ordering::AcqRel);
        self.context.listener.cancel();

        if close_active {
            self.context.shutdown.cancel();
            let evicted = self.context.evict_all();
            if evicted > 0 || !already_stopped {
                info!(
                    local_addr = %self.local_addr,
                    connections = evicted,
                    "Closed SOCKS5 relay"
                );
            }
        } else if !already_stopped {
            info!(
                local_addr = %self.local_addr,
                connections = self.active_connections(),
                "Closed SOCKS5 listener, draining connections"
            );
            self.context.finish_if_drained();
        }
    }

    fn is_closed(&self) -> bool {
        self.context.is_stopped()
    }
}

impl Drop for SocksRelay {
    fn drop(&mut self) {
        self.close(false);
    }
}

async fn accept_loop(listener: TcpListener, context: Arc<SocksContext>) {
    loop {
        let accepted = tokio::select! {
            _ = context.listener.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "Accepted SOCKS5 connection");
                tokio::spawn(handle_connection(context.clone(), socket, peer_addr));
            }
            Err(e) => {
                warn!("Failed to accept SOCKS5 connection: {}", e);
            }
        }
    }

    debug!(session_id = %context.session_id, "SOCKS5 listener stopped");
}

/// Obtain a correlation key and bind it to a SOCKS session on the remote side
async fn open_socks_session(context: &SocksContext) -> Result<TunnelId, MuxError> {
    let dial_timeout = context.config.dial_timeout;
    let deadline = Instant::now() + dial_timeout;

    let create = context.rpc.create_tunnel(&context.session_id);
    let key = tokio::time::timeout_at(deadline, create)
        .await
        .map_err(|_| MuxError::Timeout(dial_timeout))??;

    tokio::time::timeout_at(
        deadline,
        context
            .rpc
            .bind_socks_session(&context.session_id, key, &context.credentials),
    )
    .await
    .map_err(|_| MuxError::Timeout(dial_timeout))??;

    Ok(key)
}

async fn handle_connection(context: Arc<SocksContext>, socket: TcpStream, peer_addr: SocketAddr) {
    let key = match open_socks_session(&context).await {
        Ok(key) => key,
        Err(e) => {
            warn!(
                peer_addr = %peer_addr,
                "Failed to open SOCKS5 session, dropping connection: {}",
                e
            );
            return;
        }
    };

    if context.shutdown.is_cancelled() {
        let closing = context.frame(key, 0, Vec::new(), true);
        let _ = context.stream.send(closing).await;
        return;
    }

    let (reader, writer) = socket.into_split();
    let connection = Arc::new(PooledConnection {
        writer: Mutex::new(writer),
        next_inbound_sequence: AtomicU64::new(0),
        closed_by_remote: AtomicBool::new(false),
        cancel: context.shutdown.child_token(),
    });
    context.insert(key, connection.clone());

    debug!(tunnel_id = key, peer_addr = %peer_addr, "SOCKS5 connection bridged");

    fan_out(context, key, reader, connection).await;
}

/// Relay one local socket to the remote side
async fn fan_out(
    context: Arc<SocksContext>,
    key: TunnelId,
    mut reader: OwnedReadHalf,
    connection: Arc<PooledConnection>,
) {
    let mut buffer = vec![0u8; context.config.read_chunk_size];
    let mut sequence = 0u64;

    loop {
        let read = tokio::select! {
            _ = connection.cancel.cancelled() => break,
            read = reader.read(&mut buffer) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(tunnel_id = key, "SOCKS5 client closed connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(tunnel_id = key, "SOCKS5 client read failed: {}", e);
                break;
            }
        };

        trace!(
            tunnel_id = key,
            sequence = sequence,
            size = n,
            "Sending SOCKS5 data"
        );
        let frame = context.frame(key, sequence, buffer[..n].to_vec(), false);
        if let Err(e) = context.stream.send(frame).await {
            warn!(tunnel_id = key, "Failed to send SOCKS5 data: {}", e);
            break;
        }
        sequence += 1;
    }

    context.evict(key);

    if !connection.closed_by_remote.load(Ordering::Acquire) {
        let frame = context.frame(key, sequence, Vec::new(), true);
        if let Err(e) = context.stream.send(frame).await {
            debug!(tunnel_id = key, "Failed to send SOCKS5 close: {}", e);
        }
    }
}

/// Route inbound relay frames to local sockets
async fn fan_in(context: Arc<SocksContext>) {
    loop {
        let received = tokio::select! {
            _ = context.shutdown.cancelled() => break,
            received = context.stream.recv() => received,
        };

        match received {
            Ok(Some(frame)) => deliver(&context, frame).await,
            Ok(None) => {
                info!(session_id = %context.session_id, "SOCKS5 relay stream closed");
                break;
            }
            Err(e) => {
                warn!(
                    session_id = %context.session_id,
                    "SOCKS5 relay stream failed: {}",
                    e
                );
                break;
            }
        }
    }

    let evicted = context.evict_all();
    debug!(connections = evicted, "SOCKS5 fan-in stopped");
}

async fn deliver(context: &SocksContext, frame: SocksFrame) {
    let key = frame.tunnel_id;
    let Some(connection) = context.pooled(key) else {
        if !frame.closed {
            warn!(
                tunnel_id = key,
                "Dropping SOCKS5 frame for unknown connection"
            );
        }
        return;
    };

    let expected = connection
        .next_inbound_sequence
        .swap(frame.sequence.wrapping_add(1), Ordering::AcqRel);
    if frame.sequence != expected {
        warn!(
            tunnel_id = key,
            expected = expected,
            received = frame.sequence,
            "SOCKS5 sequence gap"
        );
    }

    if frame.closed {
        connection.closed_by_remote.store(true, Ordering::Release);
    }

    let mut writer = connection.writer.lock().await;

    if !frame.data.is_empty() {
        if let Err(e) = writer.write_all(&frame.data).await {
            debug!(tunnel_id = key, "SOCKS5 client write failed: {}", e);
            drop(writer);
            // Fan-out notices the cancel and tells the remote side,
            // unless the remote already closed
            context.evict(key);
            return;
        }
    }

    if frame.closed {
        debug!(tunnel_id = key, "SOCKS5 connection closed by remote");
        let _ = writer.shutdown().await;
        drop(writer);
        context.evict(key);
    }
}
