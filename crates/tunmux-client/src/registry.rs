//! Tunnel registry: demultiplexes inbound frames and multiplexes tunnel writes
//!
//! The registry owns the physical `DuplexStream<TunnelFrame>`. One demux loop
//! reads frames and routes them to tunnels by ID; every tunnel gets its own
//! pump task that forwards its writes to the stream in order.

use crate::config::MuxConfig;
use crate::rpc::{RpcError, TunnelRpc};
use crate::tunnel::{DeliverError, LogicalTunnel, OutboundQueue, TunnelError};
use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use tunmux_connection::{DuplexStream, TransportError};
use tunmux_proto::{SessionId, TunnelFrame, TunnelId};

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Duplex stream closed by peer")]
    StreamClosed,

    #[error("Tunnel already registered: {0}")]
    DuplicateTunnel(TunnelId),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

struct RegistryInner {
    stream: DuplexStream<TunnelFrame>,
    tunnels: RwLock<HashMap<TunnelId, Arc<LogicalTunnel>>>,
    config: MuxConfig,
}

impl RegistryInner {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<TunnelId, Arc<LogicalTunnel>>> {
        self.tunnels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TunnelId, Arc<LogicalTunnel>>> {
        self.tunnels.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove `tunnel` if it is still the registered instance for its ID
    fn deregister(&self, tunnel: &Arc<LogicalTunnel>) {
        let mut tunnels = self.write();
        if let Some(current) = tunnels.get(&tunnel.id()) {
            if Arc::ptr_eq(current, tunnel) {
                tunnels.remove(&tunnel.id());
            }
        }
    }
}

/// Registry of logical tunnels sharing one duplex stream
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new(stream: DuplexStream<TunnelFrame>) -> Self {
        Self::with_config(stream, MuxConfig::default())
    }

    pub fn with_config(stream: DuplexStream<TunnelFrame>, config: MuxConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                stream,
                tunnels: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    /// Register and open a tunnel the remote side has created
    ///
    /// Spawns the tunnel's outbound pump. Fails if the ID is already
    /// registered.
    pub fn start(
        &self,
        tunnel_id: TunnelId,
        session_id: impl Into<SessionId>,
    ) -> Result<Arc<LogicalTunnel>, MuxError> {
        let (tunnel, outbound) =
            LogicalTunnel::new(tunnel_id, session_id, self.inner.config.queue_depth);
        tunnel.open()?;
        let tunnel = Arc::new(tunnel);

        match self.inner.write().entry(tunnel_id) {
            Entry::Occupied(_) => return Err(MuxError::DuplicateTunnel(tunnel_id)),
            Entry::Vacant(entry) => {
                entry.insert(tunnel.clone());
            }
        }

        debug!(
            tunnel_id = tunnel_id,
            session_id = %tunnel.session_id(),
            "Started tunnel"
        );

        tokio::spawn(run_pump(self.inner.clone(), tunnel.clone(), outbound));

        Ok(tunnel)
    }

    /// Ask the remote side for a new tunnel and start it
    pub async fn open(
        &self,
        rpc: &dyn TunnelRpc,
        session_id: &str,
    ) -> Result<Arc<LogicalTunnel>, MuxError> {
        let tunnel_id = rpc.create_tunnel(session_id).await?;
        self.start(tunnel_id, session_id)
    }

    pub fn get(&self, tunnel_id: TunnelId) -> Option<Arc<LogicalTunnel>> {
        self.inner.read().get(&tunnel_id).cloned()
    }

    /// Remove and close a tunnel
    ///
    /// Returns false if no tunnel with that ID was registered.
    pub fn close(&self, tunnel_id: TunnelId) -> bool {
        let removed = self.inner.write().remove(&tunnel_id);

        match removed {
            Some(tunnel) => {
                tunnel.close();
                debug!(
                    tunnel_id = tunnel_id,
                    bytes_sent = tunnel.stats().bytes_sent,
                    bytes_received = tunnel.stats().bytes_received,
                    "Closed tunnel"
                );
                true
            }
            None => false,
        }
    }

    /// Close every tunnel belonging to a session
    ///
    /// Matching IDs are collected under the read lock, then closed one by one
    /// without holding it. Returns the number of tunnels closed.
    pub fn close_for_session(&self, session_id: &str) -> usize {
        let matching: Vec<TunnelId> = self
            .inner
            .read()
            .values()
            .filter(|tunnel| tunnel.session_id() == session_id)
            .map(|tunnel| tunnel.id())
            .collect();

        let closed = matching.into_iter().filter(|id| self.close(*id)).count();

        info!(
            session_id = %session_id,
            closed = closed,
            "Closed tunnels for session"
        );
        closed
    }

    /// Close every registered tunnel
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<LogicalTunnel>> = self
            .inner
            .write()
            .drain()
            .map(|(_, tunnel)| tunnel)
            .collect();

        for tunnel in &drained {
            tunnel.close();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn tunnel_ids(&self) -> Vec<TunnelId> {
        let mut ids: Vec<TunnelId> = self.inner.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Run the receive loop
    ///
    /// Routes every inbound frame to its tunnel until the stream fails or
    /// ends. Either way the multiplexer is finished: all tunnels are closed
    /// and the cause is returned.
    pub async fn run_demux(&self) -> Result<(), MuxError> {
        debug!("Starting demux loop");

        let cause = loop {
            match self.inner.stream.recv().await {
                Ok(Some(frame)) => self.dispatch(frame).await,
                Ok(None) => break MuxError::StreamClosed,
                Err(e) => break MuxError::Transport(e),
            }
        };

        let closed = self.close_all();
        error!(closed_tunnels = closed, "Demux loop terminated: {}", cause);

        Err(cause)
    }

    /// Spawn `run_demux` on the runtime
    pub fn spawn_demux(&self) -> JoinHandle<Result<(), MuxError>> {
        let registry = self.clone();
        tokio::spawn(async move { registry.run_demux().await })
    }

    async fn dispatch(&self, frame: TunnelFrame) {
        trace!(
            tunnel_id = frame.tunnel_id,
            size = frame.data.len(),
            closed = frame.closed,
            "Processing frame"
        );

        let Some(tunnel) = self.get(frame.tunnel_id) else {
            if frame.closed {
                debug!(tunnel_id = frame.tunnel_id, "Close for unknown tunnel");
            } else {
                warn!(
                    tunnel_id = frame.tunnel_id,
                    session_id = %frame.session_id,
                    "Dropping frame for unknown tunnel"
                );
            }
            return;
        };

        if !frame.data.is_empty() {
            let timeout = self.inner.config.inbound_deliver_timeout;
            match tunnel.deliver(Bytes::from(frame.data), timeout).await {
                Ok(()) => {}
                Err(DeliverError::Closed) => {
                    debug!(tunnel_id = tunnel.id(), "Dropping data for closed tunnel");
                }
                Err(DeliverError::TimedOut) => {
                    warn!(
                        tunnel_id = tunnel.id(),
                        "Tunnel reader stalled the demux loop, closing tunnel"
                    );
                    self.close(tunnel.id());
                    return;
                }
            }
        }

        if frame.closed {
            debug!(tunnel_id = tunnel.id(), "Tunnel closed by remote");
            tunnel.close_by_peer();
            self.inner.deregister(&tunnel);
        }
    }
}

/// Forward one tunnel's writes to the stream, in order
///
/// Ends when the tunnel closes and its queue is drained. Unless the remote
/// side closed the tunnel, a close frame is sent last.
async fn run_pump(
    inner: Arc<RegistryInner>,
    tunnel: Arc<LogicalTunnel>,
    mut outbound: OutboundQueue,
) {
    let tunnel_id = tunnel.id();
    let session_id = tunnel.session_id().to_string();
    let mut stream_ok = true;

    while let Some(data) = outbound.next().await {
        trace!(
            tunnel_id = tunnel_id,
            size = data.len(),
            "Sending tunnel data"
        );

        let frame = TunnelFrame::data(tunnel_id, session_id.clone(), Vec::from(data));
        if let Err(e) = inner.stream.send(frame).await {
            warn!(tunnel_id = tunnel_id, "Failed to send tunnel data: {}", e);
            stream_ok = false;
            tunnel.close();
            break;
        }
    }

    if stream_ok && !tunnel.closed_by_peer() {
        let frame = TunnelFrame::close(tunnel_id, session_id);
        if let Err(e) = inner.stream.send(frame).await {
            debug!(tunnel_id = tunnel_id, "Failed to send close frame: {}", e);
        }
    }

    inner.deregister(&tunnel);
    trace!(tunnel_id = tunnel_id, "Tunnel pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunmux_connection::memory;

    #[tokio::test]
    async fn test_start_rejects_duplicate_id() {
        let (local, _remote) = memory::pair::<TunnelFrame>(16);
        let registry = TunnelRegistry::new(local);

        registry.start(1, "abc").unwrap();
        assert!(matches!(
            registry.start(1, "abc"),
            Err(MuxError::DuplicateTunnel(1))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_write_becomes_frame() {
        let (local, remote) = memory::pair::<TunnelFrame>(16);
        let registry = TunnelRegistry::new(local);

        let tunnel = registry.start(1, "abc").unwrap();
        tunnel.write(b"ping").await.unwrap();

        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(frame, TunnelFrame::data(1, "abc", b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_local_close_sends_close_frame() {
        let (local, remote) = memory::pair::<TunnelFrame>(16);
        let registry = TunnelRegistry::new(local);

        registry.start(3, "abc").unwrap();
        assert!(registry.close(3));
        assert!(!registry.close(3));

        let frame = remote.recv().await.unwrap().unwrap();
        assert_eq!(frame, TunnelFrame::close(3, "abc"));
        assert!(registry.get(3).is_none());
    }

    #[tokio::test]
    async fn test_tunnel_handle_close_deregisters() {
        let (local, remote) = memory::pair::<TunnelFrame>(16);
        let registry = TunnelRegistry::new(local);

        let tunnel = registry.start(5, "abc").unwrap();
        tunnel.close();

        // The pump sends the close frame before deregistering
        let frame = remote.recv().await.unwrap().unwrap();
        assert!(frame.closed);

        for _ in 0..50 {
            if registry.get(5).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.get(5).is_none());
    }

    #[tokio::test]
    async fn test_demux_ends_with_error_on_stream_close() {
        let (local, remote) = memory::pair::<TunnelFrame>(16);
        let registry = TunnelRegistry::new(local);
        let tunnel = registry.start(1, "abc").unwrap();

        let demux = registry.spawn_demux();
        remote.close().await.unwrap();

        let result = demux.await.unwrap();
        assert!(matches!(result, Err(MuxError::StreamClosed)));
        assert!(!tunnel.is_open());
        assert!(registry.is_empty());
    }
}
