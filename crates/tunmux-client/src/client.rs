//! Client facade
//!
//! Ties the tunnel registry, the forwarder registry and the RPC collaborator
//! together behind the operations the command layer issues.

use crate::config::MuxConfig;
use crate::forward::{ForwardError, ForwarderInfo, PortForwarder, SocksRelay};
use crate::forwarders::ForwarderRegistry;
use crate::registry::{MuxError, TunnelRegistry};
use crate::rpc::{Credentials, TunnelRpc};
use crate::tunnel::LogicalTunnel;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;
use tunmux_connection::DuplexStream;
use tunmux_proto::{ForwarderId, SocksFrame, TunnelFrame};

/// Tunnel multiplexer client bound to one physical tunnel stream
#[derive(Clone)]
pub struct TunnelClient {
    tunnels: TunnelRegistry,
    forwarders: ForwarderRegistry,
    rpc: Arc<dyn TunnelRpc>,
}

impl TunnelClient {
    pub fn new(
        stream: DuplexStream<TunnelFrame>,
        rpc: Arc<dyn TunnelRpc>,
        config: MuxConfig,
    ) -> Self {
        Self {
            tunnels: TunnelRegistry::with_config(stream, config),
            forwarders: ForwarderRegistry::new(),
            rpc,
        }
    }

    pub fn tunnels(&self) -> &TunnelRegistry {
        &self.tunnels
    }

    pub fn forwarders(&self) -> &ForwarderRegistry {
        &self.forwarders
    }

    pub fn config(&self) -> &MuxConfig {
        self.tunnels.config()
    }

    /// Start routing inbound frames to tunnels
    pub fn spawn_demux(&self) -> JoinHandle<Result<(), MuxError>> {
        self.tunnels.spawn_demux()
    }

    /// Open a tunnel in `session_id` for direct use
    pub async fn open_tunnel(&self, session_id: &str) -> Result<Arc<LogicalTunnel>, MuxError> {
        self.tunnels.open(self.rpc.as_ref(), session_id).await
    }

    /// Listen on `bind_addr` and forward connections to `remote_addr` via the
    /// session's agent
    pub async fn add_port_forward(
        &self,
        session_id: &str,
        bind_addr: &str,
        remote_addr: &str,
    ) -> Result<ForwarderId, ForwardError> {
        let forwarder = PortForwarder::listen(
            bind_addr,
            remote_addr,
            session_id,
            self.tunnels.clone(),
            self.rpc.clone(),
        )
        .await?;
        Ok(self.forwarders.add(forwarder))
    }

    /// Listen on `bind_addr` as a SOCKS5 proxy served by the session's agent
    ///
    /// `socks_stream` is the relay stream dedicated to this proxy.
    pub async fn add_socks_proxy(
        &self,
        session_id: &str,
        bind_addr: &str,
        credentials: Credentials,
        socks_stream: DuplexStream<SocksFrame>,
    ) -> Result<ForwarderId, ForwardError> {
        let relay = SocksRelay::listen(
            bind_addr,
            session_id,
            credentials,
            socks_stream,
            self.rpc.clone(),
            self.tunnels.config().clone(),
        )
        .await?;
        Ok(self.forwarders.add(relay))
    }

    /// Stop a forwarder; `close_active` also closes its live connections
    pub fn remove_forwarder(&self, id: ForwarderId, close_active: bool) -> bool {
        self.forwarders.remove(id, close_active)
    }

    pub fn list_forwarders(&self) -> Vec<ForwarderInfo> {
        self.forwarders.list()
    }

    pub fn list_session_forwarders(&self, session_id: &str) -> Vec<ForwarderInfo> {
        self.forwarders.list_for_session(session_id)
    }

    /// Tear down a session: its forwarders first, then its tunnels
    pub fn close_session(&self, session_id: &str) -> (usize, usize) {
        let forwarders = self.forwarders.close_for_session(session_id, true);
        let tunnels = self.tunnels.close_for_session(session_id);
        info!(
            session_id = %session_id,
            forwarders = forwarders,
            tunnels = tunnels,
            "Closed session"
        );
        (forwarders, tunnels)
    }
}
