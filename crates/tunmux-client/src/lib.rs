//! Tunnel multiplexer client library
//!
//! Carries many logical tunnels over one physical duplex stream and bridges
//! local TCP listeners (port-forwards and a SOCKS5 relay) onto them.

pub mod client;
pub mod config;
pub mod forward;
pub mod forwarders;
pub mod ids;
pub mod registry;
pub mod rpc;
pub mod tunnel;

pub use client::TunnelClient;
pub use config::{ConfigError, MuxConfig, MuxConfigBuilder};
pub use forward::{
    Bridge, ForwardError, ForwarderInfo, ForwarderKind, ForwarderType, PortForwarder, SocksRelay,
};
pub use forwarders::ForwarderRegistry;
pub use ids::IdAllocator;
pub use registry::{MuxError, TunnelRegistry};
pub use rpc::{Credentials, RpcError, TunnelRpc};
pub use tunnel::{LogicalTunnel, TunnelError, TunnelState, TunnelStats};

pub use tunmux_proto::{ForwarderId, SessionId, SocksFrame, TunnelFrame, TunnelId};
