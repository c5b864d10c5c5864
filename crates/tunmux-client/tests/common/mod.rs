//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tunmux_client::{Credentials, IdAllocator, RpcError, TunnelId, TunnelRpc};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Bind call observed by the fake remote side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindCall {
    PortForward {
        session_id: String,
        tunnel_id: TunnelId,
        host: String,
        port: u16,
    },
    Socks {
        session_id: String,
        tunnel_id: TunnelId,
        credentials: Credentials,
    },
}

/// In-process stand-in for the remote RPC service
pub struct FakeRpc {
    ids: IdAllocator,
    fail_create: AtomicBool,
    binds: Mutex<Vec<BindCall>>,
}

impl FakeRpc {
    pub fn new() -> Self {
        Self {
            ids: IdAllocator::new(),
            fail_create: AtomicBool::new(false),
            binds: Mutex::new(Vec::new()),
        }
    }

    /// Make subsequent `create_tunnel` calls fail
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn binds(&self) -> Vec<BindCall> {
        self.binds.lock().unwrap().clone()
    }
}

#[async_trait]
impl TunnelRpc for FakeRpc {
    async fn create_tunnel(&self, session_id: &str) -> Result<TunnelId, RpcError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RpcError::Rejected(format!(
                "tunnel creation refused for {}",
                session_id
            )));
        }
        Ok(self.ids.next_id())
    }

    async fn bind_port_forward(
        &self,
        session_id: &str,
        tunnel_id: TunnelId,
        host: &str,
        port: u16,
    ) -> Result<(), RpcError> {
        self.binds.lock().unwrap().push(BindCall::PortForward {
            session_id: session_id.to_string(),
            tunnel_id,
            host: host.to_string(),
            port,
        });
        Ok(())
    }

    async fn bind_socks_session(
        &self,
        session_id: &str,
        tunnel_id: TunnelId,
        credentials: &Credentials,
    ) -> Result<(), RpcError> {
        self.binds.lock().unwrap().push(BindCall::Socks {
            session_id: session_id.to_string(),
            tunnel_id,
            credentials: credentials.clone(),
        });
        Ok(())
    }
}

/// Upper bound for any single wait in these tests
pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `WAIT` elapses
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
