//! Tunnel registry behaviour over an in-memory duplex stream

mod common;

use common::{init_tracing, FakeRpc, WAIT};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;
use tunmux_client::{MuxConfig, MuxError, TunnelError, TunnelFrame, TunnelRegistry};
use tunmux_connection::memory;

#[tokio::test]
async fn test_ping_scenario() -> anyhow::Result<()> {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let _demux = registry.spawn_demux();

    let tunnel = registry.start(1, "abc")?;

    tunnel.write(b"ping").await?;
    let frame = timeout(WAIT, remote.recv())
        .await??
        .ok_or_else(|| anyhow::anyhow!("stream ended"))?;
    assert_eq!(frame.tunnel_id, 1);
    assert_eq!(frame.session_id, "abc");
    assert_eq!(frame.data, b"ping");
    assert!(!frame.closed);

    remote
        .send(TunnelFrame::data(1, "abc", b"ping".to_vec()))
        .await?;
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, tunnel.read(&mut buf)).await??;
    assert_eq!(&buf[..n], b"ping");

    remote.send(TunnelFrame::close(1, "abc")).await?;
    timeout(WAIT, tunnel.closed()).await?;

    assert_eq!(tunnel.read(&mut buf).await, Err(TunnelError::Eof(1)));
    assert_eq!(tunnel.write(b"late").await, Err(TunnelError::Eof(1)));
    assert!(common::eventually(|| registry.get(1).is_none()).await);
    Ok(())
}

#[tokio::test]
async fn test_close_frame_with_data_is_readable() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let _demux = registry.spawn_demux();
    let tunnel = registry.start(1, "abc").unwrap();

    remote
        .send(TunnelFrame {
            tunnel_id: 1,
            session_id: "abc".to_string(),
            data: b"bye".to_vec(),
            closed: true,
        })
        .await
        .unwrap();
    timeout(WAIT, tunnel.closed()).await.unwrap();
    assert!(tunnel.closed_by_peer());

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, tunnel.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"bye");
    assert_eq!(tunnel.read(&mut buf).await, Err(TunnelError::Eof(1)));
    assert!(common::eventually(|| registry.get(1).is_none()).await);

    // The remote closed first, so no close frame is echoed back
    assert!(
        timeout(std::time::Duration::from_millis(100), remote.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_round_trip_preserves_bytes() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(64);
    let registry = TunnelRegistry::new(local);
    let _demux = registry.spawn_demux();
    let tunnel = registry.start(7, "abc").unwrap();

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let writer = {
        let tunnel = tunnel.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            for chunk in payload.chunks(1000) {
                tunnel.write(chunk).await.unwrap();
            }
        })
    };

    // Echo every frame straight back
    let mut echoed = 0;
    while echoed < payload.len() {
        let frame = timeout(WAIT, remote.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        echoed += frame.data.len();
        remote.send(frame).await.unwrap();
    }
    writer.await.unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 333];
    while received.len() < payload.len() {
        let n = timeout(WAIT, tunnel.read(&mut buf)).await.unwrap().unwrap();
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);
}

#[tokio::test]
async fn test_concurrent_open_yields_unique_ids() {
    init_tracing();
    let (local, _remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let rpc = Arc::new(FakeRpc::new());

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        let rpc = rpc.clone();
        handles.push(tokio::spawn(async move {
            let session = format!("session-{}", i % 4);
            registry.open(rpc.as_ref(), &session).await.unwrap().id()
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        assert!(ids.insert(handle.await.unwrap()));
    }
    assert_eq!(ids.len(), 32);
    assert_eq!(registry.len(), 32);

    let taken = *ids.iter().next().unwrap();
    assert!(matches!(
        registry.start(taken, "session-0"),
        Err(MuxError::DuplicateTunnel(id)) if id == taken
    ));
}

#[tokio::test]
async fn test_concurrent_close_is_idempotent() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let tunnel = registry.start(5, "abc").unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        let tunnel = tunnel.clone();
        handles.push(tokio::spawn(async move {
            (registry.close(5), tunnel.close())
        }));
    }

    let mut removals = 0;
    let mut state_changes = 0;
    for handle in handles {
        let (removed, closed) = handle.await.unwrap();
        removals += removed as usize;
        state_changes += closed as usize;
    }
    assert!(removals <= 1);
    assert!(state_changes <= 1);
    assert!(!tunnel.is_open());
    assert!(common::eventually(|| registry.get(5).is_none()).await);

    let frame = timeout(WAIT, remote.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, TunnelFrame::close(5, "abc"));
    assert!(
        timeout(std::time::Duration::from_millis(100), remote.recv())
            .await
            .is_err(),
        "only one close frame is sent"
    );
}

#[tokio::test]
async fn test_close_for_session_spares_other_sessions() {
    init_tracing();
    let (local, _remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);

    let a1 = registry.start(1, "a").unwrap();
    let a2 = registry.start(2, "a").unwrap();
    let b = registry.start(3, "b").unwrap();

    assert_eq!(registry.close_for_session("a"), 2);

    assert!(registry.get(1).is_none());
    assert!(registry.get(2).is_none());
    assert!(!a1.is_open());
    assert!(!a2.is_open());
    assert!(b.is_open());
    assert_eq!(registry.tunnel_ids(), vec![3]);
    assert_eq!(registry.close_for_session("missing"), 0);
}

#[tokio::test]
async fn test_demux_failure_closes_every_tunnel() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let demux = registry.spawn_demux();

    let first = registry.start(1, "a").unwrap();
    let second = registry.start(2, "b").unwrap();

    remote.close().await.unwrap();
    drop(remote);

    let result = timeout(WAIT, demux).await.unwrap().unwrap();
    assert!(matches!(result, Err(MuxError::StreamClosed)));
    assert!(registry.is_empty());

    let mut buf = [0u8; 4];
    assert_eq!(first.read(&mut buf).await, Err(TunnelError::Eof(1)));
    assert_eq!(second.write(b"x").await, Err(TunnelError::Eof(2)));
}

#[tokio::test]
async fn test_unknown_tunnel_frames_are_dropped() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let registry = TunnelRegistry::new(local);
    let _demux = registry.spawn_demux();
    let tunnel = registry.start(1, "abc").unwrap();

    remote
        .send(TunnelFrame::data(99, "abc", b"stray".to_vec()))
        .await
        .unwrap();
    remote
        .send(TunnelFrame::data(1, "abc", b"mine".to_vec()))
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, tunnel.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"mine");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_stalled_reader_is_closed_after_deliver_timeout() {
    init_tracing();
    let (local, remote) = memory::pair::<TunnelFrame>(16);
    let config = MuxConfig::builder()
        .queue_depth(1)
        .inbound_deliver_timeout(Some(std::time::Duration::from_millis(50)))
        .build()
        .unwrap();
    let registry = TunnelRegistry::with_config(local, config);
    let _demux = registry.spawn_demux();

    let stalled = registry.start(1, "abc").unwrap();
    let healthy = registry.start(2, "abc").unwrap();

    // Nobody reads tunnel 1: the second message cannot be queued
    for _ in 0..2 {
        remote
            .send(TunnelFrame::data(1, "abc", b"x".to_vec()))
            .await
            .unwrap();
    }
    remote
        .send(TunnelFrame::data(2, "abc", b"ok".to_vec()))
        .await
        .unwrap();

    let mut buf = [0u8; 4];
    let n = timeout(WAIT, healthy.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ok");
    assert!(!stalled.is_open());
    assert!(registry.get(1).is_none());
}
