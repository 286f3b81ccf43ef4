//! Integration tests for channels, sessions and the registry working
//! together through their public API.
//!
//! Suspension is asserted with `tokio::time::timeout`: an operation that
//! does not complete within a short window is considered blocked.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::{timeout, Instant};

use conduit_session::channel::bounded;
use conduit_session::{Session, SessionRegistry};
use conduit_types::{AbortReason, Call, CallKind, ConduitError, Result, SessionStatus};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const BLOCKED: Duration = Duration::from_millis(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn open(registry: &SessionRegistry, call: &Call, capacity: usize) -> Result<Session> {
    let session = Session::open(registry.allocate_id(), call, capacity)?;
    registry.register(&session)?;
    Ok(session)
}

// ===========================================================================
// Bounded channel
// ===========================================================================

#[tokio::test]
async fn sender_suspends_after_capacity_unread_messages() -> Result<()> {
    init_tracing();
    for capacity in [1usize, 2, 3, 8, 32, 100] {
        let (mut tx, mut rx) = bounded(capacity);
        for i in 0..capacity {
            tx.send(Bytes::from(i.to_string())).await?;
        }
        assert_eq!(rx.len(), capacity);

        let extra = timeout(BLOCKED, tx.send(Bytes::from_static(b"extra"))).await;
        assert!(extra.is_err(), "send beyond capacity {capacity} did not suspend");
        assert_eq!(rx.len(), capacity);

        assert!(rx.recv().await?.is_some());
        timeout(BLOCKED, tx.send(Bytes::from_static(b"extra")))
            .await
            .map_err(|_| ConduitError::handler("send stayed blocked after a receive"))??;
        assert_eq!(rx.len(), capacity);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fifo_across_tasks_with_backpressure() -> Result<()> {
    init_tracing();
    let (mut tx, mut rx) = bounded(3);

    let producer = tokio::spawn(async move {
        for i in 0u32..1_000 {
            tx.send(i.to_be_bytes().to_vec()).await?;
        }
        Ok::<_, ConduitError>(())
    });

    let mut expected = 0u32;
    while let Some(message) = rx.recv().await? {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&message.payload);
        assert_eq!(u32::from_be_bytes(raw), expected);
        assert_eq!(message.seq, u64::from(expected));
        expected += 1;
        if expected % 97 == 0 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(expected, 1_000);
    producer
        .await
        .map_err(|e| ConduitError::handler(e.to_string()))??;
    Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_drains_before_end() -> Result<()> {
    init_tracing();
    let (mut tx, mut rx) = bounded(4);
    tx.send(Bytes::from_static(b"a")).await?;
    tx.send(Bytes::from_static(b"b")).await?;

    assert!(tx.close());
    assert!(!tx.close());
    assert!(!rx.close());
    assert_eq!(tx.send(Bytes::from_static(b"c")).await, Err(ConduitError::ChannelClosed));

    assert_eq!(rx.recv().await?.map(|m| m.payload), Some(Bytes::from_static(b"a")));
    assert_eq!(rx.recv().await?.map(|m| m.payload), Some(Bytes::from_static(b"b")));
    assert_eq!(rx.recv().await?, None);
    assert_eq!(rx.recv().await?, None);
    Ok(())
}

// ===========================================================================
// Sessions in the registry
// ===========================================================================

#[tokio::test]
async fn server_stream_leaves_registry_after_drain() -> Result<()> {
    init_tracing();
    let registry = SessionRegistry::new();
    let mut session = open(&registry, &Call::new(CallKind::ServerStream, "History"), 32)?;
    let id = session.id();
    assert!(registry.lookup(id).is_ok());

    for entry in ["tx-1", "tx-2", "tx-3"] {
        session.write_outbound(entry).await?;
    }
    session.finish_outbound();
    assert_eq!(registry.lookup(id)?.status(), SessionStatus::Draining);

    let mut received = Vec::new();
    while let Some(message) = session.read_outbound().await? {
        received.push(message.payload);
    }
    assert_eq!(received, vec!["tx-1", "tx-2", "tx-3"]);
    assert_eq!(session.status(), SessionStatus::Closed);
    assert!(matches!(
        registry.lookup(id),
        Err(ConduitError::SessionNotFound { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn bidi_disconnect_discards_buffered_outbound() -> Result<()> {
    init_tracing();
    let registry = SessionRegistry::new();
    let session = open(&registry, &Call::new(CallKind::BidiStream, "Chat"), 32)?;
    let handle = session.handle();
    let mut parts = session.into_parts();

    let (Some(mut outbound_writer), Some(mut inbound_writer), Some(mut outbound_reader)) = (
        parts.outbound_writer.take(),
        parts.inbound_writer.take(),
        parts.outbound_reader.take(),
    ) else {
        return Err(ConduitError::ChannelClosed);
    };

    outbound_writer.send("quote-1").await?;
    outbound_writer.send("quote-2").await?;
    inbound_writer.send("subscribe").await?;
    assert_eq!(handle.buffered(), 3);

    // Client goes away.
    assert!(handle.abort(AbortReason::Disconnected));

    assert_eq!(handle.status(), SessionStatus::Aborted);
    assert_eq!(handle.buffered(), 0);
    assert!(!registry.contains(handle.id()));

    fn aborted<T>() -> Result<T> {
        Err(ConduitError::Aborted {
            reason: AbortReason::Disconnected,
        })
    }
    assert_eq!(outbound_reader.message().await, aborted());
    assert_eq!(outbound_writer.send("quote-3").await, aborted());
    if let Some(mut inbound_reader) = parts.inbound_reader.take() {
        assert_eq!(inbound_reader.message().await, aborted());
    }

    assert!(!handle.abort(AbortReason::Cancelled));
    assert_eq!(handle.abort_reason(), Some(AbortReason::Disconnected));
    Ok(())
}

#[tokio::test]
async fn deadline_aborts_without_pending_io() -> Result<()> {
    init_tracing();
    let registry = SessionRegistry::new();
    let deadline = Instant::now() + Duration::from_millis(40);
    let call = Call::new(CallKind::BidiStream, "Chat").with_deadline(deadline);
    let session = open(&registry, &call, 8)?;
    let handle = session.handle();

    timeout(Duration::from_millis(500), handle.finished())
        .await
        .map_err(|_| ConduitError::handler("deadline did not abort the session"))?;

    assert!(Instant::now() >= deadline);
    assert_eq!(handle.abort_reason(), Some(AbortReason::DeadlineExceeded));
    assert!(registry.is_empty());

    let mut session = session;
    assert_eq!(
        session.read_inbound().await,
        Err(ConduitError::DeadlineExceeded)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn abort_all_unblocks_suspended_tasks() -> Result<()> {
    init_tracing();
    let registry = SessionRegistry::new();
    let mut waiters = Vec::new();

    for i in 0..6 {
        let kind = if i % 2 == 0 {
            CallKind::ServerStream
        } else {
            CallKind::BidiStream
        };
        let mut session = open(&registry, &Call::new(kind, "Stream"), 1)?;
        waiters.push(tokio::spawn(async move {
            // Fill the outbound channel, then block on the next send.
            session.write_outbound("first").await?;
            session.write_outbound("second").await
        }));
    }

    tokio::time::sleep(BLOCKED).await;
    assert_eq!(registry.len(), 6);
    assert!(waiters.iter().all(|w| !w.is_finished()));

    assert_eq!(registry.abort_all(AbortReason::Shutdown), 6);
    for waiter in waiters {
        let result = timeout(Duration::from_secs(1), waiter).await;
        assert_eq!(
            result.ok().and_then(|joined| joined.ok()),
            Some(Err(ConduitError::Aborted {
                reason: AbortReason::Shutdown
            }))
        );
    }
    assert!(registry.is_empty());

    let stats = registry.stats();
    assert_eq!((stats.opened, stats.aborted, stats.closed), (6, 6, 0));
    Ok(())
}
