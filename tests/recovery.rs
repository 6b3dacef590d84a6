//! Defunct connection recovery and backend cancellation.

use std::time::Duration;

use ha_pool::config::PoolConfig;
use ha_pool::{PoolError, PoolEvent};

mod common;

fn recovering(capacity: usize, auto_cancel: bool) -> PoolConfig {
    PoolConfig {
        auto_recover: true,
        auto_cancel,
        ..common::test_config(capacity)
    }
}

#[tokio::test]
async fn test_recover_without_defunct_connections_is_noop() {
    let (pool, _server, _probe) = common::pool_with(common::test_config(2));
    let _lease = pool.checkout().await.unwrap();
    let before = pool.status(false);

    assert!(!pool.recover());

    let after = pool.status(false);
    assert_eq!(after.used, before.used);
    assert_eq!(after.idle, before.idle);
    assert_eq!(pool.cancel_backlog(), 0);
}

#[tokio::test]
async fn test_manual_recovery_retires_every_defunct_connection() {
    let (pool, server, _probe) = common::pool_with(common::test_config(3));

    let mut held = pool.checkout().await.unwrap();
    let held_id = held.id().unwrap();
    let mut idle = pool.checkout().await.unwrap();
    let healthy = pool.checkout().await.unwrap();
    let healthy_pid = healthy.process_id().unwrap();
    idle.release().unwrap();

    for conn in server.connections() {
        if conn.pid() != healthy_pid {
            conn.kill_silently();
        }
    }
    assert_eq!(pool.status(false).defunct, 2);

    assert!(pool.recover());

    let status = pool.status(false);
    assert_eq!(status.defunct, 0);
    assert_eq!(status.used, 1);
    assert!(!pool.recover(), "second pass has nothing to do");

    // The retired lease's holder sees the connection is gone.
    assert!(matches!(
        held.execute("SELECT 1", &[]).await.unwrap_err(),
        PoolError::ConnectionDefunct(_)
    ));
    assert_eq!(held.release().unwrap_err(), PoolError::Vacated(held_id));
    assert!(healthy.execute("SELECT 1", &[]).await.is_ok());
}

#[tokio::test]
async fn test_auto_recover_retires_connections_after_disconnect() {
    let (pool, server, _probe) = common::pool_with(recovering(2, false));

    let a = pool.checkout().await.unwrap();
    let b = pool.checkout().await.unwrap();
    let old_pids = [a.process_id().unwrap(), b.process_id().unwrap()];

    server.disconnect_all();
    common::wait_for(Duration::from_secs(1), || pool.status(false).used == 0).await;
    assert_eq!(pool.cancel_backlog(), 0, "nothing queued without auto-cancel");

    drop(a);
    drop(b);

    let fresh = pool.checkout().await.unwrap();
    assert!(!old_pids.contains(&fresh.process_id().unwrap()));
    assert!(fresh.execute("SELECT 1", &[]).await.is_ok());
}

#[tokio::test]
async fn test_recover_publishes_unreported_deaths() {
    let (pool, server, _probe) = common::pool_with(common::test_config(1));
    let mut events = pool.subscribe();

    let lease = pool.checkout().await.unwrap();
    let id = lease.id();
    server.connections()[0].kill_silently();

    assert!(pool.recover());

    let (error, connection) = common::next_error(&mut events).await;
    assert!(matches!(error, PoolError::ConnectionDefunct(_)), "{error:?}");
    assert_eq!(connection, id);
}

#[tokio::test]
async fn test_terminated_execute_triggers_recovery() {
    let (pool, server, probe) = common::pool_with(recovering(2, false));
    common::wait_for(Duration::from_secs(1), || !pool.is_watching()).await;
    let mut events = pool.subscribe();
    let probes = probe.calls();

    let a = pool.checkout().await.unwrap();
    let b = pool.checkout().await.unwrap();
    let (a_id, b_id) = (a.id(), b.id());
    for conn in server.connections() {
        conn.kill_silently();
    }

    let err = a.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, PoolError::ConnectionDefunct(_)), "{err:?}");

    // The caller's failure first, then the sweep's find on the other lease.
    let (error, connection) = common::next_error(&mut events).await;
    assert_eq!(error, err);
    assert_eq!(connection, a_id);
    let (error, connection) = common::next_error(&mut events).await;
    assert!(matches!(error, PoolError::ConnectionDefunct(_)), "{error:?}");
    assert_eq!(connection, b_id);

    common::wait_for(Duration::from_secs(1), || pool.status(false).defunct == 0).await;
    assert_eq!(pool.status(false).used, 0);
    common::wait_for(Duration::from_secs(1), || probe.calls() > probes).await;
}

#[tokio::test]
async fn test_full_pool_recovers_before_queueing() {
    let (pool, server, _probe) = common::pool_with(recovering(1, false));

    let _stuck = pool.checkout().await.unwrap();
    // Ended without an error report, so only checkout can notice.
    server.connections()[0].kill_silently();

    let lease = tokio::time::timeout(Duration::from_millis(500), pool.checkout())
        .await
        .expect("checkout should recover the defunct lease instead of waiting")
        .unwrap();
    assert!(lease.execute("SELECT 1", &[]).await.is_ok());
    assert_eq!(server.connects(), 2);
}

#[tokio::test]
async fn test_auto_cancel_uses_next_checkout() {
    let (pool, server, probe) = common::pool_with(recovering(2, true));
    common::wait_for(Duration::from_secs(1), || !pool.is_watching()).await;

    let lost = pool.checkout().await.unwrap();
    let pid = lost.process_id().unwrap();

    // Keep the watcher failing so it does not flush the backlog itself.
    probe.set(false);
    server.connection_by_pid(pid).disconnect();

    common::wait_for(Duration::from_secs(1), || pool.cancel_backlog() == 1).await;
    common::wait_for(Duration::from_secs(1), || pool.status(false).used == 0).await;
    assert!(server.cancelled().is_empty());
    drop(lost);

    let lease = pool.checkout().await.unwrap();
    assert_ne!(lease.process_id(), Some(pid));
    assert_eq!(server.cancelled(), vec![pid]);
    assert_eq!(pool.cancel_backlog(), 0);
}

#[tokio::test]
async fn test_cancel_failures_are_swallowed() {
    let (pool, server, probe) = common::pool_with(recovering(2, true));
    common::wait_for(Duration::from_secs(1), || !pool.is_watching()).await;

    let lost = pool.checkout().await.unwrap();
    probe.set(false);
    server.fail_cancel(true);
    server.connection_by_pid(lost.process_id().unwrap()).disconnect();
    common::wait_for(Duration::from_secs(1), || pool.cancel_backlog() == 1).await;

    let lease = pool.checkout().await.unwrap();
    assert!(lease.execute("SELECT 1", &[]).await.is_ok());
    assert!(server.cancelled().is_empty());
    assert_eq!(pool.cancel_backlog(), 0, "backlog cleared whatever the outcome");
}

#[tokio::test]
async fn test_reconnect_flushes_cancel_backlog() {
    let (pool, server, probe) = common::pool_with(recovering(2, true));
    common::wait_for(Duration::from_secs(1), || !pool.is_watching()).await;
    let mut events = pool.subscribe();

    let lost = pool.checkout().await.unwrap();
    let pid = lost.process_id().unwrap();
    probe.set(false);
    server.connection_by_pid(pid).disconnect();
    common::wait_for(Duration::from_secs(1), || pool.cancel_backlog() == 1).await;
    common::wait_for(Duration::from_secs(1), || pool.connectivity_error()).await;
    drop(lost);

    probe.set(true);
    common::wait_for(Duration::from_secs(2), || server.cancelled() == vec![pid]).await;
    assert_eq!(pool.cancel_backlog(), 0);

    // The flush cycle released its connection.
    common::wait_for(Duration::from_secs(1), || pool.status(false).idle == pool.status(false).used).await;
    let events = common::drain_events(&mut events);
    assert_eq!(events.iter().filter(|e| e.is_ready()).count(), 1);
    assert!(events
        .iter()
        .any(|e| matches!(e, PoolEvent::Error { error: PoolError::Transport(_), .. })));
}
