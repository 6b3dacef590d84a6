//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Notify};

use ha_pool::config::PoolConfig;
use ha_pool::net::connection::CANCEL_BACKEND_STATEMENT;
use ha_pool::net::{Connection, ConnectionError, ConnectionId, ConnectionState, Connector, ErrorSink, Probe, QueryOutput};
use ha_pool::{HaPool, PoolError, PoolEvent};

/// In-memory database server handing out `MockConnection`s.
#[derive(Debug, Default)]
pub struct MockServer {
    next_pid: AtomicU32,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    cancelled: Arc<Mutex<Vec<u32>>>,
    refuse: AtomicBool,
    fail_cancel: Arc<AtomicBool>,
    connects: AtomicUsize,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            ..Default::default()
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            server: Arc::clone(self),
        })
    }

    /// Refuse new connections.
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make backend cancel requests fail.
    pub fn fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.connections.lock().unwrap().clone()
    }

    pub fn connection_by_pid(&self, pid: u32) -> Arc<MockConnection> {
        self.connections()
            .into_iter()
            .find(|c| c.pid == pid)
            .expect("no connection with that pid")
    }

    /// Process ids the server was asked to cancel.
    pub fn cancelled(&self) -> Vec<u32> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Drop every live connection, as a server restart would.
    pub fn disconnect_all(&self) {
        for conn in self.connections() {
            conn.disconnect();
        }
    }
}

struct MockConnector {
    server: Arc<MockServer>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, errors: ErrorSink) -> Result<Arc<dyn Connection>, ConnectionError> {
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        if self.server.refuse.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect("connection refused".into()));
        }
        let conn = Arc::new(MockConnection {
            pid: self.server.next_pid.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(ConnectionState::Connected),
            pending: AtomicUsize::new(0),
            sink: errors,
            killed: Notify::new(),
            cancelled: Arc::clone(&self.server.cancelled),
            fail_cancel: Arc::clone(&self.server.fail_cancel),
            idle_timeout: Mutex::new(None),
        });
        self.server.connections.lock().unwrap().push(Arc::clone(&conn));
        Ok(conn)
    }
}

/// Connection understanding a handful of statements:
/// `SELECT pg_sleep($1)`, anything starting with `INVALID`, the backend cancel
/// statement, and everything else as a one-row success.
#[derive(Debug)]
pub struct MockConnection {
    pid: u32,
    state: Mutex<ConnectionState>,
    pending: AtomicUsize,
    sink: ErrorSink,
    killed: Notify,
    cancelled: Arc<Mutex<Vec<u32>>>,
    fail_cancel: Arc<AtomicBool>,
    idle_timeout: Mutex<Option<Duration>>,
}

struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockConnection {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Simulate the transport dying: state goes to Ended, any running
    /// statement fails and the pool hears about it through the sink.
    pub fn disconnect(&self) {
        *self.state.lock().unwrap() = ConnectionState::Ended;
        self.killed.notify_waiters();
        self.sink
            .report(ConnectionError::Terminated("server closed the connection unexpectedly".into()));
    }

    /// End the connection without telling the pool.
    pub fn kill_silently(&self) {
        *self.state.lock().unwrap() = ConnectionState::Ended;
        self.killed.notify_waiters();
    }

    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        *self.idle_timeout.lock().unwrap() = timeout;
    }

    fn terminated() -> ConnectionError {
        ConnectionError::Terminated("Connection terminated".into())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, statement: &str, params: &[Value]) -> Result<QueryOutput, ConnectionError> {
        let killed = self.killed.notified();
        if !self.state().is_queryable() {
            return Err(Self::terminated());
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _busy = Busy(&self.pending);

        if statement.starts_with("INVALID") {
            return Err(ConnectionError::Query(format!(
                "syntax error at or near \"{}\"",
                statement.split_whitespace().next().unwrap_or_default()
            )));
        }

        if statement == CANCEL_BACKEND_STATEMENT {
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(ConnectionError::Query("permission denied to cancel query".into()));
            }
            let pid = params.first().and_then(Value::as_u64).unwrap_or_default() as u32;
            self.cancelled.lock().unwrap().push(pid);
            return Ok(QueryOutput {
                rows: vec![json!({ "pg_cancel_backend": true })],
                rows_affected: 1,
            });
        }

        if statement.contains("pg_sleep") {
            let secs = params.first().and_then(Value::as_f64).unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(secs)) => {}
                _ = killed => return Err(Self::terminated()),
            }
        }

        Ok(QueryOutput {
            rows: vec![json!({ "pid": self.pid })],
            rows_affected: 1,
        })
    }

    async fn close(&self) {
        *self.state.lock().unwrap() = ConnectionState::Ended;
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn pending_queries(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn idle_timeout(&self) -> Option<Duration> {
        *self.idle_timeout.lock().unwrap()
    }
}

/// Probe whose verdict is set by the test.
#[derive(Debug)]
pub struct FlagProbe {
    reachable: AtomicBool,
    calls: AtomicUsize,
}

impl FlagProbe {
    pub fn new(reachable: bool) -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(reachable),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for FlagProbe {
    async fn probe(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Pool config with a fast watcher, suitable for tests.
pub fn test_config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        reconnect_interval_ms: 20,
        ..PoolConfig::default()
    }
}

/// Build a pool over a fresh mock server with a reachable probe.
pub fn pool_with(config: PoolConfig) -> (HaPool, Arc<MockServer>, Arc<FlagProbe>) {
    let server = MockServer::new();
    let probe = FlagProbe::new(true);
    let pool = HaPool::with_probe(config, server.connector(), probe.clone());
    (pool, server, probe)
}

/// Poll `condition` until it holds, panicking after `timeout`.
pub async fn wait_for<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Receive the next event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut broadcast::Receiver<PoolEvent>) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .expect("event channel closed")
}

/// Receive the next error event, skipping ready events.
pub async fn next_error(rx: &mut broadcast::Receiver<PoolEvent>) -> (PoolError, Option<ConnectionId>) {
    loop {
        if let PoolEvent::Error { error, connection } = next_event(rx).await {
            return (error, connection);
        }
    }
}

/// Collect every event already published.
pub fn drain_events(rx: &mut broadcast::Receiver<PoolEvent>) -> Vec<PoolEvent> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Run `fut` as a task and hand back its join handle.
pub fn spawn<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut)
}

/// Start a fake database listener answering the liveness probe with `reply`.
pub async fn start_probe_target(reply: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 8];
                        let _ = socket.read_exact(&mut buf).await;
                        let _ = socket.write_all(reply).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// Error response a PostgreSQL server sends for an unsupported protocol version.
pub const FATAL_REPLY: &[u8] = b"E\x00\x00\x00\x54SFATAL\x00VFATAL\x00C0A000\x00Munsupported frontend protocol 0.0\x00\x00";
