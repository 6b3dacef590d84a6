//! Base connection pool primitive.
//!
//! # Responsibilities
//! - Bound the number of live connections
//! - Create connections lazily through the injected `Connector`
//! - Queue checkouts FIFO once capacity is reached
//! - Hand released connections to the oldest waiter
//! - Remove ended connections from the live set
//!
//! # Design Decisions
//! - All state sits behind one `std::sync::Mutex`, never held across an await
//! - Creation slots are reserved before connecting so capacity is never exceeded
//! - Every hand-out (`Checkout`, `Reservation`) returns itself to the pool on drop,
//!   so callers that time out or get cancelled cannot leak capacity

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};

use crate::net::{Connection, ConnectionError, ConnectionId, ConnectionState, Connector, ErrorListener, ErrorSink};
use crate::pool::types::{PoolError, PoolResult};

type GrantSender = oneshot::Sender<PoolResult<Grant>>;

/// Receiving end of a queued checkout.
pub type GrantReceiver = oneshot::Receiver<PoolResult<Grant>>;

/// What a checkout is entitled to.
#[derive(Debug)]
pub enum Grant {
    /// An idle connection, now leased.
    Ready(Checkout),
    /// A reserved slot; the holder must establish the connection.
    Create(Reservation),
}

/// Outcome of `acquire_or_queue`.
#[derive(Debug)]
pub enum Acquire {
    Granted(Grant),
    Queued(GrantReceiver),
}

/// Point-in-time view of one live connection.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: ConnectionId,
    pub process_id: Option<u32>,
    pub state: ConnectionState,
    pub pending_queries: usize,
    pub leased: bool,
    pub lease_start: Instant,
    /// Per-connection override reported by the connection itself.
    pub idle_timeout: Option<Duration>,
}

impl SlotInfo {
    /// No statement running or queued.
    pub fn is_idle(&self) -> bool {
        self.pending_queries == 0
    }
}

/// An ended connection found in the live set.
#[derive(Debug, Clone)]
pub struct DefunctSlot {
    pub id: ConnectionId,
    pub process_id: Option<u32>,
    pub(crate) sink: ErrorSink,
}

struct Slot {
    id: ConnectionId,
    conn: Arc<dyn Connection>,
    sink: ErrorSink,
    /// Released flag of the current lease, if any.
    lease: Option<Arc<AtomicBool>>,
    lease_start: Instant,
}

impl Slot {
    fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            process_id: self.conn.process_id(),
            state: self.conn.state(),
            pending_queries: self.conn.pending_queries(),
            leased: self.lease.is_some(),
            lease_start: self.lease_start,
            idle_timeout: self.conn.idle_timeout(),
        }
    }
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    connecting: usize,
    waiters: VecDeque<GrantSender>,
    closed: bool,
}

/// Bounded pool of connections with a FIFO wait queue.
pub struct BasePool {
    connector: Arc<dyn Connector>,
    capacity: usize,
    listener: Weak<dyn ErrorListener>,
    state: Mutex<State>,
    /// Signalled whenever a slot is released, removed or reserved capacity returns.
    changed: Notify,
}

impl BasePool {
    pub fn new(connector: Arc<dyn Connector>, capacity: usize, listener: Weak<dyn ErrorListener>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            capacity,
            listener,
            state: Mutex::new(State::default()),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hand out an idle connection or a creation slot, without waiting.
    pub fn try_acquire(self: &Arc<Self>) -> PoolResult<Option<Grant>> {
        let mut guard = self.lock();
        self.grant_locked(&mut guard)
    }

    /// Like `try_acquire`, but joins the wait queue instead of returning nothing.
    pub fn acquire_or_queue(self: &Arc<Self>) -> PoolResult<Acquire> {
        let mut guard = self.lock();
        if let Some(grant) = self.grant_locked(&mut guard)? {
            return Ok(Acquire::Granted(grant));
        }
        let (tx, rx) = oneshot::channel();
        guard.waiters.push_back(tx);
        tracing::debug!(pending = guard.waiters.len(), "Checkout queued");
        Ok(Acquire::Queued(rx))
    }

    /// Establish a connection for a reserved slot and lease it.
    pub async fn establish(self: &Arc<Self>, reservation: Reservation) -> PoolResult<Checkout> {
        let id = ConnectionId::new();
        let sink = ErrorSink::new(id, self.listener.clone());

        let conn = match self.connector.connect(sink.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                // Dropping the reservation frees the slot for the next waiter.
                drop(reservation);
                tracing::warn!(error = %e, "Failed to establish connection");
                return Err(match e {
                    ConnectionError::Connect(msg) => PoolError::Connect(msg),
                    other => PoolError::Connect(other.to_string()),
                });
            }
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        reservation.disarm();
        state.connecting -= 1;

        if state.closed {
            drop(guard);
            spawn_close(conn);
            self.changed.notify_waiters();
            return Err(PoolError::ShuttingDown);
        }

        let released = Arc::new(AtomicBool::new(false));
        state.slots.push(Slot {
            id,
            conn: Arc::clone(&conn),
            sink: sink.clone(),
            lease: Some(Arc::clone(&released)),
            lease_start: Instant::now(),
        });
        let live = state.slots.len();
        drop(guard);

        tracing::debug!(connection_id = %id, process_id = ?conn.process_id(), live, "Connection established");
        Ok(Checkout {
            pool: Arc::clone(self),
            id,
            conn,
            sink,
            released,
        })
    }

    /// Return a leased connection. Identified by the lease's released flag so a
    /// stale lease can never release somebody else's checkout.
    fn release_slot(self: &Arc<Self>, id: ConnectionId, ticket: &Arc<AtomicBool>) -> PoolResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let pos = state
            .slots
            .iter()
            .position(|s| s.id == id && s.lease.as_ref().is_some_and(|l| Arc::ptr_eq(l, ticket)))
            .ok_or(PoolError::Vacated(id))?;

        state.slots[pos].lease = None;
        if state.closed || state.slots[pos].conn.state().is_defunct() {
            let slot = state.slots.remove(pos);
            tracing::debug!(connection_id = %id, "Released connection removed from pool");
            spawn_close(slot.conn);
        }

        self.pulse_locked(state);
        drop(guard);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Remove a connection from the live set whatever its lease state.
    pub fn retire(self: &Arc<Self>, id: ConnectionId) -> PoolResult<()> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let pos = state
            .slots
            .iter()
            .position(|s| s.id == id)
            .ok_or(PoolError::Vacated(id))?;
        let slot = state.slots.remove(pos);
        spawn_close(slot.conn);

        self.pulse_locked(state);
        drop(guard);
        self.changed.notify_waiters();
        tracing::debug!(connection_id = %id, "Connection retired");
        Ok(())
    }

    /// Reclaim a leased connection that has no statement in flight, flagging
    /// its lease as released. Returns `false` if it was not leased or is busy.
    pub fn force_release(self: &Arc<Self>, id: ConnectionId) -> PoolResult<bool> {
        let mut guard = self.lock();
        let state = &mut *guard;

        let pos = state
            .slots
            .iter()
            .position(|s| s.id == id)
            .ok_or(PoolError::Vacated(id))?;
        let slot = &mut state.slots[pos];
        if slot.conn.pending_queries() > 0 {
            return Ok(false);
        }
        let Some(ticket) = slot.lease.take() else {
            return Ok(false);
        };
        ticket.store(true, Ordering::SeqCst);

        if state.closed || state.slots[pos].conn.state().is_defunct() {
            let slot = state.slots.remove(pos);
            spawn_close(slot.conn);
        }

        self.pulse_locked(state);
        drop(guard);
        self.changed.notify_waiters();
        Ok(true)
    }

    /// Record the start of a new lease.
    pub fn stamp_lease(&self, id: ConnectionId) {
        let mut guard = self.lock();
        if let Some(slot) = guard.slots.iter_mut().find(|s| s.id == id && s.lease.is_some()) {
            slot.lease_start = Instant::now();
        }
    }

    /// Ids and process ids of every ended connection, most recent first.
    pub fn defunct(&self) -> Vec<DefunctSlot> {
        self.lock()
            .slots
            .iter()
            .rev()
            .filter(|s| s.conn.state().is_defunct())
            .map(|s| DefunctSlot {
                id: s.id,
                process_id: s.conn.process_id(),
                sink: s.sink.clone(),
            })
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().slots.iter().any(|s| s.id == id)
    }

    pub fn slot(&self, id: ConnectionId) -> Option<SlotInfo> {
        self.lock().slots.iter().find(|s| s.id == id).map(Slot::info)
    }

    pub fn snapshot(&self) -> Vec<SlotInfo> {
        self.lock().slots.iter().map(Slot::info).collect()
    }

    /// Live connections, including those still being established.
    pub fn size(&self) -> usize {
        let guard = self.lock();
        guard.slots.len() + guard.connecting
    }

    /// Checkouts still waiting for a connection.
    pub fn pending(&self) -> usize {
        self.lock().waiters.iter().filter(|w| !w.is_closed()).count()
    }

    /// Drop waiters whose caller gave up.
    pub fn prune_waiters(&self) {
        self.lock().waiters.retain(|w| !w.is_closed());
    }

    /// Fail every queued checkout with `error`. Returns how many callers were notified.
    pub fn reject_waiters(&self, error: PoolError) -> usize {
        let waiters: Vec<_> = self.lock().waiters.drain(..).collect();
        waiters
            .into_iter()
            .filter_map(|w| w.send(Err(error.clone())).ok())
            .count()
    }

    /// Resolve once `id` is no longer leased (released, reclaimed or retired).
    pub async fn wait_released(&self, id: ConnectionId) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let leased = self.lock().slots.iter().any(|s| s.id == id && s.lease.is_some());
            if !leased {
                return;
            }
            notified.await;
        }
    }

    /// Stop handing out connections, close idle ones and wait until every
    /// leased connection has come back.
    pub async fn close(self: &Arc<Self>) {
        let (idle, waiters) = {
            let mut guard = self.lock();
            let state = &mut *guard;
            state.closed = true;
            let waiters: Vec<_> = state.waiters.drain(..).collect();
            let mut idle = Vec::new();
            state.slots.retain(|s| {
                if s.lease.is_none() {
                    idle.push(Arc::clone(&s.conn));
                    false
                } else {
                    true
                }
            });
            (idle, waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Err(PoolError::ShuttingDown));
        }
        for conn in idle {
            spawn_close(conn);
        }
        self.changed.notify_waiters();

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (live, connecting) = {
                let guard = self.lock();
                (guard.slots.len(), guard.connecting)
            };
            if live == 0 && connecting == 0 {
                break;
            }
            tracing::debug!(live, connecting, "Waiting for leased connections before closing");
            notified.await;
        }
        tracing::debug!("Base pool closed");
    }

    fn grant_locked(self: &Arc<Self>, state: &mut State) -> PoolResult<Option<Grant>> {
        if state.closed {
            return Err(PoolError::ShuttingDown);
        }
        self.evict_idle_defunct(state);

        if let Some(slot) = state.slots.iter_mut().find(|s| s.lease.is_none()) {
            return Ok(Some(Grant::Ready(self.lease_slot(slot))));
        }
        if state.slots.len() + state.connecting < self.capacity {
            state.connecting += 1;
            return Ok(Some(Grant::Create(Reservation::new(Arc::clone(self)))));
        }
        Ok(None)
    }

    /// Serve queued checkouts from idle connections or free capacity.
    fn pulse_locked(self: &Arc<Self>, state: &mut State) {
        if state.closed {
            return;
        }
        self.evict_idle_defunct(state);

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }
            let grant = if let Some(slot) = state.slots.iter_mut().find(|s| s.lease.is_none()) {
                Grant::Ready(self.lease_slot(slot))
            } else if state.slots.len() + state.connecting < self.capacity {
                state.connecting += 1;
                Grant::Create(Reservation::new(Arc::clone(self)))
            } else {
                state.waiters.push_front(waiter);
                break;
            };

            if let Err(Ok(grant)) = waiter.send(Ok(grant)) {
                // Caller went away between the check and the send.
                self.revoke_locked(state, grant);
            }
        }
    }

    fn revoke_locked(&self, state: &mut State, grant: Grant) {
        match grant {
            Grant::Ready(checkout) => {
                if let Some(slot) = state.slots.iter_mut().find(|s| s.id == checkout.id) {
                    slot.lease = None;
                }
                checkout.disarm();
            }
            Grant::Create(reservation) => {
                state.connecting -= 1;
                reservation.disarm();
            }
        }
    }

    fn lease_slot(self: &Arc<Self>, slot: &mut Slot) -> Checkout {
        let released = Arc::new(AtomicBool::new(false));
        slot.lease = Some(Arc::clone(&released));
        Checkout {
            pool: Arc::clone(self),
            id: slot.id,
            conn: Arc::clone(&slot.conn),
            sink: slot.sink.clone(),
            released,
        }
    }

    fn evict_idle_defunct(&self, state: &mut State) {
        let before = state.slots.len();
        state.slots.retain(|s| {
            let evict = s.lease.is_none() && s.conn.state().is_defunct();
            if evict {
                tracing::debug!(connection_id = %s.id, "Evicting ended idle connection");
                spawn_close(Arc::clone(&s.conn));
            }
            !evict
        });
        if state.slots.len() != before {
            self.changed.notify_waiters();
        }
    }

    fn cancel_reservation(self: &Arc<Self>) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.connecting -= 1;
        self.pulse_locked(state);
        drop(guard);
        self.changed.notify_waiters();
    }
}

impl fmt::Debug for BasePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.lock();
        f.debug_struct("BasePool")
            .field("capacity", &self.capacity)
            .field("live", &guard.slots.len())
            .field("connecting", &guard.connecting)
            .field("pending", &guard.waiters.len())
            .field("closed", &guard.closed)
            .finish()
    }
}

/// A leased connection as handed out by the base pool.
///
/// Returned to the pool on `release` or when dropped.
pub struct Checkout {
    pool: Arc<BasePool>,
    id: ConnectionId,
    conn: Arc<dyn Connection>,
    sink: ErrorSink,
    released: Arc<AtomicBool>,
}

impl Checkout {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Sink reporting errors against this connection.
    pub fn error_sink(&self) -> &ErrorSink {
        &self.sink
    }

    /// Give the connection back. Fails if this lease was already released.
    pub fn release(&self) -> PoolResult<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(PoolError::UseAfterRelease);
        }
        self.pool.release_slot(self.id, &self.released)
    }

    /// Drop without returning the slot; the caller already fixed the bookkeeping.
    fn disarm(self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.pool.release_slot(self.id, &self.released) {
                tracing::debug!(connection_id = %self.id, error = %e, "Dropped lease was already vacated");
            }
        }
    }
}

impl fmt::Debug for Checkout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Capacity reserved for a connection that is about to be established.
pub struct Reservation {
    pool: Arc<BasePool>,
    armed: bool,
}

impl Reservation {
    fn new(pool: Arc<BasePool>) -> Self {
        Self { pool, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            self.pool.cancel_reservation();
        }
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation").field("armed", &self.armed).finish()
    }
}

fn spawn_close(conn: Arc<dyn Connection>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { conn.close().await });
        }
        Err(_) => tracing::debug!("No runtime available, connection dropped without close"),
    }
}
