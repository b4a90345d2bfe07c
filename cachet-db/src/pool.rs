//! Database connection pool.
//!
//! A bounded set of connections keyed by an opaque [`ConnectionId`].
//! [`Pool::acquire`] hands out a [`PoolGuard`] that exclusively borrows one
//! connection; the handle physically leaves its slot while borrowed, so the
//! same connection can never be lent twice. A background worker validates
//! free connections every tick, disposes of connections flagged broken by
//! their borrowers, and refills the pool to its minimum size, backing off
//! while the server refuses connects.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use cachet_core::config::PoolConfig;
use cachet_core::error::{QueryError, QueryResult};

use crate::connector::Connector;

/// Smallest pause between health-check sweeps. A configured interval of zero
/// is clamped up to this so the worker never busy-spins.
pub const MIN_HEALTH_TICK: Duration = Duration::from_millis(100);

/// Opaque identity of one pooled connection, allocated monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Usage accounting for one pooled connection.
#[derive(Debug, Clone)]
pub struct ConnectionMetrics {
    /// When the connection was opened.
    pub created_at: Instant,
    /// Last time it was handed out.
    pub last_acquired_at: Option<Instant>,
    /// Last time it came back.
    pub last_released_at: Option<Instant>,
    /// Accumulated time spent checked out.
    pub total_in_use: Duration,
    /// Duration of the most recent checkout.
    pub last_in_use: Duration,
    /// How many times the connection was handed out.
    pub usage_count: u64,
}

impl ConnectionMetrics {
    fn new() -> Self {
        Self {
            created_at: Instant::now(),
            last_acquired_at: None,
            last_released_at: None,
            total_in_use: Duration::ZERO,
            last_in_use: Duration::ZERO,
            usage_count: 0,
        }
    }
}

/// One pool slot. The handle is present while the connection is free and
/// taken while it is checked out (by a borrower or by the health sweep).
#[derive(Debug)]
struct Slot<H> {
    handle: Option<H>,
    metrics: ConnectionMetrics,
}

/// A connection flagged broken by its last borrower, waiting for its close.
#[derive(Debug)]
struct Doomed<H> {
    id: ConnectionId,
    handle: H,
    usage_count: u64,
}

#[derive(Debug)]
struct PoolState<H> {
    slots: BTreeMap<ConnectionId, Slot<H>>,
    doomed: Vec<Doomed<H>>,
    /// Connects in flight; counted against `max_size` so concurrent
    /// emergency creates cannot overshoot the cap.
    creating: usize,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Live connections (free + checked out).
    pub total: usize,
    /// Free connections.
    pub available: usize,
    /// Connections awaiting disposal.
    pub pending_removal: usize,
}

/// No-connect window maintained after refused connects. The window starts at
/// one health-check interval and doubles per refusal, capped at eight
/// intervals, so a down server sees at most one connect attempt per interval.
#[derive(Debug)]
struct RefusalBackoff {
    until: Option<Instant>,
    delay: Duration,
}

impl RefusalBackoff {
    fn idle() -> Self {
        Self {
            until: None,
            delay: Duration::ZERO,
        }
    }

    fn note_refused(&mut self, base: Duration) {
        self.delay = if self.delay.is_zero() {
            base
        } else {
            (self.delay * 2).min(base * 8)
        };
        self.until = Some(Instant::now() + self.delay);
    }

    fn note_success(&mut self) {
        *self = Self::idle();
    }

    fn is_active(&self) -> bool {
        self.until.is_some_and(|until| Instant::now() < until)
    }
}

#[derive(Debug)]
struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C::Handle>>,
    backoff: Mutex<RefusalBackoff>,
    /// Cancelled at shutdown; wakes the health worker and parked acquires.
    shutdown: CancellationToken,
    /// Signaled once per release so one parked acquire can rescan.
    released: Notify,
    /// Consecutive acquires that came back empty-handed; reset by any
    /// successful create. May briefly over-count across threads.
    saturation: AtomicUsize,
    next_id: AtomicU64,
}

impl<C: Connector> PoolInner<C> {
    fn state(&self) -> MutexGuard<'_, PoolState<C::Handle>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backoff(&self) -> MutexGuard<'_, RefusalBackoff> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn live_count(&self) -> usize {
        self.state().slots.len()
    }

    fn tick_interval(&self) -> Duration {
        self.config.health_check_interval().max(MIN_HEALTH_TICK)
    }

    fn stats(&self) -> PoolStats {
        let state = self.state();
        let available = state.slots.values().filter(|s| s.handle.is_some()).count();
        PoolStats {
            total: state.slots.len(),
            available,
            pending_removal: state.doomed.len(),
        }
    }

    /// Take the first free handle out of its slot (map-iteration order).
    fn checkout_first_free(&self) -> Option<(ConnectionId, C::Handle)> {
        let mut state = self.state();
        for (id, slot) in state.slots.iter_mut() {
            if let Some(handle) = slot.handle.take() {
                return Some((*id, handle));
            }
        }
        None
    }

    /// Put a handle back after a health-sweep validation.
    fn restore(&self, id: ConnectionId, handle: C::Handle) {
        let mut state = self.state();
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.handle = Some(handle);
        }
        drop(state);
        self.released.notify_one();
    }

    /// Stamp checkout metrics on a successful acquire.
    fn stamp_acquired(&self, id: ConnectionId) {
        let mut state = self.state();
        if let Some(slot) = state.slots.get_mut(&id) {
            slot.metrics.last_acquired_at = Some(Instant::now());
            slot.metrics.usage_count += 1;
        }
    }

    /// Forget a connection that failed its probe and close it on the spot.
    async fn evict(&self, id: ConnectionId, handle: C::Handle, why: &QueryError) {
        let usage_count = {
            let mut state = self.state();
            state
                .slots
                .remove(&id)
                .map(|slot| slot.metrics.usage_count)
                .unwrap_or(0)
        };
        tracing::info!(connection = %id, usage_count, "Evicting invalid connection: {}", why);
        self.connector.close(handle).await;
    }

    /// Open and validate one fresh connection.
    async fn open_validated(&self) -> QueryResult<C::Handle> {
        let mut handle = self.connector.open().await?;
        self.connector
            .validate(&mut handle, self.config.validate_using_transaction)
            .await?;
        Ok(handle)
    }

    /// One create attempt honoring `max_size` and the refusal backoff.
    /// `Ok(None)` means capacity or the backoff window said no.
    async fn try_create(&self) -> QueryResult<Option<C::Handle>> {
        if self.backoff().is_active() {
            return Ok(None);
        }
        {
            let mut state = self.state();
            if state.slots.len() + state.creating >= self.config.max_size as usize {
                return Ok(None);
            }
            state.creating += 1;
        }

        let result = self.open_validated().await;
        self.state().creating -= 1;

        match result {
            Ok(handle) => {
                self.backoff().note_success();
                self.saturation.store(0, Ordering::Relaxed);
                Ok(Some(handle))
            }
            Err(err) => {
                if err.is_broken() {
                    self.backoff().note_refused(self.tick_interval());
                }
                Err(err)
            }
        }
    }

    fn insert_free(&self, handle: C::Handle) -> ConnectionId {
        let id = self.allocate_id();
        self.state().slots.insert(
            id,
            Slot {
                handle: Some(handle),
                metrics: ConnectionMetrics::new(),
            },
        );
        id
    }

    /// Register an emergency-created connection that goes straight to its
    /// borrower.
    fn insert_checked_out(&self) -> ConnectionId {
        let id = self.allocate_id();
        let mut metrics = ConnectionMetrics::new();
        metrics.last_acquired_at = Some(Instant::now());
        metrics.usage_count = 1;
        self.state().slots.insert(
            id,
            Slot {
                handle: None,
                metrics,
            },
        );
        id
    }

    /// Top the pool back up to `min_size`, stopping at the first failed
    /// connect so a down server is probed at most once per window.
    async fn refill(&self) {
        while self.live_count() < self.config.min_size as usize {
            match self.try_create().await {
                Ok(Some(handle)) => {
                    let id = self.insert_free(handle);
                    tracing::info!(
                        connection = %id,
                        total = self.live_count(),
                        "New database connection established"
                    );
                    self.released.notify_one();
                }
                Ok(None) => break,
                Err(err) if err.is_broken() => {
                    tracing::error!("Database unreachable while refilling pool: {}", err);
                    break;
                }
                Err(err) => {
                    tracing::warn!("Connection create failed during refill: {}", err);
                    break;
                }
            }
        }
    }

    /// Validate every free connection, evicting the invalid ones. Each
    /// candidate is taken out of its slot first so nobody acquires it
    /// mid-validation.
    async fn sweep(&self) {
        let ids: Vec<ConnectionId> = {
            let state = self.state();
            state
                .slots
                .iter()
                .filter(|(_, slot)| slot.handle.is_some())
                .map(|(id, _)| *id)
                .collect()
        };

        for id in ids {
            let handle = {
                let mut state = self.state();
                state.slots.get_mut(&id).and_then(|slot| slot.handle.take())
            };
            // Acquired (or evicted) since we collected the id.
            let Some(mut handle) = handle else { continue };

            match self
                .connector
                .validate(&mut handle, self.config.validate_using_transaction)
                .await
            {
                Ok(()) => self.restore(id, handle),
                Err(err) => {
                    tracing::info!(connection = %id, "Invalid connection marked for removal");
                    self.evict(id, handle, &err).await;
                }
            }
        }
    }

    /// Close connections flagged broken by their last borrower.
    async fn drain_doomed(&self) {
        let doomed = {
            let mut state = self.state();
            std::mem::take(&mut state.doomed)
        };
        for doomed in doomed {
            tracing::debug!(
                connection = %doomed.id,
                usage_count = doomed.usage_count,
                "Closing connection flagged broken"
            );
            self.connector.close(doomed.handle).await;
        }
    }

    /// Count one empty-handed acquire; warn once per threshold batch.
    fn note_saturation(&self) {
        let current = self.saturation.fetch_add(1, Ordering::AcqRel) + 1;
        if current >= self.config.log_saturation_threshold
            && self
                .saturation
                .compare_exchange(current, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            tracing::warn!(
                failed_requests = current,
                "Unable to acquire database connection (pool busy); raise pool.max_size or shrink the caller thread pool"
            );
        }
    }
}

/// Background sweep: validate free connections, dispose of flagged ones,
/// refill to the minimum, then sleep until the next tick or shutdown.
async fn health_check_loop<C: Connector>(inner: Arc<PoolInner<C>>) {
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        tracing::debug!("Health check tick");
        inner.sweep().await;
        inner.drain_doomed().await;
        inner.refill().await;

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(inner.tick_interval()) => {}
        }
    }
    tracing::debug!("Health-check worker stopped");
}

/// Bounded, health-checked database connection pool.
#[derive(Debug)]
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> Pool<C> {
    /// Create the pool: fill to `min_size` (best effort — a down server
    /// logs and leaves the refill to the health worker) and start the
    /// health-check worker.
    pub async fn new(connector: C, config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            connector,
            config,
            state: Mutex::new(PoolState {
                slots: BTreeMap::new(),
                doomed: Vec::new(),
                creating: 0,
            }),
            backoff: Mutex::new(RefusalBackoff::idle()),
            shutdown: CancellationToken::new(),
            released: Notify::new(),
            saturation: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        });

        tracing::info!(
            min_size = inner.config.min_size,
            max_size = inner.config.max_size,
            "Database connection pool created"
        );

        inner.refill().await;

        let worker = tokio::spawn(health_check_loop(Arc::clone(&inner)));

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Borrow one connection exclusively.
    ///
    /// Returns `Ok(None)` when the pool is shut down, or when every
    /// connection stayed busy for the whole `acquire_wait` window
    /// (saturation). Returns `Err(Broken)` when the emergency connect
    /// failed for connectivity reasons.
    pub async fn acquire(&self) -> QueryResult<Option<PoolGuard<C>>> {
        let deadline = Instant::now() + self.inner.config.acquire_wait();
        let mut may_create = true;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Ok(None);
            }

            if let Some(guard) = self.try_acquire(may_create).await? {
                return Ok(Some(guard));
            }
            may_create = false;

            if Instant::now() >= deadline {
                break;
            }
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Ok(None),
                _ = self.inner.released.notified() => {}
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        self.inner.note_saturation();
        Ok(None)
    }

    /// One pass over the free list, plus at most one emergency create per
    /// acquire call.
    async fn try_acquire(&self, may_create: bool) -> QueryResult<Option<PoolGuard<C>>> {
        while let Some((id, mut handle)) = self.inner.checkout_first_free() {
            let probe = if self.inner.config.validate_before_acquire {
                self.inner
                    .connector
                    .validate(&mut handle, self.inner.config.validate_using_transaction)
                    .await
            } else {
                self.inner.connector.ping(&mut handle).await
            };

            match probe {
                Ok(()) => {
                    self.inner.stamp_acquired(id);
                    return Ok(Some(PoolGuard::new(Arc::clone(&self.inner), id, handle)));
                }
                // The scan continues past a stale connection.
                Err(err) => self.inner.evict(id, handle, &err).await,
            }
        }

        if !may_create {
            return Ok(None);
        }
        match self.inner.try_create().await {
            Ok(Some(handle)) => {
                let id = self.inner.insert_checked_out();
                tracing::info!(
                    connection = %id,
                    total = self.inner.live_count(),
                    "New database connection established"
                );
                Ok(Some(PoolGuard::new(Arc::clone(&self.inner), id, handle)))
            }
            Ok(None) => Ok(None),
            Err(err) if err.is_broken() => Err(err),
            // Acquire's error surface is the broken kind only: a connection
            // that could not be created is broken no matter how the
            // connector reported the failure.
            Err(err) => Err(QueryError::broken(format!(
                "emergency connect failed: {err}"
            ))),
        }
    }

    /// Point-in-time pool counters.
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Usage snapshot of every live connection, in id order.
    pub fn connection_metrics(&self) -> Vec<(ConnectionId, ConnectionMetrics)> {
        let state = self.inner.state();
        state
            .slots
            .iter()
            .map(|(id, slot)| (*id, slot.metrics.clone()))
            .collect()
    }

    /// Whether the pool still hands out connections.
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Orderly shutdown: stop handing out connections, wake every waiter,
    /// join the health worker, then close everything still in the pool.
    /// Idempotent; a second call is a no-op.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        self.inner.released.notify_waiters();

        let worker = {
            let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
            worker.take()
        };
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::debug!("Health-check worker ended abnormally: {}", err);
            }
        } else {
            // Second shutdown: everything below already ran.
            return;
        }

        let (slots, doomed) = {
            let mut state = self.inner.state();
            (
                std::mem::take(&mut state.slots),
                std::mem::take(&mut state.doomed),
            )
        };

        let mut closed = 0usize;
        for (id, slot) in slots {
            // Checked-out handles come home through their guard's drop and
            // are discarded there once the slot is gone.
            if let Some(handle) = slot.handle {
                tracing::debug!(
                    connection = %id,
                    usage_count = slot.metrics.usage_count,
                    "Closing connection"
                );
                self.inner.connector.close(handle).await;
                closed += 1;
            }
        }
        for doomed in doomed {
            tracing::debug!(
                connection = %doomed.id,
                usage_count = doomed.usage_count,
                "Closing connection flagged broken"
            );
            self.inner.connector.close(doomed.handle).await;
            closed += 1;
        }

        tracing::info!(closed, "Database connection pool shut down");
    }
}

impl<C: Connector> Drop for Pool<C> {
    /// Best effort when `close` was never awaited: unblock parked acquires
    /// and let the worker observe the cancellation.
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.released.notify_waiters();
    }
}

/// Exclusive borrow of one pooled connection.
///
/// Dropping the guard returns the connection on every exit path — normal,
/// early return, unwinding — updates its metrics, and wakes one waiter. A
/// guard flagged broken routes the connection to the disposal list instead.
#[derive(Debug)]
pub struct PoolGuard<C: Connector> {
    inner: Arc<PoolInner<C>>,
    id: ConnectionId,
    handle: Option<C::Handle>,
    acquired_at: Instant,
    broken: bool,
}

impl<C: Connector> PoolGuard<C> {
    fn new(inner: Arc<PoolInner<C>>, id: ConnectionId, handle: C::Handle) -> Self {
        Self {
            inner,
            id,
            handle: Some(handle),
            acquired_at: Instant::now(),
            broken: false,
        }
    }

    /// Identity of the borrowed connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The borrowed connection.
    pub fn connection(&mut self) -> &mut C::Handle {
        match self.handle.as_mut() {
            Some(handle) => handle,
            // The slot is only emptied by drop.
            None => unreachable!("pool guard used after release"),
        }
    }

    /// Mark the connection broken; drop will route it to disposal instead
    /// of back into the free set.
    pub fn flag_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Drop for PoolGuard<C> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let in_use = self.acquired_at.elapsed();

        let mut state = self.inner.state();
        if self.broken {
            if let Some(slot) = state.slots.remove(&self.id) {
                state.doomed.push(Doomed {
                    id: self.id,
                    handle,
                    usage_count: slot.metrics.usage_count,
                });
            }
            // No slot: the pool already shut down; the handle just drops.
        } else if let Some(slot) = state.slots.get_mut(&self.id) {
            slot.metrics.last_released_at = Some(Instant::now());
            slot.metrics.last_in_use = in_use;
            slot.metrics.total_in_use += in_use;
            slot.handle = Some(handle);
        }
        drop(state);

        self.inner.released.notify_one();
    }
}
