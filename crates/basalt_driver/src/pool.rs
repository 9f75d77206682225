//! Per-host connection pool.
//!
//! Sized between `core` and `max` for the host's distance class. Borrowing
//! picks the least-loaded open connection (insertion order breaks ties) and
//! reserves a slot before any stream id is allocated, so concurrent borrows
//! cannot oversubscribe a connection. When every connection is saturated the
//! borrower parks on a bounded waiter queue while an extra connection is
//! opened asynchronously; queue overflow surfaces as a busy-pool error.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::cluster::Host;
use crate::config::PoolingOptions;
use crate::connection::{open, ConnectOptions, Connection, Reservation};
use crate::errors::AttemptError;
use crate::policies::HostDistance;

pub(crate) struct HostPool {
    host: Arc<Host>,
    core: usize,
    max: usize,
    options: PoolingOptions,
    connect: ConnectOptions,
    connections: RwLock<Vec<Arc<Connection>>>,
    /// Out of rotation, kept alive until their in-flight responses drain.
    trashed: RwLock<Vec<Arc<Connection>>>,
    next_sequence: AtomicUsize,
    /// One async grow at a time.
    growing: AtomicBool,
    waiters: AtomicUsize,
    /// Pinged when capacity frees up or a connection is added.
    available: Arc<Notify>,
    closed: AtomicBool,
}

impl HostPool {
    pub(crate) fn new(
        host: Arc<Host>,
        distance: HostDistance,
        options: PoolingOptions,
        connect: ConnectOptions,
    ) -> Arc<HostPool> {
        Arc::new(HostPool {
            host,
            core: options.core_connections(distance),
            max: options.max_connections(distance).max(1),
            options,
            connect,
            connections: RwLock::new(Vec::new()),
            trashed: RwLock::new(Vec::new()),
            next_sequence: AtomicUsize::new(0),
            growing: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
            available: Arc::new(Notify::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Open connections up to `core`; errors are returned so the caller can
    /// decide whether the host is reachable at all.
    pub(crate) async fn ensure_core(self: &Arc<Self>) -> Result<(), AttemptError> {
        while self.open_connection_count() < self.core && !self.is_closed() {
            self.add_connection().await.map_err(|err| {
                debug!(host = %self.host.address(), error = %err, "core connection failed");
                err
            })?;
        }
        Ok(())
    }

    async fn add_connection(self: &Arc<Self>) -> Result<(), AttemptError> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        let connection = open(
            self.host.address(),
            &self.connect,
            sequence,
            self.available.clone(),
        )
        .await
        .map_err(|err| AttemptError::Connection(crate::errors::ConnectionError::ConnectFailed {
            address: self.host.address(),
            detail: err.to_string(),
        }))?;
        self.connections
            .write()
            .expect("pool lock")
            .push(connection);
        self.available.notify_waiters();
        Ok(())
    }

    fn open_connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("pool lock")
            .iter()
            .filter(|connection| connection.is_open())
            .count()
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.read().expect("pool lock").len()
    }

    pub(crate) fn total_in_flight(&self) -> usize {
        let live: usize = self
            .connections
            .read()
            .expect("pool lock")
            .iter()
            .map(|connection| connection.in_flight())
            .sum();
        let draining: usize = self
            .trashed
            .read()
            .expect("pool lock")
            .iter()
            .map(|connection| connection.in_flight())
            .sum();
        live + draining
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop connections that died underneath us.
    fn prune_closed(&self) {
        self.connections
            .write()
            .expect("pool lock")
            .retain(|connection| !connection.is_closed());
        self.trashed
            .write()
            .expect("pool lock")
            .retain(|connection| !connection.is_closed());
    }

    fn pick_least_loaded(&self) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .expect("pool lock")
            .iter()
            .filter(|connection| connection.is_open())
            .filter(|connection| connection.load() < self.options.max_requests_per_connection)
            .min_by_key(|connection| (connection.load(), connection.sequence))
            .cloned()
    }

    /// Borrow capacity on the least-loaded connection.
    pub(crate) async fn borrow(self: &Arc<Self>) -> Result<Reservation, AttemptError> {
        let address = self.host.address();
        let mut parked: Option<WaiterGuard<'_>> = None;
        loop {
            if self.is_closed() {
                return Err(AttemptError::NoPool { address });
            }
            self.prune_closed();

            // Arm the wakeup before checking capacity, so a release that
            // lands between the check and the await is not missed.
            let available = self.available.notified();

            if let Some(connection) = self.pick_least_loaded() {
                let reservation = connection.reserve();
                // Re-check after reserving: a racing borrower may have taken
                // the last slot between selection and reservation.
                if connection.is_open()
                    && connection.load() <= self.options.max_requests_per_connection
                {
                    self.maybe_grow();
                    return Ok(reservation);
                }
                drop(reservation);
                continue;
            }

            // No capacity anywhere: grow if allowed, then park.
            self.maybe_grow();
            if parked.is_none() {
                let queued = self.waiters.fetch_add(1, Ordering::AcqRel);
                if queued >= self.options.max_queued_requests {
                    self.waiters.fetch_sub(1, Ordering::AcqRel);
                    return Err(AttemptError::BusyPool { address });
                }
                parked = Some(WaiterGuard { pool: self });
            }
            available.await;
        }
    }

    /// Add a connection asynchronously when the pool is saturated or running
    /// hot, up to `max`.
    fn maybe_grow(self: &Arc<Self>) {
        let (count, total_load) = {
            let connections = self.connections.read().expect("pool lock");
            let open: Vec<_> = connections
                .iter()
                .filter(|connection| connection.is_open())
                .collect();
            (
                open.len(),
                open.iter().map(|connection| connection.load()).sum::<usize>(),
            )
        };
        if count >= self.max {
            return;
        }
        let capacity = self.options.max_requests_per_connection * count.max(1);
        let busy = count == 0
            || total_load as f64 > capacity as f64 * self.options.resize_busy_ratio;
        if !busy {
            return;
        }
        if self.growing.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = self.clone();
        tokio::spawn(async move {
            if !pool.is_closed() && pool.connection_count() < pool.max {
                if let Err(err) = pool.add_connection().await {
                    warn!(host = %pool.host.address(), error = %err, "pool grow failed");
                }
            }
            pool.growing.store(false, Ordering::Release);
            pool.available.notify_waiters();
        });
    }

    /// Shrink by one connection when load has fallen back below the core
    /// watermark. The victim is trashed: it finishes its in-flight requests
    /// and is closed by maintenance once drained.
    fn maybe_shrink(&self) {
        let mut connections = self.connections.write().expect("pool lock");
        if connections.len() <= self.core {
            return;
        }
        let open_count = connections
            .iter()
            .filter(|connection| connection.is_open())
            .count();
        if open_count <= self.core {
            return;
        }
        let total_load: usize = connections.iter().map(|connection| connection.load()).sum();
        let idle_watermark = (self.options.max_requests_per_connection * self.core) as f64
            * self.options.resize_busy_ratio;
        if (total_load as f64) >= idle_watermark {
            return;
        }
        // Trash the most recently added idle-ish connection.
        if let Some(index) = connections
            .iter()
            .enumerate()
            .filter(|(_, connection)| connection.is_open())
            .max_by_key(|(_, connection)| connection.sequence)
            .map(|(index, _)| index)
        {
            let victim = connections.remove(index);
            victim.mark_trashed();
            debug!(host = %self.host.address(), "trashed surplus connection");
            self.trashed.write().expect("pool lock").push(victim);
        }
    }

    /// Periodic upkeep: close drained trashed connections, re-open toward
    /// core, shrink when idle.
    pub(crate) fn spawn_maintenance(self: &Arc<Self>, interval: Duration) {
        let pool = self.clone();
        tokio::spawn(async move {
            let interval = interval.max(Duration::from_millis(200));
            loop {
                tokio::time::sleep(interval).await;
                if pool.is_closed() {
                    return;
                }
                pool.prune_closed();
                // Close trashed connections that have drained.
                {
                    let trashed = pool.trashed.read().expect("pool lock");
                    for connection in trashed.iter() {
                        if connection.in_flight() == 0 {
                            connection.close();
                        }
                    }
                }
                pool.maybe_shrink();
                if pool.open_connection_count() < pool.core && pool.host.is_up() {
                    if let Err(err) = pool.ensure_core().await {
                        debug!(host = %pool.host.address(), error = %err,
                            "pool maintenance could not restore core connections");
                    }
                }
            }
        });
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for connection in self.connections.read().expect("pool lock").iter() {
            connection.close();
        }
        for connection in self.trashed.read().expect("pool lock").iter() {
            connection.close();
        }
        self.available.notify_waiters();
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        let (open, in_flight, allocated) = {
            let connections = self.connections.read().expect("pool lock");
            (
                connections.len(),
                connections
                    .iter()
                    .map(|connection| connection.in_flight())
                    .sum::<usize>(),
                connections
                    .iter()
                    .map(|connection| connection.allocated_stream_ids())
                    .sum::<usize>(),
            )
        };
        let trashed = self.trashed.read().expect("pool lock");
        PoolSnapshot {
            connections: open,
            trashed: trashed.len(),
            in_flight: in_flight
                + trashed
                    .iter()
                    .map(|connection| connection.in_flight())
                    .sum::<usize>(),
            allocated_stream_ids: allocated
                + trashed
                    .iter()
                    .map(|connection| connection.allocated_stream_ids())
                    .sum::<usize>(),
        }
    }
}

/// Point-in-time pool counters, for observability and invariant checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub connections: usize,
    pub trashed: usize,
    pub in_flight: usize,
    pub allocated_stream_ids: usize,
}

/// Keeps the parked-waiter count honest even when a borrow future is
/// dropped mid-wait (deadline or cancellation).
struct WaiterGuard<'a> {
    pool: &'a HostPool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.pool.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for HostPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPool")
            .field("host", &self.host.address())
            .field("connections", &self.connection_count())
            .field("in_flight", &self.total_in_flight())
            .finish()
    }
}
