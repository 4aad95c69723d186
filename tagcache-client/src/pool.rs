//! # Connection Pool
//!
//! Purpose: Keep a fixed set of connections to the cache server, hand out
//! exclusive access to healthy ones, and revive dead ones on demand.
//!
//! ## Design Principles
//! 1. **Fixed Slots**: the pool size never changes; each slot owns one
//!    `Connection` behind its own mutex.
//! 2. **Pinning**: the last connection handed out is tried first, so a
//!    single-threaded caller keeps reusing one socket.
//! 3. **Exclusive Leases**: a `PooledConnection` holds the slot's lock; two
//!    callers can never interleave commands on one socket.
//! 4. **Lazy Recovery**: dead connections are redialed when an acquire finds
//!    nothing healthy, one attempt per acquire.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tagcache_common::{TagCacheError, TagCacheResult};

use crate::config::ClientConfig;
use crate::connection::Connection;

struct PoolState {
    cursor: usize,
    pinned: Option<usize>,
}

/// Fixed-size pool of connections to one server.
pub struct ConnectionPool {
    config: ClientConfig,
    slots: Vec<Mutex<Connection>>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

/// Health snapshot of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Leased to a caller; health is not inspected.
    InUse,
    Healthy {
        age: Duration,
        idle: Duration,
    },
    Unhealthy,
}

/// Snapshot returned by [`ConnectionPool::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub closed: bool,
    pub connections: Vec<ConnectionStatus>,
}

impl PoolStatus {
    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Idle connections known to be healthy.
    pub fn healthy(&self) -> usize {
        self.connections
            .iter()
            .filter(|status| matches!(status, ConnectionStatus::Healthy { .. }))
            .count()
    }
}

impl ConnectionPool {
    /// Creates the pool and warms it up.
    ///
    /// Warm-up dials every slot concurrently with half the connect timeout.
    /// When fewer than half of the slots connect, the failures are retried
    /// once with the full timeout. Slots that still fail stay detached and
    /// are dialed lazily by `acquire`.
    pub fn new(config: ClientConfig) -> Self {
        let slots = (0..config.pool_size)
            .map(|id| Mutex::new(Connection::detached(id, config.max_line_bytes)))
            .collect();
        let pool = ConnectionPool {
            config,
            slots,
            state: Mutex::new(PoolState {
                cursor: 0,
                pinned: None,
            }),
            closed: AtomicBool::new(false),
        };
        pool.warm_up();
        pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    fn warm_up(&self) {
        let size = self.slots.len();
        let mut connected = self.dial_detached(self.config.connect_timeout() / 2);
        if connected * 2 < size {
            debug!(connected, size, "warm-up below half; retrying with full timeout");
            connected = self.dial_detached(self.config.connect_timeout());
        }

        if connected == 0 {
            warn!(addr = %self.config.addr(), size, "no connection established at startup");
        } else if connected < size {
            warn!(addr = %self.config.addr(), connected, size, "pool partially connected");
        } else {
            info!(addr = %self.config.addr(), size, "connection pool ready");
        }

        let mut state = self.lock_state();
        state.pinned = (0..size).find(|&index| {
            self.try_lock(index)
                .map(|conn| conn.is_healthy())
                .unwrap_or(false)
        });
    }

    /// Dials every unhealthy slot in parallel; returns the healthy count.
    fn dial_detached(&self, timeout: Duration) -> usize {
        thread::scope(|scope| {
            let handles: Vec<_> = (0..self.slots.len())
                .map(|index| {
                    scope.spawn(move || {
                        let mut conn = self.lock_slot(index);
                        if conn.is_healthy() {
                            return true;
                        }
                        match conn.reconnect(&self.config, timeout) {
                            Ok(()) => true,
                            Err(err) => {
                                debug!(conn = index, error = %err, "warm-up dial failed");
                                false
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or(false))
                .filter(|ok| *ok)
                .count()
        })
    }

    /// Leases a healthy connection, waiting for a busy one when every slot
    /// is leased.
    ///
    /// # Errors
    /// - `Closed` after [`close`](Self::close).
    /// - `Unavailable` when nothing healthy exists and the one reconnect
    ///   attempt fails, or when no lease is returned before the I/O timeout.
    pub fn acquire(&self) -> TagCacheResult<PooledConnection<'_>> {
        if let Some(conn) = self.try_acquire()? {
            return Ok(conn);
        }

        let deadline = Instant::now() + self.config.poll_timeout();
        let mut backoff = Duration::from_micros(50);
        loop {
            thread::sleep(backoff);
            if let Some(conn) = self.try_acquire()? {
                return Ok(conn);
            }
            if Instant::now() >= deadline {
                warn!(size = self.slots.len(), "every connection stayed leased");
                return Err(TagCacheError::Unavailable);
            }
            backoff = (backoff * 2).min(Duration::from_millis(5));
        }
    }

    /// Leases a connection without waiting on busy slots.
    ///
    /// Returns `Ok(None)` when every slot is leased.
    pub fn try_acquire(&self) -> TagCacheResult<Option<PooledConnection<'_>>> {
        if self.is_closed() {
            return Err(TagCacheError::Closed);
        }

        let mut state = self.lock_state();
        if let Some(index) = state.pinned {
            if let Some(conn) = self.try_lock(index) {
                if conn.is_healthy() {
                    return Ok(Some(self.lease(conn)));
                }
            }
        }

        let size = self.slots.len();
        let mut stale = None;
        for offset in 0..size {
            let index = (state.cursor + offset) % size;
            let Some(conn) = self.try_lock(index) else {
                continue;
            };
            if conn.is_healthy() {
                state.cursor = (index + 1) % size;
                state.pinned = Some(index);
                return Ok(Some(self.lease(conn)));
            }
            if stale.is_none() {
                stale = Some(conn);
            }
        }
        drop(state);

        match stale {
            Some(conn) => self.revive(conn).map(Some),
            None => Ok(None),
        }
    }

    /// One reconnect attempt on a leased dead slot.
    fn revive<'a>(&'a self, mut conn: MutexGuard<'a, Connection>) -> TagCacheResult<PooledConnection<'a>> {
        let index = conn.id();
        match conn.reconnect(&self.config, self.config.connect_timeout()) {
            Ok(()) => {
                info!(conn = index, "connection re-established");
                self.lock_state().pinned = Some(index);
                Ok(self.lease(conn))
            }
            Err(err) => {
                warn!(conn = index, error = %err, "reconnect failed");
                Err(TagCacheError::Unavailable)
            }
        }
    }

    /// Closes every idle socket; leased ones close when their lease ends.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for index in 0..self.slots.len() {
            if let Some(mut conn) = self.try_lock(index) {
                conn.shutdown();
            }
        }
        self.lock_state().pinned = None;
        info!(addr = %self.config.addr(), "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> PoolStatus {
        let connections = (0..self.slots.len())
            .map(|index| match self.try_lock(index) {
                None => ConnectionStatus::InUse,
                Some(conn) if conn.is_healthy() => ConnectionStatus::Healthy {
                    age: conn.age(),
                    idle: conn.idle(),
                },
                Some(_) => ConnectionStatus::Unhealthy,
            })
            .collect();
        PoolStatus {
            closed: self.is_closed(),
            connections,
        }
    }

    fn lease<'a>(&'a self, guard: MutexGuard<'a, Connection>) -> PooledConnection<'a> {
        PooledConnection {
            guard,
            closed: &self.closed,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self, index: usize) -> MutexGuard<'_, Connection> {
        match self.slots[index].lock() {
            Ok(guard) => guard,
            Err(poisoned) => self.recover(index, poisoned.into_inner()),
        }
    }

    fn try_lock(&self, index: usize) -> Option<MutexGuard<'_, Connection>> {
        match self.slots[index].try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(self.recover(index, poisoned.into_inner())),
        }
    }

    /// A lease holder panicked mid-command; the socket may hold a partial response.
    fn recover<'a>(&'a self, index: usize, mut guard: MutexGuard<'a, Connection>) -> MutexGuard<'a, Connection> {
        guard.mark_unhealthy("previous holder panicked");
        self.slots[index].clear_poison();
        guard
    }
}

/// Exclusive lease on a pooled connection; released on drop.
pub struct PooledConnection<'a> {
    guard: MutexGuard<'a, Connection>,
    closed: &'a AtomicBool,
}

impl PooledConnection<'_> {
    /// Slot index of the leased connection.
    pub fn index(&self) -> usize {
        self.guard.id()
    }
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.guard
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.guard
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            self.guard.shutdown();
        }
    }
}
