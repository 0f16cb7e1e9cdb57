//! Route-keyed connection pooling.
//!
//! The pool leases values per key (for the client, per [`Route`]) and
//! enforces two ledgers at once: a per-route cap and a global cap over
//! `leased + idle`. Leases that cannot be served immediately park as
//! waiters and are woken longest-waiting-first when capacity frees up or
//! an idle value is returned.
//!
//! [`Route`]: crate::route::Route

use std::{
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    hash::Hash,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;

use crate::{context::UserToken, error::Error};

/// Before reusing a pooled value, make sure it is still usable.
///
/// HTTP/1 connections admit a single exchange at a time and reserve
/// uniquely; HTTP/2 connections multiplex and hand out shared clones.
pub(crate) trait Poolable: Unpin + Send + Sized + 'static {
    fn is_open(&self) -> bool;
    /// Reserve this value, splitting a shareable one into a retained copy
    /// and a checked-out copy.
    fn reserve(self) -> Reservation<Self>;
    fn can_share(&self) -> bool;
}

/// The result of reserving a poolable value for checkout.
pub(crate) enum Reservation<T> {
    /// First value stays in the idle set, second goes to the caller.
    Shared(T, T),
    /// The value admits one user at a time and leaves the idle set.
    Unique(T),
}

pub(crate) trait Key: Eq + Hash + Clone + Debug + Unpin + Send + 'static {}

impl<T> Key for T where T: Eq + Hash + Clone + Debug + Unpin + Send + 'static {}

/// Order in which idle values are reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolReusePolicy {
    /// Most recently returned value first. Maximizes locality and lets
    /// surplus connections age out; the default.
    #[default]
    Lifo,
    /// Oldest idle value first, spreading exchanges over all connections.
    Fifo,
}

/// How long a released value may sit idle before it expires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum KeepAlive {
    /// No per-entry deadline; pool-level idle timeout still applies.
    #[default]
    Indefinite,
    /// Expire this entry after the given idle duration.
    For(Duration),
    /// Do not return to the pool at all.
    Discard,
}

/// Counters for one route or for the whole pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Values currently checked out (including pending fresh connects).
    pub leased: usize,
    /// Idle values available for reuse.
    pub available: usize,
    /// Parked lease requests.
    pub pending: usize,
}

#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) max_total: usize,
    pub(crate) default_max_per_route: usize,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_lifetime: Option<Duration>,
    pub(crate) reuse: PoolReusePolicy,
    pub(crate) validate_after_inactivity: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_total: 25,
            default_max_per_route: 5,
            idle_timeout: Some(Duration::from_secs(90)),
            max_lifetime: None,
            reuse: PoolReusePolicy::Lifo,
            validate_after_inactivity: Some(Duration::from_secs(2)),
        }
    }
}

pub(crate) struct Pool<T: Poolable, K: Key> {
    inner: Arc<Mutex<PoolInner<T, K>>>,
}

impl<T: Poolable, K: Key> Clone for Pool<T, K> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<T: Poolable, K: Key> {
    // Set at construction; lets the ledger mint gifts that can return
    // their reservation without a reference cycle.
    myself: Weak<Mutex<PoolInner<T, K>>>,
    idle: HashMap<K, VecDeque<Idle<T>>>,
    leased: HashMap<K, usize>,
    waiters: HashMap<K, VecDeque<Waiter<T, K>>>,
    max_per_route: HashMap<K, usize>,
    max_total: usize,
    default_max_per_route: usize,
    idle_timeout: Option<Duration>,
    max_lifetime: Option<Duration>,
    reuse: PoolReusePolicy,
    validate_after_inactivity: Option<Duration>,
    total_leased: usize,
    total_idle: usize,
    next_waiter_id: u64,
    next_waiter_seq: u64,
    reaper_started: bool,
    shutdown: bool,
}

struct Idle<T> {
    value: T,
    idle_at: Instant,
    created_at: Instant,
    expires_at: Option<Instant>,
    token: Option<UserToken>,
}

struct Waiter<T: Poolable, K: Key> {
    id: u64,
    seq: u64,
    tx: oneshot::Sender<Gift<T, K>>,
}

/// What a parked waiter receives. The gift owns its ledger entry until
/// claimed, so a receiver that disappeared mid-handoff returns the
/// reservation instead of leaking it.
struct Gift<T: Poolable, K: Key> {
    kind: Option<GiftKind<T>>,
    pool: Weak<Mutex<PoolInner<T, K>>>,
    key: K,
}

enum GiftKind<T> {
    /// An idle value, ready for use. `counted` records whether the sender
    /// moved a ledger entry onto the receiver (unique values) or not
    /// (shared clones).
    Reused {
        value: T,
        created_at: Instant,
        counted: bool,
    },
    /// Capacity was reserved for this waiter; it must connect.
    Permit,
}

impl<T: Poolable, K: Key> Gift<T, K> {
    fn claim(mut self) -> GiftKind<T> {
        self.kind.take().expect("gift claimed twice")
    }
}

impl<T: Poolable, K: Key> Drop for Gift<T, K> {
    fn drop(&mut self) {
        let Some(kind) = self.kind.take() else { return };
        let Some(pool) = self.pool.upgrade() else { return };
        let Ok(mut inner) = pool.lock() else { return };
        match kind {
            GiftKind::Permit => {
                inner.dec_leased(&self.key);
                inner.wake_capacity();
            }
            GiftKind::Reused {
                value,
                created_at,
                counted,
            } => {
                if counted {
                    inner.release(
                        &self.key,
                        value,
                        created_at,
                        None,
                        KeepAlive::Indefinite,
                        true,
                    );
                }
                // Uncounted shared clones release by dropping.
            }
        }
    }
}

/// The outcome of a successful lease.
#[derive(Debug)]
pub(crate) enum Lease<T: Poolable, K: Key> {
    /// An existing connection, ready for an exchange.
    Reused(Pooled<T, K>),
    /// Capacity for a fresh connection. The reservation is held until the
    /// permit is completed or dropped.
    Permit(ConnectPermit<T, K>),
}

enum TakenIdle<T> {
    Unique { value: T, created_at: Instant },
    SharedClone { value: T, created_at: Instant },
}

// ===== impl Pool =====

impl<T: Poolable, K: Key> Pool<T, K> {
    pub(crate) fn new(config: PoolConfig) -> Pool<T, K> {
        Pool {
            inner: Arc::new_cyclic(|myself| Mutex::new(PoolInner {
                myself: myself.clone(),
                idle: HashMap::new(),
                leased: HashMap::new(),
                waiters: HashMap::new(),
                max_per_route: HashMap::new(),
                max_total: config.max_total,
                default_max_per_route: config.default_max_per_route,
                idle_timeout: config.idle_timeout,
                max_lifetime: config.max_lifetime,
                reuse: config.reuse,
                validate_after_inactivity: config.validate_after_inactivity,
                total_leased: 0,
                total_idle: 0,
                next_waiter_id: 0,
                next_waiter_seq: 0,
                reaper_started: false,
                shutdown: false,
            })),
        }
    }

    /// Lease a value for `key`.
    ///
    /// Resolves to a reused idle value or to a [`ConnectPermit`] when the
    /// ledgers allow a fresh connection; parks otherwise. `timeout` bounds
    /// the parked wait; lapsing fails with the pool-timeout error kind.
    pub(crate) async fn lease(
        &self,
        key: K,
        token: Option<UserToken>,
        timeout: Option<Duration>,
    ) -> Result<Lease<T, K>, Error> {
        let (waiter_id, mut rx) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.shutdown {
                return Err(Error::pool_shutdown());
            }

            if let Some(taken) = inner.take_idle(&key, token.as_ref()) {
                return Ok(Lease::Reused(self.pooled_from_taken(key, taken, token)));
            }

            if inner.reserve_capacity(&key) {
                return Ok(Lease::Permit(ConnectPermit {
                    pool: Arc::downgrade(&self.inner),
                    key,
                    token,
                    completed: false,
                }));
            }

            trace!("lease waiting for capacity: {:?}", key);
            let (tx, rx) = oneshot::channel();
            let id = inner.park(key.clone(), tx);
            (id, rx)
        };

        // If this future is dropped while parked, the guard deregisters
        // the waiter so no gift is ever routed to a dead receiver.
        let mut guard = WaiterGuard {
            pool: Arc::downgrade(&self.inner),
            key: key.clone(),
            id: waiter_id,
            armed: true,
        };

        let gift = match timeout {
            Some(dur) => match tokio::time::timeout(dur, &mut rx).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    let removed = {
                        let mut inner = self.inner.lock().unwrap();
                        inner.remove_waiter(&key, waiter_id)
                    };
                    guard.armed = false;
                    if removed {
                        return Err(Error::pool_timeout());
                    }
                    // A gift won the race against the deadline; use it.
                    match rx.try_recv() {
                        Ok(gift) => Ok(gift),
                        Err(_) => return Err(Error::pool_timeout()),
                    }
                }
            },
            None => (&mut rx).await,
        };
        guard.armed = false;

        match gift {
            Ok(gift) => match gift.claim() {
                GiftKind::Reused {
                    value,
                    created_at,
                    counted,
                } => Ok(Lease::Reused(Pooled {
                    value: Some(value),
                    is_reused: true,
                    key,
                    pool: if counted {
                        Arc::downgrade(&self.inner)
                    } else {
                        Weak::new()
                    },
                    created_at,
                    token,
                    keep_alive: KeepAlive::Indefinite,
                    discarded: false,
                })),
                GiftKind::Permit => Ok(Lease::Permit(ConnectPermit {
                    pool: Arc::downgrade(&self.inner),
                    key,
                    token,
                    completed: false,
                })),
            },
            // The sender only disappears when the pool shuts down.
            Err(_) => Err(Error::pool_shutdown()),
        }
    }

    fn pooled_from_taken(
        &self,
        key: K,
        taken: TakenIdle<T>,
        token: Option<UserToken>,
    ) -> Pooled<T, K> {
        let (value, created_at, pool) = match taken {
            TakenIdle::Unique { value, created_at } => {
                (value, created_at, Arc::downgrade(&self.inner))
            }
            // The canonical copy stays in the idle set and carries the
            // ledger entry; this clone releases by simply dropping.
            TakenIdle::SharedClone { value, created_at } => (value, created_at, Weak::new()),
        };
        Pooled {
            value: Some(value),
            is_reused: true,
            key,
            pool,
            created_at,
            token,
            keep_alive: KeepAlive::Indefinite,
            discarded: false,
        }
    }

    /// Shut the pool down: drop all idle values and fail parked waiters.
    pub(crate) fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        inner.total_idle = 0;
        inner.idle.clear();
        inner.waiters.clear();
    }

    /// Drop idle entries whose keep-alive or lifetime deadline has passed.
    pub(crate) fn close_expired(&self) {
        let mut inner = self.inner.lock().unwrap();
        let max_lifetime = inner.max_lifetime;
        inner.prune_idle(move |entry, now| {
            if !entry.value.is_open() {
                return false;
            }
            if let Some(expires_at) = entry.expires_at {
                if now >= expires_at {
                    return false;
                }
            }
            if let Some(ttl) = max_lifetime {
                if now.saturating_duration_since(entry.created_at) > ttl {
                    return false;
                }
            }
            true
        });
        inner.wake_capacity();
    }

    /// Drop idle entries that have been idle longer than `max_idle`.
    pub(crate) fn close_idle(&self, max_idle: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.prune_idle(move |entry, now| {
            entry.value.is_open() && now.saturating_duration_since(entry.idle_at) <= max_idle
        });
        inner.wake_capacity();
    }

    /// Raise or lower the global `leased + idle` cap, waking newly
    /// eligible waiters.
    pub(crate) fn set_max_total(&self, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_total = max;
        inner.wake_capacity();
    }

    /// Set the per-route cap for routes without an explicit override.
    pub(crate) fn set_default_max_per_route(&self, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.default_max_per_route = max;
        inner.wake_capacity();
    }

    /// Set the cap for one specific route.
    pub(crate) fn set_max_per_route(&self, key: K, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_per_route.insert(key, max);
        inner.wake_capacity();
    }

    /// Aggregate counters across all routes.
    pub(crate) fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            leased: inner.total_leased,
            available: inner.total_idle,
            pending: inner.waiters.values().map(VecDeque::len).sum(),
        }
    }

    /// Counters for a single route.
    pub(crate) fn stats_for(&self, key: &K) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            leased: inner.leased.get(key).copied().unwrap_or(0),
            available: inner.idle.get(key).map(VecDeque::len).unwrap_or(0),
            pending: inner.waiters.get(key).map(VecDeque::len).unwrap_or(0),
        }
    }

    /// Start the background reaper if expiry is configured. Must be called
    /// from within a tokio runtime; the client does so on first use.
    pub(crate) fn spawn_reaper(&self) {
        let interval = {
            let mut inner = self.inner.lock().unwrap();
            if inner.reaper_started {
                return;
            }
            let Some(dur) = inner.idle_timeout.or(inner.max_lifetime) else {
                return;
            };
            inner.reaper_started = true;
            // No point waking more often than this just to reap.
            dur.max(Duration::from_millis(90))
        };

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(strong) = weak.upgrade() else {
                    break;
                };
                let mut inner = strong.lock().unwrap();
                if inner.shutdown {
                    break;
                }
                trace!("pool reaper checking for expired entries");
                let idle_timeout = inner.idle_timeout;
                let max_lifetime = inner.max_lifetime;
                inner.prune_idle(move |entry, now| {
                    if !entry.value.is_open() {
                        return false;
                    }
                    if let Some(expires_at) = entry.expires_at {
                        if now >= expires_at {
                            return false;
                        }
                    }
                    if let Some(dur) = idle_timeout {
                        if now.saturating_duration_since(entry.idle_at) > dur {
                            return false;
                        }
                    }
                    if let Some(ttl) = max_lifetime {
                        if now.saturating_duration_since(entry.created_at) > ttl {
                            return false;
                        }
                    }
                    true
                });
                inner.prune_dead_waiters();
                inner.wake_capacity();
            }
        });
    }

    #[cfg(test)]
    fn locked(&self) -> std::sync::MutexGuard<'_, PoolInner<T, K>> {
        self.inner.lock().unwrap()
    }
}

// ===== impl PoolInner =====

impl<T: Poolable, K: Key> PoolInner<T, K> {
    fn route_max(&self, key: &K) -> usize {
        self.max_per_route
            .get(key)
            .copied()
            .unwrap_or(self.default_max_per_route)
    }

    fn route_usage(&self, key: &K) -> usize {
        self.leased.get(key).copied().unwrap_or(0)
            + self.idle.get(key).map(VecDeque::len).unwrap_or(0)
    }

    fn total_usage(&self) -> usize {
        self.total_leased + self.total_idle
    }

    fn inc_leased(&mut self, key: &K) {
        *self.leased.entry(key.clone()).or_insert(0) += 1;
        self.total_leased += 1;
    }

    fn dec_leased(&mut self, key: &K) {
        if let Some(count) = self.leased.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.leased.remove(key);
            }
            self.total_leased -= 1;
        }
    }

    /// Pop a usable idle entry for `key`, preferring one whose user token
    /// matches, validating liveness on entries idle past the inactivity
    /// window, and dropping dead or expired entries on the way.
    fn take_idle(&mut self, key: &K, token: Option<&UserToken>) -> Option<TakenIdle<T>> {
        let now = Instant::now();
        let reuse = self.reuse;
        let validate_window = self.validate_after_inactivity;
        let max_lifetime = self.max_lifetime;

        let usable = move |entry: &Idle<T>| {
            if let Some(expires_at) = entry.expires_at {
                if now >= expires_at {
                    return false;
                }
            }
            if let Some(ttl) = max_lifetime {
                if now.saturating_duration_since(entry.created_at) > ttl {
                    return false;
                }
            }
            let inactive = now.saturating_duration_since(entry.idle_at);
            match validate_window {
                Some(window) if inactive <= window => true,
                _ => entry.value.is_open(),
            }
        };

        let mut dropped = 0usize;
        let mut taken: Option<Idle<T>> = None;
        let emptied;
        {
            let list = self.idle.get_mut(key)?;
            let mut picked =
                token.and_then(|t| list.iter().position(|e| e.token.as_ref() == Some(t)));
            loop {
                let idx = match picked.take() {
                    Some(idx) => idx,
                    None => match reuse {
                        PoolReusePolicy::Lifo => match list.len().checked_sub(1) {
                            Some(idx) => idx,
                            None => break,
                        },
                        PoolReusePolicy::Fifo => {
                            if list.is_empty() {
                                break;
                            }
                            0
                        }
                    },
                };
                let Some(entry) = list.remove(idx) else { break };
                if usable(&entry) {
                    taken = Some(entry);
                    break;
                }
                dropped += 1;
            }
            emptied = list.is_empty();
        }
        if emptied {
            self.idle.remove(key);
        }
        self.total_idle -= dropped;

        let entry = match taken {
            Some(entry) => {
                self.total_idle -= 1;
                entry
            }
            None => return None,
        };

        let created_at = entry.created_at;
        match entry.value.reserve() {
            Reservation::Shared(to_reinsert, to_checkout) => {
                self.push_idle(
                    key.clone(),
                    Idle {
                        value: to_reinsert,
                        idle_at: entry.idle_at,
                        created_at,
                        expires_at: entry.expires_at,
                        token: entry.token,
                    },
                );
                Some(TakenIdle::SharedClone {
                    value: to_checkout,
                    created_at,
                })
            }
            Reservation::Unique(value) => {
                self.inc_leased(key);
                Some(TakenIdle::Unique { value, created_at })
            }
        }
    }

    /// Reserve a slot for a fresh connection if the ledgers allow it,
    /// evicting the least-recently-used idle entry when only the global
    /// cap stands in the way.
    fn reserve_capacity(&mut self, key: &K) -> bool {
        if self.route_usage(key) >= self.route_max(key) {
            return false;
        }
        if self.total_usage() >= self.max_total && !self.evict_lru_idle() {
            return false;
        }
        self.inc_leased(key);
        true
    }

    fn evict_lru_idle(&mut self) -> bool {
        let mut oldest: Option<(K, usize, Instant)> = None;
        for (key, list) in self.idle.iter() {
            for (idx, entry) in list.iter().enumerate() {
                match oldest {
                    Some((_, _, at)) if entry.idle_at >= at => {}
                    _ => oldest = Some((key.clone(), idx, entry.idle_at)),
                }
            }
        }
        let Some((key, idx, _)) = oldest else {
            return false;
        };
        let mut emptied = false;
        if let Some(list) = self.idle.get_mut(&key) {
            list.remove(idx);
            emptied = list.is_empty();
            self.total_idle -= 1;
        }
        if emptied {
            self.idle.remove(&key);
        }
        debug!("evicted least-recently-used idle entry for {:?}", key);
        true
    }

    fn park(&mut self, key: K, tx: oneshot::Sender<Gift<T, K>>) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        let seq = self.next_waiter_seq;
        self.next_waiter_seq += 1;
        self.waiters
            .entry(key)
            .or_default()
            .push_back(Waiter { id, seq, tx });
        id
    }

    fn remove_waiter(&mut self, key: &K, id: u64) -> bool {
        let mut removed = false;
        let mut emptied = false;
        if let Some(list) = self.waiters.get_mut(key) {
            if let Some(pos) = list.iter().position(|w| w.id == id) {
                list.remove(pos);
                removed = true;
            }
            emptied = list.is_empty();
        }
        if emptied {
            self.waiters.remove(key);
        }
        removed
    }

    fn pop_waiter(&mut self, key: &K) -> Option<Waiter<T, K>> {
        let mut emptied = false;
        let waiter = match self.waiters.get_mut(key) {
            Some(list) => {
                let waiter = list.pop_front();
                emptied = list.is_empty();
                waiter
            }
            None => None,
        };
        if emptied {
            self.waiters.remove(key);
        }
        waiter
    }

    fn prune_dead_waiters(&mut self) {
        self.waiters.retain(|_, list| {
            list.retain(|w| !w.tx.is_closed());
            !list.is_empty()
        });
    }

    /// Called on release: return a value to the pool or account for its
    /// loss, waking whoever can make progress.
    fn release(
        &mut self,
        key: &K,
        value: T,
        created_at: Instant,
        token: Option<UserToken>,
        keep_alive: KeepAlive,
        counted: bool,
    ) {
        if counted {
            self.dec_leased(key);
        }

        let reusable = !self.shutdown
            && value.is_open()
            && keep_alive != KeepAlive::Discard
            && self.route_usage(key) < self.route_max(key)
            && self.total_usage() < self.max_total;

        if !reusable {
            trace!("discarding released value for {:?}", key);
            drop(value);
            self.wake_capacity();
            return;
        }

        let now = Instant::now();
        let expires_at = match keep_alive {
            KeepAlive::For(dur) => Some(now + dur),
            _ => None,
        };

        if value.can_share() {
            // Every waiter on this route can ride the same connection.
            let mut canonical = value;
            if let Some(mut list) = self.waiters.remove(key) {
                while let Some(waiter) = list.pop_front() {
                    if waiter.tx.is_closed() {
                        continue;
                    }
                    match canonical.reserve() {
                        Reservation::Shared(to_keep, to_send) => {
                            canonical = to_keep;
                            let gift = Gift {
                                kind: Some(GiftKind::Reused {
                                    value: to_send,
                                    created_at,
                                    counted: false,
                                }),
                                pool: Weak::new(),
                                key: key.clone(),
                            };
                            // A lost clone is harmless either way.
                            if let Err(gift) = waiter.tx.send(gift) {
                                let _ = gift.claim();
                            }
                        }
                        Reservation::Unique(v) => {
                            canonical = v;
                            self.waiters.insert(key.clone(), list);
                            break;
                        }
                    }
                }
            }
            self.push_idle(
                key.clone(),
                Idle {
                    value: canonical,
                    idle_at: now,
                    created_at,
                    expires_at,
                    token,
                },
            );
            return;
        }

        // Unique value: hand to the longest-waiting live lease, else idle.
        let mut value = value;
        while let Some(waiter) = self.pop_waiter(key) {
            if waiter.tx.is_closed() {
                continue;
            }
            self.inc_leased(key);
            let gift = Gift {
                kind: Some(GiftKind::Reused {
                    value,
                    created_at,
                    counted: true,
                }),
                pool: self.myself.clone(),
                key: key.clone(),
            };
            match waiter.tx.send(gift) {
                Ok(()) => return,
                Err(gift) => {
                    // Receiver vanished between the closed check and the
                    // send; reclaim and try the next waiter. Claiming here
                    // keeps the gift's own cleanup from re-entering the
                    // lock we hold.
                    self.dec_leased(key);
                    match gift.claim() {
                        GiftKind::Reused { value: v, .. } => value = v,
                        GiftKind::Permit => unreachable!("reused gift returned as permit"),
                    }
                }
            }
        }

        debug!("pooling idle value for {:?}", key);
        self.push_idle(
            key.clone(),
            Idle {
                value,
                idle_at: now,
                created_at,
                expires_at,
                token,
            },
        );
    }

    fn push_idle(&mut self, key: K, entry: Idle<T>) {
        self.idle.entry(key).or_default().push_back(entry);
        self.total_idle += 1;
    }

    /// Wake parked leases, longest-waiting first, granting connect permits
    /// for as long as the ledgers allow.
    fn wake_capacity(&mut self) {
        if self.shutdown {
            return;
        }
        loop {
            let mut best: Option<(K, u64)> = None;
            for (key, list) in self.waiters.iter() {
                let Some(front) = list.front() else { continue };
                if self.route_usage(key) >= self.route_max(key) {
                    continue;
                }
                if self.total_usage() >= self.max_total && self.total_idle == 0 {
                    continue;
                }
                match best {
                    Some((_, seq)) if front.seq >= seq => {}
                    _ => best = Some((key.clone(), front.seq)),
                }
            }
            let Some((key, _)) = best else { return };
            let Some(waiter) = self.pop_waiter(&key) else {
                continue;
            };
            if waiter.tx.is_closed() {
                continue;
            }
            if self.total_usage() >= self.max_total && !self.evict_lru_idle() {
                // No room after all; put the waiter back where it was.
                self.waiters.entry(key).or_default().push_front(waiter);
                return;
            }
            self.inc_leased(&key);
            let gift = Gift {
                kind: Some(GiftKind::Permit),
                pool: self.myself.clone(),
                key: key.clone(),
            };
            if let Err(gift) = waiter.tx.send(gift) {
                let _ = gift.claim();
                self.dec_leased(&key);
            }
        }
    }

    fn prune_idle(&mut self, keep: impl Fn(&Idle<T>, Instant) -> bool) {
        let now = Instant::now();
        let mut dropped = 0usize;
        self.idle.retain(|_, list| {
            list.retain(|entry| {
                if keep(entry, now) {
                    true
                } else {
                    dropped += 1;
                    false
                }
            });
            !list.is_empty()
        });
        self.total_idle -= dropped;
    }
}

// ===== impl Pooled =====

/// A leased pool value. Releases back to the pool on drop, unless marked
/// discarded or no longer open.
pub(crate) struct Pooled<T: Poolable, K: Key> {
    value: Option<T>,
    is_reused: bool,
    key: K,
    pool: Weak<Mutex<PoolInner<T, K>>>,
    created_at: Instant,
    token: Option<UserToken>,
    keep_alive: KeepAlive,
    discarded: bool,
}

impl<T: Poolable, K: Key> Pooled<T, K> {
    /// Whether this lease came out of the idle set rather than a fresh
    /// connect.
    pub(crate) fn is_reused(&self) -> bool {
        self.is_reused
    }

    #[allow(unused)]
    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Rebind the user token the entry will carry back into the idle set.
    pub(crate) fn set_user_token(&mut self, token: Option<UserToken>) {
        self.token = token;
    }

    /// Arm (or clear) the per-entry idle deadline applied at release.
    pub(crate) fn set_keep_alive(&mut self, keep_alive: KeepAlive) {
        self.keep_alive = keep_alive;
    }

    /// Prevent this value from returning to the pool.
    pub(crate) fn discard(&mut self) {
        self.discarded = true;
    }

    fn as_ref(&self) -> &T {
        self.value.as_ref().expect("not dropped")
    }

    fn as_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("not dropped")
    }
}

impl<T: Poolable, K: Key> Deref for Pooled<T, K> {
    type Target = T;
    fn deref(&self) -> &T {
        self.as_ref()
    }
}

impl<T: Poolable, K: Key> DerefMut for Pooled<T, K> {
    fn deref_mut(&mut self) -> &mut T {
        self.as_mut()
    }
}

impl<T: Poolable, K: Key> Drop for Pooled<T, K> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Some(pool) = self.pool.upgrade() {
                if let Ok(mut inner) = pool.lock() {
                    let keep_alive = if self.discarded {
                        KeepAlive::Discard
                    } else {
                        self.keep_alive
                    };
                    inner.release(
                        &self.key,
                        value,
                        self.created_at,
                        self.token.take(),
                        keep_alive,
                        true,
                    );
                }
            }
            // Shared clones (h2) carry no pool reference; dropping the
            // clone is the whole release.
        }
    }
}

impl<T: Poolable, K: Key> fmt::Debug for Pooled<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled").field("key", &self.key).finish()
    }
}

// ===== impl ConnectPermit =====

/// A capacity reservation for a fresh connection. Dropping the permit
/// without completing it returns the reservation and wakes the next
/// eligible waiter.
pub(crate) struct ConnectPermit<T: Poolable, K: Key> {
    pool: Weak<Mutex<PoolInner<T, K>>>,
    key: K,
    token: Option<UserToken>,
    completed: bool,
}

impl<T: Poolable, K: Key> ConnectPermit<T, K> {
    #[allow(unused)]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    /// Turn a freshly-connected value into a leased pool entry.
    pub(crate) fn complete(mut self, value: T) -> Pooled<T, K> {
        self.completed = true;
        let created_at = Instant::now();
        let token = self.token.take();

        if let Some(pool) = self.pool.upgrade() {
            if let Ok(mut inner) = pool.lock() {
                return match value.reserve() {
                    Reservation::Shared(to_insert, to_return) => {
                        // One physical connection: the canonical idle copy
                        // carries the ledger entry, so the permit's leased
                        // reservation converts into an idle entry and the
                        // caller gets an uncounted clone.
                        inner.dec_leased(&self.key);
                        inner.release(
                            &self.key,
                            to_insert,
                            created_at,
                            token.clone(),
                            KeepAlive::Indefinite,
                            false,
                        );
                        Pooled {
                            value: Some(to_return),
                            is_reused: false,
                            key: self.key.clone(),
                            pool: Weak::new(),
                            created_at,
                            token,
                            keep_alive: KeepAlive::Indefinite,
                            discarded: false,
                        }
                    }
                    Reservation::Unique(value) => Pooled {
                        value: Some(value),
                        is_reused: false,
                        key: self.key.clone(),
                        pool: Arc::downgrade(&pool),
                        created_at,
                        token,
                        keep_alive: KeepAlive::Indefinite,
                        discarded: false,
                    },
                };
            }
        }

        // Pool vanished; the value lives (and dies) unpooled.
        Pooled {
            value: Some(match value.reserve() {
                Reservation::Shared(_, v) | Reservation::Unique(v) => v,
            }),
            is_reused: false,
            key: self.key.clone(),
            pool: Weak::new(),
            created_at,
            token,
            keep_alive: KeepAlive::Indefinite,
            discarded: false,
        }
    }
}

impl<T: Poolable, K: Key> Drop for ConnectPermit<T, K> {
    fn drop(&mut self) {
        if !self.completed {
            if let Some(pool) = self.pool.upgrade() {
                if let Ok(mut inner) = pool.lock() {
                    inner.dec_leased(&self.key);
                    inner.wake_capacity();
                }
            }
        }
    }
}

impl<T: Poolable, K: Key> fmt::Debug for ConnectPermit<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectPermit")
            .field("key", &self.key)
            .finish()
    }
}

struct WaiterGuard<T: Poolable, K: Key> {
    pool: Weak<Mutex<PoolInner<T, K>>>,
    key: K,
    id: u64,
    armed: bool,
}

impl<T: Poolable, K: Key> Drop for WaiterGuard<T, K> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(pool) = self.pool.upgrade() {
                if let Ok(mut inner) = pool.lock() {
                    inner.remove_waiter(&self.key, self.id);
                }
            }
        }
    }
}
