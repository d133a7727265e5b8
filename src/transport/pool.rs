//! Keep-alive pool of idle connections.
//!
//! A connection checked out of the pool (or linked into it after a fresh dial)
//! is wrapped in [`Pooled`]. It goes back to the idle queue of its key on drop,
//! but only when the exchange running on it marked it reusable.
use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    fmt::{self, Debug},
    hash::Hash,
    ops::{Deref, DerefMut},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

pub(crate) const DEFAULT_KEEPALIVE_CONNS: usize = 256;
pub(crate) const DEFAULT_POOL_SIZE: usize = 32;
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_KEEPALIVE_CONNS: usize = 16384;
#[cfg(feature = "time")]
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

type SharedPool<K, T> = Rc<RefCell<PoolInner<K, T>>>;
type WeakPool<K, T> = Weak<RefCell<PoolInner<K, T>>>;

pub trait Key: Eq + Hash + Clone + 'static {}
impl<T: Eq + Hash + Clone + 'static> Key for T {}

struct Idle<T> {
    conn: T,
    idle_at: Instant,
}

impl<T> Idle<T> {
    #[inline]
    fn new(conn: T) -> Self {
        Self {
            conn,
            idle_at: Instant::now(),
        }
    }

    #[inline]
    fn expired(&self, max_elapsed: Duration) -> bool {
        self.idle_at.elapsed() > max_elapsed
    }
}

struct PoolInner<K, T> {
    idle_conns: HashMap<K, VecDeque<Idle<T>>>,
    max_idle: usize,
    idle_dur: Duration,
    #[cfg(feature = "time")]
    sweeper: bool,
}

impl<K: Key, T> PoolInner<K, T> {
    fn clear_expired(&mut self) {
        let dur = self.idle_dur;
        self.idle_conns.retain(|_, values| {
            values.retain(|entry| !entry.expired(dur));
            !values.is_empty()
        });
    }

    fn put(&mut self, key: K, conn: T) {
        let max_idle = self.max_idle;
        let queue = self
            .idle_conns
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(max_idle.min(DEFAULT_POOL_SIZE)));
        while queue.len() >= max_idle {
            let _ = queue.pop_front();
        }
        queue.push_back(Idle::new(conn));
    }
}

pub struct ConnectionPool<K, T> {
    shared: SharedPool<K, T>,
}

impl<K, T> Clone for ConnectionPool<K, T> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, T> Debug for ConnectionPool<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.borrow();
        write!(
            f,
            "ConnectionPool, keys: {}, max idle: {}",
            inner.idle_conns.len(),
            inner.max_idle
        )
    }
}

impl<K: Key, T: 'static> ConnectionPool<K, T> {
    /// `max_idle` caps idle connections per key, `idle_timeout` is how long one
    /// may sit unused before it is dropped.
    pub fn new(max_idle: Option<usize>, idle_timeout: Option<Duration>) -> Self {
        let max_idle = max_idle
            .map(|n| n.clamp(1, MAX_KEEPALIVE_CONNS))
            .unwrap_or(DEFAULT_KEEPALIVE_CONNS);
        Self {
            shared: Rc::new(RefCell::new(PoolInner {
                idle_conns: HashMap::with_capacity(DEFAULT_POOL_SIZE),
                max_idle,
                idle_dur: idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
                #[cfg(feature = "time")]
                sweeper: false,
            })),
        }
    }

    /// Take the most recently parked, unexpired connection for `key`.
    pub fn get(&self, key: &K) -> Option<Pooled<K, T>> {
        let mut inner = self.shared.borrow_mut();
        let dur = inner.idle_dur;
        let queue = inner.idle_conns.get_mut(key)?;
        while let Some(idle) = queue.pop_back() {
            if idle.expired(dur) {
                continue;
            }
            #[cfg(feature = "logging")]
            tracing::debug!("reusing pooled connection");
            return Some(Pooled::new(
                key.clone(),
                idle.conn,
                true,
                Rc::downgrade(&self.shared),
            ));
        }
        None
    }

    pub fn put(&self, key: K, conn: T) {
        self.shared.borrow_mut().put(key, conn);
        #[cfg(feature = "time")]
        self.start_sweeper();
    }

    /// Wrap a freshly dialed connection so it can join the pool later.
    ///
    /// Under `time` this also starts the idle sweeper, since a linked
    /// connection returns through [`Pooled`]'s drop rather than [`put`](Self::put).
    pub fn link(&self, key: K, conn: T) -> Pooled<K, T> {
        #[cfg(feature = "logging")]
        tracing::debug!("linked new connection to the pool");
        #[cfg(feature = "time")]
        self.start_sweeper();

        Pooled::new(key, conn, false, Rc::downgrade(&self.shared))
    }

    pub fn idle_count(&self) -> usize {
        self.shared.borrow().idle_conns.values().map(VecDeque::len).sum()
    }

    pub fn clear(&self) {
        self.shared.borrow_mut().idle_conns.clear();
    }

    // Spawned lazily so a pool can be built outside of a runtime.
    #[cfg(feature = "time")]
    fn start_sweeper(&self) {
        let idle_dur = {
            let mut inner = self.shared.borrow_mut();
            if inner.sweeper {
                return;
            }
            inner.sweeper = true;
            inner.idle_dur
        };
        monoio::spawn(IdleTask {
            conns: Rc::downgrade(&self.shared),
            interval: monoio::time::interval(idle_dur.max(MIN_SWEEP_INTERVAL)),
        });
    }
}

impl<K: Key, T: 'static> Default for ConnectionPool<K, T> {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// A connection on loan from a [`ConnectionPool`].
pub struct Pooled<K: Key, T> {
    value: Option<T>,
    is_reused: bool,
    reusable: bool,
    key: Option<K>,
    pool: Option<WeakPool<K, T>>,
}

impl<K: Key, T> Pooled<K, T> {
    #[inline]
    fn new(key: K, value: T, is_reused: bool, pool: WeakPool<K, T>) -> Self {
        Self {
            value: Some(value),
            is_reused,
            reusable: false,
            key: Some(key),
            pool: Some(pool),
        }
    }

    /// Whether this connection already served an earlier exchange.
    #[inline]
    pub fn is_reused(&self) -> bool {
        self.is_reused
    }

    /// Return to the pool on drop. Only set once the exchange ended cleanly.
    #[inline]
    pub fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }
}

impl<K: Key, T> Deref for Pooled<K, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.value.as_ref().expect("not dropped")
    }
}

impl<K: Key, T> DerefMut for Pooled<K, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("not dropped")
    }
}

impl<K: Key, T> Drop for Pooled<K, T> {
    fn drop(&mut self) {
        if !self.reusable {
            return;
        }
        let (Some(value), Some(key)) = (self.value.take(), self.key.take()) else {
            return;
        };
        if let Some(pool) = self.pool.as_ref().and_then(Weak::upgrade) {
            pool.borrow_mut().put(key, value);
        }
    }
}

impl<K: Key, T> Debug for Pooled<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pooled, reused: {}, reusable: {}",
            self.is_reused, self.reusable
        )
    }
}

#[cfg(feature = "time")]
struct IdleTask<K, T> {
    conns: WeakPool<K, T>,
    interval: monoio::time::Interval,
}

#[cfg(feature = "time")]
impl<K: Key, T> std::future::Future for IdleTask<K, T> {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            std::task::ready!(this.interval.poll_tick(cx));
            if let Some(inner) = this.conns.upgrade() {
                inner.borrow_mut().clear_expired();
                #[cfg(feature = "logging")]
                tracing::debug!("pool clear expired");
                continue;
            }
            #[cfg(feature = "logging")]
            tracing::debug!("pool upgrade failed, idle task exit");
            return std::task::Poll::Ready(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test(enable_timer = true)]
    async fn only_reusable_connections_return() {
        let pool: ConnectionPool<&'static str, u32> = ConnectionPool::new(Some(2), None);
        let conn = pool.link("a", 1);
        assert!(!conn.is_reused());
        drop(conn);
        assert_eq!(pool.idle_count(), 0);

        let mut conn = pool.link("a", 2);
        conn.set_reusable(true);
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        let conn = pool.get(&"a").unwrap();
        assert!(conn.is_reused());
        assert_eq!(*conn, 2);
        assert!(pool.get(&"a").is_none());
        assert!(pool.get(&"b").is_none());
    }

    #[test]
    fn idle_queue_is_capped() {
        let pool: ConnectionPool<u8, u32> = ConnectionPool::new(Some(2), None);
        for i in 0..5 {
            pool.shared.borrow_mut().put(0, i);
        }
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(*pool.get(&0).unwrap(), 4);
    }

    #[test]
    fn expired_connections_are_skipped() {
        let pool: ConnectionPool<u8, u32> =
            ConnectionPool::new(None, Some(Duration::from_millis(1)));
        pool.shared.borrow_mut().put(0, 1);
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.get(&0).is_none());
    }

    #[cfg(feature = "time")]
    #[monoio::test(enable_timer = true)]
    async fn linked_connections_are_swept_after_idling() {
        let pool: ConnectionPool<&'static str, u32> =
            ConnectionPool::new(None, Some(Duration::from_millis(50)));
        let mut conn = pool.link("a", 1);
        conn.set_reusable(true);
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        // Nobody asks for "a" again; the sweeper alone must evict it.
        monoio::time::sleep(MIN_SWEEP_INTERVAL + Duration::from_millis(300)).await;
        assert_eq!(pool.idle_count(), 0);
    }
}
