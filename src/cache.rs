use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

pub type Result<T> = std::result::Result<T, CacheError>;

/// A cached computation failed. Cloneable so every concurrent waiter on the
/// same in-flight computation receives the same error. Failed computations
/// are never cached: the next caller recomputes.
#[derive(Debug, Clone)]
pub enum CacheError {
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Compute(e) => write!(f, "cached computation failed: {e}"),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::Compute(e) => Some(e.as_ref()),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// A computed value plus its caching policy. `no_expiry` marks results that
/// are stable enough to keep until LRU pressure evicts them (e.g. segment
/// sets where every record was locked, or whitelist verdicts).
#[derive(Debug, Clone)]
pub struct CacheValue<T> {
    pub value: T,
    pub no_expiry: bool,
}

impl<T> CacheValue<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            no_expiry: false,
        }
    }

    pub fn permanent(value: T) -> Self {
        Self {
            value,
            no_expiry: true,
        }
    }
}

type SharedCompute<T> = Shared<BoxFuture<'static, Result<CacheValue<T>>>>;

enum Slot<T> {
    /// A computation is running; all callers for this key await it.
    InFlight(SharedCompute<T>),
    /// A finished value, optionally expiring.
    Ready {
        value: T,
        expires_at: Option<Instant>,
    },
}

struct Inner<T> {
    map: HashMap<String, Slot<T>>,
    /// Ready keys in least-recently-used order (front = oldest).
    lru: VecDeque<String>,
}

impl<T> Inner<T> {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            if let Some(k) = self.lru.remove(pos) {
                self.lru.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.map.remove(key);
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
    }

    fn insert_ready(&mut self, key: &str, value: T, expires_at: Option<Instant>, capacity: usize) {
        self.map
            .insert(key.to_owned(), Slot::Ready { value, expires_at });
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.to_owned());

        while self.lru.len() > capacity {
            if let Some(oldest) = self.lru.pop_front() {
                self.map.remove(&oldest);
            }
        }
    }
}

/// Deduplicating async result cache: single-flight per key, bounded by LRU
/// capacity and an optional TTL. Safe to share across device sessions —
/// all state sits behind one async mutex, released across every await.
pub struct AsyncCache<T: Clone + Send + Sync + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl<T: Clone + Send + Sync + 'static> AsyncCache<T> {
    /// `ttl = None` means entries only ever leave under LRU pressure.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: HashMap::new(),
                lru: VecDeque::new(),
            })),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Look up `key`, or run `compute` to fill it. Concurrent calls for the
    /// same key share one in-flight computation; the first caller's future
    /// is used and its result fans out to every waiter. A failed
    /// computation is evicted immediately and its error shared.
    pub async fn get_or_compute<F, Fut, E>(&self, key: &str, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CacheValue<T>, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let shared = {
            let mut inner = self.inner.lock().await;

            match inner.map.get(key) {
                Some(Slot::Ready { value, expires_at }) => {
                    let expired = expires_at.is_some_and(|at| Instant::now() >= at);
                    if !expired {
                        let value = value.clone();
                        inner.touch(key);
                        return Ok(value);
                    }
                    inner.remove(key);
                }
                Some(Slot::InFlight(shared)) => {
                    let shared = shared.clone();
                    drop(inner);
                    return shared.await.map(|cv| cv.value);
                }
                None => {}
            }

            let shared = self.wrap_compute(key.to_owned(), compute());
            inner
                .map
                .insert(key.to_owned(), Slot::InFlight(shared.clone()));
            shared
        };

        shared.await.map(|cv| cv.value)
    }

    /// Box the computation together with the bookkeeping that runs exactly
    /// once when it finishes: store the value (or evict on error) and apply
    /// the TTL policy.
    fn wrap_compute<Fut, E>(&self, key: String, fut: Fut) -> SharedCompute<T>
    where
        Fut: Future<Output = std::result::Result<CacheValue<T>, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let ttl = self.ttl;
        let capacity = self.capacity;

        async move {
            let result = fut.await;
            let mut inner = inner.lock().await;
            match result {
                Ok(cv) => {
                    let expires_at = if cv.no_expiry {
                        None
                    } else {
                        ttl.map(|d| Instant::now() + d)
                    };
                    inner.insert_ready(&key, cv.value.clone(), expires_at, capacity);
                    Ok(cv)
                }
                Err(e) => {
                    inner.remove(&key);
                    Err(CacheError::Compute(Arc::new(e)))
                }
            }
        }
        .boxed()
        .shared()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
