//! Listener-scoped TLS session cache.
//!
//! Handshakes on different connections run in parallel, but every insert,
//! lookup and eviction goes through the single mutex owned by the cache, so
//! concurrent handshakes never race on shared session state.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustls::server::StoresServerSessions;

/// Default number of sessions retained per listener.
pub const DEFAULT_SESSION_CAPACITY: usize = 1024;

struct Entry {
    value: Vec<u8>,
    stored_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Vec<u8>, Entry>,
    order: VecDeque<Vec<u8>>,
}

/// Bounded, time-limited session store.
pub struct SessionCache {
    inner: Mutex<Inner>,
    capacity: usize,
    timeout: Duration,
}

impl SessionCache {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            timeout,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves only cache entries behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expired(&self, entry: &Entry, now: Instant) -> bool {
        now.duration_since(entry.stored_at) >= self.timeout
    }
}

impl StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(key, Entry { value, stored_at: now });
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if !self.expired(entry, now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k.as_slice() != key);
            tracing::trace!("Expired TLS session evicted");
        }
        None
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut inner = self.lock();
        let entry = inner.entries.remove(key)?;
        inner.order.retain(|k| k.as_slice() != key);
        if self.expired(&entry, now) {
            None
        } else {
            Some(entry.value)
        }
    }

    fn can_cache(&self) -> bool {
        true
    }
}

impl fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("capacity", &self.capacity)
            .field("timeout", &self.timeout)
            .finish()
    }
}
