//! Message deduplication for the packet bus
//!
//! Prevents duplicate processing of packets when:
//! - Redis redelivers after a subscriber reconnect
//! - A worker retries a publish it believes failed
//! - Several front-ends relay the same packet

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};

use fleetlink_core::config::MAX_MESSAGE_CACHE_CAPACITY;

/// Bounded FIFO of recently seen message ids
///
/// Once full, the oldest id is forgotten first. A capacity of 0 disables
/// deduplication.
pub struct MessageCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl MessageCache {
    /// Create a cache; `capacity` is clamped to `0..=500`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let capacity = capacity.min(MAX_MESSAGE_CACHE_CAPACITY as usize);
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                order: VecDeque::with_capacity(capacity),
                seen: HashSet::with_capacity(capacity),
            }),
        }
    }

    /// Record `message_id`. Returns `true` the first time an id is seen and
    /// `false` while it is still remembered.
    #[must_use]
    pub fn check_and_insert(&self, message_id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }

        let mut inner = self.inner.lock();
        if inner.seen.contains(message_id) {
            return false;
        }

        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        inner.order.push_back(message_id.to_string());
        inner.seen.insert(message_id.to_string());
        true
    }

    #[must_use]
    pub fn contains(&self, message_id: &str) -> bool {
        self.inner.lock().seen.contains(message_id)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of remembered ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every id
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.order.clear();
        inner.seen.clear();
    }
}
