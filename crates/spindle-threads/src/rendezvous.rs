// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tag-scoped two-party exchange.
//!
//! Two threads calling `exchange` with the same tag swap values; each call
//! returns once exactly one partner has shown up. Distinct tags never
//! interact. A third caller on a busy tag backs off on a timed wait until
//! the pair ahead has cleared.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::condition::Condition;
use crate::kernel::Kernel;
use crate::lock::Lock;

/// Ticks a late arrival waits before re-checking a busy tag.
pub const DEFAULT_RETRY_INTERVAL: i64 = 10_000;

struct Slots<V> {
    /// 0, 1, or 2 (pair pending clearance).
    arrived: u8,
    first: Option<V>,
    second: Option<V>,
}

struct ExchangePoint<V> {
    lock: Arc<Lock>,
    partner: Condition,
    slots: Mutex<Slots<V>>,
}

impl<V> ExchangePoint<V> {
    fn new(kernel: &Kernel) -> Self {
        let lock = Arc::new(Lock::new(kernel));
        Self {
            partner: Condition::new(lock.clone()),
            lock,
            slots: Mutex::new(Slots {
                arrived: 0,
                first: None,
                second: None,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots<V>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Rendezvous<K, V> {
    kernel: Kernel,
    retry_interval: i64,
    points: Mutex<HashMap<K, Arc<ExchangePoint<V>>>>,
}

impl<K, V> Rendezvous<K, V>
where
    K: Eq + Hash + std::fmt::Debug,
{
    pub fn new(kernel: &Kernel) -> Self {
        Self::with_retry_interval(kernel, DEFAULT_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(kernel: &Kernel, retry_interval: i64) -> Self {
        Self {
            kernel: kernel.clone(),
            retry_interval,
            points: Mutex::new(HashMap::new()),
        }
    }

    // Created on first use. The table lock never spans a kernel call.
    fn point(&self, tag: K) -> Arc<ExchangePoint<V>> {
        let mut points = self.points.lock().unwrap_or_else(PoisonError::into_inner);
        points
            .entry(tag)
            .or_insert_with(|| Arc::new(ExchangePoint::new(&self.kernel)))
            .clone()
    }

    /// Swap `value` with the next caller on `tag`. Blocks until there is one.
    pub fn exchange(&self, tag: K, value: V) -> V {
        debug!(target: "spindle::rendezvous", ?tag, thread = %self.kernel.current_thread(), "exchange");
        let point = self.point(tag);
        point.lock.acquire();

        while point.slots().arrived >= 2 {
            point.partner.sleep_for(self.retry_interval);
        }

        let arrived = {
            let mut slots = point.slots();
            slots.arrived += 1;
            slots.arrived
        };

        let theirs = if arrived == 1 {
            point.slots().first = Some(value);
            while point.slots().arrived < 2 {
                point.partner.sleep();
            }
            let mut slots = point.slots();
            slots.arrived = 0;
            slots.second.take()
        } else {
            let theirs = {
                let mut slots = point.slots();
                slots.second = Some(value);
                slots.first.take()
            };
            // late arrivals share the wait set; they re-check and go back
            point.partner.wake_all();
            theirs
        };

        point.lock.release();
        theirs.expect("partner stored its value before the pair cleared")
    }

    /// Tags seen so far.
    pub fn tags(&self) -> usize {
        self.points
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
