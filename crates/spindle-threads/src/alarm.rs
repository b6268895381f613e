// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timed sleep service driven by the periodic timer.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::kernel::Kernel;
use crate::thread::{KThread, ThreadId};

#[derive(Default)]
struct Waiting {
    next_seq: u64,
    /// Keyed by (wake tick, arrival). Equal wake ticks expire FIFO.
    entries: BTreeMap<(u64, u64), ThreadId>,
}

/// The kernel's alarm wait list.
#[derive(Default)]
pub(crate) struct AlarmQueue {
    waiting: Mutex<Waiting>,
}

impl AlarmQueue {
    // Never held together with the scheduler table lock.
    fn waiting(&self) -> MutexGuard<'_, Waiting> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, wake_tick: u64, thread: ThreadId) {
        let mut w = self.waiting();
        let seq = w.next_seq;
        w.next_seq += 1;
        w.entries.insert((wake_tick, seq), thread);
    }

    /// Remove every entry due at or before `now`, earliest first.
    fn pop_expired(&self, now: u64) -> Vec<(u64, ThreadId)> {
        let mut w = self.waiting();
        let mut expired = Vec::new();
        while let Some((&(wake_tick, _), _)) = w.entries.first_key_value() {
            if wake_tick > now {
                break;
            }
            if let Some(((tick, _), thread)) = w.entries.pop_first() {
                expired.push((tick, thread));
            }
        }
        expired
    }

    fn remove(&self, thread: ThreadId) -> bool {
        let mut w = self.waiting();
        let key = w
            .entries
            .iter()
            .find(|(_, &t)| t == thread)
            .map(|(&key, _)| key);
        match key {
            Some(key) => w.entries.remove(&key).is_some(),
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting().entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Borrowed view of the kernel's one alarm.
pub struct Alarm<'k> {
    kernel: &'k Kernel,
}

impl<'k> Alarm<'k> {
    pub(crate) fn new(kernel: &'k Kernel) -> Self {
        Self { kernel }
    }

    /// Put the current thread to sleep for at least `ticks` ticks. It is
    /// woken by the first timer interrupt at or after that time.
    ///
    /// Non-positive durations return at once.
    pub fn wait_until(&self, ticks: i64) {
        if ticks <= 0 {
            return;
        }
        let kernel = self.kernel;
        let int = kernel.interrupt().disable();
        let wake_tick = kernel.time().saturating_add(ticks as u64);
        let current = kernel.current_id();
        debug!(
            target: "spindle::alarm",
            thread = %kernel.label(current),
            wake_tick,
            "waiting"
        );
        kernel.inner.alarm.insert(wake_tick, current);
        kernel.sleep();
        kernel.interrupt().restore(int);
    }

    /// Wake `thread` early if it is waiting here. Returns false, and does
    /// nothing, if it is not.
    pub fn cancel(&self, thread: &KThread) -> bool {
        let int = self.kernel.interrupt().disable();
        let cancelled = self.cancel_thread(thread.id());
        self.kernel.interrupt().restore(int);
        cancelled
    }

    /// Interrupts must be disabled.
    pub(crate) fn cancel_thread(&self, thread: ThreadId) -> bool {
        if !self.kernel.inner.alarm.remove(thread) {
            return false;
        }
        debug!(target: "spindle::alarm", thread = %self.kernel.label(thread), "cancelled");
        self.kernel.ready_thread(thread);
        true
    }

    /// Timer handler: ready every expired sleeper in wake order, then
    /// preempt the current thread.
    pub fn timer_interrupt(&self) {
        let now = self.kernel.time();
        for (wake_tick, thread) in self.kernel.inner.alarm.pop_expired(now) {
            debug!(
                target: "spindle::alarm",
                thread = %self.kernel.label(thread),
                wake_tick,
                now,
                "expired"
            );
            self.kernel.ready_thread(thread);
        }
        self.kernel.yield_now();
    }

    /// Threads currently waiting.
    pub fn pending(&self) -> usize {
        self.kernel.inner.alarm.len()
    }
}
