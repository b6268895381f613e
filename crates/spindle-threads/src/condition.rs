// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Condition variables coupled to a `Lock`.
//!
//! Every operation requires the caller to hold the lock. Waking does not
//! hand over the lock; a woken thread competes for it like anyone else and
//! must re-check its condition:
//!
//! ```ignore
//! lock.acquire();
//! while !ready() {
//!     cond.sleep();
//! }
//! lock.release();
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::kernel::Kernel;
use crate::lock::Lock;
use crate::thread::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Waiter {
    thread: ThreadId,
    /// Parked by `sleep_for`, so an alarm entry may also wake it.
    timed: bool,
}

pub struct Condition {
    lock: Arc<Lock>,
    waiters: Mutex<VecDeque<Waiter>>,
}

impl Condition {
    pub fn new(lock: Arc<Lock>) -> Self {
        Self {
            lock,
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    fn kernel(&self) -> &Kernel {
        self.lock.kernel()
    }

    fn waiting(&self) -> MutexGuard<'_, VecDeque<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn assert_held(&self, op: &str) {
        assert!(
            self.lock.is_held_by_current_thread(),
            "condition {op} without holding its lock"
        );
    }

    /// Release the lock and block until woken, then reacquire the lock.
    pub fn sleep(&self) {
        self.assert_held("sleep");
        let kernel = self.kernel();
        let int = kernel.interrupt().disable();
        let thread = kernel.current_id();
        debug!(target: "spindle::condition", thread = %kernel.label(thread), "sleeping");
        self.waiting().push_back(Waiter {
            thread,
            timed: false,
        });
        self.lock.release();
        kernel.sleep();
        self.lock.acquire();
        kernel.interrupt().restore(int);
    }

    /// Like `sleep`, but also wakes after `timeout` ticks. There is no way
    /// to tell the two apart.
    pub fn sleep_for(&self, timeout: i64) {
        self.assert_held("sleep_for");
        let kernel = self.kernel();
        let int = kernel.interrupt().disable();
        let thread = kernel.current_id();
        debug!(target: "spindle::condition", thread = %kernel.label(thread), timeout, "sleeping with timeout");
        self.waiting().push_back(Waiter {
            thread,
            timed: true,
        });
        self.lock.release();
        kernel.alarm().wait_until(timeout);
        // still queued if the alarm got here first
        self.waiting().retain(|w| w.thread != thread);
        self.lock.acquire();
        kernel.interrupt().restore(int);
    }

    /// Wake the longest waiter, if any.
    pub fn wake(&self) {
        self.assert_held("wake");
        let int = self.kernel().interrupt().disable();
        self.wake_one();
        self.kernel().interrupt().restore(int);
    }

    /// Wake every waiter, in arrival order.
    pub fn wake_all(&self) {
        self.assert_held("wake_all");
        let int = self.kernel().interrupt().disable();
        while self.wake_one() {}
        self.kernel().interrupt().restore(int);
    }

    /// Pop waiters until one is actually readied. A timed waiter whose
    /// alarm already fired is ready on its own and is skipped. Returns
    /// false once the wait set is exhausted.
    fn wake_one(&self) -> bool {
        let kernel = self.kernel();
        loop {
            let Some(waiter) = self.waiting().pop_front() else {
                return false;
            };
            if waiter.timed {
                if kernel.alarm().cancel_thread(waiter.thread) {
                    debug!(target: "spindle::condition", thread = %kernel.label(waiter.thread), "woke timed waiter");
                    return true;
                }
                continue;
            }
            debug!(target: "spindle::condition", thread = %kernel.label(waiter.thread), "woke");
            kernel.ready_thread(waiter.thread);
            return true;
        }
    }

    /// Threads in the wait set.
    pub fn waiters(&self) -> usize {
        self.waiting().len()
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition")
            .field("waiters", &self.waiters())
            .finish()
    }
}
