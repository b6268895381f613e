// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel mutex.
//!
//! Built on the interrupt controller, not on a host lock. Ownership passes
//! straight from the releasing thread to the next waiter, so a released
//! lock with waiters is never observed free.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::kernel::Kernel;
use crate::sched::ThreadQueue;
use crate::thread::ThreadId;

struct LockState {
    holder: Option<ThreadId>,
    wait_queue: Box<dyn ThreadQueue>,
}

pub struct Lock {
    kernel: Kernel,
    state: Mutex<LockState>,
}

impl Lock {
    pub fn new(kernel: &Kernel) -> Self {
        Self {
            kernel: kernel.clone(),
            state: Mutex::new(LockState {
                holder: None,
                wait_queue: kernel.scheduler().new_thread_queue(true),
            }),
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the lock is free, then take it. Not re-entrant.
    pub fn acquire(&self) {
        assert!(
            !self.is_held_by_current_thread(),
            "lock acquired twice by its holder"
        );
        let int = self.kernel.interrupt().disable();
        let current = self.kernel.current_id();
        let must_wait = {
            let mut st = self.state();
            match st.holder {
                None => {
                    st.wait_queue.acquire(current);
                    st.holder = Some(current);
                    false
                }
                Some(_) => {
                    st.wait_queue.wait_for_access(current);
                    true
                }
            }
        };
        if must_wait {
            debug!(target: "spindle::lock", thread = %self.kernel.label(current), "contended");
            self.kernel.sleep();
        }
        debug_assert_eq!(self.state().holder, Some(current));
        self.kernel.interrupt().restore(int);
    }

    /// Release the lock, handing it to the longest waiter if there is one.
    pub fn release(&self) {
        assert!(
            self.is_held_by_current_thread(),
            "lock released by a thread that does not hold it"
        );
        let int = self.kernel.interrupt().disable();
        let next = {
            let mut st = self.state();
            let next = st.wait_queue.next_thread();
            st.holder = next;
            next
        };
        if let Some(next) = next {
            debug!(target: "spindle::lock", thread = %self.kernel.label(next), "handing off");
            self.kernel.ready_thread(next);
        }
        self.kernel.interrupt().restore(int);
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        let current = self.kernel.current_id();
        self.state().holder == Some(current)
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.acquire();
        let out = f();
        self.release();
        out
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("Lock")
            .field("holder", &st.holder)
            .field("waiters", &st.wait_queue.len())
            .finish()
    }
}
