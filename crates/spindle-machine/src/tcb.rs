// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Execution contexts (thread control blocks).
//!
//! Each context is backed by its own OS thread, but only the context
//! holding the run baton executes. `switch_to` hands the baton to the
//! next context and parks the caller, so the machine behaves like one
//! CPU no matter how many OS threads exist.
//!
//! A parked context told to halt unwinds its OS thread with a `Halted`
//! payload. That is how finished contexts are reclaimed and how the whole
//! machine is torn down.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::trace;

/// Unwind payload used to tear down a parked context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Baton {
    Parked,
    Dispatched,
    Halted,
}

struct TcbInner {
    name: String,
    baton: Mutex<Baton>,
    signal: Condvar,
    os_id: OnceLock<ThreadId>,
    os_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to an execution context. Cloning shares the context.
#[derive(Clone)]
pub struct Tcb {
    inner: Arc<TcbInner>,
}

impl std::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tcb")
            .field("name", &self.inner.name)
            .field("baton", &*self.baton())
            .finish()
    }
}

impl Tcb {
    fn with_baton(name: &str, baton: Baton) -> Self {
        Self {
            inner: Arc::new(TcbInner {
                name: name.to_string(),
                baton: Mutex::new(baton),
                signal: Condvar::new(),
                os_id: OnceLock::new(),
                os_thread: Mutex::new(None),
            }),
        }
    }

    /// Wrap the calling OS thread. It already holds the baton.
    pub fn adopt_current(name: &str) -> Self {
        let tcb = Self::with_baton(name, Baton::Dispatched);
        let _ = tcb.inner.os_id.set(thread::current().id());
        tcb
    }

    /// A context that has not been started yet.
    pub fn new(name: &str) -> Self {
        Self::with_baton(name, Baton::Parked)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn baton(&self) -> MutexGuard<'_, Baton> {
        self.inner.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the backing OS thread. It stays parked until the first
    /// `switch_to` targeting this context, then runs `entry`.
    pub fn start<F>(&self, entry: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tcb = self.clone();
        let handle = thread::Builder::new()
            .name(os_thread_name(&self.inner.name))
            .spawn(move || {
                let _ = tcb.inner.os_id.set(thread::current().id());
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    tcb.park();
                    entry();
                }));
                if let Err(payload) = outcome {
                    if !payload.is::<Halted>() {
                        panic::resume_unwind(payload);
                    }
                }
                trace!(target: "spindle::machine", context = %tcb.inner.name, "context exited");
            })?;
        *self
            .inner
            .os_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        Ok(())
    }

    /// True when called from the OS thread backing this context.
    pub fn is_current(&self) -> bool {
        self.inner.os_id.get() == Some(&thread::current().id())
    }

    /// Give the CPU to `next` and park until this context is dispatched
    /// again. Switching to itself is a no-op.
    ///
    /// Unwinds with `Halted` if this context is halted while parked.
    pub fn switch_to(&self, next: &Tcb) {
        if Arc::ptr_eq(&self.inner, &next.inner) {
            return;
        }
        trace!(target: "spindle::machine", from = %self.inner.name, to = %next.inner.name, "context switch");
        {
            // Must happen before `next` runs: it may hand the baton
            // straight back.
            let mut baton = self.baton();
            if *baton == Baton::Dispatched {
                *baton = Baton::Parked;
            }
        }
        next.dispatch();
        self.park();
    }

    fn dispatch(&self) {
        let mut baton = self.baton();
        if *baton != Baton::Halted {
            *baton = Baton::Dispatched;
            self.inner.signal.notify_one();
        }
    }

    fn park(&self) {
        let mut baton = self.baton();
        loop {
            match *baton {
                Baton::Dispatched => return,
                Baton::Halted => {
                    drop(baton);
                    panic::resume_unwind(Box::new(Halted));
                }
                Baton::Parked => {
                    baton = self
                        .inner
                        .signal
                        .wait(baton)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Force a parked context to unwind. Idempotent.
    pub fn halt(&self) {
        let mut baton = self.baton();
        *baton = Baton::Halted;
        self.inner.signal.notify_all();
    }

    /// Reclaim a finished context. A context cannot destroy itself; the
    /// next context to run does it once the old stack is no longer in use.
    pub fn destroy(&self) {
        assert!(
            !self.is_current(),
            "context `{}` cannot destroy itself",
            self.inner.name
        );
        trace!(target: "spindle::machine", context = %self.inner.name, "destroying context");
        self.halt();
    }

    /// True once the backing OS thread has returned, or if there never was one.
    pub fn has_exited(&self) -> bool {
        self.inner
            .os_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, |handle| handle.is_finished())
    }

    /// Wait for the backing OS thread to exit. Call only after `halt`.
    pub fn join(&self) {
        if self.is_current() {
            return;
        }
        let handle = self
            .inner
            .os_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// OS thread names cannot carry NUL bytes.
fn os_thread_name(name: &str) -> String {
    format!("spindle-{}", name.replace('\0', "?"))
}
