// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot asynchronous result.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::condition::Condition;
use crate::kernel::Kernel;
use crate::lock::Lock;
use crate::thread::KThread;

struct Shared<T> {
    lock: Arc<Lock>,
    done: Condition,
    result: Mutex<Option<T>>,
}

impl<T> Shared<T> {
    fn result(&self) -> MutexGuard<'_, Option<T>> {
        self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A value computed once on its own kernel thread.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
    thread: KThread,
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    /// Fork a thread running `f` and return without waiting for it.
    pub fn new<F>(kernel: &Kernel, f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let lock = Arc::new(Lock::new(kernel));
        let shared = Arc::new(Shared {
            done: Condition::new(lock.clone()),
            lock,
            result: Mutex::new(None),
        });
        let s = shared.clone();
        let thread = kernel.fork("future", move || {
            let value = f();
            s.lock.acquire();
            *s.result() = Some(value);
            debug!(target: "spindle::future", waiters = s.done.waiters(), "completed");
            s.done.wake_all();
            s.lock.release();
        });
        Self { shared, thread }
    }

    /// Block until the result is ready, then return a copy of it.
    pub fn get(&self) -> T {
        let shared = &self.shared;
        shared.lock.acquire();
        let value = loop {
            if let Some(value) = shared.result().clone() {
                break value;
            }
            shared.done.sleep();
        };
        shared.lock.release();
        value
    }

    pub fn is_complete(&self) -> bool {
        self.shared.result().is_some()
    }

    /// The thread running the computation.
    pub fn thread(&self) -> &KThread {
        &self.thread
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            thread: self.thread.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn get_blocks_until_the_value_is_ready() {
        let (early, value, late) = Kernel::builder()
            .timer_interval(1 << 40)
            .run(|kernel| {
                let future = Future::new(kernel, || 6 * 7);
                let early = future.is_complete();
                let value = future.get();
                (early, value, future.is_complete())
            })
            .unwrap();
        assert!(!early);
        assert_eq!(value, 42);
        assert!(late);
    }

    #[test]
    fn computation_runs_once_for_many_getters() {
        let (runs, results) = Kernel::builder()
            .run(|kernel| {
                let runs = Arc::new(AtomicUsize::new(0));
                let r = runs.clone();
                let k = kernel.clone();
                let future = Future::new(kernel, move || {
                    r.fetch_add(1, Ordering::SeqCst);
                    k.alarm().wait_until(2_000);
                    "done".to_string()
                });
                let results = Arc::new(Mutex::new(Vec::new()));
                let getters: Vec<_> = (0..2)
                    .map(|_| {
                        let (f, results) = (future.clone(), results.clone());
                        kernel.fork("getter", move || {
                            let v = f.get();
                            results.lock().unwrap().push(v);
                        })
                    })
                    .collect();
                for g in &getters {
                    g.join();
                }
                assert_eq!(future.get(), "done");
                future.thread().join();
                let results = results.lock().unwrap().clone();
                (runs.load(Ordering::SeqCst), results)
            })
            .unwrap();
        assert_eq!(runs, 1);
        assert_eq!(results, vec!["done".to_string(), "done".to_string()]);
    }

    #[test]
    fn get_after_completion_does_not_block() {
        let value = Kernel::builder()
            .run(|kernel| {
                let future = Future::new(kernel, || vec![1, 2, 3]);
                future.thread().join();
                assert!(future.is_complete());
                future.get()
            })
            .unwrap();
        assert_eq!(value, vec![1, 2, 3]);
    }
}
