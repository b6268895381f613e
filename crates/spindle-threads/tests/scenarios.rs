// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end kernel scenarios through the public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use spindle_threads::{
    Condition, Future, KThread, Kernel, KernelError, Lock, Rendezvous, Scheduler, ThreadId,
    ThreadQueue, ThreadStatus,
};

fn quiet() -> spindle_threads::KernelBuilder {
    // no timer preemption: scheduling order is fully determined by the test
    Kernel::builder().timer_interval(1 << 40)
}

#[test]
fn joiner_resumes_only_after_target_finishes() {
    let log = Kernel::builder()
        .run(|kernel| {
            let log = Arc::new(Mutex::new(Vec::new()));
            let (k, l) = (kernel.clone(), log.clone());
            let worker = kernel.fork("worker", move || {
                for i in 0..20 {
                    l.lock().unwrap().push(format!("work {i}"));
                    k.yield_now();
                }
            });
            let (w, l) = (worker.clone(), log.clone());
            let waiter = kernel.fork("waiter", move || {
                w.join();
                assert_eq!(w.status(), ThreadStatus::Finished);
                l.lock().unwrap().push("joined".to_string());
            });
            waiter.join();
            let log = log.lock().unwrap().clone();
            log
        })
        .unwrap();
    assert_eq!(log.last().map(String::as_str), Some("joined"));
    assert_eq!(log.len(), 21);
}

#[test]
fn threads_blocked_at_shutdown_are_torn_down() {
    let out = Kernel::builder().run(|kernel| {
        let lock = Arc::new(Lock::new(kernel));
        lock.acquire();
        for _ in 0..3 {
            let lock = lock.clone();
            kernel.fork("blocked", move || lock.acquire());
        }
        kernel.yield_now();
        "done"
    });
    assert_eq!(out, Ok("done"));
}

#[test]
fn raw_sleep_and_ready() {
    let order = quiet()
        .run(|kernel| {
            let parked: Arc<Mutex<Option<KThread>>> = Arc::default();
            let order = Arc::new(Mutex::new(Vec::new()));
            let (k, p, o) = (kernel.clone(), parked.clone(), order.clone());
            let sleeper = kernel.fork("sleeper", move || {
                let int = k.interrupt().disable();
                *p.lock().unwrap() = Some(k.current_thread());
                k.sleep();
                k.interrupt().restore(int);
                o.lock().unwrap().push("sleeper resumed");
            });
            kernel.yield_now();
            assert_eq!(sleeper.status(), ThreadStatus::Blocked);
            order.lock().unwrap().push("main readies");

            let int = kernel.interrupt().disable();
            let target = parked.lock().unwrap().take();
            if let Some(target) = target {
                target.ready();
            }
            kernel.interrupt().restore(int);

            sleeper.join();
            let order = order.lock().unwrap().clone();
            order
        })
        .unwrap();
    assert_eq!(order, vec!["main readies", "sleeper resumed"]);
}

#[test]
fn double_join_reports_the_offending_thread() {
    let out = quiet().run(|kernel| {
        let target = kernel.new_thread(|| {});
        target.set_name("target");
        let (t1, t2) = (target.clone(), target.clone());
        let a = kernel.fork("first", move || t1.join());
        let b = kernel.fork("second", move || t2.join());
        target.fork();
        a.join();
        b.join();
    });
    match out {
        Err(KernelError::ThreadPanicked { thread, message }) => {
            assert!(thread.starts_with("second"), "{thread}");
            assert!(message.contains("already been joined"), "{message}");
        }
        other => panic!("expected ThreadPanicked, got {other:?}"),
    }
}

#[test]
fn alarm_never_wakes_early() {
    let samples = Kernel::builder()
        .run(|kernel| {
            let samples = Arc::new(Mutex::new(Vec::new()));
            let threads: Vec<_> = [700i64, 1_500, 4_200, 333, 10_000]
                .into_iter()
                .map(|ticks| {
                    let (k, s) = (kernel.clone(), samples.clone());
                    kernel.fork("sleeper", move || {
                        let start = k.time();
                        k.alarm().wait_until(ticks);
                        s.lock().unwrap().push((ticks, start, k.time()));
                    })
                })
                .collect();
            for t in &threads {
                t.join();
            }
            let samples = samples.lock().unwrap().clone();
            samples
        })
        .unwrap();
    assert_eq!(samples.len(), 5);
    for (ticks, start, woke) in &samples {
        assert!(woke - start >= *ticks as u64, "{ticks}: {start} -> {woke}");
    }
    let order: Vec<i64> = samples.iter().map(|s| s.0).collect();
    assert_eq!(order, vec![333, 700, 1_500, 4_200, 10_000]);
}

#[test]
fn cancelled_sleeper_is_not_woken_again_at_expiry() {
    let second_wait = Kernel::builder()
        .run(|kernel| {
            let second_wait = Arc::new(Mutex::new(0));
            let (k, w) = (kernel.clone(), second_wait.clone());
            let sleeper = kernel.fork("sleeper", move || {
                k.alarm().wait_until(2_000);
                // Spans the cancelled wake tick. A leftover entry would
                // cut this wait short.
                let start = k.time();
                k.alarm().wait_until(5_000);
                *w.lock().unwrap() = k.time() - start;
            });
            kernel.yield_now();
            assert!(kernel.alarm().cancel(&sleeper));
            assert!(!kernel.alarm().cancel(&sleeper));
            sleeper.join();
            let second_wait = *second_wait.lock().unwrap();
            second_wait
        })
        .unwrap();
    assert!(second_wait >= 5_000, "second wait lasted {second_wait}");
}

#[test]
fn no_wakeup_is_lost_between_enqueue_and_block() {
    // The waker runs as soon as the sleeper gives up the lock.
    let rounds = Kernel::builder()
        .run(|kernel| {
            let lock = Arc::new(Lock::new(kernel));
            let cond = Arc::new(Condition::new(lock.clone()));
            let turn = Arc::new(Mutex::new(0u32));
            let (c, t) = (cond.clone(), turn.clone());
            let ponger = kernel.fork("ponger", move || {
                c.lock().acquire();
                for _ in 0..50 {
                    while *t.lock().unwrap() % 2 == 0 {
                        c.sleep();
                    }
                    *t.lock().unwrap() += 1;
                    c.wake();
                }
                c.lock().release();
            });
            cond.lock().acquire();
            for _ in 0..50 {
                *turn.lock().unwrap() += 1;
                cond.wake();
                while *turn.lock().unwrap() % 2 == 1 {
                    cond.sleep();
                }
            }
            cond.lock().release();
            ponger.join();
            let rounds = *turn.lock().unwrap();
            rounds
        })
        .unwrap();
    assert_eq!(rounds, 100);
}

#[test]
fn wake_order_is_arrival_order() {
    let order = quiet()
        .run(|kernel| {
            let cond = Arc::new(Condition::new(Arc::new(Lock::new(kernel))));
            let order = Arc::new(Mutex::new(Vec::new()));
            let threads: Vec<_> = (0..5)
                .map(|i| {
                    let (c, o) = (cond.clone(), order.clone());
                    kernel.fork(&format!("waiter {i}"), move || {
                        c.lock().with(|| {
                            c.sleep();
                            o.lock().unwrap().push(i);
                        });
                    })
                })
                .collect();
            kernel.yield_now();
            for _ in 0..5 {
                cond.lock().with(|| cond.wake());
                kernel.yield_now();
            }
            for t in &threads {
                t.join();
            }
            let order = order.lock().unwrap().clone();
            order
        })
        .unwrap();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
}

#[test]
fn sleep_for_woken_early_leaves_no_alarm_behind() {
    let (pending, elapsed) = Kernel::builder()
        .run(|kernel| {
            let cond = Arc::new(Condition::new(Arc::new(Lock::new(kernel))));
            let elapsed = Arc::new(Mutex::new(0));
            let (c, k, e) = (cond.clone(), kernel.clone(), elapsed.clone());
            let waiter = kernel.fork("waiter", move || {
                c.lock().with(|| {
                    let start = k.time();
                    c.sleep_for(1_000_000);
                    *e.lock().unwrap() = k.time() - start;
                });
            });
            kernel.yield_now();
            cond.lock().with(|| cond.wake());
            waiter.join();
            // run well past the first timeout
            kernel.alarm().wait_until(1_500_000);
            let elapsed = *elapsed.lock().unwrap();
            (kernel.alarm().pending(), elapsed)
        })
        .unwrap();
    assert_eq!(pending, 0);
    assert!(elapsed < 1_000_000);
}

#[test]
fn rendezvous_swaps_in_either_arrival_order() {
    for first in [4, 8] {
        let second = if first == 4 { 8 } else { 4 };
        let got = Kernel::builder()
            .run(|kernel| {
                let rv = Arc::new(Rendezvous::new(kernel));
                let out = Arc::new(Mutex::new(Vec::new()));
                let threads: Vec<_> = [first, second]
                    .into_iter()
                    .map(|value| {
                        let (rv, out) = (rv.clone(), out.clone());
                        kernel.fork("exchanger", move || {
                            let got = rv.exchange(1, value);
                            out.lock().unwrap().push((value, got));
                        })
                    })
                    .collect();
                for t in &threads {
                    t.join();
                }
                let got = out.lock().unwrap().clone();
                got
            })
            .unwrap();
        assert_eq!(got, vec![(second, first), (first, second)]);
    }
}

#[test]
fn third_arrival_waits_for_the_pair_to_clear() {
    let got = Kernel::builder()
        .run(|kernel| {
            let rv: Arc<Rendezvous<u8, &'static str>> =
                Arc::new(Rendezvous::with_retry_interval(kernel, 500));
            let out = Arc::new(Mutex::new(Vec::new()));
            let spawn = |name: &'static str| {
                let (rv, out) = (rv.clone(), out.clone());
                kernel.fork(name, move || {
                    let got = rv.exchange(0, name);
                    out.lock().unwrap().push((name, got));
                })
            };
            let a = spawn("a");
            let b = spawn("b");
            let c = spawn("c");
            // c arrives while a and b are still clearing; d comes much later
            let (k, rv2, out2) = (kernel.clone(), rv.clone(), out.clone());
            let d = kernel.fork("d", move || {
                k.alarm().wait_until(5_000);
                let got = rv2.exchange(0, "d");
                out2.lock().unwrap().push(("d", got));
            });
            for t in [&a, &b, &c, &d] {
                t.join();
            }
            let mut got = out.lock().unwrap().clone();
            got.sort();
            got
        })
        .unwrap();
    assert_eq!(got, vec![("a", "b"), ("b", "a"), ("c", "d"), ("d", "c")]);
}

#[test]
fn future_runs_once_for_every_getter() {
    let (runs, seen) = Kernel::builder()
        .run(|kernel| {
            let runs = Arc::new(AtomicUsize::new(0));
            let (k, r) = (kernel.clone(), runs.clone());
            let future = Future::new(kernel, move || {
                r.fetch_add(1, Ordering::SeqCst);
                k.alarm().wait_until(3_000);
                String::from("result")
            });
            let seen = Arc::new(Mutex::new(Vec::new()));
            let getters: Vec<_> = (0..3)
                .map(|_| {
                    let (f, s) = (future.clone(), seen.clone());
                    kernel.fork("getter", move || {
                        // Never hold a host mutex across a blocking kernel call.
                        let value = f.get();
                        s.lock().unwrap().push(value);
                    })
                })
                .collect();
            for g in &getters {
                g.join();
            }
            let value = future.get();
            seen.lock().unwrap().push(value);
            let seen = seen.lock().unwrap().clone();
            (runs.load(Ordering::SeqCst), seen)
        })
        .unwrap();
    assert_eq!(runs, 1);
    assert_eq!(seen, vec!["result"; 4]);
}

#[test]
fn deadlock_names_every_blocked_thread() {
    let out = quiet().run(|kernel| {
        let a = Arc::new(Lock::new(kernel));
        let b = Arc::new(Lock::new(kernel));
        let (k, a1, b1) = (kernel.clone(), a.clone(), b.clone());
        let left = kernel.fork("left", move || {
            a1.acquire();
            k.yield_now();
            b1.acquire();
        });
        let (k, a2, b2) = (kernel.clone(), a.clone(), b.clone());
        let right = kernel.fork("right", move || {
            b2.acquire();
            k.yield_now();
            a2.acquire();
        });
        left.join();
        right.join();
    });
    match out {
        Err(KernelError::Deadlock { blocked }) => {
            assert_eq!(blocked.len(), 3, "{blocked:?}");
            assert!(blocked[0].starts_with("main"));
            assert!(blocked.iter().any(|t| t.starts_with("left")));
            assert!(blocked.iter().any(|t| t.starts_with("right")));
        }
        other => panic!("expected Deadlock, got {other:?}"),
    }
}

/// Last in, first out. Legal, if unfair.
#[derive(Default)]
struct StackScheduler;

#[derive(Default)]
struct StackQueue(Vec<ThreadId>);

impl ThreadQueue for StackQueue {
    fn wait_for_access(&mut self, thread: ThreadId) {
        self.0.push(thread);
    }

    fn next_thread(&mut self) -> Option<ThreadId> {
        self.0.pop()
    }

    fn acquire(&mut self, _thread: ThreadId) {}

    fn len(&self) -> usize {
        self.0.len()
    }
}

impl Scheduler for StackScheduler {
    fn new_thread_queue(&self, _transfer_priority: bool) -> Box<dyn ThreadQueue> {
        Box::new(StackQueue::default())
    }
}

#[test]
fn ready_order_follows_the_installed_policy() {
    let order = quiet()
        .scheduler(StackScheduler)
        .run(|kernel| {
            let order = Arc::new(Mutex::new(Vec::new()));
            let threads: Vec<_> = ["a", "b", "c"]
                .into_iter()
                .map(|name| {
                    let o = order.clone();
                    kernel.fork(name, move || o.lock().unwrap().push(name))
                })
                .collect();
            threads[0].join();
            let order = order.lock().unwrap().clone();
            order
        })
        .unwrap();
    assert_eq!(order, vec!["c", "b", "a"]);
}
