// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Condition variables, with and without timeouts.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use spindle_threads::{Condition, Kernel, Lock};
use tracing::info;

use super::{Case, Expect};

pub const CASES: &[Case] = &[
    Case {
        name: "producer-consumer",
        about: "a consumer sleeps until the producer fills the list",
        expect: Expect::Pass,
        run: producer_consumer,
    },
    Case {
        name: "wake-one",
        about: "wake wakes at most one of several waiters",
        expect: Expect::Pass,
        run: wake_one,
    },
    Case {
        name: "wake-all",
        about: "wake_all wakes every waiter",
        expect: Expect::Pass,
        run: wake_all,
    },
    Case {
        name: "needs-lock",
        about: "sleeping without the lock is a contract violation",
        expect: Expect::Panic("without holding its lock"),
        run: needs_lock,
    },
    Case {
        name: "wake-before-sleep",
        about: "a wake with no waiters is not remembered",
        expect: Expect::Pass,
        run: wake_before_sleep,
    },
    Case {
        name: "sleep-for-timeout",
        about: "sleep_for returns after the timeout when nobody wakes it",
        expect: Expect::Pass,
        run: sleep_for_timeout,
    },
    Case {
        name: "sleep-for-woken",
        about: "a wake ends sleep_for early and cancels its timeout",
        expect: Expect::Pass,
        run: sleep_for_woken,
    },
    Case {
        name: "sleep-for-wake-all",
        about: "wake_all ends every sleep_for, whatever its timeout",
        expect: Expect::Pass,
        run: sleep_for_wake_all,
    },
];

type List = Arc<Mutex<VecDeque<u32>>>;

fn setup(kernel: &Kernel) -> (Arc<Lock>, Arc<Condition>) {
    let lock = Arc::new(Lock::new(kernel));
    let cond = Arc::new(Condition::new(lock.clone()));
    (lock, cond)
}

/// Sleep until `list` holds five items, then drain it.
fn drain_five(
    kernel: &Kernel,
    lock: &Arc<Lock>,
    cond: &Arc<Condition>,
    list: &List,
    wake_next: bool,
) -> impl FnOnce() + Send + 'static {
    let (k, lock, cond, list) = (kernel.clone(), lock.clone(), cond.clone(), list.clone());
    move || {
        lock.acquire();
        while list.lock().unwrap().is_empty() {
            cond.sleep();
        }
        assert_eq!(list.lock().unwrap().len(), 5, "list should have 5 values");
        loop {
            k.yield_now();
            let Some(item) = list.lock().unwrap().pop_front() else {
                break;
            };
            info!(target: "spindle::selftest", thread = %k.current_thread(), item, "removed");
        }
        if wake_next {
            cond.wake();
        }
        lock.release();
    }
}

fn producer_consumer(kernel: &Kernel) {
    let (lock, cond) = setup(kernel);
    let list: List = Arc::default();
    let consumer = kernel.fork("Consumer", drain_five(kernel, &lock, &cond, &list, false));
    let (k, l, c, items) = (kernel.clone(), lock.clone(), cond.clone(), list.clone());
    let producer = kernel.fork("Producer", move || {
        l.acquire();
        for i in 0..5 {
            items.lock().unwrap().push_back(i);
            k.yield_now();
        }
        c.wake();
        l.release();
    });
    consumer.join();
    producer.join();
    assert!(list.lock().unwrap().is_empty());
}

fn two_waiters_one_producer(kernel: &Kernel, broadcast: bool) -> Vec<usize> {
    let (lock, cond) = setup(kernel);
    let (list1, list2): (List, List) = (Arc::default(), Arc::default());
    // In the single-wake variant each woken waiter passes the wake along.
    let waiter1 = kernel.fork("Waiter1", drain_five(kernel, &lock, &cond, &list1, !broadcast));
    let waiter2 = kernel.fork("Waiter2", drain_five(kernel, &lock, &cond, &list2, !broadcast));

    let woken_now = Arc::new(Mutex::new(Vec::new()));
    let (k, l, c, a, b, w) = (
        kernel.clone(),
        lock.clone(),
        cond.clone(),
        list1.clone(),
        list2.clone(),
        woken_now.clone(),
    );
    let producer = kernel.fork("Producer", move || {
        wait_for_sleepers(&k, &c, 2);
        l.acquire();
        for i in 0..5 {
            a.lock().unwrap().push_back(i);
            b.lock().unwrap().push_back(i);
            k.yield_now();
        }
        let before = c.waiters();
        if broadcast {
            c.wake_all();
        } else {
            c.wake();
        }
        w.lock().unwrap().extend([before, c.waiters()]);
        l.release();
    });
    waiter1.join();
    waiter2.join();
    producer.join();
    let counts = woken_now.lock().unwrap().clone();
    counts
}

fn wake_one(kernel: &Kernel) {
    assert_eq!(two_waiters_one_producer(kernel, false), vec![2, 1]);
}

fn wake_all(kernel: &Kernel) {
    assert_eq!(two_waiters_one_producer(kernel, true), vec![2, 0]);
}

fn needs_lock(kernel: &Kernel) {
    let (_lock, cond) = setup(kernel);
    let c = cond.clone();
    let sleeper = kernel.fork("Sleeper", move || c.sleep());
    sleeper.join();
}

fn wake_before_sleep(kernel: &Kernel) {
    let (lock, cond) = setup(kernel);
    let list: List = Arc::default();
    let (l, c) = (lock.clone(), cond.clone());
    let producer1 = kernel.fork("Producer1", move || {
        l.acquire();
        c.wake();
        c.wake_all();
        l.release();
    });
    let consumer = kernel.fork("Consumer", drain_five(kernel, &lock, &cond, &list, false));
    let (k, l, c, items) = (kernel.clone(), lock.clone(), cond.clone(), list.clone());
    let producer2 = kernel.fork("Producer2", move || {
        l.acquire();
        for i in 0..5 {
            items.lock().unwrap().push_back(i);
            k.yield_now();
        }
        c.wake();
        l.release();
    });
    producer1.join();
    consumer.join();
    producer2.join();
}

/// Yield until `count` threads are asleep on `cond`.
fn wait_for_sleepers(kernel: &Kernel, cond: &Condition, count: usize) {
    while cond.waiters() < count {
        kernel.yield_now();
    }
}

fn timed_waiter(
    kernel: &Kernel,
    lock: &Arc<Lock>,
    cond: &Arc<Condition>,
    timeout: i64,
    slept: &Arc<Mutex<Vec<u64>>>,
) -> impl FnOnce() + Send + 'static {
    let (k, lock, cond, slept) = (kernel.clone(), lock.clone(), cond.clone(), slept.clone());
    move || {
        lock.acquire();
        let t0 = k.time();
        cond.sleep_for(timeout);
        assert!(lock.is_held_by_current_thread());
        lock.release();
        slept.lock().unwrap().push(k.time() - t0);
    }
}

fn sleep_for_timeout(kernel: &Kernel) {
    let (lock, cond) = setup(kernel);
    let slept = Arc::new(Mutex::new(Vec::new()));
    let waiter = kernel.fork("Waiter", timed_waiter(kernel, &lock, &cond, 100_000, &slept));
    waiter.join();
    let slept = slept.lock().unwrap();
    assert!(slept[0] >= 100_000, "woke after {} ticks", slept[0]);
    assert_eq!(cond.waiters(), 0);
}

fn sleep_for_woken(kernel: &Kernel) {
    let (lock, cond) = setup(kernel);
    let slept = Arc::new(Mutex::new(Vec::new()));
    let waiter = kernel.fork(
        "Waiter",
        timed_waiter(kernel, &lock, &cond, 10_000_000, &slept),
    );
    let (k, l, c) = (kernel.clone(), lock.clone(), cond.clone());
    let producer = kernel.fork("Producer", move || {
        wait_for_sleepers(&k, &c, 1);
        l.with(|| c.wake());
    });
    waiter.join();
    producer.join();
    assert!(slept.lock().unwrap()[0] < 10_000_000);
    assert_eq!(kernel.alarm().pending(), 0);
}

fn sleep_for_wake_all(kernel: &Kernel) {
    let (lock, cond) = setup(kernel);
    let slept = Arc::new(Mutex::new(Vec::new()));
    let waiter1 = kernel.fork(
        "Waiter1",
        timed_waiter(kernel, &lock, &cond, 10_000_000, &slept),
    );
    let waiter2 = kernel.fork(
        "Waiter2",
        timed_waiter(kernel, &lock, &cond, 50_000_000, &slept),
    );
    let (k, l, c) = (kernel.clone(), lock.clone(), cond.clone());
    let producer = kernel.fork("Producer", move || {
        wait_for_sleepers(&k, &c, 2);
        l.with(|| c.wake_all());
    });
    waiter1.join();
    waiter2.join();
    producer.join();
    assert_eq!(slept.lock().unwrap().len(), 2);
    assert_eq!(kernel.alarm().pending(), 0);
}
