// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fork, yield and join.

use std::sync::{Arc, Mutex};

use spindle_threads::{Kernel, ThreadStatus};
use tracing::info;

use super::{Case, Expect};

pub const CASES: &[Case] = &[
    Case {
        name: "ping",
        about: "two threads take turns yielding",
        expect: Expect::Pass,
        run: ping,
    },
    Case {
        name: "join-after-busy-wait",
        about: "a child that already ran is finished once joined",
        expect: Expect::Pass,
        run: join_after_busy_wait,
    },
    Case {
        name: "join-running",
        about: "joining a running thread waits for it to finish",
        expect: Expect::Pass,
        run: join_running,
    },
    Case {
        name: "join-finished",
        about: "joining a finished thread does not block",
        expect: Expect::Pass,
        run: join_finished,
    },
    Case {
        name: "join-self",
        about: "a thread joining itself is a contract violation",
        expect: Expect::Panic("cannot join itself"),
        run: join_self,
    },
    Case {
        name: "join-twice",
        about: "a second join on the same thread is a contract violation",
        expect: Expect::Panic("already been joined"),
        run: join_twice,
    },
    Case {
        name: "join-in-turn",
        about: "one thread joins several others in succession",
        expect: Expect::Pass,
        run: join_in_turn,
    },
];

fn ping(kernel: &Kernel) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pinger = |which: u32| {
        let (k, log) = (kernel.clone(), log.clone());
        move || {
            for i in 0..5 {
                info!(target: "spindle::selftest", which, i, "looped");
                log.lock().unwrap().push(which);
                k.yield_now();
            }
        }
    };
    let forked = kernel.fork("forked thread", pinger(1));
    pinger(0)();
    forked.join();
    let log = log.lock().unwrap();
    assert_eq!(log.len(), 10);
    assert_eq!(log.iter().filter(|&&w| w == 1).count(), 5);
}

fn join_after_busy_wait(kernel: &Kernel) {
    let child = kernel.fork("child1", || {
        info!(target: "spindle::selftest", "I (heart) spindle!");
    });
    for _ in 0..5 {
        kernel.yield_now();
    }
    child.join();
    assert_eq!(child.status(), ThreadStatus::Finished);
}

fn join_running(kernel: &Kernel) {
    let k = kernel.clone();
    let child = kernel.new_thread(move || {
        for _ in 0..3 {
            k.yield_now();
        }
    });
    child.set_name("Child1");
    let c = child.clone();
    let parent = kernel.fork("Parent1", move || {
        c.join();
        assert_eq!(c.status(), ThreadStatus::Finished);
    });
    child.fork();
    parent.join();
}

fn join_finished(kernel: &Kernel) {
    let child = kernel.fork("Child2", || {});
    let (k, c) = (kernel.clone(), child.clone());
    let parent = kernel.fork("Parent2", move || {
        while c.status() != ThreadStatus::Finished {
            k.yield_now();
        }
        let t0 = k.time();
        c.join();
        info!(target: "spindle::selftest", after = k.time() - t0, "joined a finished thread");
    });
    parent.join();
}

fn join_self(kernel: &Kernel) {
    kernel.current_thread().join();
}

fn join_twice(kernel: &Kernel) {
    let child = kernel.new_thread(|| {});
    child.set_name("Child4");
    let (c1, c2) = (child.clone(), child.clone());
    let a = kernel.fork("Parent4A", move || c1.join());
    let b = kernel.fork("Parent4B", move || c2.join());
    child.fork();
    a.join();
    b.join();
}

fn join_in_turn(kernel: &Kernel) {
    let a = kernel.new_thread(|| {});
    let b = kernel.new_thread(|| {});
    a.set_name("Child5A");
    b.set_name("Child5B");
    let (a2, b2) = (a.clone(), b.clone());
    let parent = kernel.fork("Parent5", move || {
        a2.join();
        b2.join();
    });
    a.fork();
    b.fork();
    parent.join();
    assert_eq!(a.status(), ThreadStatus::Finished);
    assert_eq!(b.status(), ThreadStatus::Finished);
}
