// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timed waits.

use std::sync::{Arc, Mutex};

use spindle_threads::Kernel;
use tracing::info;

use super::{Case, Expect};

pub const CASES: &[Case] = &[
    Case {
        name: "durations",
        about: "waits last at least as long as requested",
        expect: Expect::Pass,
        run: durations,
    },
    Case {
        name: "non-positive",
        about: "zero and negative waits return at once",
        expect: Expect::Pass,
        run: non_positive,
    },
    Case {
        name: "order",
        about: "sleepers wake in wake-time order, not fork order",
        expect: Expect::Pass,
        run: order,
    },
];

fn durations(kernel: &Kernel) {
    for ticks in [1_000i64, 10_000, 100_000] {
        let t0 = kernel.time();
        kernel.alarm().wait_until(ticks);
        let waited = kernel.time() - t0;
        info!(target: "spindle::selftest", ticks, waited, "waited");
        assert!(waited >= ticks as u64, "asked for {ticks} ticks, woke after {waited}");
    }
}

fn non_positive(kernel: &Kernel) {
    for ticks in [0i64, -10, -10, -10, i64::MIN] {
        let t0 = kernel.time();
        kernel.alarm().wait_until(ticks);
        assert_eq!(kernel.time(), t0, "wait_until({ticks}) let time pass");
    }
}

fn order(kernel: &Kernel) {
    const BASE: i64 = 50_000;
    let woken = Arc::new(Mutex::new(Vec::new()));
    let sleeper = |name: &'static str, ticks: i64| {
        let (k, woken) = (kernel.clone(), woken.clone());
        kernel.fork(name, move || {
            let t0 = k.time();
            k.alarm().wait_until(ticks);
            info!(target: "spindle::selftest", name, after = k.time() - t0, "woken");
            woken.lock().unwrap().push(name);
        })
    };
    let threads = [
        sleeper("second", BASE * 2),
        sleeper("fourth", BASE * 4),
        sleeper("third", BASE * 3),
        sleeper("first", BASE),
    ];
    kernel.alarm().wait_until(BASE * 8);
    for t in &threads {
        t.join();
    }
    assert_eq!(
        *woken.lock().unwrap(),
        vec!["first", "second", "third", "fourth"]
    );
}
