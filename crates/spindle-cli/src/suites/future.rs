// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! One-shot results.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use spindle_threads::{Future, Kernel};
use tracing::info;

use super::{Case, Expect};

pub const CASES: &[Case] = &[Case {
    name: "two-getters",
    about: "two threads block on one future; it runs once and both see the result",
    expect: Expect::Pass,
    run: two_getters,
}];

fn two_getters(kernel: &Kernel) {
    let runs = Arc::new(AtomicUsize::new(0));
    let (k, r) = (kernel.clone(), runs.clone());
    let future = Future::new(kernel, move || {
        r.fetch_add(1, Ordering::SeqCst);
        k.alarm().wait_until(4_000);
        100
    });
    let seen = Arc::new(Mutex::new(Vec::new()));
    let getters: Vec<_> = ["Thread 1", "Thread 2"]
        .into_iter()
        .map(|name| {
            let (k, f, seen) = (kernel.clone(), future.clone(), seen.clone());
            kernel.fork(name, move || {
                let t0 = k.time();
                let result = f.get();
                info!(target: "spindle::selftest", name, waited = k.time() - t0, result, "got result");
                seen.lock().unwrap().push(result);
            })
        })
        .collect();
    for g in &getters {
        g.join();
    }
    assert_eq!(*seen.lock().unwrap(), vec![100, 100]);
    assert_eq!(future.get(), 100);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
