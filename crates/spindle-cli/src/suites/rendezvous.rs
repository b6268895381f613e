// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tagged exchange.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use spindle_threads::{KThread, Kernel, Rendezvous};
use tracing::info;

use super::{Case, Expect};

pub const CASES: &[Case] = &[
    Case {
        name: "pair",
        about: "two threads on one tag swap values",
        expect: Expect::Pass,
        run: pair,
    },
    Case {
        name: "tags",
        about: "pairs on different tags stay apart",
        expect: Expect::Pass,
        run: tags,
    },
    Case {
        name: "multiple",
        about: "separate rendezvous objects do not share tags",
        expect: Expect::Pass,
        run: multiple,
    },
    Case {
        name: "crowded-tag",
        about: "four threads on one tag form two pairs",
        expect: Expect::Pass,
        run: crowded_tag,
    },
];

type Results = Arc<Mutex<BTreeMap<&'static str, i32>>>;

fn exchanger(
    kernel: &Kernel,
    rv: &Arc<Rendezvous<i32, i32>>,
    results: &Results,
    name: &'static str,
    tag: i32,
    value: i32,
) -> KThread {
    let (rv, results) = (rv.clone(), results.clone());
    kernel.fork(name, move || {
        let got = rv.exchange(tag, value);
        info!(target: "spindle::selftest", name, tag, value, got, "exchanged");
        results.lock().unwrap().insert(name, got);
    })
}

fn join_all(threads: &[KThread]) {
    for t in threads {
        t.join();
    }
}

fn pair(kernel: &Kernel) {
    let rv = Arc::new(Rendezvous::new(kernel));
    let results = Results::default();
    join_all(&[
        exchanger(kernel, &rv, &results, "Thread 1", 1, 4),
        exchanger(kernel, &rv, &results, "Thread 2", 1, 8),
    ]);
    let results = results.lock().unwrap();
    assert_eq!(results["Thread 1"], 8);
    assert_eq!(results["Thread 2"], 4);
}

fn tags(kernel: &Kernel) {
    let rv = Arc::new(Rendezvous::new(kernel));
    let results = Results::default();
    join_all(&[
        exchanger(kernel, &rv, &results, "1A", 1, 4),
        exchanger(kernel, &rv, &results, "2B", 2, 0),
        exchanger(kernel, &rv, &results, "1B", 1, 8),
        exchanger(kernel, &rv, &results, "2A", 2, 1),
    ]);
    let results = results.lock().unwrap();
    assert_eq!((results["1A"], results["1B"]), (8, 4));
    assert_eq!((results["2A"], results["2B"]), (0, 1));
}

fn multiple(kernel: &Kernel) {
    let r1 = Arc::new(Rendezvous::new(kernel));
    let r2 = Arc::new(Rendezvous::new(kernel));
    let results = Results::default();
    join_all(&[
        exchanger(kernel, &r1, &results, "1A", 1, 4),
        exchanger(kernel, &r2, &results, "3B", 1, 10),
        exchanger(kernel, &r2, &results, "3A", 1, 7),
        exchanger(kernel, &r1, &results, "2B", 2, 0),
        exchanger(kernel, &r1, &results, "1B", 1, 8),
        exchanger(kernel, &r1, &results, "2A", 2, 1),
    ]);
    let results = results.lock().unwrap();
    assert_eq!((results["1A"], results["1B"]), (8, 4));
    assert_eq!((results["2A"], results["2B"]), (0, 1));
    assert_eq!((results["3A"], results["3B"]), (10, 7));
}

fn crowded_tag(kernel: &Kernel) {
    let rv = Arc::new(Rendezvous::new(kernel));
    let results = Results::default();
    let values = [("4", 9), ("1", 4), ("3", 2), ("2", 8)];
    let threads: Vec<_> = values
        .iter()
        .map(|&(name, value)| exchanger(kernel, &rv, &results, name, 1, value))
        .collect();
    join_all(&threads);

    // Whoever paired up, every value went to exactly one partner.
    let results = results.lock().unwrap();
    let by_name: BTreeMap<_, _> = values.iter().copied().collect();
    for (name, got) in results.iter() {
        let partner = by_name
            .iter()
            .find(|&(_, &v)| v == *got)
            .map(|(&n, _)| n)
            .unwrap_or_else(|| panic!("{name} got a value nobody sent"));
        assert_eq!(results[partner], by_name[name], "{name} and {partner} did not swap");
    }
    assert_eq!(results.len(), 4);
}
