// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel self-test scenarios.
//!
//! Each case boots a fresh kernel and runs as its boot thread. Checks are
//! plain assertions; a failed one halts the kernel and the runner reports
//! the panic.

mod alarm;
mod condition;
mod future;
mod rendezvous;
mod threads;

use spindle_threads::Kernel;

/// What a case should end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    Pass,
    /// A contract assertion whose message contains this text.
    Panic(&'static str),
}

pub struct Case {
    pub name: &'static str,
    pub about: &'static str,
    pub expect: Expect,
    pub run: fn(&Kernel),
}

pub struct Suite {
    pub name: &'static str,
    pub cases: &'static [Case],
}

pub static SUITES: &[Suite] = &[
    Suite {
        name: "threads",
        cases: threads::CASES,
    },
    Suite {
        name: "alarm",
        cases: alarm::CASES,
    },
    Suite {
        name: "condition",
        cases: condition::CASES,
    },
    Suite {
        name: "rendezvous",
        cases: rendezvous::CASES,
    },
    Suite {
        name: "future",
        cases: future::CASES,
    },
];

pub fn find(name: &str) -> Option<&'static Suite> {
    SUITES.iter().find(|s| s.name == name)
}
