// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! spindle kernel threads.
//!
//! A cooperative thread scheduler and the synchronization primitives built
//! on it. Nothing here uses a host lock for mutual exclusion between
//! kernel threads; every primitive is built from the machine's single
//! atomicity primitive (disabling interrupts) plus the dispatcher.
//!
//! `Kernel` is the runtime handle. Boot one with `Kernel::builder().run(..)`;
//! the closure runs as the first kernel thread and everything else is
//! forked from there.

pub mod alarm;
pub mod condition;
pub mod error;
pub mod future;
pub mod kernel;
pub mod lock;
pub mod rendezvous;
pub mod sched;
pub mod thread;

pub use alarm::Alarm;
pub use condition::Condition;
pub use error::KernelError;
pub use future::Future;
pub use kernel::{Kernel, KernelBuilder, KernelConfig, NoHooks, SwitchHooks};
pub use lock::Lock;
pub use rendezvous::Rendezvous;
pub use sched::{RoundRobinScheduler, Scheduler, ThreadQueue};
pub use thread::{KThread, ThreadId, ThreadStatus};

pub use spindle_machine::MachineConfig;
