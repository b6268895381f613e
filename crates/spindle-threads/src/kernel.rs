// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel runtime handle.
//!
//! Everything a single-CPU kernel would keep in globals (current thread,
//! ready queue, the one alarm) lives behind `Kernel` instead. A kernel is
//! booted by `KernelBuilder::run`, which turns the calling OS thread into
//! kernel thread "main" and halts the machine when `main` returns.

use std::env;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spindle_machine::{Halted, Interrupt, Machine, MachineConfig};
use tracing::{debug, error, warn};

use crate::alarm::{Alarm, AlarmQueue};
use crate::error::{panic_message, KernelError};
use crate::sched::{RoundRobinScheduler, Scheduler};
use crate::thread::{KThread, SchedState};

/// Boot-time configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub machine: MachineConfig,
    /// Halt with `KernelError::Deadlock` instead of idling forever when no
    /// thread can ever become ready again.
    pub detect_deadlock: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            detect_deadlock: true,
        }
    }
}

impl KernelConfig {
    /// Defaults overridden by `SPINDLE_KERNEL_TICK`, `SPINDLE_TIMER_INTERVAL`
    /// and `SPINDLE_DETECT_DEADLOCK`. Malformed values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ticks) = env_u64("SPINDLE_KERNEL_TICK") {
            config.machine.kernel_tick = ticks;
        }
        if let Some(ticks) = env_u64("SPINDLE_TIMER_INTERVAL") {
            config.machine.timer_interval = ticks;
        }
        if let Ok(raw) = env::var("SPINDLE_DETECT_DEADLOCK") {
            match parse_flag(&raw) {
                Some(on) => config.detect_deadlock = on,
                None => warn!(target: "spindle::kernel", value = %raw, "ignoring malformed SPINDLE_DETECT_DEADLOCK"),
            }
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "spindle::kernel", key, value = %raw, "ignoring malformed setting");
            None
        }
    }
}

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// Per-switch hooks. Kernel threads need none; a user-process layer uses
/// them to save and load address-space state.
///
/// Both run with interrupts disabled and must not block.
pub trait SwitchHooks: Send + Sync {
    /// The outgoing thread is about to give up the CPU.
    fn save_state(&self, _thread: &KThread) {}

    /// The incoming thread is running again.
    fn restore_state(&self, _thread: &KThread) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl SwitchHooks for NoHooks {}

pub struct KernelBuilder {
    config: KernelConfig,
    scheduler: Arc<dyn Scheduler>,
    hooks: Arc<dyn SwitchHooks>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self {
            config: KernelConfig::default(),
            scheduler: Arc::new(RoundRobinScheduler),
            hooks: Arc::new(NoHooks),
        }
    }
}

impl KernelBuilder {
    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn kernel_tick(mut self, ticks: u64) -> Self {
        self.config.machine.kernel_tick = ticks;
        self
    }

    pub fn timer_interval(mut self, ticks: u64) -> Self {
        self.config.machine.timer_interval = ticks;
        self
    }

    pub fn detect_deadlock(mut self, on: bool) -> Self {
        self.config.detect_deadlock = on;
        self
    }

    pub fn scheduler<S: Scheduler + 'static>(mut self, scheduler: S) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn hooks<H: SwitchHooks + 'static>(mut self, hooks: H) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Boot a kernel, run `main` as its first thread, then halt.
    ///
    /// Any thread still alive when `main` returns is torn down. A panic in
    /// any kernel thread, or a detected deadlock, halts the machine early.
    pub fn run<R, F>(self, main: F) -> Result<R, KernelError>
    where
        F: FnOnce(&Kernel) -> R,
    {
        let kernel = Kernel::boot(self);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| main(&kernel)));
        let halted = kernel.shutdown();
        match outcome {
            Ok(value) => match halted {
                Some(err) => Err(err),
                None => Ok(value),
            },
            Err(payload) if payload.is::<Halted>() => Err(halted.unwrap_or(KernelError::Halted)),
            Err(payload) => Err(halted.unwrap_or_else(|| KernelError::ThreadPanicked {
                thread: "main (#0)".to_string(),
                message: panic_message(&*payload),
            })),
        }
    }
}

/// Handle to a running kernel. Cheap to clone; threads capture clones.
#[derive(Clone)]
pub struct Kernel {
    pub(crate) inner: Arc<KernelInner>,
}

pub(crate) struct KernelInner {
    pub(crate) machine: Machine,
    pub(crate) config: KernelConfig,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) hooks: Arc<dyn SwitchHooks>,
    pub(crate) state: Mutex<SchedState>,
    pub(crate) alarm: AlarmQueue,
}

impl Kernel {
    pub fn builder() -> KernelBuilder {
        KernelBuilder::default()
    }

    fn boot(builder: KernelBuilder) -> Self {
        let KernelBuilder {
            config,
            scheduler,
            hooks,
        } = builder;
        let machine = Machine::new(config.machine);
        let ready_queue = scheduler.new_thread_queue(false);
        let kernel = Kernel {
            inner: Arc::new(KernelInner {
                machine,
                config,
                scheduler,
                hooks,
                state: Mutex::new(SchedState::boot(ready_queue)),
                alarm: AlarmQueue::default(),
            }),
        };
        debug!(target: "spindle::kernel", ?config, "booting");

        kernel.create_idle_thread();

        let weak = Arc::downgrade(&kernel.inner);
        kernel
            .inner
            .machine
            .timer()
            .set_interrupt_handler(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Kernel { inner }.alarm().timer_interrupt();
                }
            }));

        kernel.interrupt().enable();
        kernel
    }

    // Never held across a context switch. Poisoning only means a
    // contract assertion fired while the table was borrowed; the machine
    // is halting anyway and shutdown still needs the table.
    pub(crate) fn state(&self) -> MutexGuard<'_, SchedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    /// The atomicity primitive.
    pub fn interrupt(&self) -> &Interrupt {
        self.inner.machine.interrupt()
    }

    /// Current simulated time in ticks.
    pub fn time(&self) -> u64 {
        self.inner.machine.timer().time()
    }

    /// The kernel's one alarm.
    pub fn alarm(&self) -> Alarm<'_> {
        Alarm::new(self)
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.inner.scheduler
    }

    pub(crate) fn hooks(&self) -> &dyn SwitchHooks {
        &*self.inner.hooks
    }

    /// Stop the machine: record `reason`, tear down every other context,
    /// then unwind the caller. `run` reports `reason`.
    pub(crate) fn halt(&self, reason: KernelError) -> ! {
        let contexts = {
            let mut st = self.state();
            if st.halted.is_none() {
                error!(target: "spindle::kernel", %reason, "halting");
                st.halted = Some(reason);
            }
            st.contexts()
        };
        for tcb in contexts.iter().filter(|tcb| !tcb.is_current()) {
            tcb.halt();
        }
        panic::resume_unwind(Box::new(Halted));
    }

    fn shutdown(&self) -> Option<KernelError> {
        let (contexts, halted) = {
            let mut st = self.state();
            (st.take_contexts(), st.halted.clone())
        };
        debug!(target: "spindle::kernel", contexts = contexts.len(), "shutting down");
        for tcb in contexts.iter().filter(|tcb| !tcb.is_current()) {
            tcb.halt();
        }
        for tcb in &contexts {
            tcb.join();
        }
        halted
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.inner.config)
            .field("time", &self.time())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn run_returns_main_result() {
        let out = Kernel::builder().run(|kernel| {
            assert_eq!(kernel.current_thread().name(), "main");
            41 + 1
        });
        assert_eq!(out, Ok(42));
    }

    #[test]
    fn main_panic_is_reported() {
        let out = Kernel::builder().run(|_| -> () { panic!("kaboom") });
        match out {
            Err(KernelError::ThreadPanicked { thread, message }) => {
                assert_eq!(thread, "main (#0)");
                assert_eq!(message, "kaboom");
            }
            other => panic!("expected ThreadPanicked, got {:?}", other),
        }
    }

    #[test]
    fn builder_overrides_config() {
        let config = Kernel::builder()
            .kernel_tick(3)
            .timer_interval(77)
            .detect_deadlock(false)
            .run(|kernel| *kernel.config())
            .unwrap();
        assert_eq!(config.machine.kernel_tick, 3);
        assert_eq!(config.machine.timer_interval, 77);
        assert!(!config.detect_deadlock);
    }

    #[test]
    fn flag_parsing() {
        assert_eq!(parse_flag("on"), Some(true));
        assert_eq!(parse_flag(" FALSE "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn time_advances_while_running() {
        let (before, after) = Kernel::builder()
            .run(|kernel| {
                let before = kernel.time();
                for _ in 0..5 {
                    kernel.yield_now();
                }
                (before, kernel.time())
            })
            .unwrap();
        assert!(after >= before + 50);
    }

    struct CountingHooks {
        saves: Arc<AtomicUsize>,
        restores: Arc<AtomicUsize>,
    }

    impl SwitchHooks for CountingHooks {
        fn save_state(&self, _thread: &KThread) {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }

        fn restore_state(&self, _thread: &KThread) {
            self.restores.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hooks_run_on_every_switch() {
        let saves = Arc::new(AtomicUsize::new(0));
        let restores = Arc::new(AtomicUsize::new(0));
        Kernel::builder()
            .hooks(CountingHooks {
                saves: saves.clone(),
                restores: restores.clone(),
            })
            .run(|kernel| {
                let child = kernel.fork("child", || {});
                child.join();
            })
            .unwrap();
        assert!(saves.load(Ordering::SeqCst) >= 2);
        assert!(restores.load(Ordering::SeqCst) >= 2);
    }
}
