// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Interrupt controller: the machine's one atomicity primitive.
//!
//! On a single CPU, a sequence that runs with interrupts disabled cannot
//! be preempted. Simulated time advances only when interrupts go from
//! disabled to enabled, and that is also the only place a pending
//! interrupt can fire.
//!
//! Every context switch happens with interrupts disabled, so a resumed
//! context always observes "disabled" and restores whatever status it
//! saved before switching.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

/// Interrupt service routine. May context-switch.
pub type Handler = Arc<dyn Fn() + Send + Sync>;

struct PendingInterrupt {
    kind: &'static str,
    handler: Handler,
}

struct InterruptState {
    enabled: bool,
    total_ticks: u64,
    next_seq: u64,
    /// Keyed by (due tick, scheduling order).
    pending: BTreeMap<(u64, u64), PendingInterrupt>,
}

pub struct Interrupt {
    kernel_tick: u64,
    state: Mutex<InterruptState>,
}

impl Interrupt {
    pub fn new(kernel_tick: u64) -> Self {
        Self {
            kernel_tick,
            state: Mutex::new(InterruptState {
                enabled: false,
                total_ticks: 0,
                next_seq: 0,
                pending: BTreeMap::new(),
            }),
        }
    }

    // The guard is never held across a handler or a context switch, so a
    // poisoned lock only means some thread panicked mid-update of plain data.
    fn state(&self) -> MutexGuard<'_, InterruptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enable interrupts, advancing the clock and firing anything due.
    pub fn enable(&self) {
        self.set_status(true);
    }

    /// Disable interrupts. Returns the previous status for `restore`.
    pub fn disable(&self) -> bool {
        self.set_status(false)
    }

    /// Restore a status previously returned by `disable`.
    pub fn restore(&self, status: bool) {
        self.set_status(status);
    }

    /// Set the interrupt status and return the old one. Going from
    /// disabled to enabled ticks the clock.
    pub fn set_status(&self, status: bool) -> bool {
        let old = {
            let mut st = self.state();
            let old = st.enabled;
            st.enabled = status;
            old
        };
        if !old && status {
            self.tick();
        }
        old
    }

    pub fn enabled(&self) -> bool {
        self.state().enabled
    }

    pub fn disabled(&self) -> bool {
        !self.enabled()
    }

    /// Current simulated time in ticks.
    pub fn time(&self) -> u64 {
        self.state().total_ticks
    }

    /// Number of interrupts waiting to fire.
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Arrange for `handler` to run `delay` ticks from now.
    pub fn schedule(&self, delay: u64, kind: &'static str, handler: Handler) {
        let mut st = self.state();
        let when = st.total_ticks.saturating_add(delay);
        let seq = st.next_seq;
        st.next_seq += 1;
        trace!(target: "spindle::machine", kind, when, "scheduling interrupt");
        st.pending.insert((when, seq), PendingInterrupt { kind, handler });
    }

    /// Fast-forward an idle CPU to the next pending interrupt. The clock
    /// never moves backwards. Call with interrupts disabled; the interrupt
    /// fires on the next enable.
    pub fn idle(&self) {
        let mut st = self.state();
        debug_assert!(!st.enabled, "idle() requires interrupts disabled");
        if let Some((&(when, _), _)) = st.pending.first_key_value() {
            let target = when.saturating_sub(self.kernel_tick);
            if target > st.total_ticks {
                trace!(target: "spindle::machine", from = st.total_ticks, to = target, "idle advance");
                st.total_ticks = target;
            }
        }
    }

    fn tick(&self) {
        let now = {
            let mut st = self.state();
            st.total_ticks += self.kernel_tick;
            st.total_ticks
        };
        self.check_if_due(now);
    }

    fn check_if_due(&self, now: u64) {
        let mut fired = false;
        loop {
            let next = {
                let mut st = self.state();
                match st.pending.first_key_value() {
                    Some((&(when, _), _)) if when <= now => {
                        // Handlers run with interrupts disabled.
                        st.enabled = false;
                        st.pending.pop_first().map(|(_, p)| p)
                    }
                    _ => None,
                }
            };
            let Some(interrupt) = next else { break };
            fired = true;
            trace!(target: "spindle::machine", kind = interrupt.kind, now, "invoking interrupt handler");
            (interrupt.handler)();
        }
        if fired {
            self.state().enabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn disable_returns_previous_status() {
        let int = Interrupt::new(10);
        assert!(!int.disable());
        int.enable();
        assert!(int.disable());
        assert!(int.disabled());
        int.restore(true);
        assert!(int.enabled());
    }

    #[test]
    fn clock_moves_only_on_enable() {
        let int = Interrupt::new(10);
        assert_eq!(int.time(), 0);
        int.enable();
        assert_eq!(int.time(), 10);
        // already enabled: no tick
        int.restore(true);
        assert_eq!(int.time(), 10);
        let old = int.disable();
        int.restore(old);
        assert_eq!(int.time(), 20);
    }

    #[test]
    fn due_interrupts_fire_in_order_with_interrupts_disabled() {
        let int = Arc::new(Interrupt::new(10));
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(20, "b"), (5, "a"), (20, "c"), (1000, "late")] {
            let order = order.clone();
            let weak = Arc::downgrade(&int);
            int.schedule(
                delay,
                "test",
                Arc::new(move || {
                    let int = weak.upgrade().expect("controller alive");
                    assert!(int.disabled());
                    order.lock().unwrap().push(tag);
                }),
            );
        }
        int.enable(); // t = 10
        assert_eq!(*order.lock().unwrap(), vec!["a"]);
        int.disable();
        int.enable(); // t = 20
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(int.enabled());
        assert_eq!(int.pending(), 1);
    }

    #[test]
    fn idle_jumps_to_next_interrupt() {
        let int = Interrupt::new(10);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        int.schedule(
            5_000,
            "test",
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        int.idle();
        assert_eq!(int.time(), 4_990);
        int.enable();
        assert_eq!(int.time(), 5_000);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn idle_without_pending_keeps_time() {
        let int = Interrupt::new(10);
        int.idle();
        assert_eq!(int.time(), 0);
    }
}
