// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Periodic timer device.
//!
//! Fires every `interval` ticks once a handler is installed. The next
//! interrupt is armed before the handler runs, because the handler is
//! allowed to context-switch and may not return for a while.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::interrupt::{Handler, Interrupt};

pub struct Timer {
    interrupt: Arc<Interrupt>,
    interval: u64,
    handler: Mutex<Option<Handler>>,
    armed: AtomicBool,
}

impl Timer {
    pub fn new(interrupt: Arc<Interrupt>, interval: u64) -> Arc<Self> {
        Arc::new(Self {
            interrupt,
            interval,
            handler: Mutex::new(None),
            armed: AtomicBool::new(false),
        })
    }

    /// Install the periodic callback. Replacing an existing handler keeps
    /// the current period running.
    pub fn set_interrupt_handler(self: &Arc<Self>, handler: Handler) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        if !self.armed.swap(true, Ordering::AcqRel) {
            self.schedule_interrupt();
        }
    }

    /// Monotonic tick counter.
    pub fn time(&self) -> u64 {
        self.interrupt.time()
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    fn schedule_interrupt(self: &Arc<Self>) {
        let timer = Arc::downgrade(self);
        self.interrupt.schedule(
            self.interval,
            "timer",
            Arc::new(move || {
                if let Some(timer) = timer.upgrade() {
                    timer.timer_interrupt();
                }
            }),
        );
    }

    fn timer_interrupt(self: &Arc<Self>) {
        self.schedule_interrupt();
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_every_interval() {
        let int = Arc::new(Interrupt::new(100));
        let timer = Timer::new(int.clone(), 500);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        timer.set_interrupt_handler(Arc::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..20 {
            int.enable();
            int.disable();
        }
        // 20 enables * 100 ticks = 2000 ticks = 4 periods
        assert_eq!(timer.time(), 2_000);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert_eq!(int.pending(), 1);
    }

    #[test]
    fn reinstalling_handler_does_not_double_arm() {
        let int = Arc::new(Interrupt::new(10));
        let timer = Timer::new(int.clone(), 500);
        timer.set_interrupt_handler(Arc::new(|| {}));
        timer.set_interrupt_handler(Arc::new(|| {}));
        assert_eq!(int.pending(), 1);
    }
}
