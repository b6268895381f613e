// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Simulated single-CPU machine for the spindle kernel.
//!
//! The kernel never touches host locks or threads directly. It consumes
//! three devices from here:
//! - `interrupt`: the atomicity primitive, plus the tick clock it drives
//! - `timer`    : periodic interrupt source
//! - `tcb`      : execution contexts (one OS thread each, baton-serialized)

pub mod interrupt;
pub mod tcb;
pub mod timer;

use std::sync::Arc;

pub use interrupt::{Handler, Interrupt};
pub use tcb::{Halted, Tcb};
pub use timer::Timer;

/// Ticks added to the clock each time interrupts are re-enabled.
pub const DEFAULT_KERNEL_TICK: u64 = 10;

/// Ticks between two timer interrupts.
pub const DEFAULT_TIMER_INTERVAL: u64 = 500;

/// Machine parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Clock advance per interrupt enable.
    pub kernel_tick: u64,
    /// Period of the timer device.
    pub timer_interval: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            kernel_tick: DEFAULT_KERNEL_TICK,
            timer_interval: DEFAULT_TIMER_INTERVAL,
        }
    }
}

/// The simulated hardware: interrupt controller and timer.
pub struct Machine {
    config: MachineConfig,
    interrupt: Arc<Interrupt>,
    timer: Arc<Timer>,
}

impl Machine {
    /// Power on. Interrupts start disabled; nothing ticks until the
    /// kernel enables them.
    pub fn new(config: MachineConfig) -> Self {
        let interrupt = Arc::new(Interrupt::new(config.kernel_tick.max(1)));
        let timer = Timer::new(interrupt.clone(), config.timer_interval.max(1));
        Self {
            config,
            interrupt,
            timer,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn interrupt(&self) -> &Arc<Interrupt> {
        &self.interrupt
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn powers_on_with_interrupts_disabled() {
        let machine = Machine::new(MachineConfig::default());
        assert!(machine.interrupt().disabled());
        assert_eq!(machine.timer().time(), 0);
    }

    #[test]
    fn zero_config_values_are_clamped() {
        let machine = Machine::new(MachineConfig {
            kernel_tick: 0,
            timer_interval: 0,
        });
        machine.interrupt().enable();
        assert_eq!(machine.interrupt().time(), 1);
    }
}
