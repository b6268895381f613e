// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Why a kernel run ended early.
//!
//! Contract violations inside the kernel are assertions, not values of
//! this type. They become a `ThreadPanicked` once the machine has halted.

use std::any::Any;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("thread `{thread}` panicked: {message}")]
    ThreadPanicked { thread: String, message: String },

    #[error("deadlock: no thread can run and no alarm is pending (blocked: {})", blocked.join(", "))]
    Deadlock { blocked: Vec<String> },

    #[error("machine halted")]
    Halted,
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_lists_blocked_threads() {
        let err = KernelError::Deadlock {
            blocked: vec!["main (#0)".into(), "child (#2)".into()],
        };
        assert_eq!(
            err.to_string(),
            "deadlock: no thread can run and no alarm is pending (blocked: main (#0), child (#2))"
        );
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let a: Box<dyn Any + Send> = Box::new("boom");
        let b: Box<dyn Any + Send> = Box::new(String::from("bang"));
        let c: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*a), "boom");
        assert_eq!(panic_message(&*b), "bang");
        assert_eq!(panic_message(&*c), "unknown panic");
    }
}
