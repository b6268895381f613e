// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Ready-queue policy.
//!
//! The dispatcher and `Lock` only talk to a `ThreadQueue`; which thread
//! comes out next is the policy's business. `RoundRobinScheduler` is the
//! FIFO baseline every policy must at least match.

use std::collections::VecDeque;

use crate::thread::ThreadId;

/// A queue of threads waiting for some resource (the CPU, a lock).
///
/// Callers hold interrupts disabled around every method.
pub trait ThreadQueue: Send {
    /// `thread` is waiting for access and is not the current holder.
    fn wait_for_access(&mut self, thread: ThreadId);

    /// Remove and return the thread that should get access next.
    fn next_thread(&mut self) -> Option<ThreadId>;

    /// `thread` got access without waiting.
    fn acquire(&mut self, thread: ThreadId);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Factory for thread queues.
pub trait Scheduler: Send + Sync {
    /// `transfer_priority` asks the queue to donate priority to its holder.
    /// Policies without priorities ignore it.
    fn new_thread_queue(&self, transfer_priority: bool) -> Box<dyn ThreadQueue>;
}

/// First come, first served.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinScheduler;

impl Scheduler for RoundRobinScheduler {
    fn new_thread_queue(&self, _transfer_priority: bool) -> Box<dyn ThreadQueue> {
        Box::new(FifoQueue::default())
    }
}

#[derive(Debug, Default)]
struct FifoQueue {
    waiters: VecDeque<ThreadId>,
}

impl ThreadQueue for FifoQueue {
    fn wait_for_access(&mut self, thread: ThreadId) {
        debug_assert!(
            !self.waiters.contains(&thread),
            "{thread:?} queued twice"
        );
        self.waiters.push_back(thread);
    }

    fn next_thread(&mut self) -> Option<ThreadId> {
        self.waiters.pop_front()
    }

    fn acquire(&mut self, _thread: ThreadId) {
        assert!(
            self.waiters.is_empty(),
            "acquire without waiting while others are queued"
        );
    }

    fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = RoundRobinScheduler.new_thread_queue(false);
        for id in [3, 1, 2] {
            q.wait_for_access(ThreadId::from_raw(id));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.next_thread(), Some(ThreadId::from_raw(3)));
        assert_eq!(q.next_thread(), Some(ThreadId::from_raw(1)));
        assert_eq!(q.next_thread(), Some(ThreadId::from_raw(2)));
        assert_eq!(q.next_thread(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn acquire_on_empty_queue() {
        let mut q = RoundRobinScheduler.new_thread_queue(true);
        q.acquire(ThreadId::from_raw(0));
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "acquire without waiting")]
    fn acquire_past_waiters_is_rejected() {
        let mut q = RoundRobinScheduler.new_thread_queue(false);
        q.wait_for_access(ThreadId::from_raw(1));
        q.acquire(ThreadId::from_raw(2));
    }
}
