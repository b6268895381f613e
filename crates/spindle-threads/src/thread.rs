// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel threads and the dispatcher.
//!
//! ```text
//! New --fork--> Ready --dispatch--> Running --yield--> Ready
//!                                   Running --sleep--> Blocked --ready--> Ready
//!                                   Running --finish-> Finished
//! ```
//!
//! `Kernel::sleep` is the only way into Blocked. The caller must already be
//! registered wherever its waker will look for it, and interrupts must stay
//! disabled from that registration through the switch. Otherwise the waker
//! can run in between and the wakeup is lost.
//!
//! A finished thread cannot tear down the stack it is still running on.
//! It marks itself `to_be_destroyed`; the next thread to run destroys it
//! and drops its record. Handles outlive the record through a tombstone
//! holding the name and join flag.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use spindle_machine::{Halted, Tcb};
use tracing::{debug, error};

use crate::error::{panic_message, KernelError};
use crate::kernel::Kernel;
use crate::sched::ThreadQueue;

/// Unique, monotonically increasing thread id. Orders threads
/// deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u32);

impl ThreadId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadStatus {
    /// Created, not yet forked.
    New,
    /// In the ready queue (or the idle thread, which never is).
    Ready,
    /// Holds the CPU. Exactly one thread at a time.
    Running,
    /// Waiting for some other thread to ready it.
    Blocked,
    /// Terminal.
    Finished,
}

impl ThreadStatus {
    /// Legal edges of the lifecycle.
    pub fn can_transition_to(self, next: ThreadStatus) -> bool {
        use ThreadStatus::*;
        matches!(
            (self, next),
            (New, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Running, Blocked)
                | (Running, Finished)
                | (Blocked, Ready)
        )
    }
}

pub(crate) type Target = Box<dyn FnOnce() + Send + 'static>;

/// What handles still know about a thread once its record is dropped.
#[derive(Default)]
struct Tombstone {
    name: String,
    joined: bool,
}

type SharedTombstone = Arc<Mutex<Tombstone>>;

fn bury(tombstone: &SharedTombstone) -> MutexGuard<'_, Tombstone> {
    tombstone.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct ThreadRecord {
    name: String,
    status: ThreadStatus,
    target: Option<Target>,
    /// Created at fork, taken when the context is destroyed.
    tcb: Option<Tcb>,
    /// Extension slot for scheduling policies.
    scheduling_state: Option<Box<dyn Any + Send>>,
    joined: bool,
    joiner: Option<ThreadId>,
    /// Filled in when the record is reclaimed.
    tombstone: SharedTombstone,
}

impl ThreadRecord {
    fn new(name: &str, status: ThreadStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            target: None,
            tcb: None,
            scheduling_state: None,
            joined: false,
            joiner: None,
            tombstone: SharedTombstone::default(),
        }
    }
}

/// Dispatcher bookkeeping, one per kernel.
pub(crate) struct SchedState {
    threads: BTreeMap<ThreadId, ThreadRecord>,
    current: ThreadId,
    main: ThreadId,
    idle: Option<ThreadId>,
    to_be_destroyed: Option<ThreadId>,
    ready_queue: Box<dyn ThreadQueue>,
    next_id: u32,
    /// Destroyed contexts whose OS threads still need joining.
    graveyard: Vec<Tcb>,
    pub(crate) halted: Option<KernelError>,
}

impl SchedState {
    /// The calling OS thread becomes thread "main", already running.
    pub(crate) fn boot(mut ready_queue: Box<dyn ThreadQueue>) -> Self {
        let main = ThreadId(0);
        ready_queue.acquire(main);
        let mut record = ThreadRecord::new("main", ThreadStatus::Running);
        record.tcb = Some(Tcb::adopt_current("main"));
        let mut threads = BTreeMap::new();
        threads.insert(main, record);
        Self {
            threads,
            current: main,
            main,
            idle: None,
            to_be_destroyed: None,
            ready_queue,
            next_id: 1,
            graveyard: Vec::new(),
            halted: None,
        }
    }

    fn record(&self, id: ThreadId) -> &ThreadRecord {
        self.threads
            .get(&id)
            .unwrap_or_else(|| panic!("unknown thread {id}"))
    }

    fn record_mut(&mut self, id: ThreadId) -> &mut ThreadRecord {
        self.threads
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown thread {id}"))
    }

    fn label(&self, id: ThreadId) -> String {
        match self.threads.get(&id) {
            Some(record) => format!("{} ({})", record.name, id),
            None => format!("finished thread ({id})"),
        }
    }

    /// Drop a finished thread's record, leaving its handles the tombstone.
    /// Returns the context still to be destroyed.
    fn reclaim(&mut self, id: ThreadId) -> Option<Tcb> {
        let ThreadRecord {
            name,
            status,
            joined,
            tcb,
            tombstone,
            ..
        } = self.threads.remove(&id)?;
        debug_assert_eq!(status, ThreadStatus::Finished);
        *bury(&tombstone) = Tombstone { name, joined };
        tcb
    }

    fn transition(&mut self, id: ThreadId, next: ThreadStatus) {
        let label = self.label(id);
        let record = self.record_mut(id);
        assert!(
            record.status.can_transition_to(next),
            "illegal transition for {label}: {:?} -> {:?}",
            record.status,
            next
        );
        record.status = next;
    }

    fn blocked(&self) -> Vec<String> {
        self.threads
            .iter()
            .filter(|(_, r)| r.status == ThreadStatus::Blocked)
            .map(|(&id, _)| self.label(id))
            .collect()
    }

    pub(crate) fn ready_queue_is_empty(&self) -> bool {
        self.ready_queue.is_empty()
    }

    /// Every context that may still own an OS thread.
    pub(crate) fn contexts(&self) -> Vec<Tcb> {
        self.threads
            .values()
            .filter_map(|r| r.tcb.clone())
            .chain(self.graveyard.iter().cloned())
            .collect()
    }

    /// Take every context for teardown and drop unstarted targets, which
    /// may hold kernel handles.
    pub(crate) fn take_contexts(&mut self) -> Vec<Tcb> {
        let mut contexts: Vec<Tcb> = self.graveyard.drain(..).collect();
        for record in self.threads.values_mut() {
            record.target = None;
            contexts.extend(record.tcb.take());
        }
        contexts
    }
}

/// Handle to a kernel thread.
#[derive(Clone)]
pub struct KThread {
    kernel: Kernel,
    id: ThreadId,
    tombstone: SharedTombstone,
}

impl KThread {
    /// Handle to a thread whose record is still in the table.
    pub(crate) fn new(kernel: Kernel, id: ThreadId) -> Self {
        let tombstone = kernel.state().record(id).tombstone.clone();
        Self {
            kernel,
            id,
            tombstone,
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Debug name.
    pub fn name(&self) -> String {
        match self.kernel.state().threads.get(&self.id) {
            Some(record) => record.name.clone(),
            None => bury(&self.tombstone).name.clone(),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) -> &Self {
        let name = name.into();
        match self.kernel.state().threads.get_mut(&self.id) {
            Some(record) => record.name = name,
            None => bury(&self.tombstone).name = name,
        }
        self
    }

    pub fn status(&self) -> ThreadStatus {
        match self.kernel.state().threads.get(&self.id) {
            Some(record) => record.status,
            None => ThreadStatus::Finished,
        }
    }

    pub fn is_joined(&self) -> bool {
        match self.kernel.state().threads.get(&self.id) {
            Some(record) => record.joined,
            None => bury(&self.tombstone).joined,
        }
    }

    /// Start the thread. Returns without waiting for it to run.
    pub fn fork(&self) {
        self.kernel.fork_thread(self);
    }

    /// Wait for the thread to finish. Returns at once if it already has.
    /// A thread can be joined once, and never by itself.
    pub fn join(&self) {
        self.kernel.join_thread(self);
    }

    /// Move to Ready and enqueue. Interrupts must be disabled.
    pub fn ready(&self) {
        self.kernel.ready_thread(self.id);
    }

    /// Ignored once the thread has finished and been reclaimed.
    pub fn set_scheduling_state<T: Any + Send>(&self, state: T) {
        if let Some(record) = self.kernel.state().threads.get_mut(&self.id) {
            record.scheduling_state = Some(Box::new(state));
        }
    }

    pub fn scheduling_state<T: Any + Clone>(&self) -> Option<T> {
        self.kernel
            .state()
            .threads
            .get(&self.id)
            .and_then(|record| record.scheduling_state.as_ref())
            .and_then(|s| s.downcast_ref::<T>())
            .cloned()
    }
}

impl PartialEq for KThread {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for KThread {}

impl PartialOrd for KThread {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KThread {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for KThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.id)
    }
}

impl fmt::Debug for KThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KThread")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Kernel {
    pub(crate) fn current_id(&self) -> ThreadId {
        self.state().current
    }

    pub(crate) fn label(&self, id: ThreadId) -> String {
        self.state().label(id)
    }

    pub(crate) fn thread_status(&self, id: ThreadId) -> ThreadStatus {
        self.state().record(id).status
    }

    pub fn current_thread(&self) -> KThread {
        KThread::new(self.clone(), self.current_id())
    }

    /// A new, unforked thread that will run `target`.
    pub fn new_thread<F>(&self, target: F) -> KThread
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.state();
        let id = ThreadId(st.next_id);
        st.next_id += 1;
        let mut record = ThreadRecord::new("(unnamed thread)", ThreadStatus::New);
        record.target = Some(Box::new(target));
        let tombstone = record.tombstone.clone();
        st.threads.insert(id, record);
        drop(st);
        KThread {
            kernel: self.clone(),
            id,
            tombstone,
        }
    }

    /// Create, name and fork a thread.
    pub fn fork<F>(&self, name: &str, target: F) -> KThread
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = self.new_thread(target);
        thread.set_name(name);
        thread.fork();
        thread
    }

    pub(crate) fn create_idle_thread(&self) {
        let kernel = self.clone();
        let idle = self.new_thread(move || loop {
            let int = kernel.interrupt().disable();
            if kernel.state().ready_queue_is_empty() {
                kernel.interrupt().idle();
            }
            kernel.interrupt().restore(int);
            kernel.yield_now();
        });
        idle.set_name("idle");
        self.state().idle = Some(idle.id());
        idle.fork();
    }

    fn fork_thread(&self, thread: &KThread) {
        let id = thread.id;
        let label = thread.to_string();
        let target = {
            let mut st = self.state();
            let Some(record) = st.threads.get_mut(&id) else {
                panic!("{label} has already been forked");
            };
            assert_eq!(
                record.status,
                ThreadStatus::New,
                "{label} has already been forked"
            );
            record.target.take()
        };
        let Some(target) = target else {
            panic!("{label} has nothing to run");
        };
        debug!(target: "spindle::thread", thread = %label, "forking");

        let int = self.interrupt().disable();
        let name = self.state().record(id).name.clone();
        let tcb = Tcb::new(&name);
        let kernel = self.clone();
        if let Err(err) = tcb.start(move || {
            kernel.run_thread(id, target);
        }) {
            panic!("cannot start {label}: {err}");
        }
        self.state().record_mut(id).tcb = Some(tcb);
        self.ready_thread(id);
        self.interrupt().restore(int);
    }

    /// Body of every forked context.
    fn run_thread(&self, id: ThreadId, target: Target) -> ! {
        self.begin();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(target)) {
            if payload.is::<Halted>() {
                panic::resume_unwind(payload);
            }
            let thread = self.label(id);
            let message = panic_message(&*payload);
            error!(target: "spindle::thread", %thread, %message, "thread panicked");
            self.halt(KernelError::ThreadPanicked { thread, message });
        }
        self.finish()
    }

    fn begin(&self) {
        debug!(target: "spindle::thread", thread = %self.label(self.current_id()), "beginning");
        self.restore_state();
        self.interrupt().enable();
    }

    /// Give up the CPU, staying ready. Returns when dispatched again,
    /// which may be immediately if nothing else is ready.
    pub fn yield_now(&self) {
        let current = self.current_id();
        debug!(target: "spindle::thread", thread = %self.label(current), "yielding");
        assert_eq!(
            self.thread_status(current),
            ThreadStatus::Running,
            "yield from a thread that is not running"
        );

        let int = self.interrupt().disable();
        self.ready_thread(current);
        self.run_next_thread();
        self.interrupt().restore(int);
    }

    /// Block the current thread until someone readies it.
    ///
    /// Interrupts must be disabled, and the caller must already be queued
    /// wherever its waker looks.
    pub fn sleep(&self) {
        assert!(
            self.interrupt().disabled(),
            "sleep requires interrupts disabled"
        );
        {
            let mut st = self.state();
            let current = st.current;
            debug!(target: "spindle::thread", thread = %st.label(current), "sleeping");
            assert_ne!(Some(current), st.idle, "the idle thread never blocks");
            if st.record(current).status != ThreadStatus::Finished {
                st.transition(current, ThreadStatus::Blocked);
            }
        }
        self.run_next_thread();
    }

    /// Terminate the current thread. Readies its joiner, if any.
    ///
    /// Called automatically when a thread's target returns. The boot
    /// thread cannot finish; it ends the machine by returning instead.
    pub fn finish(&self) -> ! {
        self.interrupt().disable();
        let (current, joiner) = {
            let mut st = self.state();
            let current = st.current;
            debug!(target: "spindle::thread", thread = %st.label(current), "finishing");
            assert_ne!(
                current, st.main,
                "the boot thread cannot finish; return from the boot closure instead"
            );
            assert_ne!(Some(current), st.idle, "the idle thread never finishes");
            assert!(
                st.to_be_destroyed.is_none(),
                "a finished thread is still awaiting destruction"
            );
            st.to_be_destroyed = Some(current);
            (current, st.record(current).joiner)
        };
        if let Some(joiner) = joiner {
            self.ready_thread(joiner);
        }
        self.state().transition(current, ThreadStatus::Finished);
        self.sleep();
        unreachable!("finished thread was dispatched again");
    }

    pub(crate) fn ready_thread(&self, id: ThreadId) {
        assert!(
            self.interrupt().disabled(),
            "ready requires interrupts disabled"
        );
        let mut st = self.state();
        let label = st.label(id);
        debug!(target: "spindle::thread", thread = %label, "ready");
        assert_ne!(
            st.record(id).status,
            ThreadStatus::Ready,
            "{label} is already ready"
        );
        st.transition(id, ThreadStatus::Ready);
        if Some(id) != st.idle {
            st.ready_queue.wait_for_access(id);
        }
    }

    fn join_thread(&self, thread: &KThread) {
        let target = thread.id;
        let current = self.current_id();
        let label = thread.to_string();
        debug!(target: "spindle::thread", thread = %label, "joining");
        assert_ne!(target, current, "{label} cannot join itself");

        let int = self.interrupt().disable();
        let finished = {
            let mut st = self.state();
            match st.threads.get_mut(&target) {
                Some(record) => {
                    assert!(!record.joined, "{label} has already been joined");
                    record.joined = true;
                    let finished = record.status == ThreadStatus::Finished;
                    if !finished {
                        record.joiner = Some(current);
                    }
                    finished
                }
                None => {
                    let mut remains = bury(&thread.tombstone);
                    assert!(!remains.joined, "{label} has already been joined");
                    remains.joined = true;
                    true
                }
            }
        };
        if !finished {
            self.sleep();
        }
        self.interrupt().restore(int);
    }

    fn run_next_thread(&self) {
        let next = self.state().ready_queue.next_thread();
        let next = match next {
            Some(next) => next,
            None => self.idle_thread(),
        };
        self.dispatch(next);
    }

    // Falling back to idle with no alarm pending means nothing can ever
    // ready a thread again.
    fn idle_thread(&self) -> ThreadId {
        if self.config().detect_deadlock && self.inner.alarm.is_empty() {
            let blocked = self.state().blocked();
            self.halt(KernelError::Deadlock { blocked });
        }
        self.state()
            .idle
            .unwrap_or_else(|| panic!("no idle thread to dispatch"))
    }

    /// Switch the CPU to `next`. Returns when the caller is dispatched again.
    fn dispatch(&self, next: ThreadId) {
        assert!(
            self.interrupt().disabled(),
            "dispatch requires interrupts disabled"
        );
        let previous = self.current_id();
        self.hooks().save_state(&KThread::new(self.clone(), previous));

        let (from, to) = {
            let mut st = self.state();
            debug!(
                target: "spindle::thread",
                from = %st.label(previous),
                to = %st.label(next),
                "switching"
            );
            st.current = next;
            (
                st.record(previous).tcb.clone(),
                st.record(next).tcb.clone(),
            )
        };
        let (Some(from), Some(to)) = (from, to) else {
            panic!("dispatch between threads without execution contexts");
        };
        from.switch_to(&to);
        self.restore_state();
    }

    /// Runs on the incoming thread: mark it running and reclaim the
    /// context of a thread that finished on the way out.
    fn restore_state(&self) {
        assert!(self.interrupt().disabled());
        let (current, doomed) = {
            let mut st = self.state();
            let current = st.current;
            debug!(target: "spindle::thread", thread = %st.label(current), "running");
            st.transition(current, ThreadStatus::Running);
            let doomed = match st.to_be_destroyed {
                Some(id) if id != current => {
                    st.to_be_destroyed = None;
                    st.reclaim(id)
                }
                _ => None,
            };
            (current, doomed)
        };
        if let Some(tcb) = doomed {
            tcb.destroy();
            let mut st = self.state();
            st.graveyard.retain(|t| !t.has_exited());
            st.graveyard.push(tcb);
        }
        self.hooks().restore_state(&KThread::new(self.clone(), current));
    }
}
