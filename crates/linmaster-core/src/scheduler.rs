//! Cooperative scheduler
//!
//! Background operation hands the remaining state transitions of a
//! transaction to one-shot delayed callbacks. The [`Scheduler`] trait is
//! the contract the engine consumes; [`TaskScheduler`] is a single-threaded
//! implementation dispatched by a caller-driven loop.
//!
//! Methods take `&self` with interior mutability so a running task may
//! register a follow-up (the send handler schedules the receive handler).

use std::cell::RefCell;
use std::time::{Duration, Instant};

/// A one-shot scheduled callback
pub type Task = Box<dyn FnOnce() + 'static>;

/// Cooperative one-shot callback dispatch consumed by the engine in
/// background mode
pub trait Scheduler {
    /// Register `task` to run once, `delay` from now
    fn schedule_once(&self, delay: Duration, task: Task);

    /// Suspend dispatch. Queued tasks are retained, not dropped. Lets a
    /// consumer read a consistent snapshot of a buffer a background
    /// transaction is filling.
    fn pause(&self);

    /// Resume dispatch after [`Scheduler::pause`]
    fn resume(&self);
}

struct Entry {
    due: Instant,
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Queue {
    entries: Vec<Entry>,
    paused: bool,
    next_seq: u64,
}

/// Single-threaded one-shot timer queue.
///
/// The owner drives it by calling [`TaskScheduler::run_pending`] from its
/// main loop; tasks whose deadline has passed run in (deadline, insertion)
/// order. Tasks may schedule further tasks while running.
#[derive(Default)]
pub struct TaskScheduler {
    queue: RefCell<Queue>,
}

impl TaskScheduler {
    /// New empty scheduler, dispatch enabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every task whose deadline has passed, returning how many ran.
    /// Returns 0 without dispatching while paused.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // take the task out before running it, so it can reschedule
            // through &self without a nested borrow
            let task = {
                let mut q = self.queue.borrow_mut();
                if q.paused {
                    return ran;
                }
                let now = Instant::now();
                let next = q
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.due <= now)
                    .min_by_key(|(_, e)| (e.due, e.seq))
                    .map(|(i, _)| i);
                match next {
                    Some(i) => q.entries.swap_remove(i).task,
                    None => return ran,
                }
            };
            task();
            ran += 1;
        }
    }

    /// True if any task is queued, due or not
    pub fn has_pending(&self) -> bool {
        !self.queue.borrow().entries.is_empty()
    }

    /// Earliest queued deadline, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.borrow().entries.iter().map(|e| e.due).min()
    }
}

impl Scheduler for TaskScheduler {
    fn schedule_once(&self, delay: Duration, task: Task) {
        let mut q = self.queue.borrow_mut();
        let seq = q.next_seq;
        q.next_seq += 1;
        q.entries.push(Entry {
            due: Instant::now() + delay,
            seq,
            task,
        });
    }

    fn pause(&self) {
        self.queue.borrow_mut().paused = true;
    }

    fn resume(&self) {
        self.queue.borrow_mut().paused = false;
    }
}
