//! The continuation scheduler: a thread-local FIFO of jobs with an explicit
//! drain entry point. Settlement never invokes a continuation directly; it
//! enqueues here, so callbacks fire on a later turn and in the order their
//! registrations were attached.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::Error;

/// A deferred unit of work.
pub type Job = Box<dyn FnOnce() + 'static>;

thread_local! {
    static QUEUE: RefCell<VecDeque<Job>> = const { RefCell::new(VecDeque::new()) };
    static DRAINING: Cell<bool> = const { Cell::new(false) };
}

/// Enqueues a job to run on a later turn, never synchronously. Jobs from the
/// same thread run in the order they were scheduled.
pub fn schedule(job: Job) {
    QUEUE.with(|queue| queue.borrow_mut().push_back(job));
}

/// Number of jobs waiting on this thread.
pub fn pending() -> usize {
    QUEUE.with(|queue| queue.borrow().len())
}

/// Holds the per-thread draining flag; the flag resets on drop so the
/// queue stays usable even when a job unwinds.
struct DrainGuard;

impl DrainGuard {
    fn acquire() -> Result<Self, Error> {
        if DRAINING.with(Cell::get) {
            return Err(Error::SchedulerBusy);
        }
        DRAINING.with(|flag| flag.set(true));
        Ok(DrainGuard)
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        DRAINING.with(|flag| flag.set(false));
    }
}

/// Runs at most one queued job. Returns whether a job ran.
pub fn step() -> Result<bool, Error> {
    let _guard = DrainGuard::acquire()?;
    let Some(job) = QUEUE.with(|queue| queue.borrow_mut().pop_front()) else {
        return Ok(false);
    };
    job();
    Ok(true)
}

/// Drains the queue until it is empty, including jobs scheduled while
/// draining, and returns the number of jobs run. Calling this from inside a
/// job fails with [`Error::SchedulerBusy`] instead of recursing into the
/// drain already in progress.
pub fn run_until_idle() -> Result<usize, Error> {
    let _guard = DrainGuard::acquire()?;
    let mut ran = 0;
    while let Some(job) = QUEUE.with(|queue| queue.borrow_mut().pop_front()) {
        job();
        ran += 1;
    }
    Ok(ran)
}
