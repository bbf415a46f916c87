//! Deadline scheduler for the periodic maintenance work.
//!
//! The connected steady state runs a handful of recurring chores at
//! different cadences (telemetry ticks, link polls, session probes,
//! credential refreshes, registration retries). Instead of one task per
//! cadence, a single min-heap of deadlines drives them all, so the
//! supervisor can sleep until the earliest one and tests can drive time
//! explicitly.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

/// The recurring chores. A task reschedules itself when handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TickTask {
    Telemetry,
    LinkPoll,
    SessionProbe,
    CredentialRefresh,
    RegistrationRetry,
}

// Ordering: earliest deadline first, task as tie-breaker for determinism.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    at: Instant,
    task: TickTask,
}

#[derive(Default)]
pub struct TickScheduler {
    queue: BinaryHeap<Reverse<Entry>>,
}

impl TickScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: TickTask, at: Instant) {
        self.queue.push(Reverse(Entry { at, task }));
    }

    pub fn schedule_after(&mut self, task: TickTask, delay: Duration, now: Instant) {
        self.schedule(task, now + delay);
    }

    /// Pops every task whose deadline has passed, in deadline order.
    pub fn due(&mut self, now: Instant) -> Vec<TickTask> {
        let mut tasks = Vec::new();
        while let Some(Reverse(entry)) = self.queue.peek() {
            if entry.at > now {
                break;
            }
            let Reverse(entry) = self.queue.pop().expect("peeked entry present");
            tasks.push(entry.task);
        }
        tasks
    }

    /// Earliest pending deadline, for the supervisor's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(|Reverse(entry)| entry.at)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
