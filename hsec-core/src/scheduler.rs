//! Cooperative scheduler: named tasks with a minimum re-fire interval, polled from the control loop.

use std::time::{Duration, Instant};

/// Units of work the device runs. Dispatch happens in the device by matching on the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskId {
    /// Broadcast the pairing heartbeat.
    Heartbeat,
    /// Poll the discovery channel for a pairing ack.
    PairListen,
    /// One relink attempt.
    Repair,
    /// Capture and send one frame.
    Stream,
    /// Poll the discovery channel for server commands (unpair).
    CommandListen,
}

#[derive(Debug, Clone)]
struct Task {
    id: TaskId,
    interval: Duration,
    last_run: Option<Instant>,
}

/// Ordered list of `{interval, last_run, id}` records.
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Register a task. Re-registering an id replaces its interval and clears its history.
    pub fn register(&mut self, id: TaskId, interval: Duration) {
        self.tasks.retain(|t| t.id != id);
        self.tasks.push(Task {
            id,
            interval,
            last_run: None,
        });
    }

    /// Tick-if-due: true (and records the run) when the task never ran or its interval has elapsed.
    /// Unknown ids are never due.
    pub fn due(&mut self, id: TaskId, now: Instant) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        let ready = match task.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= task.interval,
        };
        if ready {
            task.last_run = Some(now);
        }
        ready
    }

    /// Force-run: the task runs now regardless of its interval; the run is recorded.
    pub fn force(&mut self, id: TaskId, now: Instant) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                task.last_run = Some(now);
                true
            }
            None => false,
        }
    }
}
