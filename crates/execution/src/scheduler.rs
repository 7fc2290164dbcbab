//! Due-time scheduling for the scheduled strategy.

use std::time::Duration;

use runway_core::{Capability, Time};

use crate::discovery::DiscoveredTask;

/// When a scheduled task should run, relative to now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Due within the horizon; dispatch after `delay` (zero when overdue)
    Due { delay: Duration },
    /// Beyond the horizon; leave pending
    Deferred { due: Time },
}

/// Classifies tasks against a scheduling horizon.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    horizon: Duration,
    now: Time,
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

impl Schedule {
    /// Schedule relative to the current time.
    pub fn new(horizon: Duration) -> Self {
        Self::at(chrono::Utc::now(), horizon)
    }

    /// Schedule relative to a fixed instant.
    pub fn at(now: Time, horizon: Duration) -> Self {
        Self { horizon, now }
    }

    /// The reference instant.
    pub fn now(&self) -> Time {
        self.now
    }

    /// Due time of a task: its `scheduled_at` when scheduled, else now.
    pub fn due_time(&self, task: &DiscoveredTask) -> Time {
        if task.capabilities().contains(Capability::Scheduled) {
            task.task.scheduled_at().unwrap_or(self.now)
        } else {
            self.now
        }
    }

    /// Place a task in the schedule.
    pub fn classify(&self, task: &DiscoveredTask) -> Slot {
        let due = self.due_time(task);
        let delay = (due - self.now).to_std().unwrap_or(Duration::ZERO);
        if delay > self.horizon {
            Slot::Deferred { due }
        } else {
            Slot::Due { delay }
        }
    }
}
