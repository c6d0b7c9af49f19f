//! Worker status machine.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transition history kept per worker.
const MAX_TRANSITIONS: usize = 200;

/// Lifecycle status of a procedure worker.
///
/// `Dead` is never reported by a worker about itself; the host assigns it
/// when a worker disappears without reporting `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Waiting for the next execution.
    Idle,
    /// Executing a procedure.
    Running,
    /// Exited cleanly.
    Finished,
    /// Lost without a final status.
    Dead,
}

impl WorkerStatus {
    /// Check if moving from `current` (None before the first report) to
    /// `target` follows the lifecycle.
    pub fn can_transition(current: Option<WorkerStatus>, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        match current {
            None => matches!(target, Idle | Finished | Dead),
            Some(from) => matches!(
                (from, target),
                (Idle, Running) | (Idle, Finished) | (Idle, Dead) |
                (Running, Idle) | (Running, Finished) | (Running, Dead)
            ),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Dead)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
            Self::Dead => "DEAD",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: Option<WorkerStatus>,
    pub to: WorkerStatus,
    pub timestamp: DateTime<Utc>,
}

/// Current status plus a capped history of how it got there.
#[derive(Debug, Clone, Default)]
pub struct StatusHistory {
    current: Option<WorkerStatus>,
    transitions: VecDeque<StatusTransition>,
}

impl StatusHistory {
    pub fn current(&self) -> Option<WorkerStatus> {
        self.current
    }

    /// Record `to` as the new status. Returns false when the change does not
    /// follow the lifecycle; it is recorded anyway since the reporter is the
    /// source of truth for what it did.
    pub fn record(&mut self, to: WorkerStatus) -> bool {
        let valid = WorkerStatus::can_transition(self.current, to);
        self.transitions.push_back(StatusTransition {
            from: self.current,
            to,
            timestamp: Utc::now(),
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.current = Some(to);
        valid
    }

    /// The statuses passed through, oldest first.
    pub fn sequence(&self) -> Vec<WorkerStatus> {
        self.transitions.iter().map(|t| t.to).collect()
    }

    pub fn transitions(&self) -> Vec<StatusTransition> {
        self.transitions.iter().cloned().collect()
    }
}
