//! Experiment Record - lifecycle snapshot of one launched run

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    /// Launch accepted, engine not started yet.
    Pending,
    /// Engine is executing.
    Running,
    /// Engine returned normally.
    Completed,
    /// Engine raised a fault.
    Failed,
}

impl ExperimentStatus {
    /// `Completed` or `Failed`: no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A requested lifecycle edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// pending -> running
    Start,
    /// running -> completed
    Complete,
    /// running -> failed, with the captured error text
    Fail(String),
}

impl Transition {
    /// Status this transition moves to.
    #[must_use]
    pub const fn target(&self) -> ExperimentStatus {
        match self {
            Self::Start => ExperimentStatus::Running,
            Self::Complete => ExperimentStatus::Completed,
            Self::Fail(_) => ExperimentStatus::Failed,
        }
    }
}

/// Snapshot of one experiment's lifecycle.
///
/// Invariants upheld by [`Experiment::apply`]:
/// - status only moves pending -> running -> {completed | failed}
/// - `started_at` is set on entering running
/// - `completed_at` is set iff the status is terminal
/// - `error` is set only when failed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Experiment {
    name: String,
    status: ExperimentStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    #[serde(skip)]
    run_id: u64,
}

impl Experiment {
    /// Create a pending experiment for the given registration.
    #[must_use]
    pub fn pending(name: impl Into<String>, run_id: u64) -> Self {
        Self {
            name: name.into(),
            status: ExperimentStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            run_id,
        }
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the start timestamp, if the engine has started.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the completion timestamp, if terminal.
    #[must_use]
    pub const fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Get the error message, if failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Registration generation this snapshot belongs to.
    #[must_use]
    pub const fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Whether the status is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a transition in place.
    ///
    /// # Errors
    ///
    /// Returns the `(from, to)` pair when the lifecycle forbids the edge; the
    /// record is left untouched in that case.
    pub fn apply(
        &mut self,
        transition: Transition,
    ) -> std::result::Result<(), (ExperimentStatus, ExperimentStatus)> {
        let to = transition.target();
        match (self.status, transition) {
            (ExperimentStatus::Pending, Transition::Start) => {
                self.status = ExperimentStatus::Running;
                self.started_at = Some(Utc::now());
            }
            (ExperimentStatus::Running, Transition::Complete) => {
                self.status = ExperimentStatus::Completed;
                self.completed_at = Some(Utc::now());
            }
            (ExperimentStatus::Running, Transition::Fail(message)) => {
                self.status = ExperimentStatus::Failed;
                self.completed_at = Some(Utc::now());
                self.error = Some(message);
            }
            (from, _) => return Err((from, to)),
        }
        Ok(())
    }
}
