//! Live log streaming
//!
//! A [`StreamSession`] delivers one observer's view of one experiment as a
//! sequence of [`StreamMessage`]s: every log entry after the observer's
//! cursor, in timestamp order, followed by status changes and finally one
//! terminal status.
//!
//! Wire format (one JSON object per message):
//!
//! ```text
//! {"type":"log","log":{"timestamp":"...","level":"info","message":"..."}}
//! {"type":"status","status":"running"}
//! {"type":"error","error":"Experiment 'x' not found"}
//! ```

mod session;

pub use session::{SessionOutcome, SessionState, StreamSession};

use serde::{Deserialize, Serialize};

use crate::experiment::ExperimentStatus;
use crate::logs::LogEntry;

/// One message pushed to an observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// A new log entry.
    Log {
        /// The entry
        log: LogEntry,
    },
    /// The experiment's status changed.
    Status {
        /// New status
        status: ExperimentStatus,
    },
    /// A human-readable failure description.
    Error {
        /// Message text
        error: String,
    },
}

impl StreamMessage {
    /// Terminal status messages end a session.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Status { status } if status.is_terminal())
    }
}

impl From<LogEntry> for StreamMessage {
    fn from(log: LogEntry) -> Self {
        Self::Log { log }
    }
}
