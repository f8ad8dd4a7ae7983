//! Log entry types and the delivery cursor

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Severity/category of a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Fault reported by the engine or an agent.
    Error,
    /// Suspicious but non-fatal condition.
    Warning,
    /// Notable positive outcome.
    Success,
    /// Regular progress output.
    #[default]
    Info,
    /// Verbose diagnostics.
    Debug,
}

impl LogLevel {
    /// Lowercase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warning" | "warn" => Ok(Self::Warning),
            "success" => Ok(Self::Success),
            "info" => Ok(Self::Info),
            "debug" | "trace" => Ok(Self::Debug),
            other => Err(Error::InvalidRequest(format!("unknown log level '{other}'"))),
        }
    }
}

/// An unstamped log record, as produced by an engine.
///
/// The store assigns the timestamp when the record is appended.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    level: LogLevel,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    agent_id: Option<String>,
}

impl LogRecord {
    /// Create an empty record at the given level.
    #[must_use]
    pub const fn new(level: LogLevel) -> Self {
        Self {
            level,
            message: None,
            data: None,
            agent_id: None,
        }
    }

    /// Info-level record with a message.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info).message(message)
    }

    /// Error-level record with a message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error).message(message)
    }

    /// Warning-level record with a message.
    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warning).message(message)
    }

    /// Success-level record with a message.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Success).message(message)
    }

    /// Debug-level record with a message.
    #[must_use]
    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(LogLevel::Debug).message(message)
    }

    /// Set the message text.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Tag the originating agent.
    #[must_use]
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Get the level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }
}

/// An immutable, stamped log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    agent_id: Option<String>,
}

impl LogEntry {
    /// Stamp a record with its delivery timestamp.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, record: LogRecord) -> Self {
        Self {
            timestamp,
            level: record.level,
            message: record.message,
            data: record.data,
            agent_id: record.agent_id,
        }
    }

    /// Get the timestamp (the delivery cursor position of this entry).
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Get the level.
    #[must_use]
    pub const fn level(&self) -> LogLevel {
        self.level
    }

    /// Get the message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Get the structured payload, if any.
    #[must_use]
    pub const fn data(&self) -> Option<&serde_json::Value> {
        self.data.as_ref()
    }

    /// Get the originating agent, if tagged.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Cursor positioned at this entry.
    #[must_use]
    pub const fn cursor(&self) -> Cursor {
        Cursor(self.timestamp)
    }

    /// Whether this entry lies strictly after `cursor` (`None` = beginning).
    #[must_use]
    pub fn is_after(&self, cursor: Option<Cursor>) -> bool {
        cursor.map_or(true, |c| self.timestamp > c.0)
    }
}

/// "Last delivered" position of an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(DateTime<Utc>);

impl Cursor {
    /// Wrap a timestamp.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>) -> Self {
        Self(timestamp)
    }

    /// Get the timestamp.
    #[must_use]
    pub const fn timestamp(self) -> DateTime<Utc> {
        self.0
    }

    /// Parse an optional RFC 3339 query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTimestamp`] if the value is present but malformed.
    pub fn parse_optional(raw: Option<&str>) -> Result<Option<Self>> {
        raw.filter(|s| !s.is_empty())
            .map(str::parse::<Self>)
            .transpose()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl FromStr for Cursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DateTime::parse_from_rfc3339(s)
            .map(|ts| Self(ts.with_timezone(&Utc)))
            .map_err(|_| Error::InvalidTimestamp(s.to_string()))
    }
}

/// One page of a discrete log query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    /// Entries after the requested cursor, oldest first.
    pub logs: Vec<LogEntry>,
    /// Total number of entries in the partition.
    pub total: u64,
    /// Whether more entries exist after the last one returned.
    pub has_more: bool,
}

/// Persisted experiment partition, as seen by the datastore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSummary {
    /// Partition (experiment) name.
    pub name: String,
    /// Number of log entries.
    pub logs_count: u64,
    /// Timestamp of the first entry.
    pub first_activity: Option<DateTime<Utc>>,
    /// Timestamp of the last entry.
    pub last_activity: Option<DateTime<Utc>>,
}

/// Next strictly increasing microsecond stamp after `last`.
pub(crate) fn next_timestamp_micros(last: Option<i64>) -> i64 {
    let now = Utc::now().timestamp_micros();
    match last {
        Some(last) if now <= last => last + 1,
        _ => now,
    }
}

pub(crate) fn timestamp_from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("timestamp out of range: {micros}")))
}
