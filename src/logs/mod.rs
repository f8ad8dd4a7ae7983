//! Experiment log partitions
//!
//! Each experiment writes its log into an isolated partition keyed by its
//! validated name. Entries are append-only and immutable once visible, so
//! any number of readers can tail a partition while one engine writes it.
//!
//! # Example
//!
//! ```rust
//! use labrelay::logs::{LogRecord, LogStore, MemoryLogStore, TailReader};
//! use labrelay::validate::PartitionName;
//! use std::sync::Arc;
//!
//! # async fn example() -> labrelay::Result<()> {
//! let store = Arc::new(MemoryLogStore::new());
//! let name = PartitionName::new("exp_a")?;
//!
//! store.append(&name, LogRecord::info("engine started")).await?;
//! let first = store.append(&name, LogRecord::success("done")).await?;
//!
//! let tail = TailReader::new(store);
//! let batch = tail.read(&name, Some(first.cursor()), 100).await?;
//! assert!(batch.entries.is_empty());
//! # Ok(())
//! # }
//! ```

mod entry;
mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod tail;

pub use entry::{Cursor, LogEntry, LogLevel, LogPage, LogRecord, PartitionSummary};
pub(crate) use entry::{next_timestamp_micros, timestamp_from_micros};
pub use memory::MemoryLogStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogStore;
pub use tail::{TailBatch, TailReader};

use crate::validate::PartitionName;
use crate::Result;
use std::future::Future;

/// Partitioned, append-only log storage.
///
/// Implementations stamp every appended record with a timestamp strictly
/// greater than the previous entry of the same partition, and treat a
/// missing partition as empty on the read side.
pub trait LogStore: Send + Sync + 'static {
    /// Append a record, creating the partition if needed.
    fn append(
        &self,
        partition: &PartitionName,
        record: LogRecord,
    ) -> impl Future<Output = Result<LogEntry>> + Send;

    /// Entries with timestamp strictly after `after`, oldest first, at most `limit`.
    fn read_after(
        &self,
        partition: &PartitionName,
        after: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<LogEntry>>> + Send;

    /// Number of entries in the partition (0 if missing).
    fn count(&self, partition: &PartitionName) -> impl Future<Output = Result<u64>> + Send;

    /// Whether the partition has been created.
    fn partition_exists(
        &self,
        partition: &PartitionName,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Remove a partition and all its entries. No-op if missing.
    fn drop_partition(&self, partition: &PartitionName) -> impl Future<Output = Result<()>> + Send;

    /// Summaries of every stored partition, in no particular order.
    fn partitions(&self) -> impl Future<Output = Result<Vec<PartitionSummary>>> + Send;
}
