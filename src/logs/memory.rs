//! In-memory log store implementation using `DashMap`.
//!
//! Default backend: partitions are lost on process restart.
//! For persistence, use `SqliteLogStore`.

use super::{
    next_timestamp_micros, timestamp_from_micros, Cursor, LogEntry, LogRecord, LogStore,
    PartitionSummary,
};
use crate::validate::PartitionName;
use crate::Result;
use dashmap::DashMap;

/// In-memory partitioned log store.
///
/// One `Vec` per partition, kept in timestamp order by construction: the
/// shard write lock held during `append` makes stamping and pushing atomic
/// with respect to other writers of the same partition.
///
/// # Example
///
/// ```rust
/// use labrelay::logs::{LogRecord, LogStore, MemoryLogStore};
/// use labrelay::validate::PartitionName;
///
/// # async fn example() -> labrelay::Result<()> {
/// let store = MemoryLogStore::new();
/// let name = PartitionName::new("exp_a")?;
/// store.append(&name, LogRecord::info("hello")).await?;
/// assert_eq!(store.count(&name).await?, 1);
/// # Ok(())
/// # }
/// ```
pub struct MemoryLogStore {
    partitions: DashMap<String, Vec<LogEntry>>,
}

impl MemoryLogStore {
    /// Create a new in-memory log store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
        }
    }

    /// Number of partitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Check if the store holds no partitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemoryLogStore {
    async fn append(&self, partition: &PartitionName, record: LogRecord) -> Result<LogEntry> {
        let mut entries = self
            .partitions
            .entry(partition.as_str().to_string())
            .or_default();
        let last = entries.last().map(|e| e.timestamp().timestamp_micros());
        let timestamp = timestamp_from_micros(next_timestamp_micros(last))?;
        let entry = LogEntry::new(timestamp, record);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn read_after(
        &self,
        partition: &PartitionName,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let Some(entries) = self.partitions.get(partition.as_str()) else {
            return Ok(Vec::new());
        };
        let start = after.map_or(0, |cursor| {
            entries.partition_point(|e| e.timestamp() <= cursor.timestamp())
        });
        Ok(entries.iter().skip(start).take(limit).cloned().collect())
    }

    async fn count(&self, partition: &PartitionName) -> Result<u64> {
        Ok(self
            .partitions
            .get(partition.as_str())
            .map_or(0, |entries| entries.len() as u64))
    }

    async fn partition_exists(&self, partition: &PartitionName) -> Result<bool> {
        Ok(self.partitions.contains_key(partition.as_str()))
    }

    async fn drop_partition(&self, partition: &PartitionName) -> Result<()> {
        self.partitions.remove(partition.as_str());
        Ok(())
    }

    async fn partitions(&self) -> Result<Vec<PartitionSummary>> {
        Ok(self
            .partitions
            .iter()
            .map(|item| PartitionSummary {
                name: item.key().clone(),
                logs_count: item.value().len() as u64,
                first_activity: item.value().first().map(LogEntry::timestamp),
                last_activity: item.value().last().map(LogEntry::timestamp),
            })
            .collect())
    }
}
