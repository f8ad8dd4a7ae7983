//! Log Tail Reader - incremental, cursor-based partition reads
//!
//! Shared by the discrete log query and the stream session so both access
//! modes see identical ordering and deduplication for the same cursor.

use std::sync::Arc;

use super::{Cursor, LogEntry, LogPage, LogStore};
use crate::validate::PartitionName;
use crate::Result;

/// Result of one tail read.
#[derive(Debug, Clone, PartialEq)]
pub struct TailBatch {
    /// Entries strictly after the requested cursor, oldest first.
    pub entries: Vec<LogEntry>,
    /// Whether at least one more entry exists after the last returned one.
    pub has_more: bool,
}

impl TailBatch {
    /// Cursor of the last entry in the batch, if any.
    #[must_use]
    pub fn last_cursor(&self) -> Option<Cursor> {
        self.entries.last().map(LogEntry::cursor)
    }
}

/// Read-only view over a [`LogStore`].
pub struct TailReader<S> {
    store: Arc<S>,
}

impl<S> Clone for TailReader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LogStore> TailReader<S> {
    /// Create a reader over a shared store.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Entries with timestamp > `since`, up to `limit`, plus a `has_more` flag.
    ///
    /// A partition that does not exist yet reads as empty.
    ///
    /// # Errors
    ///
    /// Propagates datastore errors.
    pub async fn read(
        &self,
        partition: &PartitionName,
        since: Option<Cursor>,
        limit: usize,
    ) -> Result<TailBatch> {
        let limit = limit.max(1);
        let mut entries = self
            .store
            .read_after(partition, since, limit.saturating_add(1))
            .await?;
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        Ok(TailBatch { entries, has_more })
    }

    /// Discrete log query: a tail read plus the partition total.
    ///
    /// # Errors
    ///
    /// Propagates datastore errors.
    pub async fn query(
        &self,
        partition: &PartitionName,
        since: Option<Cursor>,
        limit: usize,
    ) -> Result<LogPage> {
        let batch = self.read(partition, since, limit).await?;
        let total = self.store.count(partition).await?;
        Ok(LogPage {
            logs: batch.entries,
            total,
            has_more: batch.has_more,
        })
    }

    /// Underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }
}
