//! SQLite-backed log store.
//!
//! Each partition is its own table, `"<name>__logs"`. Table names are built
//! from [`PartitionName`] only, which has already passed the schema name
//! validator; all values go through bound parameters.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use super::{
    next_timestamp_micros, timestamp_from_micros, Cursor, LogEntry, LogLevel, LogRecord, LogStore,
    PartitionSummary,
};
use crate::validate::PartitionName;
use crate::{Error, Result};

const TABLE_SUFFIX: &str = "__logs";

type RawRow = (i64, String, Option<String>, Option<String>, Option<String>);

/// Log store persisting partitions in a single SQLite database.
///
/// Blocking SQLite calls run on the tokio blocking pool; one connection is
/// shared behind a mutex, which also serializes appends so per-partition
/// timestamps stay strictly increasing.
#[derive(Clone)]
pub struct SqliteLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLogStore").finish_non_exhaustive()
    }
}

impl SqliteLogStore {
    /// Open (or create) a database file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self::from_connection(conn))
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if SQLite cannot allocate the database.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Storage("sqlite connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Storage(format!("sqlite task failed: {e}")))?
    }
}

fn table_name(partition: &PartitionName) -> String {
    format!("{partition}{TABLE_SUFFIX}")
}

fn quoted(table: &str) -> String {
    format!("\"{table}\"")
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn entry_from_row(row: RawRow) -> Result<LogEntry> {
    let (created_at, level, message, data, agent_id) = row;
    let mut record = LogRecord::new(level.parse::<LogLevel>().unwrap_or_default());
    if let Some(message) = message {
        record = record.message(message);
    }
    if let Some(data) = data {
        record = record.data(serde_json::from_str(&data)?);
    }
    if let Some(agent_id) = agent_id {
        record = record.agent_id(agent_id);
    }
    Ok(LogEntry::new(timestamp_from_micros(created_at)?, record))
}

impl LogStore for SqliteLogStore {
    async fn append(&self, partition: &PartitionName, record: LogRecord) -> Result<LogEntry> {
        let table = quoted(&table_name(partition));
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    created_at INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    message TEXT,
                    data TEXT,
                    agent_id TEXT
                )"
            ))?;
            let last: Option<i64> =
                tx.query_row(&format!("SELECT MAX(created_at) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
            let micros = next_timestamp_micros(last);
            let entry = LogEntry::new(timestamp_from_micros(micros)?, record);
            let data = entry.data().map(serde_json::to_string).transpose()?;
            tx.execute(
                &format!(
                    "INSERT INTO {table} (created_at, level, message, data, agent_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                params![
                    micros,
                    entry.level().as_str(),
                    entry.message(),
                    data,
                    entry.agent_id()
                ],
            )?;
            tx.commit()?;
            Ok(entry)
        })
        .await
    }

    async fn read_after(
        &self,
        partition: &PartitionName,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Vec<LogEntry>> {
        let table = table_name(partition);
        let after_micros = after.map_or(i64::MIN, |c| c.timestamp().timestamp_micros());
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(Vec::new());
            }
            let mut stmt = conn.prepare(&format!(
                "SELECT created_at, level, message, data, agent_id
                 FROM {}
                 WHERE created_at > ?1
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?2",
                quoted(&table)
            ))?;
            let rows = stmt
                .query_map(params![after_micros, limit], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
                })?
                .collect::<std::result::Result<Vec<RawRow>, _>>()?;
            rows.into_iter().map(entry_from_row).collect()
        })
        .await
    }

    async fn count(&self, partition: &PartitionName) -> Result<u64> {
        let table = table_name(partition);
        self.with_conn(move |conn| {
            if !table_exists(conn, &table)? {
                return Ok(0);
            }
            let n: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", quoted(&table)),
                [],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(n).unwrap_or(0))
        })
        .await
    }

    async fn partition_exists(&self, partition: &PartitionName) -> Result<bool> {
        let table = table_name(partition);
        self.with_conn(move |conn| table_exists(conn, &table)).await
    }

    async fn drop_partition(&self, partition: &PartitionName) -> Result<()> {
        let table = quoted(&table_name(partition));
        self.with_conn(move |conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
            Ok(())
        })
        .await
    }

    async fn partitions(&self) -> Result<Vec<PartitionSummary>> {
        self.with_conn(|conn| {
            let tables: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master
                     WHERE type = 'table' AND name LIKE '%\\_\\_logs' ESCAPE '\\'",
                )?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                names
            };

            let mut summaries = Vec::with_capacity(tables.len());
            for table in tables {
                let Some(name) = table.strip_suffix(TABLE_SUFFIX) else {
                    continue;
                };
                let Ok(name) = PartitionName::new(name) else {
                    continue;
                };
                let (count, first, last): (i64, Option<i64>, Option<i64>) = conn.query_row(
                    &format!(
                        "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM {}",
                        quoted(&table)
                    ),
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                summaries.push(PartitionSummary {
                    name: name.into_inner(),
                    logs_count: u64::try_from(count).unwrap_or(0),
                    first_activity: first.map(timestamp_from_micros).transpose()?,
                    last_activity: last.map(timestamp_from_micros).transpose()?,
                });
            }
            Ok(summaries)
        })
        .await
    }
}
