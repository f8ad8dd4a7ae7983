//! Stream Session - per-observer polling loop
//!
//! ```text
//! Connecting -> Open -> ClosingNormal   (terminal status delivered)
//!                    -> ClosingError    (not found, fatal or repeated datastore errors)
//!                    -> Disconnected    (observer went away)
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::StreamMessage;
use crate::config::StreamConfig;
use crate::experiment::{ExperimentRegistry, ExperimentStatus};
use crate::logs::{Cursor, LogStore, TailReader};
use crate::validate::PartitionName;
use crate::Error;

/// Lifecycle of a stream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, loop not started
    Connecting,
    /// Polling
    Open,
    /// Terminal status delivered
    ClosingNormal,
    /// Closed after an error message
    ClosingError,
    /// Observer dropped its receiver
    Disconnected,
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    /// Final state
    pub state: SessionState,
    /// Number of log messages delivered
    pub delivered: u64,
    /// Cursor after the last delivered entry
    pub cursor: Option<Cursor>,
}

enum Flow {
    Continue,
    Close(SessionState),
}

struct Disconnected;

/// Server-side loop feeding one observer.
pub struct StreamSession<S> {
    partition: PartitionName,
    registry: Arc<ExperimentRegistry>,
    tail: TailReader<S>,
    config: StreamConfig,
    cursor: Option<Cursor>,
    state: SessionState,
    last_status: Option<ExperimentStatus>,
    consecutive_failures: u32,
    delivered: u64,
}

impl<S: LogStore> StreamSession<S> {
    /// Create a session starting after `since` (`None` = from the beginning).
    #[must_use]
    pub const fn new(
        partition: PartitionName,
        registry: Arc<ExperimentRegistry>,
        tail: TailReader<S>,
        since: Option<Cursor>,
        config: StreamConfig,
    ) -> Self {
        Self {
            partition,
            registry,
            tail,
            config,
            cursor: since,
            state: SessionState::Connecting,
            last_status: None,
            consecutive_failures: 0,
            delivered: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Run until a terminal status is sent, a fatal error occurs, or the
    /// receiving side of `tx` is dropped.
    ///
    /// Dropping the receiver stops the loop within one in-flight tick.
    pub async fn run(mut self, tx: mpsc::Sender<StreamMessage>) -> SessionOutcome {
        self.state = SessionState::Open;
        tracing::debug!(experiment = %self.partition, cursor = ?self.cursor, "Stream session opened");

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = tx.closed() => {
                    self.state = SessionState::Disconnected;
                    break;
                }
                _ = ticker.tick() => {}
            }

            match self.tick(&tx).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close(state)) => {
                    self.state = state;
                    break;
                }
                Err(Disconnected) => {
                    self.state = SessionState::Disconnected;
                    break;
                }
            }
        }

        tracing::debug!(
            experiment = %self.partition,
            state = ?self.state,
            delivered = self.delivered,
            "Stream session closed"
        );
        SessionOutcome {
            state: self.state,
            delivered: self.delivered,
            cursor: self.cursor,
        }
    }

    async fn tick(&mut self, tx: &mpsc::Sender<StreamMessage>) -> Result<Flow, Disconnected> {
        // Snapshot before draining: entries written before a terminal
        // transition are always delivered ahead of the terminal status.
        let snapshot = self
            .registry
            .get(self.partition.as_str())
            .map(|experiment| experiment.status());

        if snapshot.is_none() {
            match self.tail.store().partition_exists(&self.partition).await {
                Ok(true) => {}
                Ok(false) => {
                    let error = Error::NotFound(self.partition.to_string()).to_string();
                    self.send(tx, StreamMessage::Error { error }).await?;
                    return Ok(Flow::Close(SessionState::ClosingError));
                }
                Err(err) => return self.on_read_error(tx, err).await,
            }
        }

        loop {
            match self
                .tail
                .read(&self.partition, self.cursor, self.config.batch_limit)
                .await
            {
                Ok(batch) => {
                    self.consecutive_failures = 0;
                    for entry in batch.entries {
                        let cursor = entry.cursor();
                        self.send(tx, StreamMessage::Log { log: entry }).await?;
                        self.cursor = Some(cursor);
                        self.delivered += 1;
                    }
                    if !batch.has_more {
                        break;
                    }
                }
                Err(err) => return self.on_read_error(tx, err).await,
            }
        }

        if let Some(status) = snapshot {
            if self.last_status != Some(status) {
                self.send(tx, StreamMessage::Status { status }).await?;
                self.last_status = Some(status);
            }
            if status.is_terminal() {
                return Ok(Flow::Close(SessionState::ClosingNormal));
            }
        }
        Ok(Flow::Continue)
    }

    async fn on_read_error(
        &mut self,
        tx: &mpsc::Sender<StreamMessage>,
        err: Error,
    ) -> Result<Flow, Disconnected> {
        self.consecutive_failures += 1;
        tracing::warn!(
            experiment = %self.partition,
            error = %err,
            failures = self.consecutive_failures,
            "Stream session read failed"
        );
        let fatal = !err.is_transient()
            || self.consecutive_failures >= self.config.max_consecutive_failures;
        self.send(tx, StreamMessage::Error { error: err.to_string() })
            .await?;
        if fatal {
            Ok(Flow::Close(SessionState::ClosingError))
        } else {
            Ok(Flow::Continue)
        }
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<StreamMessage>,
        message: StreamMessage,
    ) -> Result<(), Disconnected> {
        tx.send(message).await.map_err(|_| Disconnected)
    }
}
