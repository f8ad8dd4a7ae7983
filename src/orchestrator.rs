//! Orchestrator - one handle over registry, log store, runner and sessions
//!
//! Every external interface of the service is a method here; the HTTP layer
//! and the in-process client transport are thin adapters over it.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use labrelay::config::OrchestratorConfig;
//! use labrelay::logs::{LogStore, MemoryLogStore};
//! use labrelay::orchestrator::Orchestrator;
//! use labrelay::runner::{Engine, EngineContext, LaunchRequest};
//!
//! struct Hello;
//!
//! impl Engine for Hello {
//!     async fn run<S: LogStore>(&self, ctx: EngineContext<S>) -> anyhow::Result<()> {
//!         ctx.writer.info("hello from the engine").await?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> labrelay::Result<()> {
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(MemoryLogStore::new()),
//!     Arc::new(Hello),
//! );
//! let pending = orchestrator.launch(LaunchRequest::named("exp_a")).await?;
//! assert_eq!(pending.status().as_str(), "pending");
//!
//! let mut stream = orchestrator.subscribe("exp_a", None)?;
//! while let Some(message) = stream.recv().await {
//!     println!("{message:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{ClientConfig, LogsConfig, OrchestratorConfig, StreamConfig};
use crate::experiment::{Experiment, ExperimentRegistry};
use crate::logs::{Cursor, LogPage, LogStore, PartitionSummary, TailReader};
use crate::runner::{Engine, LaunchRequest, LifecycleRunner};
use crate::stream::{StreamMessage, StreamSession};
use crate::validate::PartitionName;
use crate::{Error, Result};

/// Effective defaults observers should align with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Stream session polling
    pub stream: StreamConfig,
    /// Discrete log query limits
    pub logs: LogsConfig,
    /// Client reconnect and status polling
    pub client: ClientConfig,
}

/// Service facade.
pub struct Orchestrator<S, E> {
    config: OrchestratorConfig,
    registry: Arc<ExperimentRegistry>,
    store: Arc<S>,
    runner: LifecycleRunner<S, E>,
    tail: TailReader<S>,
    sessions: Arc<AtomicUsize>,
}

/// Counts a stream session for as long as its task lives.
struct SessionGuard(Arc<AtomicUsize>);

impl SessionGuard {
    fn enter(sessions: &Arc<AtomicUsize>) -> Self {
        sessions.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(sessions))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: LogStore, E: Engine> Orchestrator<S, E> {
    /// Wire up a fresh registry around `store` and `engine`.
    #[must_use]
    pub fn new(config: OrchestratorConfig, store: Arc<S>, engine: Arc<E>) -> Self {
        let registry = Arc::new(ExperimentRegistry::new());
        let runner = LifecycleRunner::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            engine,
            config.naming.prefix.clone(),
        );
        let tail = TailReader::new(Arc::clone(&store));
        Self {
            config,
            registry,
            store,
            runner,
            tail,
            sessions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Shared lifecycle registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ExperimentRegistry> {
        &self.registry
    }

    /// Shared log store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Accept a launch request; see [`LifecycleRunner::launch`].
    ///
    /// # Errors
    ///
    /// Validation, duplicate-run and datastore errors.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Experiment> {
        self.runner.launch(request).await
    }

    /// Current snapshot of a registered experiment.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`] or [`Error::NotFound`].
    pub fn status(&self, name: &str) -> Result<Experiment> {
        let partition = PartitionName::new(name)?;
        self.registry
            .get(partition.as_str())
            .ok_or_else(|| Error::NotFound(partition.into_inner()))
    }

    /// Experiments registered since this process started, ordered by name.
    #[must_use]
    pub fn list_active(&self) -> Vec<Experiment> {
        self.registry.list()
    }

    /// Experiments persisted in the datastore, most recently started first.
    ///
    /// A `limit` of zero means no limit.
    ///
    /// # Errors
    ///
    /// Propagates datastore errors.
    pub async fn list_stored(&self, limit: Option<usize>) -> Result<Vec<PartitionSummary>> {
        let mut summaries = self.store.partitions().await?;
        summaries.sort_by(|a, b| {
            b.first_activity
                .cmp(&a.first_activity)
                .then_with(|| a.name.cmp(&b.name))
        });
        if let Some(limit) = limit.filter(|limit| *limit > 0) {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Discrete log query.
    ///
    /// A registered experiment without a partition yet reads as an empty
    /// page; a name unknown to both the registry and the datastore is not
    /// found.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`], [`Error::NotFound`], or datastore errors.
    pub async fn logs(
        &self,
        name: &str,
        since: Option<Cursor>,
        limit: Option<usize>,
    ) -> Result<LogPage> {
        let partition = PartitionName::new(name)?;
        if self.registry.get(partition.as_str()).is_none()
            && !self.store.partition_exists(&partition).await?
        {
            return Err(Error::NotFound(partition.into_inner()));
        }
        self.tail
            .query(&partition, since, self.config.logs.clamp(limit))
            .await
    }

    /// Open a stream session; messages arrive on the returned receiver.
    ///
    /// Dropping the receiver stops the session. Must be called within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidName`]. Unknown experiments are reported in-band as
    /// an error message followed by the end of the stream.
    pub fn subscribe(
        &self,
        name: &str,
        since: Option<Cursor>,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        let partition = PartitionName::new(name)?;
        let (tx, rx) = mpsc::channel(self.config.stream.channel_capacity);
        let session = StreamSession::new(
            partition,
            Arc::clone(&self.registry),
            self.tail.clone(),
            since,
            self.config.stream.clone(),
        );
        let guard = SessionGuard::enter(&self.sessions);
        tokio::spawn(async move {
            let _guard = guard;
            session.run(tx).await
        });
        Ok(rx)
    }

    /// Number of stream sessions still running.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Effective stream, log query and client defaults.
    #[must_use]
    pub fn settings(&self) -> Settings {
        Settings {
            stream: self.config.stream.clone(),
            logs: self.config.logs.clone(),
            client: self.config.client.clone(),
        }
    }

    /// Abort every running engine task.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }
}
