//! Lifecycle Runner - supervised background execution of experiments
//!
//! A launch returns the pending snapshot immediately; the engine runs on its
//! own tokio task which drives the registry through
//! `pending -> running -> {completed | failed}`. Engine faults, including
//! panics, are converted into a `failed` status with the captured message and
//! never escape the task.
//!
//! At most one task writes a partition at a time: an override launch aborts
//! the previous task for the name and waits for it to stop before the new
//! engine run begins.

mod command;

pub use command::CommandEngine;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::experiment::{Experiment, ExperimentRegistry, Transition};
use crate::logs::{LogEntry, LogRecord, LogStore};
use crate::validate::PartitionName;
use crate::{Error, Result};

/// External engine boundary.
///
/// The engine receives an isolated partition and reports only normal
/// completion or a fault. Whatever it writes through the
/// [`PartitionWriter`] is opaque to the orchestrator.
pub trait Engine: Send + Sync + 'static {
    /// Execute one experiment run.
    fn run<S: LogStore>(
        &self,
        ctx: EngineContext<S>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Everything an engine is given for one run.
pub struct EngineContext<S> {
    /// Validated partition (experiment) name
    pub partition: PartitionName,
    /// Opaque experiment configuration from the launch request
    pub config: serde_json::Value,
    /// Whether this run replaced a previous one
    pub override_existing: bool,
    /// Append-only handle onto the run's partition
    pub writer: PartitionWriter<S>,
}

/// Append-only handle onto one partition.
pub struct PartitionWriter<S> {
    store: Arc<S>,
    partition: PartitionName,
}

impl<S> Clone for PartitionWriter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            partition: self.partition.clone(),
        }
    }
}

impl<S: LogStore> PartitionWriter<S> {
    /// Create a writer for `partition`.
    #[must_use]
    pub const fn new(store: Arc<S>, partition: PartitionName) -> Self {
        Self { store, partition }
    }

    /// Partition this writer appends to.
    #[must_use]
    pub const fn partition(&self) -> &PartitionName {
        &self.partition
    }

    /// Append a record.
    ///
    /// # Errors
    ///
    /// Propagates datastore errors.
    pub async fn write(&self, record: LogRecord) -> Result<LogEntry> {
        self.store.append(&self.partition, record).await
    }

    /// Append an info-level message.
    ///
    /// # Errors
    ///
    /// Propagates datastore errors.
    pub async fn info(&self, message: impl Into<String>) -> Result<LogEntry> {
        self.write(LogRecord::info(message)).await
    }
}

/// Launch request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Experiment name; generated when absent or empty
    #[serde(default)]
    pub experiment_name: Option<String>,
    /// Replace a live run or stored partition with the same name
    #[serde(default, rename = "override")]
    pub override_existing: bool,
    /// Opaque configuration handed to the engine
    #[serde(default)]
    pub config: serde_json::Value,
}

impl LaunchRequest {
    /// Request for a named experiment.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            experiment_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the override flag.
    #[must_use]
    pub const fn with_override(mut self, override_existing: bool) -> Self {
        self.override_existing = override_existing;
        self
    }

    /// Attach engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

struct RunSlot {
    run_id: u64,
    handle: Option<JoinHandle<()>>,
}

/// Launches engine runs and owns their background tasks.
pub struct LifecycleRunner<S, E> {
    registry: Arc<ExperimentRegistry>,
    store: Arc<S>,
    engine: Arc<E>,
    tasks: Arc<DashMap<String, RunSlot>>,
    name_prefix: String,
}

impl<S: LogStore, E: Engine> LifecycleRunner<S, E> {
    /// Create a runner.
    #[must_use]
    pub fn new(
        registry: Arc<ExperimentRegistry>,
        store: Arc<S>,
        engine: Arc<E>,
        name_prefix: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            engine,
            tasks: Arc::new(DashMap::new()),
            name_prefix: name_prefix.into(),
        }
    }

    /// Accept a launch request and start the engine in the background.
    ///
    /// Returns the pending snapshot without waiting for the engine.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidName`] if the (given or generated) name fails validation
    /// - [`Error::DuplicateRun`] without override, if a live run exists or the
    ///   datastore already holds a partition for the name
    /// - datastore errors from the partition existence check
    pub async fn launch(&self, request: LaunchRequest) -> Result<Experiment> {
        let LaunchRequest {
            experiment_name,
            override_existing,
            config,
        } = request;
        let name = experiment_name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| self.generate_name());
        let partition = PartitionName::new(name)?;

        if !override_existing && self.store.partition_exists(&partition).await? {
            return Err(Error::DuplicateRun(partition.into_inner()));
        }

        let key = partition.as_str().to_string();
        let launched = {
            let mut slot = self.tasks.entry(key.clone()).or_insert_with(|| RunSlot {
                run_id: 0,
                handle: None,
            });
            match self.registry.register(&partition, override_existing) {
                Ok(experiment) => {
                    let prior = slot.handle.take();
                    if let Some(prior) = &prior {
                        prior.abort();
                    }
                    let task = RunTask {
                        registry: Arc::clone(&self.registry),
                        store: Arc::clone(&self.store),
                        engine: Arc::clone(&self.engine),
                        tasks: Arc::clone(&self.tasks),
                        partition: partition.clone(),
                        run_id: experiment.run_id(),
                        override_existing,
                        config,
                    };
                    slot.run_id = experiment.run_id();
                    slot.handle = Some(tokio::spawn(task.drive(prior)));
                    Ok(experiment)
                }
                Err(err) => Err(err),
            }
        };
        if launched.is_err() {
            self.tasks.remove_if(&key, |_, slot| slot.handle.is_none());
        }

        let experiment = launched?;
        tracing::info!(
            experiment = %partition,
            run_id = experiment.run_id(),
            override_existing,
            "Experiment launch accepted"
        );
        Ok(experiment)
    }

    /// Whether a background task is still attached to `name`.
    #[must_use]
    pub fn has_task(&self, name: &str) -> bool {
        self.tasks.get(name).is_some_and(|slot| {
            slot.handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
        })
    }

    /// Abort every background run. Aborted runs stay in their last status.
    pub fn shutdown(&self) {
        for slot in self.tasks.iter() {
            if let Some(handle) = &slot.handle {
                handle.abort();
            }
        }
        self.tasks.clear();
    }

    fn generate_name(&self) -> String {
        format!("{}_{}", self.name_prefix, Utc::now().timestamp_millis())
    }
}

struct RunTask<S, E> {
    registry: Arc<ExperimentRegistry>,
    store: Arc<S>,
    engine: Arc<E>,
    tasks: Arc<DashMap<String, RunSlot>>,
    partition: PartitionName,
    run_id: u64,
    override_existing: bool,
    config: serde_json::Value,
}

impl<S: LogStore, E: Engine> RunTask<S, E> {
    async fn drive(self, prior: Option<JoinHandle<()>>) {
        if let Some(prior) = prior {
            if let Err(err) = prior.await {
                if !err.is_cancelled() {
                    tracing::warn!(experiment = %self.partition, error = %err, "Previous run ended abnormally");
                }
            }
        }

        let name = self.partition.as_str();
        if let Err(err) = self.registry.transition(name, self.run_id, Transition::Start) {
            tracing::warn!(experiment = %self.partition, error = %err, "Run not started");
            self.release();
            return;
        }
        tracing::info!(experiment = %self.partition, run_id = self.run_id, "Experiment running");

        let outcome = self.execute().await;
        let transition = match outcome {
            Ok(()) => Transition::Complete,
            Err(message) => Transition::Fail(message),
        };

        match self.registry.transition(name, self.run_id, transition) {
            Ok(experiment) => match experiment.error() {
                None => tracing::info!(experiment = %self.partition, "Experiment completed"),
                Some(error) => {
                    tracing::error!(experiment = %self.partition, error = %error, "Experiment failed");
                }
            },
            Err(err) => {
                tracing::error!(experiment = %self.partition, error = %err, "Could not record outcome");
            }
        }
        self.release();
    }

    async fn execute(&self) -> std::result::Result<(), String> {
        if self.override_existing {
            self.store
                .drop_partition(&self.partition)
                .await
                .map_err(|err| format!("failed to clear previous logs: {err}"))?;
        }

        let ctx = EngineContext {
            partition: self.partition.clone(),
            config: self.config.clone(),
            override_existing: self.override_existing,
            writer: PartitionWriter::new(Arc::clone(&self.store), self.partition.clone()),
        };
        match AssertUnwindSafe(self.engine.run(ctx)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(non_empty(format!("{err:#}"))),
            Err(panic) => Err(non_empty(panic_message(panic.as_ref()))),
        }
    }

    fn release(&self) {
        let run_id = self.run_id;
        self.tasks
            .remove_if(self.partition.as_str(), |_, slot| slot.run_id == run_id);
    }
}

fn non_empty(message: String) -> String {
    if message.trim().is_empty() {
        "engine failed without a message".to_string()
    } else {
        message
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("engine panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("engine panicked: {s}")
    } else {
        "engine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::ExperimentStatus;
    use crate::logs::MemoryLogStore;
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Engine writing `lines` entries, then optionally waiting for a gate and failing.
    #[derive(Default)]
    struct ScriptedEngine {
        lines: usize,
        fail_with: Option<String>,
        panic: bool,
        gate: Option<Arc<Notify>>,
    }

    impl Engine for ScriptedEngine {
        async fn run<S: LogStore>(&self, ctx: EngineContext<S>) -> anyhow::Result<()> {
            for i in 0..self.lines {
                ctx.writer.info(format!("step {i}")).await?;
            }
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            assert!(!self.panic, "agent crashed");
            match &self.fail_with {
                Some(message) => anyhow::bail!("{message}"),
                None => Ok(()),
            }
        }
    }

    fn runner(engine: ScriptedEngine) -> (LifecycleRunner<MemoryLogStore, ScriptedEngine>, Arc<ExperimentRegistry>, Arc<MemoryLogStore>) {
        let registry = Arc::new(ExperimentRegistry::new());
        let store = Arc::new(MemoryLogStore::new());
        let runner = LifecycleRunner::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::new(engine),
            "experiment",
        );
        (runner, registry, store)
    }

    async fn wait_terminal(registry: &ExperimentRegistry, name: &str) -> Experiment {
        for _ in 0..500 {
            if let Some(exp) = registry.get(name) {
                if exp.is_terminal() {
                    return exp;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("experiment {name} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_launch_returns_pending_then_completes() {
        let (runner, registry, store) = runner(ScriptedEngine {
            lines: 3,
            ..ScriptedEngine::default()
        });

        let exp = runner.launch(LaunchRequest::named("exp_a")).await.unwrap();
        assert_eq!(exp.status(), ExperimentStatus::Pending);

        let done = wait_terminal(&registry, "exp_a").await;
        assert_eq!(done.status(), ExperimentStatus::Completed);
        assert!(done.started_at().is_some());
        assert!(done.error().is_none());
        assert_eq!(store.count(&PartitionName::new("exp_a").unwrap()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_engine_error_captured() {
        let (runner, registry, _) = runner(ScriptedEngine {
            lines: 1,
            fail_with: Some("market collapsed".into()),
            ..ScriptedEngine::default()
        });

        runner.launch(LaunchRequest::named("exp_b")).await.unwrap();
        let done = wait_terminal(&registry, "exp_b").await;
        assert_eq!(done.status(), ExperimentStatus::Failed);
        assert!(done.error().unwrap().contains("market collapsed"));
    }

    #[tokio::test]
    async fn test_engine_panic_captured() {
        let (runner, registry, _) = runner(ScriptedEngine {
            panic: true,
            ..ScriptedEngine::default()
        });

        runner.launch(LaunchRequest::named("exp_panic")).await.unwrap();
        let done = wait_terminal(&registry, "exp_panic").await;
        assert_eq!(done.status(), ExperimentStatus::Failed);
        assert!(done.error().unwrap().contains("agent crashed"));
    }

    #[tokio::test]
    async fn test_generated_name() {
        let (runner, registry, _) = runner(ScriptedEngine::default());
        let exp = runner.launch(LaunchRequest::default()).await.unwrap();
        assert!(exp.name().starts_with("experiment_"));
        assert!(crate::validate::validate_schema_name(exp.name()));
        wait_terminal(&registry, exp.name()).await;
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_before_registry() {
        let (runner, registry, _) = runner(ScriptedEngine::default());
        let err = runner
            .launch(LaunchRequest::named("drop table;"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidName(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_override() {
        let gate = Arc::new(Notify::new());
        let (runner, registry, store) = runner(ScriptedEngine {
            lines: 2,
            gate: Some(Arc::clone(&gate)),
            ..ScriptedEngine::default()
        });

        runner.launch(LaunchRequest::named("exp_a")).await.unwrap();
        let err = runner.launch(LaunchRequest::named("exp_a")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRun(_)));

        let second = runner
            .launch(LaunchRequest::named("exp_a").with_override(true))
            .await
            .unwrap();
        assert_eq!(second.status(), ExperimentStatus::Pending);

        // Wait for the replacement run to reach its gate, then release it.
        let partition = PartitionName::new("exp_a").unwrap();
        for _ in 0..500 {
            if registry.get("exp_a").unwrap().status() == ExperimentStatus::Running
                && store.count(&partition).await.unwrap() == 2
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        gate.notify_one();

        let done = wait_terminal(&registry, "exp_a").await;
        assert_eq!(done.run_id(), second.run_id());
        assert_eq!(done.status(), ExperimentStatus::Completed);
        // Previous run's lines were cleared before the new run wrote its own.
        assert_eq!(store.count(&partition).await.unwrap(), 2);
        assert!(!runner.has_task("exp_a"));
    }

    #[tokio::test]
    async fn test_stored_partition_blocks_relaunch() {
        let (runner, registry, _) = runner(ScriptedEngine {
            lines: 1,
            ..ScriptedEngine::default()
        });
        runner.launch(LaunchRequest::named("exp_a")).await.unwrap();
        wait_terminal(&registry, "exp_a").await;

        let err = runner.launch(LaunchRequest::named("exp_a")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateRun(_)));
        assert!(runner
            .launch(LaunchRequest::named("exp_a").with_override(true))
            .await
            .is_ok());
    }

    #[test]
    fn test_launch_request_wire_shape() {
        let req: LaunchRequest =
            serde_json::from_str(r#"{"experiment_name":"exp_a","override":true}"#).unwrap();
        assert_eq!(req.experiment_name.as_deref(), Some("exp_a"));
        assert!(req.override_existing);
        assert!(req.config.is_null());
    }
}
