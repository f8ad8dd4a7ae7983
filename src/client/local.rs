//! In-process transport: a client attached directly to an [`Orchestrator`].

use tokio::sync::mpsc;

use super::{LogQuery, StatusSource, StreamConnector};
use crate::experiment::Experiment;
use crate::logs::{Cursor, LogPage, LogStore};
use crate::orchestrator::Orchestrator;
use crate::runner::Engine;
use crate::stream::StreamMessage;
use crate::Result;

impl<S: LogStore, E: Engine> StreamConnector for Orchestrator<S, E> {
    async fn connect(
        &self,
        name: &str,
        since: Option<Cursor>,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        self.subscribe(name, since)
    }
}

impl<S: LogStore, E: Engine> StatusSource for Orchestrator<S, E> {
    async fn status(&self, name: &str) -> Result<Experiment> {
        Orchestrator::status(self, name)
    }
}

impl<S: LogStore, E: Engine> LogQuery for Orchestrator<S, E> {
    async fn logs(&self, name: &str, since: Option<Cursor>, limit: usize) -> Result<LogPage> {
        Orchestrator::logs(self, name, since, Some(limit)).await
    }
}
