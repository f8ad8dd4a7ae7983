//! Resilient Client - observer side of a stream subscription
//!
//! The client keeps one stream subscription alive across transport failures:
//!
//! ```text
//! Connecting --ok--> Open --terminal status / close()--> Closed
//!     ^                |
//!     |            dropped
//!     |                v
//!     +--delay---- Backoff --budget spent--> Exhausted
//! ```
//!
//! Every reconnect carries the cursor of the last delivered entry, and the
//! client additionally drops any entry at or before that cursor, so a resumed
//! subscription never repeats a log line. A separate task polls the discrete
//! status query on a fixed interval as a redundant path for status changes.
//! While the stream is backing off or exhausted, the same task also pages the
//! discrete log query from the shared cursor, so logs keep flowing without a
//! live subscription.
//!
//! Two transports ship with the crate: an [`Orchestrator`](crate::orchestrator::Orchestrator)
//! in the same process, and `HttpTransport` for a remote server (feature
//! `client`).

mod backoff;
#[cfg(feature = "client")]
mod http;
mod local;

pub use backoff::ReconnectPolicy;
#[cfg(feature = "client")]
pub use http::HttpTransport;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ClientConfig;
use crate::experiment::{Experiment, ExperimentStatus};
use crate::logs::{Cursor, LogEntry, LogPage};
use crate::stream::StreamMessage;
use crate::Result;

const EVENT_CAPACITY: usize = 256;

/// Page size for the polling fallback.
const FALLBACK_PAGE_LIMIT: usize = 100;

/// Opens stream subscriptions.
pub trait StreamConnector: Send + Sync + 'static {
    /// Subscribe to `name` starting strictly after `since`.
    ///
    /// The subscription ends when the returned receiver yields `None`.
    fn connect(
        &self,
        name: &str,
        since: Option<Cursor>,
    ) -> impl Future<Output = Result<mpsc::Receiver<StreamMessage>>> + Send;
}

/// Answers discrete status queries.
pub trait StatusSource: Send + Sync + 'static {
    /// Current snapshot of `name`.
    fn status(&self, name: &str) -> impl Future<Output = Result<Experiment>> + Send;
}

/// Answers discrete log queries.
pub trait LogQuery: Send + Sync + 'static {
    /// Up to `limit` entries of `name` strictly after `since`, oldest first.
    fn logs(
        &self,
        name: &str,
        since: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<LogPage>> + Send;
}

/// Where a status observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOrigin {
    /// Pushed by the stream session
    Stream,
    /// Observed by the redundant status poller
    Poll,
}

/// Events surfaced to the observer.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A subscription was established.
    Connected,
    /// A new log entry, never at or before a previously delivered one.
    Log(LogEntry),
    /// A status observation.
    Status {
        /// Observed status
        status: ExperimentStatus,
        /// Observation path
        origin: StatusOrigin,
    },
    /// A transient error reported by the server or the transport.
    Error(String),
    /// The subscription ended unexpectedly.
    Disconnected,
    /// A reconnect is scheduled.
    Reconnecting {
        /// 1-indexed attempt number
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// Reconnect budget spent; manual intervention required.
    Exhausted {
        /// Failed attempts
        attempts: u32,
        /// Last error observed
        message: String,
    },
    /// The client stopped (terminal status or deliberate close).
    Closed,
}

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Opening a subscription
    Connecting,
    /// Receiving messages
    Open,
    /// Waiting before a reconnect attempt
    Backoff,
    /// Stopped normally
    Closed,
    /// Gave up after repeated failures
    Exhausted,
}

impl ClientState {
    /// `Closed` or `Exhausted`.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Closed | Self::Exhausted)
    }
}

/// Builder for client subscriptions over a transport.
pub struct ResilientClient<T> {
    transport: Arc<T>,
    policy: ReconnectPolicy,
    status_poll_interval: Option<Duration>,
}

impl<T> Clone for ResilientClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            status_poll_interval: self.status_poll_interval,
        }
    }
}

impl<T: StreamConnector + StatusSource + LogQuery> ResilientClient<T> {
    /// Client with the default policy and a 2 second status poll.
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self::from_config(transport, &ClientConfig::default())
    }

    /// Client configured from `config`.
    #[must_use]
    pub fn from_config(transport: Arc<T>, config: &ClientConfig) -> Self {
        Self {
            transport,
            policy: ReconnectPolicy::from_config(config),
            status_poll_interval: Some(config.status_poll_interval()),
        }
    }

    /// Replace the reconnect policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set or disable (`None`) the redundant status poll.
    ///
    /// The polling fallback for logs rides on the same task, so disabling
    /// the poll also disables it.
    #[must_use]
    pub const fn with_status_poll(mut self, interval: Option<Duration>) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Start observing `name`, resuming after `since` if given.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn subscribe(&self, name: impl Into<String>, since: Option<Cursor>) -> ClientHandle {
        let name = name.into();
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let (state_tx, state) = watch::channel(ClientState::Connecting);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let delivery = Arc::new(Delivery::new(since, events_tx));

        let poll_task = self.status_poll_interval.map(|interval| {
            let poller = Poller {
                transport: Arc::clone(&self.transport),
                name: name.clone(),
                delivery: Arc::clone(&delivery),
                state: state.clone(),
                shutdown: shutdown_rx.clone(),
            };
            tokio::spawn(poller.run(interval))
        });

        let stream = StreamLoop {
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            name,
            delivery,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        let stream_task = tokio::spawn(stream.run());

        ClientHandle {
            events,
            state,
            shutdown,
            stream_task,
            poll_task,
        }
    }
}

/// Live subscription. Dropping it stops every background task.
pub struct ClientHandle {
    events: mpsc::Receiver<ClientEvent>,
    state: watch::Receiver<ClientState>,
    shutdown: watch::Sender<bool>,
    stream_task: JoinHandle<()>,
    poll_task: Option<JoinHandle<()>>,
}

impl ClientHandle {
    /// Next event, `None` once both background tasks have stopped.
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    /// Deliberately close: no reconnect follows.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.stream_task.abort();
        if let Some(task) = &self.poll_task {
            task.abort();
        }
    }
}

/// Cursor and event channel shared by the stream loop and the poller.
///
/// Every log goes through [`Delivery::log`], which checks and advances the
/// cursor under one lock, so the two paths can never interleave a duplicate
/// or an out-of-order entry.
struct Delivery {
    cursor: Mutex<Option<Cursor>>,
    events: mpsc::Sender<ClientEvent>,
}

impl Delivery {
    fn new(since: Option<Cursor>, events: mpsc::Sender<ClientEvent>) -> Self {
        Self {
            cursor: Mutex::new(since),
            events,
        }
    }

    async fn cursor(&self) -> Option<Cursor> {
        *self.cursor.lock().await
    }

    /// Deliver `log` unless it lies at or before the cursor. Returns `false`
    /// once the observer is gone.
    async fn log(&self, log: LogEntry) -> bool {
        let mut cursor = self.cursor.lock().await;
        if !log.is_after(*cursor) {
            return true;
        }
        let next = log.cursor();
        if self.events.send(ClientEvent::Log(log)).await.is_err() {
            return false;
        }
        *cursor = Some(next);
        true
    }

    async fn emit(&self, event: ClientEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

enum SessionEnd {
    Closed,
    Terminal,
    Dropped { productive: bool },
}

struct StreamLoop<T> {
    transport: Arc<T>,
    policy: ReconnectPolicy,
    name: String,
    delivery: Arc<Delivery>,
    state: watch::Sender<ClientState>,
    shutdown: watch::Receiver<bool>,
}

impl<T: StreamConnector> StreamLoop<T> {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut last_error = String::from("connection lost");

        loop {
            self.set_state(ClientState::Connecting);
            let cursor = self.delivery.cursor().await;
            match self.transport.connect(&self.name, cursor).await {
                Ok(rx) => {
                    tracing::debug!(experiment = %self.name, ?cursor, "Client connected");
                    self.set_state(ClientState::Open);
                    if !self.emit(ClientEvent::Connected).await {
                        return;
                    }
                    match self.pump(rx, &mut last_error).await {
                        SessionEnd::Closed | SessionEnd::Terminal => {
                            self.finish(ClientState::Closed, ClientEvent::Closed).await;
                            return;
                        }
                        SessionEnd::Dropped { productive } => {
                            if productive {
                                failures = 0;
                            }
                            if !self.emit(ClientEvent::Disconnected).await {
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    tracing::debug!(experiment = %self.name, error = %err, "Client connect failed");
                    if !self.emit(ClientEvent::Error(last_error.clone())).await {
                        return;
                    }
                }
            }

            if self.stopping() {
                self.finish(ClientState::Closed, ClientEvent::Closed).await;
                return;
            }

            if self.policy.is_exhausted(failures) {
                tracing::error!(
                    experiment = %self.name,
                    attempts = failures,
                    error = %last_error,
                    "Reconnect budget exhausted"
                );
                self.finish(
                    ClientState::Exhausted,
                    ClientEvent::Exhausted {
                        attempts: failures,
                        message: last_error,
                    },
                )
                .await;
                return;
            }

            failures += 1;
            let delay = self.policy.delay_for(failures).unwrap_or(self.policy.cap);

            tracing::warn!(experiment = %self.name, attempt = failures, ?delay, "Reconnecting");
            self.set_state(ClientState::Backoff);
            if !self
                .emit(ClientEvent::Reconnecting {
                    attempt: failures,
                    delay,
                })
                .await
            {
                return;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    self.finish(ClientState::Closed, ClientEvent::Closed).await;
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forward one subscription's messages until it ends.
    ///
    /// A subscription is productive once it delivered a log or status; only
    /// productive subscriptions reset the failure count, so a server that
    /// accepts and immediately closes still exhausts the budget.
    async fn pump(
        &mut self,
        mut rx: mpsc::Receiver<StreamMessage>,
        last_error: &mut String,
    ) -> SessionEnd {
        let mut productive = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return SessionEnd::Closed,
                message = rx.recv() => message,
            };

            let event = match message {
                None => return SessionEnd::Dropped { productive },
                Some(StreamMessage::Log { log }) => {
                    productive = true;
                    if !self.delivery.log(log).await {
                        return SessionEnd::Closed;
                    }
                    continue;
                }
                Some(StreamMessage::Status { status }) => {
                    productive = true;
                    if status.is_terminal() {
                        let _ = self
                            .emit(ClientEvent::Status {
                                status,
                                origin: StatusOrigin::Stream,
                            })
                            .await;
                        return SessionEnd::Terminal;
                    }
                    ClientEvent::Status {
                        status,
                        origin: StatusOrigin::Stream,
                    }
                }
                Some(StreamMessage::Error { error }) => {
                    last_error.clone_from(&error);
                    ClientEvent::Error(error)
                }
            };
            if !self.emit(event).await {
                return SessionEnd::Closed;
            }
        }
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, state: ClientState) {
        let _ = self.state.send(state);
    }

    async fn finish(&self, state: ClientState, event: ClientEvent) {
        self.set_state(state);
        let _ = self.emit(event).await;
    }

    async fn emit(&self, event: ClientEvent) -> bool {
        self.delivery.emit(event).await
    }
}

/// Redundant discrete-query path: status changes always, logs while the
/// stream is unavailable.
struct Poller<T> {
    transport: Arc<T>,
    name: String,
    delivery: Arc<Delivery>,
    state: watch::Receiver<ClientState>,
    shutdown: watch::Receiver<bool>,
}

impl<T: StatusSource + LogQuery> Poller<T> {
    async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last: Option<ExperimentStatus> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return,
                () = self.delivery.events.closed() => return,
                _ = ticker.tick() => {}
            }

            // Status first: every entry written before a terminal status is
            // then visible to the log page that follows.
            let snapshot = self.transport.status(&self.name).await;

            if self.stream_unavailable() && !self.catch_up().await {
                return;
            }

            match snapshot {
                Ok(experiment) => {
                    let status = experiment.status();
                    if last != Some(status) {
                        last = Some(status);
                        let event = ClientEvent::Status {
                            status,
                            origin: StatusOrigin::Poll,
                        };
                        if !self.delivery.emit(event).await {
                            return;
                        }
                    }
                    if status.is_terminal() {
                        return;
                    }
                }
                Err(err) => {
                    tracing::debug!(experiment = %self.name, error = %err, "Status poll failed");
                }
            }
        }
    }

    fn stream_unavailable(&self) -> bool {
        matches!(
            *self.state.borrow(),
            ClientState::Backoff | ClientState::Exhausted
        )
    }

    /// Page the discrete log query from the shared cursor until caught up.
    /// Returns `false` once the observer is gone.
    async fn catch_up(&self) -> bool {
        loop {
            let since = self.delivery.cursor().await;
            let page = match self
                .transport
                .logs(&self.name, since, FALLBACK_PAGE_LIMIT)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::debug!(experiment = %self.name, error = %err, "Log poll failed");
                    return true;
                }
            };
            let has_more = page.has_more;
            for log in page.logs {
                if !self.delivery.log(log).await {
                    return false;
                }
            }
            if !has_more || self.delivery.cursor().await == since {
                return true;
            }
        }
    }
}
