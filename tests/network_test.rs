//! Real sockets: the router bound on an ephemeral port, observed through a
//! raw WebSocket client and through the HTTP transport.

#![cfg(all(feature = "server", feature = "client"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use labrelay::client::{
    ClientEvent, ClientState, HttpTransport, LogQuery, ResilientClient, StatusOrigin,
    StatusSource, StreamConnector,
};
use labrelay::config::OrchestratorConfig;
use labrelay::experiment::ExperimentStatus;
use labrelay::logs::{LogStore, MemoryLogStore};
use labrelay::orchestrator::Orchestrator;
use labrelay::runner::{Engine, EngineContext, LaunchRequest};
use labrelay::server::router;
use labrelay::stream::StreamMessage;
use labrelay::Error;

struct ScriptedEngine;

impl Engine for ScriptedEngine {
    async fn run<S: LogStore>(&self, ctx: EngineContext<S>) -> anyhow::Result<()> {
        let lines = ctx.config["lines"].as_u64().unwrap_or(3);
        let pause = Duration::from_millis(ctx.config["pause_ms"].as_u64().unwrap_or(0));
        for i in 0..lines {
            ctx.writer.info(format!("line {i}")).await?;
            tokio::time::sleep(pause).await;
        }
        if ctx.config["fail"].as_bool().unwrap_or(false) {
            anyhow::bail!("engine gave up");
        }
        Ok(())
    }
}

type TestOrchestrator = Orchestrator<MemoryLogStore, ScriptedEngine>;

async fn serve() -> (Arc<TestOrchestrator>, SocketAddr) {
    let mut config = OrchestratorConfig::default();
    config.stream.poll_interval_ms = 20;
    let orch = Arc::new(Orchestrator::new(
        config,
        Arc::new(MemoryLogStore::new()),
        Arc::new(ScriptedEngine),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(Arc::clone(&orch));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (orch, addr)
}

async fn wait_terminal(orch: &TestOrchestrator, name: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !orch.status(name).unwrap().is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

async fn wait_sessions_drained(orch: &TestOrchestrator) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orch.active_sessions() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("server-side session stops after the observer leaves");
}

fn ws_url(addr: SocketAddr, name: &str) -> String {
    format!("ws://{addr}/api/experiments/{name}/logs/ws")
}

// ============================================================================
// Raw socket
// ============================================================================

#[tokio::test]
async fn test_socket_delivers_logs_one_terminal_status_then_close() {
    let (orch, addr) = serve().await;
    orch.launch(
        LaunchRequest::named("exp_net").with_config(json!({"lines": 4, "pause_ms": 10, "fail": true})),
    )
    .await
    .unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(addr, "exp_net"))
        .await
        .unwrap();

    let mut frames: Vec<Value> = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(frame) = socket.next().await {
            match frame.unwrap() {
                Message::Text(text) => frames.push(serde_json::from_str(&text).unwrap()),
                Message::Close(_) => return true,
                _ => {}
            }
        }
        false
    })
    .await
    .unwrap();
    assert!(closed, "server ends the stream with a close frame");

    let lines: Vec<&str> = frames
        .iter()
        .filter(|f| f["type"] == "log")
        .filter_map(|f| f["log"]["message"].as_str())
        .collect();
    assert_eq!(lines, vec!["line 0", "line 1", "line 2", "line 3"]);

    let terminal: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "status" && matches!(f["status"].as_str(), Some("completed" | "failed")))
        .collect();
    assert_eq!(terminal, vec![&json!({"type": "status", "status": "failed"})]);
    assert_eq!(frames.last(), Some(terminal[0]));
}

#[tokio::test]
async fn test_socket_close_stops_server_session() {
    let (orch, addr) = serve().await;
    orch.launch(
        LaunchRequest::named("exp_leave").with_config(json!({"lines": 200, "pause_ms": 20})),
    )
    .await
    .unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(addr, "exp_leave"))
        .await
        .unwrap();
    let first = socket.next().await.unwrap().unwrap();
    assert!(matches!(first, Message::Text(_)));
    assert_eq!(orch.active_sessions(), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    wait_sessions_drained(&orch).await;
    assert!(!orch.status("exp_leave").unwrap().is_terminal());
}

#[tokio::test]
async fn test_dropped_socket_stops_server_session() {
    let (orch, addr) = serve().await;
    orch.launch(
        LaunchRequest::named("exp_vanish").with_config(json!({"lines": 200, "pause_ms": 20})),
    )
    .await
    .unwrap();

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url(addr, "exp_vanish"))
        .await
        .unwrap();
    socket.next().await.unwrap().unwrap();
    drop(socket);

    wait_sessions_drained(&orch).await;
    assert!(!orch.status("exp_vanish").unwrap().is_terminal());
}

// ============================================================================
// HTTP transport
// ============================================================================

fn transport(addr: SocketAddr) -> Arc<HttpTransport> {
    Arc::new(HttpTransport::new(&format!("http://{addr}")).unwrap())
}

#[tokio::test]
async fn test_resilient_client_over_network() {
    let (orch, addr) = serve().await;
    orch.launch(
        LaunchRequest::named("exp_remote").with_config(json!({"lines": 5, "pause_ms": 10})),
    )
    .await
    .unwrap();

    let mut handle = ResilientClient::new(transport(addr))
        .with_status_poll(Some(Duration::from_millis(50)))
        .subscribe("exp_remote", None);

    let events = tokio::time::timeout(Duration::from_secs(10), async {
        let mut events = Vec::new();
        while let Some(event) = handle.next_event().await {
            events.push(event);
        }
        events
    })
    .await
    .unwrap();

    let lines: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ClientEvent::Log(entry) => entry.message().map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(lines, (0..5).map(|i| format!("line {i}")).collect::<Vec<_>>());
    assert!(events.contains(&ClientEvent::Status {
        status: ExperimentStatus::Completed,
        origin: StatusOrigin::Stream
    }));
    assert!(events.contains(&ClientEvent::Closed));
    assert_eq!(handle.state(), ClientState::Closed);
}

#[tokio::test]
async fn test_transport_resumes_after_cursor() {
    let (orch, addr) = serve().await;
    orch.launch(LaunchRequest::named("exp_resume").with_config(json!({"lines": 4})))
        .await
        .unwrap();
    wait_terminal(&orch, "exp_resume").await;

    let transport = transport(addr);
    let page = transport.logs("exp_resume", None, 2).await.unwrap();
    assert_eq!(page.logs.len(), 2);
    assert_eq!(page.total, 4);
    assert!(page.has_more);

    let since = page.logs[1].cursor();
    let mut rx = transport.connect("exp_resume", Some(since)).await.unwrap();
    let mut messages = Vec::new();
    while let Some(message) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
    {
        messages.push(message);
    }

    let lines: Vec<_> = messages
        .iter()
        .filter_map(|m| match m {
            StreamMessage::Log { log } => log.message(),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["line 2", "line 3"]);
    assert_eq!(
        messages.last(),
        Some(&StreamMessage::Status {
            status: ExperimentStatus::Completed
        })
    );
    assert_eq!(
        transport.logs("exp_resume", Some(since), 100).await.unwrap().logs.len(),
        2
    );
}

#[tokio::test]
async fn test_transport_status_and_errors() {
    let (orch, addr) = serve().await;
    orch.launch(LaunchRequest::named("exp_status").with_config(json!({"lines": 1})))
        .await
        .unwrap();
    wait_terminal(&orch, "exp_status").await;

    let transport = transport(addr);
    let experiment = transport.status("EXP_Status").await.unwrap();
    assert_eq!(experiment.name(), "exp_status");
    assert_eq!(experiment.status(), ExperimentStatus::Completed);

    assert!(matches!(
        transport.status("exp_missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        transport.logs("exp_missing", None, 10).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        transport.status("a;b").await,
        Err(Error::InvalidName(_))
    ));

    let refused = HttpTransport::new("http://127.0.0.1:1").unwrap();
    let err = refused.status("exp_status").await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(err.is_transient());
}
