//! Network transport: a client attached to a remote labrelay server.
//!
//! Subscriptions use `GET /api/experiments/:name/logs/ws?since=` and the
//! discrete queries use the `status` and `logs` endpoints. The cursor always
//! travels as an RFC 3339 query parameter.

use std::time::Duration;

use futures::StreamExt;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{LogQuery, StatusSource, StreamConnector};
use crate::experiment::Experiment;
use crate::logs::{Cursor, LogPage};
use crate::stream::StreamMessage;
use crate::validate::PartitionName;
use crate::{Error, Result};

const FRAME_CAPACITY: usize = 64;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Client transport for a labrelay server reachable over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base: Url,
    http: reqwest::Client,
}

impl HttpTransport {
    /// Transport for the server at `base`, e.g. `http://127.0.0.1:8080`.
    ///
    /// A base with a path prefix must end in `/`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base` is not an absolute `http` or
    /// `https` URL, or the HTTP client cannot be constructed.
    pub fn new(base: &str) -> Result<Self> {
        let url = Url::parse(base)
            .map_err(|e| Error::Config(format!("invalid server url '{base}': {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "unsupported server url scheme '{}'",
                url.scheme()
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { base: url, http })
    }

    /// Server base URL.
    #[must_use]
    pub const fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, partition: &PartitionName, path: &str) -> Result<Url> {
        self.base
            .join(&format!("api/experiments/{partition}/{path}"))
            .map_err(|e| Error::Config(e.to_string()))
    }

    fn stream_url(&self, partition: &PartitionName, since: Option<Cursor>) -> Result<Url> {
        let mut url = self.endpoint(partition, "logs/ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| Error::Config(format!("cannot derive {scheme} url from {url}")))?;
        if let Some(since) = since {
            url.query_pairs_mut()
                .append_pair("since", &since.to_string());
        }
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, partition: &PartitionName, url: Url) -> Result<T> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| Error::Transport(e.to_string()));
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map_or_else(|_| status.to_string(), |body| body.message);
        Err(match status {
            StatusCode::NOT_FOUND => Error::NotFound(partition.to_string()),
            StatusCode::BAD_REQUEST => Error::InvalidRequest(message),
            _ => Error::Transport(format!("{status}: {message}")),
        })
    }
}

impl StreamConnector for HttpTransport {
    async fn connect(
        &self,
        name: &str,
        since: Option<Cursor>,
    ) -> Result<mpsc::Receiver<StreamMessage>> {
        let partition = PartitionName::new(name)?;
        let url = self.stream_url(&partition, since)?;
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        tracing::debug!(experiment = %partition, %url, "Stream socket open");

        let (tx, rx) = mpsc::channel(FRAME_CAPACITY);
        tokio::spawn(read_frames(socket, tx));
        Ok(rx)
    }
}

impl StatusSource for HttpTransport {
    async fn status(&self, name: &str) -> Result<Experiment> {
        let partition = PartitionName::new(name)?;
        let url = self.endpoint(&partition, "status")?;
        self.get(&partition, url).await
    }
}

impl LogQuery for HttpTransport {
    async fn logs(&self, name: &str, since: Option<Cursor>, limit: usize) -> Result<LogPage> {
        let partition = PartitionName::new(name)?;
        let mut url = self.endpoint(&partition, "logs")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(since) = since {
                query.append_pair("since", &since.to_string());
            }
            query.append_pair("limit", &limit.to_string());
        }
        self.get(&partition, url).await
    }
}

/// Decode text frames into stream messages until the server closes, the
/// socket fails, or the subscriber drops its receiver.
async fn read_frames(mut socket: Socket, tx: mpsc::Sender<StreamMessage>) {
    loop {
        let frame = tokio::select! {
            () = tx.closed() => break,
            frame = socket.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<StreamMessage>(&text) {
                Ok(message) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(error = %err, "Ignoring malformed stream frame"),
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::debug!(error = %err, "Stream socket failed");
                break;
            }
        }
    }
    let _ = socket.close(None).await;
}
