//! Chunked request/response exchange for typed-text turns
//!
//! One POST per turn; the response body is raw incremental text that ends
//! when the server closes the connection. A sibling stop endpoint asks the
//! backend to abandon generation.

use crate::stream::decoder::Utf8Decoder;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifies one request/response exchange
pub type StreamId = Uuid;

/// One prior or new turn sent as context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Request body for the streaming chat endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatTurn>,
}

/// What a stream produced
#[derive(Debug, Clone, PartialEq)]
pub enum PullEventKind {
    /// Non-empty text; `first` is set on the first fragment of the exchange only
    Fragment { text: String, first: bool },
    Completed,
    /// Cancelled locally; not an error
    Aborted,
    Failed(String),
}

impl PullEventKind {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PullEventKind::Fragment { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullEvent {
    pub stream: StreamId,
    pub kind: PullEventKind,
}

/// Endpoints used by [`RequestStream`]
#[derive(Debug, Clone)]
pub struct RequestStreamConfig {
    pub stream_url: String,
    pub stop_url: String,
}

impl Default for RequestStreamConfig {
    fn default() -> Self {
        Self {
            stream_url: "http://127.0.0.1:8000/api/chat/stream".to_string(),
            stop_url: "http://127.0.0.1:8000/api/chat/stop".to_string(),
        }
    }
}

/// Something that can run one pull exchange per turn.
///
/// Events for the exchange are delivered out of band, tagged with the
/// returned id.
pub trait PullChannel: Send {
    /// Start a new exchange, cancelling any active one
    fn start(&mut self, request: ChatRequest) -> StreamId;

    /// Cancel the active exchange and signal the backend to stop
    fn cancel(&mut self);
}

#[derive(Clone)]
struct StopSignal {
    client: reqwest::Client,
    url: String,
}

impl StopSignal {
    fn send(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime for stop signal, skipping");
            return;
        };
        let client = self.client.clone();
        let url = self.url.clone();
        runtime.spawn(async move {
            if let Err(e) = client.post(&url).send().await {
                debug!("Stop signal failed (ignored): {}", e);
            }
        });
    }
}

/// Handle to one in-flight exchange
#[derive(Clone)]
pub struct StreamHandle {
    id: StreamId,
    token: CancellationToken,
    stop: StopSignal,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Halt fragment delivery and ask the backend to stop generating
    pub fn cancel(&self) {
        self.abort();
        self.stop.send();
    }

    /// Halt fragment delivery without contacting the backend
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

type PullSink = Arc<dyn Fn(PullEvent) + Send + Sync>;

/// Issues streaming chat requests, at most one active at a time
pub struct RequestStream {
    client: reqwest::Client,
    config: RequestStreamConfig,
    sink: PullSink,
    active: Option<StreamHandle>,
}

impl RequestStream {
    /// Create a request stream that reports every event to `sink`
    pub fn new<F>(config: RequestStreamConfig, sink: F) -> Self
    where
        F: Fn(PullEvent) + Send + Sync + 'static,
    {
        Self {
            client: reqwest::Client::new(),
            config,
            sink: Arc::new(sink),
            active: None,
        }
    }

    /// Start a new exchange. A previous one is aborted and reports `Aborted`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_stream(&mut self, request: ChatRequest) -> StreamHandle {
        if let Some(previous) = self.active.take() {
            debug!("Aborting superseded stream {}", previous.id());
            previous.abort();
        }

        let handle = StreamHandle {
            id: Uuid::new_v4(),
            token: CancellationToken::new(),
            stop: StopSignal {
                client: self.client.clone(),
                url: self.config.stop_url.clone(),
            },
        };

        info!("Starting chat stream {}", handle.id);
        tokio::spawn(run_exchange(
            self.client.clone(),
            self.config.stream_url.clone(),
            request,
            handle.id,
            handle.token.clone(),
            Arc::clone(&self.sink),
        ));

        self.active = Some(handle.clone());
        handle
    }
}

impl PullChannel for RequestStream {
    fn start(&mut self, request: ChatRequest) -> StreamId {
        self.start_stream(request).id()
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.active.take() {
            info!("Cancelling chat stream {}", handle.id());
            handle.cancel();
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

fn failure_reason(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail)
        .map(|d| match d {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });
    match detail {
        Some(detail) => format!("{} ({})", detail, status.as_u16()),
        None => status
            .canonical_reason()
            .map(|r| format!("{} ({})", r, status.as_u16()))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16())),
    }
}

async fn run_exchange(
    client: reqwest::Client,
    url: String,
    request: ChatRequest,
    id: StreamId,
    token: CancellationToken,
    sink: PullSink,
) {
    let emit = |kind: PullEventKind| sink(PullEvent { stream: id, kind });

    let response = tokio::select! {
        biased;
        _ = token.cancelled() => {
            emit(PullEventKind::Aborted);
            return;
        }
        response = client.post(&url).json(&request).send() => response,
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            warn!("Chat stream {} request failed: {}", id, e);
            emit(PullEventKind::Failed(format!("network error: {}", e)));
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            _ = token.cancelled() => {
                emit(PullEventKind::Aborted);
                return;
            }
            body = response.text() => body.unwrap_or_default(),
        };
        let reason = failure_reason(status, &body);
        warn!("Chat stream {} rejected: {}", id, reason);
        emit(PullEventKind::Failed(reason));
        return;
    }

    let mut body = response.bytes_stream();
    let mut decoder = Utf8Decoder::new();
    let mut first = true;

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => {
                emit(PullEventKind::Aborted);
                return;
            }
            next = body.next() => next,
        };

        match next {
            Some(Ok(bytes)) => {
                let text = decoder.push(&bytes);
                if text.is_empty() || token.is_cancelled() {
                    continue;
                }
                emit(PullEventKind::Fragment { text, first });
                first = false;
            }
            Some(Err(e)) => {
                warn!("Chat stream {} broke: {}", id, e);
                emit(PullEventKind::Failed(format!("network error: {}", e)));
                return;
            }
            None => {
                let rest = decoder.finish();
                if !rest.is_empty() && !token.is_cancelled() {
                    emit(PullEventKind::Fragment { text: rest, first });
                }
                debug!("Chat stream {} completed", id);
                emit(PullEventKind::Completed);
                return;
            }
        }
    }
}
