//! Persistent push connection to the backend
//!
//! One WebSocket, reconnected with bounded exponential backoff, fanning
//! every parsed inbound message out to all current subscribers.

use crate::transport::backoff::Backoff;
use crate::transport::protocol::PushMessage;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Handler = Arc<dyn Fn(&PushMessage) + Send + Sync>;

/// Lifecycle of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// `connect()` has never been called
    Idle,
    /// A connection attempt is in flight
    Connecting,
    /// Connected; inbound frames are being fanned out
    Open,
    /// Disconnected, waiting for the next reconnect attempt
    ClosedRetrying,
    /// Retry budget spent or shut down; only an explicit `connect()` restarts
    ClosedPermanently,
}

/// Transport settings
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// WebSocket URL, e.g. `ws://127.0.0.1:8000/ws/live2d`
    pub url: String,
    /// Delay before the first reconnect attempt; doubled on each retry
    pub base_delay: Duration,
    /// Reconnect attempts allowed between two successful opens
    pub max_retries: u32,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000/ws/live2d".to_string(),
            base_delay: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

struct Shared {
    config: TransportConfig,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Vec<(u64, Handler)>>,
    next_subscriber: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    attempts: AtomicU32,
    shutdown: CancellationToken,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        // Shutdown is terminal
        if self.shutdown.is_cancelled() {
            *state = ConnectionState::ClosedPermanently;
            return;
        }
        if *state != next {
            debug!("Push channel {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn dispatch(&self, frame: &str) {
        let message = match PushMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping malformed push frame: {}", e);
                return;
            }
        };

        // Call handlers outside the lock so they may subscribe/unsubscribe
        let handlers: Vec<Handler> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(&message);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.base_delay, self.config.max_retries);

        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Push channel connect attempt {} to {}", attempt, self.config.url);

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = connect_async(self.config.url.as_str()) => result,
            };

            match result {
                Ok((ws, _)) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Open);
                    info!("Push channel connected to {}", self.config.url);
                    self.run_session(ws).await;
                    info!("Push channel disconnected");
                }
                Err(e) => {
                    warn!("Push channel connect failed: {}", e);
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }

            match backoff.next_delay() {
                Some(delay) => {
                    self.set_state(ConnectionState::ClosedRetrying);
                    info!(
                        "Reconnecting in {}ms (retry {}/{})",
                        delay.as_millis(),
                        backoff.retries(),
                        self.config.max_retries
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    // Return here so a run restarted by connect() keeps its state
                    self.set_state(ConnectionState::ClosedPermanently);
                    warn!("Reconnect limit reached, giving up until connect() is called");
                    return;
                }
            }
        }

        self.set_state(ConnectionState::ClosedPermanently);
    }

    async fn run_session(&self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.outbound.lock() = Some(tx);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.close().await;
                    break;
                }
                outgoing = rx.recv() => {
                    let Some(text) = outgoing else { break };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!("Push channel send failed: {}", e);
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Push channel closed by peer: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Push channel error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }

        *self.outbound.lock() = None;
    }
}

/// Handle returned by [`TransportChannel::subscribe`]
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Stop receiving messages
    pub fn unsubscribe(self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// Persistent, self-healing push connection.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct TransportChannel {
    shared: Arc<Shared>,
}

impl TransportChannel {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(ConnectionState::Idle),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(1),
                outbound: Mutex::new(None),
                attempts: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start connecting. No-op while connecting, open or waiting to retry.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        if self.shared.shutdown.is_cancelled() {
            warn!("connect() called on a shut down push channel");
            return;
        }

        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::ClosedRetrying => return,
                ConnectionState::Idle | ConnectionState::ClosedPermanently => {
                    *state = ConnectionState::Connecting;
                }
            }
        }

        tokio::spawn(Arc::clone(&self.shared).run());
    }

    /// Register a handler for every inbound message
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PushMessage) + Send + Sync + 'static,
    {
        let id = self.shared.next_subscriber.fetch_add(1, Ordering::SeqCst);
        if !self.shared.shutdown.is_cancelled() {
            self.shared
                .subscribers
                .lock()
                .push((id, Arc::new(handler)));
        }
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Fire-and-forget send on the current connection.
    ///
    /// Returns `false` when nothing is connected; the text is dropped.
    pub fn send(&self, text: impl Into<String>) -> bool {
        match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.config.url
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Connection attempts made so far, including the first
    pub fn connect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Close the connection for good and drop every subscriber
    pub fn shutdown(&self) {
        info!("Shutting down push channel");
        self.shared.shutdown.cancel();
        self.shared.subscribers.lock().clear();
        *self.shared.outbound.lock() = None;
        *self.shared.state.lock() = ConnectionState::ClosedPermanently;
    }
}
