//! Session wiring
//!
//! Connects the push channel and the pull channel to one aggregator task and
//! hands the caller a [`SessionHandle`] for commands and snapshots.

use crate::integration::aggregator::{SessionAggregator, SessionEvent, SessionSnapshot};
use crate::integration::config::PanelConfig;
use crate::messages::{HistoryStore, JsonFileStore, MemoryStore};
use crate::render::AvatarRenderer;
use crate::stream::{PullChannel, RequestStream};
use crate::transport::TransportChannel;
use crate::{PanelError, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::info;

/// Handle for driving the session from the UI
#[derive(Clone)]
pub struct SessionHandle {
    inbox: mpsc::UnboundedSender<SessionEvent>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    fn send(&self, event: SessionEvent) -> Result<()> {
        self.inbox
            .send(event)
            .map_err(|e| PanelError::ChannelError(format!("Session is gone: {}", e)))
    }

    /// Submit a typed message
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(SessionEvent::SubmitText(text.into()))
    }

    /// Stop the typed turn in flight
    pub fn stop(&self) -> Result<()> {
        self.send(SessionEvent::Stop)
    }

    pub fn clear_history(&self) -> Result<()> {
        self.send(SessionEvent::ClearHistory)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(SessionEvent::Shutdown)
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that is notified on every change
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }
}

/// A wired session, ready to start
pub struct Session {
    aggregator: SessionAggregator,
    inbox: mpsc::UnboundedReceiver<SessionEvent>,
    transport: TransportChannel,
}

impl Session {
    /// The push connection this session listens to
    pub fn transport(&self) -> &TransportChannel {
        &self.transport
    }

    /// Open the push connection and spawn the aggregator task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> JoinHandle<()> {
        info!("Connecting to {}", self.transport.url());
        self.transport.connect();
        tokio::spawn(self.aggregator.run(self.inbox))
    }
}

/// Builder for creating a session
pub struct SessionBuilder {
    config: PanelConfig,
    renderer: Option<Arc<dyn AvatarRenderer>>,
    store: Option<Arc<dyn HistoryStore>>,
    pull: Option<Box<dyn PullChannel>>,
}

impl SessionBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: PanelConfig::default(),
            renderer: None,
            store: None,
            pull: None,
        }
    }

    /// Set the complete configuration
    pub fn with_config(mut self, config: PanelConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the backend base URL
    pub fn with_server(mut self, base_url: impl Into<String>) -> Self {
        self.config = self.config.with_server(base_url);
        self
    }

    /// Set the avatar renderer (required)
    pub fn with_renderer(mut self, renderer: Arc<dyn AvatarRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Replace the history store derived from the configuration
    pub fn with_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the HTTP pull channel
    pub fn with_pull_channel(mut self, pull: Box<dyn PullChannel>) -> Self {
        self.pull = Some(pull);
        self
    }

    /// Build the session
    pub fn build(self) -> Result<(Session, SessionHandle)> {
        let config = self.config;
        config.validate()?;

        let renderer = self
            .renderer
            .ok_or_else(|| PanelError::ConfigError("No avatar renderer configured".to_string()))?;

        let store: Arc<dyn HistoryStore> = match (self.store, &config.history.snapshot_path) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(JsonFileStore::new(path, config.history.max_persisted)),
            (None, None) => Arc::new(MemoryStore::new(config.history.max_persisted)),
        };

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();

        let transport = TransportChannel::new(config.transport_config());
        let push_tx = inbox_tx.clone();
        let subscription = transport.subscribe(move |message| {
            let _ = push_tx.send(SessionEvent::Push {
                message: message.clone(),
                received_at: Instant::now(),
            });
        });

        let pull = match self.pull {
            Some(pull) => pull,
            None => {
                let pull_tx = inbox_tx.clone();
                Box::new(RequestStream::new(
                    config.request_stream_config(),
                    move |event| {
                        let _ = pull_tx.send(SessionEvent::Pull(event));
                    },
                ))
            }
        };

        let aggregator = SessionAggregator::new(&config, pull, renderer, store)
            .with_transport(transport.clone(), subscription);

        let handle = SessionHandle {
            inbox: inbox_tx,
            snapshots: aggregator.snapshots(),
        };

        Ok((
            Session {
                aggregator,
                inbox: inbox_rx,
                transport,
            },
            handle,
        ))
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
