//! Session aggregator
//!
//! Sole owner of the conversation log. Push messages, pull stream events and
//! user commands all arrive as [`SessionEvent`]s on one inbox and are applied
//! one at a time. Which channel may write to the in-flight assistant message
//! is decided by a single [`TurnChannel`] tag, checked before every mutation.

use crate::integration::config::PanelConfig;
use crate::messages::{ConversationMessage, HistoryStore, InputModality, MessageId, MessageLog, Role};
use crate::render::{cue_for_emotion, AvatarRenderer, ExpressionCue};
use crate::stream::{ChatRequest, ChatTurn, PullChannel, PullEvent, PullEventKind, StreamId};
use crate::transport::{PushMessage, Subscription, TimedSegment, TransportChannel};
use crate::utils::TurnMetrics;
use crate::viseme::VisemeScheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Which source may append to the in-flight assistant message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnChannel {
    #[default]
    None,
    /// Token chunks from the persistent connection (spoken turns)
    Push,
    /// The chunked HTTP response of a typed turn
    Pull,
}

/// Everything the aggregator reacts to
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Inbound push message, stamped when it was received
    Push {
        message: PushMessage,
        received_at: Instant,
    },

    /// Progress of a pull stream
    Pull(PullEvent),

    /// The user typed a message
    SubmitText(String),

    /// The user pressed stop
    Stop,

    /// Wipe the log and the stored snapshot
    ClearHistory,

    /// Stop the event loop
    Shutdown,
}

/// Latest finalized sentence shown under the avatar
#[derive(Debug, Clone, PartialEq)]
pub struct Subtitle {
    pub text: String,
    pub emotion: String,
}

/// Read-only view published after every event
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub messages: Vec<ConversationMessage>,
    pub turn: TurnChannel,
    pub connected: bool,
    /// Waiting for the first fragment of a typed turn
    pub is_generating: bool,
    pub subtitle: Option<Subtitle>,
    pub motion_group: Option<String>,
    pub expression: Option<String>,
}

const DEFAULT_EMOTION: &str = "平静";

/// Owns the message log and the turn state machine
pub struct SessionAggregator {
    log: MessageLog,
    turn: TurnChannel,
    /// In-flight assistant message, pending or streaming
    active: Option<MessageId>,
    pull_stream: Option<StreamId>,
    /// Cleared by `generation_finished`; token chunks arriving while closed are late
    push_turn_open: bool,
    is_generating: bool,
    subtitle: Option<Subtitle>,
    cue: Option<ExpressionCue>,
    context_messages: usize,
    default_delay_ms: f64,
    dirty: bool,

    pull: Box<dyn PullChannel>,
    scheduler: VisemeScheduler,
    renderer: Arc<dyn AvatarRenderer>,
    store: Arc<dyn HistoryStore>,
    transport: Option<(TransportChannel, Subscription)>,
    metrics: TurnMetrics,
    snapshot_tx: watch::Sender<SessionSnapshot>,
}

impl SessionAggregator {
    /// Create an aggregator, restoring history from `store`
    pub fn new(
        config: &PanelConfig,
        pull: Box<dyn PullChannel>,
        renderer: Arc<dyn AvatarRenderer>,
        store: Arc<dyn HistoryStore>,
    ) -> Self {
        let mut log = MessageLog::new(config.history.max_messages);
        match store.load() {
            Ok(history) if !history.is_empty() => {
                info!("Restored {} messages from history", history.len());
                log.restore(history);
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load chat history: {}", e),
        }

        let (snapshot_tx, _) = watch::channel(SessionSnapshot::default());

        let mut aggregator = Self {
            log,
            turn: TurnChannel::None,
            active: None,
            pull_stream: None,
            push_turn_open: true,
            is_generating: false,
            subtitle: None,
            cue: None,
            context_messages: config.context_messages,
            default_delay_ms: config.viseme.default_delay_ms,
            dirty: false,
            pull,
            scheduler: VisemeScheduler::new(Arc::clone(&renderer), config.viseme_config()),
            renderer,
            store,
            transport: None,
            metrics: TurnMetrics::default(),
            snapshot_tx,
        };
        aggregator.publish();
        aggregator
    }

    /// Attach the push connection whose messages feed this aggregator
    pub fn with_transport(mut self, transport: TransportChannel, subscription: Subscription) -> Self {
        self.transport = Some((transport, subscription));
        self.publish();
        self
    }

    /// Receiver of the snapshot published after every event
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Process events until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<SessionEvent>) {
        let mut refresh = tokio::time::interval(Duration::from_secs(1));
        info!("Session started");

        loop {
            tokio::select! {
                event = inbox.recv() => match event {
                    Some(SessionEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event),
                },
                // Keeps the connection indicator current
                _ = refresh.tick() => self.publish(),
            }
        }

        self.shutdown();
        info!("Session stopped");
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Push {
                message,
                received_at,
            } => self.on_push(message, received_at),
            SessionEvent::Pull(event) => self.on_pull(event),
            SessionEvent::SubmitText(text) => self.submit_text(&text),
            SessionEvent::Stop => self.stop(),
            SessionEvent::ClearHistory => self.clear_history(),
            SessionEvent::Shutdown => self.shutdown(),
        }

        if self.dirty {
            self.persist();
        }
        self.publish();
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.log.get_all()
    }

    pub fn turn_channel(&self) -> TurnChannel {
        self.turn
    }

    pub fn is_generating(&self) -> bool {
        self.is_generating
    }

    pub fn scheduler(&self) -> &VisemeScheduler {
        &self.scheduler
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.log.get_all(),
            turn: self.turn,
            connected: self
                .transport
                .as_ref()
                .map(|(t, _)| t.is_open())
                .unwrap_or(false),
            is_generating: self.is_generating,
            subtitle: self.subtitle.clone(),
            motion_group: self.cue.map(|c| c.motion_group.to_string()),
            expression: self.cue.map(|c| c.expression.to_string()),
        }
    }

    // -- user commands --------------------------------------------------

    /// Start a typed turn on the pull channel, preempting any turn in flight
    pub fn submit_text(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        self.preempt_active();
        let request = self.build_request(text);

        let user_id = self.log.next_id();
        self.log
            .push(ConversationMessage::user(user_id, InputModality::TypedText, text));
        let bot_id = self.log.next_id();
        self.log.push(ConversationMessage::placeholder(bot_id));
        self.dirty = true;

        self.active = Some(bot_id);
        self.turn = TurnChannel::Pull;
        // Whatever the push channel still says about an older spoken turn is late now
        self.push_turn_open = false;
        self.is_generating = true;
        self.metrics.start();

        let stream = self.pull.start(request);
        debug!("Typed turn {} on stream {}", bot_id, stream);
        self.pull_stream = Some(stream);
    }

    /// Cancel a typed turn in flight; not an error, nothing is rendered
    pub fn stop(&mut self) {
        self.is_generating = false;
        if self.turn != TurnChannel::Pull {
            return;
        }
        info!("Stopping typed turn");
        self.pull.cancel();
        self.pull_stream = None;
        self.finish_active();
    }

    pub fn clear_history(&mut self) {
        if self.turn == TurnChannel::Pull {
            self.pull.cancel();
        }
        self.pull_stream = None;
        self.active = None;
        self.turn = TurnChannel::None;
        self.push_turn_open = false;
        self.is_generating = false;
        self.log.clear();
        self.dirty = false;
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear chat history: {}", e);
        }
        info!("Chat history cleared");
    }

    fn shutdown(&mut self) {
        if self.turn == TurnChannel::Pull {
            self.pull.cancel();
        }
        self.scheduler.cancel_all();
        if let Some((transport, subscription)) = self.transport.take() {
            subscription.unsubscribe();
            transport.shutdown();
        }
        self.persist();
    }

    // -- push channel -----------------------------------------------------

    fn on_push(&mut self, message: PushMessage, received_at: Instant) {
        debug!("Push message: {}", message.kind());
        match message {
            PushMessage::SpeechRecognized { text } => self.on_speech_recognized(&text),
            PushMessage::TokenChunk { text } => self.on_token_chunk(&text),
            PushMessage::GenerationFinished {} => self.on_generation_finished(),
            PushMessage::Subtitle { text, emotion } => self.on_subtitle(text, emotion),
            PushMessage::VisemeTimeline {
                timeline,
                estimated_delay_ms,
            } => self.on_viseme_timeline(&timeline, estimated_delay_ms, received_at),
            PushMessage::PlaybackFinished {} => self.scheduler.cancel_all(),
        }
    }

    fn on_speech_recognized(&mut self, text: &str) {
        if self.turn == TurnChannel::Push {
            self.preempt_active();
        }

        let user_id = self.log.next_id();
        self.log.push(ConversationMessage::user(
            user_id,
            InputModality::RecognizedSpeech,
            text,
        ));
        self.dirty = true;
        self.push_turn_open = true;

        if self.turn == TurnChannel::Pull {
            // The typed turn keeps the floor; no second streaming bubble
            debug!("Speech recognized during a typed turn, deferring reply bubble");
            return;
        }

        let bot_id = self.log.next_id();
        self.log.push(ConversationMessage::placeholder(bot_id));
        self.active = Some(bot_id);
        self.turn = TurnChannel::Push;
        self.metrics.start();
    }

    fn on_token_chunk(&mut self, text: &str) {
        if self.turn == TurnChannel::Pull {
            debug!("Token chunk discarded, typed turn has priority");
            return;
        }
        if !self.push_turn_open {
            debug!("Late token chunk ignored");
            return;
        }
        if text.is_empty() {
            return;
        }
        self.is_generating = false;

        if let Some(id) = self.active.filter(|_| self.turn == TurnChannel::Push) {
            if let Some(message) = self.log.get_mut(id) {
                let first = message.is_pending;
                if message.append(text) {
                    if first {
                        self.metrics.first_fragment();
                    }
                    return;
                }
            }
            // Evicted or already settled: fall through to a fresh bubble
            self.active = None;
        }

        // No placeholder for this reply (e.g. its speech event was lost in a reconnect)
        let id = self.log.next_id();
        debug!("Token chunk without placeholder, opening bubble {}", id);
        self.log.push(ConversationMessage::streaming(id, text));
        self.active = Some(id);
        self.turn = TurnChannel::Push;
    }

    fn on_generation_finished(&mut self) {
        self.push_turn_open = false;
        if self.turn != TurnChannel::Push {
            return;
        }
        self.is_generating = false;
        self.finish_active();
    }

    fn on_subtitle(&mut self, text: String, emotion: Option<String>) {
        self.subtitle = Some(Subtitle {
            text,
            emotion: emotion
                .clone()
                .unwrap_or_else(|| DEFAULT_EMOTION.to_string()),
        });

        let Some(emotion) = emotion else { return };

        let target = match self.active.filter(|_| self.turn != TurnChannel::None) {
            Some(id) => self.log.get_mut(id),
            None => self.log.last_assistant_mut(),
        };
        if let Some(message) = target {
            if message.emotion_tag.is_none() {
                message.emotion_tag = Some(emotion.clone());
                self.dirty |= message.is_settled();
            }
        }

        let cue = cue_for_emotion(&emotion);
        debug!(
            "Emotion {} -> {} / {}",
            emotion, cue.motion_group, cue.expression
        );
        self.renderer.trigger_expression(cue);
        self.cue = Some(cue);
    }

    fn on_viseme_timeline(
        &mut self,
        timeline: &[TimedSegment],
        estimated_delay_ms: Option<f64>,
        received_at: Instant,
    ) {
        let delay = estimated_delay_ms.unwrap_or(self.default_delay_ms);
        let armed = self.scheduler.schedule(timeline, delay, received_at);
        debug!(
            "Scheduled {} key-frames for {} segments (delay {}ms)",
            armed,
            timeline.len(),
            delay
        );
    }

    // -- pull channel -----------------------------------------------------

    fn on_pull(&mut self, event: PullEvent) {
        if self.pull_stream != Some(event.stream) || self.turn != TurnChannel::Pull {
            debug!("Ignoring event from stale stream {}", event.stream);
            return;
        }

        match event.kind {
            PullEventKind::Fragment { text, first } => {
                if first {
                    self.is_generating = false;
                    self.metrics.first_fragment();
                }
                let appended = self
                    .active
                    .and_then(|id| self.log.get_mut(id))
                    .map(|m| m.append(&text))
                    .unwrap_or(false);
                if !appended {
                    debug!("Fragment dropped, no open message");
                }
            }
            PullEventKind::Completed | PullEventKind::Aborted => {
                self.pull_stream = None;
                self.is_generating = false;
                self.finish_active();
            }
            PullEventKind::Failed(reason) => {
                warn!("Typed turn failed: {}", reason);
                self.pull_stream = None;
                self.is_generating = false;
                self.finish_active();
                let id = self.log.next_id();
                self.log.push(ConversationMessage::system_error(
                    id,
                    format!("Send failed: {}", reason),
                ));
                self.dirty = true;
            }
        }
    }

    // -- helpers ----------------------------------------------------------

    /// Settle the in-flight message. A placeholder that never received content
    /// is removed rather than left as an empty bubble.
    fn finish_active(&mut self) {
        if let Some(id) = self.active.take() {
            let discard = self
                .log
                .get(id)
                .map(|m| m.content.is_empty())
                .unwrap_or(false);
            if discard {
                self.log.remove(id);
            } else if let Some(message) = self.log.get_mut(id) {
                message.settle();
            }
            self.dirty = true;
        }
        self.turn = TurnChannel::None;

        if let Some((first_fragment, total)) = self.metrics.finish() {
            info!(
                "Turn finished in {}ms (first fragment {}) | {}",
                total.as_millis(),
                first_fragment
                    .map(|d| format!("{}ms", d.as_millis()))
                    .unwrap_or_else(|| "-".to_string()),
                self.metrics.summary()
            );
        }
    }

    /// User actions preempt whatever is in flight
    fn preempt_active(&mut self) {
        if self.active.is_some() {
            debug!("Preempting {:?} turn", self.turn);
        }
        self.pull_stream = None;
        self.finish_active();
    }

    fn build_request(&self, text: &str) -> ChatRequest {
        let history: Vec<ChatTurn> = self
            .log
            .iter()
            .filter(|m| m.is_settled() && !m.content.is_empty())
            .filter_map(|m| match m.role {
                Role::User => Some(ChatTurn::user(m.content.clone())),
                Role::Assistant => Some(ChatTurn::assistant(m.content.clone())),
                Role::SystemError => None,
            })
            .collect();

        let skip = history.len().saturating_sub(self.context_messages);
        let mut messages: Vec<ChatTurn> = history.into_iter().skip(skip).collect();
        messages.push(ChatTurn::user(text));
        ChatRequest { messages }
    }

    fn persist(&mut self) {
        self.dirty = false;
        if let Err(e) = self.store.save(&self.log.settled()) {
            warn!("Failed to save chat history: {}", e);
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }
}
