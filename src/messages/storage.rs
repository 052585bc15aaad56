use super::types::{ConversationMessage, MessageId, Role};
use crate::{PanelError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Ordered, bounded in-memory conversation log.
///
/// Ids are handed out by the log itself so they stay monotonic across
/// evictions, clears and history restores.
#[derive(Debug, Clone)]
pub struct MessageLog {
    messages: VecDeque<ConversationMessage>,
    capacity: usize,
    next_id: MessageId,
}

impl MessageLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    pub fn next_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Append a message, evicting the oldest entries once over capacity.
    pub fn push(&mut self, message: ConversationMessage) {
        self.next_id = self.next_id.max(message.id + 1);
        self.messages.push_back(message);
        while self.messages.len() > self.capacity {
            if let Some(evicted) = self.messages.pop_front() {
                debug!("Evicted message {} from log", evicted.id);
            }
        }
    }

    pub fn get(&self, id: MessageId) -> Option<&ConversationMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: MessageId) -> Option<&mut ConversationMessage> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn remove(&mut self, id: MessageId) -> Option<ConversationMessage> {
        let pos = self.messages.iter().position(|m| m.id == id)?;
        self.messages.remove(pos)
    }

    /// Most recent assistant message, if any.
    pub fn last_assistant_mut(&mut self) -> Option<&mut ConversationMessage> {
        self.messages
            .iter_mut()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    pub fn get_all(&self) -> Vec<ConversationMessage> {
        self.messages.iter().cloned().collect()
    }

    /// Settled messages only; this is what gets persisted.
    pub fn settled(&self) -> Vec<ConversationMessage> {
        self.messages
            .iter()
            .filter(|m| m.is_settled())
            .cloned()
            .collect()
    }

    pub fn streaming_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_streaming).count()
    }

    /// Replace the log with restored history. Anything restored is settled.
    pub fn restore(&mut self, messages: Vec<ConversationMessage>) {
        self.messages.clear();
        for mut message in messages {
            message.settle();
            self.push(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Durable key-value store for the bounded message-log snapshot.
pub trait HistoryStore: Send + Sync {
    fn load(&self) -> Result<Vec<ConversationMessage>>;
    fn save(&self, messages: &[ConversationMessage]) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

fn tail(messages: &[ConversationMessage], max: usize) -> &[ConversationMessage] {
    if messages.len() > max {
        &messages[messages.len() - max..]
    } else {
        messages
    }
}

/// Snapshot stored as a JSON array in a single file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    max_messages: usize,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>, max_messages: usize) -> Self {
        Self {
            path: path.into(),
            max_messages,
        }
    }

    /// Sibling file the next snapshot is written to before it replaces the old one
    fn staging_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl HistoryStore for JsonFileStore {
    fn load(&self) -> Result<Vec<ConversationMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data)
            .map_err(|e| PanelError::StorageError(format!("Corrupt history file: {}", e)))
    }

    fn save(&self, messages: &[ConversationMessage]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_string(tail(messages, self.max_messages))
            .map_err(|e| PanelError::StorageError(e.to_string()))?;
        let staging = self.staging_path();
        std::fs::write(&staging, data)?;
        if let Err(e) = std::fs::rename(&staging, &self.path) {
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Volatile store, used when no snapshot path is configured.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    messages: Arc<Mutex<Vec<ConversationMessage>>>,
    max_messages: usize,
}

impl MemoryStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            max_messages,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(500)
    }
}

impl HistoryStore for MemoryStore {
    fn load(&self) -> Result<Vec<ConversationMessage>> {
        Ok(self.messages.lock().clone())
    }

    fn save(&self, messages: &[ConversationMessage]) -> Result<()> {
        *self.messages.lock() = tail(messages, self.max_messages).to_vec();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.messages.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::InputModality;

    fn user(log: &mut MessageLog, text: &str) -> MessageId {
        let id = log.next_id();
        log.push(ConversationMessage::user(id, InputModality::TypedText, text));
        id
    }

    #[test]
    fn test_log_evicts_oldest() {
        let mut log = MessageLog::new(3);
        let first = user(&mut log, "a");
        user(&mut log, "b");
        user(&mut log, "c");
        user(&mut log, "d");

        assert_eq!(log.len(), 3);
        assert!(log.get(first).is_none());
        assert_eq!(log.iter().next().map(|m| m.content.as_str()), Some("b"));
    }

    #[test]
    fn test_ids_stay_monotonic_after_clear() {
        let mut log = MessageLog::new(10);
        let a = user(&mut log, "a");
        log.clear();
        let b = user(&mut log, "b");
        assert!(b > a);
    }

    #[test]
    fn test_restore_settles_and_advances_ids() {
        let mut log = MessageLog::new(10);
        let mut restored = ConversationMessage::placeholder(41);
        restored.content = "partial".to_string();
        log.restore(vec![restored]);

        assert!(log.get(41).map(|m| m.is_settled()).unwrap_or(false));
        assert_eq!(log.next_id(), 42);
    }

    #[test]
    fn test_settled_excludes_streaming() {
        let mut log = MessageLog::new(10);
        user(&mut log, "hi");
        let id = log.next_id();
        log.push(ConversationMessage::placeholder(id));

        assert_eq!(log.settled().len(), 1);
        assert_eq!(log.streaming_count(), 1);
    }

    #[test]
    fn test_memory_store_caps_snapshot() {
        let store = MemoryStore::new(2);
        let messages: Vec<_> = (1..=5)
            .map(|i| ConversationMessage::user(i, InputModality::TypedText, i.to_string()))
            .collect();
        store.save(&messages).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 4);

        store.clear().unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_roundtrip_and_clear() {
        let path = std::env::temp_dir().join(format!("livebot-history-{}.json", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(&path, 500);

        assert!(store.load().unwrap().is_empty());

        let mut reply = ConversationMessage::streaming(2, "你好");
        reply.settle();
        reply.emotion_tag = Some("开心".to_string());
        store
            .save(&[ConversationMessage::user(1, InputModality::TypedText, "hi"), reply])
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content, "你好");
        assert_eq!(loaded[1].emotion_tag.as_deref(), Some("开心"));

        store.clear().unwrap();
        assert!(!path.exists());
        // Clearing twice is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_json_store_replaces_snapshot_whole() {
        let dir = std::env::temp_dir().join(format!("livebot-history-{}", uuid::Uuid::new_v4()));
        let path = dir.join("history.json");
        let store = JsonFileStore::new(&path, 500);
        let staging = dir.join("history.json.tmp");

        store
            .save(&[ConversationMessage::user(1, InputModality::TypedText, "first")])
            .unwrap();
        assert!(!staging.exists());

        // Leftover from an interrupted write does not shadow the snapshot
        std::fs::write(&staging, "{ truncated").unwrap();
        assert_eq!(store.load().unwrap()[0].content, "first");

        store
            .save(&[
                ConversationMessage::user(1, InputModality::TypedText, "first"),
                ConversationMessage::user(2, InputModality::TypedText, "second"),
            ])
            .unwrap();
        assert!(!staging.exists());
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[1].content, "second");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
