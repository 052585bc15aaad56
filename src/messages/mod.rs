pub mod storage;
pub mod types;

pub use storage::{HistoryStore, JsonFileStore, MemoryStore, MessageLog};
pub use types::{ConversationMessage, InputModality, MessageId, Role};
