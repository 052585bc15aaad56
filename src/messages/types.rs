use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonic identifier of a conversation message. Never reused within a session.
pub type MessageId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    SystemError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputModality {
    TypedText,
    RecognizedSpeech,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: MessageId,
    pub role: Role,
    /// Only meaningful for `Role::User`
    pub input_modality: Option<InputModality>,
    pub content: String,
    pub emotion_tag: Option<String>,
    pub is_streaming: bool,
    pub is_pending: bool,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(id: MessageId, modality: InputModality, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::User,
            input_modality: Some(modality),
            content: text.into(),
            emotion_tag: None,
            is_streaming: false,
            is_pending: false,
            created_at: Utc::now(),
        }
    }

    /// An assistant bubble that has not received its first token yet.
    pub fn placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Assistant,
            input_modality: None,
            content: String::new(),
            emotion_tag: None,
            is_streaming: true,
            is_pending: true,
            created_at: Utc::now(),
        }
    }

    /// An assistant bubble that starts out already streaming `text`.
    pub fn streaming(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            is_pending: false,
            content: text.into(),
            ..Self::placeholder(id)
        }
    }

    pub fn system_error(id: MessageId, text: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::SystemError,
            input_modality: None,
            content: text.into(),
            emotion_tag: None,
            is_streaming: false,
            is_pending: false,
            created_at: Utc::now(),
        }
    }

    /// Neither pending nor streaming; content is final.
    pub fn is_settled(&self) -> bool {
        !self.is_streaming && !self.is_pending
    }

    /// Append streamed text. Settled messages reject further content.
    pub fn append(&mut self, text: &str) -> bool {
        if !self.is_streaming {
            return false;
        }
        self.content.push_str(text);
        self.is_pending = false;
        true
    }

    pub fn settle(&mut self) {
        self.is_streaming = false;
        self.is_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_flags() {
        let msg = ConversationMessage::placeholder(7);
        assert_eq!(msg.role, Role::Assistant);
        assert!(msg.is_pending);
        assert!(msg.is_streaming);
        assert!(!msg.is_settled());
    }

    #[test]
    fn test_append_clears_pending() {
        let mut msg = ConversationMessage::placeholder(1);
        assert!(msg.append("Hel"));
        assert!(msg.append("lo"));
        assert!(!msg.is_pending);
        assert_eq!(msg.content, "Hello");
    }

    #[test]
    fn test_settled_rejects_append() {
        let mut msg = ConversationMessage::streaming(1, "done");
        msg.settle();
        assert!(!msg.append(" more"));
        assert_eq!(msg.content, "done");
        assert!(msg.is_settled());
    }

    #[test]
    fn test_user_message_modality() {
        let msg = ConversationMessage::user(3, InputModality::RecognizedSpeech, "hi");
        assert_eq!(msg.input_modality, Some(InputModality::RecognizedSpeech));
        assert!(msg.is_settled());
    }
}
