//! Pull channel: one cancelable streaming HTTP exchange per typed-text turn

pub mod decoder;
pub mod request;

pub use decoder::Utf8Decoder;
pub use request::{
    ChatRequest, ChatTurn, PullChannel, PullEvent, PullEventKind, RequestStream,
    RequestStreamConfig, StreamHandle, StreamId,
};
