//! Push channel: persistent WebSocket connection with reconnect and fan-out

pub mod backoff;
pub mod channel;
pub mod protocol;

pub use backoff::Backoff;
pub use channel::{ConnectionState, Subscription, TransportChannel, TransportConfig};
pub use protocol::{PushMessage, TimedSegment};
