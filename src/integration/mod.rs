//! Session engine: aggregation of the push and pull channels into one
//! conversation log

pub mod aggregator;
pub mod config;
pub mod session;

pub use aggregator::{SessionAggregator, SessionEvent, SessionSnapshot, Subtitle, TurnChannel};
pub use config::PanelConfig;
pub use session::{Session, SessionBuilder, SessionHandle};
