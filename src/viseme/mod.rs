pub mod envelope;
pub mod scheduler;

pub use envelope::{segment_keyframes, timeline_keyframes, Keyframe};
pub use scheduler::{VisemeConfig, VisemeScheduler};
