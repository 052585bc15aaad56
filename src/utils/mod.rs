pub mod perf;

pub use perf::{TimingTracker, TurnMetrics};
