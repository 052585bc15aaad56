//! Turn latency tracking
//!
//! Measures how long the assistant takes to produce its first fragment and to
//! settle, over a sliding window of recent turns.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding window of duration samples
#[derive(Debug, Clone)]
pub struct TimingTracker {
    samples: VecDeque<Duration>,
    max_samples: usize,
}

impl TimingTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples: max_samples.max(1),
        }
    }

    pub fn record(&mut self, duration: Duration) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(duration);
    }

    pub fn average(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().sum();
        total / self.samples.len() as u32
    }

    pub fn percentile_95(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted: Vec<_> = self.samples.iter().copied().collect();
        sorted.sort();
        let idx = (sorted.len() as f32 * 0.95) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }
}

/// Timing of the turn currently in flight
#[derive(Debug, Clone, Copy)]
struct OpenTurn {
    started: Instant,
    first_fragment: Option<Duration>,
}

/// Time-to-first-fragment and total turn duration
#[derive(Debug, Clone)]
pub struct TurnMetrics {
    open: Option<OpenTurn>,
    first_fragment: TimingTracker,
    total: TimingTracker,
}

impl TurnMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            open: None,
            first_fragment: TimingTracker::new(window),
            total: TimingTracker::new(window),
        }
    }

    /// A turn was submitted; any unfinished one is discarded
    pub fn start(&mut self) {
        self.open = Some(OpenTurn {
            started: Instant::now(),
            first_fragment: None,
        });
    }

    pub fn first_fragment(&mut self) {
        if let Some(turn) = self.open.as_mut() {
            if turn.first_fragment.is_none() {
                let elapsed = turn.started.elapsed();
                turn.first_fragment = Some(elapsed);
                self.first_fragment.record(elapsed);
            }
        }
    }

    /// Close the turn, returning (first fragment, total) when it was timed
    pub fn finish(&mut self) -> Option<(Option<Duration>, Duration)> {
        let turn = self.open.take()?;
        let total = turn.started.elapsed();
        self.total.record(total);
        Some((turn.first_fragment, total))
    }

    pub fn summary(&self) -> String {
        format!(
            "TTFF avg {}ms p95 {}ms | turn avg {}ms over {} turns",
            self.first_fragment.average().as_millis(),
            self.first_fragment.percentile_95().as_millis(),
            self.total.average().as_millis(),
            self.total.count()
        )
    }
}

impl Default for TurnMetrics {
    fn default() -> Self {
        Self::new(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_tracker_window() {
        let mut tracker = TimingTracker::new(3);
        for i in 1..=5 {
            tracker.record(Duration::from_millis(i * 10));
        }

        assert_eq!(tracker.count(), 3);
        assert_eq!(tracker.average(), Duration::from_millis(40));
        assert_eq!(tracker.percentile_95(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_metrics() {
        let mut metrics = TurnMetrics::new(10);
        metrics.start();
        tokio::time::advance(Duration::from_millis(120)).await;
        metrics.first_fragment();
        tokio::time::advance(Duration::from_millis(80)).await;
        metrics.first_fragment();

        let (ttff, total) = metrics.finish().unwrap();
        assert_eq!(ttff, Some(Duration::from_millis(120)));
        assert_eq!(total, Duration::from_millis(200));
        assert!(metrics.finish().is_none());
    }

    #[test]
    fn test_finish_without_start() {
        let mut metrics = TurnMetrics::default();
        metrics.first_fragment();
        assert!(metrics.finish().is_none());
    }
}
