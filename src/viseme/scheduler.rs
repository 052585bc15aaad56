//! Lip-sync key-frame scheduling
//!
//! Turns a received timeline into timer tasks that drive the renderer's mouth
//! amplitude. Pending timers live in one arena so they can be invalidated in
//! bulk.

use crate::render::AvatarRenderer;
use crate::transport::protocol::TimedSegment;
use crate::viseme::envelope::timeline_keyframes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Viseme scheduling settings
#[derive(Debug, Clone)]
pub struct VisemeConfig {
    /// Amplitude at the top of each segment's envelope
    pub peak_amplitude: f32,
    /// Used when a timeline arrives without an estimated delay
    pub default_delay_ms: f64,
    /// Upper bound on key-frame timers pending at once
    pub max_pending: usize,
}

impl Default for VisemeConfig {
    fn default() -> Self {
        Self {
            peak_amplitude: 0.8,
            default_delay_ms: 50.0,
            max_pending: 512,
        }
    }
}

/// Key-frames further out than this are not scheduled
const MAX_FRAME_OFFSET: Duration = Duration::from_secs(3600);

/// Deadline of a key-frame `at_ms` after `reference`, if it is schedulable
fn frame_deadline(reference: Instant, at_ms: f64) -> Option<Instant> {
    if !at_ms.is_finite() {
        return None;
    }
    let offset = Duration::try_from_secs_f64(at_ms.max(0.0) / 1000.0).ok()?;
    if offset > MAX_FRAME_OFFSET {
        return None;
    }
    reference.checked_add(offset)
}

struct TimerArena {
    /// Bumped on every invalidation; timers from older generations never apply
    generation: u64,
    next_id: u64,
    pending: HashMap<u64, JoinHandle<()>>,
    amplitude: f32,
}

impl TimerArena {
    fn invalidate(&mut self) {
        self.generation += 1;
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }
}

/// Schedules mouth amplitude key-frames against a timeline reference
pub struct VisemeScheduler {
    renderer: Arc<dyn AvatarRenderer>,
    arena: Arc<Mutex<TimerArena>>,
    config: VisemeConfig,
}

impl VisemeScheduler {
    pub fn new(renderer: Arc<dyn AvatarRenderer>, config: VisemeConfig) -> Self {
        Self {
            renderer,
            arena: Arc::new(Mutex::new(TimerArena {
                generation: 0,
                next_id: 0,
                pending: HashMap::new(),
                amplitude: 0.0,
            })),
            config,
        }
    }

    /// Replace whatever is pending with the key-frames of `timeline`.
    ///
    /// Key-frames whose time has already passed are not dropped: they are
    /// applied immediately, in time order, so a late timeline still animates
    /// its remainder. Returns the number of timers armed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(
        &self,
        timeline: &[TimedSegment],
        estimated_delay_ms: f64,
        reference: Instant,
    ) -> usize {
        let frames = timeline_keyframes(timeline, estimated_delay_ms, self.config.peak_amplitude);
        let now = Instant::now();

        let mut arena = self.arena.lock();
        arena.invalidate();
        let generation = arena.generation;

        let mut catch_up = Vec::new();
        let mut dropped = 0usize;
        let mut unschedulable = 0usize;

        for frame in frames {
            let Some(deadline) = frame_deadline(reference, frame.at_ms) else {
                unschedulable += 1;
                continue;
            };
            if deadline <= now {
                catch_up.push(frame.amplitude);
                continue;
            }
            if arena.pending.len() >= self.config.max_pending {
                dropped += 1;
                continue;
            }

            let id = arena.next_id;
            arena.next_id += 1;

            let shared = Arc::clone(&self.arena);
            let renderer = Arc::clone(&self.renderer);
            let amplitude = frame.amplitude;
            let handle = tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let mut arena = shared.lock();
                if arena.generation != generation {
                    return;
                }
                arena.pending.remove(&id);
                arena.amplitude = amplitude;
                trace!("Mouth amplitude -> {:.2}", amplitude);
                renderer.set_mouth_amplitude(amplitude);
            });
            arena.pending.insert(id, handle);
        }

        if !catch_up.is_empty() {
            debug!("Timeline arrived late, applying {} elapsed key-frames now", catch_up.len());
            for amplitude in catch_up {
                arena.amplitude = amplitude;
                self.renderer.set_mouth_amplitude(amplitude);
            }
        }

        if unschedulable > 0 {
            debug!("Skipped {} key-frames with out-of-range offsets", unschedulable);
        }
        if dropped > 0 {
            warn!("Dropped {} key-frames over the pending limit", dropped);
        }

        arena.pending.len()
    }

    /// Invalidate every pending key-frame and close the mouth.
    ///
    /// Holding the arena lock while bumping the generation means no timer of
    /// an earlier `schedule()` can apply once this returns.
    pub fn cancel_all(&self) {
        let mut arena = self.arena.lock();
        let cancelled = arena.pending.len();
        arena.invalidate();
        arena.amplitude = 0.0;
        self.renderer.set_mouth_amplitude(0.0);
        if cancelled > 0 {
            debug!("Cancelled {} pending key-frames", cancelled);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.arena.lock().pending.len()
    }

    /// Last amplitude sent to the renderer
    pub fn amplitude(&self) -> f32 {
        self.arena.lock().amplitude
    }
}

impl Drop for VisemeScheduler {
    fn drop(&mut self) {
        self.arena.lock().invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{ChannelRenderer, RenderCommand};

    fn scheduler() -> (VisemeScheduler, crossbeam_channel::Receiver<RenderCommand>) {
        let (renderer, rx) = ChannelRenderer::new();
        (
            VisemeScheduler::new(Arc::new(renderer), VisemeConfig::default()),
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_arms_four_timers_per_segment() {
        let (scheduler, _rx) = scheduler();
        let armed = scheduler.schedule(
            &[TimedSegment::new("a", 0.0, 200.0), TimedSegment::new("b", 300.0, 500.0)],
            50.0,
            Instant::now(),
        );
        assert_eq!(armed, 8);
        assert_eq!(scheduler.pending_count(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_twice_matches_once() {
        let (scheduler, rx) = scheduler();
        scheduler.schedule(&[TimedSegment::new("a", 0.0, 200.0)], 50.0, Instant::now());

        scheduler.cancel_all();
        let once = (scheduler.amplitude(), scheduler.pending_count());
        scheduler.cancel_all();
        let twice = (scheduler.amplitude(), scheduler.pending_count());

        assert_eq!(once, (0.0, 0));
        assert_eq!(once, twice);

        // Nothing fires afterwards
        tokio::time::sleep(Duration::from_millis(500)).await;
        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![
                RenderCommand::MouthAmplitude(0.0),
                RenderCommand::MouthAmplitude(0.0)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_timeline_applies_immediately() {
        let (scheduler, rx) = scheduler();
        let reference = Instant::now();
        tokio::time::advance(Duration::from_millis(120)).await;

        // Segment 0..200 with 50ms delay: 50 and 90 have passed
        let armed = scheduler.schedule(&[TimedSegment::new("a", 0.0, 200.0)], 50.0, reference);
        assert_eq!(armed, 2);
        assert!((scheduler.amplitude() - 0.8).abs() < 1e-6);
        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1], RenderCommand::MouthAmplitude(0.8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_schedule_replaces_pending() {
        let (scheduler, _rx) = scheduler();
        let reference = Instant::now();
        scheduler.schedule(&[TimedSegment::new("a", 0.0, 200.0)], 50.0, reference);
        scheduler.schedule(&[TimedSegment::new("b", 1000.0, 1100.0)], 50.0, reference);
        assert_eq!(scheduler.pending_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_offsets_are_skipped() {
        let (scheduler, _rx) = scheduler();

        let armed = scheduler.schedule(&[TimedSegment::new("a", 1e300, 1e300)], 50.0, Instant::now());
        assert_eq!(armed, 0);
        assert_eq!(scheduler.pending_count(), 0);

        let armed = scheduler.schedule(&[TimedSegment::new("a", 0.0, 200.0)], 1e300, Instant::now());
        assert_eq!(armed, 0);

        let armed = scheduler.schedule(
            &[TimedSegment::new("a", f64::NAN, f64::INFINITY)],
            50.0,
            Instant::now(),
        );
        assert_eq!(armed, 0);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.amplitude(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_segment_keeps_the_rest() {
        let (scheduler, _rx) = scheduler();
        let armed = scheduler.schedule(
            &[TimedSegment::new("a", 0.0, 200.0), TimedSegment::new("b", 1e300, 1e300)],
            50.0,
            Instant::now(),
        );
        assert_eq!(armed, 4);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_limit() {
        let (renderer, _rx) = ChannelRenderer::new();
        let scheduler = VisemeScheduler::new(
            Arc::new(renderer),
            VisemeConfig {
                max_pending: 6,
                ..Default::default()
            },
        );
        let armed = scheduler.schedule(
            &[TimedSegment::new("a", 0.0, 200.0), TimedSegment::new("b", 300.0, 500.0)],
            50.0,
            Instant::now(),
        );
        assert_eq!(armed, 6);
    }
}
