//! Mouth amplitude envelope for timed viseme segments
//!
//! Each segment becomes four key-frames instead of a binary open/close:
//! attack to 30% of peak, full peak at 20% of the segment, decay to 50% at
//! 80%, closed at the end.

use crate::transport::protocol::TimedSegment;

const ATTACK_LEVEL: f32 = 0.3;
const SUSTAIN_LEVEL: f32 = 0.5;
const RISE_AT: f64 = 0.2;
const DECAY_AT: f64 = 0.8;

/// Amplitude change at `at_ms` after the timeline reference
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keyframe {
    pub at_ms: f64,
    pub amplitude: f32,
}

/// Key-frames for one segment shifted by the estimated playback delay
pub fn segment_keyframes(segment: &TimedSegment, delay_ms: f64, peak: f32) -> [Keyframe; 4] {
    let open_at = delay_ms + segment.begin_offset_ms;
    let close_at = open_at + segment.duration_ms();
    let duration = close_at - open_at;

    [
        Keyframe {
            at_ms: open_at,
            amplitude: peak * ATTACK_LEVEL,
        },
        Keyframe {
            at_ms: open_at + duration * RISE_AT,
            amplitude: peak,
        },
        Keyframe {
            at_ms: open_at + duration * DECAY_AT,
            amplitude: peak * SUSTAIN_LEVEL,
        },
        Keyframe {
            at_ms: close_at,
            amplitude: 0.0,
        },
    ]
}

/// All key-frames of a timeline in firing order.
///
/// The sort is stable, so key-frames at the same instant keep timeline order.
pub fn timeline_keyframes(timeline: &[TimedSegment], delay_ms: f64, peak: f32) -> Vec<Keyframe> {
    let mut frames: Vec<Keyframe> = timeline
        .iter()
        .flat_map(|segment| segment_keyframes(segment, delay_ms, peak))
        .collect();
    frames.sort_by(|a, b| a.at_ms.total_cmp(&b.at_ms));
    frames
}
