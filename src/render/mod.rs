//! Rendering collaborator interface
//!
//! The avatar renderer lives on its own thread (or in another process); the
//! session only ever talks to it through [`AvatarRenderer`].

pub mod emotion;

pub use emotion::{cue_for_emotion, ExpressionCue};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// Sink for avatar animation commands
pub trait AvatarRenderer: Send + Sync {
    /// Mouth opening, clamped to `0.0..=1.0`
    fn set_mouth_amplitude(&self, amplitude: f32);

    fn trigger_expression(&self, cue: ExpressionCue);
}

/// Command delivered to the render thread
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderCommand {
    MouthAmplitude(f32),
    Expression(ExpressionCue),
}

/// Forwards commands over a channel, for a render loop that polls `try_recv`
#[derive(Debug, Clone)]
pub struct ChannelRenderer {
    tx: Sender<RenderCommand>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, Receiver<RenderCommand>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl AvatarRenderer for ChannelRenderer {
    fn set_mouth_amplitude(&self, amplitude: f32) {
        // A closed render thread is not our problem
        let _ = self
            .tx
            .send(RenderCommand::MouthAmplitude(amplitude.clamp(0.0, 1.0)));
    }

    fn trigger_expression(&self, cue: ExpressionCue) {
        let _ = self.tx.send(RenderCommand::Expression(cue));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_renderer_clamps_amplitude() {
        let (renderer, rx) = ChannelRenderer::new();
        renderer.set_mouth_amplitude(1.5);
        renderer.set_mouth_amplitude(-0.2);
        renderer.trigger_expression(ExpressionCue::NEUTRAL);

        let commands: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![
                RenderCommand::MouthAmplitude(1.0),
                RenderCommand::MouthAmplitude(0.0),
                RenderCommand::Expression(ExpressionCue::NEUTRAL),
            ]
        );
    }

    #[test]
    fn test_send_after_receiver_dropped_is_silent() {
        let (renderer, rx) = ChannelRenderer::new();
        drop(rx);
        renderer.set_mouth_amplitude(0.5);
    }
}
