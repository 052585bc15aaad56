//! Push channel wire format
//!
//! Every frame is a JSON object tagged by its `type` field. The event names
//! used by older backends (`asr_result`, `llm_chunk`, `lip_sync`, ...) are
//! accepted as aliases.

use crate::Result;
use serde::{Deserialize, Serialize};

/// One timed mouth-shape cue, relative to the timeline's shared t0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSegment {
    #[serde(default, alias = "char")]
    pub label: String,

    #[serde(rename = "beginOffsetMs", alias = "beginTime")]
    pub begin_offset_ms: f64,

    #[serde(rename = "endOffsetMs", alias = "endTime")]
    pub end_offset_ms: f64,
}

impl TimedSegment {
    pub fn new(label: impl Into<String>, begin_offset_ms: f64, end_offset_ms: f64) -> Self {
        Self {
            label: label.into(),
            begin_offset_ms,
            end_offset_ms,
        }
    }

    /// Segment length in milliseconds; inverted segments count as zero.
    pub fn duration_ms(&self) -> f64 {
        (self.end_offset_ms - self.begin_offset_ms).max(0.0)
    }
}

/// Inbound push channel message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// The backend recognized a user utterance
    #[serde(alias = "asr_result")]
    SpeechRecognized { text: String },

    /// Next token(s) of the assistant reply for a spoken turn
    #[serde(alias = "llm_chunk")]
    TokenChunk { text: String },

    /// The assistant reply is complete
    #[serde(alias = "llm_done")]
    GenerationFinished {},

    /// Finalized sentence with its emotion tag
    Subtitle {
        #[serde(default)]
        text: String,
        #[serde(default)]
        emotion: Option<String>,
    },

    /// Lip-sync timeline for audio that is about to play
    #[serde(alias = "lip_sync")]
    VisemeTimeline {
        timeline: Vec<TimedSegment>,
        #[serde(default, rename = "estimatedDelayMs", alias = "audioDelay")]
        estimated_delay_ms: Option<f64>,
    },

    /// Audio playback ended
    #[serde(alias = "playback_done")]
    PlaybackFinished {},
}

impl PushMessage {
    /// Parse a text frame
    pub fn parse(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::SpeechRecognized { .. } => "speech_recognized",
            PushMessage::TokenChunk { .. } => "token_chunk",
            PushMessage::GenerationFinished {} => "generation_finished",
            PushMessage::Subtitle { .. } => "subtitle",
            PushMessage::VisemeTimeline { .. } => "viseme_timeline",
            PushMessage::PlaybackFinished {} => "playback_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_speech_recognized() {
        let msg = PushMessage::parse(r#"{"type":"speech_recognized","text":"hello"}"#).unwrap();
        assert_eq!(
            msg,
            PushMessage::SpeechRecognized {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_parse_legacy_aliases() {
        let msg = PushMessage::parse(r#"{"type":"asr_result","text":"你好"}"#).unwrap();
        assert_eq!(msg.kind(), "speech_recognized");

        let msg = PushMessage::parse(r#"{"type":"llm_chunk","text":"a"}"#).unwrap();
        assert_eq!(msg.kind(), "token_chunk");

        let msg = PushMessage::parse(r#"{"type":"llm_done"}"#).unwrap();
        assert_eq!(msg, PushMessage::GenerationFinished {});

        let msg = PushMessage::parse(r#"{"type":"playback_done"}"#).unwrap();
        assert_eq!(msg, PushMessage::PlaybackFinished {});
    }

    #[test]
    fn test_parse_lip_sync_timeline() {
        let frame = r#"{
            "type": "lip_sync",
            "timeline": [{"char": "你", "beginTime": 0, "endTime": 200}],
            "t0": 1700000000000.0,
            "audioDelay": 50
        }"#;
        match PushMessage::parse(frame).unwrap() {
            PushMessage::VisemeTimeline {
                timeline,
                estimated_delay_ms,
            } => {
                assert_eq!(timeline, vec![TimedSegment::new("你", 0.0, 200.0)]);
                assert_eq!(estimated_delay_ms, Some(50.0));
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_parse_viseme_timeline_without_delay() {
        let frame = r#"{"type":"viseme_timeline","timeline":[{"label":"a","beginOffsetMs":10,"endOffsetMs":20.5}]}"#;
        match PushMessage::parse(frame).unwrap() {
            PushMessage::VisemeTimeline {
                timeline,
                estimated_delay_ms,
            } => {
                assert_eq!(timeline[0].duration_ms(), 10.5);
                assert_eq!(estimated_delay_ms, None);
            }
            other => panic!("Wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_subtitle_emotion_optional() {
        let msg = PushMessage::parse(r#"{"type":"subtitle","text":"hi"}"#).unwrap();
        assert_eq!(
            msg,
            PushMessage::Subtitle {
                text: "hi".to_string(),
                emotion: None
            }
        );
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(PushMessage::parse("not json").is_err());
        assert!(PushMessage::parse(r#"{"type":"unknown_event"}"#).is_err());
        assert!(PushMessage::parse(r#"{"text":"missing tag"}"#).is_err());
        assert!(PushMessage::parse(r#"{"type":"token_chunk"}"#).is_err());
    }

    #[test]
    fn test_inverted_segment_has_zero_duration() {
        assert_eq!(TimedSegment::new("x", 300.0, 100.0).duration_ms(), 0.0);
    }
}
