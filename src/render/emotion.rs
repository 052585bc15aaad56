//! Emotion tag → avatar cue lookup

/// Motion group and expression to play for an emotion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpressionCue {
    pub motion_group: &'static str,
    pub expression: &'static str,
}

impl ExpressionCue {
    pub const NEUTRAL: ExpressionCue = ExpressionCue {
        motion_group: "Idle",
        expression: "neutral",
    };

    const HAPPY: ExpressionCue = ExpressionCue {
        motion_group: "Flick",
        expression: "happy",
    };

    const SAD: ExpressionCue = ExpressionCue {
        motion_group: "FlickDown",
        expression: "sad",
    };

    const ANGRY: ExpressionCue = ExpressionCue {
        motion_group: "Flick",
        expression: "angry",
    };

    const SURPRISED: ExpressionCue = ExpressionCue {
        motion_group: "FlickUp",
        expression: "surprised",
    };
}

impl Default for ExpressionCue {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Map an emotion tag to its cue. Unknown tags fall back to neutral.
pub fn cue_for_emotion(emotion: &str) -> ExpressionCue {
    match emotion.trim() {
        "开心" | "happy" | "joy" => ExpressionCue::HAPPY,
        "悲伤" | "sad" => ExpressionCue::SAD,
        "愤怒" | "angry" => ExpressionCue::ANGRY,
        "惊讶" | "surprised" => ExpressionCue::SURPRISED,
        "平静" | "calm" | "neutral" => ExpressionCue::NEUTRAL,
        _ => ExpressionCue::NEUTRAL,
    }
}
