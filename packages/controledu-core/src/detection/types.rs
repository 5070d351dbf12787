//! Shared result types for the detection pipeline stages.

use serde::{Deserialize, Serialize};

/// The AI surface a positive detection is attributed to. Values MUST
/// round-trip by name (stable enum string form, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum DetectionClass {
    None,
    ChatGpt,
    Claude,
    Gemini,
    Copilot,
    Perplexity,
    DeepSeek,
    Poe,
    Grok,
    Qwen,
    Mistral,
    MetaAi,
    UnknownAi,
}

impl Default for DetectionClass {
    fn default() -> Self {
        DetectionClass::None
    }
}

/// Which pipeline stage produced a [`DetectionResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum StageSource {
    None,
    MetadataRule,
    OnnxBinary,
    OnnxMulticlass,
    Fused,
}

impl Default for StageSource {
    fn default() -> Self {
        StageSource::None
    }
}

/// The outcome of running one or more detection stages on an
/// observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub is_ai_ui_detected: bool,
    pub confidence: f32,
    pub class: DetectionClass,
    pub stage_source: StageSource,
    pub reason: String,
    pub model_version: Option<String>,
    pub triggered_keywords: Vec<String>,
    pub is_stable: bool,
}

impl DetectionResult {
    pub fn negative(reason: impl Into<String>) -> Self {
        Self {
            is_ai_ui_detected: false,
            confidence: 0.0,
            class: DetectionClass::None,
            stage_source: StageSource::None,
            reason: reason.into(),
            model_version: None,
            triggered_keywords: Vec::new(),
            is_stable: false,
        }
    }
}

/// Clamp a confidence value into `[0, 1]`.
pub fn clamp_confidence(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_class_round_trips_by_name() {
        for class in [
            DetectionClass::None,
            DetectionClass::ChatGpt,
            DetectionClass::Claude,
            DetectionClass::Gemini,
            DetectionClass::Copilot,
            DetectionClass::Perplexity,
            DetectionClass::DeepSeek,
            DetectionClass::Poe,
            DetectionClass::Grok,
            DetectionClass::Qwen,
            DetectionClass::Mistral,
            DetectionClass::MetaAi,
            DetectionClass::UnknownAi,
        ] {
            let json = serde_json::to_string(&class).unwrap();
            let back: DetectionClass = serde_json::from_str(&json).unwrap();
            assert_eq!(class, back);
        }
    }

    #[test]
    fn test_chatgpt_serializes_to_expected_name() {
        assert_eq!(serde_json::to_string(&DetectionClass::ChatGpt).unwrap(), "\"ChatGpt\"");
        assert_eq!(serde_json::to_string(&DetectionClass::MetaAi).unwrap(), "\"MetaAi\"");
    }

    #[test]
    fn test_clamp_confidence() {
        assert_eq!(clamp_confidence(-0.5), 0.0);
        assert_eq!(clamp_confidence(1.5), 1.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }
}
