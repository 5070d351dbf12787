//! Detection policy (part of the data model): the read-mostly tuning
//! knobs for every stage of the pipeline.

use serde::{Deserialize, Serialize};

/// Geometry for the thumbnail attached to an alert event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailGeometry {
    pub width: u32,
    pub height: u32,
}

/// All tunables for the four-stage detection pipeline and temporal
/// smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPolicy {
    pub enabled: bool,
    pub evaluation_interval_seconds: u32,
    pub frame_change_threshold: u32,
    pub min_recheck_interval_seconds: u32,
    pub metadata_threshold: f32,
    pub ml_threshold: f32,
    pub temporal_window_size: usize,
    pub temporal_required_votes: usize,
    pub cooldown_seconds: i64,
    pub keywords: Vec<String>,
    pub whitelist_keywords: Vec<String>,
    /// All `false` in production; present only because the original data
    /// model names these flags.
    pub collect_frame_bytes: bool,
    pub collect_thumbnail_bytes: bool,
    pub alert_thumbnail: ThumbnailGeometry,
    pub policy_version: u32,
}

impl DetectionPolicy {
    /// The fixed production policy. Per §9's design note, the hub always
    /// returns this regardless of what a teacher may have persisted
    /// through the settings endpoint — intentional hardening against
    /// UI-driven downgrades.
    pub fn production() -> Self {
        Self {
            enabled: true,
            evaluation_interval_seconds: 5,
            frame_change_threshold: 6,
            min_recheck_interval_seconds: 120,
            metadata_threshold: 0.6,
            ml_threshold: 0.75,
            temporal_window_size: 3,
            temporal_required_votes: 2,
            cooldown_seconds: 10,
            keywords: default_keywords(),
            whitelist_keywords: Vec::new(),
            collect_frame_bytes: false,
            collect_thumbnail_bytes: false,
            alert_thumbnail: ThumbnailGeometry {
                width: 320,
                height: 180,
            },
            policy_version: 1,
        }
    }
}

impl Default for DetectionPolicy {
    fn default() -> Self {
        Self::production()
    }
}

fn default_keywords() -> Vec<String> {
    [
        "chatgpt",
        "openai",
        "claude.ai",
        "anthropic",
        "bard",
        "gemini",
        "copilot",
        "perplexity.ai",
        "deepseek",
        "poe.com",
        "grok",
        "qwen",
        "mistral.ai",
        "meta.ai",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_policy_is_enabled_with_sane_defaults() {
        let policy = DetectionPolicy::production();
        assert!(policy.enabled);
        assert_eq!(policy.temporal_required_votes, 2);
        assert!(!policy.collect_frame_bytes);
        assert!(!policy.collect_thumbnail_bytes);
        assert!(policy.keywords.iter().any(|k| k == "chatgpt"));
    }

    #[test]
    fn test_policy_round_trips_through_json() {
        let policy = DetectionPolicy::production();
        let json = serde_json::to_string(&policy).unwrap();
        let back: DetectionPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }
}
