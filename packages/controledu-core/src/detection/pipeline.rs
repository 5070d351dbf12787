//! The four-stage pipeline (C6), composed end to end: frame-change
//! filter → metadata rule → optional ML detectors → fusion + temporal
//! smoothing, including the frame re-use optimization.

use super::fusion::{fuse, SmoothedResult, TemporalSmoother};
use super::metadata;
use super::ml::MlDetector;
use super::phash::FrameChangeState;
use super::policy::DetectionPolicy;
use super::types::DetectionResult;

/// One observation fed into the pipeline for a single evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct DetectionObservation {
    pub timestamp_utc: i64,
    pub frame_bytes: Option<Vec<u8>>,
    pub active_process_name: Option<String>,
    pub active_window_title: Option<String>,
    pub browser_hint_url: Option<String>,
}

/// Final outcome of one `Pipeline::analyze` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineDecision {
    pub result: DetectionResult,
    pub should_emit: bool,
    /// `true` when stage A determined the frame was unchanged and this
    /// decision reuses the previous raw fused result rather than
    /// re-running stages B/C.
    pub cached: bool,
}

/// Per-student pipeline state: frame-change filter memory plus the
/// temporal smoother's sliding window and cooldown table.
pub struct Pipeline {
    frame_change: FrameChangeState,
    smoother: TemporalSmoother,
    last_raw_fused: Option<DetectionResult>,
    ml_detectors: Vec<Box<dyn MlDetector>>,
}

impl Pipeline {
    pub fn new(policy: &DetectionPolicy) -> Self {
        Self {
            frame_change: FrameChangeState::new(),
            smoother: TemporalSmoother::new(
                policy.temporal_window_size,
                policy.temporal_required_votes,
                policy.cooldown_seconds,
            ),
            last_raw_fused: None,
            ml_detectors: Vec::new(),
        }
    }

    /// Install the ML detectors (Stage C) this pipeline should consult.
    /// Detectors that disabled themselves (missing/invalid model
    /// artifact) are kept in the list but contribute `None` on every
    /// call, per §4.7's degrade-silently contract.
    pub fn with_ml_detectors(mut self, detectors: Vec<Box<dyn MlDetector>>) -> Self {
        self.ml_detectors = detectors;
        self
    }

    /// Run one evaluation pass for `observation` under `policy`.
    pub fn analyze(&mut self, observation: &DetectionObservation, policy: &DetectionPolicy) -> PipelineDecision {
        if !policy.enabled {
            let result = DetectionResult::negative("Detection disabled by policy");
            return PipelineDecision {
                result,
                should_emit: false,
                cached: false,
            };
        }

        let frame_change = self.frame_change.evaluate(
            observation.frame_bytes.as_deref(),
            policy.frame_change_threshold,
            policy.min_recheck_interval_seconds,
        );

        let raw_fused = if frame_change.should_analyze {
            let metadata_result = metadata::evaluate(
                observation.active_process_name.as_deref(),
                observation.active_window_title.as_deref(),
                observation.browser_hint_url.as_deref(),
                &policy.keywords,
                &policy.whitelist_keywords,
            );

            let ml_results: Vec<DetectionResult> = self
                .ml_detectors
                .iter()
                .filter_map(|d| d.infer(observation.frame_bytes.as_deref(), policy.ml_threshold))
                .collect();

            let fused = fuse(&metadata_result, &ml_results, policy.metadata_threshold, policy.ml_threshold);
            self.last_raw_fused = Some(fused.clone());
            fused
        } else {
            match &self.last_raw_fused {
                Some(previous) => {
                    let mut reused = previous.clone();
                    reused.reason = "Frame unchanged; reused previous detection".into();
                    reused
                }
                None => DetectionResult::negative("No previous detection to reuse"),
            }
        };

        let SmoothedResult { result, should_emit } = self.smoother.feed(raw_fused, observation.timestamp_utc);

        PipelineDecision {
            result,
            // Frame re-use never emits a new alert (§4.7).
            should_emit: should_emit && frame_change.should_analyze,
            cached: !frame_change.should_analyze,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_with_keyword(keyword: &str) -> DetectionPolicy {
        let mut policy = DetectionPolicy::production();
        policy.keywords = vec![keyword.to_string()];
        policy.whitelist_keywords = Vec::new();
        policy.temporal_window_size = 1;
        policy.temporal_required_votes = 1;
        policy.cooldown_seconds = 0;
        policy
    }

    fn solid_jpeg(value: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([value, value, value]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[test]
    fn test_disabled_policy_never_emits() {
        let mut policy = policy_with_keyword("chatgpt");
        policy.enabled = false;
        let mut pipeline = Pipeline::new(&policy);
        let observation = DetectionObservation {
            timestamp_utc: 0,
            frame_bytes: Some(solid_jpeg(1)),
            active_window_title: Some("ChatGPT".into()),
            ..Default::default()
        };
        let decision = pipeline.analyze(&observation, &policy);
        assert!(!decision.should_emit);
        assert!(!decision.result.is_ai_ui_detected);
    }

    #[test]
    fn test_metadata_positive_flows_through_to_emit() {
        let policy = policy_with_keyword("chatgpt");
        let mut pipeline = Pipeline::new(&policy);
        let observation = DetectionObservation {
            timestamp_utc: 1000,
            frame_bytes: Some(solid_jpeg(10)),
            active_window_title: Some("ChatGPT - chat".into()),
            ..Default::default()
        };
        let decision = pipeline.analyze(&observation, &policy);
        assert!(decision.result.is_ai_ui_detected);
        assert!(decision.should_emit);
        assert!(!decision.cached);
    }

    #[test]
    fn test_unchanged_frame_reuses_previous_and_never_emits() {
        let policy = policy_with_keyword("chatgpt");
        let mut pipeline = Pipeline::new(&policy);
        let frame = solid_jpeg(30);

        let observation = DetectionObservation {
            timestamp_utc: 1000,
            frame_bytes: Some(frame.clone()),
            active_window_title: Some("ChatGPT - chat".into()),
            ..Default::default()
        };
        let first = pipeline.analyze(&observation, &policy);
        assert!(first.should_emit);

        let second_observation = DetectionObservation {
            timestamp_utc: 1001,
            frame_bytes: Some(frame),
            active_window_title: Some("ChatGPT - chat".into()),
            ..Default::default()
        };
        let second = pipeline.analyze(&second_observation, &policy);
        assert!(second.cached);
        assert!(!second.should_emit);
        assert_eq!(second.result.reason, "Frame unchanged; reused previous detection");
    }

    #[test]
    fn test_no_frame_bytes_still_runs_metadata_every_time() {
        let policy = policy_with_keyword("chatgpt");
        let mut pipeline = Pipeline::new(&policy);
        let observation = DetectionObservation {
            timestamp_utc: 1000,
            frame_bytes: None,
            active_window_title: Some("ChatGPT".into()),
            ..Default::default()
        };
        let decision = pipeline.analyze(&observation, &policy);
        assert!(decision.result.is_ai_ui_detected);
        assert!(!decision.cached);
    }
}
