//! Wraps the four-stage detection pipeline (C6) with the bit of
//! student-side state the main loop needs to drive it: the last-applied
//! policy (so a `DetectionPolicyUpdated` push rebuilds the pipeline's
//! smoother) and the last check/result for the local status surface.

use controledu_core::detection::{
    BinaryMlDetector, DetectionObservation, DetectionPolicy, MlDetector, MulticlassMlDetector, Pipeline, PipelineDecision,
};

/// Paths to ML model artifacts the stub detectors probe for (§4.7 Stage
/// C). Absent files mean both detectors report themselves disabled and
/// the pipeline falls through to metadata-only detection.
pub struct MlModelPaths {
    pub binary_model_path: std::path::PathBuf,
    pub multiclass_model_path: std::path::PathBuf,
}

pub struct DetectionRunner {
    pipeline: Pipeline,
    policy: DetectionPolicy,
    model_paths: MlModelPaths,
    last_check_utc: Option<i64>,
    last_decision: Option<PipelineDecision>,
}

impl DetectionRunner {
    pub fn new(policy: DetectionPolicy, model_paths: MlModelPaths) -> Self {
        let pipeline = build_pipeline(&policy, &model_paths);
        Self {
            pipeline,
            policy,
            model_paths,
            last_check_utc: None,
            last_decision: None,
        }
    }

    pub fn policy(&self) -> &DetectionPolicy {
        &self.policy
    }

    /// Apply a policy pushed by the hub (`GetDetectionPolicy`'s reply or
    /// a future `DetectionPolicyUpdated` broadcast). Rebuilds the
    /// pipeline since the smoother's window/votes/cooldown are fixed at
    /// construction time.
    pub fn set_policy(&mut self, policy: DetectionPolicy) {
        self.pipeline = build_pipeline(&policy, &self.model_paths);
        self.policy = policy;
    }

    pub fn analyze(&mut self, observation: &DetectionObservation, now_utc: i64) -> PipelineDecision {
        self.last_check_utc = Some(now_utc);
        let decision = self.pipeline.analyze(observation, &self.policy);
        self.last_decision = Some(decision.clone());
        decision
    }

    pub fn last_check_utc(&self) -> Option<i64> {
        self.last_check_utc
    }

    pub fn last_decision(&self) -> Option<&PipelineDecision> {
        self.last_decision.as_ref()
    }
}

fn build_pipeline(policy: &DetectionPolicy, model_paths: &MlModelPaths) -> Pipeline {
    let detectors: Vec<Box<dyn MlDetector>> = vec![
        Box::new(BinaryMlDetector::new(&model_paths.binary_model_path)),
        Box::new(MulticlassMlDetector::new(&model_paths.multiclass_model_path, Vec::new())),
    ];
    Pipeline::new(policy).with_ml_detectors(detectors)
}
