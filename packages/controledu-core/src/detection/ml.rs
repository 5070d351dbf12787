//! Stage C — optional ML detectors.
//!
//! The ONNX runtime integration itself is an external collaborator
//! (§1): out of scope here. What IS in scope is the trait boundary and
//! the "degrade silently when the model artifact is absent or invalid"
//! contract, which is fully testable without a real model.

use std::path::{Path, PathBuf};

use super::types::{clamp_confidence, DetectionClass, DetectionResult, StageSource};

/// One ML classifier's contribution to the pipeline. Implementations
/// MUST NOT panic or error out when their model is unavailable — they
/// report themselves disabled instead (§1, §7 "External degradation").
pub trait MlDetector: Send + Sync {
    /// Whether this detector loaded a usable model.
    fn is_enabled(&self) -> bool;

    /// Run inference on an observation's frame bytes, if any. Returns
    /// `None` when the detector is disabled or the observation carries
    /// no frame bytes — "no contribution" per §4.7 Stage C.
    fn infer(&self, frame_bytes: Option<&[u8]>, threshold: f32) -> Option<DetectionResult>;

    /// Which [`StageSource`] results from this detector should be
    /// tagged with.
    fn stage_source(&self) -> StageSource;
}

/// Binary (AI-UI present / absent) classifier stub. Reports itself
/// disabled unless `model_path` resolves to a readable file; even then,
/// this workspace ships no ONNX runtime so `infer` always returns
/// `None` — the trait boundary and degrade-silently contract are what
/// this specification covers (§4.7).
pub struct BinaryMlDetector {
    enabled: bool,
    model_path: PathBuf,
}

impl BinaryMlDetector {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        let model_path = model_path.into();
        let enabled = model_path.is_file();
        Self { enabled, model_path }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl MlDetector for BinaryMlDetector {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn infer(&self, _frame_bytes: Option<&[u8]>, _threshold: f32) -> Option<DetectionResult> {
        if !self.enabled {
            return None;
        }
        // No ONNX runtime bundled in this workspace (§1 external
        // collaborator); a real implementation would run the session
        // here and map its sigmoid output through `threshold`.
        None
    }

    fn stage_source(&self) -> StageSource {
        StageSource::OnnxBinary
    }
}

/// Multiclass classifier stub, same degrade-silently contract as
/// [`BinaryMlDetector`], plus a label vocabulary mapping argmax indices
/// to [`DetectionClass`] values.
pub struct MulticlassMlDetector {
    enabled: bool,
    model_path: PathBuf,
    label_vocabulary: Vec<DetectionClass>,
}

impl MulticlassMlDetector {
    pub fn new(model_path: impl Into<PathBuf>, label_vocabulary: Vec<DetectionClass>) -> Self {
        let model_path = model_path.into();
        let enabled = model_path.is_file() && !label_vocabulary.is_empty();
        Self {
            enabled,
            model_path,
            label_vocabulary,
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Map an argmax label index to its class, if the vocabulary covers
    /// it and the class is not the sentinel `None`.
    pub fn label_for(&self, index: usize) -> Option<DetectionClass> {
        self.label_vocabulary.get(index).copied().filter(|c| *c != DetectionClass::None)
    }
}

impl MlDetector for MulticlassMlDetector {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn infer(&self, _frame_bytes: Option<&[u8]>, _threshold: f32) -> Option<DetectionResult> {
        if !self.enabled {
            return None;
        }
        None
    }

    fn stage_source(&self) -> StageSource {
        StageSource::OnnxMulticlass
    }
}

/// Build a positive [`DetectionResult`] for a hypothetical ML stage
/// contribution; exercised by tests that want to drive fusion (§4.7
/// Stage D) without a real model backing it.
#[cfg(any(test, feature = "test-support"))]
pub fn synthetic_positive(class: DetectionClass, confidence: f32, source: StageSource) -> DetectionResult {
    DetectionResult {
        is_ai_ui_detected: true,
        confidence: clamp_confidence(confidence),
        class,
        stage_source: source,
        reason: "synthetic ML contribution".into(),
        model_version: Some("test-v0".into()),
        triggered_keywords: Vec::new(),
        is_stable: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Seed scenario 6: ML model path points to a nonexistent file; the
    /// detector disables itself and contributes nothing.
    #[test]
    fn test_seed_scenario_missing_model_disables_detector() {
        let detector = BinaryMlDetector::new("/nonexistent/path/model.onnx");
        assert!(!detector.is_enabled());
        assert!(detector.infer(Some(b"fake jpeg bytes"), 0.75).is_none());
    }

    #[test]
    fn test_multiclass_detector_requires_nonempty_vocabulary() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let detector = MulticlassMlDetector::new(tmp.path(), Vec::new());
        assert!(!detector.is_enabled());
    }

    #[test]
    fn test_multiclass_detector_enabled_with_real_file_and_vocab() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let detector = MulticlassMlDetector::new(tmp.path(), vec![DetectionClass::ChatGpt, DetectionClass::Claude]);
        assert!(detector.is_enabled());
        assert_eq!(detector.label_for(0), Some(DetectionClass::ChatGpt));
    }

    #[test]
    fn test_label_for_none_sentinel_is_filtered() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let detector = MulticlassMlDetector::new(tmp.path(), vec![DetectionClass::None, DetectionClass::Gemini]);
        assert_eq!(detector.label_for(0), None);
        assert_eq!(detector.label_for(1), Some(DetectionClass::Gemini));
    }
}
