//! # Detection pipeline (C6)
//!
//! Four stages, student-side: frame-change filter (A) → metadata rule
//! (B) → optional ML detectors (C) → fusion + temporal smoothing (D).
//! Stages A and B are pure compute and must never block (§5); stage C
//! is a trait boundary over an external ONNX runtime (§1, out of
//! scope).

mod fusion;
mod metadata;
mod ml;
mod phash;
mod pipeline;
mod policy;
mod types;

pub use fusion::{fuse, SmoothedResult, TemporalSmoother};
pub use ml::{BinaryMlDetector, MlDetector, MulticlassMlDetector};
pub use phash::{average_hash, FrameChangeResult, FrameChangeState};
pub use pipeline::{DetectionObservation, Pipeline, PipelineDecision};
pub use policy::{DetectionPolicy, ThumbnailGeometry};
pub use types::{clamp_confidence, DetectionClass, DetectionResult, StageSource};

#[cfg(any(test, feature = "test-support"))]
pub use ml::synthetic_positive;
