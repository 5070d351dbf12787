//! Stage D — fusion and temporal smoothing.

use std::collections::{HashSet, VecDeque};

use super::types::{clamp_confidence, DetectionClass, DetectionResult, StageSource};
use crate::time::now_timestamp;

/// Merge a metadata-rule result and zero or more ML results into one raw
/// fused result.
///
/// Accepts the metadata result if its confidence ≥ `metadata_threshold`
/// and each ML result if its confidence ≥ `ml_threshold`; picks the
/// highest-confidence among accepted contributions and merges the
/// triggered-keyword sets. Returns a negative result if nothing is
/// accepted.
pub fn fuse(
    metadata: &DetectionResult,
    ml_results: &[DetectionResult],
    metadata_threshold: f32,
    ml_threshold: f32,
) -> DetectionResult {
    let mut accepted: Vec<&DetectionResult> = Vec::new();

    if metadata.is_ai_ui_detected && metadata.confidence >= metadata_threshold {
        accepted.push(metadata);
    }
    for ml in ml_results {
        if ml.is_ai_ui_detected && ml.confidence >= ml_threshold {
            accepted.push(ml);
        }
    }

    let Some(best) = accepted
        .iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    else {
        return DetectionResult::negative("No stage accepted above threshold");
    };

    let mut keywords: HashSet<String> = HashSet::new();
    for r in &accepted {
        keywords.extend(r.triggered_keywords.iter().cloned());
    }
    let mut triggered_keywords: Vec<String> = keywords.into_iter().collect();
    triggered_keywords.sort();

    DetectionResult {
        is_ai_ui_detected: true,
        confidence: clamp_confidence(best.confidence),
        class: best.class,
        stage_source: StageSource::Fused,
        reason: format!("Fused from {} accepted stage(s)", accepted.len()),
        model_version: best.model_version.clone(),
        triggered_keywords,
        is_stable: false,
    }
}

/// One vote in the temporal smoother's sliding window.
#[derive(Debug, Clone)]
struct Vote {
    timestamp: i64,
    result: DetectionResult,
}

/// Outcome of feeding one raw fused result through the smoother.
#[derive(Debug, Clone, PartialEq)]
pub struct SmoothedResult {
    pub result: DetectionResult,
    pub should_emit: bool,
}

/// Majority voter over a sliding window of the last N fused results,
/// with a per-class cooldown to prevent alert storms.
#[derive(Debug, Clone)]
pub struct TemporalSmoother {
    window_size: usize,
    required_votes: usize,
    cooldown_seconds: i64,
    window: VecDeque<Vote>,
    last_alert_at: std::collections::HashMap<DetectionClass, i64>,
}

impl TemporalSmoother {
    pub fn new(window_size: usize, required_votes: usize, cooldown_seconds: i64) -> Self {
        Self {
            window_size: window_size.max(1),
            required_votes,
            cooldown_seconds,
            window: VecDeque::new(),
            last_alert_at: std::collections::HashMap::new(),
        }
    }

    /// Feed one raw fused result at `timestamp` (unix seconds) through
    /// the sliding window and cooldown gate.
    pub fn feed(&mut self, fused: DetectionResult, timestamp: i64) -> SmoothedResult {
        self.window.push_back(Vote {
            timestamp,
            result: fused,
        });
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }

        let positives: Vec<&Vote> = self
            .window
            .iter()
            .filter(|v| v.result.is_ai_ui_detected)
            .collect();

        let is_stable = positives.len() >= self.required_votes;

        if !is_stable {
            let mut result = self.window.back().unwrap().result.clone();
            result.is_stable = false;
            return SmoothedResult {
                result,
                should_emit: false,
            };
        }

        let class = plurality_class(&positives);
        let confidences: Vec<f32> = positives
            .iter()
            .filter(|v| v.result.class == class)
            .map(|v| v.result.confidence)
            .collect();
        let mean_confidence = clamp_confidence(confidences.iter().sum::<f32>() / confidences.len() as f32);

        let mut merged_keywords: HashSet<String> = HashSet::new();
        for v in &positives {
            if v.result.class == class {
                merged_keywords.extend(v.result.triggered_keywords.iter().cloned());
            }
        }
        let mut triggered_keywords: Vec<String> = merged_keywords.into_iter().collect();
        triggered_keywords.sort();

        let within_cooldown = self
            .last_alert_at
            .get(&class)
            .map(|&last| timestamp - last < self.cooldown_seconds)
            .unwrap_or(false);

        let result = DetectionResult {
            is_ai_ui_detected: true,
            confidence: mean_confidence,
            class,
            stage_source: StageSource::Fused,
            reason: "Temporal smoother: stable positive".into(),
            model_version: None,
            triggered_keywords,
            is_stable: true,
        };

        if within_cooldown {
            SmoothedResult {
                result,
                should_emit: false,
            }
        } else {
            self.last_alert_at.insert(class, timestamp);
            SmoothedResult {
                result,
                should_emit: true,
            }
        }
    }
}

/// Plurality positive class among `positives`; ties broken by higher
/// max confidence, then by most recent timestamp.
fn plurality_class(positives: &[&Vote]) -> DetectionClass {
    use std::collections::HashMap;

    let mut counts: HashMap<DetectionClass, usize> = HashMap::new();
    let mut max_confidence: HashMap<DetectionClass, f32> = HashMap::new();
    let mut most_recent: HashMap<DetectionClass, i64> = HashMap::new();

    for v in positives {
        let class = v.result.class;
        *counts.entry(class).or_insert(0) += 1;
        max_confidence
            .entry(class)
            .and_modify(|c| *c = c.max(v.result.confidence))
            .or_insert(v.result.confidence);
        most_recent
            .entry(class)
            .and_modify(|t| *t = (*t).max(v.timestamp))
            .or_insert(v.timestamp);
    }

    counts
        .into_iter()
        .max_by(|(ca, na), (cb, nb)| {
            na.cmp(nb)
                .then_with(|| max_confidence[ca].total_cmp(&max_confidence[cb]))
                .then_with(|| most_recent[ca].cmp(&most_recent[cb]))
        })
        .map(|(class, _)| class)
        .unwrap_or(DetectionClass::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::ml::synthetic_positive;

    fn positive(class: DetectionClass, confidence: f32) -> DetectionResult {
        synthetic_positive(class, confidence, StageSource::MetadataRule)
    }

    #[test]
    fn test_fuse_picks_highest_confidence_accepted() {
        let metadata = positive(DetectionClass::ChatGpt, 0.7);
        let ml = positive(DetectionClass::Claude, 0.9);
        let fused = fuse(&metadata, &[ml], 0.6, 0.75);
        assert_eq!(fused.class, DetectionClass::Claude);
        assert!(fused.is_ai_ui_detected);
    }

    #[test]
    fn test_fuse_rejects_below_threshold() {
        let metadata = positive(DetectionClass::ChatGpt, 0.5);
        let fused = fuse(&metadata, &[], 0.6, 0.75);
        assert!(!fused.is_ai_ui_detected);
    }

    #[test]
    fn test_fuse_merges_keywords() {
        let mut metadata = positive(DetectionClass::ChatGpt, 0.8);
        metadata.triggered_keywords = vec!["chatgpt".into()];
        let mut ml = positive(DetectionClass::ChatGpt, 0.9);
        ml.triggered_keywords = vec!["gpt".into()];
        let fused = fuse(&metadata, &[ml], 0.6, 0.75);
        assert_eq!(fused.triggered_keywords, vec!["chatgpt".to_string(), "gpt".to_string()]);
    }

    /// Seed scenario 1: window=3, requiredVotes=2, cooldown=30s; feed
    /// positive(0.85) at t0, positive(0.90) at t0+1. First call not
    /// stable, second is.
    #[test]
    fn test_seed_scenario_temporal_smoother_becomes_stable() {
        let mut smoother = TemporalSmoother::new(3, 2, 30);
        let first = smoother.feed(positive(DetectionClass::ChatGpt, 0.85), 1000);
        assert!(!first.result.is_stable);
        assert!(!first.should_emit);

        let second = smoother.feed(positive(DetectionClass::ChatGpt, 0.90), 1001);
        assert!(second.result.is_stable);
        assert!(second.result.is_ai_ui_detected);
        assert!(second.should_emit);
    }

    /// Seed scenario 2: window=1, requiredVotes=1, cooldown=20s; feed
    /// positive(0.88) at t0, t0+2, t0+25. shouldEmit = true, false, true.
    #[test]
    fn test_seed_scenario_cooldown_suppression() {
        let mut smoother = TemporalSmoother::new(1, 1, 20);
        let a = smoother.feed(positive(DetectionClass::Gemini, 0.88), 1000);
        assert!(a.should_emit);
        let b = smoother.feed(positive(DetectionClass::Gemini, 0.88), 1002);
        assert!(!b.should_emit);
        let c = smoother.feed(positive(DetectionClass::Gemini, 0.88), 1025);
        assert!(c.should_emit);
    }

    #[test]
    fn test_at_most_one_alert_per_class_within_cooldown() {
        let mut smoother = TemporalSmoother::new(1, 1, 100);
        let mut emits = 0;
        for t in (0..500).step_by(10) {
            if smoother.feed(positive(DetectionClass::Claude, 0.9), t as i64).should_emit {
                emits += 1;
            }
        }
        assert_eq!(emits, 5);
    }

    #[test]
    fn test_different_classes_independent_cooldowns() {
        let mut smoother = TemporalSmoother::new(1, 1, 100);
        assert!(smoother.feed(positive(DetectionClass::Claude, 0.9), 0).should_emit);
        // A different class is not suppressed by Claude's cooldown.
        assert!(smoother.feed(positive(DetectionClass::Gemini, 0.9), 1).should_emit);
    }

    #[test]
    fn test_plurality_tie_broken_by_confidence_then_recency() {
        let mut smoother = TemporalSmoother::new(4, 2, 0);
        smoother.feed(positive(DetectionClass::ChatGpt, 0.7), 0);
        smoother.feed(positive(DetectionClass::Claude, 0.95), 1);
        let result = smoother.feed(positive(DetectionClass::Claude, 0.6), 2);
        // Claude has 2 votes vs ChatGpt's 1 -> Claude wins by count.
        assert_eq!(result.result.class, DetectionClass::Claude);
    }

    #[test]
    fn test_not_enough_votes_reports_unstable_with_last_result() {
        let mut smoother = TemporalSmoother::new(5, 3, 10);
        let result = smoother.feed(positive(DetectionClass::Poe, 0.8), 0);
        assert!(!result.result.is_stable);
        assert!(!result.should_emit);
    }
}
