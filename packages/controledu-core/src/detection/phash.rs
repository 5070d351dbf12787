//! Stage A — frame-change filter (perceptual hash).
//!
//! Downscales the incoming JPEG to 8×8 grayscale and builds a 64-bit
//! average-hash (bit i = gray_i ≥ mean). Hamming distance against the
//! previous hash decides whether the more expensive stages need to
//! re-run. Pure compute; never blocks (§5).

use image::imageops::FilterType;
use image::GenericImageView;

use crate::time::now_timestamp;

const HASH_SIZE: u32 = 8;

/// Result of running the frame-change filter on one observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameChangeResult {
    pub should_analyze: bool,
    pub frame_changed: bool,
    /// 16-hex-char rendering of the 64-bit average hash, if one could be
    /// computed (absent only when there were no frame bytes at all and
    /// no previous hash to fall back to).
    pub hash_hex: Option<String>,
}

/// Per-student mutable state the frame-change filter carries across
/// calls: the last computed hash and when it was last (successfully or
/// forcibly) analyzed.
#[derive(Debug, Clone, Default)]
pub struct FrameChangeState {
    last_hash: Option<u64>,
    last_analyzed_at: Option<i64>,
}

impl FrameChangeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate one observation's JPEG bytes (if any) against the
    /// carried state, mutating it in place.
    ///
    /// - No previous hash, or no frame bytes: `should_analyze = true`.
    /// - Decode failure: `frame_changed = true`, `should_analyze = true`,
    ///   and the previous hash is left untouched (§9 open question,
    ///   resolved in favor of preserving it) so a later valid frame
    ///   remains comparable.
    /// - Otherwise: Hamming distance against the previous hash decides,
    ///   with a time-based force-recheck floor.
    pub fn evaluate(
        &mut self,
        frame_bytes: Option<&[u8]>,
        frame_change_threshold: u32,
        min_recheck_interval_seconds: u32,
    ) -> FrameChangeResult {
        let now = now_timestamp();

        let Some(bytes) = frame_bytes else {
            return FrameChangeResult {
                should_analyze: true,
                frame_changed: self.last_hash.is_none(),
                hash_hex: self.last_hash.map(hash_to_hex),
            };
        };

        let new_hash = match average_hash(bytes) {
            Ok(h) => h,
            Err(_) => {
                // Decoder failure: force analysis, keep last_hash intact.
                return FrameChangeResult {
                    should_analyze: true,
                    frame_changed: true,
                    hash_hex: self.last_hash.map(hash_to_hex),
                };
            }
        };

        let result = match self.last_hash {
            None => FrameChangeResult {
                should_analyze: true,
                frame_changed: true,
                hash_hex: Some(hash_to_hex(new_hash)),
            },
            Some(prev) => {
                let distance = hamming_distance(prev, new_hash);
                let changed = distance > frame_change_threshold;
                let recheck_due = self
                    .last_analyzed_at
                    .map(|t| now - t >= min_recheck_interval_seconds as i64)
                    .unwrap_or(true);
                FrameChangeResult {
                    should_analyze: changed || recheck_due,
                    frame_changed: changed,
                    hash_hex: Some(hash_to_hex(new_hash)),
                }
            }
        };

        self.last_hash = Some(new_hash);
        if result.should_analyze {
            self.last_analyzed_at = Some(now);
        }
        result
    }
}

/// 64-bit average-hash of a JPEG/PNG image.
pub fn average_hash(bytes: &[u8]) -> Result<u64, image::ImageError> {
    let img = image::load_from_memory(bytes)?;
    let small = img.resize_exact(HASH_SIZE, HASH_SIZE, FilterType::Triangle);
    let gray = small.to_luma8();

    let pixels: Vec<u8> = gray.pixels().map(|p| p.0[0]).collect();
    let mean = pixels.iter().map(|&p| p as u32).sum::<u32>() / pixels.len() as u32;

    let mut hash: u64 = 0;
    for (i, &p) in pixels.iter().enumerate() {
        if p as u32 >= mean {
            hash |= 1 << i;
        }
    }
    Ok(hash)
}

fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

fn hash_to_hex(hash: u64) -> String {
    format!("{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_jpeg(value: u8) -> Vec<u8> {
        let img = image::RgbImage::from_pixel(16, 16, image::Rgb([value, value, value]));
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Jpeg)
            .unwrap();
        buf
    }

    #[test]
    fn test_no_previous_hash_always_analyzes() {
        let mut state = FrameChangeState::new();
        let jpeg = solid_jpeg(128);
        let result = state.evaluate(Some(&jpeg), 2, 120);
        assert!(result.should_analyze);
        assert!(result.hash_hex.is_some());
    }

    #[test]
    fn test_no_frame_bytes_always_analyzes() {
        let mut state = FrameChangeState::new();
        let result = state.evaluate(None, 2, 120);
        assert!(result.should_analyze);
    }

    /// Seed scenario 4: same JPEG twice within 1s, threshold=2,
    /// min_recheck=120s: first true, second false+unchanged+same hash.
    #[test]
    fn test_seed_scenario_same_jpeg_twice() {
        let mut state = FrameChangeState::new();
        let jpeg = solid_jpeg(100);

        let first = state.evaluate(Some(&jpeg), 2, 120);
        assert!(first.should_analyze);

        let second = state.evaluate(Some(&jpeg), 2, 120);
        assert!(!second.should_analyze);
        assert!(!second.frame_changed);
        assert_eq!(first.hash_hex, second.hash_hex);
        assert_eq!(second.hash_hex.as_ref().unwrap().len(), 16);
    }

    #[test]
    fn test_very_different_frame_triggers_change() {
        let mut state = FrameChangeState::new();
        state.evaluate(Some(&solid_jpeg(10)), 2, 120);
        let result = state.evaluate(Some(&solid_jpeg(245)), 2, 120);
        assert!(result.should_analyze);
        assert!(result.frame_changed);
    }

    #[test]
    fn test_decode_failure_preserves_last_hash() {
        let mut state = FrameChangeState::new();
        let jpeg = solid_jpeg(50);
        let first = state.evaluate(Some(&jpeg), 2, 120);
        let garbage = vec![0xFFu8; 8];
        let during_failure = state.evaluate(Some(&garbage), 2, 120);
        assert!(during_failure.should_analyze);
        assert!(during_failure.frame_changed);
        // last_hash untouched: a subsequent identical-to-first frame is
        // recognized as unchanged.
        let after_failure = state.evaluate(Some(&jpeg), 2, 120);
        assert!(!after_failure.frame_changed);
        assert_eq!(first.hash_hex, after_failure.hash_hex);
    }

    #[test]
    fn test_recheck_interval_forces_analysis_even_when_unchanged() {
        let mut state = FrameChangeState::new();
        let jpeg = solid_jpeg(77);
        state.evaluate(Some(&jpeg), 2, 0);
        let result = state.evaluate(Some(&jpeg), 2, 0);
        assert!(result.should_analyze);
        assert!(!result.frame_changed);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(0b1010, 0b1010), 0);
        assert_eq!(hamming_distance(0b1010, 0b0101), 4);
    }
}
