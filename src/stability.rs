//! Frame stability scoring
//!
//! Compares two captured frames and produces a normalized similarity score
//! plus a verdict used by the session loop to decide whether a scroll step
//! has settled and whether a frame is worth committing. Pure functions over
//! pixel buffers, no state.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::frame::Frame;

/// Per-channel difference above which a sampled pixel counts as changed
const PIXEL_DIFF_THRESHOLD: u8 = 30;

/// Quality verdict for a frame transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Frames are near-identical in layout terms; safe to trust
    Good,
    /// Noticeable change but enough overlap to keep the frame
    Partial,
    /// Transition is garbage (tearing, mid-render, unrelated content)
    Bad,
}

/// Result of classifying a frame pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Normalized similarity in [0, 1]; 1.0 means identical samples
    pub score: f64,
    pub verdict: Verdict,
}

impl Classification {
    /// Whether the pair is close enough to identical to count as
    /// "no pixel motion" for end-of-content bookkeeping. Reported
    /// alongside `Good`, not instead of it.
    pub fn is_no_change(&self, epsilon: f64) -> bool {
        self.score >= epsilon
    }
}

/// Stateless frame-pair classifier
#[derive(Debug, Clone, Copy)]
pub struct StabilityDetector {
    good_threshold: f64,
    partial_threshold: f64,
    pixel_threshold: u8,
}

impl StabilityDetector {
    pub fn new(config: &Config) -> Self {
        Self {
            good_threshold: config.good_threshold,
            partial_threshold: config.partial_threshold,
            pixel_threshold: PIXEL_DIFF_THRESHOLD,
        }
    }

    /// Score `current` against `previous`.
    ///
    /// Samples pixels on a stride (coarser for large frames) and counts a
    /// sample as changed when any RGBA channel moves by more than the pixel
    /// threshold. Score is the unchanged fraction of samples. Mismatched
    /// dimensions are unconditionally `Bad` with score 0.
    pub fn classify(&self, previous: &Frame, current: &Frame) -> Classification {
        if !previous.same_dimensions(current) || current.pixel_count() == 0 {
            return Classification {
                score: 0.0,
                verdict: Verdict::Bad,
            };
        }

        let prev = previous.data();
        let cur = current.data();
        let total_pixels = current.pixel_count();

        let stride = 4;
        let sample_rate = if total_pixels > 2_000_000 { 4 } else { 2 };

        let mut sampled = 0usize;
        let mut changed = 0usize;

        for i in (0..total_pixels).step_by(sample_rate) {
            let idx = i * stride;
            if idx + 3 >= cur.len() || idx + 3 >= prev.len() {
                continue;
            }
            sampled += 1;

            let r_diff = (cur[idx] as i16 - prev[idx] as i16).abs();
            let g_diff = (cur[idx + 1] as i16 - prev[idx + 1] as i16).abs();
            let b_diff = (cur[idx + 2] as i16 - prev[idx + 2] as i16).abs();
            let a_diff = (cur[idx + 3] as i16 - prev[idx + 3] as i16).abs();

            let max_diff = r_diff.max(g_diff).max(b_diff).max(a_diff);
            if max_diff > self.pixel_threshold as i16 {
                changed += 1;
            }
        }

        let score = if sampled > 0 {
            1.0 - (changed as f64 / sampled as f64)
        } else {
            0.0
        };

        let verdict = if score >= self.good_threshold {
            Verdict::Good
        } else if score >= self.partial_threshold {
            Verdict::Partial
        } else {
            Verdict::Bad
        };

        Classification { score, verdict }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> StabilityDetector {
        StabilityDetector::new(&Config::default())
    }

    /// Frame whose first `dark` pixels are black and the rest white
    fn striped(width: u32, height: u32, dark: usize) -> Frame {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 4);
        for i in 0..pixels {
            if i < dark {
                data.extend_from_slice(&[0, 0, 0, 255]);
            } else {
                data.extend_from_slice(&[255, 255, 255, 255]);
            }
        }
        Frame::from_rgba(width, height, data).unwrap()
    }

    #[test]
    fn test_identical_frames_are_good_and_no_change() {
        let d = detector();
        let a = Frame::solid(20, 20, [200, 200, 200, 255]);
        let b = a.clone();
        let c = d.classify(&a, &b);
        assert_eq!(c.score, 1.0);
        assert_eq!(c.verdict, Verdict::Good);
        assert!(c.is_no_change(Config::default().no_change_epsilon));
    }

    #[test]
    fn test_opposite_frames_are_bad() {
        let d = detector();
        let white = Frame::solid(20, 20, [255, 255, 255, 255]);
        let black = Frame::solid(20, 20, [0, 0, 0, 255]);
        let c = d.classify(&white, &black);
        assert_eq!(c.score, 0.0);
        assert_eq!(c.verdict, Verdict::Bad);
        assert!(!c.is_no_change(Config::default().no_change_epsilon));
    }

    #[test]
    fn test_forty_percent_changed_frame_is_partial() {
        let d = detector();
        let white = Frame::solid(20, 20, [255, 255, 255, 255]);
        // 160 of 400 pixels changed; sampling preserves the ratio on a
        // contiguous run
        let partial = striped(20, 20, 160);
        let c = d.classify(&white, &partial);
        assert!((c.score - 0.6).abs() < 0.05, "score = {}", c.score);
        assert_eq!(c.verdict, Verdict::Partial);
    }

    #[test]
    fn test_small_change_is_good_but_not_no_change() {
        let d = detector();
        let white = Frame::solid(20, 20, [255, 255, 255, 255]);
        // 20 of 400 pixels changed -> score ~0.95
        let nearly = striped(20, 20, 20);
        let c = d.classify(&white, &nearly);
        assert!(c.score >= Config::default().good_threshold);
        assert_eq!(c.verdict, Verdict::Good);
        assert!(!c.is_no_change(Config::default().no_change_epsilon));
    }

    #[test]
    fn test_dimension_mismatch_is_bad() {
        let d = detector();
        let a = Frame::solid(10, 10, [0, 0, 0, 255]);
        let b = Frame::solid(10, 12, [0, 0, 0, 255]);
        let c = d.classify(&a, &b);
        assert_eq!(c.score, 0.0);
        assert_eq!(c.verdict, Verdict::Bad);
    }

    #[test]
    fn test_sub_threshold_noise_ignored() {
        let d = detector();
        let a = Frame::solid(20, 20, [100, 100, 100, 255]);
        // +20 per channel is under the pixel diff threshold
        let b = Frame::solid(20, 20, [120, 120, 120, 255]);
        let c = d.classify(&a, &b);
        assert_eq!(c.score, 1.0);
        assert_eq!(c.verdict, Verdict::Good);
    }
}
