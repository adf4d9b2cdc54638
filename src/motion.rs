//! # Motion analyzer
//!
//! Turns a stream of accelerometer magnitude samples into two booleans the
//! state machine consumes: "is the tracker sitting still" and "did something
//! just happen" (a jump, or a free-fall dropout of the magnitude).
//!
//! The analyzer owns only a ring of recent samples; it never time-stamps
//! anything, matching spec.md 4.2 ("the analyzer itself does not
//! time-stamp; the state machine consumes predicates against its own
//! timers").

use heapless::HistoryBuffer;

/// Default ring capacity (spec.md 4.2, "N configurable, default ~50").
pub const DEFAULT_WINDOW: usize = 50;

/// Runtime-adjustable thresholds (spec.md 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionConfig {
    /// `isStill` fires when `max(window) - min(window)` stays under this, in g.
    pub still_threshold_g: f32,
    /// `hasJump` fires when the delta between the last two samples exceeds this, in g.
    pub jump_threshold_g: f32,
    /// Below this magnitude the sample is treated as a free-fall dropout.
    pub free_fall_threshold_g: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self { still_threshold_g: 0.03, jump_threshold_g: 0.5, free_fall_threshold_g: 0.2 }
    }
}

/// Rolling accelerometer-magnitude analyzer with a fixed-capacity ring buffer.
pub struct MotionAnalyzer<const N: usize = DEFAULT_WINDOW> {
    window: HistoryBuffer<f32, N>,
    previous_sample: Option<f32>,
    config: MotionConfig,
}

impl<const N: usize> MotionAnalyzer<N> {
    pub fn new(config: MotionConfig) -> Self {
        Self { window: HistoryBuffer::new(), previous_sample: None, config }
    }

    pub fn config(&self) -> MotionConfig {
        self.config
    }

    pub fn set_config(&mut self, config: MotionConfig) {
        self.config = config;
    }

    /// Push the Euclidean magnitude of one 3-axis sample, in g.
    pub fn push(&mut self, magnitude_g: f32) {
        self.previous_sample = self.window.recent().copied();
        self.window.write(magnitude_g);
    }

    /// `max(window) - min(window) < still_threshold`. An empty window is not still.
    pub fn is_still(&self) -> bool {
        if self.window.is_empty() {
            return false;
        }
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &v in self.window.oldest_ordered() {
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
        (max - min) < self.config.still_threshold_g
    }

    /// `|delta between last two samples| > jump_threshold`, or the latest
    /// sample reads below the free-fall threshold. Fewer than two samples
    /// never reports a jump.
    pub fn has_jump(&self) -> bool {
        let Some(latest) = self.window.recent().copied() else {
            return false;
        };
        let Some(previous) = self.previous_sample else {
            return false;
        };
        let delta = (latest - previous).abs();
        delta > self.config.jump_threshold_g || latest < self.config.free_fall_threshold_g
    }
}

impl<const N: usize> Default for MotionAnalyzer<N> {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_never_still_or_jumping() {
        let analyzer: MotionAnalyzer<10> = MotionAnalyzer::default();
        assert!(!analyzer.is_still());
        assert!(!analyzer.has_jump());
    }

    #[test]
    fn stable_samples_are_still() {
        let mut analyzer: MotionAnalyzer<10> = MotionAnalyzer::default();
        for _ in 0..10 {
            analyzer.push(1.0);
        }
        assert!(analyzer.is_still());
        assert!(!analyzer.has_jump());
    }

    #[test]
    fn a_wide_swing_is_not_still() {
        let mut analyzer: MotionAnalyzer<10> = MotionAnalyzer::default();
        analyzer.push(1.0);
        analyzer.push(1.5);
        assert!(!analyzer.is_still());
    }

    #[test]
    fn a_large_delta_is_a_jump() {
        let mut analyzer: MotionAnalyzer<10> = MotionAnalyzer::default();
        analyzer.push(1.0);
        analyzer.push(1.0 + 0.6);
        assert!(analyzer.has_jump());
    }

    #[test]
    fn free_fall_magnitude_is_a_jump() {
        let mut analyzer: MotionAnalyzer<10> = MotionAnalyzer::default();
        analyzer.push(1.0);
        analyzer.push(0.1);
        assert!(analyzer.has_jump());
    }

    #[test]
    fn ring_forgets_samples_past_capacity() {
        let mut analyzer: MotionAnalyzer<3> = MotionAnalyzer::default();
        analyzer.push(1.0);
        analyzer.push(1.0);
        analyzer.push(1.0);
        analyzer.push(5.0); // pushes out the first 1.0
        analyzer.push(5.0);
        analyzer.push(5.0);
        assert!(analyzer.is_still());
    }
}
