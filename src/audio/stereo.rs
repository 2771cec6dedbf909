//! Stereo correlation meter
//!
//! correlation = Σ(L×R) / sqrt(Σ(L²) × Σ(R²)) over a fixed window, smoothed.
//! +1 is mono, 0 is unrelated channels, -1 is fully out of phase.

/// Frames per correlation window (about 85 ms at 48 kHz)
const CORRELATION_WINDOW: usize = 4096;

/// Samples quieter than this don't move the meter
const SILENCE_THRESHOLD: f32 = 0.001;

pub struct StereoAnalyzer {
    sum_lr: f32,
    sum_l2: f32,
    sum_r2: f32,
    sample_count: usize,
    correlation: f32,
    /// Higher = smoother
    smoothing: f32,
}

impl StereoAnalyzer {
    pub fn new() -> Self {
        Self {
            sum_lr: 0.0,
            sum_l2: 0.0,
            sum_r2: 0.0,
            sample_count: 0,
            correlation: 1.0,
            smoothing: 0.95,
        }
    }

    pub fn push_sample(&mut self, left: f32, right: f32) {
        if left.abs().max(right.abs()) < SILENCE_THRESHOLD {
            return;
        }

        self.sum_lr += left * right;
        self.sum_l2 += left * left;
        self.sum_r2 += right * right;
        self.sample_count += 1;

        if self.sample_count >= CORRELATION_WINDOW {
            self.close_window();
        }
    }

    /// Push interleaved frames. Mono input reads as perfectly correlated.
    pub fn push_interleaved(&mut self, samples: &[f32], channels: usize) {
        match channels {
            0 => {}
            1 => {
                for &sample in samples {
                    self.push_sample(sample, sample);
                }
            }
            _ => {
                for frame in samples.chunks_exact(channels) {
                    self.push_sample(frame[0], frame[1]);
                }
            }
        }
    }

    fn close_window(&mut self) {
        let denom = (self.sum_l2 * self.sum_r2).sqrt();
        let raw = if denom > 0.0 {
            (self.sum_lr / denom).clamp(-1.0, 1.0)
        } else {
            1.0
        };

        self.correlation = self.correlation * self.smoothing + raw * (1.0 - self.smoothing);

        self.sum_lr = 0.0;
        self.sum_l2 = 0.0;
        self.sum_r2 = 0.0;
        self.sample_count = 0;
    }

    /// Smoothed correlation, -1.0 to +1.0
    pub fn correlation(&self) -> f32 {
        self.correlation
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for StereoAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(analyzer: &mut StereoAnalyzer, windows: usize, frame: impl Fn(usize) -> (f32, f32)) {
        for i in 0..windows * CORRELATION_WINDOW {
            let (l, r) = frame(i);
            analyzer.push_sample(l, r);
        }
    }

    #[test]
    fn test_mono_stays_correlated() {
        let mut analyzer = StereoAnalyzer::new();
        feed(&mut analyzer, 20, |i| {
            let s = (i as f32 * 0.05).sin() * 0.5;
            (s, s)
        });
        assert!(analyzer.correlation() > 0.99);
    }

    #[test]
    fn test_inverted_channels_trend_negative() {
        let mut analyzer = StereoAnalyzer::new();
        feed(&mut analyzer, 200, |i| {
            let s = (i as f32 * 0.05).sin() * 0.5;
            (s, -s)
        });
        assert!(analyzer.correlation() < -0.9);
    }

    #[test]
    fn test_silence_does_not_move_meter() {
        let mut analyzer = StereoAnalyzer::new();
        analyzer.push_interleaved(&vec![0.0; CORRELATION_WINDOW * 8], 2);
        assert_eq!(analyzer.correlation(), 1.0);
    }
}
