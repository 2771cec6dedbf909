//! FFT-based spectrum analyzer for the metering pipeline

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Number of frequency bands reported per snapshot
pub const NUM_BANDS: usize = 32;

/// FFT size (must be power of 2)
const FFT_SIZE: usize = 2048;

const MIN_FREQ: f32 = 20.0;
const MAX_FREQ: f32 = 20000.0;

/// Spectrum analyzer over a sliding window of the mono mix
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    history: Vec<f32>,
    write_pos: usize,
    windowed: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    window: Vec<f32>,
    /// FFT bins summed into each band
    band_bins: Vec<RangeInclusive<usize>>,
    band_magnitudes: [f32; NUM_BANDS],
    /// Higher = smoother, slower response
    smoothing: f32,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let spectrum = fft.make_output_vec();

        // Hann window
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = i as f32 / FFT_SIZE as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();

        let band_bins = Self::band_bins(sample_rate.max(1), spectrum.len());

        Self {
            fft,
            history: vec![0.0; FFT_SIZE],
            write_pos: 0,
            windowed: vec![0.0; FFT_SIZE],
            spectrum,
            window,
            band_bins,
            band_magnitudes: [0.0; NUM_BANDS],
            smoothing: 0.7,
        }
    }

    /// Log-spaced band centers from 20 Hz to min(20 kHz, Nyquist), each band
    /// spanning the midpoints to its neighbours
    fn band_bins(sample_rate: u32, num_bins: usize) -> Vec<RangeInclusive<usize>> {
        let nyquist = sample_rate as f32 / 2.0;
        let (log_min, log_max) = (MIN_FREQ.ln(), MAX_FREQ.min(nyquist).ln());
        let centers: Vec<f32> = (0..NUM_BANDS)
            .map(|i| {
                let t = i as f32 / (NUM_BANDS - 1) as f32;
                (log_min + t * (log_max - log_min)).exp()
            })
            .collect();

        let bin_freq = sample_rate as f32 / FFT_SIZE as f32;
        (0..NUM_BANDS)
            .map(|band| {
                let low = if band == 0 {
                    MIN_FREQ
                } else {
                    (centers[band - 1] + centers[band]) / 2.0
                };
                let high = if band == NUM_BANDS - 1 {
                    nyquist
                } else {
                    (centers[band] + centers[band + 1]) / 2.0
                };

                let low_bin = ((low / bin_freq) as usize).clamp(1, num_bins - 1);
                let high_bin = ((high / bin_freq) as usize).clamp(low_bin, num_bins - 1);
                low_bin..=high_bin
            })
            .collect()
    }

    /// Push interleaved samples; every frame is folded down to its mono mix
    pub fn push_interleaved(&mut self, samples: &[f32], channels: usize) {
        let channels = channels.max(1);
        for frame in samples.chunks_exact(channels) {
            self.history[self.write_pos] = frame.iter().sum::<f32>() / channels as f32;
            self.write_pos = (self.write_pos + 1) % FFT_SIZE;
        }
    }

    /// Compute the FFT over the latest window and fold it into the bands
    pub fn analyze(&mut self) {
        // Oldest sample first so the window lines up with the history
        for i in 0..FFT_SIZE {
            let sample = self.history[(self.write_pos + i) % FFT_SIZE];
            self.windowed[i] = sample * self.window[i];
        }

        if self.fft.process(&mut self.windowed, &mut self.spectrum).is_err() {
            return;
        }

        for (band, bins) in self.band_bins.iter().enumerate() {
            let count = bins.end() - bins.start() + 1;
            let sum: f32 = self.spectrum[bins.clone()].iter().map(|c| c.norm()).sum();
            let avg_mag = sum / count as f32;

            // Rough scaling for a Hann-windowed full-scale sine
            let normalized = (avg_mag / (FFT_SIZE as f32 / 4.0)).min(1.0);

            self.band_magnitudes[band] =
                self.band_magnitudes[band] * self.smoothing + normalized * (1.0 - self.smoothing);
        }
    }

    /// Band magnitudes, 0.0 - 1.0 linear
    pub fn magnitudes(&self) -> [f32; NUM_BANDS] {
        self.band_magnitudes
    }

    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.write_pos = 0;
        self.band_magnitudes.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loudest_band(analyzer: &SpectrumAnalyzer) -> usize {
        let magnitudes = analyzer.magnitudes();
        (0..NUM_BANDS)
            .max_by(|&a, &b| magnitudes[a].total_cmp(&magnitudes[b]))
            .unwrap()
    }

    #[test]
    fn test_silence_has_empty_spectrum() {
        let mut analyzer = SpectrumAnalyzer::new(48000);
        analyzer.push_interleaved(&[0.0; 4096], 2);
        analyzer.analyze();
        assert!(analyzer.magnitudes().iter().all(|&m| m == 0.0));
    }

    #[test]
    fn test_tone_lands_in_matching_band() {
        let sample_rate = 48000;
        let mut low = SpectrumAnalyzer::new(sample_rate);
        let mut high = SpectrumAnalyzer::new(sample_rate);

        let tone = |freq: f32| -> Vec<f32> {
            (0..FFT_SIZE)
                .flat_map(|i| {
                    let s = (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate as f32).sin();
                    [s, s]
                })
                .collect()
        };

        for _ in 0..10 {
            low.push_interleaved(&tone(100.0), 2);
            low.analyze();
            high.push_interleaved(&tone(8000.0), 2);
            high.analyze();
        }

        assert!(loudest_band(&low) < loudest_band(&high));
        assert!(low.magnitudes()[loudest_band(&low)] > 0.1);
    }

    #[test]
    fn test_band_ranges_stay_in_bounds_at_low_rates() {
        let analyzer = SpectrumAnalyzer::new(8000);
        let num_bins = FFT_SIZE / 2 + 1;
        for bins in &analyzer.band_bins {
            assert!(*bins.start() >= 1);
            assert!(*bins.end() < num_bins);
            assert!(bins.start() <= bins.end());
        }
    }

    #[test]
    fn test_reset_clears_bands() {
        let mut analyzer = SpectrumAnalyzer::new(44100);
        let noise: Vec<f32> = (0..4096).map(|i| ((i * 7919) % 200) as f32 / 100.0 - 1.0).collect();
        analyzer.push_interleaved(&noise, 1);
        analyzer.analyze();
        analyzer.reset();
        assert!(analyzer.magnitudes().iter().all(|&m| m == 0.0));
    }
}
