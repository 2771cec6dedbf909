//! Metering pipeline
//!
//! The audio callback copies every rendered buffer into two taps (before and
//! after the plugin). The idle worker drains them here, runs the analyzers and
//! publishes a [`MeteringSnapshot`] that readers load without blocking.

use arc_swap::ArcSwap;
use ringbuf::traits::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::buffer::TapConsumer;
use super::spectrum::{SpectrumAnalyzer, NUM_BANDS};
use super::stereo::StereoAnalyzer;

/// Points in the waveform display ring
pub const WAVEFORM_LEN: usize = 512;

/// Levels below this read as silence
pub const METER_FLOOR_DB: f32 = -60.0;

/// Frames drained from a tap per pass
const DRAIN_FRAMES: usize = 4096;

/// Convert linear amplitude to dB, floored at -60 dB
pub fn level_to_db(level: f32) -> f32 {
    if level <= 0.0 || !level.is_finite() {
        METER_FLOOR_DB
    } else {
        (20.0 * level.log10()).max(METER_FLOOR_DB)
    }
}

/// Latest visualization data for the UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeteringSnapshot {
    pub left_db: f32,
    pub right_db: f32,
    pub input_left_db: f32,
    pub input_right_db: f32,
    pub spectrum_bins: Vec<f32>,
    pub input_spectrum_bins: Vec<f32>,
    /// Post-plugin mono mix, oldest first
    pub waveform: Vec<f32>,
    pub stereo_correlation: f32,
    pub clipping_left: bool,
    pub clipping_right: bool,
}

impl Default for MeteringSnapshot {
    fn default() -> Self {
        Self {
            left_db: METER_FLOOR_DB,
            right_db: METER_FLOOR_DB,
            input_left_db: METER_FLOOR_DB,
            input_right_db: METER_FLOOR_DB,
            spectrum_bins: vec![0.0; NUM_BANDS],
            input_spectrum_bins: vec![0.0; NUM_BANDS],
            waveform: vec![0.0; WAVEFORM_LEN],
            stereo_correlation: 1.0,
            clipping_left: false,
            clipping_right: false,
        }
    }
}

/// Clip flags raised by the limiter on the audio thread
#[derive(Default)]
pub struct ClipIndicators {
    left: AtomicBool,
    right: AtomicBool,
}

impl ClipIndicators {
    #[inline]
    pub fn mark(&self, left: bool, right: bool) {
        if left {
            self.left.store(true, Ordering::Relaxed);
        }
        if right {
            self.right.store(true, Ordering::Relaxed);
        }
    }

    /// Read and clear both flags
    pub fn take(&self) -> (bool, bool) {
        (
            self.left.swap(false, Ordering::Relaxed),
            self.right.swap(false, Ordering::Relaxed),
        )
    }
}

/// Last-write-wins store for snapshots. Readers never block the writer.
pub struct MeteringHub {
    latest: ArcSwap<MeteringSnapshot>,
}

impl MeteringHub {
    pub fn new() -> Self {
        Self {
            latest: ArcSwap::from_pointee(MeteringSnapshot::default()),
        }
    }

    pub fn latest(&self) -> Arc<MeteringSnapshot> {
        self.latest.load_full()
    }

    pub fn publish(&self, snapshot: MeteringSnapshot) {
        self.latest.store(Arc::new(snapshot));
    }

    pub fn reset(&self) {
        self.publish(MeteringSnapshot::default());
    }
}

impl Default for MeteringHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-channel peaks of interleaved samples. Mono reads as both channels.
fn channel_peaks(samples: &[f32], channels: usize) -> (f32, f32) {
    let mut peaks = (0.0f32, 0.0f32);
    for frame in samples.chunks_exact(channels) {
        let left = frame[0].abs();
        let right = frame.get(1).map_or(left, |s| s.abs());
        peaks.0 = peaks.0.max(left);
        peaks.1 = peaks.1.max(right);
    }
    peaks
}

/// Drains the taps and runs the analyzers. Owned by the idle worker.
pub struct MeteringPipeline {
    pre: TapConsumer,
    post: TapConsumer,
    channels: usize,
    scratch: Vec<f32>,
    input_spectrum: SpectrumAnalyzer,
    output_spectrum: SpectrumAnalyzer,
    stereo: StereoAnalyzer,
    waveform: [f32; WAVEFORM_LEN],
    waveform_pos: usize,
    clip: Arc<ClipIndicators>,
    hub: Arc<MeteringHub>,
}

impl MeteringPipeline {
    pub fn new(
        pre: TapConsumer,
        post: TapConsumer,
        sample_rate: u32,
        channels: u16,
        clip: Arc<ClipIndicators>,
        hub: Arc<MeteringHub>,
    ) -> Self {
        let channels = channels.max(1) as usize;
        Self {
            pre,
            post,
            channels,
            scratch: vec![0.0; DRAIN_FRAMES * channels],
            input_spectrum: SpectrumAnalyzer::new(sample_rate),
            output_spectrum: SpectrumAnalyzer::new(sample_rate),
            stereo: StereoAnalyzer::new(),
            waveform: [0.0; WAVEFORM_LEN],
            waveform_pos: 0,
            clip,
            hub,
        }
    }

    /// Drain both taps, publish a snapshot and return it
    pub fn tick(&mut self) -> Arc<MeteringSnapshot> {
        let channels = self.channels;

        let mut input_peaks = (0.0f32, 0.0f32);
        loop {
            let read = self.pre.pop_slice(&mut self.scratch);
            if read == 0 {
                break;
            }
            let samples = &self.scratch[..read - read % channels];
            let peaks = channel_peaks(samples, channels);
            input_peaks = (input_peaks.0.max(peaks.0), input_peaks.1.max(peaks.1));
            self.input_spectrum.push_interleaved(samples, channels);
        }

        let mut output_peaks = (0.0f32, 0.0f32);
        loop {
            let read = self.post.pop_slice(&mut self.scratch);
            if read == 0 {
                break;
            }
            let samples = &self.scratch[..read - read % channels];
            let peaks = channel_peaks(samples, channels);
            output_peaks = (output_peaks.0.max(peaks.0), output_peaks.1.max(peaks.1));
            self.output_spectrum.push_interleaved(samples, channels);
            self.stereo.push_interleaved(samples, channels);

            for frame in samples.chunks_exact(channels) {
                self.waveform[self.waveform_pos] = frame.iter().sum::<f32>() / channels as f32;
                self.waveform_pos = (self.waveform_pos + 1) % WAVEFORM_LEN;
            }
        }

        self.input_spectrum.analyze();
        self.output_spectrum.analyze();

        let (clipping_left, clipping_right) = self.clip.take();
        let waveform = (0..WAVEFORM_LEN)
            .map(|i| self.waveform[(self.waveform_pos + i) % WAVEFORM_LEN])
            .collect();

        let snapshot = MeteringSnapshot {
            left_db: level_to_db(output_peaks.0),
            right_db: level_to_db(output_peaks.1),
            input_left_db: level_to_db(input_peaks.0),
            input_right_db: level_to_db(input_peaks.1),
            spectrum_bins: self.output_spectrum.magnitudes().to_vec(),
            input_spectrum_bins: self.input_spectrum.magnitudes().to_vec(),
            waveform,
            stereo_correlation: self.stereo.correlation(),
            clipping_left,
            clipping_right,
        };

        self.hub.publish(snapshot);
        self.hub.latest()
    }
}

/// Exponential interpolation of levels and spectra toward the latest snapshot,
/// for displays that redraw faster or slower than the meter ticks
pub struct MeterSmoother {
    time_constant: Duration,
    current: Option<MeteringSnapshot>,
}

impl MeterSmoother {
    pub fn new(time_constant: Duration) -> Self {
        Self {
            time_constant,
            current: None,
        }
    }

    /// Move toward `target` by `elapsed`. alpha = 1 - exp(-elapsed / tau)
    pub fn update(&mut self, target: &MeteringSnapshot, elapsed: Duration) -> &MeteringSnapshot {
        let tau = self.time_constant.as_secs_f32();
        let alpha = if tau <= 0.0 {
            1.0
        } else {
            1.0 - (-elapsed.as_secs_f32() / tau).exp()
        };
        let lerp = |from: f32, to: f32| from + (to - from) * alpha;

        let next = match self.current.take() {
            None => target.clone(),
            Some(current) => MeteringSnapshot {
                left_db: lerp(current.left_db, target.left_db),
                right_db: lerp(current.right_db, target.right_db),
                input_left_db: lerp(current.input_left_db, target.input_left_db),
                input_right_db: lerp(current.input_right_db, target.input_right_db),
                spectrum_bins: current
                    .spectrum_bins
                    .iter()
                    .zip(&target.spectrum_bins)
                    .map(|(&a, &b)| lerp(a, b))
                    .collect(),
                input_spectrum_bins: current
                    .input_spectrum_bins
                    .iter()
                    .zip(&target.input_spectrum_bins)
                    .map(|(&a, &b)| lerp(a, b))
                    .collect(),
                stereo_correlation: lerp(current.stereo_correlation, target.stereo_correlation),
                // Waveform and clip flags are shown as-is
                waveform: target.waveform.clone(),
                clipping_left: target.clipping_left,
                clipping_right: target.clipping_right,
            },
        };

        self.current.insert(next)
    }
}
