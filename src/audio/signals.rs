//! Test signal generators for audio preview

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use super::buffer::StereoSample;

/// Gate edges ramp over this long to avoid clicks
const GATE_RAMP_SECS: f32 = 0.003;

/// Type of test signal to generate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Sine,
    Square,
    WhiteNoise,
    PinkNoise,
    Impulse,
    Sweep,
}

/// Frequency trajectory of a sweep
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepMode {
    Linear,
    #[default]
    Logarithmic,
}

/// Rhythmic on/off envelope applied to a test signal
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum GatePattern {
    /// Unshaped signal
    #[default]
    Continuous,
    /// Free-running pulse, `rate_hz` cycles per second
    Pulse { rate_hz: f32, duty: f32 },
    /// One cycle per beat
    Quarter { bpm: f32, duty: f32 },
    /// Two cycles per beat
    Eighth { bpm: f32, duty: f32 },
    /// Four cycles per beat
    Sixteenth { bpm: f32, duty: f32 },
}

impl GatePattern {
    /// Length of one on/off cycle in seconds, `None` when continuous
    pub fn period_secs(&self) -> Option<f32> {
        let per_beat = |bpm: f32, subdivisions: f32| 60.0 / (bpm.clamp(20.0, 999.0) * subdivisions);
        match *self {
            Self::Continuous => None,
            Self::Pulse { rate_hz, .. } => Some(1.0 / rate_hz.max(0.1)),
            Self::Quarter { bpm, .. } => Some(per_beat(bpm, 1.0)),
            Self::Eighth { bpm, .. } => Some(per_beat(bpm, 2.0)),
            Self::Sixteenth { bpm, .. } => Some(per_beat(bpm, 4.0)),
        }
    }

    /// Portion of each cycle that is "on"
    pub fn duty(&self) -> f32 {
        match *self {
            Self::Continuous => 1.0,
            Self::Pulse { duty, .. }
            | Self::Quarter { duty, .. }
            | Self::Eighth { duty, .. }
            | Self::Sixteenth { duty, .. } => duty.clamp(0.1, 1.0),
        }
    }
}

/// Configuration for signal generation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalConfig {
    pub signal_type: SignalType,
    /// Hz for tones, impulses per second for an ungated impulse
    pub frequency: f32,
    /// 0.0 - 1.0
    pub amplitude: f32,
    pub sweep_start: f32,
    pub sweep_end: f32,
    /// Seconds per sweep before it loops
    pub sweep_duration: f32,
    pub sweep_mode: SweepMode,
    pub gate_pattern: GatePattern,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            signal_type: SignalType::Sine,
            frequency: 440.0,
            amplitude: 0.5,
            sweep_start: 20.0,
            sweep_end: 20000.0,
            sweep_duration: 5.0,
            sweep_mode: SweepMode::Logarithmic,
            gate_pattern: GatePattern::Continuous,
        }
    }
}

/// Gate envelope state
struct Gate {
    cycle_samples: f64,
    on_samples: f64,
    position: f64,
    level: f32,
    step: f32,
}

impl Gate {
    fn new(pattern: GatePattern, sample_rate: f32) -> Self {
        let (cycle_samples, on_samples) = match pattern.period_secs() {
            Some(period) => {
                let cycle = period as f64 * sample_rate as f64;
                (cycle, cycle * pattern.duty() as f64)
            }
            None => (0.0, 0.0),
        };
        let ramp_samples = (GATE_RAMP_SECS * sample_rate).max(1.0);

        Self {
            cycle_samples,
            on_samples,
            position: 0.0,
            level: 0.0,
            step: 1.0 / ramp_samples,
        }
    }

    fn reset(&mut self) {
        self.position = 0.0;
        self.level = 0.0;
    }

    fn is_continuous(&self) -> bool {
        self.cycle_samples <= 0.0
    }

    /// Advance one sample. Returns the ramped gain and whether a new cycle started.
    fn next(&mut self) -> (f32, bool) {
        if self.is_continuous() {
            return (1.0, false);
        }

        let cycle_started = self.position < 1.0;
        let target = if self.position < self.on_samples { 1.0 } else { 0.0 };

        self.position += 1.0;
        if self.position >= self.cycle_samples {
            self.position -= self.cycle_samples;
        }

        if self.level < target {
            self.level = (self.level + self.step).min(target);
        } else if self.level > target {
            self.level = (self.level - self.step).max(target);
        }

        (self.level, cycle_started)
    }
}

/// Signal generator that produces audio samples
pub struct SignalGenerator {
    config: SignalConfig,
    sample_rate: f32,
    phase: f32,
    sweep_position: f32,
    impulse_counter: f32,
    gate: Gate,
    rng: StdRng,
    // Pink noise state (Voss-McCartney algorithm)
    pink_rows: [f32; 16],
    pink_running_sum: f32,
    pink_index: usize,
}

impl SignalGenerator {
    pub fn new(config: SignalConfig, sample_rate: u32) -> Self {
        let sample_rate = sample_rate.max(1) as f32;
        Self {
            gate: Gate::new(config.gate_pattern, sample_rate),
            config,
            sample_rate,
            phase: 0.0,
            sweep_position: 0.0,
            impulse_counter: 0.0,
            rng: StdRng::from_entropy(),
            pink_rows: [0.0; 16],
            pink_running_sum: 0.0,
            pink_index: 0,
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    /// Restart phase, sweep and gate from the beginning
    pub fn reset(&mut self) {
        self.phase = 0.0;
        self.sweep_position = 0.0;
        self.impulse_counter = 0.0;
        self.gate.reset();
    }

    /// Generate the next sample
    pub fn next_sample(&mut self) -> StereoSample {
        let (gate, cycle_started) = self.gate.next();

        let sample = match self.config.signal_type {
            SignalType::Sine => self.generate_sine() * gate,
            SignalType::Square => self.generate_square() * gate,
            SignalType::WhiteNoise => self.generate_white_noise() * gate,
            SignalType::PinkNoise => self.generate_pink_noise() * gate,
            SignalType::Sweep => self.generate_sweep() * gate,
            // Impulses carry their own timing; the ramp would swallow them
            SignalType::Impulse => self.generate_impulse(cycle_started),
        };

        StereoSample::mono(sample * self.config.amplitude.clamp(0.0, 1.0))
    }

    fn advance_phase(&mut self, frequency: f32) {
        self.phase += frequency / self.sample_rate;
        if self.phase >= 1.0 {
            self.phase -= self.phase.floor();
        }
    }

    fn generate_sine(&mut self) -> f32 {
        let sample = (self.phase * 2.0 * PI).sin();
        self.advance_phase(self.config.frequency);
        sample
    }

    fn generate_square(&mut self) -> f32 {
        let sample = if self.phase < 0.5 { 1.0 } else { -1.0 };
        self.advance_phase(self.config.frequency);
        // Softened slightly to reduce harshness
        sample * 0.8
    }

    fn generate_white_noise(&mut self) -> f32 {
        self.rng.gen_range(-1.0..1.0)
    }

    fn generate_pink_noise(&mut self) -> f32 {
        let row = (self.pink_index.trailing_zeros() as usize).min(15);

        self.pink_running_sum -= self.pink_rows[row];
        self.pink_rows[row] = self.rng.gen_range(-1.0..1.0);
        self.pink_running_sum += self.pink_rows[row];

        self.pink_index = self.pink_index.wrapping_add(1);

        let white: f32 = self.rng.gen_range(-1.0..1.0);
        (self.pink_running_sum + white) / 5.0
    }

    fn generate_impulse(&mut self, cycle_started: bool) -> f32 {
        if !self.gate.is_continuous() {
            return if cycle_started { 1.0 } else { 0.0 };
        }

        // Ungated: `frequency` impulses per second, first one immediately
        let interval = self.sample_rate / self.config.frequency.max(0.1);
        let fire = self.impulse_counter <= 0.0;
        self.impulse_counter += 1.0;
        if self.impulse_counter >= interval {
            self.impulse_counter -= interval;
        }
        if fire {
            1.0
        } else {
            0.0
        }
    }

    fn generate_sweep(&mut self) -> f32 {
        let duration = self.config.sweep_duration.max(0.01);
        let progress = (self.sweep_position / self.sample_rate / duration).min(1.0);

        let start = self.config.sweep_start.max(1.0);
        let end = self.config.sweep_end.max(1.0);
        let frequency = match self.config.sweep_mode {
            SweepMode::Linear => start + (end - start) * progress,
            SweepMode::Logarithmic => {
                let (log_start, log_end) = (start.ln(), end.ln());
                (log_start + (log_end - log_start) * progress).exp()
            }
        };

        let sample = (self.phase * 2.0 * PI).sin();
        self.advance_phase(frequency);

        self.sweep_position += 1.0;
        if progress >= 1.0 {
            self.sweep_position = 0.0;
        }

        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(config: SignalConfig, sample_rate: u32) -> SignalGenerator {
        SignalGenerator::new(config, sample_rate)
    }

    #[test]
    fn test_sine_range() {
        let mut gen = generator(
            SignalConfig {
                amplitude: 1.0,
                ..Default::default()
            },
            44100,
        );

        for _ in 0..44100 {
            let sample = gen.next_sample();
            assert!(sample.left >= -1.0 && sample.left <= 1.0);
            assert_eq!(sample.left, sample.right);
        }
    }

    #[test]
    fn test_noise_range() {
        for signal_type in [SignalType::WhiteNoise, SignalType::PinkNoise] {
            let mut gen = generator(
                SignalConfig {
                    signal_type,
                    amplitude: 1.0,
                    ..Default::default()
                },
                48000,
            );
            for _ in 0..10_000 {
                let sample = gen.next_sample();
                assert!(sample.left.is_finite());
                assert!(sample.left >= -1.0 && sample.left <= 1.0);
            }
        }
    }

    #[test]
    fn test_pulse_gate_edges_follow_rate() {
        // 2 Hz with 50% duty at 48 kHz, pulled in 256-sample buffers
        let sample_rate = 48000;
        let mut gen = generator(
            SignalConfig {
                signal_type: SignalType::Sine,
                frequency: 997.0,
                amplitude: 0.5,
                gate_pattern: GatePattern::Pulse {
                    rate_hz: 2.0,
                    duty: 0.5,
                },
                ..Default::default()
            },
            sample_rate,
        );

        let mut rising_edges = Vec::new();
        let mut zero_run = 0usize;
        let mut index = 0usize;
        for _ in 0..(sample_rate as usize * 3 / 256) {
            let mut buffer = [StereoSample::silence(); 256];
            for frame in buffer.iter_mut() {
                *frame = gen.next_sample();
            }
            for frame in buffer {
                if frame.left == 0.0 {
                    zero_run += 1;
                } else {
                    if zero_run >= 1000 {
                        rising_edges.push(index);
                    }
                    zero_run = 0;
                }
                index += 1;
            }
        }

        assert!(rising_edges.len() >= 4, "edges: {:?}", rising_edges);
        for pair in rising_edges.windows(2) {
            let spacing = pair[1] - pair[0];
            assert!(
                (spacing as i64 - 24000).abs() <= 256,
                "spacing {} not within one buffer of 500 ms",
                spacing
            );
        }
        for edge in &rising_edges {
            let offset = edge % 24000;
            assert!(offset <= 256 || offset >= 24000 - 256, "edge at {}", edge);
        }
    }

    #[test]
    fn test_gate_ramps_instead_of_stepping() {
        let mut gen = generator(
            SignalConfig {
                signal_type: SignalType::Square,
                amplitude: 1.0,
                frequency: 10.0,
                gate_pattern: GatePattern::Pulse {
                    rate_hz: 10.0,
                    duty: 0.5,
                },
                ..Default::default()
            },
            48000,
        );

        // A square wave has constant magnitude, so its envelope is the gate.
        // 3 ms at 48 kHz is 144 samples per full ramp.
        let max_step = 0.8 / 144.0 + 1e-5;
        let mut previous = 0.0f32;
        let mut reached_full = false;
        for _ in 0..48000 {
            let envelope = gen.next_sample().left.abs();
            assert!((envelope - previous).abs() <= max_step);
            reached_full |= (envelope - 0.8).abs() < 1e-5;
            previous = envelope;
        }
        assert!(reached_full);
    }

    #[test]
    fn test_gated_impulse_fires_once_per_cycle() {
        let sample_rate = 48000;
        let mut gen = generator(
            SignalConfig {
                signal_type: SignalType::Impulse,
                amplitude: 1.0,
                gate_pattern: GatePattern::Quarter {
                    bpm: 120.0,
                    duty: 0.5,
                },
                ..Default::default()
            },
            sample_rate,
        );

        let impulses: Vec<usize> = (0..sample_rate as usize * 2)
            .filter(|_| gen.next_sample().left > 0.0)
            .collect();

        assert_eq!(impulses, vec![0, 24000, 48000, 72000]);
    }

    #[test]
    fn test_ungated_impulse_rate() {
        let mut gen = generator(
            SignalConfig {
                signal_type: SignalType::Impulse,
                frequency: 4.0,
                amplitude: 1.0,
                ..Default::default()
            },
            48000,
        );

        let count = (0..48000).filter(|_| gen.next_sample().left > 0.0).count();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_musical_gate_periods() {
        assert_eq!(
            GatePattern::Quarter { bpm: 120.0, duty: 0.5 }.period_secs(),
            Some(0.5)
        );
        assert_eq!(
            GatePattern::Sixteenth { bpm: 120.0, duty: 0.5 }.period_secs(),
            Some(0.125)
        );
        assert_eq!(GatePattern::Continuous.period_secs(), None);
    }

    #[test]
    fn test_sweep_stays_finite_in_both_modes() {
        for sweep_mode in [SweepMode::Linear, SweepMode::Logarithmic] {
            let mut gen = generator(
                SignalConfig {
                    signal_type: SignalType::Sweep,
                    sweep_duration: 0.1,
                    sweep_mode,
                    amplitude: 1.0,
                    ..Default::default()
                },
                48000,
            );
            for _ in 0..48000 {
                let sample = gen.next_sample().left;
                assert!(sample.is_finite() && sample.abs() <= 1.0);
            }
        }
    }
}
