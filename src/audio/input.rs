//! Input routing: what the engine feeds into the plugin
//!
//! An [`InputSource`] is the serializable description sent by the caller. It is
//! turned into an [`ActiveInput`] off the audio thread (decoding and resampling
//! can take a while) and handed to the [`InputRouter`] through a ring buffer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use super::buffer::StereoSample;
use super::error::InputError;
use super::samples::{AudioSample, SamplePlayer};
use super::signals::{SignalConfig, SignalGenerator};

fn default_looping() -> bool {
    true
}

/// Source of the plugin's input signal
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSource {
    Signal {
        config: SignalConfig,
    },
    Sample {
        path: PathBuf,
        #[serde(default = "default_looping")]
        looping: bool,
    },
    #[default]
    Silence,
}

/// A ready-to-render input. Built off the audio thread.
pub enum ActiveInput {
    Silence,
    Signal(Box<SignalGenerator>),
    Sample(SamplePlayer),
}

impl ActiveInput {
    /// Decode and prepare `source` for playback at `sample_rate`
    pub fn build(source: &InputSource, sample_rate: u32) -> Result<Self, InputError> {
        match source {
            InputSource::Silence => Ok(Self::Silence),
            InputSource::Signal { config } => Ok(Self::Signal(Box::new(SignalGenerator::new(
                config.clone(),
                sample_rate,
            )))),
            InputSource::Sample { path, looping } => {
                let sample = AudioSample::load(path)?.resampled(sample_rate)?;
                Ok(Self::Sample(SamplePlayer::new(Arc::new(sample), *looping)))
            }
        }
    }

    #[inline]
    pub fn next_sample(&mut self) -> StereoSample {
        match self {
            Self::Silence => StereoSample::silence(),
            Self::Signal(generator) => generator.next_sample(),
            Self::Sample(player) => player.next_sample(),
        }
    }

    /// Back to the first sample
    pub fn rewind(&mut self) {
        match self {
            Self::Silence => {}
            Self::Signal(generator) => generator.reset(),
            Self::Sample(player) => player.rewind(),
        }
    }

    /// A one-shot sample has played to the end
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Sample(player) if player.is_finished())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Silence => "silence",
            Self::Signal(_) => "signal",
            Self::Sample(_) => "sample",
        }
    }
}

/// Fills interleaved device buffers from the active input. Lives on the audio thread.
pub struct InputRouter {
    active: ActiveInput,
    channels: usize,
}

impl InputRouter {
    pub fn new(active: ActiveInput, channels: u16) -> Self {
        Self {
            active,
            channels: channels.max(1) as usize,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Replace the active input, returning the old one so the caller can
    /// dispose of it away from the audio thread
    pub fn swap(&mut self, next: ActiveInput) -> ActiveInput {
        std::mem::replace(&mut self.active, next)
    }

    pub fn rewind(&mut self) {
        self.active.rewind();
    }

    pub fn is_finished(&self) -> bool {
        self.active.is_finished()
    }

    pub fn fill(&mut self, buffer: &mut [f32]) {
        for frame in buffer.chunks_exact_mut(self.channels) {
            self.active.next_sample().write_frame(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples::tests::write_wav;
    use crate::audio::signals::{GatePattern, SignalType};

    #[test]
    fn test_silence_fills_zeros() {
        let mut router = InputRouter::new(ActiveInput::Silence, 2);
        let mut buffer = [1.0f32; 64];
        router.fill(&mut buffer);
        assert!(buffer.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_signal_fills_every_channel() {
        let source = InputSource::Signal {
            config: SignalConfig {
                signal_type: SignalType::Square,
                amplitude: 1.0,
                frequency: 100.0,
                gate_pattern: GatePattern::Continuous,
                ..Default::default()
            },
        };

        for channels in [1u16, 2, 4] {
            let input = ActiveInput::build(&source, 48000).unwrap();
            assert_eq!(input.kind(), "signal");

            let mut router = InputRouter::new(input, channels);
            let mut buffer = vec![0.0f32; 128 * channels as usize];
            router.fill(&mut buffer);
            for frame in buffer.chunks_exact(channels as usize) {
                assert!(frame.iter().all(|&s| (s.abs() - 0.8).abs() < 1e-6));
            }
        }
    }

    #[test]
    fn test_sample_source_resamples_to_engine_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loop.wav");
        write_wav(&path, 24000, 1, &vec![4096i16; 2400]);

        let input = ActiveInput::build(
            &InputSource::Sample {
                path: path.clone(),
                looping: true,
            },
            48000,
        )
        .unwrap();

        match input {
            ActiveInput::Sample(player) => {
                assert_eq!(player.sample().sample_rate, 48000);
                assert_eq!(player.sample().frames.len(), 4800);
            }
            other => panic!("expected sample input, got {}", other.kind()),
        }
    }

    #[test]
    fn test_mono_sample_reaches_every_output_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let ramp: Vec<i16> = (0..256).map(|i| i * 100).collect();
        write_wav(&path, 48000, 1, &ramp);
        let source = InputSource::Sample {
            path,
            looping: false,
        };

        for channels in [1u16, 2, 4] {
            let mut router = InputRouter::new(ActiveInput::build(&source, 48000).unwrap(), channels);
            let mut buffer = vec![1.0f32; 128 * channels as usize];
            router.fill(&mut buffer);

            for (index, frame) in buffer.chunks_exact(channels as usize).enumerate() {
                let expected = ramp[index] as f32 / 32768.0;
                assert!(
                    frame.iter().all(|&s| (s - expected).abs() < 1e-4),
                    "{} channels, frame {}: {:?}",
                    channels,
                    index,
                    frame
                );
            }
            assert!(!router.is_finished());
        }
    }

    #[test]
    fn test_rewind_restarts_one_shot_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hit.wav");
        write_wav(&path, 48000, 1, &[16384i16; 32]);
        let input = ActiveInput::build(
            &InputSource::Sample {
                path,
                looping: false,
            },
            48000,
        )
        .unwrap();

        let mut router = InputRouter::new(input, 2);
        let mut buffer = vec![0.0f32; 64 * 2];
        router.fill(&mut buffer);
        assert!(router.is_finished());
        assert!(buffer[64..].iter().all(|&s| s == 0.0));

        router.rewind();
        assert!(!router.is_finished());
        router.fill(&mut buffer);
        assert!((buffer[0] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_missing_sample_is_an_error() {
        let result = ActiveInput::build(
            &InputSource::Sample {
                path: PathBuf::from("/nonexistent/loop.wav"),
                looping: true,
            },
            48000,
        );
        assert!(matches!(result, Err(InputError::Open { .. })));
    }

    #[test]
    fn test_swap_returns_previous() {
        let mut router = InputRouter::new(ActiveInput::Silence, 2);
        let old = router.swap(
            ActiveInput::build(
                &InputSource::Signal {
                    config: SignalConfig::default(),
                },
                48000,
            )
            .unwrap(),
        );
        assert_eq!(old.kind(), "silence");
    }

    #[test]
    fn test_input_source_json_shape() {
        let source: InputSource =
            serde_json::from_str(r#"{"type":"sample","path":"/tmp/loop.wav"}"#).unwrap();
        assert_eq!(
            source,
            InputSource::Sample {
                path: PathBuf::from("/tmp/loop.wav"),
                looping: true
            }
        );

        let signal: InputSource = serde_json::from_str(
            r#"{"type":"signal","config":{"signal_type":"pink_noise","gate_pattern":{"pattern":"eighth","bpm":128.0,"duty":0.5}}}"#,
        )
        .unwrap();
        match signal {
            InputSource::Signal { config } => {
                assert_eq!(config.signal_type, SignalType::PinkNoise);
                assert_eq!(config.frequency, 440.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
