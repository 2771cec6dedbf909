//! Audio file decoding and looped sample playback

use rubato::{FftFixedIn, Resampler};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::buffer::StereoSample;
use super::error::InputError;

/// Frames handed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// A fully decoded audio file held in memory as stereo frames
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub frames: Vec<StereoSample>,
}

impl AudioSample {
    /// Decode a WAV, MP3 or AAC file. Mono files are duplicated to both
    /// channels; channels past the second are dropped.
    pub fn load(path: &Path) -> Result<Self, InputError> {
        let file = File::open(path).map_err(|e| InputError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| InputError::Format(e.to_string()))?;

        let mut format = probed.format;
        let (codec_params, track_id) = {
            let track = format
                .default_track()
                .ok_or_else(|| InputError::Format("no audio track".to_string()))?;
            (track.codec_params.clone(), track.id)
        };

        let sample_rate = codec_params
            .sample_rate
            .ok_or_else(|| InputError::Format("missing sample rate".to_string()))?;

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| InputError::Format(e.to_string()))?;

        let mut frames = Vec::new();
        let mut sample_buffer: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(InputError::Decode(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                // A corrupt packet is skipped, the rest of the file may be fine
                Err(SymphoniaError::DecodeError(message)) => {
                    log::warn!("Skipping undecodable packet in {}: {}", path.display(), message);
                    continue;
                }
                Err(e) => return Err(InputError::Decode(e.to_string())),
            };

            let channels = decoded.spec().channels.count();
            if channels == 0 {
                continue;
            }

            let buffer = sample_buffer.get_or_insert_with(|| {
                SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec())
            });
            if buffer.capacity() < decoded.capacity() * channels {
                *buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
            }
            buffer.copy_interleaved_ref(decoded);

            frames.extend(
                buffer
                    .samples()
                    .chunks_exact(channels)
                    .map(StereoSample::read_frame),
            );
        }

        log::info!(
            "Loaded sample {} ({} frames @ {} Hz)",
            path.display(),
            frames.len(),
            sample_rate
        );

        Ok(Self {
            path: path.to_path_buf(),
            sample_rate,
            frames,
        })
    }

    /// Return a copy converted to `target_rate`. The output holds
    /// ceil(frames * target / source) frames with the resampler latency removed.
    pub fn resampled(&self, target_rate: u32) -> Result<Self, InputError> {
        if target_rate == self.sample_rate || self.frames.is_empty() {
            return Ok(Self {
                sample_rate: target_rate,
                ..self.clone()
            });
        }

        let mut resampler = FftFixedIn::<f32>::new(
            self.sample_rate as usize,
            target_rate as usize,
            RESAMPLE_CHUNK,
            2,
            2,
        )
        .map_err(|e| InputError::Resample(e.to_string()))?;

        let delay = resampler.output_delay();
        let expected = (self.frames.len() as f64 * target_rate as f64 / self.sample_rate as f64)
            .ceil() as usize;

        let mut left = Vec::with_capacity(expected + delay);
        let mut right = Vec::with_capacity(expected + delay);
        let mut position = 0;

        while left.len() < expected + delay {
            let needed = resampler.input_frames_next();
            let mut chunk = vec![vec![0.0f32; needed]; 2];
            // Past the end the chunk stays zero-padded to flush the filter
            for (i, frame) in self.frames.iter().skip(position).take(needed).enumerate() {
                chunk[0][i] = frame.left;
                chunk[1][i] = frame.right;
            }
            position += needed;

            let output = resampler
                .process(&chunk, None)
                .map_err(|e| InputError::Resample(e.to_string()))?;
            left.extend_from_slice(&output[0]);
            right.extend_from_slice(&output[1]);
        }

        let frames = left
            .into_iter()
            .zip(right)
            .skip(delay)
            .take(expected)
            .map(|(l, r)| StereoSample::new(l, r))
            .collect();

        Ok(Self {
            path: self.path.clone(),
            sample_rate: target_rate,
            frames,
        })
    }
}

/// Plays a decoded sample, optionally looping without a gap
pub struct SamplePlayer {
    sample: Arc<AudioSample>,
    position: usize,
    looping: bool,
}

impl SamplePlayer {
    pub fn new(sample: Arc<AudioSample>, looping: bool) -> Self {
        Self {
            sample,
            position: 0,
            looping,
        }
    }

    pub fn sample(&self) -> &AudioSample {
        &self.sample
    }

    /// Whether a non-looping player has played everything
    pub fn is_finished(&self) -> bool {
        !self.looping && self.position >= self.sample.frames.len()
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn next_sample(&mut self) -> StereoSample {
        let frames = &self.sample.frames;
        if frames.is_empty() {
            return StereoSample::silence();
        }

        if self.position >= frames.len() {
            if !self.looping {
                return StereoSample::silence();
            }
            self.position = 0;
        }

        let frame = frames[self.position];
        self.position += 1;
        frame
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Write a 16-bit PCM WAV file
    pub(crate) fn write_wav(path: &Path, sample_rate: u32, channels: u16, samples: &[i16]) {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut bytes = Vec::with_capacity(44 + data_len as usize);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + data_len).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&channels.to_le_bytes());
        bytes.extend_from_slice(&sample_rate.to_le_bytes());
        bytes.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        bytes.extend_from_slice(&block_align.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&data_len.to_le_bytes());
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }

        let mut file = File::create(path).unwrap();
        file.write_all(&bytes).unwrap();
    }

    fn ramp_sample(frames: usize) -> Arc<AudioSample> {
        Arc::new(AudioSample {
            path: PathBuf::from("ramp.wav"),
            sample_rate: 48000,
            frames: (0..frames)
                .map(|i| StereoSample::new(i as f32, -(i as f32)))
                .collect(),
        })
    }

    #[test]
    fn test_load_stereo_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let samples: Vec<i16> = (0..1000).flat_map(|i| [i as i16 * 16, -(i as i16) * 16]).collect();
        write_wav(&path, 44100, 2, &samples);

        let sample = AudioSample::load(&path).unwrap();
        assert_eq!(sample.sample_rate, 44100);
        assert_eq!(sample.frames.len(), 1000);
        assert!((sample.frames[10].left - 160.0 / 32768.0).abs() < 1e-6);
        assert!((sample.frames[10].right + 160.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_mono_wav_duplicates_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, 48000, 1, &[0, 8192, -8192, 16384]);

        let sample = AudioSample::load(&path).unwrap();
        assert_eq!(sample.frames.len(), 4);
        for frame in &sample.frames {
            assert_eq!(frame.left, frame.right);
        }
        assert!((sample.frames[1].left - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_file() {
        let result = AudioSample::load(Path::new("/nonexistent/missing.wav"));
        assert!(matches!(result, Err(InputError::Open { .. })));
    }

    #[test]
    fn test_load_garbage_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.wav");
        std::fs::write(&path, b"definitely not audio data at all").unwrap();

        assert!(matches!(
            AudioSample::load(&path),
            Err(InputError::Format(_))
        ));
    }

    #[test]
    fn test_resampled_length() {
        let sample = AudioSample {
            path: PathBuf::from("tone.wav"),
            sample_rate: 44100,
            frames: (0..44100)
                .map(|i| StereoSample::mono((i as f32 * 0.01).sin() * 0.5))
                .collect(),
        };

        let converted = sample.resampled(48000).unwrap();
        assert_eq!(converted.sample_rate, 48000);
        assert_eq!(converted.frames.len(), 48000);
        assert!(converted.frames.iter().all(|f| f.left.is_finite()));
    }

    #[test]
    fn test_looping_is_gapless() {
        let sample = ramp_sample(100);
        let mut player = SamplePlayer::new(sample, true);

        for i in 0..1000 {
            let frame = player.next_sample();
            assert_eq!(frame.left, (i % 100) as f32);
            assert_eq!(frame.right, -((i % 100) as f32));
        }
        assert!(!player.is_finished());
    }

    #[test]
    fn test_one_shot_ends_in_silence() {
        let mut player = SamplePlayer::new(ramp_sample(10), false);
        for i in 0..10 {
            assert_eq!(player.next_sample().left, i as f32);
        }
        assert!(player.is_finished());
        for _ in 0..100 {
            assert_eq!(player.next_sample(), StereoSample::silence());
        }
    }
}
