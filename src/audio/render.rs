//! Per-buffer render path run inside the audio callback
//!
//! input router -> pre tap -> plugin slot -> crossfade -> master gain -> safety limiter -> post tap
//!
//! Nothing here allocates, blocks or logs.

use ringbuf::traits::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::buffer::{create_command_buffer, create_tap, TapConsumer, TapProducer};
use super::input::{ActiveInput, InputRouter};
use super::metering::ClipIndicators;
use super::plugin::PluginSlot;

const CROSSFADE_NONE: u8 = 0;
const CROSSFADE_OUT: u8 = 1;
const CROSSFADE_MUTED: u8 = 2;
const CROSSFADE_IN: u8 = 3;

const TRANSPORT_PLAYING: u8 = 0;
const TRANSPORT_PAUSED: u8 = 1;
const TRANSPORT_STOPPED: u8 = 2;

/// Loudest master volume, as a linear gain
pub const MAX_MASTER_VOLUME: f32 = 1.0;

/// Pending input changes the callback can hold at once
pub const INPUT_QUEUE_CAPACITY: usize = 1;

/// Retired inputs waiting to be dropped by the idle worker
const GARBAGE_CAPACITY: usize = 8;

/// Whether the input is advancing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Playing,
    Paused,
    Stopped,
}

/// Play/pause/stop and master volume, shared between control threads and
/// the callback. Outlives engine restarts.
///
/// While paused or stopped the plugin still runs on silent input, so tails
/// ring out and notes keep working.
pub struct Transport {
    state: AtomicU8,
    rewind: AtomicBool,
    master_gain: AtomicU32,
}

impl Transport {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(TRANSPORT_PLAYING),
            rewind: AtomicBool::new(false),
            master_gain: AtomicU32::new(MAX_MASTER_VOLUME.to_bits()),
        }
    }

    pub fn play(&self) {
        self.state.store(TRANSPORT_PLAYING, Ordering::Release);
    }

    /// Hold the input where it is
    pub fn pause(&self) {
        self.state.store(TRANSPORT_PAUSED, Ordering::Release);
    }

    /// Silence the input and rewind it to the start
    pub fn stop(&self) {
        self.rewind.store(true, Ordering::Release);
        self.state.store(TRANSPORT_STOPPED, Ordering::Release);
    }

    pub fn state(&self) -> TransportState {
        match self.state.load(Ordering::Acquire) {
            TRANSPORT_PLAYING => TransportState::Playing,
            TRANSPORT_PAUSED => TransportState::Paused,
            _ => TransportState::Stopped,
        }
    }

    /// Linear gain, clamped to `0..=MAX_MASTER_VOLUME`. Non-finite values are ignored.
    pub fn set_master_volume(&self, volume: f32) {
        if !volume.is_finite() {
            return;
        }
        let volume = volume.clamp(0.0, MAX_MASTER_VOLUME);
        self.master_gain.store(volume.to_bits(), Ordering::Release);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Acquire))
    }

    /// A one-shot input ran out while playing
    fn finish(&self) {
        if self
            .state
            .compare_exchange(
                TRANSPORT_PLAYING,
                TRANSPORT_STOPPED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.rewind.store(true, Ordering::Release);
        }
    }

    fn take_rewind(&self) -> bool {
        self.rewind.swap(false, Ordering::AcqRel)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Output gain ramp used around a hot reload
pub struct Crossfade {
    state: AtomicU8,
    position: AtomicU32,
    length: u32,
    sample_rate: u32,
}

impl Crossfade {
    /// A ~100 ms ramp at `sample_rate`
    pub fn new(sample_rate: u32) -> Self {
        Self {
            state: AtomicU8::new(CROSSFADE_NONE),
            position: AtomicU32::new(0),
            length: (sample_rate / 10).max(1),
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn length_frames(&self) -> u32 {
        self.length
    }

    pub fn ramp_duration(&self) -> Duration {
        Duration::from_micros(self.length as u64 * 1_000_000 / self.sample_rate as u64)
    }

    /// Ramp to zero and stay muted until [`start_in`](Self::start_in)
    pub fn start_out(&self) {
        let state = self.state.load(Ordering::Acquire);
        let position = match state {
            CROSSFADE_OUT | CROSSFADE_MUTED => return,
            // Continue from the gain reached so far
            CROSSFADE_IN => self.length - self.position.load(Ordering::Acquire).min(self.length),
            _ => 0,
        };
        self.position.store(position, Ordering::Release);
        self.state.store(CROSSFADE_OUT, Ordering::Release);
    }

    pub fn start_in(&self) {
        let state = self.state.load(Ordering::Acquire);
        let position = match state {
            CROSSFADE_NONE | CROSSFADE_IN => return,
            CROSSFADE_OUT => self.length - self.position.load(Ordering::Acquire).min(self.length),
            _ => 0,
        };
        self.position.store(position, Ordering::Release);
        self.state.store(CROSSFADE_IN, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.state.load(Ordering::Acquire) == CROSSFADE_MUTED
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == CROSSFADE_NONE
    }

    /// Start fading out and block until the callback has reached silence.
    /// Returns false if that did not happen within `timeout`.
    pub fn fade_out_and_wait(&self, timeout: Duration) -> bool {
        self.start_out();
        let deadline = Instant::now() + timeout;
        while !self.is_muted() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    /// Drop straight back to unity gain
    pub fn reset(&self) {
        self.state.store(CROSSFADE_NONE, Ordering::Release);
        self.position.store(0, Ordering::Release);
    }

    #[inline]
    pub fn apply(&self, buffer: &mut [f32], channels: usize) {
        let state = self.state.load(Ordering::Acquire);
        match state {
            CROSSFADE_NONE => {}
            CROSSFADE_MUTED => buffer.fill(0.0),
            _ => {
                let fading_out = state == CROSSFADE_OUT;
                let mut position = self.position.load(Ordering::Acquire);
                for frame in buffer.chunks_exact_mut(channels) {
                    let progress = (position as f32 / self.length as f32).min(1.0);
                    let gain = if fading_out { 1.0 - progress } else { progress };
                    for sample in frame.iter_mut() {
                        *sample *= gain;
                    }
                    position = position.saturating_add(1);
                }

                if position >= self.length {
                    let done = if fading_out {
                        CROSSFADE_MUTED
                    } else {
                        CROSSFADE_NONE
                    };
                    // A control thread may have restarted the fade meanwhile
                    if self
                        .state
                        .compare_exchange(state, done, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.position.store(0, Ordering::Release);
                    }
                } else {
                    self.position.store(position, Ordering::Release);
                }
            }
        }
    }
}

/// Clamp to [-1, 1] and replace non-finite samples with silence.
/// Returns which side clipped.
#[inline]
pub fn safety_limit(buffer: &mut [f32], channels: usize) -> (bool, bool) {
    let mut clipped = (false, false);
    for frame in buffer.chunks_exact_mut(channels) {
        for (channel, sample) in frame.iter_mut().enumerate() {
            let hit = if !sample.is_finite() {
                *sample = 0.0;
                true
            } else if sample.abs() > 1.0 {
                *sample = sample.clamp(-1.0, 1.0);
                true
            } else {
                false
            };

            if hit {
                if channels == 1 {
                    clipped = (true, true);
                } else if channel % 2 == 0 {
                    clipped.0 = true;
                } else {
                    clipped.1 = true;
                }
            }
        }
    }
    clipped
}

/// Control-side ends of the queues feeding and draining a [`RenderProcessor`]
pub struct RenderHandles {
    pub input_tx: ringbuf::HeapProd<ActiveInput>,
    pub garbage_rx: ringbuf::HeapCons<ActiveInput>,
    pub pre_tap: TapConsumer,
    pub post_tap: TapConsumer,
}

/// Everything the audio callback owns
pub struct RenderProcessor {
    router: InputRouter,
    input_rx: ringbuf::HeapCons<ActiveInput>,
    garbage_tx: ringbuf::HeapProd<ActiveInput>,
    pre_tap: TapProducer,
    post_tap: TapProducer,
    slot: Arc<PluginSlot>,
    crossfade: Arc<Crossfade>,
    transport: Arc<Transport>,
    clip: Arc<ClipIndicators>,
    channels: usize,
}

impl RenderProcessor {
    pub fn new(
        initial: ActiveInput,
        sample_rate: u32,
        channels: u16,
        slot: Arc<PluginSlot>,
        crossfade: Arc<Crossfade>,
        transport: Arc<Transport>,
        clip: Arc<ClipIndicators>,
    ) -> (Self, RenderHandles) {
        let router = InputRouter::new(initial, channels);
        let channels = router.channels();

        let (input_tx, input_rx) = create_command_buffer(INPUT_QUEUE_CAPACITY);
        let (garbage_tx, garbage_rx) = create_command_buffer(GARBAGE_CAPACITY);
        // Half a second of audio per tap
        let tap_len = (sample_rate as usize / 2).max(1024) * channels;
        let (pre_tx, pre_rx) = create_tap(tap_len);
        let (post_tx, post_rx) = create_tap(tap_len);

        let processor = Self {
            router,
            input_rx,
            garbage_tx,
            pre_tap: pre_tx,
            post_tap: post_tx,
            slot,
            crossfade,
            transport,
            clip,
            channels,
        };
        let handles = RenderHandles {
            input_tx,
            garbage_rx,
            pre_tap: pre_rx,
            post_tap: post_rx,
        };
        (processor, handles)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Render one interleaved device buffer
    pub fn render(&mut self, buffer: &mut [f32]) {
        while let Some(next) = self.input_rx.try_pop() {
            let retired = self.router.swap(next);
            // Worker stalled and the garbage ring is full: freeing here beats leaking
            if let Err(retired) = self.garbage_tx.try_push(retired) {
                drop(retired);
            }
        }

        if self.transport.take_rewind() {
            self.router.rewind();
        }
        if self.transport.state() == TransportState::Playing {
            self.router.fill(buffer);
            if self.router.is_finished() {
                self.transport.finish();
            }
        } else {
            buffer.fill(0.0);
        }
        push_tap(&mut self.pre_tap, buffer);

        self.slot.process(buffer, self.channels);
        self.crossfade.apply(buffer, self.channels);

        let gain = self.transport.master_volume();
        if gain != 1.0 {
            for sample in buffer.iter_mut() {
                *sample *= gain;
            }
        }

        let (left, right) = safety_limit(buffer, self.channels);
        self.clip.mark(left, right);

        push_tap(&mut self.post_tap, buffer);
    }
}

/// Whole buffers only, so frames stay aligned for the reader
#[inline]
fn push_tap(tap: &mut TapProducer, samples: &[f32]) {
    if tap.vacant_len() >= samples.len() {
        tap.push_slice(samples);
    }
}
