//! Sample types and lock-free queues shared with the audio thread

use ringbuf::{traits::*, HeapRb};

/// One stereo frame
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoSample {
    pub left: f32,
    pub right: f32,
}

impl StereoSample {
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    pub fn mono(value: f32) -> Self {
        Self {
            left: value,
            right: value,
        }
    }

    pub fn silence() -> Self {
        Self::default()
    }

    /// Average of both channels
    #[inline]
    pub fn mix(&self) -> f32 {
        (self.left + self.right) * 0.5
    }

    /// Write this frame into an interleaved frame of any width.
    ///
    /// Channel 0 gets left, channel 1 gets right, anything beyond gets the
    /// mono mix. A single-channel frame gets the mix.
    #[inline]
    pub fn write_frame(&self, frame: &mut [f32]) {
        match frame.len() {
            0 => {}
            1 => frame[0] = self.mix(),
            _ => {
                frame[0] = self.left;
                frame[1] = self.right;
                let mix = self.mix();
                for sample in frame.iter_mut().skip(2) {
                    *sample = mix;
                }
            }
        }
    }

    /// Read the first two channels of an interleaved frame
    #[inline]
    pub fn read_frame(frame: &[f32]) -> Self {
        match frame.len() {
            0 => Self::silence(),
            1 => Self::mono(frame[0]),
            _ => Self::new(frame[0], frame[1]),
        }
    }
}

/// Single-producer/single-consumer pair for handing values to or from the audio thread
pub type CommandBuffer<T> = (ringbuf::HeapProd<T>, ringbuf::HeapCons<T>);

pub fn create_command_buffer<T>(capacity: usize) -> CommandBuffer<T> {
    let rb = HeapRb::new(capacity);
    rb.split()
}

/// Raw interleaved samples copied out of the audio callback for analysis
pub type TapProducer = ringbuf::HeapProd<f32>;
pub type TapConsumer = ringbuf::HeapCons<f32>;

pub fn create_tap(capacity: usize) -> (TapProducer, TapConsumer) {
    create_command_buffer(capacity)
}
