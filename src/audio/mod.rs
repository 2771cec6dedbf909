//! Real-time preview of an audio plugin under development
//!
//! - Output stream via cpal, rendered by [`render::RenderProcessor`]
//! - Test signals and sample playback as plugin input
//! - CLAP plugin hosting with hot reload after rebuilds
//! - Level, spectrum and stereo metering off the audio thread

pub mod buffer;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod input;
pub mod metering;
pub mod plugin;
pub mod reload;
pub mod render;
pub mod samples;
pub mod signals;
pub mod spectrum;
pub mod stereo;
pub mod worker;

pub use device::{AudioDeviceInfo, EngineConfig};
pub use engine::AudioEngine;
pub use error::{EngineError, HostError, InputError, PluginLoadError, PluginRuntimeError, ReloadError};
pub use events::{EventSender, PreviewEvent};
pub use input::InputSource;
pub use metering::MeteringSnapshot;
pub use plugin::{ParameterInfo, PluginHost, PluginState};
pub use reload::{BuildOutcome, HotReloadCoordinator, ReloadDisposition, ReloadPolicy};
pub use render::TransportState;
