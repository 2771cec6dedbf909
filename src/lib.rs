//! Preview core for audio plugins under development
//!
//! Plays test signals or samples through a hosted CLAP plugin and swaps the
//! plugin for its rebuilt binary without stopping the audio stream.

pub mod audio;
pub mod commands;

pub use audio::{
    BuildOutcome, EngineConfig, InputSource, MeteringSnapshot, PluginState, PreviewEvent,
    ReloadPolicy, TransportState,
};
pub use commands::logging::init_logging;
pub use commands::preview::{Preview, PreviewConfig};
