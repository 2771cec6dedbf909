//! Error types for the preview core

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::plugin::PluginState;

/// Failures opening or keeping the hardware stream. Fatal to the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Unsupported stream configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Audio engine is already running")]
    AlreadyRunning,

    #[error("Audio stream error: {0}")]
    Stream(String),
}

/// Failures while opening a plugin binary. The host is left `Unloaded`.
#[derive(Debug, Error)]
pub enum PluginLoadError {
    #[error("Plugin not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to prepare plugin bundle: {0}")]
    Bundle(String),

    #[error("Failed to load library: {0}")]
    Library(String),

    #[error("Missing entry point: {0}")]
    MissingEntryPoint(String),

    #[error("Incompatible plugin: {0}")]
    Incompatible(String),

    #[error("Plugin initialization failed: {0}")]
    Init(String),

    #[error("Plugin load timed out after {0:?}")]
    Timeout(Duration),
}

/// A fault raised while the plugin processes a buffer.
///
/// `ProcessFailed` silences the one buffer it happened in. `Crashed` means the
/// instance can no longer be trusted and stays silent until it is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PluginRuntimeError {
    #[error("Plugin reported a processing error")]
    ProcessFailed,

    #[error("Plugin crashed during processing (signal {signal})")]
    Crashed { signal: i32 },
}

/// Misuse of the plugin host, such as calling into a plugin that is not active.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("No active plugin (state: {0:?})")]
    NotActive(PluginState),

    #[error("Plugin has no editor")]
    NoEditor,

    #[error("Editor error: {0}")]
    Editor(String),

    #[error("Unknown parameter id {0}")]
    UnknownParameter(u32),

    #[error("Parameter value {0} is not a finite number")]
    InvalidValue(f64),

    #[error("Plugin event queue is full")]
    QueueFull,

    #[error("Plugin state error: {0}")]
    State(String),
}

/// A hot reload step failed. The host is left in `Error`.
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("No plugin to reload")]
    NothingToReload,

    #[error("Reload failed: {0}")]
    Load(#[from] PluginLoadError),

    #[error("Reload failed to reopen editor: {0}")]
    Editor(#[source] HostError),
}

/// A requested input source could not be built. The previous source stays active.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to open {}: {message}", path.display())]
    Open { path: PathBuf, message: String },

    #[error("Unsupported audio format: {0}")]
    Format(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Resample error: {0}")]
    Resample(String),

    #[error("Input change queue is full")]
    Busy,
}
