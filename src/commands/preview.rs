//! Command surface of the preview core
//!
//! [`Preview`] owns the engine, the plugin host and the reload coordinator and
//! exposes them as plain methods. Whatever UI bridge sits on top forwards its
//! commands here and drains the event receiver returned by the constructor.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use crate::audio::{
    device::{self, AudioDeviceInfo, EngineConfig},
    engine::AudioEngine,
    error::{EngineError, HostError, InputError, PluginLoadError, ReloadError},
    events::{EventSender, PreviewEvent},
    input::InputSource,
    metering::{MeteringHub, MeteringSnapshot},
    plugin::{
        clap_host::{cleanup_temp_bundles, ClapLoader},
        crash_guard,
        file_watcher::PluginWatcher,
        ParameterInfo, PluginHost, PluginLoader, PluginSlot, PluginState, ProcessSettings,
    },
    reload::{BuildOutcome, HotReloadCoordinator, ReloadDisposition, ReloadPolicy},
    render::TransportState,
    worker::WorkerSettings,
};

/// Preview behavior chosen by the owner, usually from its preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreviewConfig {
    pub reload_policy: ReloadPolicy,
    pub plugin_load_timeout_ms: u64,
    pub device_open_timeout_ms: u64,
    pub metering_hz: u32,
    /// Rate of `metering_update` events; the snapshot itself updates at `metering_hz`
    pub metering_event_hz: u32,
    /// Let the metering worker call `idle_tick` instead of the owner
    pub worker_drives_idle: bool,
    /// Reload when the previewed bundle changes on disk
    pub auto_reload_on_change: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            reload_policy: ReloadPolicy::default(),
            plugin_load_timeout_ms: 10_000,
            device_open_timeout_ms: 3_000,
            metering_hz: 60,
            metering_event_hz: 30,
            worker_drives_idle: false,
            auto_reload_on_change: false,
        }
    }
}

pub struct Preview {
    watcher: Mutex<Option<PluginWatcher>>,
    config: PreviewConfig,
    engine: Arc<AudioEngine>,
    host: Arc<PluginHost>,
    hub: Arc<MeteringHub>,
    coordinator: Arc<HotReloadCoordinator>,
}

impl Preview {
    /// Preview core hosting CLAP plugins
    pub fn new(config: PreviewConfig) -> (Self, Receiver<PreviewEvent>) {
        crash_guard::prepare();
        cleanup_temp_bundles();
        Self::with_loader(config, Arc::new(ClapLoader))
    }

    pub fn with_loader(
        config: PreviewConfig,
        loader: Arc<dyn PluginLoader>,
    ) -> (Self, Receiver<PreviewEvent>) {
        let (events, events_rx) = EventSender::channel();
        let slot = Arc::new(PluginSlot::new());
        let hub = Arc::new(MeteringHub::new());

        let host = Arc::new(PluginHost::new(
            loader,
            slot.clone(),
            events.clone(),
            Duration::from_millis(config.plugin_load_timeout_ms),
        ));
        let engine = Arc::new(AudioEngine::new(
            slot,
            host.clone(),
            hub.clone(),
            events,
            WorkerSettings {
                metering_hz: config.metering_hz,
                metering_event_hz: config.metering_event_hz,
                drives_idle: config.worker_drives_idle,
            },
            Duration::from_millis(config.device_open_timeout_ms),
        ));
        let coordinator = Arc::new(HotReloadCoordinator::new(
            host.clone(),
            engine.clone(),
            config.reload_policy,
        ));

        let preview = Self {
            watcher: Mutex::new(None),
            config,
            engine,
            host,
            hub,
            coordinator,
        };
        (preview, events_rx)
    }

    pub fn config(&self) -> &PreviewConfig {
        &self.config
    }

    // =========================================================================
    // Engine
    // =========================================================================

    /// Open the output device. A loaded plugin is reloaded if it was activated
    /// for a different rate, block size or channel count.
    pub fn start_engine(&self, config: EngineConfig) -> Result<(), EngineError> {
        let settings = ProcessSettings::new(config.sample_rate, config.buffer_size, config.channels);
        self.engine.start(config)?;

        if self.host.set_process_settings(settings) && self.host.state().is_active() {
            log::info!("Engine settings changed, reloading plugin");
            if let Err(e) = self.coordinator.reload() {
                log::error!("Plugin reload after engine restart failed: {}", e);
            }
        }
        Ok(())
    }

    pub fn stop_engine(&self) {
        self.engine.stop();
    }

    pub fn is_engine_running(&self) -> bool {
        self.engine.is_running()
    }

    pub fn engine_config(&self) -> Option<EngineConfig> {
        self.engine.config()
    }

    pub fn set_input(&self, source: InputSource) -> Result<(), InputError> {
        self.engine.set_input(source)
    }

    pub fn input(&self) -> InputSource {
        self.engine.input()
    }

    // =========================================================================
    // Transport
    // =========================================================================

    pub fn play(&self) {
        self.engine.play();
    }

    pub fn pause(&self) {
        self.engine.pause();
    }

    /// Silence and rewind the input. The plugin keeps processing.
    pub fn stop(&self) {
        self.engine.stop_playback();
    }

    pub fn transport_state(&self) -> TransportState {
        self.engine.transport_state()
    }

    /// Linear output gain, clamped to 0..=1
    pub fn set_master_volume(&self, volume: f32) {
        self.engine.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.engine.master_volume()
    }

    // =========================================================================
    // Plugin lifecycle
    // =========================================================================

    pub fn load_plugin(&self, path: impl AsRef<Path>) -> Result<(), PluginLoadError> {
        let path = path.as_ref();
        self.watcher.lock().take();
        self.host.load(path)?;

        if self.config.auto_reload_on_change {
            match self.coordinator.watch(path) {
                Ok(watcher) => *self.watcher.lock() = Some(watcher),
                Err(e) => log::warn!("Could not watch {:?} for changes: {}", path, e),
            }
        }
        Ok(())
    }

    pub fn unload_plugin(&self) {
        self.watcher.lock().take();
        self.host.unload();
    }

    pub fn reload_plugin(&self) -> Result<(), ReloadError> {
        self.coordinator.reload()
    }

    pub fn handle_build_outcome(
        &self,
        outcome: &BuildOutcome,
    ) -> Result<ReloadDisposition, ReloadError> {
        self.coordinator.handle_build_outcome(outcome)
    }

    /// Future reloading for each outcome sent on `outcomes`. Spawn it on a
    /// tokio runtime; it ends when the sender is dropped.
    pub fn build_listener(
        &self,
        outcomes: tokio::sync::mpsc::Receiver<BuildOutcome>,
    ) -> impl Future<Output = ()> + Send + 'static {
        self.coordinator.clone().run_build_listener(outcomes)
    }

    pub fn plugin_state(&self) -> PluginState {
        self.host.state()
    }

    // =========================================================================
    // Editor and parameters
    // =========================================================================

    pub fn open_editor(&self) -> Result<(), HostError> {
        self.host.open_editor()
    }

    pub fn close_editor(&self) -> Result<(), HostError> {
        self.host.close_editor()
    }

    pub fn parameters(&self) -> Vec<ParameterInfo> {
        self.host.parameters()
    }

    pub fn get_parameter(&self, id: u32) -> Result<f64, HostError> {
        self.host.get_parameter(id)
    }

    pub fn set_parameter(&self, id: u32, value: f64) -> Result<(), HostError> {
        self.host.set_parameter(id, value)
    }

    pub fn begin_gesture(&self, id: u32) -> Result<(), HostError> {
        self.host.begin_gesture(id)
    }

    pub fn end_gesture(&self, id: u32) -> Result<(), HostError> {
        self.host.end_gesture(id)
    }

    pub fn note_on(&self, note: u8, velocity: u8) -> Result<(), HostError> {
        self.host.note_on(note, velocity)
    }

    pub fn note_off(&self, note: u8) -> Result<(), HostError> {
        self.host.note_off(note)
    }

    pub fn all_notes_off(&self) -> Result<(), HostError> {
        self.host.all_notes_off()
    }

    /// Service plugin main-thread work. Call at ~60 Hz from the UI thread
    /// unless `worker_drives_idle` is set.
    pub fn idle_tick(&self) {
        self.host.idle_tick();
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn metering(&self) -> Arc<MeteringSnapshot> {
        self.hub.latest()
    }

    pub fn list_output_devices(&self) -> Result<Vec<AudioDeviceInfo>, EngineError> {
        device::list_output_devices()
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.watcher.lock().take();
        self.engine.stop();
        self.host.unload();
    }
}
