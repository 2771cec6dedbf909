//! Plugin lifecycle and control-side operations
//!
//! Control operations are serialized on a reentrant operation lock, so a hot
//! reload can hold it across its whole sequence while still calling the public
//! methods below.
//!
//! Editor and callback calls go through the module's [`MainThreadHandle`],
//! held here rather than in the slot, so slow GUI work never starves the
//! audio callback.

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    FaultReport, HostEvent, MainThreadHandle, ParameterInfo, PluginControl, PluginLoader,
    PluginModule, PluginSlot, PluginState, ProcessSettings,
};
use crate::audio::error::{HostError, PluginLoadError};
use crate::audio::events::{EventSender, PreviewEvent};
use crate::commands::logging::log_message;

pub struct PluginHost {
    slot: Arc<PluginSlot>,
    loader: Arc<dyn PluginLoader>,
    state: RwLock<PluginState>,
    operations: ReentrantMutex<()>,
    settings: RwLock<ProcessSettings>,
    control: RwLock<Option<Arc<PluginControl>>>,
    main_thread: Mutex<Option<Box<dyn MainThreadHandle>>>,
    /// Activation rate of the installed module
    sample_rate: AtomicU32,
    open_gestures: Mutex<HashSet<u32>>,
    /// Plugin the user asked to preview; survives `Reloading` and `Error`
    previewed: RwLock<Option<PathBuf>>,
    events: EventSender,
    load_timeout: Duration,
}

impl PluginHost {
    pub fn new(
        loader: Arc<dyn PluginLoader>,
        slot: Arc<PluginSlot>,
        events: EventSender,
        load_timeout: Duration,
    ) -> Self {
        Self {
            slot,
            loader,
            state: RwLock::new(PluginState::Unloaded),
            operations: ReentrantMutex::new(()),
            settings: RwLock::new(ProcessSettings::default()),
            control: RwLock::new(None),
            main_thread: Mutex::new(None),
            sample_rate: AtomicU32::new(0),
            open_gestures: Mutex::new(HashSet::new()),
            previewed: RwLock::new(None),
            events,
            load_timeout,
        }
    }

    /// Hold this to run several operations without interleaving others
    pub fn lock_operations(&self) -> ReentrantMutexGuard<'_, ()> {
        self.operations.lock()
    }

    pub fn state(&self) -> PluginState {
        self.state.read().clone()
    }

    pub fn set_state(&self, state: PluginState) {
        log::info!("Plugin state: {:?}", state);
        *self.state.write() = state.clone();
        self.events.emit(PreviewEvent::PluginStateChanged(state));
    }

    pub fn previewed_path(&self) -> Option<PathBuf> {
        self.previewed.read().clone()
    }

    pub fn process_settings(&self) -> ProcessSettings {
        *self.settings.read()
    }

    /// Settings used for the next load. Returns true if they changed.
    pub fn set_process_settings(&self, settings: ProcessSettings) -> bool {
        let mut current = self.settings.write();
        if *current == settings {
            return false;
        }
        *current = settings;
        true
    }

    fn active_control(&self) -> Result<Arc<PluginControl>, HostError> {
        let state = self.state.read();
        if !state.is_active() {
            return Err(HostError::NotActive(state.clone()));
        }
        self.control
            .read()
            .clone()
            .ok_or_else(|| HostError::NotActive(state.clone()))
    }

    fn require_active(&self) -> Result<(), HostError> {
        let state = self.state.read();
        if state.is_active() {
            Ok(())
        } else {
            Err(HostError::NotActive(state.clone()))
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Load a plugin, replacing whatever is loaded now
    pub fn load(&self, path: &Path) -> Result<(), PluginLoadError> {
        let _op = self.lock_operations();

        self.release_module(false);
        *self.previewed.write() = Some(path.to_path_buf());
        self.set_state(PluginState::Loading {
            path: path.to_path_buf(),
        });

        match self.load_and_install(path) {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Failed to load plugin {:?}: {}", path, e);
                *self.previewed.write() = None;
                self.set_state(PluginState::Error {
                    message: e.to_string(),
                });
                self.set_state(PluginState::Unloaded);
                Err(e)
            }
        }
    }

    /// Open `path` and make it the active module. On failure nothing is installed
    /// and the state is left for the caller to settle.
    pub fn load_and_install(&self, path: &Path) -> Result<(), PluginLoadError> {
        let _op = self.lock_operations();

        let module = self.load_module(path)?;
        let name = module.name().to_string();
        let has_editor = module.has_editor();
        let control = module.control();

        self.open_gestures.lock().clear();
        *self.control.write() = Some(control);
        *self.main_thread.lock() = Some(module.main_thread());
        self.sample_rate.store(module.sample_rate(), Ordering::Release);
        self.slot.install(module);
        *self.previewed.write() = Some(path.to_path_buf());

        log::info!("Plugin active: {} ({:?})", name, path);
        self.set_state(PluginState::Active {
            name,
            path: path.to_path_buf(),
            has_editor,
            editor_open: false,
        });
        Ok(())
    }

    /// Run the loader on its own thread, giving up after the load timeout
    fn load_module(&self, path: &Path) -> Result<Box<dyn PluginModule>, PluginLoadError> {
        let (tx, rx) = mpsc::channel();
        let loader = self.loader.clone();
        let settings = self.process_settings();
        let path_buf = path.to_path_buf();

        thread::Builder::new()
            .name("plugin-loader".to_string())
            .spawn(move || {
                let result = loader.load(&path_buf, &settings);
                // Nobody is waiting any more: the load timed out
                if let Err(mpsc::SendError(Ok(module))) = tx.send(result) {
                    log::warn!("Plugin {:?} finished loading after timeout, releasing", path_buf);
                    if let Err(e) = module.release() {
                        log::error!("Failed to release late plugin: {}", e);
                    }
                }
            })
            .map_err(|e| PluginLoadError::Init(format!("failed to spawn loader thread: {}", e)))?;

        match rx.recv_timeout(self.load_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PluginLoadError::Timeout(self.load_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(PluginLoadError::Init("loader thread exited unexpectedly".to_string()))
            }
        }
    }

    /// Unload whatever is loaded. Always ends `Unloaded`.
    pub fn unload(&self) {
        let _op = self.lock_operations();

        if matches!(*self.state.read(), PluginState::Unloaded) && !self.slot.is_loaded() {
            return;
        }

        self.release_module(false);
        *self.previewed.write() = None;
        self.set_state(PluginState::Unloaded);
    }

    /// Close the editor, take the module out of the slot and release it.
    /// Optionally captures the plugin state first.
    ///
    /// A module that crashed is never called into again and is leaked instead.
    pub fn release_module(&self, capture_state: bool) -> Option<Vec<u8>> {
        let _op = self.lock_operations();

        let main_thread = self.main_thread.lock().take();
        let mut saved = None;
        if !self.slot.is_faulted() {
            if let Some(mut main_thread) = main_thread {
                main_thread.close_editor();
            }
            if capture_state {
                saved = self
                    .slot
                    .with_module(|module| match module.save_state() {
                        Ok(state) => Some(state),
                        Err(e) => {
                            log::warn!("Could not capture plugin state: {}", e);
                            None
                        }
                    })
                    .flatten();
            }
        }

        *self.control.write() = None;
        self.open_gestures.lock().clear();

        let (module, crashed) = self.slot.take()?;
        let name = module.name().to_string();
        if crashed {
            log::warn!("Leaking crashed plugin instance: {}", name);
            std::mem::forget(module);
            return saved;
        }

        match module.release() {
            Ok(()) => log::info!("Plugin released: {}", name),
            Err(e) => {
                log::error!("Failed to release plugin {}: {}", name, e);
                log_message(
                    "ERROR",
                    "plugin_host",
                    &format!("Failed to release plugin {}: {}", name, e),
                );
            }
        }
        saved
    }

    /// Move to `Error`, keeping the previewed path so a rebuild can recover
    pub fn fail(&self, message: impl Into<String>) {
        self.set_state(PluginState::Error {
            message: message.into(),
        });
    }

    /// Surface faults latched by the audio thread
    pub fn report_fault(&self, report: FaultReport) {
        if report.generation != self.slot.generation() {
            log::debug!("Dropping fault report for a previous plugin instance");
            return;
        }

        if report.transient > 0 {
            log::warn!("Plugin processing error ({} buffer(s) silenced)", report.transient);
            self.events.engine_error(format!(
                "Plugin processing error ({} buffer(s) silenced)",
                report.transient
            ));
        }

        if let Some(signal) = report.fatal {
            let _op = self.lock_operations();
            let message = format!(
                "Plugin crashed during processing (signal {}). Output is muted until it is unloaded or rebuilt.",
                signal
            );
            log::error!("{}", message);
            log_message("ERROR", "plugin_host", &message);
            self.fail(message);
        }
    }

    // =========================================================================
    // Parameters and events
    // =========================================================================

    pub fn parameters(&self) -> Vec<ParameterInfo> {
        self.active_control()
            .ok()
            .and_then(|control| control.params().map(|p| p.infos()))
            .unwrap_or_default()
    }

    /// Normalized 0..1 value
    pub fn get_parameter(&self, id: u32) -> Result<f64, HostError> {
        let control = self.active_control()?;
        control
            .params()
            .and_then(|params| params.get_normalized(id))
            .ok_or(HostError::UnknownParameter(id))
    }

    /// Set a normalized value. Wrapped in a gesture unless one is already open.
    ///
    /// The cached value only changes once the plugin has been sent the change.
    pub fn set_parameter(&self, id: u32, value: f64) -> Result<(), HostError> {
        let control = self.active_control()?;
        if !value.is_finite() {
            return Err(HostError::InvalidValue(value));
        }
        let params = control.params().ok_or(HostError::UnknownParameter(id))?;
        let plain = params
            .plain_for(id, value)
            .ok_or(HostError::UnknownParameter(id))?;

        let change = HostEvent::ParamValue { id, value: plain };
        let queued = if self.open_gestures.lock().contains(&id) {
            control.events.push(change)
        } else {
            control.events.push_all(&[
                HostEvent::GestureBegin { id },
                change,
                HostEvent::GestureEnd { id },
            ])
        };

        if !queued {
            return Err(HostError::QueueFull);
        }
        params.set_plain(id, plain);
        Ok(())
    }

    pub fn begin_gesture(&self, id: u32) -> Result<(), HostError> {
        let control = self.active_control()?;
        if control.params().and_then(|p| p.get_normalized(id)).is_none() {
            return Err(HostError::UnknownParameter(id));
        }
        if !self.open_gestures.lock().insert(id) {
            return Ok(());
        }
        if control.events.push(HostEvent::GestureBegin { id }) {
            Ok(())
        } else {
            self.open_gestures.lock().remove(&id);
            Err(HostError::QueueFull)
        }
    }

    pub fn end_gesture(&self, id: u32) -> Result<(), HostError> {
        let control = self.active_control()?;
        if !self.open_gestures.lock().remove(&id) {
            return Ok(());
        }
        if control.events.push(HostEvent::GestureEnd { id }) {
            Ok(())
        } else {
            Err(HostError::QueueFull)
        }
    }

    fn send_event(&self, event: HostEvent) -> Result<(), HostError> {
        let control = self.active_control()?;
        if control.events.push(event) {
            Ok(())
        } else {
            Err(HostError::QueueFull)
        }
    }

    pub fn note_on(&self, note: u8, velocity: u8) -> Result<(), HostError> {
        self.send_event(HostEvent::NoteOn { note, velocity })
    }

    pub fn note_off(&self, note: u8) -> Result<(), HostError> {
        self.send_event(HostEvent::NoteOff { note })
    }

    pub fn all_notes_off(&self) -> Result<(), HostError> {
        self.send_event(HostEvent::AllNotesOff)
    }

    // =========================================================================
    // Main-thread servicing
    // =========================================================================

    /// Service plugin main-thread requests. Call at roughly 60 Hz.
    pub fn idle_tick(&self) {
        let Ok(control) = self.active_control() else {
            return;
        };
        if self.slot.is_faulted() {
            return;
        }

        if control.take_editor_closed() {
            let _op = self.lock_operations();
            log::info!("Plugin editor closed by the user");
            if let Some(main_thread) = self.main_thread.lock().as_mut() {
                main_thread.close_editor();
            }
            self.set_editor_open(false);
        }

        if control.take_callback_request() {
            if let Some(main_thread) = self.main_thread.lock().as_mut() {
                main_thread.on_main_thread();
            }
        }

        // Only when nothing is processing, so the slot is free
        if control.needs_flush() {
            self.slot.with_module(|module| module.flush_events());
        }
    }

    // =========================================================================
    // Editor
    // =========================================================================

    pub fn has_editor(&self) -> bool {
        matches!(*self.state.read(), PluginState::Active { has_editor: true, .. })
    }

    pub fn is_editor_open(&self) -> bool {
        matches!(*self.state.read(), PluginState::Active { editor_open: true, .. })
    }

    fn set_editor_open(&self, open: bool) {
        let state = self.state();
        if let PluginState::Active {
            name,
            path,
            has_editor,
            editor_open,
        } = state
        {
            if editor_open != open {
                self.set_state(PluginState::Active {
                    name,
                    path,
                    has_editor,
                    editor_open: open,
                });
            }
        }
    }

    pub fn open_editor(&self) -> Result<(), HostError> {
        let _op = self.lock_operations();
        self.require_active()?;
        if !self.has_editor() {
            return Err(HostError::NoEditor);
        }

        self.main_thread
            .lock()
            .as_mut()
            .map_or(Err(HostError::NoEditor), |main_thread| main_thread.open_editor())?;
        self.set_editor_open(true);
        Ok(())
    }

    pub fn close_editor(&self) -> Result<(), HostError> {
        let _op = self.lock_operations();
        self.require_active()?;

        if let Some(main_thread) = self.main_thread.lock().as_mut() {
            main_thread.close_editor();
        }
        self.set_editor_open(false);
        Ok(())
    }

    // =========================================================================
    // Misc
    // =========================================================================

    /// Rate the active plugin was activated with
    pub fn plugin_sample_rate(&self) -> Result<u32, HostError> {
        self.require_active()?;
        Ok(self.sample_rate.load(Ordering::Acquire))
    }

    pub fn save_state(&self) -> Result<Vec<u8>, HostError> {
        let _op = self.lock_operations();
        self.require_active()?;
        self.slot
            .with_module(|module| module.save_state())
            .unwrap_or_else(|| Err(HostError::NotActive(self.state())))
    }

    pub fn restore_state(&self, data: &[u8]) -> Result<(), HostError> {
        let _op = self.lock_operations();
        self.require_active()?;
        self.slot
            .with_module(|module| module.load_state(data))
            .unwrap_or_else(|| Err(HostError::NotActive(self.state())))
    }
}

impl Drop for PluginHost {
    fn drop(&mut self) {
        self.release_module(false);
    }
}
