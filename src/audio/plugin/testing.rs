//! In-memory plugin used by the host, render and reload tests

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    HostEvent, MainThreadHandle, ParamDescriptor, PluginControl, PluginLoader, PluginModule,
    ProcessSettings,
};
use crate::audio::error::{HostError, PluginLoadError, PluginRuntimeError};

pub const GAIN_PARAM: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultScript {
    None,
    FailOnce,
    CrashOnce(i32),
}

#[derive(Default)]
struct Shared {
    process_calls: AtomicUsize,
    flush_calls: AtomicUsize,
    callbacks: AtomicUsize,
    editor_opens: AtomicUsize,
    editor_open: AtomicBool,
    released: AtomicBool,
    gain: Mutex<f64>,
    events: Mutex<Vec<HostEvent>>,
    faults: Mutex<Option<FaultScript>>,
    reject_state: AtomicBool,
    fail_release: AtomicBool,
    fail_editor: AtomicBool,
    /// How long editor and callback calls take
    main_thread_delay: Mutex<Duration>,
}

impl Shared {
    fn main_thread_work(&self) {
        let delay = *self.main_thread_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }
}

/// Observes a [`ScriptedPlugin`] after it has been boxed and handed over
#[derive(Clone)]
pub struct Probe {
    shared: Arc<Shared>,
}

impl Probe {
    pub fn process_calls(&self) -> usize {
        self.shared.process_calls.load(Ordering::SeqCst)
    }

    pub fn flush_calls(&self) -> usize {
        self.shared.flush_calls.load(Ordering::SeqCst)
    }

    pub fn callbacks(&self) -> usize {
        self.shared.callbacks.load(Ordering::SeqCst)
    }

    /// Make editor and callback calls slow, like real GUI work
    pub fn set_main_thread_delay(&self, delay: Duration) {
        *self.shared.main_thread_delay.lock() = delay;
    }

    pub fn editor_opens(&self) -> usize {
        self.shared.editor_opens.load(Ordering::SeqCst)
    }

    pub fn is_editor_open(&self) -> bool {
        self.shared.editor_open.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    pub fn gain(&self) -> f64 {
        *self.shared.gain.lock()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.shared.events.lock().clone()
    }

    pub fn script_faults(&self, script: FaultScript) {
        *self.shared.faults.lock() = Some(script);
    }

    pub fn reject_state(&self) {
        self.shared.reject_state.store(true, Ordering::SeqCst);
    }

    pub fn fail_release(&self) {
        self.shared.fail_release.store(true, Ordering::SeqCst);
    }

    pub fn fail_editor(&self) {
        self.shared.fail_editor.store(true, Ordering::SeqCst);
    }

    /// Simulate the user closing the editor window
    pub fn close_window(&self, control: &PluginControl) {
        self.shared.editor_open.store(false, Ordering::SeqCst);
        control.notify_editor_closed();
    }
}

/// A gain plugin with one parameter whose behavior tests can script
pub struct ScriptedPlugin {
    name: String,
    sample_rate: u32,
    has_editor: bool,
    control: Arc<PluginControl>,
    shared: Arc<Shared>,
}

impl ScriptedPlugin {
    pub fn new(name: &str, sample_rate: u32) -> (Self, Probe) {
        let control = Arc::new(PluginControl::new());
        control.set_params(vec![ParamDescriptor {
            id: GAIN_PARAM,
            name: "Gain".to_string(),
            min: 0.0,
            max: 1.0,
            default: 1.0,
            current: 1.0,
        }]);

        let shared = Arc::new(Shared::default());
        *shared.gain.lock() = 1.0;

        let plugin = Self {
            name: name.to_string(),
            sample_rate,
            has_editor: true,
            control,
            shared: shared.clone(),
        };
        (plugin, Probe { shared })
    }

    pub fn without_editor(mut self) -> Self {
        self.has_editor = false;
        self
    }

    pub fn script_faults(&self, script: FaultScript) {
        *self.shared.faults.lock() = Some(script);
    }

    fn apply(&self, event: HostEvent) {
        if let HostEvent::ParamValue { id: GAIN_PARAM, value } = event {
            *self.shared.gain.lock() = value;
        }
        self.shared.events.lock().push(event);
    }
}

impl PluginModule for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, buffer: &mut [f32], _channels: usize) -> Result<(), PluginRuntimeError> {
        self.shared.process_calls.fetch_add(1, Ordering::SeqCst);
        self.control.mark_processed();

        let script = self.shared.faults.lock().take();
        match script {
            Some(FaultScript::FailOnce) => return Err(PluginRuntimeError::ProcessFailed),
            Some(FaultScript::CrashOnce(signal)) => {
                return Err(PluginRuntimeError::Crashed { signal })
            }
            Some(FaultScript::None) | None => {}
        }

        let control = self.control.clone();
        control.events.drain(|event| self.apply(event));

        let gain = *self.shared.gain.lock() as f32;
        if gain != 1.0 {
            for sample in buffer.iter_mut() {
                *sample *= gain;
            }
        }
        Ok(())
    }

    fn has_editor(&self) -> bool {
        self.has_editor
    }

    fn main_thread(&self) -> Box<dyn MainThreadHandle> {
        Box::new(ScriptedMainThread {
            has_editor: self.has_editor,
            shared: self.shared.clone(),
        })
    }

    fn flush_events(&mut self) {
        self.shared.flush_calls.fetch_add(1, Ordering::SeqCst);
        self.control.take_flush_request();
        let control = self.control.clone();
        control.events.drain(|event| self.apply(event));
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        Ok(self.shared.gain.lock().to_le_bytes().to_vec())
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError> {
        if self.shared.reject_state.load(Ordering::SeqCst) {
            return Err(HostError::State("incompatible state".to_string()));
        }
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| HostError::State("bad length".to_string()))?;
        let gain = f64::from_le_bytes(bytes);
        *self.shared.gain.lock() = gain;
        if let Some(params) = self.control.params() {
            params.set_plain(GAIN_PARAM, gain);
        }
        Ok(())
    }

    fn control(&self) -> Arc<PluginControl> {
        self.control.clone()
    }

    fn release(self: Box<Self>) -> Result<(), String> {
        self.shared.released.store(true, Ordering::SeqCst);
        self.shared.editor_open.store(false, Ordering::SeqCst);
        if self.shared.fail_release.load(Ordering::SeqCst) {
            return Err("deactivate failed".to_string());
        }
        Ok(())
    }
}

struct ScriptedMainThread {
    has_editor: bool,
    shared: Arc<Shared>,
}

impl MainThreadHandle for ScriptedMainThread {
    fn open_editor(&mut self) -> Result<(), HostError> {
        if !self.has_editor {
            return Err(HostError::NoEditor);
        }
        self.shared.main_thread_work();
        if self.shared.fail_editor.load(Ordering::SeqCst) {
            return Err(HostError::Editor("window creation failed".to_string()));
        }
        self.shared.editor_opens.fetch_add(1, Ordering::SeqCst);
        self.shared.editor_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_editor(&mut self) {
        self.shared.editor_open.store(false, Ordering::SeqCst);
    }

    fn on_main_thread(&mut self) {
        self.shared.main_thread_work();
        self.shared.callbacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Loader handing out [`ScriptedPlugin`]s named after the file stem
#[derive(Default)]
pub struct ScriptedLoader {
    delay: Mutex<Duration>,
    fail: AtomicBool,
    without_editor: AtomicBool,
    loads: Mutex<Vec<PathBuf>>,
    probes: Mutex<Vec<Probe>>,
    next_state_rejected: AtomicBool,
    next_editor_fails: AtomicBool,
}

impl ScriptedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn without_editor(&self) {
        self.without_editor.store(true, Ordering::SeqCst);
    }

    /// The next instance rejects restored state
    pub fn reject_next_state(&self) {
        self.next_state_rejected.store(true, Ordering::SeqCst);
    }

    /// The next instance fails to open its editor
    pub fn fail_next_editor(&self) {
        self.next_editor_fails.store(true, Ordering::SeqCst);
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.loads.lock().clone()
    }

    pub fn probe(&self, index: usize) -> Probe {
        self.probes.lock()[index].clone()
    }

    pub fn last_probe(&self) -> Probe {
        self.probes
            .lock()
            .last()
            .cloned()
            .expect("nothing loaded yet")
    }
}

impl PluginLoader for ScriptedLoader {
    fn load(
        &self,
        path: &Path,
        settings: &ProcessSettings,
    ) -> Result<Box<dyn PluginModule>, PluginLoadError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        self.loads.lock().push(path.to_path_buf());
        if self.fail.load(Ordering::SeqCst) {
            return Err(PluginLoadError::Init("scripted failure".to_string()));
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "Plugin".to_string());
        let (mut plugin, probe) = ScriptedPlugin::new(&name, settings.sample_rate);
        if self.without_editor.load(Ordering::SeqCst) {
            plugin = plugin.without_editor();
        }
        if self.next_state_rejected.swap(false, Ordering::SeqCst) {
            probe.reject_state();
        }
        if self.next_editor_fails.swap(false, Ordering::SeqCst) {
            probe.fail_editor();
        }

        self.probes.lock().push(probe);
        Ok(Box::new(plugin))
    }
}
