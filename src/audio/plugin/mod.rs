//! Plugin hosting
//!
//! One plugin module at a time lives in a [`PluginSlot`]. The audio thread
//! reaches it with `try_lock` only; everything else goes through the
//! [`PluginHost`] state machine.

pub mod clap_host;
pub mod clap_sys;
pub mod crash_guard;
pub mod file_watcher;
pub mod host;
#[cfg(test)]
pub(crate) mod testing;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use super::error::{HostError, PluginLoadError, PluginRuntimeError};

pub use host::PluginHost;

/// Smallest block size plugins are activated for, whatever the device buffer
const MIN_MAX_FRAMES: u32 = 4096;

/// Host-to-plugin events buffered between process calls
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Lifecycle of the hosted plugin
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PluginState {
    #[default]
    Unloaded,
    Loading {
        path: PathBuf,
    },
    Active {
        name: String,
        path: PathBuf,
        has_editor: bool,
        editor_open: bool,
    },
    Reloading {
        path: PathBuf,
    },
    Error {
        message: String,
    },
}

impl PluginState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Loading { path } | Self::Active { path, .. } | Self::Reloading { path } => {
                Some(path)
            }
            Self::Unloaded | Self::Error { .. } => None,
        }
    }
}

/// What a plugin instance is activated with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSettings {
    pub sample_rate: u32,
    pub max_frames: u32,
    pub channels: u16,
}

impl ProcessSettings {
    pub fn new(sample_rate: u32, buffer_size: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            max_frames: buffer_size.max(MIN_MAX_FRAMES),
            channels,
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self::new(48000, 512, 2)
    }
}

/// A plugin parameter as shown to the UI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterInfo {
    pub id: u32,
    pub name: String,
    /// Normalized 0..1
    pub default_value: f64,
}

/// Host-to-plugin event delivered at the start of the next process call
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HostEvent {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    AllNotesOff,
    /// Plain (not normalized) value
    ParamValue { id: u32, value: f64 },
    GestureBegin { id: u32 },
    GestureEnd { id: u32 },
}

/// Lock-free event queue between control threads and the audio thread.
///
/// Producers serialize on a mutex; the audio thread only ever `try_lock`s the
/// consumer so a busy producer can never block it.
pub struct HostEventQueue {
    producer: Mutex<ringbuf::HeapProd<HostEvent>>,
    consumer: Mutex<ringbuf::HeapCons<HostEvent>>,
}

impl HostEventQueue {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::new(capacity).split();
        Self {
            producer: Mutex::new(producer),
            consumer: Mutex::new(consumer),
        }
    }

    pub fn push(&self, event: HostEvent) -> bool {
        self.producer.lock().try_push(event).is_ok()
    }

    /// Push all events or none
    pub fn push_all(&self, events: &[HostEvent]) -> bool {
        let mut producer = self.producer.lock();
        if producer.vacant_len() < events.len() {
            return false;
        }
        for &event in events {
            let _ = producer.try_push(event);
        }
        true
    }

    /// Pop everything queued. Skips this round if another thread is draining.
    #[inline]
    pub fn drain(&self, mut f: impl FnMut(HostEvent)) {
        if let Some(mut consumer) = self.consumer.try_lock() {
            while let Some(event) = consumer.try_pop() {
                f(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.try_lock().map(|c| c.is_empty()).unwrap_or(true)
    }
}

/// Static description of one parameter, gathered when a plugin loads
#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    pub id: u32,
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// Plain default
    pub default: f64,
    /// Plain value at load time
    pub current: f64,
}

/// Last known plain value of every parameter, readable from any thread
pub struct ParamValues {
    descriptors: Vec<ParamDescriptor>,
    values: Vec<AtomicU64>,
}

impl ParamValues {
    pub fn new(descriptors: Vec<ParamDescriptor>) -> Self {
        let values = descriptors
            .iter()
            .map(|d| AtomicU64::new(d.current.to_bits()))
            .collect();
        Self {
            descriptors,
            values,
        }
    }

    fn index_of(&self, id: u32) -> Option<usize> {
        self.descriptors.iter().position(|d| d.id == id)
    }

    fn normalize(descriptor: &ParamDescriptor, plain: f64) -> f64 {
        let range = descriptor.max - descriptor.min;
        if range <= 0.0 {
            0.0
        } else {
            ((plain - descriptor.min) / range).clamp(0.0, 1.0)
        }
    }

    pub fn infos(&self) -> Vec<ParameterInfo> {
        self.descriptors
            .iter()
            .map(|d| ParameterInfo {
                id: d.id,
                name: d.name.clone(),
                default_value: Self::normalize(d, d.default),
            })
            .collect()
    }

    pub fn get_normalized(&self, id: u32) -> Option<f64> {
        let index = self.index_of(id)?;
        let plain = f64::from_bits(self.values[index].load(Ordering::Acquire));
        Some(Self::normalize(&self.descriptors[index], plain))
    }

    /// Plain value for a normalized one. Nothing is stored; commit with
    /// [`set_plain`](Self::set_plain) once the plugin has been told.
    pub fn plain_for(&self, id: u32, normalized: f64) -> Option<f64> {
        let descriptor = &self.descriptors[self.index_of(id)?];
        Some(descriptor.min + normalized.clamp(0.0, 1.0) * (descriptor.max - descriptor.min))
    }

    /// Record a plain value sent to or reported by the plugin
    pub fn set_plain(&self, id: u32, plain: f64) {
        if let Some(index) = self.index_of(id) {
            self.values[index].store(plain.to_bits(), Ordering::Release);
        }
    }
}

/// State shared between a plugin module, its host callbacks and the host
pub struct PluginControl {
    pub events: HostEventQueue,
    params: OnceCell<ParamValues>,
    callback_requested: AtomicBool,
    flush_requested: AtomicBool,
    editor_closed: AtomicBool,
    processed: AtomicBool,
}

impl PluginControl {
    pub fn new() -> Self {
        Self {
            events: HostEventQueue::new(EVENT_QUEUE_CAPACITY),
            params: OnceCell::new(),
            callback_requested: AtomicBool::new(false),
            flush_requested: AtomicBool::new(false),
            editor_closed: AtomicBool::new(false),
            processed: AtomicBool::new(false),
        }
    }

    /// Install the parameter table. Only the first call has any effect.
    pub fn set_params(&self, descriptors: Vec<ParamDescriptor>) {
        let _ = self.params.set(ParamValues::new(descriptors));
    }

    pub fn params(&self) -> Option<&ParamValues> {
        self.params.get()
    }

    pub fn request_callback(&self) {
        self.callback_requested.store(true, Ordering::Release);
    }

    pub fn take_callback_request(&self) -> bool {
        self.callback_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_flush(&self) {
        self.flush_requested.store(true, Ordering::Release);
    }

    pub fn take_flush_request(&self) -> bool {
        self.flush_requested.swap(false, Ordering::AcqRel)
    }

    /// The user closed the floating editor window
    pub fn notify_editor_closed(&self) {
        self.editor_closed.store(true, Ordering::Release);
    }

    pub fn take_editor_closed(&self) -> bool {
        self.editor_closed.swap(false, Ordering::AcqRel)
    }

    /// Called by the module after each process call
    #[inline]
    pub fn mark_processed(&self) {
        self.processed.store(true, Ordering::Release);
    }

    /// Whether queued events or a flush request are waiting with nobody to
    /// apply them. Only true when no process call happened since the last check.
    pub fn needs_flush(&self) -> bool {
        let processed = self.processed.swap(false, Ordering::AcqRel);
        !processed && (self.flush_requested.load(Ordering::Acquire) || !self.events.is_empty())
    }
}

impl Default for PluginControl {
    fn default() -> Self {
        Self::new()
    }
}

/// A loaded plugin instance, activated and ready to process
pub trait PluginModule: Send {
    fn name(&self) -> &str;

    /// Rate the instance was activated with
    fn sample_rate(&self) -> u32;

    /// Process interleaved audio in place. Audio thread only.
    fn process(&mut self, buffer: &mut [f32], channels: usize) -> Result<(), PluginRuntimeError>;

    fn has_editor(&self) -> bool;

    /// Editor and callback entry points that run beside `process`. The host
    /// drops the handle before calling [`release`](Self::release).
    fn main_thread(&self) -> Box<dyn MainThreadHandle>;

    /// Apply queued events while no process calls are happening
    fn flush_events(&mut self);

    fn save_state(&mut self) -> Result<Vec<u8>, HostError>;
    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError>;

    fn control(&self) -> Arc<PluginControl>;

    /// Deactivate and tear down the instance
    fn release(self: Box<Self>) -> Result<(), String>;
}

/// Main-thread half of a plugin module.
///
/// The host keeps it outside the [`PluginSlot`], so opening the editor or
/// running a requested callback never holds the lock the audio thread
/// processes under.
pub trait MainThreadHandle: Send {
    fn open_editor(&mut self) -> Result<(), HostError>;
    fn close_editor(&mut self);

    /// Run the callback the plugin asked for with `request_callback`
    fn on_main_thread(&mut self);
}

/// Creates plugin modules from files on disk
pub trait PluginLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        settings: &ProcessSettings,
    ) -> Result<Box<dyn PluginModule>, PluginLoadError>;
}

/// What happened to one buffer handed to the slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    /// The control side held the slot; the buffer was silenced
    Contended,
    /// Nothing loaded; the buffer passed through untouched
    Empty,
    Processed,
    /// The plugin faulted now or earlier; the buffer was silenced
    Silenced,
}

/// Faults latched on the audio thread since the last report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    pub generation: u64,
    pub transient: u32,
    /// Signal of an unrecoverable crash
    pub fatal: Option<i32>,
}

/// Holds the active plugin module and the audio-thread fault latches
pub struct PluginSlot {
    module: Mutex<Option<Box<dyn PluginModule>>>,
    generation: AtomicU64,
    faulted: AtomicBool,
    fatal_pending: AtomicBool,
    fault_signal: AtomicI32,
    fault_generation: AtomicU64,
    transient_count: AtomicU32,
}

impl PluginSlot {
    pub fn new() -> Self {
        Self {
            module: Mutex::new(None),
            generation: AtomicU64::new(0),
            faulted: AtomicBool::new(false),
            fatal_pending: AtomicBool::new(false),
            fault_signal: AtomicI32::new(0),
            fault_generation: AtomicU64::new(0),
            transient_count: AtomicU32::new(0),
        }
    }

    /// Bumped whenever the module is installed or removed
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn reset_faults(&self) {
        self.faulted.store(false, Ordering::Release);
        self.fatal_pending.store(false, Ordering::Release);
        self.transient_count.store(0, Ordering::Release);
    }

    pub fn install(&self, module: Box<dyn PluginModule>) {
        let mut slot = self.module.lock();
        *slot = Some(module);
        self.reset_faults();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove the module. Also reports whether it had crashed.
    pub fn take(&self) -> Option<(Box<dyn PluginModule>, bool)> {
        let mut slot = self.module.lock();
        let module = slot.take()?;
        let crashed = self.faulted.load(Ordering::Acquire);
        self.reset_faults();
        self.generation.fetch_add(1, Ordering::AcqRel);
        Some((module, crashed))
    }

    pub fn is_loaded(&self) -> bool {
        self.module.lock().is_some()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Run `f` against the module from a control thread
    pub fn with_module<R>(&self, f: impl FnOnce(&mut dyn PluginModule) -> R) -> Option<R> {
        let mut slot = self.module.lock();
        slot.as_mut().map(|module| f(module.as_mut()))
    }

    /// Audio thread entry point. Never blocks.
    #[inline]
    pub fn process(&self, buffer: &mut [f32], channels: usize) -> SlotOutcome {
        let Some(mut slot) = self.module.try_lock() else {
            buffer.fill(0.0);
            return SlotOutcome::Contended;
        };
        let Some(module) = slot.as_mut() else {
            return SlotOutcome::Empty;
        };

        if self.faulted.load(Ordering::Acquire) {
            buffer.fill(0.0);
            return SlotOutcome::Silenced;
        }

        match module.process(buffer, channels) {
            Ok(()) => SlotOutcome::Processed,
            Err(error) => {
                buffer.fill(0.0);
                self.fault_generation
                    .store(self.generation.load(Ordering::Acquire), Ordering::Release);
                match error {
                    PluginRuntimeError::Crashed { signal } => {
                        self.fault_signal.store(signal, Ordering::Release);
                        self.faulted.store(true, Ordering::Release);
                        self.fatal_pending.store(true, Ordering::Release);
                    }
                    PluginRuntimeError::ProcessFailed => {
                        self.transient_count.fetch_add(1, Ordering::AcqRel);
                    }
                }
                SlotOutcome::Silenced
            }
        }
    }

    /// Collect faults latched since the last call
    pub fn take_report(&self) -> Option<FaultReport> {
        let transient = self.transient_count.swap(0, Ordering::AcqRel);
        let fatal = self
            .fatal_pending
            .swap(false, Ordering::AcqRel)
            .then(|| self.fault_signal.load(Ordering::Acquire));

        if transient == 0 && fatal.is_none() {
            return None;
        }

        Some(FaultReport {
            generation: self.fault_generation.load(Ordering::Acquire),
            transient,
            fatal,
        })
    }
}

impl Default for PluginSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FaultScript, ScriptedPlugin};
    use super::*;

    #[test]
    fn test_event_queue_push_all_is_atomic() {
        let queue = HostEventQueue::new(4);
        assert!(queue.push(HostEvent::NoteOn {
            note: 60,
            velocity: 100
        }));
        let batch = [
            HostEvent::GestureBegin { id: 1 },
            HostEvent::ParamValue { id: 1, value: 0.5 },
            HostEvent::GestureEnd { id: 1 },
            HostEvent::AllNotesOff,
        ];
        assert!(!queue.push_all(&batch));
        assert!(queue.push_all(&batch[..3]));

        let mut drained = Vec::new();
        queue.drain(|e| drained.push(e));
        assert_eq!(drained.len(), 4);
        assert_eq!(drained[1], HostEvent::GestureBegin { id: 1 });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_param_values_normalize_against_range() {
        let params = ParamValues::new(vec![ParamDescriptor {
            id: 7,
            name: "Cutoff".to_string(),
            min: 20.0,
            max: 220.0,
            default: 120.0,
            current: 70.0,
        }]);

        assert_eq!(params.infos()[0].default_value, 0.5);
        assert_eq!(params.get_normalized(7), Some(0.25));
        assert_eq!(params.plain_for(7, 0.75), Some(170.0));
        // Converting does not commit
        assert_eq!(params.get_normalized(7), Some(0.25));
        params.set_plain(7, 170.0);
        assert_eq!(params.get_normalized(7), Some(0.75));
        assert_eq!(params.plain_for(7, 3.0), Some(220.0));
        assert_eq!(params.plain_for(8, 0.5), None);
        assert_eq!(params.get_normalized(8), None);
    }

    #[test]
    fn test_needs_flush_only_for_unprocessed_events() {
        let control = PluginControl::new();
        assert!(!control.needs_flush());

        control.events.push(HostEvent::NoteOff { note: 1 });
        control.mark_processed();
        assert!(!control.needs_flush());
        assert!(control.needs_flush());

        // Callbacks go through the main-thread handle instead
        let control = PluginControl::new();
        control.request_callback();
        assert!(!control.needs_flush());
        assert!(control.take_callback_request());
    }

    #[test]
    fn test_empty_slot_passes_through() {
        let slot = PluginSlot::new();
        let mut buffer = [0.25f32; 8];
        assert_eq!(slot.process(&mut buffer, 2), SlotOutcome::Empty);
        assert!(buffer.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_transient_fault_is_reported_once() {
        let slot = PluginSlot::new();
        let (plugin, _probe) = ScriptedPlugin::new("Gain", 48000);
        plugin.script_faults(FaultScript::FailOnce);
        slot.install(Box::new(plugin));

        let mut buffer = [0.5f32; 8];
        assert_eq!(slot.process(&mut buffer, 2), SlotOutcome::Silenced);
        assert!(buffer.iter().all(|&s| s == 0.0));

        let report = slot.take_report().unwrap();
        assert_eq!(report.transient, 1);
        assert_eq!(report.fatal, None);
        assert_eq!(report.generation, slot.generation());
        assert!(slot.take_report().is_none());

        let mut buffer = [0.5f32; 8];
        assert_eq!(slot.process(&mut buffer, 2), SlotOutcome::Processed);
        assert!(buffer.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_crash_latches_until_removed() {
        let slot = PluginSlot::new();
        let (plugin, _probe) = ScriptedPlugin::new("Gain", 48000);
        plugin.script_faults(FaultScript::CrashOnce(11));
        slot.install(Box::new(plugin));

        for _ in 0..3 {
            let mut buffer = [0.5f32; 8];
            assert_eq!(slot.process(&mut buffer, 2), SlotOutcome::Silenced);
            assert!(buffer.iter().all(|&s| s == 0.0));
        }
        assert_eq!(slot.take_report().unwrap().fatal, Some(11));
        assert!(slot.is_faulted());

        let (_, crashed) = slot.take().unwrap();
        assert!(crashed);
        assert!(!slot.is_faulted());
    }
}
