//! CLAP Plugin Host Implementation
//!
//! Loads .clap bundles, creates plugin instances, and processes audio.

use libloading::{Library, Symbol};
use std::ffi::{CStr, CString};
use std::fs;
use std::io::{self, Cursor, Read};
use std::os::raw::c_char;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use super::clap_sys::*;
use super::crash_guard::{with_crash_guard, Crash};
use super::{
    MainThreadHandle, ParamDescriptor, PluginControl, PluginLoader, PluginModule, ProcessSettings,
};
use crate::audio::buffer::StereoSample;
use crate::audio::error::{HostError, PluginLoadError, PluginRuntimeError};

const HOST_NAME: &CStr = c"freqlab";
const HOST_VENDOR: &CStr = c"freqlab";
const HOST_URL: &CStr = c"https://freqlab.dev";
const HOST_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

/// Events delivered per process call
const EVENT_LIST_CAPACITY: usize = 256;

/// Where loaded bundles are copied so every rebuild gets a fresh file
fn temp_root() -> PathBuf {
    std::env::temp_dir().join("freqlab-plugins")
}

/// Remove temp copies left behind by earlier sessions
pub fn cleanup_temp_bundles() {
    let root = temp_root();
    let Ok(entries) = fs::read_dir(&root) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map_or(true, |e| e != "clap") {
            continue;
        }
        log::info!("Removing stale temp bundle: {:?}", path);
        if let Err(e) = remove_path(&path) {
            log::warn!("Failed to remove temp bundle {:?}: {}", path, e);
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a bundle directory or single-file plugin to a unique temp path
fn copy_to_temp(bundle_path: &Path) -> io::Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let stem = bundle_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "plugin".to_string());

    let root = temp_root();
    fs::create_dir_all(&root)?;
    let target = root.join(format!("{}_{}.clap", stem, stamp));

    if bundle_path.is_file() {
        fs::copy(bundle_path, &target)?;
        return Ok(target);
    }

    for entry in WalkDir::new(bundle_path) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(bundle_path)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination)?;
        } else {
            fs::copy(entry.path(), &destination)?;
        }
    }

    Ok(target)
}

/// Find the shared library inside a bundle.
///
/// macOS bundles keep it at `Contents/MacOS/<name>`; elsewhere the .clap file
/// is the library itself.
fn resolve_binary(bundle_path: &Path) -> Option<PathBuf> {
    if bundle_path.is_file() {
        return Some(bundle_path.to_path_buf());
    }

    let macos_dir = bundle_path.join("Contents").join("MacOS");
    if let Some(stem) = bundle_path.file_stem() {
        let candidate = macos_dir.join(stem);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    // Temp copies are renamed, so the binary no longer matches the bundle name
    fs::read_dir(&macos_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .find(|path| path.is_file() && path.extension().is_none())
}

unsafe fn c_string(ptr: *const c_char, fallback: &str) -> String {
    if ptr.is_null() {
        fallback.to_string()
    } else {
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Opens CLAP bundles from disk
#[derive(Debug, Default, Clone, Copy)]
pub struct ClapLoader;

impl PluginLoader for ClapLoader {
    fn load(
        &self,
        path: &Path,
        settings: &ProcessSettings,
    ) -> Result<Box<dyn PluginModule>, PluginLoadError> {
        PluginInstance::load(path, settings).map(|instance| Box::new(instance) as Box<dyn PluginModule>)
    }
}

/// A loaded CLAP plugin instance
pub struct PluginInstance {
    library: Option<Library>,
    entry: *const ClapPluginEntry,
    plugin: *const ClapPlugin,
    /// Must outlive the plugin, which keeps a pointer to it
    _host: Box<ClapHost>,
    control: Arc<PluginControl>,
    gui: *const ClapPluginGui,

    name: String,
    sample_rate: u32,
    max_frames: usize,
    is_active: bool,
    is_processing: bool,

    // Pre-allocated stereo buffers; the pointer arrays point into them
    input_data: [Vec<f32>; 2],
    output_data: [Vec<f32>; 2],
    input_ptrs: [*mut f32; 2],
    output_ptrs: [*mut f32; 2],
    events: HostEventList,

    /// Shared with the main-thread handle
    editor_open: Arc<AtomicBool>,
    temp_copy: Option<PathBuf>,
    released: bool,
}

// Safety: the instance is only ever reached through the plugin slot's mutex.
// Main-thread calls go through `ClapMainThread`, which CLAP allows to run
// alongside `process`.
unsafe impl Send for PluginInstance {}

impl PluginInstance {
    pub fn load(bundle_path: &Path, settings: &ProcessSettings) -> Result<Self, PluginLoadError> {
        log::info!("Loading CLAP plugin from: {:?}", bundle_path);

        if !bundle_path.exists() {
            return Err(PluginLoadError::NotFound(bundle_path.to_path_buf()));
        }

        let temp_copy = copy_to_temp(bundle_path)
            .map_err(|e| PluginLoadError::Bundle(format!("{}: {}", bundle_path.display(), e)))?;

        match Self::load_from(bundle_path, &temp_copy, settings) {
            Ok(mut instance) => {
                instance.temp_copy = Some(temp_copy);
                Ok(instance)
            }
            Err(e) => {
                let _ = remove_path(&temp_copy);
                Err(e)
            }
        }
    }

    fn load_from(
        bundle_path: &Path,
        copy_path: &Path,
        settings: &ProcessSettings,
    ) -> Result<Self, PluginLoadError> {
        let binary = resolve_binary(copy_path).ok_or_else(|| {
            PluginLoadError::Bundle(format!("no plugin binary in {}", bundle_path.display()))
        })?;
        log::info!("Resolved plugin binary: {:?}", binary);

        let library =
            unsafe { Library::new(&binary) }.map_err(|e| PluginLoadError::Library(e.to_string()))?;

        let entry: *const ClapPluginEntry = unsafe {
            let symbol: Symbol<*const ClapPluginEntry> = library
                .get(b"clap_entry\0")
                .map_err(|e| PluginLoadError::MissingEntryPoint(e.to_string()))?;
            *symbol
        };
        if entry.is_null() {
            return Err(PluginLoadError::MissingEntryPoint("clap_entry is null".to_string()));
        }
        let entry_ref = unsafe { &*entry };

        if !entry_ref.clap_version.is_compatible() {
            return Err(PluginLoadError::Incompatible(format!(
                "CLAP version {}.{}.{}",
                entry_ref.clap_version.major,
                entry_ref.clap_version.minor,
                entry_ref.clap_version.revision
            )));
        }

        let plugin_path = CString::new(bundle_path.to_string_lossy().as_bytes())
            .map_err(|e| PluginLoadError::Bundle(e.to_string()))?;
        let init = entry_ref
            .init
            .ok_or_else(|| PluginLoadError::Incompatible("entry has no init".to_string()))?;
        if !unsafe { init(plugin_path.as_ptr()) } {
            return Err(PluginLoadError::Init("clap_entry.init() returned false".to_string()));
        }

        let deinit = || {
            if let Some(deinit) = entry_ref.deinit {
                unsafe { deinit() };
            }
        };

        let control = Arc::new(PluginControl::new());
        let host = Box::new(ClapHost {
            clap_version: ClapVersion::CURRENT,
            host_data: Arc::as_ptr(&control) as *mut std::ffi::c_void,
            name: HOST_NAME.as_ptr(),
            vendor: HOST_VENDOR.as_ptr(),
            url: HOST_URL.as_ptr(),
            version: HOST_VERSION.as_ptr() as *const c_char,
            get_extension: Some(host_get_extension),
            request_restart: Some(host_request_restart),
            request_process: Some(host_request_process),
            request_callback: Some(host_request_callback),
        });

        let (plugin, name) = match unsafe { Self::create_plugin(entry_ref, &host) } {
            Ok(created) => created,
            Err(e) => {
                deinit();
                return Err(e);
            }
        };

        let gui = unsafe { Self::extension(plugin, CLAP_EXT_GUI) } as *const ClapPluginGui;
        let max_frames = settings.max_frames as usize;
        let mut input_data = [vec![0.0f32; max_frames], vec![0.0f32; max_frames]];
        let mut output_data = [vec![0.0f32; max_frames], vec![0.0f32; max_frames]];
        let input_ptrs = [input_data[0].as_mut_ptr(), input_data[1].as_mut_ptr()];
        let output_ptrs = [output_data[0].as_mut_ptr(), output_data[1].as_mut_ptr()];

        // From here on Drop tears everything down
        let mut instance = Self {
            library: Some(library),
            entry,
            plugin,
            _host: host,
            control,
            gui,
            name,
            sample_rate: settings.sample_rate,
            max_frames,
            is_active: false,
            is_processing: false,
            input_data,
            output_data,
            input_ptrs,
            output_ptrs,
            events: HostEventList::with_capacity(EVENT_LIST_CAPACITY),
            editor_open: Arc::new(AtomicBool::new(false)),
            temp_copy: None,
            released: false,
        };

        instance.activate()?;
        instance.read_parameters();

        log::info!(
            "Plugin loaded and activated: {} ({} Hz, max {} frames)",
            instance.name,
            instance.sample_rate,
            instance.max_frames
        );
        Ok(instance)
    }

    /// Create and init the first plugin in the bundle's factory
    unsafe fn create_plugin(
        entry: &ClapPluginEntry,
        host: &ClapHost,
    ) -> Result<(*const ClapPlugin, String), PluginLoadError> {
        let get_factory = entry
            .get_factory
            .ok_or_else(|| PluginLoadError::Incompatible("entry has no get_factory".to_string()))?;
        let factory =
            get_factory(CLAP_PLUGIN_FACTORY_ID.as_ptr() as *const c_char) as *const ClapPluginFactory;
        let factory_ref = factory
            .as_ref()
            .ok_or_else(|| PluginLoadError::Incompatible("no plugin factory".to_string()))?;

        let count = factory_ref.get_plugin_count.map_or(0, |f| f(factory));
        if count == 0 {
            return Err(PluginLoadError::Incompatible("no plugins in this bundle".to_string()));
        }
        log::info!("Found {} plugin(s) in bundle", count);

        let descriptor = factory_ref
            .get_plugin_descriptor
            .map_or(ptr::null(), |f| f(factory, 0));
        let descriptor = descriptor
            .as_ref()
            .ok_or_else(|| PluginLoadError::Incompatible("missing plugin descriptor".to_string()))?;

        let name = c_string(descriptor.name, "Unknown Plugin");
        log::info!(
            "Creating plugin: {} by {} (id: {}, version: {})",
            name,
            c_string(descriptor.vendor, "Unknown"),
            c_string(descriptor.id, "unknown"),
            c_string(descriptor.version, "0.0.0")
        );

        let create = factory_ref
            .create_plugin
            .ok_or_else(|| PluginLoadError::Incompatible("factory has no create_plugin".to_string()))?;
        let plugin = create(factory, host, descriptor.id);
        let plugin_ref = plugin
            .as_ref()
            .ok_or_else(|| PluginLoadError::Init("create_plugin returned null".to_string()))?;

        let initialized = plugin_ref.init.map_or(false, |init| init(plugin));
        if !initialized {
            if let Some(destroy) = plugin_ref.destroy {
                destroy(plugin);
            }
            return Err(PluginLoadError::Init("plugin init() failed".to_string()));
        }

        Ok((plugin, name))
    }

    unsafe fn extension(plugin: *const ClapPlugin, id: &[u8]) -> *const std::ffi::c_void {
        match (*plugin).get_extension {
            Some(get_extension) => get_extension(plugin, id.as_ptr() as *const c_char),
            None => ptr::null(),
        }
    }

    fn activate(&mut self) -> Result<(), PluginLoadError> {
        let plugin_ref = unsafe { &*self.plugin };
        let activate = plugin_ref
            .activate
            .ok_or_else(|| PluginLoadError::Incompatible("plugin has no activate".to_string()))?;

        let activated =
            unsafe { activate(self.plugin, self.sample_rate as f64, 1, self.max_frames as u32) };
        if !activated {
            return Err(PluginLoadError::Init("plugin activate() failed".to_string()));
        }
        self.is_active = true;
        Ok(())
    }

    /// Gather parameter ranges and current values for the host's cache
    fn read_parameters(&mut self) {
        let params = unsafe { Self::extension(self.plugin, CLAP_EXT_PARAMS) } as *const ClapPluginParams;
        let Some(params) = (unsafe { params.as_ref() }) else {
            self.control.set_params(Vec::new());
            return;
        };

        let count = params.count.map_or(0, |f| unsafe { f(self.plugin) });
        let mut descriptors = Vec::with_capacity(count as usize);
        for index in 0..count {
            let mut info: ClapParamInfo = unsafe { std::mem::zeroed() };
            let ok = params
                .get_info
                .map_or(false, |f| unsafe { f(self.plugin, index, &mut info) });
            if !ok {
                continue;
            }

            let mut current = info.default_value;
            if let Some(get_value) = params.get_value {
                unsafe { get_value(self.plugin, info.id, &mut current) };
            }

            descriptors.push(ParamDescriptor {
                id: info.id,
                name: fixed_c_str(&info.name),
                min: info.min_value,
                max: info.max_value,
                default: info.default_value,
                current,
            });
        }

        log::info!("Plugin exposes {} parameter(s)", descriptors.len());
        self.control.set_params(descriptors);
    }

    fn start_processing(&mut self) -> bool {
        if self.is_processing {
            return true;
        }
        let plugin_ref = unsafe { &*self.plugin };
        let started = plugin_ref
            .start_processing
            .map_or(true, |start| unsafe { start(self.plugin) });
        self.is_processing = started;
        started
    }

    fn stop_processing(&mut self) {
        if !self.is_processing {
            return;
        }
        let plugin_ref = unsafe { &*self.plugin };
        if let Some(stop) = plugin_ref.stop_processing {
            unsafe { stop(self.plugin) };
        }
        self.is_processing = false;
    }

    /// Run one block of at most `max_frames` through the plugin
    fn process_block(
        &mut self,
        block: &mut [f32],
        channels: usize,
    ) -> Result<(), PluginRuntimeError> {
        let frames = block.len() / channels;

        for (i, frame) in block.chunks_exact(channels).enumerate() {
            let sample = StereoSample::read_frame(frame);
            self.input_data[0][i] = sample.left;
            self.input_data[1][i] = sample.right;
        }
        for channel in &mut self.output_data {
            channel[..frames].fill(0.0);
        }

        let input_buffer = ClapAudioBuffer {
            data32: self.input_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: 2,
            latency: 0,
            constant_mask: 0,
        };
        let mut output_buffer = ClapAudioBuffer {
            data32: self.output_ptrs.as_mut_ptr(),
            data64: ptr::null_mut(),
            channel_count: 2,
            latency: 0,
            constant_mask: 0,
        };
        let in_events = self.events.as_input_events();
        let out_events = output_events(&self.control);

        let process = ClapProcess {
            steady_time: -1,
            frames_count: frames as u32,
            transport: ptr::null(),
            audio_inputs: &input_buffer,
            audio_outputs: &mut output_buffer,
            audio_inputs_count: 1,
            audio_outputs_count: 1,
            in_events: &in_events,
            out_events: &out_events,
        };

        let plugin = self.plugin;
        let process_fn = unsafe { (*plugin).process }.ok_or(PluginRuntimeError::ProcessFailed)?;
        let status = with_crash_guard(|| unsafe { process_fn(plugin, &process) })
            .map_err(|Crash(signal)| PluginRuntimeError::Crashed { signal })?;
        if status == CLAP_PROCESS_ERROR {
            return Err(PluginRuntimeError::ProcessFailed);
        }

        for (i, frame) in block.chunks_exact_mut(channels).enumerate() {
            StereoSample::new(self.output_data[0][i], self.output_data[1][i]).write_frame(frame);
        }
        Ok(())
    }

    /// Apply queued events without processing audio
    fn flush_params(&mut self) {
        let params = unsafe { Self::extension(self.plugin, CLAP_EXT_PARAMS) } as *const ClapPluginParams;
        let Some(flush) = (unsafe { params.as_ref() }).and_then(|p| p.flush) else {
            return;
        };

        self.events.clear();
        let events = &mut self.events;
        self.control.events.drain(|event| events.push(event));

        let in_events = self.events.as_input_events();
        let out_events = output_events(&self.control);
        unsafe { flush(self.plugin, &in_events, &out_events) };
        self.events.clear();
    }

    fn gui(&self) -> Option<&ClapPluginGui> {
        unsafe { self.gui.as_ref() }
    }

    fn state_extension(&self) -> Result<&ClapPluginState, HostError> {
        let state = unsafe { Self::extension(self.plugin, CLAP_EXT_STATE) } as *const ClapPluginState;
        unsafe { state.as_ref() }
            .ok_or_else(|| HostError::State("plugin does not support the state extension".to_string()))
    }

    fn teardown(&mut self) -> Result<(), String> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        log::info!("Unloading plugin: {}", self.name);

        if self.editor_open.swap(false, Ordering::AcqRel) {
            if let Some(gui) = self.gui() {
                unsafe { destroy_gui(self.plugin, gui) };
            }
        }
        self.stop_processing();

        unsafe {
            let plugin_ref = &*self.plugin;
            if self.is_active {
                if let Some(deactivate) = plugin_ref.deactivate {
                    deactivate(self.plugin);
                }
                self.is_active = false;
            }
            if let Some(destroy) = plugin_ref.destroy {
                destroy(self.plugin);
            }
            if let Some(deinit) = (*self.entry).deinit {
                deinit();
            }
        }

        // Unmap before deleting the file
        drop(self.library.take());

        match self.temp_copy.take() {
            Some(path) => remove_path(&path)
                .map_err(|e| format!("failed to remove temp bundle {:?}: {}", path, e)),
            None => Ok(()),
        }
    }
}

impl PluginModule for PluginInstance {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn process(&mut self, buffer: &mut [f32], channels: usize) -> Result<(), PluginRuntimeError> {
        let channels = channels.max(1);
        if !self.start_processing() {
            return Err(PluginRuntimeError::ProcessFailed);
        }
        self.control.mark_processed();
        self.control.take_flush_request();

        self.events.clear();
        let events = &mut self.events;
        self.control.events.drain(|event| events.push(event));

        let block_len = self.max_frames * channels;
        for block in buffer.chunks_mut(block_len) {
            self.process_block(block, channels)?;
            // Events go with the first block only
            self.events.clear();
        }
        Ok(())
    }

    fn has_editor(&self) -> bool {
        self.gui().is_some()
    }

    fn main_thread(&self) -> Box<dyn MainThreadHandle> {
        Box::new(ClapMainThread {
            plugin: self.plugin,
            gui: self.gui,
            name: self.name.clone(),
            editor_open: self.editor_open.clone(),
        })
    }

    fn flush_events(&mut self) {
        if self.control.take_flush_request() || !self.control.events.is_empty() {
            self.flush_params();
        }
    }

    fn save_state(&mut self) -> Result<Vec<u8>, HostError> {
        let save = self
            .state_extension()?
            .save
            .ok_or_else(|| HostError::State("state extension has no save".to_string()))?;

        unsafe extern "C" fn write(
            stream: *const ClapOutputStream,
            data: *const std::ffi::c_void,
            size: u64,
        ) -> i64 {
            let Some(buffer) = ((*stream).ctx as *mut Vec<u8>).as_mut() else {
                return -1;
            };
            if data.is_null() {
                return -1;
            }
            buffer.extend_from_slice(std::slice::from_raw_parts(data as *const u8, size as usize));
            size as i64
        }

        let mut buffer: Vec<u8> = Vec::new();
        let stream = ClapOutputStream {
            ctx: &mut buffer as *mut Vec<u8> as *mut std::ffi::c_void,
            write: Some(write),
        };

        if unsafe { save(self.plugin, &stream) } {
            log::info!("Saved plugin state: {} bytes", buffer.len());
            Ok(buffer)
        } else {
            Err(HostError::State("plugin state save failed".to_string()))
        }
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), HostError> {
        let load = self
            .state_extension()?
            .load
            .ok_or_else(|| HostError::State("state extension has no load".to_string()))?;

        unsafe extern "C" fn read(
            stream: *const ClapInputStream,
            buffer: *mut std::ffi::c_void,
            size: u64,
        ) -> i64 {
            let Some(cursor) = ((*stream).ctx as *mut Cursor<&[u8]>).as_mut() else {
                return -1;
            };
            if buffer.is_null() {
                return -1;
            }
            let out = std::slice::from_raw_parts_mut(buffer as *mut u8, size as usize);
            cursor.read(out).map_or(-1, |n| n as i64)
        }

        let mut cursor = Cursor::new(data);
        let stream = ClapInputStream {
            ctx: &mut cursor as *mut Cursor<&[u8]> as *mut std::ffi::c_void,
            read: Some(read),
        };

        if unsafe { load(self.plugin, &stream) } {
            self.read_back_parameters();
            Ok(())
        } else {
            Err(HostError::State("plugin rejected the saved state".to_string()))
        }
    }

    fn control(&self) -> Arc<PluginControl> {
        self.control.clone()
    }

    fn release(mut self: Box<Self>) -> Result<(), String> {
        self.teardown()
    }
}

impl PluginInstance {
    /// Refresh cached values after a state load changed them wholesale
    fn read_back_parameters(&self) {
        let params = unsafe { Self::extension(self.plugin, CLAP_EXT_PARAMS) } as *const ClapPluginParams;
        let (Some(params), Some(cache)) = (unsafe { params.as_ref() }, self.control.params()) else {
            return;
        };
        let Some(get_value) = params.get_value else {
            return;
        };
        for info in cache.infos() {
            let mut value = 0.0;
            if unsafe { get_value(self.plugin, info.id, &mut value) } {
                cache.set_plain(info.id, value);
            }
        }
    }
}

unsafe fn destroy_gui(plugin: *const ClapPlugin, gui: &ClapPluginGui) {
    if let Some(hide) = gui.hide {
        hide(plugin);
    }
    if let Some(destroy) = gui.destroy {
        destroy(plugin);
    }
}

/// Editor and `on_main_thread` entry points of a [`PluginInstance`]
struct ClapMainThread {
    plugin: *const ClapPlugin,
    gui: *const ClapPluginGui,
    name: String,
    editor_open: Arc<AtomicBool>,
}

// Safety: every call here is a CLAP main-thread function, and the host drops
// the handle before the instance is destroyed.
unsafe impl Send for ClapMainThread {}

impl MainThreadHandle for ClapMainThread {
    fn open_editor(&mut self) -> Result<(), HostError> {
        if self.editor_open.load(Ordering::Acquire) {
            return Ok(());
        }
        let gui = unsafe { self.gui.as_ref() }.ok_or(HostError::NoEditor)?;
        let plugin = self.plugin;
        let api = CLAP_WINDOW_API.as_ptr() as *const c_char;

        unsafe {
            let floating = gui.is_api_supported.map_or(false, |f| f(plugin, api, true));
            if !floating {
                return Err(HostError::Editor("plugin has no floating editor".to_string()));
            }
            let created = gui.create.map_or(false, |f| f(plugin, api, true));
            if !created {
                return Err(HostError::Editor("gui.create() failed".to_string()));
            }
            if let (Some(suggest_title), Ok(title)) = (gui.suggest_title, CString::new(self.name.as_str())) {
                suggest_title(plugin, title.as_ptr());
            }
            let shown = gui.show.map_or(false, |f| f(plugin));
            if !shown {
                if let Some(destroy) = gui.destroy {
                    destroy(plugin);
                }
                return Err(HostError::Editor("gui.show() failed".to_string()));
            }
        }

        log::info!("Editor opened for {}", self.name);
        self.editor_open.store(true, Ordering::Release);
        Ok(())
    }

    fn close_editor(&mut self) {
        if !self.editor_open.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(gui) = unsafe { self.gui.as_ref() } {
            unsafe { destroy_gui(self.plugin, gui) };
        }
        log::info!("Editor closed for {}", self.name);
    }

    fn on_main_thread(&mut self) {
        let plugin_ref = unsafe { &*self.plugin };
        if let Some(on_main_thread) = plugin_ref.on_main_thread {
            unsafe { on_main_thread(self.plugin) };
        }
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            log::warn!("{}", e);
        }
    }
}

// =============================================================================
// Host Callbacks
// =============================================================================

static HOST_PARAMS: ClapHostParams = ClapHostParams {
    rescan: Some(host_params_rescan),
    clear: Some(host_params_clear),
    request_flush: Some(host_params_request_flush),
};

static HOST_GUI: ClapHostGui = ClapHostGui {
    resize_hints_changed: Some(host_gui_resize_hints_changed),
    request_resize: Some(host_gui_request_resize),
    request_show: Some(host_gui_request_show),
    request_hide: Some(host_gui_request_hide),
    closed: Some(host_gui_closed),
};

unsafe extern "C" fn host_get_extension(
    _host: *const ClapHost,
    extension_id: *const c_char,
) -> *const std::ffi::c_void {
    if extension_id.is_null() {
        return ptr::null();
    }

    match CStr::from_ptr(extension_id).to_bytes_with_nul() {
        id if id == CLAP_EXT_PARAMS => &HOST_PARAMS as *const ClapHostParams as *const _,
        id if id == CLAP_EXT_GUI => &HOST_GUI as *const ClapHostGui as *const _,
        _ => ptr::null(),
    }
}

unsafe extern "C" fn host_request_restart(_host: *const ClapHost) {
    log::debug!("Plugin requested restart");
}

unsafe extern "C" fn host_request_process(_host: *const ClapHost) {
    // Audio runs continuously while the engine is up
}

unsafe extern "C" fn host_request_callback(host: *const ClapHost) {
    if let Some(control) = ClapHost::control(host) {
        control.request_callback();
    }
}

unsafe extern "C" fn host_params_rescan(_host: *const ClapHost, flags: u32) {
    log::debug!("Plugin requested param rescan (flags {:#x})", flags);
}

unsafe extern "C" fn host_params_clear(_host: *const ClapHost, param_id: u32, _flags: u32) {
    log::debug!("Plugin requested param clear for {}", param_id);
}

unsafe extern "C" fn host_params_request_flush(host: *const ClapHost) {
    if let Some(control) = ClapHost::control(host) {
        control.request_flush();
    }
}

unsafe extern "C" fn host_gui_resize_hints_changed(_host: *const ClapHost) {}

unsafe extern "C" fn host_gui_request_resize(_host: *const ClapHost, _width: u32, _height: u32) -> bool {
    // Floating windows resize themselves
    true
}

unsafe extern "C" fn host_gui_request_show(_host: *const ClapHost) -> bool {
    false
}

unsafe extern "C" fn host_gui_request_hide(_host: *const ClapHost) -> bool {
    false
}

unsafe extern "C" fn host_gui_closed(host: *const ClapHost, was_destroyed: bool) {
    log::debug!("Plugin editor window closed (destroyed: {})", was_destroyed);
    if let Some(control) = ClapHost::control(host) {
        control.notify_editor_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bundle_is_not_found() {
        let result = PluginInstance::load(
            Path::new("/nonexistent/Missing.clap"),
            &ProcessSettings::default(),
        );
        assert!(matches!(result, Err(PluginLoadError::NotFound(_))));
    }

    #[test]
    fn test_non_library_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Broken.clap");
        fs::write(&path, b"not a shared library").unwrap();

        let result = ClapLoader.load(&path, &ProcessSettings::default());
        assert!(matches!(result, Err(PluginLoadError::Library(_))));
    }

    #[test]
    fn test_copy_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Gain.clap");
        let macos = bundle.join("Contents").join("MacOS");
        fs::create_dir_all(&macos).unwrap();
        fs::write(macos.join("Gain"), b"binary").unwrap();
        fs::write(bundle.join("Contents").join("Info.plist"), b"plist").unwrap();

        let copy = copy_to_temp(&bundle).unwrap();
        assert!(copy.starts_with(temp_root()));
        assert!(copy.file_name().unwrap().to_string_lossy().starts_with("Gain_"));
        assert_eq!(fs::read(copy.join("Contents/MacOS/Gain")).unwrap(), b"binary");

        // Renamed copy still resolves to the binary
        assert_eq!(resolve_binary(&copy), Some(copy.join("Contents/MacOS/Gain")));

        remove_path(&copy).unwrap();
        assert!(!copy.exists());
    }

    #[test]
    fn test_resolve_single_file_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Gain.clap");
        fs::write(&path, b"elf").unwrap();
        assert_eq!(resolve_binary(&path), Some(path.clone()));
        assert_eq!(resolve_binary(&dir.path().join("Empty.clap")), None);
    }
}
