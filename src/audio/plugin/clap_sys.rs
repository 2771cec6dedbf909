//! CLAP (CLever Audio Plugin) FFI structures
//!
//! Only the parts of the C API this host uses. Layouts follow clap 1.2.
//! Reference: https://github.com/free-audio/clap

use std::ffi::c_void;
use std::os::raw::c_char;

use super::{HostEvent, PluginControl};

// =============================================================================
// Version
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ClapVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl ClapVersion {
    pub const CURRENT: Self = Self {
        major: 1,
        minor: 2,
        revision: 0,
    };

    /// Plugins built against any 1.x release are compatible
    pub fn is_compatible(&self) -> bool {
        self.major >= 1
    }
}

// =============================================================================
// Entry, factory, descriptor
// =============================================================================

pub const CLAP_PLUGIN_FACTORY_ID: &[u8] = b"clap.plugin-factory\0";

#[repr(C)]
pub struct ClapPluginEntry {
    pub clap_version: ClapVersion,
    pub init: Option<unsafe extern "C" fn(plugin_path: *const c_char) -> bool>,
    pub deinit: Option<unsafe extern "C" fn()>,
    pub get_factory: Option<unsafe extern "C" fn(factory_id: *const c_char) -> *const c_void>,
}

#[repr(C)]
pub struct ClapPluginFactory {
    pub get_plugin_count: Option<unsafe extern "C" fn(factory: *const ClapPluginFactory) -> u32>,
    pub get_plugin_descriptor: Option<
        unsafe extern "C" fn(
            factory: *const ClapPluginFactory,
            index: u32,
        ) -> *const ClapPluginDescriptor,
    >,
    pub create_plugin: Option<
        unsafe extern "C" fn(
            factory: *const ClapPluginFactory,
            host: *const ClapHost,
            plugin_id: *const c_char,
        ) -> *const ClapPlugin,
    >,
}

#[repr(C)]
pub struct ClapPluginDescriptor {
    pub clap_version: ClapVersion,
    pub id: *const c_char,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub manual_url: *const c_char,
    pub support_url: *const c_char,
    pub version: *const c_char,
    pub description: *const c_char,
    pub features: *const *const c_char,
}

// =============================================================================
// Host and plugin
// =============================================================================

/// `host_data` points at the plugin's [`PluginControl`]
#[repr(C)]
pub struct ClapHost {
    pub clap_version: ClapVersion,
    pub host_data: *mut c_void,
    pub name: *const c_char,
    pub vendor: *const c_char,
    pub url: *const c_char,
    pub version: *const c_char,
    pub get_extension: Option<
        unsafe extern "C" fn(host: *const ClapHost, extension_id: *const c_char) -> *const c_void,
    >,
    pub request_restart: Option<unsafe extern "C" fn(host: *const ClapHost)>,
    pub request_process: Option<unsafe extern "C" fn(host: *const ClapHost)>,
    pub request_callback: Option<unsafe extern "C" fn(host: *const ClapHost)>,
}

impl ClapHost {
    /// Recover the control block from a host pointer handed back by the plugin
    ///
    /// # Safety
    /// `host` must be null or a host created by this crate whose control block
    /// is still alive.
    pub unsafe fn control<'a>(host: *const ClapHost) -> Option<&'a PluginControl> {
        if host.is_null() {
            return None;
        }
        ((*host).host_data as *const PluginControl).as_ref()
    }
}

#[repr(C)]
pub struct ClapPlugin {
    pub desc: *const ClapPluginDescriptor,
    pub plugin_data: *mut c_void,
    pub init: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> bool>,
    pub destroy: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
    pub activate: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            sample_rate: f64,
            min_frames_count: u32,
            max_frames_count: u32,
        ) -> bool,
    >,
    pub deactivate: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
    pub start_processing: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> bool>,
    pub stop_processing: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
    pub reset: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
    pub process:
        Option<unsafe extern "C" fn(plugin: *const ClapPlugin, process: *const ClapProcess) -> i32>,
    pub get_extension: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, id: *const c_char) -> *const c_void,
    >,
    pub on_main_thread: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
}

// =============================================================================
// Audio processing
// =============================================================================

pub const CLAP_PROCESS_ERROR: i32 = 0;

#[repr(C)]
pub struct ClapProcess {
    pub steady_time: i64,
    pub frames_count: u32,
    /// No transport is provided
    pub transport: *const c_void,
    pub audio_inputs: *const ClapAudioBuffer,
    pub audio_outputs: *mut ClapAudioBuffer,
    pub audio_inputs_count: u32,
    pub audio_outputs_count: u32,
    pub in_events: *const ClapInputEvents,
    pub out_events: *const ClapOutputEvents,
}

#[repr(C)]
pub struct ClapAudioBuffer {
    pub data32: *mut *mut f32,
    pub data64: *mut *mut f64,
    pub channel_count: u32,
    pub latency: u32,
    pub constant_mask: u64,
}

// =============================================================================
// Events
// =============================================================================

pub const CLAP_CORE_EVENT_SPACE_ID: u16 = 0;

pub const CLAP_EVENT_NOTE_ON: u16 = 0;
pub const CLAP_EVENT_NOTE_OFF: u16 = 1;
pub const CLAP_EVENT_PARAM_VALUE: u16 = 5;
pub const CLAP_EVENT_PARAM_GESTURE_BEGIN: u16 = 7;
pub const CLAP_EVENT_PARAM_GESTURE_END: u16 = 8;

#[repr(C)]
pub struct ClapInputEvents {
    pub ctx: *mut c_void,
    pub size: Option<unsafe extern "C" fn(list: *const ClapInputEvents) -> u32>,
    pub get: Option<
        unsafe extern "C" fn(list: *const ClapInputEvents, index: u32) -> *const ClapEventHeader,
    >,
}

#[repr(C)]
pub struct ClapOutputEvents {
    pub ctx: *mut c_void,
    pub try_push: Option<
        unsafe extern "C" fn(list: *const ClapOutputEvents, event: *const ClapEventHeader) -> bool,
    >,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ClapEventHeader {
    pub size: u32,
    pub time: u32,
    pub space_id: u16,
    pub type_: u16,
    pub flags: u32,
}

impl ClapEventHeader {
    fn new<T>(type_: u16) -> Self {
        Self {
            size: std::mem::size_of::<T>() as u32,
            time: 0,
            space_id: CLAP_CORE_EVENT_SPACE_ID,
            type_,
            flags: 0,
        }
    }
}

#[repr(C)]
pub struct ClapEventNote {
    pub header: ClapEventHeader,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    /// -1 matches every key
    pub key: i16,
    pub velocity: f64,
}

#[repr(C)]
pub struct ClapEventParamValue {
    pub header: ClapEventHeader,
    pub param_id: u32,
    pub cookie: *mut c_void,
    pub note_id: i32,
    pub port_index: i16,
    pub channel: i16,
    pub key: i16,
    pub value: f64,
}

#[repr(C)]
pub struct ClapEventParamGesture {
    pub header: ClapEventHeader,
    pub param_id: u32,
}

#[derive(Clone, Copy)]
enum EventRef {
    Note(usize),
    Param(usize),
    Gesture(usize),
}

/// Pre-allocated input event list for one process or flush call.
///
/// Events past the capacity are dropped so the audio thread never allocates.
pub struct HostEventList {
    notes: Vec<ClapEventNote>,
    params: Vec<ClapEventParamValue>,
    gestures: Vec<ClapEventParamGesture>,
    order: Vec<EventRef>,
    capacity: usize,
}

// The raw cookie pointer in param events is always null
unsafe impl Send for HostEventList {}

impl HostEventList {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            notes: Vec::with_capacity(capacity),
            params: Vec::with_capacity(capacity),
            gestures: Vec::with_capacity(capacity),
            order: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn clear(&mut self) {
        self.notes.clear();
        self.params.clear();
        self.gestures.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn push(&mut self, event: HostEvent) {
        if self.order.len() >= self.capacity {
            return;
        }

        let note = |type_: u16, key: i16, channel: i16, velocity: f64| ClapEventNote {
            header: ClapEventHeader::new::<ClapEventNote>(type_),
            note_id: -1,
            port_index: 0,
            channel,
            key,
            velocity,
        };

        match event {
            HostEvent::NoteOn { note: key, velocity } => {
                self.order.push(EventRef::Note(self.notes.len()));
                self.notes.push(note(
                    CLAP_EVENT_NOTE_ON,
                    (key & 0x7F) as i16,
                    0,
                    (velocity & 0x7F) as f64 / 127.0,
                ));
            }
            HostEvent::NoteOff { note: key } => {
                self.order.push(EventRef::Note(self.notes.len()));
                self.notes
                    .push(note(CLAP_EVENT_NOTE_OFF, (key & 0x7F) as i16, 0, 0.0));
            }
            HostEvent::AllNotesOff => {
                self.order.push(EventRef::Note(self.notes.len()));
                self.notes.push(note(CLAP_EVENT_NOTE_OFF, -1, -1, 0.0));
            }
            HostEvent::ParamValue { id, value } => {
                self.order.push(EventRef::Param(self.params.len()));
                self.params.push(ClapEventParamValue {
                    header: ClapEventHeader::new::<ClapEventParamValue>(CLAP_EVENT_PARAM_VALUE),
                    param_id: id,
                    cookie: std::ptr::null_mut(),
                    note_id: -1,
                    port_index: -1,
                    channel: -1,
                    key: -1,
                    value,
                });
            }
            HostEvent::GestureBegin { id } | HostEvent::GestureEnd { id } => {
                let type_ = if matches!(event, HostEvent::GestureBegin { .. }) {
                    CLAP_EVENT_PARAM_GESTURE_BEGIN
                } else {
                    CLAP_EVENT_PARAM_GESTURE_END
                };
                self.order.push(EventRef::Gesture(self.gestures.len()));
                self.gestures.push(ClapEventParamGesture {
                    header: ClapEventHeader::new::<ClapEventParamGesture>(type_),
                    param_id: id,
                });
            }
        }
    }

    fn header(&self, index: usize) -> *const ClapEventHeader {
        match self.order.get(index) {
            Some(EventRef::Note(i)) => &self.notes[*i].header,
            Some(EventRef::Param(i)) => &self.params[*i].header,
            Some(EventRef::Gesture(i)) => &self.gestures[*i].header,
            None => std::ptr::null(),
        }
    }

    /// Borrow as a CLAP input event list. The list must outlive the call it is passed to.
    pub fn as_input_events(&self) -> ClapInputEvents {
        ClapInputEvents {
            ctx: self as *const Self as *mut c_void,
            size: Some(host_event_list_size),
            get: Some(host_event_list_get),
        }
    }
}

unsafe extern "C" fn host_event_list_size(list: *const ClapInputEvents) -> u32 {
    let events = (*list).ctx as *const HostEventList;
    events.as_ref().map_or(0, |e| e.len() as u32)
}

unsafe extern "C" fn host_event_list_get(
    list: *const ClapInputEvents,
    index: u32,
) -> *const ClapEventHeader {
    let events = (*list).ctx as *const HostEventList;
    events
        .as_ref()
        .map_or(std::ptr::null(), |e| e.header(index as usize))
}

/// Output events from the plugin. Parameter changes it reports (e.g. from its
/// own GUI) update the host's value cache; everything else is accepted and dropped.
pub fn output_events(control: &PluginControl) -> ClapOutputEvents {
    ClapOutputEvents {
        ctx: control as *const PluginControl as *mut c_void,
        try_push: Some(output_events_try_push),
    }
}

unsafe extern "C" fn output_events_try_push(
    list: *const ClapOutputEvents,
    event: *const ClapEventHeader,
) -> bool {
    if list.is_null() || event.is_null() {
        return false;
    }
    let header = &*event;
    if header.space_id == CLAP_CORE_EVENT_SPACE_ID && header.type_ == CLAP_EVENT_PARAM_VALUE {
        let control = ((*list).ctx as *const PluginControl).as_ref();
        if let Some(params) = control.and_then(|c| c.params()) {
            let change = &*(event as *const ClapEventParamValue);
            params.set_plain(change.param_id, change.value);
        }
    }
    true
}

// =============================================================================
// GUI extension
// =============================================================================

pub const CLAP_EXT_GUI: &[u8] = b"clap.gui\0";

#[cfg(target_os = "macos")]
pub const CLAP_WINDOW_API: &[u8] = b"cocoa\0";

#[cfg(target_os = "windows")]
pub const CLAP_WINDOW_API: &[u8] = b"win32\0";

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
pub const CLAP_WINDOW_API: &[u8] = b"x11\0";

/// Window and resize-hint arguments are never passed for floating editors,
/// so they stay opaque
#[repr(C)]
pub struct ClapPluginGui {
    pub is_api_supported: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, api: *const c_char, is_floating: bool) -> bool,
    >,
    pub get_preferred_api: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            api: *mut *const c_char,
            is_floating: *mut bool,
        ) -> bool,
    >,
    pub create: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, api: *const c_char, is_floating: bool) -> bool,
    >,
    pub destroy: Option<unsafe extern "C" fn(plugin: *const ClapPlugin)>,
    pub set_scale: Option<unsafe extern "C" fn(plugin: *const ClapPlugin, scale: f64) -> bool>,
    pub get_size: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, width: *mut u32, height: *mut u32) -> bool,
    >,
    pub can_resize: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> bool>,
    pub get_resize_hints:
        Option<unsafe extern "C" fn(plugin: *const ClapPlugin, hints: *mut c_void) -> bool>,
    pub adjust_size: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, width: *mut u32, height: *mut u32) -> bool,
    >,
    pub set_size:
        Option<unsafe extern "C" fn(plugin: *const ClapPlugin, width: u32, height: u32) -> bool>,
    pub set_parent:
        Option<unsafe extern "C" fn(plugin: *const ClapPlugin, window: *const c_void) -> bool>,
    pub set_transient:
        Option<unsafe extern "C" fn(plugin: *const ClapPlugin, window: *const c_void) -> bool>,
    pub suggest_title: Option<unsafe extern "C" fn(plugin: *const ClapPlugin, title: *const c_char)>,
    pub show: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> bool>,
    pub hide: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> bool>,
}

/// Host side of the GUI extension
#[repr(C)]
pub struct ClapHostGui {
    pub resize_hints_changed: Option<unsafe extern "C" fn(host: *const ClapHost)>,
    pub request_resize:
        Option<unsafe extern "C" fn(host: *const ClapHost, width: u32, height: u32) -> bool>,
    pub request_show: Option<unsafe extern "C" fn(host: *const ClapHost) -> bool>,
    pub request_hide: Option<unsafe extern "C" fn(host: *const ClapHost) -> bool>,
    pub closed: Option<unsafe extern "C" fn(host: *const ClapHost, was_destroyed: bool)>,
}

// =============================================================================
// State extension
// =============================================================================

pub const CLAP_EXT_STATE: &[u8] = b"clap.state\0";

#[repr(C)]
pub struct ClapInputStream {
    pub ctx: *mut c_void,
    /// Returns bytes read, 0 at end of stream, -1 on error
    pub read: Option<
        unsafe extern "C" fn(stream: *const ClapInputStream, buffer: *mut c_void, size: u64) -> i64,
    >,
}

#[repr(C)]
pub struct ClapOutputStream {
    pub ctx: *mut c_void,
    /// Returns bytes written, -1 on error
    pub write: Option<
        unsafe extern "C" fn(stream: *const ClapOutputStream, buffer: *const c_void, size: u64) -> i64,
    >,
}

#[repr(C)]
pub struct ClapPluginState {
    pub save: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, stream: *const ClapOutputStream) -> bool,
    >,
    pub load: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, stream: *const ClapInputStream) -> bool,
    >,
}

// =============================================================================
// Params extension
// =============================================================================

pub const CLAP_EXT_PARAMS: &[u8] = b"clap.params\0";

#[repr(C)]
pub struct ClapHostParams {
    pub rescan: Option<unsafe extern "C" fn(host: *const ClapHost, flags: u32)>,
    pub clear: Option<unsafe extern "C" fn(host: *const ClapHost, param_id: u32, flags: u32)>,
    pub request_flush: Option<unsafe extern "C" fn(host: *const ClapHost)>,
}

#[repr(C)]
pub struct ClapPluginParams {
    pub count: Option<unsafe extern "C" fn(plugin: *const ClapPlugin) -> u32>,
    pub get_info: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            param_index: u32,
            param_info: *mut ClapParamInfo,
        ) -> bool,
    >,
    pub get_value: Option<
        unsafe extern "C" fn(plugin: *const ClapPlugin, param_id: u32, out_value: *mut f64) -> bool,
    >,
    pub value_to_text: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            param_id: u32,
            value: f64,
            out_buffer: *mut c_char,
            out_buffer_capacity: u32,
        ) -> bool,
    >,
    pub text_to_value: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            param_id: u32,
            param_value_text: *const c_char,
            out_value: *mut f64,
        ) -> bool,
    >,
    pub flush: Option<
        unsafe extern "C" fn(
            plugin: *const ClapPlugin,
            in_events: *const ClapInputEvents,
            out_events: *const ClapOutputEvents,
        ),
    >,
}

#[repr(C)]
pub struct ClapParamInfo {
    pub id: u32,
    pub flags: u32,
    pub cookie: *mut c_void,
    pub name: [c_char; 256],
    pub module: [c_char; 1024],
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
}

/// Read a NUL-terminated C string from a fixed buffer
pub fn fixed_c_str(buffer: &[c_char]) -> String {
    let bytes: Vec<u8> = buffer
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
