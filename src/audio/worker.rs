//! Low-priority thread that does the audio callback's paperwork
//!
//! Runs the metering pipeline, frees retired inputs, forwards faults latched
//! by the callback and, when configured, drives the plugin idle tick.

use parking_lot::Mutex;
use ringbuf::traits::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::events::{EventSender, PreviewEvent};
use super::input::ActiveInput;
use super::metering::MeteringPipeline;
use super::plugin::{PluginHost, PluginSlot};

/// First error reported by the stream's error callback
#[derive(Default)]
pub struct StreamFault {
    message: Mutex<Option<String>>,
    raised: AtomicBool,
}

impl StreamFault {
    pub fn report(&self, message: String) {
        if !self.raised.swap(true, Ordering::AcqRel) {
            *self.message.lock() = Some(message);
        }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    fn take(&self) -> Option<String> {
        self.message.lock().take()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub metering_hz: u32,
    pub metering_event_hz: u32,
    pub drives_idle: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            metering_hz: 60,
            metering_event_hz: 30,
            drives_idle: false,
        }
    }
}

fn interval(hz: u32) -> Duration {
    Duration::from_micros(1_000_000 / hz.max(1) as u64)
}

/// Everything the worker needs from one engine run
pub struct WorkerContext {
    pub pipeline: MeteringPipeline,
    pub garbage: ringbuf::HeapCons<ActiveInput>,
    pub slot: Arc<PluginSlot>,
    pub host: Arc<PluginHost>,
    pub events: EventSender,
    pub fault: Arc<StreamFault>,
    /// Tells the stream-owner thread to drop the stream
    pub stream_stop: Sender<()>,
    pub settings: WorkerSettings,
}

pub struct IdleWorker {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl IdleWorker {
    pub fn spawn(context: WorkerContext) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("preview-worker".to_string())
            .spawn(move || run(context, stop_rx))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop and join. Safe to call more than once.
    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Preview worker panicked");
            }
        }
    }
}

impl Drop for IdleWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut context: WorkerContext, stop_rx: mpsc::Receiver<()>) {
    let tick = interval(context.settings.metering_hz);
    let event_every = interval(context.settings.metering_event_hz);
    let mut next_event = Instant::now();
    let mut stream_lost = false;

    log::info!(
        "Preview worker started ({} Hz metering, idle tick {})",
        context.settings.metering_hz,
        if context.settings.drives_idle { "on" } else { "off" }
    );

    loop {
        match stop_rx.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let snapshot = context.pipeline.tick();
        let now = Instant::now();
        if now >= next_event {
            context
                .events
                .emit(PreviewEvent::MeteringUpdate((*snapshot).clone()));
            next_event = now + event_every;
        }

        while let Some(retired) = context.garbage.try_pop() {
            drop(retired);
        }

        if let Some(report) = context.slot.take_report() {
            context.host.report_fault(report);
        }

        if !stream_lost && context.fault.is_raised() {
            stream_lost = true;
            let message = context
                .fault
                .take()
                .unwrap_or_else(|| "unknown stream error".to_string());
            log::error!("Audio device error, stopping engine: {}", message);
            context
                .events
                .engine_error(format!("Audio device error: {}. Restart the engine to continue.", message));
            let _ = context.stream_stop.send(());
        }

        if context.settings.drives_idle {
            context.host.idle_tick();
        }
    }

    log::info!("Preview worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{create_command_buffer, create_tap};
    use crate::audio::metering::{ClipIndicators, MeteringHub};
    use crate::audio::plugin::testing::ScriptedLoader;
    use crate::audio::plugin::PluginState;
    use std::path::Path;

    struct Rig {
        worker: IdleWorker,
        events: mpsc::Receiver<PreviewEvent>,
        stream_stop: mpsc::Receiver<()>,
        fault: Arc<StreamFault>,
        host: Arc<PluginHost>,
        slot: Arc<PluginSlot>,
        garbage: ringbuf::HeapProd<ActiveInput>,
        hub: Arc<MeteringHub>,
        loader: Arc<ScriptedLoader>,
    }

    fn rig(drives_idle: bool) -> Rig {
        let (events, events_rx) = EventSender::channel();
        let slot = Arc::new(PluginSlot::new());
        let loader = ScriptedLoader::new();
        let host = Arc::new(PluginHost::new(
            loader.clone(),
            slot.clone(),
            events.clone(),
            Duration::from_secs(1),
        ));

        let (mut pre_tx, pre_rx) = create_tap(4096);
        let (mut post_tx, post_rx) = create_tap(4096);
        pre_tx.push_slice(&[0.5f32; 256]);
        post_tx.push_slice(&[0.25f32; 256]);
        let hub = Arc::new(MeteringHub::new());
        let pipeline = MeteringPipeline::new(
            pre_rx,
            post_rx,
            48000,
            2,
            Arc::new(ClipIndicators::default()),
            hub.clone(),
        );

        let (garbage_tx, garbage_rx) = create_command_buffer(4);
        let (stop_tx, stop_rx) = mpsc::channel();
        let fault = Arc::new(StreamFault::default());

        let worker = IdleWorker::spawn(WorkerContext {
            pipeline,
            garbage: garbage_rx,
            slot: slot.clone(),
            host: host.clone(),
            events,
            fault: fault.clone(),
            stream_stop: stop_tx,
            settings: WorkerSettings {
                metering_hz: 200,
                metering_event_hz: 50,
                drives_idle,
            },
        })
        .unwrap();

        Rig {
            worker,
            events: events_rx,
            stream_stop: stop_rx,
            fault,
            host,
            slot,
            garbage: garbage_tx,
            hub,
            loader,
        }
    }

    #[test]
    fn test_publishes_metering() {
        let mut rig = rig(false);
        thread::sleep(Duration::from_millis(100));
        rig.worker.stop();

        let updates = rig
            .events
            .try_iter()
            .filter(|e| matches!(e, PreviewEvent::MeteringUpdate(_)))
            .count();
        assert!(updates >= 1);
        // Rate limited below the tick rate
        assert!(updates <= 10);

        let latest = rig.hub.latest();
        // Levels decay to the floor once the taps are empty
        assert_eq!(latest.left_db, crate::audio::metering::METER_FLOOR_DB);
    }

    #[test]
    fn test_drains_retired_inputs() {
        let mut rig = rig(false);
        assert!(rig.garbage.try_push(ActiveInput::Silence).is_ok());
        thread::sleep(Duration::from_millis(60));
        assert_eq!(rig.garbage.vacant_len(), 4);
        rig.worker.stop();
    }

    #[test]
    fn test_device_fault_stops_stream_once() {
        let mut rig = rig(false);
        rig.fault.report("device unplugged".to_string());
        rig.fault.report("second error".to_string());

        assert!(rig
            .stream_stop
            .recv_timeout(Duration::from_millis(500))
            .is_ok());
        thread::sleep(Duration::from_millis(50));
        rig.worker.stop();

        let errors: Vec<String> = rig
            .events
            .try_iter()
            .filter_map(|e| match e {
                PreviewEvent::EngineError { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("device unplugged"));
        assert!(rig.stream_stop.try_recv().is_err());
    }

    #[test]
    fn test_forwards_plugin_crash() {
        use crate::audio::plugin::testing::FaultScript;

        let mut rig = rig(false);
        rig.host.load(Path::new("/plugins/Gain.clap")).unwrap();
        rig.loader.last_probe().script_faults(FaultScript::CrashOnce(6));

        let mut buffer = [0.1f32; 64];
        rig.slot.process(&mut buffer, 2);
        thread::sleep(Duration::from_millis(60));
        rig.worker.stop();

        assert!(matches!(rig.host.state(), PluginState::Error { .. }));
        assert!(rig.slot.take_report().is_none());
    }

    #[test]
    fn test_drives_idle_when_asked() {
        let mut rig = rig(true);
        rig.host.load(Path::new("/plugins/Gain.clap")).unwrap();
        rig.host.set_parameter(0, 0.5).unwrap();
        thread::sleep(Duration::from_millis(60));
        rig.worker.stop();

        assert_eq!(rig.loader.last_probe().gain(), 0.5);
    }
}
