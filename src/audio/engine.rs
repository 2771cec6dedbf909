//! Main audio engine using cpal for real-time audio output

use cpal::traits::{DeviceTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::traits::*;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::device::{get_output_device, supported_stream_config, EngineConfig};
use super::error::{EngineError, InputError};
use super::events::EventSender;
use super::input::{ActiveInput, InputSource};
use super::metering::{ClipIndicators, MeteringHub, MeteringPipeline};
use super::plugin::{PluginHost, PluginSlot};
use super::render::{Crossfade, RenderProcessor, Transport, TransportState};
use super::worker::{IdleWorker, StreamFault, WorkerContext, WorkerSettings};

/// How long `set_input` waits for the callback to pick up a previous change
const INPUT_HANDOFF_TIMEOUT: Duration = Duration::from_millis(100);

/// State that only exists while the stream is open
struct RunningEngine {
    config: EngineConfig,
    stream_stop: Sender<()>,
    stream_thread: Option<JoinHandle<()>>,
    worker: IdleWorker,
    input_tx: Arc<Mutex<ringbuf::HeapProd<ActiveInput>>>,
    crossfade: Arc<Crossfade>,
    fault: Arc<StreamFault>,
}

impl RunningEngine {
    fn shutdown(mut self) {
        let _ = self.stream_stop.send(());
        if let Some(handle) = self.stream_thread.take() {
            if handle.join().is_err() {
                log::error!("Audio stream thread panicked");
            }
        }
        self.worker.stop();
    }
}

/// Owns the output stream and its helper threads
pub struct AudioEngine {
    slot: Arc<PluginSlot>,
    host: Arc<PluginHost>,
    hub: Arc<MeteringHub>,
    events: EventSender,
    worker_settings: WorkerSettings,
    device_open_timeout: Duration,
    /// Serializes start and stop. `running` itself is only held briefly, since
    /// shutting down joins a worker that may be waiting on the host.
    lifecycle: Mutex<()>,
    running: Mutex<Option<RunningEngine>>,
    /// Realized on the next start when set while stopped
    source: Mutex<InputSource>,
    transport: Arc<Transport>,
}

impl AudioEngine {
    pub fn new(
        slot: Arc<PluginSlot>,
        host: Arc<PluginHost>,
        hub: Arc<MeteringHub>,
        events: EventSender,
        worker_settings: WorkerSettings,
        device_open_timeout: Duration,
    ) -> Self {
        Self {
            slot,
            host,
            hub,
            events,
            worker_settings,
            device_open_timeout,
            lifecycle: Mutex::new(()),
            running: Mutex::new(None),
            source: Mutex::new(InputSource::Silence),
            transport: Arc::new(Transport::new()),
        }
    }

    /// Open the output stream and start rendering
    pub fn start(&self, config: EngineConfig) -> Result<(), EngineError> {
        let _lifecycle = self.lifecycle.lock();
        let stale = {
            let mut running = self.running.lock();
            match running.take() {
                Some(current) if !current.fault.is_raised() => {
                    *running = Some(current);
                    return Err(EngineError::AlreadyRunning);
                }
                stale => stale,
            }
        };
        if let Some(stale) = stale {
            // The device died under us; clean up before reopening
            stale.shutdown();
        }

        config.validate()?;
        log::info!(
            "Starting audio engine: {} Hz, {} frames, {} channels, device {:?}",
            config.sample_rate,
            config.buffer_size,
            config.channels,
            config.device
        );

        let source = self.source.lock().clone();
        let initial = ActiveInput::build(&source, config.sample_rate).unwrap_or_else(|e| {
            log::warn!("Could not prepare input {:?}: {}", source, e);
            self.events.engine_error(format!("Input unavailable: {}", e));
            ActiveInput::Silence
        });

        let crossfade = Arc::new(Crossfade::new(config.sample_rate));
        let clip = Arc::new(ClipIndicators::default());
        let (processor, handles) = RenderProcessor::new(
            initial,
            config.sample_rate,
            config.channels,
            self.slot.clone(),
            crossfade.clone(),
            self.transport.clone(),
            clip.clone(),
        );

        let fault = Arc::new(StreamFault::default());
        let (stream_stop, stop_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stream_thread = {
            let config = config.clone();
            let fault = fault.clone();
            thread::Builder::new()
                .name("audio-stream".to_string())
                .spawn(move || run_stream(config, processor, fault, ready_tx, stop_rx))
                .map_err(|e| EngineError::Stream(format!("failed to spawn stream thread: {}", e)))?
        };

        let opened = match ready_rx.recv_timeout(self.device_open_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::DeviceUnavailable(format!(
                "device did not open within {:?}",
                self.device_open_timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::Stream("stream thread exited".to_string()))
            }
        };
        if let Err(e) = opened {
            log::error!("Failed to start audio engine: {}", e);
            // Closes the stream if it opens late
            let _ = stream_stop.send(());
            return Err(e);
        }

        self.hub.reset();
        let pipeline = MeteringPipeline::new(
            handles.pre_tap,
            handles.post_tap,
            config.sample_rate,
            config.channels,
            clip,
            self.hub.clone(),
        );
        let worker = IdleWorker::spawn(WorkerContext {
            pipeline,
            garbage: handles.garbage_rx,
            slot: self.slot.clone(),
            host: self.host.clone(),
            events: self.events.clone(),
            fault: fault.clone(),
            stream_stop: stream_stop.clone(),
            settings: self.worker_settings,
        });
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                let _ = stream_stop.send(());
                let _ = stream_thread.join();
                return Err(EngineError::Stream(format!("failed to spawn worker: {}", e)));
            }
        };

        *self.running.lock() = Some(RunningEngine {
            config,
            stream_stop,
            stream_thread: Some(stream_thread),
            worker,
            input_tx: Arc::new(Mutex::new(handles.input_tx)),
            crossfade,
            fault,
        });
        log::info!("Audio engine started");
        Ok(())
    }

    /// Tear down the stream and worker. Does nothing when stopped.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock();
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.shutdown();
        self.hub.reset();
        log::info!("Audio engine stopped");
    }

    /// True while a stream is open and has not failed
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map_or(false, |running| !running.fault.is_raised())
    }

    pub fn config(&self) -> Option<EngineConfig> {
        self.running.lock().as_ref().map(|running| running.config.clone())
    }

    /// Switch the input. Decoding happens here, on the caller's thread.
    /// On failure the previous input keeps playing.
    pub fn set_input(&self, source: InputSource) -> Result<(), InputError> {
        let target = self
            .running
            .lock()
            .as_ref()
            .filter(|running| !running.fault.is_raised())
            .map(|running| (running.config.sample_rate, running.input_tx.clone()));

        let Some((sample_rate, input_tx)) = target else {
            log::info!("Engine not running, input applies on next start: {:?}", source);
            *self.source.lock() = source;
            return Ok(());
        };

        let mut next = ActiveInput::build(&source, sample_rate)?;
        let deadline = Instant::now() + INPUT_HANDOFF_TIMEOUT;
        loop {
            match input_tx.lock().try_push(next) {
                Ok(()) => break,
                Err(rejected) => next = rejected,
            }
            if Instant::now() >= deadline {
                return Err(InputError::Busy);
            }
            thread::sleep(Duration::from_millis(5));
        }

        log::info!("Input set: {:?}", source);
        *self.source.lock() = source;
        Ok(())
    }

    pub fn input(&self) -> InputSource {
        self.source.lock().clone()
    }

    pub fn play(&self) {
        log::info!("Transport: play");
        self.transport.play();
    }

    pub fn pause(&self) {
        log::info!("Transport: pause");
        self.transport.pause();
    }

    /// Silence the input and rewind it. The stream keeps running.
    pub fn stop_playback(&self) {
        log::info!("Transport: stop");
        self.transport.stop();
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.transport.set_master_volume(volume);
    }

    pub fn master_volume(&self) -> f32 {
        self.transport.master_volume()
    }

    /// Ramp the output to silence and wait for it. No-op when stopped.
    pub fn fade_out(&self) {
        let crossfade = self.running_crossfade();
        if let Some(crossfade) = crossfade {
            let timeout = crossfade.ramp_duration() * 2 + Duration::from_millis(200);
            if !crossfade.fade_out_and_wait(timeout) {
                log::warn!("Output did not reach silence within {:?}", timeout);
            }
        }
    }

    pub fn fade_in(&self) {
        if let Some(crossfade) = self.running_crossfade() {
            crossfade.start_in();
        }
    }

    fn running_crossfade(&self) -> Option<Arc<Crossfade>> {
        self.running
            .lock()
            .as_ref()
            .filter(|running| !running.fault.is_raised())
            .map(|running| running.crossfade.clone())
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Body of the stream-owner thread. The cpal stream is not `Send`, so it is
/// created, played and dropped here.
fn run_stream(
    config: EngineConfig,
    mut processor: RenderProcessor,
    fault: Arc<StreamFault>,
    ready: Sender<Result<(), EngineError>>,
    stop: Receiver<()>,
) {
    let opened = (|| -> Result<cpal::Stream, EngineError> {
        let device = get_output_device(config.device.as_deref())?;
        let stream_config = supported_stream_config(&device, &config)?;

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| processor.render(data),
                move |err| fault.report(err.to_string()),
                None,
            )
            .map_err(|e| EngineError::Stream(format!("Failed to build output stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| EngineError::Stream(format!("Failed to start stream: {}", e)))?;
        Ok(stream)
    })();

    match opened {
        Ok(stream) => {
            if ready.send(Ok(())).is_err() {
                // The caller gave up waiting
                return;
            }
            let _ = stop.recv();
            drop(stream);
        }
        Err(e) => {
            let _ = ready.send(Err(e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::plugin::testing::ScriptedLoader;
    use crate::audio::signals::SignalConfig;

    fn engine() -> AudioEngine {
        engine_with(ScriptedLoader::new())
    }

    fn engine_with(loader: Arc<ScriptedLoader>) -> AudioEngine {
        let (events, _rx) = EventSender::channel();
        let slot = Arc::new(PluginSlot::new());
        let host = Arc::new(PluginHost::new(
            loader,
            slot.clone(),
            events.clone(),
            Duration::from_secs(1),
        ));
        AudioEngine::new(
            slot,
            host,
            Arc::new(MeteringHub::new()),
            events,
            WorkerSettings::default(),
            Duration::from_secs(3),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected_before_opening() {
        let engine = engine();
        let result = engine.start(EngineConfig {
            sample_rate: 0,
            ..Default::default()
        });
        assert!(matches!(result, Err(EngineError::UnsupportedConfig(_))));
        assert!(!engine.is_running());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = engine();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
        assert!(engine.config().is_none());
    }

    #[test]
    fn test_input_is_remembered_while_stopped() {
        let engine = engine();
        let source = InputSource::Signal {
            config: SignalConfig::default(),
        };
        engine.set_input(source.clone()).unwrap();
        assert_eq!(engine.input(), source);

        // Fades are no-ops without a stream
        engine.fade_out();
        engine.fade_in();
    }

    #[test]
    fn test_transport_survives_while_stopped() {
        let engine = engine();
        assert_eq!(engine.transport_state(), TransportState::Playing);
        engine.pause();
        assert_eq!(engine.transport_state(), TransportState::Paused);
        engine.stop_playback();
        assert_eq!(engine.transport_state(), TransportState::Stopped);
        engine.play();
        assert_eq!(engine.transport_state(), TransportState::Playing);

        engine.set_master_volume(0.5);
        assert_eq!(engine.master_volume(), 0.5);
        engine.set_master_volume(f32::NAN);
        assert_eq!(engine.master_volume(), 0.5);
        engine.set_master_volume(3.0);
        assert_eq!(engine.master_volume(), 1.0);
    }

    #[test]
    fn test_restart_after_fault_does_not_hold_running_while_joining() {
        use crate::audio::buffer::{create_command_buffer, create_tap};
        use crate::audio::plugin::testing::FaultScript;
        use std::path::Path;

        let loader = ScriptedLoader::new();
        let engine = Arc::new(engine_with(loader.clone()));
        engine.host.load(Path::new("/plugins/Gain.clap")).unwrap();

        // A latched crash makes the worker call into the host, which waits on
        // the operation lock held below
        loader.last_probe().script_faults(FaultScript::CrashOnce(11));
        let mut buffer = [0.5f32; 16];
        engine.slot.process(&mut buffer, 2);
        assert!(engine.slot.is_faulted());

        let (held_tx, held_rx) = mpsc::channel();
        let reloading = {
            let engine = engine.clone();
            thread::spawn(move || {
                let _op = engine.host.lock_operations();
                held_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
                // Needs `running`, like a reload fading out
                engine.fade_out();
            })
        };
        held_rx.recv().unwrap();

        let fault = Arc::new(StreamFault::default());
        fault.report("device unplugged".to_string());
        let (stream_stop, _stream_rx) = mpsc::channel();
        let (_pre_tx, pre_rx) = create_tap(1024);
        let (_post_tx, post_rx) = create_tap(1024);
        let (_garbage_tx, garbage_rx) = create_command_buffer(1);
        let (input_tx, _input_rx) = create_command_buffer(1);
        let worker = IdleWorker::spawn(WorkerContext {
            pipeline: MeteringPipeline::new(
                pre_rx,
                post_rx,
                48000,
                2,
                Arc::new(ClipIndicators::default()),
                engine.hub.clone(),
            ),
            garbage: garbage_rx,
            slot: engine.slot.clone(),
            host: engine.host.clone(),
            events: engine.events.clone(),
            fault: fault.clone(),
            stream_stop: stream_stop.clone(),
            settings: WorkerSettings {
                metering_hz: 200,
                ..Default::default()
            },
        })
        .unwrap();
        *engine.running.lock() = Some(RunningEngine {
            config: EngineConfig::default(),
            stream_stop,
            stream_thread: None,
            worker,
            input_tx: Arc::new(Mutex::new(input_tx)),
            crossfade: Arc::new(Crossfade::new(48000)),
            fault,
        });

        let (done_tx, done_rx) = mpsc::channel();
        {
            let engine = engine.clone();
            thread::spawn(move || {
                let result = engine.start(EngineConfig {
                    sample_rate: 0,
                    ..Default::default()
                });
                let _ = done_tx.send(result);
            });
        }

        let result = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("start deadlocked against the operation lock");
        assert!(matches!(result, Err(EngineError::UnsupportedConfig(_))));
        reloading.join().unwrap();
        assert!(engine.config().is_none());
    }

    #[test]
    #[ignore = "needs audio hardware"]
    fn test_start_stop_on_default_device() {
        let engine = engine();
        engine.start(EngineConfig::default()).unwrap();
        assert!(engine.is_running());
        assert!(matches!(
            engine.start(EngineConfig::default()),
            Err(EngineError::AlreadyRunning)
        ));

        engine
            .set_input(InputSource::Signal {
                config: SignalConfig::default(),
            })
            .unwrap();
        engine.fade_out();
        engine.fade_in();

        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }
}
