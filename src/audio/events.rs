//! Events emitted to the UI

use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};

use super::metering::MeteringSnapshot;
use super::plugin::PluginState;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum PreviewEvent {
    PluginStateChanged(PluginState),
    MeteringUpdate(MeteringSnapshot),
    EngineError { message: String },
}

impl PreviewEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Cloneable sending half of the event channel.
///
/// Emitting never fails: once the receiver is gone events are dropped.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<PreviewEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, Receiver<PreviewEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: PreviewEvent) {
        let _ = self.tx.send(event);
    }

    pub fn engine_error(&self, message: impl Into<String>) {
        self.emit(PreviewEvent::EngineError {
            message: message.into(),
        });
    }
}
