//! Process-wide event stream.
//!
//! Every module emits its own typed event enum; they are wrapped into
//! [`AppEvent`] and fanned out to any number of subscribers. A subscriber
//! that falls more than `EVENT_CAPACITY` events behind skips the oldest, so
//! nothing here may be required for correctness; reply text travels on
//! per-request streams instead.

use derive_more::From;
use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::events::{ModelDownloadStateChanged, ModelLoadingStateChanged};
use crate::pipeline::PipelineStateChanged;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, From)]
#[serde(tag = "kind", content = "event", rename_all = "camelCase")]
pub enum AppEvent {
    Download(ModelDownloadStateChanged),
    Loading(ModelLoadingStateChanged),
    Pipeline(PipelineStateChanged),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having no subscriber is fine.
    pub fn emit(&self, event: impl Into<AppEvent>) {
        let event = event.into();
        trace!("emit {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
