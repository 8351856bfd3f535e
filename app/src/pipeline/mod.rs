mod commands;
mod controller;
mod events;
mod render;
mod response;
mod state_manager;

pub use commands::{PipelineCommand, PipelineSnapshot};
pub use controller::Controller;
pub use events::PipelineStateChanged;
pub use render::{LineBreakCollapser, PARAGRAPH_BREAK};
pub use response::{ResponseEvent, ResponseStream};
pub use state_manager::{
    PipelineAction, PipelineEvent, PipelineState, PipelineStateManager, TransitionRejection,
    TransitionResult,
};

use std::sync::Arc;

use log::info;
use nanochat_engine::Engine;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::{AppEvent, EventBus};
use crate::models::{
    InferenceWorker, LoadWorker, ModelInfo, ModelKey, ModelManager, ModelRegistry, Transport,
};

/// Handle to a running pipeline.
///
/// Cheap to clone. The controller task stops once every handle is dropped.
#[derive(Clone)]
pub struct Pipeline {
    command_tx: mpsc::Sender<PipelineCommand>,
    state_manager: Arc<PipelineStateManager>,
    manager: ModelManager,
    events: EventBus,
}

impl Pipeline {
    /// Spawn the workers and the controller. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: &PipelineConfig,
        registry: ModelRegistry,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn Engine>,
    ) -> Self {
        let events = EventBus::new();
        let manager = ModelManager::new(config, Arc::new(registry), transport, events.clone());
        let loader = LoadWorker::spawn(engine.clone(), events.clone(), config.command_buffer);
        let inference = InferenceWorker::spawn(engine, config.command_buffer);

        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let state_manager = Arc::new(PipelineStateManager::new());
        let controller = Controller::new(
            command_rx,
            state_manager.clone(),
            manager.clone(),
            loader,
            inference,
            events.clone(),
            config.n_ctx,
        );
        tokio::spawn(controller.run());
        info!("Pipeline started (n_ctx={})", config.n_ctx);

        Self {
            command_tx,
            state_manager,
            manager,
            events,
        }
    }

    /// Submit a prompt for `key`.
    ///
    /// Returns once the request is accepted, with the stream its reply is
    /// written to. Status and progress go to [`Pipeline::subscribe`].
    /// `Ok(None)` means the prompt was blank and nothing was submitted.
    pub async fn submit(
        &self,
        key: ModelKey,
        prompt: &str,
    ) -> Result<Option<ResponseStream>, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineCommand::Submit {
            key,
            prompt: prompt.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| stopped())?
    }

    /// Cancel the download the current request is waiting on, if any.
    pub async fn cancel_download(&self) -> Result<(), PipelineError> {
        self.send(PipelineCommand::CancelDownload).await
    }

    pub async fn snapshot(&self) -> Result<PipelineSnapshot, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.send(PipelineCommand::Snapshot(reply)).await?;
        rx.await.map_err(|_| stopped())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state_manager.current()
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        self.manager.get_all_models()
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    async fn send(&self, command: PipelineCommand) -> Result<(), PipelineError> {
        self.command_tx.send(command).await.map_err(|_| stopped())
    }
}

fn stopped() -> PipelineError {
    PipelineError::Inference("Pipeline is not running".to_string())
}
