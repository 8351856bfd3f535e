use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use nanochat_engine::{LoadRequest, PackageId};
use tokio::sync::mpsc;

use crate::error::PipelineError;
use crate::events::EventBus;
use crate::models::{InferenceEvent, InferenceWorker, LoadWorker, ModelKey, ModelManager};

use super::commands::{PipelineCommand, PipelineSnapshot};
use super::events::PipelineStateChanged;
use super::render::LineBreakCollapser;
use super::response::{ResponseEvent, ResponseStream};
use super::state_manager::{
    PipelineAction, PipelineEvent, PipelineStateManager, TransitionResult,
};

/// Results coming back from the stage tasks
#[derive(Debug)]
enum StageMessage {
    Artifact {
        key: ModelKey,
        result: Result<PathBuf, PipelineError>,
    },
    Loaded {
        key: ModelKey,
        result: Result<PackageId, PipelineError>,
    },
    Inference(InferenceEvent),
}

/// The request currently moving through the stages
#[derive(Debug)]
struct PendingRequest {
    key: ModelKey,
    prompt: String,
    sequence: u64,
    artifact: Option<PathBuf>,
    reply: mpsc::UnboundedSender<ResponseEvent>,
}

impl PendingRequest {
    fn respond(&self, event: ResponseEvent) {
        if self.reply.send(event).is_err() {
            debug!("Response stream for request #{} was dropped", self.sequence);
        }
    }
}

/// Models in memory this session. Never shrinks.
#[derive(Debug, Default)]
struct LoadedModels {
    entries: Vec<(ModelKey, PackageId)>,
}

impl LoadedModels {
    fn get(&self, key: &ModelKey) -> Option<PackageId> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, package)| *package)
    }

    fn contains(&self, key: &ModelKey) -> bool {
        self.get(key).is_some()
    }

    fn insert(&mut self, key: ModelKey, package: PackageId) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = package,
            None => self.entries.push((key, package)),
        }
    }

    fn keys(&self) -> Vec<ModelKey> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }
}

pub struct Controller {
    command_rx: mpsc::Receiver<PipelineCommand>,
    stage_tx: mpsc::UnboundedSender<StageMessage>,
    stage_rx: mpsc::UnboundedReceiver<StageMessage>,
    state_manager: Arc<PipelineStateManager>,
    manager: ModelManager,
    loader: LoadWorker,
    inference: InferenceWorker,
    events: EventBus,
    n_ctx: u32,
    loaded: LoadedModels,
    active: Option<ModelKey>,
    pending: Option<PendingRequest>,
    /// Error waiting to be reported by `ReportFailure`
    failure: Option<PipelineError>,
    processed: u64,
    renderer: LineBreakCollapser,
}

impl Controller {
    pub fn new(
        command_rx: mpsc::Receiver<PipelineCommand>,
        state_manager: Arc<PipelineStateManager>,
        manager: ModelManager,
        loader: LoadWorker,
        inference: InferenceWorker,
        events: EventBus,
        n_ctx: u32,
    ) -> Self {
        let (stage_tx, stage_rx) = mpsc::unbounded_channel();

        // Ensure we start in Idle state
        state_manager.reset();

        Controller {
            command_rx,
            stage_tx,
            stage_rx,
            state_manager,
            manager,
            loader,
            inference,
            events,
            n_ctx,
            loaded: LoadedModels::default(),
            active: None,
            pending: None,
            failure: None,
            processed: 0,
            renderer: LineBreakCollapser::new(),
        }
    }

    /// Main control loop - consumes self, ends when every handle is dropped
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = self.stage_rx.recv() => self.handle_stage_message(message),
            }
        }
        debug!("Pipeline controller stopped");
    }

    fn handle_command(&mut self, command: PipelineCommand) {
        match command {
            PipelineCommand::Submit { key, prompt, reply } => {
                let result = self.handle_submit(key, &prompt);
                if reply.send(result).is_err() {
                    debug!("Submitter went away before the reply");
                }
            }
            PipelineCommand::CancelDownload => self.handle_cancel_download(),
            PipelineCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn handle_submit(
        &mut self,
        key: ModelKey,
        prompt: &str,
    ) -> Result<Option<ResponseStream>, PipelineError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            debug!("Ignoring empty prompt");
            return Ok(None);
        }
        self.manager.registry().get(&key)?;

        let event = if self.loaded.contains(&key) {
            PipelineEvent::SubmitLoaded
        } else {
            PipelineEvent::Submit
        };

        let action = match self.state_manager.transition(event) {
            Ok(TransitionResult::Changed { from, to, action }) => {
                self.events
                    .emit(PipelineStateChanged::StateChanged { from, to });
                action
            }
            Ok(TransitionResult::Unchanged) => None,
            Err(rejection) => {
                warn!("{}", rejection);
                self.events.emit(PipelineStateChanged::SubmissionRejected {
                    reason: rejection.to_string(),
                });
                return Err(PipelineError::Busy(rejection.to_string()));
            }
        };

        let sequence = self.processed;
        info!("Request #{} for model '{}' accepted", sequence, key);
        let (reply, response) = ResponseStream::channel(sequence);
        self.pending = Some(PendingRequest {
            key,
            prompt: prompt.to_string(),
            sequence,
            artifact: None,
            reply,
        });
        self.renderer.reset();
        self.events.emit(PipelineStateChanged::ResponseStarted {
            sequence,
            model_name: key.to_string(),
        });

        if let Some(action) = action {
            self.execute_action(action);
        }
        Ok(Some(response))
    }

    fn handle_cancel_download(&mut self) {
        match &self.pending {
            Some(pending) if pending.artifact.is_none() => {
                if !self.manager.cancel_download(&pending.key) {
                    debug!("Model '{}' is not downloading, nothing to cancel", pending.key);
                }
            }
            _ => debug!("No download to cancel"),
        }
    }

    fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.state_manager.current(),
            loaded: self.loaded.keys(),
            active: self.active,
            processed_requests: self.processed,
        }
    }

    fn handle_stage_message(&mut self, message: StageMessage) {
        match message {
            StageMessage::Artifact { key, result } => {
                if !self.is_pending(&key) {
                    warn!("Dropping stale artifact result for '{}'", key);
                    return;
                }
                match result {
                    Ok(path) => {
                        if let Some(pending) = self.pending.as_mut() {
                            pending.artifact = Some(path);
                        }
                        self.apply(PipelineEvent::ArtifactReady);
                    }
                    Err(e) => self.fail(e),
                }
            }
            StageMessage::Loaded { key, result } => {
                if !self.is_pending(&key) {
                    warn!("Dropping stale load result for '{}'", key);
                    return;
                }
                match result {
                    Ok(package) => {
                        self.loaded.insert(key, package);
                        self.apply(PipelineEvent::Loaded);
                    }
                    Err(e) => self.fail(e),
                }
            }
            StageMessage::Inference(event) => self.handle_inference_event(event),
        }
    }

    fn handle_inference_event(&mut self, event: InferenceEvent) {
        let Some(pending) = self.pending.as_ref() else {
            warn!("Dropping inference output with no request in flight");
            return;
        };
        let sequence = pending.sequence;

        match event {
            InferenceEvent::Token(fragment) => {
                if let Some(text) = self.renderer.push(&fragment) {
                    pending.respond(ResponseEvent::Token(text));
                }
            }
            InferenceEvent::EndOfText => {
                pending.respond(ResponseEvent::Finished);
                self.pending = None;
                self.renderer.reset();
                self.processed += 1;
                self.apply(PipelineEvent::Finished);
                self.events
                    .emit(PipelineStateChanged::ResponseFinished { sequence });
                info!("Request #{} finished", sequence);
            }
            InferenceEvent::Error(e) => self.fail(e),
        }
    }

    fn is_pending(&self, key: &ModelKey) -> bool {
        self.pending.as_ref().is_some_and(|p| p.key == *key)
    }

    /// Transition and run whatever action follows
    fn apply(&mut self, event: PipelineEvent) {
        match self.state_manager.transition(event) {
            Ok(TransitionResult::Changed { from, to, action }) => {
                self.events
                    .emit(PipelineStateChanged::StateChanged { from, to });
                if let Some(action) = action {
                    self.execute_action(action);
                }
            }
            Ok(TransitionResult::Unchanged) => {}
            Err(rejection) => {
                error!("Unexpected transition: {}", rejection);
            }
        }
    }

    /// Execute action returned by the state machine
    fn execute_action(&mut self, action: PipelineAction) {
        match action {
            PipelineAction::AcquireArtifact => self.acquire_artifact(),
            PipelineAction::LoadModel => self.load_model(),
            PipelineAction::StartInference => self.start_inference(),
            PipelineAction::ResumeRequest => self.apply(PipelineEvent::SubmitLoaded),
            PipelineAction::ReportFailure => self.report_failure(),
        }
    }

    /// The request a stage action applies to
    fn pending_for(&self, action: PipelineAction) -> Option<&PendingRequest> {
        let pending = self.pending.as_ref();
        if pending.is_none() {
            error!("{:?} requested with no request in flight", action);
            self.state_manager.reset();
        }
        pending
    }

    fn acquire_artifact(&mut self) {
        let Some(pending) = self.pending_for(PipelineAction::AcquireArtifact) else {
            return;
        };
        let key = pending.key;
        let manager = self.manager.clone();
        let stage_tx = self.stage_tx.clone();

        tokio::spawn(async move {
            let result = manager.ensure_local(key).await;
            let _ = stage_tx.send(StageMessage::Artifact { key, result });
        });
    }

    fn load_model(&mut self) {
        let Some(pending) = self.pending_for(PipelineAction::LoadModel) else {
            return;
        };
        let key = pending.key;

        match self.load_request(pending) {
            Ok(request) => {
                let loader = self.loader.clone();
                let stage_tx = self.stage_tx.clone();
                tokio::spawn(async move {
                    let result = loader.load(request).await;
                    let _ = stage_tx.send(StageMessage::Loaded { key, result });
                });
            }
            Err(e) => self.fail(e),
        }
    }

    fn start_inference(&mut self) {
        let Some(pending) = self.pending_for(PipelineAction::StartInference) else {
            return;
        };
        let key = pending.key;
        let prompt = pending.prompt.clone();
        let package = self.loaded.get(&key);
        self.active = Some(key);
        debug!("Starting inference on {:?} for '{}'", package, key);

        let inference = self.inference.clone();
        let stage_tx = self.stage_tx.clone();
        tokio::spawn(async move {
            match inference.infer(package, &prompt).await {
                Ok(mut stream) => {
                    while let Some(event) = stream.next().await {
                        if stage_tx.send(StageMessage::Inference(event)).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let _ = stage_tx.send(StageMessage::Inference(InferenceEvent::Error(e)));
                }
            }
        });
    }

    fn load_request(&self, pending: &PendingRequest) -> Result<LoadRequest, PipelineError> {
        let entry = self.manager.registry().get(&pending.key)?;
        let model_path = pending.artifact.clone().ok_or_else(|| {
            PipelineError::Load(format!("No artifact for model '{}'", pending.key))
        })?;

        Ok(LoadRequest {
            model_name: pending.key.name.to_string(),
            model_dtype: pending.key.format.dtype(),
            model_path,
            tokenizer_path: entry.tokenizer_path.clone(),
            n_ctx: self.n_ctx,
        })
    }

    /// Move the current request to Failed; `ReportFailure` does the rest.
    fn fail(&mut self, e: PipelineError) {
        error!("Request failed: {}", e);
        self.failure = Some(e);
        self.apply(PipelineEvent::Fail);

        // A rejected transition still has to release the request
        if self.failure.is_some() {
            self.report_failure();
        }
    }

    /// Report the failure, clean up after the request and re-enable input.
    fn report_failure(&mut self) {
        let Some(e) = self.failure.take() else {
            warn!("Failure reported with no error recorded");
            return;
        };

        if let Some(pending) = self.pending.take() {
            pending.respond(ResponseEvent::Failed(e.clone()));
            self.events.emit(PipelineStateChanged::ResponseDiscarded {
                sequence: pending.sequence,
            });
        }
        self.renderer.reset();

        self.events.emit(PipelineStateChanged::Error {
            error_type: e.kind().to_string(),
            error_message: e.to_string(),
            user_message: e.user_message(),
        });

        match self.state_manager.transition(PipelineEvent::Acknowledge) {
            Ok(TransitionResult::Changed { from, to, .. }) => {
                self.events
                    .emit(PipelineStateChanged::StateChanged { from, to });
            }
            _ => self.state_manager.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loaded_models_keep_their_own_handles() {
        use crate::models::{ModelFormat, ModelName};

        let zephyr = ModelKey::new(ModelName::Zephyr, ModelFormat::Fp16);
        let minicpm = ModelKey::new(ModelName::Minicpm, ModelFormat::Q4);
        let mut loaded = LoadedModels::default();

        loaded.insert(zephyr, PackageId::from(1));
        loaded.insert(minicpm, PackageId::from(2));

        assert_eq!(loaded.get(&zephyr), Some(PackageId::from(1)));
        assert_eq!(loaded.get(&minicpm), Some(PackageId::from(2)));
        assert_eq!(loaded.keys(), vec![zephyr, minicpm]);
        assert!(!loaded.contains(&ModelKey::new(ModelName::Tinyllama, ModelFormat::Q8)));
    }
}
