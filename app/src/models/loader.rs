use std::sync::Arc;

use log::{debug, error, info};
use nanochat_engine::{Engine, LoadRequest, PackageId};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::PipelineError;
use crate::events::EventBus;

use super::events::ModelLoadingStateChanged;

struct LoadJob {
    request: LoadRequest,
    reply: oneshot::Sender<Result<PackageId, PipelineError>>,
}

/// Front end of the load worker.
///
/// Model deserialization runs in a dedicated task on the blocking pool;
/// callers only exchange messages with it. One load at a time: a second
/// request while one is outstanding is refused, not queued.
#[derive(Clone)]
pub struct LoadWorker {
    tx: mpsc::Sender<LoadJob>,
    loading: Arc<Mutex<Option<String>>>,
}

impl LoadWorker {
    pub fn spawn(engine: Arc<dyn Engine>, events: EventBus, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(run(engine, events, rx));
        Self {
            tx,
            loading: Arc::new(Mutex::new(None)),
        }
    }

    /// Load a model and return its package handle.
    pub async fn load(&self, request: LoadRequest) -> Result<PackageId, PipelineError> {
        let label = model_label(&request);
        {
            let mut loading = self.loading.lock();
            if let Some(current) = loading.as_ref() {
                return Err(PipelineError::Busy(format!(
                    "Another model is currently loading: {}",
                    current
                )));
            }
            *loading = Some(label.clone());
        }

        let result = self.send(request).await;
        *self.loading.lock() = None;
        result
    }

    /// Name of the model being loaded right now, if any
    pub fn loading_model(&self) -> Option<String> {
        self.loading.lock().clone()
    }

    async fn send(&self, request: LoadRequest) -> Result<PackageId, PipelineError> {
        let stopped = || PipelineError::Load("Load worker is not running".to_string());
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LoadJob { request, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

fn model_label(request: &LoadRequest) -> String {
    format!("{}.{}", request.model_name, request.model_dtype)
}

async fn run(engine: Arc<dyn Engine>, events: EventBus, mut rx: mpsc::Receiver<LoadJob>) {
    while let Some(LoadJob { request, reply }) = rx.recv().await {
        let model_name = model_label(&request);

        events.emit(ModelLoadingStateChanged::Started {
            model_name: model_name.clone(),
        });
        debug!(
            ">>> LOAD START: Model '{}' - beginning async load",
            model_name
        );
        info!(
            "Loading model '{}' from {:?} (n_ctx={})",
            model_name, request.model_path, request.n_ctx
        );

        let engine = engine.clone();
        let result = tokio::task::spawn_blocking(move || engine.init(&request)).await;

        let result = match result {
            Ok(Ok(package)) => {
                debug!(
                    "<<< LOAD COMPLETE: Model '{}' - now in memory as {}",
                    model_name, package
                );
                info!("Model '{}' loaded successfully", model_name);
                events.emit(ModelLoadingStateChanged::Complete {
                    model_name: model_name.clone(),
                });
                Ok(package)
            }
            Ok(Err(e)) => Err(PipelineError::load(e)),
            Err(e) => Err(PipelineError::Load(format!(
                "Task panicked while loading model: {}",
                e
            ))),
        };

        if let Err(e) = &result {
            error!("Failed to load model '{}': {}", model_name, e);
            events.emit(ModelLoadingStateChanged::Error {
                model_name,
                error: e.to_string(),
            });
        }

        if reply.send(result).is_err() {
            debug!("Load requester went away before the result arrived");
        }
    }
    debug!("Load worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::AppEvent;
    use crate::testing::ScriptedEngine;
    use nanochat_engine::Dtype;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(name: &str) -> LoadRequest {
        LoadRequest {
            model_name: name.to_string(),
            model_dtype: Dtype::Float16,
            model_path: PathBuf::from(format!("/cache/models/{}.fp16.gten", name)),
            tokenizer_path: PathBuf::from(format!("assets/tokenizers/{}_tokenizer.bin", name)),
            n_ctx: 800,
        }
    }

    #[tokio::test]
    async fn test_load_returns_package_and_emits_events() {
        let engine = ScriptedEngine::new();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let worker = LoadWorker::spawn(engine.clone(), events, 4);

        let package = worker.load(request("zephyr")).await.unwrap();

        assert_eq!(package, PackageId::from(1));
        assert_eq!(engine.loads(), vec![request("zephyr")]);
        assert_eq!(
            rx.recv().await.unwrap(),
            AppEvent::Loading(ModelLoadingStateChanged::Started {
                model_name: "zephyr.fp16".to_string()
            })
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            AppEvent::Loading(ModelLoadingStateChanged::Complete {
                model_name: "zephyr.fp16".to_string()
            })
        );
        assert_eq!(worker.loading_model(), None);
    }

    #[tokio::test]
    async fn test_load_failure_yields_no_handle() {
        let engine = ScriptedEngine::new();
        engine.fail_loads(true);
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let worker = LoadWorker::spawn(engine, events, 4);

        let result = worker.load(request("tinyllama")).await;

        assert!(matches!(result, Err(PipelineError::Load(_))));
        rx.recv().await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            AppEvent::Loading(ModelLoadingStateChanged::Error { .. })
        ));
    }

    #[tokio::test]
    async fn test_second_load_while_loading_is_refused() {
        let engine = ScriptedEngine::new();
        engine.set_load_delay(Duration::from_millis(200));
        let worker = LoadWorker::spawn(engine.clone(), EventBus::new(), 4);

        let first = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.load(request("minicpm")).await })
        };
        while worker.loading_model().is_none() {
            tokio::task::yield_now().await;
        }

        let second = worker.load(request("zephyr")).await;
        assert!(matches!(second, Err(PipelineError::Busy(_))));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(engine.loads().len(), 1);
    }
}
