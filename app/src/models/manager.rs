use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::events::EventBus;

use super::catalog::{ModelKey, ModelRegistry};
use super::download::{DownloadProgress, StreamingDownloader};
use super::events::ModelDownloadStateChanged;
use super::resolver::RedirectResolver;
use super::status::ModelStatus;
use super::store::ArtifactStore;
use super::transport::Transport;
use super::ModelInfo;

type SharedAcquisition = Shared<BoxFuture<'static, Result<PathBuf, PipelineError>>>;

/// A download in progress, shared by every caller asking for the same key
struct InFlight {
    result: SharedAcquisition,
    cancel: CancellationToken,
}

/// Makes model artifacts available on local disk.
///
/// Sequences resolver, downloader and store behind a single
/// [`ensure_local`](Self::ensure_local) call. Does NOT load models into
/// memory - that's the load worker's job.
#[derive(Clone)]
pub struct ModelManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ModelRegistry>,
    store: ArtifactStore,
    resolver: RedirectResolver,
    downloader: StreamingDownloader,
    events: EventBus,
    progress_interval: Duration,
    in_flight: Mutex<HashMap<ModelKey, InFlight>>,
}

impl ModelManager {
    pub fn new(
        config: &PipelineConfig,
        registry: Arc<ModelRegistry>,
        transport: Arc<dyn Transport>,
        events: EventBus,
    ) -> Self {
        let store = ArtifactStore::new(&config.cache_root);
        info!("Models directory: {:?}", store.models_dir());

        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                resolver: RedirectResolver::new(transport.clone(), config.redirect_prefix_len),
                downloader: StreamingDownloader::new(transport),
                events,
                progress_interval: config.progress_interval(),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Return the local path of `key`, downloading it first if needed.
    ///
    /// Concurrent calls for the same key share one transfer. On any
    /// failure no partial file is left in the temp namespace.
    pub async fn ensure_local(&self, key: ModelKey) -> Result<PathBuf, PipelineError> {
        self.inner.registry.get(&key)?;
        let final_path = self.inner.store.final_path(&key);

        let shared = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get(&key) {
                info!("Model '{}' is already being downloaded, waiting for it", key);
                existing.result.clone()
            } else if self.inner.store.exists(&key) {
                debug!("Model '{}' already downloaded: {:?}", key, final_path);
                return Ok(final_path);
            } else {
                let cancel = CancellationToken::new();
                let result = self.inner.clone().spawn_acquisition(key, cancel.clone());
                in_flight.insert(
                    key,
                    InFlight {
                        result: result.clone(),
                        cancel,
                    },
                );
                result
            }
        };

        shared.await
    }

    /// Cancel an ongoing download. Returns whether one was running.
    pub fn cancel_download(&self, key: &ModelKey) -> bool {
        match self.inner.in_flight.lock().get(key) {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                info!("Cancellation requested for model '{}'", key);
                true
            }
            None => {
                debug!("No active download for model '{}'", key);
                false
            }
        }
    }

    pub fn is_downloading(&self, key: &ModelKey) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Get all models with their current status.
    pub fn get_all_models(&self) -> Vec<ModelInfo> {
        self.inner
            .registry
            .entries()
            .iter()
            .map(|entry| {
                let status = ModelStatus {
                    is_downloaded: self.inner.store.exists(&entry.key),
                    is_downloading: self.is_downloading(&entry.key),
                    downloaded_bytes: self.inner.store.temp_size(&entry.key).unwrap_or(0),
                };
                ModelInfo::from_catalog_and_status(entry, &status)
            })
            .collect()
    }

    /// Delete a downloaded model.
    pub async fn delete_model(&self, key: &ModelKey) -> Result<(), PipelineError> {
        self.inner.registry.get(key)?;
        if self.is_downloading(key) {
            return Err(PipelineError::Busy(format!(
                "Model '{}' is being downloaded",
                key
            )));
        }
        self.inner.store.delete(key).await?;
        Ok(())
    }
}

impl Inner {
    /// Run the acquisition in its own task so it outlives any one caller.
    fn spawn_acquisition(self: Arc<Self>, key: ModelKey, cancel: CancellationToken) -> SharedAcquisition {
        let handle = tokio::spawn(async move {
            let result = self.acquire(key, &cancel).await;
            if result.is_err() {
                // Before leaving in_flight, so a retry's temp file is never touched
                self.store.discard_temp(&key).await;
            }
            self.in_flight.lock().remove(&key);
            self.report(&key, &result);
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                Err(PipelineError::Filesystem(format!("Download task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// RESOLVE -> DOWNLOAD -> (VERIFY) -> FINALIZE
    async fn acquire(
        &self,
        key: ModelKey,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        let entry = self.registry.get(&key)?.clone();
        let model_name = key.to_string();

        info!("Starting download of model '{}'", model_name);
        self.events.emit(ModelDownloadStateChanged::Started {
            model_name: model_name.clone(),
        });

        self.store.ensure_dirs().await?;

        let actual_url = self.resolver.resolve(&entry.url).await?;

        let temp_path = self.store.temp_path(&key);
        let mut last_emit: Option<Instant> = None;
        let progress = self
            .downloader
            .download(
                &actual_url,
                &temp_path,
                |progress| {
                    // Emit at most every progress_interval to avoid flooding
                    if last_emit.map_or(true, |t| t.elapsed() >= self.progress_interval) {
                        self.emit_progress(&model_name, progress);
                        last_emit = Some(Instant::now());
                    }
                },
                cancel,
            )
            .await?;
        self.emit_progress(&model_name, progress);

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if let Some(expected) = &entry.sha256 {
            self.events.emit(ModelDownloadStateChanged::Verifying {
                model_name: model_name.clone(),
            });
            self.store.verify_checksum(&temp_path, expected).await?;
        }

        let final_path = self.store.final_path(&key);
        self.store.finalize(&temp_path, &final_path).await?;
        Ok(final_path)
    }

    fn emit_progress(&self, model_name: &str, progress: DownloadProgress) {
        debug!(
            "Download progress for {}: {:?}% ({}/{:?} bytes)",
            model_name,
            progress.percentage(),
            progress.bytes_received,
            progress.bytes_total
        );
        self.events.emit(ModelDownloadStateChanged::Progress {
            model_name: model_name.to_string(),
            downloaded_bytes: progress.bytes_received,
            total_bytes: progress.bytes_total,
            downloaded_mb: progress.received_mb(),
            total_mb: progress.total_mb(),
            percentage: progress.percentage(),
        });
    }

    fn report(&self, key: &ModelKey, result: &Result<PathBuf, PipelineError>) {
        let model_name = key.to_string();
        match result {
            Ok(path) => {
                info!("Download complete: {} -> {:?}", model_name, path);
                self.events
                    .emit(ModelDownloadStateChanged::Complete { model_name });
            }
            Err(PipelineError::Cancelled) => {
                warn!("Download cancelled: {}", model_name);
                self.events
                    .emit(ModelDownloadStateChanged::Cancelled { model_name });
            }
            Err(e) => {
                error!("Download failed for {}: {}", model_name, e);
                self.events.emit(ModelDownloadStateChanged::Error {
                    model_name,
                    error: e.to_string(),
                });
            }
        }
    }
}
