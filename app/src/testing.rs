//! In-memory stand-ins for the network and the inference engine.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use nanochat_engine::{Engine, EngineError, LoadRequest, PackageId, END_OF_TEXT};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::PipelineError;
use crate::models::transport::{ByteStream, TextResponse, Transport};

pub const REDIRECT_PREFIX: &str = "Found. Redirecting to ";

#[derive(Clone)]
pub struct FakeDownload {
    pub content_length: Option<u64>,
    pub chunks: Vec<Result<Bytes, PipelineError>>,
    /// Never finish after the listed chunks
    pub stall: bool,
    pub gate: Option<Gate>,
}

/// Holds a download after `after_chunks` chunks until `release` is notified
#[derive(Clone)]
pub struct Gate {
    pub after_chunks: usize,
    pub release: Arc<Notify>,
}

impl FakeDownload {
    pub fn from_body(body: &[u8], chunk_size: usize) -> Self {
        Self {
            content_length: Some(body.len() as u64),
            chunks: body
                .chunks(chunk_size)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect(),
            stall: false,
            gate: None,
        }
    }

    /// Pause after `after_chunks` chunks; notify the returned handle to go on.
    pub fn gated(mut self, after_chunks: usize) -> (Self, Arc<Notify>) {
        let release = Arc::new(Notify::new());
        self.gate = Some(Gate {
            after_chunks,
            release: release.clone(),
        });
        (self, release)
    }
}

#[derive(Default)]
pub struct FakeTransport {
    redirects: Mutex<HashMap<String, Result<TextResponse, PipelineError>>>,
    downloads: Mutex<HashMap<String, FakeDownload>>,
    fetch_calls: AtomicUsize,
    stream_calls: AtomicUsize,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `body` behind a redirect payload at `url`.
    pub fn serve(&self, url: &str, body: &[u8], chunk_size: usize) -> String {
        let actual = format!("https://cdn.example.com/signed/{}", url.rsplit('/').next().unwrap_or("blob"));
        self.set_redirect(url, &actual);
        self.set_download(&actual, FakeDownload::from_body(body, chunk_size));
        actual
    }

    pub fn set_redirect(&self, url: &str, actual: &str) {
        self.redirects.lock().insert(
            url.to_string(),
            Ok(TextResponse {
                status: 302,
                location: None,
                body: format!("{}{}", REDIRECT_PREFIX, actual),
            }),
        );
    }

    pub fn set_redirect_response(&self, url: &str, response: Result<TextResponse, PipelineError>) {
        self.redirects.lock().insert(url.to_string(), response);
    }

    pub fn set_download(&self, actual: &str, download: FakeDownload) {
        self.downloads.lock().insert(actual.to_string(), download);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch_text(&self, url: &str) -> Result<TextResponse, PipelineError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.redirects
            .lock()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(PipelineError::Network(format!("no route to {}", url))))
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream, PipelineError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let download = self
            .downloads
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| PipelineError::Network(format!("no route to {}", url)))?;

        let FakeDownload {
            content_length,
            mut chunks,
            stall,
            gate,
        } = download;

        let chunks = match gate {
            Some(Gate {
                after_chunks,
                release,
            }) => {
                let tail = chunks.split_off(after_chunks.min(chunks.len()));
                let wait = stream::once(async move { release.notified().await })
                    .filter_map(|()| future::ready(None::<Result<Bytes, PipelineError>>));
                stream::iter(chunks).chain(wait).chain(stream::iter(tail)).boxed()
            }
            None => stream::iter(chunks).boxed(),
        };
        let chunks = if stall {
            chunks.chain(stream::pending()).boxed()
        } else {
            chunks
        };

        Ok(ByteStream {
            content_length,
            chunks,
        })
    }
}

/// Engine fake that echoes prompt words, or plays a fixed token script.
#[derive(Default)]
pub struct ScriptedEngine {
    loads: Mutex<Vec<LoadRequest>>,
    packages: Mutex<HashSet<PackageId>>,
    next_id: AtomicU64,
    fail_load: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    script: Mutex<Option<Vec<String>>>,
    fail_infer: AtomicBool,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inference(&self, fail: bool) {
        self.fail_infer.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock() = Some(delay);
    }

    pub fn set_script(&self, tokens: &[&str]) {
        *self.script.lock() = Some(tokens.iter().map(|t| t.to_string()).collect());
    }

    pub fn loads(&self) -> Vec<LoadRequest> {
        self.loads.lock().clone()
    }
}

impl Engine for ScriptedEngine {
    fn init(&self, request: &LoadRequest) -> Result<PackageId, EngineError> {
        let delay = *self.load_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        self.loads.lock().push(request.clone());
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(EngineError::Init(format!(
                "cannot read {}",
                request.model_path.display()
            )));
        }

        let id = PackageId::from(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.packages.lock().insert(id);
        Ok(id)
    }

    fn infer(
        &self,
        package: PackageId,
        prompt: &str,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError> {
        if !self.packages.lock().contains(&package) {
            return Err(EngineError::UnknownPackage(package));
        }
        if self.fail_infer.load(Ordering::SeqCst) {
            on_token("partial");
            return Err(EngineError::Inference("kv cache exhausted".to_string()));
        }

        let script = self.script.lock().clone();
        match script {
            Some(tokens) => tokens.iter().for_each(|t| on_token(t)),
            None => {
                for word in prompt.split_whitespace() {
                    on_token(word);
                }
                on_token(END_OF_TEXT);
            }
        }
        Ok(())
    }
}
