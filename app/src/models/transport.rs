use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::debug;

use crate::error::PipelineError;

/// Body of a small, fully buffered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextResponse {
    pub status: u16,
    /// `Location` header, if the server sent one
    pub location: Option<String>,
    pub body: String,
}

/// Streaming response body plus the size the server announced.
pub struct ByteStream {
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, PipelineError>>,
}

/// HTTP operations used to fetch model artifacts.
///
/// Implemented over reqwest for production and in memory for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET `url` without following redirects and buffer the body as text.
    async fn fetch_text(&self, url: &str) -> Result<TextResponse, PipelineError>;

    /// GET `url` and hand back the body as a chunk stream.
    async fn open_stream(&self, url: &str) -> Result<ByteStream, PipelineError>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    /// Never follows redirects, so redirect payloads stay observable
    redirect_client: reqwest::Client,
    download_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, PipelineError> {
        let build_err = |e: reqwest::Error| {
            PipelineError::Network(format!("Failed to create HTTP client: {}", e))
        };

        let redirect_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(build_err)?;
        let download_client = reqwest::Client::builder().build().map_err(build_err)?;

        Ok(Self {
            redirect_client,
            download_client,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_text(&self, url: &str) -> Result<TextResponse, PipelineError> {
        let response = self
            .redirect_client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Network(format!("Failed to read response: {}", e)))?;

        debug!("GET {} -> {} ({} bytes)", url, status, body.len());

        Ok(TextResponse {
            status: status.as_u16(),
            location,
            body,
        })
    }

    async fn open_stream(&self, url: &str) -> Result<ByteStream, PipelineError> {
        let response = self
            .download_client
            .get(url)
            .send()
            .await
            .map_err(|e| PipelineError::Network(format!("Failed to start download: {}", e)))?;

        if !response.status().is_success() {
            return Err(PipelineError::Network(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let content_length = response.content_length();
        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| PipelineError::Network(format!("Download error: {}", e))))
            .boxed();

        Ok(ByteStream {
            content_length,
            chunks,
        })
    }
}
