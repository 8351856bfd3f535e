use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

use super::transport::Transport;

const BYTES_PER_MB: u64 = 1_000_000;

/// Cumulative progress of one download attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub bytes_received: u64,
    /// `None` when the server sent no usable `Content-Length`
    pub bytes_total: Option<u64>,
}

impl DownloadProgress {
    pub fn percentage(&self) -> Option<f64> {
        match self.bytes_total {
            Some(total) if total > 0 => {
                Some(self.bytes_received as f64 / total as f64 * 100.0)
            }
            _ => None,
        }
    }

    /// Received size in decimal megabytes, as shown to the user
    pub fn received_mb(&self) -> u64 {
        self.bytes_received / BYTES_PER_MB
    }

    pub fn total_mb(&self) -> Option<u64> {
        self.bytes_total.map(|t| t / BYTES_PER_MB)
    }
}

/// Streams a response body into a temp file.
///
/// The temp file is the only output: renaming it into place is the
/// artifact store's job. Whenever this returns an error the temp file
/// has already been removed.
pub struct StreamingDownloader {
    transport: Arc<dyn Transport>,
}

impl StreamingDownloader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Download `url` into `dest`, truncating whatever was there.
    ///
    /// `on_progress` is called with zero before the first chunk and then
    /// once per chunk. Cancellation is observed between chunks.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<DownloadProgress, PipelineError>
    where
        F: FnMut(DownloadProgress),
    {
        if cancel.is_cancelled() {
            remove_partial(dest).await;
            return Err(PipelineError::Cancelled);
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(dest)
            .await
            .map_err(|e| PipelineError::filesystem("Failed to create file", e))?;
        let mut file = tokio::io::BufWriter::new(file);

        let response = match self.transport.open_stream(url).await {
            Ok(response) => response,
            Err(e) => {
                discard(file, dest).await;
                return Err(e);
            }
        };

        let mut progress = DownloadProgress {
            bytes_received: 0,
            bytes_total: response.content_length,
        };
        if progress.bytes_total.is_none() {
            warn!("No Content-Length for {}, total size unknown", url);
        }
        on_progress(progress);

        let mut stream = response.chunks;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = stream.next() => Some(next),
            };

            let Some(next) = next else {
                // Dropping the stream aborts the response.
                drop(stream);
                discard(file, dest).await;
                info!(
                    "Download of {} cancelled after {} bytes",
                    url, progress.bytes_received
                );
                return Err(PipelineError::Cancelled);
            };

            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    discard(file, dest).await;
                    return Err(e);
                }
                None => break,
            };

            if let Err(e) = file.write_all(&chunk).await {
                discard(file, dest).await;
                return Err(PipelineError::filesystem("Failed to write chunk", e));
            }

            progress.bytes_received += chunk.len() as u64;
            if let Some(total) = progress.bytes_total {
                if progress.bytes_received > total {
                    discard(file, dest).await;
                    return Err(PipelineError::Protocol(format!(
                        "Received {} bytes, more than the announced {}",
                        progress.bytes_received, total
                    )));
                }
            }
            on_progress(progress);
        }

        if let Err(e) = file.flush().await {
            discard(file, dest).await;
            return Err(PipelineError::filesystem("Failed to flush file", e));
        }

        if let Some(total) = progress.bytes_total {
            if progress.bytes_received < total {
                discard(file, dest).await;
                return Err(PipelineError::Network(format!(
                    "Connection closed after {} of {} bytes",
                    progress.bytes_received, total
                )));
            }
        }

        debug!(
            "Downloaded {} bytes from {} into {:?}",
            progress.bytes_received, url, dest
        );
        Ok(progress)
    }
}

/// Close and delete a partial temp file.
async fn discard(file: tokio::io::BufWriter<tokio::fs::File>, path: &Path) {
    drop(file);
    remove_partial(path).await;
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial download {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {:?}: {}", path, e),
    }
}
