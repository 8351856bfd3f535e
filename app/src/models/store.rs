use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::PipelineError;

use super::catalog::ModelKey;

/// On-disk layout of the model cache.
///
/// ```text
/// <cache_root>/models/<name>.<format>.gten   finalized artifacts
/// <cache_root>/temp/<name>.<format>.gten     in-flight downloads
/// ```
///
/// A file only ever appears under `models/` through a rename from `temp/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    models_dir: PathBuf,
    temp_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            models_dir: cache_root.join("models"),
            temp_dir: cache_root.join("temp"),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn final_path(&self, key: &ModelKey) -> PathBuf {
        self.models_dir.join(key.artifact_file_name())
    }

    pub fn temp_path(&self, key: &ModelKey) -> PathBuf {
        self.temp_dir.join(key.artifact_file_name())
    }

    /// Create both directories (recursively, idempotent).
    pub async fn ensure_dirs(&self) -> Result<(), PipelineError> {
        for dir in [&self.models_dir, &self.temp_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                PipelineError::filesystem(&format!("Failed to create {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Is the finalized artifact present? Temp files never count.
    pub fn exists(&self, key: &ModelKey) -> bool {
        self.final_path(key).is_file()
    }

    /// Size of a leftover or in-flight temp file
    pub fn temp_size(&self, key: &ModelKey) -> Option<u64> {
        self.temp_path(key).metadata().ok().map(|m| m.len())
    }

    /// Atomically move a completed download into the final namespace.
    ///
    /// On failure the temp file is removed and nothing is left under the
    /// final name.
    pub async fn finalize(&self, temp_path: &Path, final_path: &Path) -> Result<(), PipelineError> {
        match tokio::fs::rename(temp_path, final_path).await {
            Ok(()) => {
                info!("Finalized {:?}", final_path);
                Ok(())
            }
            Err(e) => {
                remove_if_present(temp_path).await;
                Err(PipelineError::filesystem(
                    &format!("Failed to move {} into place", temp_path.display()),
                    e,
                ))
            }
        }
    }

    /// Remove the temp file of `key`, if any.
    pub async fn discard_temp(&self, key: &ModelKey) {
        remove_if_present(&self.temp_path(key)).await;
    }

    /// Delete a downloaded model and any partial download of it.
    ///
    /// Returns whether a finalized artifact was removed.
    pub async fn delete(&self, key: &ModelKey) -> Result<bool, PipelineError> {
        self.discard_temp(key).await;

        let path = self.final_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted model {:?}", path);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Model '{}' was not found at {:?}", key, path);
                Ok(false)
            }
            Err(e) => Err(PipelineError::filesystem("Failed to delete model", e)),
        }
    }

    /// Verify SHA-256 checksum of a downloaded file.
    pub async fn verify_checksum(
        &self,
        file_path: &Path,
        expected_hash: &str,
    ) -> Result<(), PipelineError> {
        let mut file = tokio::fs::File::open(file_path)
            .await
            .map_err(|e| PipelineError::filesystem("Failed to open file for verification", e))?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024]; // 1MB buffer

        loop {
            let bytes_read = file
                .read(&mut buffer)
                .await
                .map_err(|e| PipelineError::filesystem("Failed to read file for verification", e))?;

            if bytes_read == 0 {
                break;
            }

            hasher.update(&buffer[..bytes_read]);
        }

        let computed_hash = format!("{:x}", hasher.finalize());

        if !computed_hash.eq_ignore_ascii_case(expected_hash) {
            return Err(PipelineError::Protocol(format!(
                "Hash mismatch: expected {}, got {}",
                expected_hash, computed_hash
            )));
        }

        debug!("Checksum verified for {:?}", file_path);
        Ok(())
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {:?}: {}", path, e),
    }
}
