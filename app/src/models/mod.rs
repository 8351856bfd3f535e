mod catalog;
mod download;
pub mod events;
mod inference;
mod loader;
mod manager;
mod resolver;
mod status;
mod store;
pub(crate) mod transport;

pub use catalog::{ModelCatalogEntry, ModelFormat, ModelKey, ModelName, ModelRegistry, ARTIFACT_EXTENSION};
pub use download::{DownloadProgress, StreamingDownloader};
pub use inference::{InferenceEvent, InferenceWorker, TokenStream};
pub use loader::LoadWorker;
pub use manager::ModelManager;
pub use resolver::RedirectResolver;
pub use status::ModelStatus;
pub use store::ArtifactStore;
pub use transport::{ByteStream, HttpTransport, TextResponse, Transport};

use serde::Serialize;

/// Combined view of one artifact (catalog + status merged).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    // From catalog
    pub key: ModelKey,
    pub url: String,
    pub display_size: String,

    // From status
    pub is_downloaded: bool,
    pub is_downloading: bool,
    pub downloaded_bytes: u64,
}

impl ModelInfo {
    pub fn from_catalog_and_status(catalog: &ModelCatalogEntry, status: &ModelStatus) -> Self {
        Self {
            key: catalog.key,
            url: catalog.url.clone(),
            display_size: catalog.display_size.clone(),
            is_downloaded: status.is_downloaded,
            is_downloading: status.is_downloading,
            downloaded_bytes: status.downloaded_bytes,
        }
    }
}
