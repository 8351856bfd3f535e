use serde::{Deserialize, Serialize};

/// Runtime status of a model - computed, not stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    /// Does the finalized artifact exist on disk?
    pub is_downloaded: bool,
    /// Is the model currently being downloaded?
    pub is_downloading: bool,
    /// Size of the temp file of an in-flight download
    pub downloaded_bytes: u64,
}
