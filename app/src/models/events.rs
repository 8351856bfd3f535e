//! Events for the models module.
//!
//! Uses discriminated unions (tagged enums) so a consumer can switch on
//! `state`, similar to the pipeline's state events.

use serde::{Deserialize, Serialize};

/// Model download state change event - single event stream for all download state transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ModelDownloadStateChanged {
    /// A fresh download attempt started (progress is back at zero)
    #[serde(rename = "started")]
    Started {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Download is in progress
    #[serde(rename = "progress")]
    Progress {
        #[serde(rename = "modelName")]
        model_name: String,
        #[serde(rename = "downloadedBytes")]
        downloaded_bytes: u64,
        /// `None` when the server did not announce a size
        #[serde(rename = "totalBytes")]
        total_bytes: Option<u64>,
        /// Decimal megabytes, as displayed
        #[serde(rename = "downloadedMb")]
        downloaded_mb: u64,
        #[serde(rename = "totalMb")]
        total_mb: Option<u64>,
        percentage: Option<f64>,
    },
    /// Download complete, verifying checksum
    #[serde(rename = "verifying")]
    Verifying {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Download completed successfully
    #[serde(rename = "complete")]
    Complete {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Download was cancelled by the user
    #[serde(rename = "cancelled")]
    Cancelled {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Download failed with an error
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "modelName")]
        model_name: String,
        error: String,
    },
}

/// Model loading state change event - single event stream for all loading state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ModelLoadingStateChanged {
    /// Model loading has started
    #[serde(rename = "started")]
    Started {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Model loaded successfully
    #[serde(rename = "complete")]
    Complete {
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// Model loading failed with an error
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "modelName")]
        model_name: String,
        error: String,
    },
}
