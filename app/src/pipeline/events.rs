//! Typesafe events for the pipeline module.

use serde::Serialize;

use super::state_manager::PipelineState;

/// Pipeline change event - status of the pipeline and its requests.
///
/// Reply text is not carried here; it goes to the submitter's
/// [`ResponseStream`](super::ResponseStream).
///
/// `sequence` correlates the events of one request. It is the number of
/// requests completed before it, so a failed request's index is reused by
/// the next one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PipelineStateChanged {
    #[serde(rename = "stateChanged")]
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    /// A submission was accepted; a placeholder reply can be shown
    #[serde(rename = "responseStarted")]
    ResponseStarted {
        sequence: u64,
        #[serde(rename = "modelName")]
        model_name: String,
    },
    /// The sentinel arrived; input can be re-enabled
    #[serde(rename = "responseFinished")]
    ResponseFinished { sequence: u64 },
    /// The request failed; remove its placeholder
    #[serde(rename = "responseDiscarded")]
    ResponseDiscarded { sequence: u64 },
    /// A prompt arrived while another request was in flight
    #[serde(rename = "submissionRejected")]
    SubmissionRejected { reason: String },
    #[serde(rename = "error")]
    Error {
        /// Short tag of the error kind: "network" | "protocol" | ...
        #[serde(rename = "errorType")]
        error_type: String,
        /// Technical error message for debugging
        #[serde(rename = "errorMessage")]
        error_message: String,
        /// User-friendly error message
        #[serde(rename = "userMessage")]
        user_message: String,
    },
}
