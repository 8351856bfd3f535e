use serde::Serialize;
use tokio::sync::oneshot;

use crate::error::PipelineError;
use crate::models::ModelKey;

use super::response::ResponseStream;
use super::state_manager::PipelineState;

/// Commands for driving the pipeline controller.
/// These are sent through channels, the controller never shares its state.
#[derive(Debug)]
pub enum PipelineCommand {
    /// Answer `prompt` with the model `key`. The reply carries the request's
    /// response stream, or `None` when the prompt was empty and ignored.
    Submit {
        key: ModelKey,
        prompt: String,
        reply: oneshot::Sender<Result<Option<ResponseStream>, PipelineError>>,
    },
    /// Cancel the download the current request is waiting on
    CancelDownload,
    Snapshot(oneshot::Sender<PipelineSnapshot>),
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    /// Models in memory this session, in load order
    pub loaded: Vec<ModelKey>,
    /// Model of the most recent inference
    pub active: Option<ModelKey>,
    pub processed_requests: u64,
}
