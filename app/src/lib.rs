//! Model acquisition and staged inference pipeline for nanochat.
//!
//! A request for a model goes through three stages: make the weights
//! available on disk ([`models::ModelManager`]), load them into the engine
//! ([`models::LoadWorker`]) and stream a reply ([`models::InferenceWorker`]).
//! [`pipeline::Pipeline`] drives those stages one request at a time. Each
//! reply goes to its own [`pipeline::ResponseStream`]; status and progress
//! are broadcast on an [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod pipeline;

#[cfg(test)]
mod testing;

pub use config::{ChatPreferences, ConfigStore, JsonFileStore, PipelineConfig};
pub use error::PipelineError;
pub use events::{AppEvent, EventBus};
pub use models::{HttpTransport, ModelKey, ModelRegistry};
pub use pipeline::{
    Pipeline, PipelineSnapshot, PipelineState, PipelineStateChanged, ResponseEvent, ResponseStream,
};
