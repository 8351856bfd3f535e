//! Inference engine capability consumed by the nanochat pipeline.
//!
//! The engine itself (weights, tokenizer, sampling) lives outside this
//! workspace. This crate only describes the two calls the pipeline makes
//! on it, so the pipeline can be driven by a native binding in production
//! and by a scripted fake in tests.
//!
//! # Example
//!
//! ```no_run
//! use nanochat_engine::{Dtype, Engine, EngineError, LoadRequest, PackageId, END_OF_TEXT};
//!
//! struct Echo;
//!
//! impl Engine for Echo {
//!     fn init(&self, _request: &LoadRequest) -> Result<PackageId, EngineError> {
//!         Ok(PackageId::from(1))
//!     }
//!
//!     fn infer(
//!         &self,
//!         _package: PackageId,
//!         prompt: &str,
//!         on_token: &mut dyn FnMut(&str),
//!     ) -> Result<(), EngineError> {
//!         for word in prompt.split_whitespace() {
//!             on_token(word);
//!         }
//!         on_token(END_OF_TEXT);
//!         Ok(())
//!     }
//! }
//! ```

mod request;

pub use request::{Dtype, LoadRequest, UnknownDtype};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Terminal token emitted by the engine at the end of every generation.
pub const END_OF_TEXT: &str = "<endoftext>";

/// Largest prompt (in bytes) the engine accepts.
pub const MAX_PROMPT_BYTES: usize = 6000;

/// Opaque handle to a loaded engine instance.
///
/// Only meaningful to the engine that produced it and only for the
/// lifetime of the process.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From, Serialize, Deserialize,
)]
#[display("pkg#{_0}")]
pub struct PackageId(u64);

impl PackageId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Errors reported by an engine implementation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Model or tokenizer could not be read or deserialized.
    #[error("Failed to initialize engine: {0}")]
    Init(String),

    /// The package id does not refer to a loaded engine instance.
    #[error("Unknown inference package: {0}")]
    UnknownPackage(PackageId),

    /// The prompt exceeds what the engine can hold.
    #[error("Prompt too large: {size} bytes (max {max})")]
    PromptTooLarge { size: usize, max: usize },

    /// Generation failed part way through.
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// The two operations the pipeline needs from an inference engine.
///
/// Both calls are blocking and may run for a long time; callers are
/// expected to run them off the async executor.
pub trait Engine: Send + Sync + 'static {
    /// Load model weights and tokenizer, returning a handle to the instance.
    fn init(&self, request: &LoadRequest) -> Result<PackageId, EngineError>;

    /// Generate a completion for `prompt`, calling `on_token` once per
    /// fragment in generation order. A well-behaved engine finishes with
    /// [`END_OF_TEXT`].
    fn infer(
        &self,
        package: PackageId,
        prompt: &str,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<(), EngineError>;
}

/// Check a prompt against [`MAX_PROMPT_BYTES`].
pub fn check_prompt(prompt: &str) -> Result<(), EngineError> {
    if prompt.len() > MAX_PROMPT_BYTES {
        log::warn!(
            "Prompt rejected: {} bytes > {} bytes",
            prompt.len(),
            MAX_PROMPT_BYTES
        );
        return Err(EngineError::PromptTooLarge {
            size: prompt.len(),
            max: MAX_PROMPT_BYTES,
        });
    }
    Ok(())
}
