//! Load request sent to the engine.

use std::path::PathBuf;
use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Weight data type of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum Dtype {
    #[display("fp16")]
    #[serde(rename = "fp16")]
    Float16,
    #[display("q8")]
    #[serde(rename = "q8")]
    Qint8,
    #[display("q4")]
    #[serde(rename = "q4")]
    Qint4,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown dtype: {0}")]
pub struct UnknownDtype(pub String);

impl FromStr for Dtype {
    type Err = UnknownDtype;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fp16" => Ok(Dtype::Float16),
            "q8" => Ok(Dtype::Qint8),
            "q4" => Ok(Dtype::Qint4),
            other => Err(UnknownDtype(other.to_string())),
        }
    }
}

/// Everything the engine needs to bring a model into memory.
///
/// Serialized field names are the load worker's message contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub model_name: String,
    pub model_dtype: Dtype,
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub n_ctx: u32,
}
