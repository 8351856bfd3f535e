use nanochat_engine::EngineError;

/// Every failure the pipeline can report.
///
/// Messages are stored as strings so one result can be handed to every
/// caller waiting on the same download.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Filesystem error: {0}")]
    Filesystem(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Load error: {0}")]
    Load(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Model not found in catalog: {0}")]
    UnknownModel(String),
    #[error("Pipeline busy: {0}")]
    Busy(String),
}

impl PipelineError {
    pub(crate) fn filesystem(context: &str, err: std::io::Error) -> Self {
        PipelineError::Filesystem(format!("{}: {}", context, err))
    }

    pub(crate) fn load(err: EngineError) -> Self {
        PipelineError::Load(err.to_string())
    }

    pub(crate) fn inference(err: EngineError) -> Self {
        PipelineError::Inference(err.to_string())
    }

    /// Short stable tag for the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Network(_) => "network",
            PipelineError::Protocol(_) => "protocol",
            PipelineError::Filesystem(_) => "filesystem",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Load(_) => "load",
            PipelineError::Inference(_) => "inference",
            PipelineError::UnknownModel(_) => "unknown_model",
            PipelineError::Busy(_) => "busy",
        }
    }

    /// Returns a user-friendly error message suitable for display in the UI
    pub fn user_message(&self) -> String {
        match self {
            PipelineError::Network(_) => {
                "Model loading failed. Check your internet connection and try again.".to_string()
            }
            PipelineError::Protocol(_) => {
                "The model server returned an unexpected response. Please try again later."
                    .to_string()
            }
            PipelineError::Filesystem(msg) => {
                format!("Could not write the model to disk: {}", msg)
            }
            PipelineError::Cancelled => "Model download cancelled.".to_string(),
            PipelineError::Load(_) => {
                "Model loading failed. The model file may be corrupted; delete it and try again."
                    .to_string()
            }
            PipelineError::Inference(msg) => format!("Generation failed: {}", msg),
            PipelineError::UnknownModel(name) => {
                format!("Model '{}' not found. Please select a valid model.", name)
            }
            PipelineError::Busy(_) => {
                "Please wait for the current response to finish.".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_by_stage() {
        let load = PipelineError::load(EngineError::Init("bad magic".to_string()));
        assert_eq!(
            load,
            PipelineError::Load("Failed to initialize engine: bad magic".to_string())
        );

        let infer = PipelineError::inference(EngineError::Inference("oom".to_string()));
        assert_eq!(infer.kind(), "inference");
    }

    #[test]
    fn test_user_messages() {
        let network = PipelineError::Network("dns".to_string());
        assert!(network.user_message().contains("internet connection"));

        let cancelled = PipelineError::Cancelled;
        assert_eq!(cancelled.user_message(), "Model download cancelled.");

        let unknown = PipelineError::UnknownModel("llama.q2".to_string());
        assert!(unknown.user_message().contains("llama.q2"));
    }
}
