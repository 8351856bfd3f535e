use std::sync::Arc;

use log::{debug, warn};
use nanochat_engine::{check_prompt, Engine, PackageId, END_OF_TEXT};
use tokio::sync::mpsc;

use crate::error::PipelineError;

/// One message of a generation stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InferenceEvent {
    Token(String),
    /// The sentinel was produced; nothing follows
    EndOfText,
    Error(PipelineError),
}

impl InferenceEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InferenceEvent::Token(_))
    }
}

struct InferenceJob {
    package: PackageId,
    prompt: String,
    reply: mpsc::UnboundedSender<InferenceEvent>,
}

/// Front end of the inference worker.
///
/// Jobs run one after another, so fragments of two requests never
/// interleave.
#[derive(Clone)]
pub struct InferenceWorker {
    tx: mpsc::Sender<InferenceJob>,
}

impl InferenceWorker {
    pub fn spawn(engine: Arc<dyn Engine>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(run(engine, rx));
        Self { tx }
    }

    /// Start generating a reply to `prompt` with the given package.
    ///
    /// Fails immediately when there is no package or the prompt is too
    /// large for the engine.
    pub async fn infer(
        &self,
        package: Option<PackageId>,
        prompt: &str,
    ) -> Result<TokenStream, PipelineError> {
        let package = package
            .ok_or_else(|| PipelineError::Inference("No model loaded".to_string()))?;
        check_prompt(prompt).map_err(PipelineError::inference)?;

        let (reply, rx) = mpsc::unbounded_channel();
        self.tx
            .send(InferenceJob {
                package,
                prompt: prompt.to_string(),
                reply,
            })
            .await
            .map_err(|_| PipelineError::Inference("Inference worker is not running".to_string()))?;

        Ok(TokenStream { rx, done: false })
    }
}

/// Ordered fragments of one request, ending with exactly one terminal event.
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<InferenceEvent>,
    done: bool,
}

impl TokenStream {
    /// Next event, or `None` once the terminal event has been returned.
    pub async fn next(&mut self) -> Option<InferenceEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or_else(|| {
            InferenceEvent::Error(PipelineError::Inference(
                "Inference worker stopped before the end of text".to_string(),
            ))
        });
        self.done = event.is_terminal();
        Some(event)
    }
}

async fn run(engine: Arc<dyn Engine>, mut rx: mpsc::Receiver<InferenceJob>) {
    while let Some(job) = rx.recv().await {
        let engine = engine.clone();
        let package = job.package;
        debug!(">>> INFERENCE START: {} ({} bytes)", package, job.prompt.len());

        let handle = tokio::task::spawn_blocking(move || generate(engine.as_ref(), job));
        match handle.await {
            Ok(fragments) => debug!("<<< INFERENCE COMPLETE: {} ({} fragments)", package, fragments),
            Err(e) => warn!("Task panicked during inference on {}: {}", package, e),
        }
    }
    debug!("Inference worker stopped");
}

/// Drive one generation, forwarding fragments until the sentinel.
fn generate(engine: &dyn Engine, job: InferenceJob) -> usize {
    let InferenceJob {
        package,
        prompt,
        reply,
    } = job;
    let mut finished = false;
    let mut fragments = 0;

    let result = engine.infer(package, &prompt, &mut |fragment| {
        if finished {
            return;
        }
        if fragment == END_OF_TEXT {
            finished = true;
            let _ = reply.send(InferenceEvent::EndOfText);
        } else {
            fragments += 1;
            let _ = reply.send(InferenceEvent::Token(fragment.to_string()));
        }
    });

    match result {
        Ok(()) if !finished => {
            let _ = reply.send(InferenceEvent::Error(PipelineError::Inference(
                "Engine finished without end of text".to_string(),
            )));
        }
        Ok(()) => {}
        Err(e) if finished => warn!("Engine error after end of text on {}: {}", package, e),
        Err(e) => {
            let _ = reply.send(InferenceEvent::Error(PipelineError::inference(e)));
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use nanochat_engine::{Dtype, LoadRequest, MAX_PROMPT_BYTES};
    use std::path::PathBuf;

    fn loaded_engine() -> (Arc<ScriptedEngine>, PackageId) {
        let engine = ScriptedEngine::new();
        let package = engine
            .init(&LoadRequest {
                model_name: "zephyr".to_string(),
                model_dtype: Dtype::Qint4,
                model_path: PathBuf::from("zephyr.q4.gten"),
                tokenizer_path: PathBuf::from("zephyr_tokenizer.bin"),
                n_ctx: 800,
            })
            .unwrap();
        (engine, package)
    }

    async fn collect(mut stream: TokenStream) -> Vec<InferenceEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_fragments_in_order_then_sentinel() {
        let (engine, package) = loaded_engine();
        let worker = InferenceWorker::spawn(engine, 4);

        let stream = worker.infer(Some(package), "why is the sky blue").await.unwrap();

        assert_eq!(
            collect(stream).await,
            vec![
                InferenceEvent::Token("why".to_string()),
                InferenceEvent::Token("is".to_string()),
                InferenceEvent::Token("the".to_string()),
                InferenceEvent::Token("sky".to_string()),
                InferenceEvent::Token("blue".to_string()),
                InferenceEvent::EndOfText,
            ]
        );
    }

    #[tokio::test]
    async fn test_nothing_after_sentinel() {
        let (engine, package) = loaded_engine();
        engine.set_script(&["Hi", "<endoftext>", "leaked", "<endoftext>"]);
        let worker = InferenceWorker::spawn(engine, 4);

        let events = collect(worker.infer(Some(package), "hello").await.unwrap()).await;

        assert_eq!(
            events,
            vec![
                InferenceEvent::Token("Hi".to_string()),
                InferenceEvent::EndOfText
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_sentinel_is_an_error() {
        let (engine, package) = loaded_engine();
        engine.set_script(&["Hi", "there"]);
        let worker = InferenceWorker::spawn(engine, 4);

        let events = collect(worker.infer(Some(package), "hello").await.unwrap()).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(
            events.last(),
            Some(InferenceEvent::Error(PipelineError::Inference(_)))
        ));
    }

    #[tokio::test]
    async fn test_absent_handle_fails_fast() {
        let (engine, _package) = loaded_engine();
        let worker = InferenceWorker::spawn(engine, 4);

        let result = worker.infer(None, "hello").await;

        assert!(matches!(result, Err(PipelineError::Inference(_))));
    }

    #[tokio::test]
    async fn test_oversized_prompt_is_rejected() {
        let (engine, package) = loaded_engine();
        let worker = InferenceWorker::spawn(engine, 4);

        let prompt = "a".repeat(MAX_PROMPT_BYTES + 1);
        let result = worker.infer(Some(package), &prompt).await;

        assert!(matches!(result, Err(PipelineError::Inference(_))));
    }

    #[tokio::test]
    async fn test_engine_error_terminates_stream() {
        let (engine, package) = loaded_engine();
        engine.fail_inference(true);
        let worker = InferenceWorker::spawn(engine, 4);

        let events = collect(worker.infer(Some(package), "hello").await.unwrap()).await;

        assert_eq!(events[0], InferenceEvent::Token("partial".to_string()));
        assert!(matches!(
            events[1],
            InferenceEvent::Error(PipelineError::Inference(_))
        ));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_package_reports_error() {
        let (engine, _package) = loaded_engine();
        let worker = InferenceWorker::spawn(engine, 4);

        let events = collect(worker.infer(Some(PackageId::from(99)), "hello").await.unwrap()).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], InferenceEvent::Error(_)));
    }
}
