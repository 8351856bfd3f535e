use tokio::sync::mpsc;

use crate::error::PipelineError;

/// What the submitter of one request sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// Rendered text to append to the reply
    Token(String),
    /// The sentinel arrived; the reply is complete
    Finished,
    /// The request failed; drop whatever was rendered for it
    Failed(PipelineError),
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseEvent::Token(_))
    }
}

/// Reply to one accepted submission.
///
/// Every rendered fragment is queued here in order, however far behind the
/// reader is. The stream ends with exactly one `Finished` or `Failed`.
#[derive(Debug)]
pub struct ResponseStream {
    sequence: u64,
    rx: mpsc::UnboundedReceiver<ResponseEvent>,
    done: bool,
}

impl ResponseStream {
    pub(crate) fn channel(sequence: u64) -> (mpsc::UnboundedSender<ResponseEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = Self {
            sequence,
            rx,
            done: false,
        };
        (tx, stream)
    }

    /// Index correlating this reply with the pipeline's status events
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Next event, or `None` once the terminal event has been returned.
    pub async fn next(&mut self) -> Option<ResponseEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await.unwrap_or_else(|| {
            ResponseEvent::Failed(PipelineError::Inference(
                "Pipeline stopped before the reply finished".to_string(),
            ))
        });
        self.done = event.is_terminal();
        Some(event)
    }

    /// Read the reply to the end and return its text.
    pub async fn text(mut self) -> Result<String, PipelineError> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event {
                ResponseEvent::Token(fragment) => text.push_str(&fragment),
                ResponseEvent::Finished => break,
                ResponseEvent::Failed(e) => return Err(e),
            }
        }
        Ok(text)
    }
}
