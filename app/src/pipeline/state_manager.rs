//! Pipeline State Machine - Single source of truth for valid state transitions
//!
//! State diagram:
//! ```text
//! Idle ──Submit──> AwaitingArtifact ──ArtifactReady──> Loading ──Loaded──> Ready
//! Idle ──SubmitLoaded──> Inferring ──Finished──> Ready
//! Ready ──Submit──> AwaitingArtifact
//! Ready ──SubmitLoaded──> Inferring
//!
//! AwaitingArtifact | Loading | Inferring ──Fail──> Failed ──Acknowledge──> Idle
//! ```
//!
//! On Loaded the controller resumes the waiting request with SubmitLoaded,
//! so Ready is held only until that request's inference starts.
//!
//! Failed is only held while the failure is reported; the controller
//! acknowledges it right away, which returns the pipeline to Idle.

use parking_lot::Mutex;
use serde::Serialize;

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum PipelineEvent {
    /// Prompt for a model that is not loaded yet
    Submit,
    /// Prompt for a model already in memory, or the waiting prompt once
    /// its model has loaded
    SubmitLoaded,
    /// The artifact is on local disk
    ArtifactReady,
    /// The load worker returned a package handle
    Loaded,
    /// The sentinel of the current request arrived
    Finished,
    /// Any stage failed
    Fail,
    /// The failure has been reported to the user
    Acknowledge,
}

/// Actions the Controller should perform after a state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineAction {
    AcquireArtifact,
    LoadModel,
    StartInference,
    /// Hand the waiting request to inference now that its model is loaded
    ResumeRequest,
    ReportFailure,
}

/// Pipeline states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "camelCase")]
pub enum PipelineState {
    /// Nothing loaded and nothing in flight
    Idle,
    /// Waiting for the artifact to be downloaded (or found on disk)
    AwaitingArtifact,
    /// The load worker is deserializing the model
    Loading,
    /// A model is loaded and no request is in flight
    Ready,
    /// Tokens are streaming for the current request
    Inferring,
    /// A stage failed and the error is being reported
    Failed,
}

impl PipelineState {
    /// Submissions are only accepted in Idle and Ready
    pub fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Ready)
    }
}

/// Result of a successful state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// State changed
    Changed {
        from: PipelineState,
        to: PipelineState,
        action: Option<PipelineAction>,
    },
    /// Event was valid but state didn't change
    Unchanged,
}

/// Reason a transition was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{attempted_event} event rejected in {current_state} state")]
pub struct TransitionRejection {
    pub current_state: PipelineState,
    pub attempted_event: PipelineEvent,
}

/// Thread-safe pipeline state manager
#[derive(Debug)]
pub struct PipelineStateManager {
    state: Mutex<PipelineState>,
}

impl PipelineStateManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
        }
    }

    /// Get the current state (read-only, thread-safe)
    pub fn current(&self) -> PipelineState {
        *self.state.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_busy()
    }

    /// Attempt a state transition based on an event
    ///
    /// This is the ONLY way to change state - ensures all transitions are valid.
    pub fn transition(
        &self,
        event: PipelineEvent,
    ) -> Result<TransitionResult, TransitionRejection> {
        let mut state = self.state.lock();
        let current = *state;

        match compute_transition(current, event) {
            Some((new_state, action)) => {
                if new_state == current {
                    return Ok(TransitionResult::Unchanged);
                }

                *state = new_state;
                Ok(TransitionResult::Changed {
                    from: current,
                    to: new_state,
                    action,
                })
            }
            None => Err(TransitionRejection {
                current_state: current,
                attempted_event: event,
            }),
        }
    }

    /// Back to Idle, whatever the current state
    pub fn reset(&self) {
        *self.state.lock() = PipelineState::Idle;
    }
}

impl Default for PipelineStateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Pure function: compute what transition should happen (if any)
/// Returns None if the transition is invalid
fn compute_transition(
    current: PipelineState,
    event: PipelineEvent,
) -> Option<(PipelineState, Option<PipelineAction>)> {
    use PipelineAction as A;
    use PipelineEvent as E;
    use PipelineState as S;

    match (current, event) {
        (S::Idle | S::Ready, E::Submit) => Some((S::AwaitingArtifact, Some(A::AcquireArtifact))),
        (S::Idle | S::Ready, E::SubmitLoaded) => Some((S::Inferring, Some(A::StartInference))),

        (S::AwaitingArtifact, E::ArtifactReady) => Some((S::Loading, Some(A::LoadModel))),
        (S::Loading, E::Loaded) => Some((S::Ready, Some(A::ResumeRequest))),
        (S::Inferring, E::Finished) => Some((S::Ready, None)),

        (S::AwaitingArtifact | S::Loading | S::Inferring, E::Fail) => {
            Some((S::Failed, Some(A::ReportFailure)))
        }
        (S::Failed, E::Acknowledge) => Some((S::Idle, None)),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_request_cycle() {
        let manager = PipelineStateManager::new();

        let steps = vec![
            (PipelineEvent::Submit, PipelineState::AwaitingArtifact, Some(PipelineAction::AcquireArtifact)),
            (PipelineEvent::ArtifactReady, PipelineState::Loading, Some(PipelineAction::LoadModel)),
            (PipelineEvent::Loaded, PipelineState::Ready, Some(PipelineAction::ResumeRequest)),
            (PipelineEvent::SubmitLoaded, PipelineState::Inferring, Some(PipelineAction::StartInference)),
            (PipelineEvent::Finished, PipelineState::Ready, None),
            (PipelineEvent::SubmitLoaded, PipelineState::Inferring, Some(PipelineAction::StartInference)),
            (PipelineEvent::Finished, PipelineState::Ready, None),
        ];

        for (event, expected_state, expected_action) in steps {
            let from = manager.current();
            assert_eq!(
                manager.transition(event),
                Ok(TransitionResult::Changed {
                    from,
                    to: expected_state,
                    action: expected_action,
                }),
                "{} from {}",
                event,
                from
            );
        }
    }

    #[test]
    fn test_submissions_rejected_while_busy() {
        let busy_states = [
            PipelineState::AwaitingArtifact,
            PipelineState::Loading,
            PipelineState::Inferring,
            PipelineState::Failed,
        ];

        for state in busy_states {
            assert!(state.is_busy());
            for event in [PipelineEvent::Submit, PipelineEvent::SubmitLoaded] {
                assert_eq!(compute_transition(state, event), None, "{} in {}", event, state);
            }
        }
        assert!(!PipelineState::Idle.is_busy());
        assert!(!PipelineState::Ready.is_busy());
    }

    #[test]
    fn test_failure_from_every_stage_returns_to_idle() {
        let manager = PipelineStateManager::new();

        for prefix in [
            vec![PipelineEvent::Submit],
            vec![PipelineEvent::Submit, PipelineEvent::ArtifactReady],
            vec![PipelineEvent::SubmitLoaded],
        ] {
            manager.reset();
            for event in prefix {
                manager.transition(event).unwrap();
            }

            let result = manager.transition(PipelineEvent::Fail).unwrap();
            assert!(matches!(
                result,
                TransitionResult::Changed {
                    to: PipelineState::Failed,
                    action: Some(PipelineAction::ReportFailure),
                    ..
                }
            ));
            manager.transition(PipelineEvent::Acknowledge).unwrap();
            assert_eq!(manager.current(), PipelineState::Idle);
        }
    }

    #[test]
    fn test_inference_never_starts_before_load() {
        let manager = PipelineStateManager::new();
        manager.transition(PipelineEvent::Submit).unwrap();

        let rejection = manager.transition(PipelineEvent::Loaded).unwrap_err();
        assert_eq!(
            rejection.to_string(),
            "Loaded event rejected in AwaitingArtifact state"
        );
        assert_eq!(manager.current(), PipelineState::AwaitingArtifact);

        assert!(manager.transition(PipelineEvent::Finished).is_err());
    }

    #[test]
    fn test_idle_and_ready_cannot_fail() {
        for state in [PipelineState::Idle, PipelineState::Ready] {
            assert_eq!(compute_transition(state, PipelineEvent::Fail), None);
        }
    }
}
