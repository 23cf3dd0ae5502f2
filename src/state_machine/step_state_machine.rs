use super::{
    errors::{StateMachineError, StateMachineResult},
    events::StepEvent,
    states::StepStatus,
};

/// Step status transition rules.
///
/// A step is created ONGOING and leaves that state exactly once. Stores call
/// [`StepStateMachine::transition`] before writing a new status so both backends share
/// one rule set.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepStateMachine;

impl StepStateMachine {
    /// Determine the target status for `event` applied to `current`
    pub fn transition(current: StepStatus, event: &StepEvent) -> StateMachineResult<StepStatus> {
        let target = match (current, event) {
            (StepStatus::Ongoing, StepEvent::Complete) => StepStatus::Success,
            (StepStatus::Ongoing, StepEvent::Fail(_)) => StepStatus::Failure,

            // Terminal statuses never move again
            (from, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    pub fn can_transition(current: StepStatus, event: &StepEvent) -> bool {
        Self::transition(current, event).is_ok()
    }
}
