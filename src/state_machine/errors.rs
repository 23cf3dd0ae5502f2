use thiserror::Error;

use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    #[error("Invalid step transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },
}

impl From<StateMachineError> for StoreError {
    fn from(error: StateMachineError) -> Self {
        match error {
            StateMachineError::InvalidTransition { from, event } => {
                StoreError::InvalidTransition { from, event }
            }
        }
    }
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
