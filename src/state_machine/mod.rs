// State machine module for the simulation pipeline
//
// Stage ordering (CONF -> CLI -> ANALYZER -> REPORT -> FINISHED) and the step status
// rules (ONGOING -> SUCCESS | FAILURE) shared by every store implementation.

pub mod errors;
pub mod events;
pub mod states;
pub mod step_state_machine;

pub use errors::{StateMachineError, StateMachineResult};
pub use events::StepEvent;
pub use states::{PipelineStage, StepStatus};
pub use step_state_machine::StepStateMachine;
