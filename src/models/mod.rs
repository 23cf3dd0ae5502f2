//! # Pipeline Models
//!
//! Records persisted by the pipeline: simulations, their steps, the artifacts those steps
//! produce and the runtime snapshot attached to each running step.

pub mod artifact;
pub mod runtime_info;
pub mod simulation;
pub mod step;

pub use artifact::{Artifact, FileType, NewArtifact};
pub use runtime_info::{AnalyzerRuntimeInfo, CliRuntimeInfo, ReportRuntimeInfo, RuntimeInfo};
pub use simulation::{NewSimulation, Simulation};
pub use step::{Step, StepDetails};
