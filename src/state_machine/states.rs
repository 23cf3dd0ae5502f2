use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    /// Configuration has been written to the workdir
    Conf,
    /// External simulator binary
    Cli,
    /// Analysis of the simulator output
    Analyzer,
    /// Plot and report generation
    Report,
    /// Terminal marker, no work attached
    Finished,
}

impl PipelineStage {
    /// The stage that follows this one, `None` once the pipeline is finished
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Conf => Some(Self::Cli),
            Self::Cli => Some(Self::Analyzer),
            Self::Analyzer => Some(Self::Report),
            Self::Report => Some(Self::Finished),
            Self::Finished => None,
        }
    }

    /// Stages that run an executor and own a step record
    pub fn is_executable(&self) -> bool {
        matches!(self, Self::Cli | Self::Analyzer | Self::Report)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conf => "CONF",
            Self::Cli => "CLI",
            Self::Analyzer => "ANALYZER",
            Self::Report => "REPORT",
            Self::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONF" => Ok(Self::Conf),
            "CLI" => Ok(Self::Cli),
            "ANALYZER" => Ok(Self::Analyzer),
            "REPORT" => Ok(Self::Report),
            "FINISHED" => Ok(Self::Finished),
            _ => Err(format!("Invalid pipeline stage: {s}")),
        }
    }
}

/// Step status as persisted on the step record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Step is being executed
    Ongoing,
    /// Step completed and its artifacts are persisted
    Success,
    /// Step failed; the chain does not advance past it
    Failure,
}

impl StepStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Ongoing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ONGOING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONGOING" => Ok(Self::Ongoing),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            _ => Err(format!("Invalid step status: {s}")),
        }
    }
}

/// Default status for new steps
impl Default for StepStatus {
    fn default() -> Self {
        Self::Ongoing
    }
}
