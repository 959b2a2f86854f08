//! Materialized Run, Step and Hook records.
//!
//! These are always derived from the event log and handed to callers by
//! value; mutating a returned record never affects stored state.

use crate::ids::{HookId, RunId, StepId};
use crate::value::{FailureCause, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not started.
    Pending,
    /// Started and not yet finished.
    Running,
    /// Finished with an output.
    Completed,
    /// Finished with a [`FailureCause`].
    Failed,
    /// Stopped before finishing.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: RunId,
    /// Name of the workflow this run executes.
    pub workflow_name: String,
    pub status: RunStatus,
    /// Input given at creation.
    pub input: Value,
    /// Set once the run completed.
    pub output: Option<Value>,
    /// Set once the run failed.
    pub error: Option<FailureCause>,
    /// Time of the creating event.
    pub created_at: DateTime<Utc>,
    /// Time of the first start.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Time of the latest event applied to the run.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Known to the run but not started.
    Pending,
    /// Started, or waiting to be started again after a retry.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error; no further attempts.
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// The run this step belongs to.
    pub run_id: RunId,
    pub step_id: StepId,
    /// Invocation order within the run, starting at 0.
    pub index: u32,
    pub status: StepStatus,
    /// Number of times the step has been started.
    pub attempt: u32,
    /// Input of the first start.
    pub input: Value,
    /// Set once the step completed.
    pub result: Option<Value>,
    /// Terminal error, or the error of the last failed attempt while retrying.
    pub error: Option<Value>,
    /// Time the step was first seen.
    pub created_at: DateTime<Utc>,
    /// Time of the first start.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the step completed or failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Time of the latest event for this step.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStatus {
    /// Registered and waiting for a resolution.
    Pending,
    /// Resolved with a payload.
    Resolved,
    /// Cancelled explicitly or by hook cleanup.
    Cancelled,
}

impl HookStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, HookStatus::Pending)
    }
}

impl fmt::Display for HookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookStatus::Pending => write!(f, "pending"),
            HookStatus::Resolved => write!(f, "resolved"),
            HookStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An outstanding external callback a run is waiting on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    /// The run waiting on this hook.
    pub run_id: RunId,
    pub hook_id: HookId,
    pub status: HookStatus,
    /// Caller data recorded at registration.
    pub metadata: Value,
    /// The resolution payload, once resolved.
    pub payload: Option<Value>,
    /// Time of registration.
    pub created_at: DateTime<Utc>,
    /// Time the hook was resolved or cancelled.
    pub settled_at: Option<DateTime<Utc>>,
}

/// Request to create a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CreateRun {
    /// Caller-supplied id for replay-safe creation; generated when absent.
    pub run_id: Option<RunId>,
    /// Name of the workflow to run.
    pub workflow_name: String,
    /// Input recorded in the creating event.
    pub input: Value,
}

impl CreateRun {
    pub fn new(workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            run_id: None,
            workflow_name: workflow_name.into(),
            input,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}
