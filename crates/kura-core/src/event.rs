//! Events: the append-only source of truth for a run.

use crate::error::Result;
use crate::ids::{HookId, RunId, StepId};
use crate::value::{self, FailureCause, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One state transition recorded in a run's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First event of every run.
    RunCreated {
        /// Name of the workflow the run executes.
        workflow_name: String,
        /// Input the run was created with.
        input: Value,
    },
    /// The run moved from pending to running.
    RunStarted,
    /// The run finished successfully.
    RunCompleted {
        /// The run's output.
        output: Value,
    },
    /// The run finished with an error.
    RunFailed {
        /// Why the run failed.
        cause: FailureCause,
    },
    /// The run was stopped before finishing.
    RunCancelled,
    /// A step was invoked, or a running step began another attempt.
    StepStarted {
        step_id: StepId,
        /// Input of this attempt; only the first is kept on the step.
        input: Value,
    },
    /// A step finished with a result.
    StepCompleted {
        step_id: StepId,
        /// The step's result.
        result: Value,
    },
    /// A step finished with an error and will not be retried.
    StepFailed {
        step_id: StepId,
        /// The terminal error.
        error: Value,
    },
    /// The attempt failed but the step will be started again.
    StepRetrying {
        step_id: StepId,
        /// Error of the failed attempt.
        error: Value,
    },
    /// The run started waiting on an external callback.
    HookRegistered {
        hook_id: HookId,
        /// Caller data describing the hook.
        metadata: Value,
    },
    /// The callback arrived.
    HookResolved {
        hook_id: HookId,
        /// Data delivered by the callback.
        payload: Value,
    },
    /// The hook will never be resolved.
    HookCancelled { hook_id: HookId },
}

impl EventKind {
    /// Stable snake_case name of the event type.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RunCreated { .. } => "run_created",
            EventKind::RunStarted => "run_started",
            EventKind::RunCompleted { .. } => "run_completed",
            EventKind::RunFailed { .. } => "run_failed",
            EventKind::RunCancelled => "run_cancelled",
            EventKind::StepStarted { .. } => "step_started",
            EventKind::StepCompleted { .. } => "step_completed",
            EventKind::StepFailed { .. } => "step_failed",
            EventKind::StepRetrying { .. } => "step_retrying",
            EventKind::HookRegistered { .. } => "hook_registered",
            EventKind::HookResolved { .. } => "hook_resolved",
            EventKind::HookCancelled { .. } => "hook_cancelled",
        }
    }

    /// The step this event concerns, if any.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            EventKind::StepStarted { step_id, .. }
            | EventKind::StepCompleted { step_id, .. }
            | EventKind::StepFailed { step_id, .. }
            | EventKind::StepRetrying { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// The hook this event concerns, if any.
    pub fn hook_id(&self) -> Option<&HookId> {
        match self {
            EventKind::HookRegistered { hook_id, .. }
            | EventKind::HookResolved { hook_id, .. }
            | EventKind::HookCancelled { hook_id } => Some(hook_id),
            _ => None,
        }
    }

    /// Checks that every value carried by the event can be persisted exactly.
    pub fn validate(&self) -> Result<()> {
        match self {
            EventKind::RunCreated { input: v, .. }
            | EventKind::RunCompleted { output: v }
            | EventKind::StepStarted { input: v, .. }
            | EventKind::StepCompleted { result: v, .. }
            | EventKind::StepFailed { error: v, .. }
            | EventKind::StepRetrying { error: v, .. }
            | EventKind::HookRegistered { metadata: v, .. }
            | EventKind::HookResolved { payload: v, .. } => value::validate(v),
            EventKind::RunFailed { cause } => value::validate(&cause.details),
            EventKind::RunStarted | EventKind::RunCancelled | EventKind::HookCancelled { .. } => {
                Ok(())
            }
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An event with its position in the run's log.
///
/// `(run_id, sequence)` is unique; sequences start at 1 and are contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// The run whose log holds this event.
    pub run_id: RunId,
    /// Position in the run's log, starting at 1.
    pub sequence: u64,
    /// Time of the append; the only clock the fold reads.
    pub created_at: DateTime<Utc>,
    /// The recorded transition.
    pub kind: EventKind,
}

/// The step transitions a caller may append through
/// [`Storage::append_step_event`](crate::Storage::append_step_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepEventKind {
    /// Payload is the step input.
    Started,
    /// Payload is the step result.
    Completed,
    /// Payload is the error value.
    Failed,
    /// Payload is the error of the failed attempt.
    Retrying,
}

impl StepEventKind {
    /// Builds the event recording this transition.
    pub fn into_event(self, step_id: StepId, payload: Value) -> EventKind {
        match self {
            StepEventKind::Started => EventKind::StepStarted {
                step_id,
                input: payload,
            },
            StepEventKind::Completed => EventKind::StepCompleted {
                step_id,
                result: payload,
            },
            StepEventKind::Failed => EventKind::StepFailed {
                step_id,
                error: payload,
            },
            StepEventKind::Retrying => EventKind::StepRetrying {
                step_id,
                error: payload,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trip_keeps_binary() {
        let event = Event {
            run_id: "wrun_1".into(),
            sequence: 3,
            created_at: Utc::now(),
            kind: EventKind::StepCompleted {
                step_id: "step_1".into(),
                result: Value::from(vec![0u8, 0, 7, 0]),
            },
        };
        let decoded: Event = value::decode(&value::encode(&event).unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_step_event_kind_mapping() {
        let kind = StepEventKind::Failed.into_event("step_9".into(), Value::from("boom"));
        assert_eq!(kind.name(), "step_failed");
        assert_eq!(kind.step_id().map(StepId::as_str), Some("step_9"));
        assert!(kind.hook_id().is_none());
    }

    #[test]
    fn test_validate_rejects_nan_payload() {
        let kind = EventKind::HookResolved {
            hook_id: "hook_1".into(),
            payload: Value::Float(f64::INFINITY),
        };
        assert!(kind.validate().is_err());
    }
}
