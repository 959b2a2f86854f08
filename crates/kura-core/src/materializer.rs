//! Folds a run's event log into its current Run, Step and Hook state.
//!
//! The fold is pure: every timestamp comes from the events themselves, so
//! folding the same history twice yields identical aggregates, and folding a
//! prefix yields exactly the state the full fold passed through at that point.
//! [`RunAggregate::admit`] holds the rules every backend applies before
//! appending, so replays and conflicts are decided identically everywhere.

use crate::error::{EntityKind, Result, WorldError};
use crate::event::{Event, EventKind};
use crate::ids::{HookId, RunId, StepId};
use crate::model::{Hook, HookStatus, Run, RunStatus, Step, StepStatus};
use crate::value::Value;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Whether a proposed event should be appended or is a replay of history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The event changes state and must be appended.
    Append,
    /// The event repeats an already recorded transition; nothing is appended.
    Replay,
}

/// Current state of one run, derived from its events.
#[derive(Debug, Clone, PartialEq)]
pub struct RunAggregate {
    run: Run,
    steps: Vec<Step>,
    step_index: BTreeMap<StepId, usize>,
    hooks: Vec<Hook>,
    hook_index: BTreeMap<HookId, usize>,
    last_sequence: u64,
}

impl RunAggregate {
    /// Folds a complete history, which must start with `run_created` at sequence 1.
    pub fn fold(run_id: &RunId, events: &[Event]) -> Result<Self> {
        let (first, rest) = events
            .split_first()
            .ok_or_else(|| WorldError::not_found(EntityKind::Run, run_id))?;
        let mut aggregate = Self::from_created(first)?;
        aggregate.apply_all(rest)?;
        Ok(aggregate)
    }

    /// Starts an aggregate from its creation event.
    pub fn from_created(event: &Event) -> Result<Self> {
        let EventKind::RunCreated {
            workflow_name,
            input,
        } = &event.kind
        else {
            return Err(WorldError::conflict(
                &event.run_id,
                format!("history starts with {} instead of run_created", event.kind),
            ));
        };
        if event.sequence != 1 {
            return Err(WorldError::conflict(
                &event.run_id,
                format!("history starts at sequence {}", event.sequence),
            ));
        }
        Ok(Self {
            run: Run {
                run_id: event.run_id.clone(),
                workflow_name: workflow_name.clone(),
                status: RunStatus::Pending,
                input: input.clone(),
                output: None,
                error: None,
                created_at: event.created_at,
                started_at: None,
                completed_at: None,
                updated_at: event.created_at,
            },
            steps: Vec::new(),
            step_index: BTreeMap::new(),
            hooks: Vec::new(),
            hook_index: BTreeMap::new(),
            last_sequence: 1,
        })
    }

    pub fn apply_all(&mut self, events: &[Event]) -> Result<()> {
        events.iter().try_for_each(|event| self.apply(event))
    }

    /// Applies the next event of the log.
    ///
    /// Fails with `Conflict` when the event belongs to another run or its
    /// sequence is not exactly one past the last applied event.
    pub fn apply(&mut self, event: &Event) -> Result<()> {
        if event.run_id != self.run.run_id {
            return Err(WorldError::conflict(
                &self.run.run_id,
                format!("event belongs to run {}", event.run_id),
            ));
        }
        if event.sequence != self.last_sequence + 1 {
            return Err(WorldError::conflict(
                &self.run.run_id,
                format!(
                    "expected sequence {}, found {}",
                    self.last_sequence + 1,
                    event.sequence
                ),
            ));
        }

        let at = event.created_at;
        match &event.kind {
            EventKind::RunCreated { .. } => {
                return Err(WorldError::conflict(
                    &self.run.run_id,
                    format!("duplicate run_created at sequence {}", event.sequence),
                ));
            }
            EventKind::RunStarted => {
                self.run.status = RunStatus::Running;
                if self.run.started_at.is_none() {
                    self.run.started_at = Some(at);
                }
            }
            EventKind::RunCompleted { output } => {
                self.run.status = RunStatus::Completed;
                self.run.output = Some(output.clone());
                self.run.completed_at = Some(at);
            }
            EventKind::RunFailed { cause } => {
                self.run.status = RunStatus::Failed;
                self.run.error = Some(cause.clone());
                self.run.completed_at = Some(at);
            }
            EventKind::RunCancelled => {
                self.run.status = RunStatus::Cancelled;
                self.run.completed_at = Some(at);
            }
            EventKind::StepStarted { step_id, input } => {
                let known = self.step_index.contains_key(step_id);
                let step = self.step_entry(step_id, at);
                if !known {
                    step.input = input.clone();
                }
                step.status = StepStatus::Running;
                step.attempt += 1;
                if step.started_at.is_none() {
                    step.started_at = Some(at);
                }
                step.updated_at = at;
            }
            EventKind::StepCompleted { step_id, result } => {
                let step = self.step_entry(step_id, at);
                step.status = StepStatus::Completed;
                step.result = Some(result.clone());
                step.error = None;
                step.completed_at = Some(at);
                step.updated_at = at;
            }
            EventKind::StepFailed { step_id, error } => {
                let step = self.step_entry(step_id, at);
                step.status = StepStatus::Failed;
                step.error = Some(error.clone());
                step.completed_at = Some(at);
                step.updated_at = at;
            }
            EventKind::StepRetrying { step_id, error } => {
                let step = self.step_entry(step_id, at);
                step.status = StepStatus::Pending;
                step.error = Some(error.clone());
                step.updated_at = at;
            }
            EventKind::HookRegistered { hook_id, metadata } => {
                if !self.hook_index.contains_key(hook_id) {
                    self.hook_index.insert(hook_id.clone(), self.hooks.len());
                    self.hooks.push(Hook {
                        run_id: self.run.run_id.clone(),
                        hook_id: hook_id.clone(),
                        status: HookStatus::Pending,
                        metadata: metadata.clone(),
                        payload: None,
                        created_at: at,
                        settled_at: None,
                    });
                }
            }
            EventKind::HookResolved { hook_id, payload } => {
                if let Some(hook) = self.pending_hook_mut(hook_id) {
                    hook.status = HookStatus::Resolved;
                    hook.payload = Some(payload.clone());
                    hook.settled_at = Some(at);
                }
            }
            EventKind::HookCancelled { hook_id } => {
                if let Some(hook) = self.pending_hook_mut(hook_id) {
                    hook.status = HookStatus::Cancelled;
                    hook.settled_at = Some(at);
                }
            }
        }

        self.run.updated_at = at;
        self.last_sequence = event.sequence;
        Ok(())
    }

    /// Decides whether `kind` may be appended to this run's history.
    pub fn admit(&self, kind: &EventKind) -> Result<Admission> {
        let run_id = &self.run.run_id;
        let status = self.run.status;

        match kind {
            EventKind::RunCreated { .. } => {
                Err(WorldError::already_exists(EntityKind::Run, run_id))
            }
            EventKind::RunStarted => match status {
                RunStatus::Pending => Ok(Admission::Append),
                RunStatus::Running => Ok(Admission::Replay),
                _ => Err(WorldError::conflict(
                    run_id,
                    format!("cannot start a {status} run"),
                )),
            },
            EventKind::RunCompleted { output } => self.admit_terminal(
                kind,
                status == RunStatus::Completed && self.run.output.as_ref() == Some(output),
            ),
            EventKind::RunFailed { cause } => self.admit_terminal(
                kind,
                status == RunStatus::Failed && self.run.error.as_ref() == Some(cause),
            ),
            EventKind::RunCancelled => self.admit_terminal(kind, status == RunStatus::Cancelled),
            EventKind::StepStarted { step_id, .. } => {
                self.ensure_run_open(kind)?;
                match self.step(step_id) {
                    Some(step) if step.status.is_terminal() => Err(WorldError::conflict(
                        run_id,
                        format!("step {step_id} is already {}", step.status),
                    )),
                    _ => Ok(Admission::Append),
                }
            }
            EventKind::StepCompleted { step_id, result } => {
                self.admit_step_outcome(kind, step_id, StepStatus::Completed, |step| {
                    step.result.as_ref() == Some(result)
                })
            }
            EventKind::StepFailed { step_id, error } => {
                self.admit_step_outcome(kind, step_id, StepStatus::Failed, |step| {
                    step.error.as_ref() == Some(error)
                })
            }
            EventKind::StepRetrying { step_id, .. } => {
                self.ensure_run_open(kind)?;
                let step = self
                    .step(step_id)
                    .ok_or_else(|| WorldError::not_found(EntityKind::Step, step_id))?;
                if step.status == StepStatus::Running {
                    Ok(Admission::Append)
                } else {
                    Err(WorldError::conflict(
                        run_id,
                        format!("cannot retry step {step_id} while {}", step.status),
                    ))
                }
            }
            EventKind::HookRegistered { hook_id, metadata } => {
                self.ensure_run_open(kind)?;
                match self.hook(hook_id) {
                    Some(hook) if &hook.metadata == metadata => Ok(Admission::Replay),
                    Some(_) => Err(WorldError::already_exists(EntityKind::Hook, hook_id)),
                    None => Ok(Admission::Append),
                }
            }
            EventKind::HookResolved { hook_id, .. } | EventKind::HookCancelled { hook_id } => {
                // Late resolutions and repeated cancellations converge instead of failing.
                let hook = self
                    .hook(hook_id)
                    .ok_or_else(|| WorldError::not_found(EntityKind::Hook, hook_id))?;
                if hook.status == HookStatus::Pending {
                    Ok(Admission::Append)
                } else {
                    Ok(Admission::Replay)
                }
            }
        }
    }

    fn admit_terminal(&self, kind: &EventKind, is_replay: bool) -> Result<Admission> {
        if is_replay {
            Ok(Admission::Replay)
        } else if self.run.status.is_terminal() {
            Err(WorldError::conflict(
                &self.run.run_id,
                format!("cannot record {kind} on a {} run", self.run.status),
            ))
        } else {
            Ok(Admission::Append)
        }
    }

    fn admit_step_outcome(
        &self,
        kind: &EventKind,
        step_id: &StepId,
        outcome: StepStatus,
        same_outcome: impl Fn(&Step) -> bool,
    ) -> Result<Admission> {
        let step = self
            .step(step_id)
            .ok_or_else(|| WorldError::not_found(EntityKind::Step, step_id))?;
        if step.status == outcome && same_outcome(step) {
            return Ok(Admission::Replay);
        }
        self.ensure_run_open(kind)?;
        if step.status.is_terminal() {
            return Err(WorldError::conflict(
                &self.run.run_id,
                format!(
                    "step {step_id} is already {} with a different outcome",
                    step.status
                ),
            ));
        }
        Ok(Admission::Append)
    }

    fn ensure_run_open(&self, kind: &EventKind) -> Result<()> {
        if self.run.status.is_terminal() {
            Err(WorldError::conflict(
                &self.run.run_id,
                format!("cannot record {kind} on a {} run", self.run.status),
            ))
        } else {
            Ok(())
        }
    }

    fn step_entry(&mut self, step_id: &StepId, at: DateTime<Utc>) -> &mut Step {
        let position = match self.step_index.get(step_id) {
            Some(position) => *position,
            None => {
                let position = self.steps.len();
                self.steps.push(Step {
                    run_id: self.run.run_id.clone(),
                    step_id: step_id.clone(),
                    index: u32::try_from(position).unwrap_or(u32::MAX),
                    status: StepStatus::Pending,
                    attempt: 0,
                    input: Value::Null,
                    result: None,
                    error: None,
                    created_at: at,
                    started_at: None,
                    completed_at: None,
                    updated_at: at,
                });
                self.step_index.insert(step_id.clone(), position);
                position
            }
        };
        &mut self.steps[position]
    }

    fn pending_hook_mut(&mut self, hook_id: &HookId) -> Option<&mut Hook> {
        let position = *self.hook_index.get(hook_id)?;
        let hook = &mut self.hooks[position];
        (hook.status == HookStatus::Pending).then_some(hook)
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_id(&self) -> &RunId {
        &self.run.run_id
    }

    /// Steps in invocation order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.step_index.get(step_id).map(|i| &self.steps[*i])
    }

    /// Hooks in registration order.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    pub fn hook(&self, hook_id: &HookId) -> Option<&Hook> {
        self.hook_index.get(hook_id).map(|i| &self.hooks[*i])
    }

    pub fn pending_hooks(&self) -> impl Iterator<Item = &Hook> {
        self.hooks
            .iter()
            .filter(|hook| hook.status == HookStatus::Pending)
    }

    /// Sequence of the last applied event.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FailureCause;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(second: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + second, 0).unwrap()
    }

    fn history(kinds: Vec<EventKind>) -> Vec<Event> {
        let mut all = vec![EventKind::RunCreated {
            workflow_name: "wf".to_string(),
            input: Value::from("in"),
        }];
        all.extend(kinds);
        all.into_iter()
            .enumerate()
            .map(|(i, kind)| Event {
                run_id: "wrun_1".into(),
                sequence: i as u64 + 1,
                created_at: at(i as i64),
                kind,
            })
            .collect()
    }

    fn step_started(id: &str) -> EventKind {
        EventKind::StepStarted {
            step_id: id.into(),
            input: Value::Null,
        }
    }

    fn step_completed(id: &str, result: i64) -> EventKind {
        EventKind::StepCompleted {
            step_id: id.into(),
            result: Value::Int(result),
        }
    }

    #[test]
    fn test_fold_run_lifecycle() {
        let events = history(vec![
            EventKind::RunStarted,
            step_started("a"),
            step_completed("a", 1),
            EventKind::RunCompleted {
                output: Value::Int(1),
            },
        ]);
        let aggregate = RunAggregate::fold(&"wrun_1".into(), &events).unwrap();
        let run = aggregate.run();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.output, Some(Value::Int(1)));
        assert_eq!(run.started_at, Some(at(1)));
        assert_eq!(run.completed_at, Some(at(4)));
        assert_eq!(aggregate.steps().len(), 1);
        assert_eq!(aggregate.steps()[0].status, StepStatus::Completed);
        assert_eq!(aggregate.last_sequence(), 5);
    }

    #[test]
    fn test_fold_rejects_gaps_and_duplicates() {
        let mut events = history(vec![EventKind::RunStarted, step_started("a")]);
        events[2].sequence = 4;
        assert!(matches!(
            RunAggregate::fold(&"wrun_1".into(), &events),
            Err(WorldError::Conflict { .. })
        ));

        let mut events = history(vec![EventKind::RunStarted]);
        events.push(events[1].clone());
        assert!(RunAggregate::fold(&"wrun_1".into(), &events).is_err());
    }

    #[test]
    fn test_fold_empty_history_is_not_found() {
        assert!(matches!(
            RunAggregate::fold(&"wrun_x".into(), &[]),
            Err(WorldError::NotFound {
                entity: EntityKind::Run,
                ..
            })
        ));
    }

    #[test]
    fn test_retry_then_complete_counts_attempts() {
        let events = history(vec![
            step_started("a"),
            EventKind::StepRetrying {
                step_id: "a".into(),
                error: Value::from("flaky"),
            },
            step_started("a"),
            step_completed("a", 2),
        ]);
        let aggregate = RunAggregate::fold(&"wrun_1".into(), &events).unwrap();
        let step = aggregate.step(&"a".into()).unwrap();
        assert_eq!(step.attempt, 2);
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.error, None);
        assert_eq!(step.started_at, Some(at(1)));
    }

    #[test]
    fn test_admit_step_replay_and_conflict() {
        let events = history(vec![step_started("a"), step_completed("a", 1)]);
        let aggregate = RunAggregate::fold(&"wrun_1".into(), &events).unwrap();

        assert_eq!(
            aggregate.admit(&step_completed("a", 1)).unwrap(),
            Admission::Replay
        );
        assert!(matches!(
            aggregate.admit(&step_completed("a", 2)),
            Err(WorldError::Conflict { .. })
        ));
        assert!(matches!(
            aggregate.admit(&step_started("a")),
            Err(WorldError::Conflict { .. })
        ));
        assert!(matches!(
            aggregate.admit(&step_completed("missing", 1)),
            Err(WorldError::NotFound {
                entity: EntityKind::Step,
                ..
            })
        ));
    }

    #[test]
    fn test_admit_on_terminal_run() {
        let cause = FailureCause::new("boom");
        let events = history(vec![
            step_started("a"),
            EventKind::RunFailed {
                cause: cause.clone(),
            },
        ]);
        let aggregate = RunAggregate::fold(&"wrun_1".into(), &events).unwrap();

        assert_eq!(
            aggregate.admit(&EventKind::RunFailed { cause }).unwrap(),
            Admission::Replay
        );
        assert!(aggregate
            .admit(&EventKind::RunCompleted {
                output: Value::Null
            })
            .is_err());
        assert!(aggregate.admit(&step_started("b")).is_err());
        assert!(aggregate.admit(&EventKind::RunStarted).is_err());
    }

    #[test]
    fn test_admit_hooks_converge() {
        let events = history(vec![
            EventKind::HookRegistered {
                hook_id: "h".into(),
                metadata: Value::from("meta"),
            },
            EventKind::HookCancelled {
                hook_id: "h".into(),
            },
        ]);
        let aggregate = RunAggregate::fold(&"wrun_1".into(), &events).unwrap();
        let late = EventKind::HookResolved {
            hook_id: "h".into(),
            payload: Value::Int(1),
        };
        assert_eq!(aggregate.admit(&late).unwrap(), Admission::Replay);
        assert_eq!(
            aggregate.hook(&"h".into()).unwrap().status,
            HookStatus::Cancelled
        );
        assert!(matches!(
            aggregate.admit(&EventKind::HookRegistered {
                hook_id: "h".into(),
                metadata: Value::from("other"),
            }),
            Err(WorldError::AlreadyExists { .. })
        ));
    }

    fn arb_kind() -> impl Strategy<Value = EventKind> {
        let ids = prop_oneof![Just("a"), Just("b"), Just("c")];
        (0u8..7, ids, any::<i64>()).prop_map(|(tag, id, n)| match tag {
            0 => step_started(id),
            1 => step_completed(id, n),
            2 => EventKind::StepFailed {
                step_id: id.into(),
                error: Value::Int(n),
            },
            3 => EventKind::StepRetrying {
                step_id: id.into(),
                error: Value::Int(n),
            },
            4 => EventKind::HookRegistered {
                hook_id: id.into(),
                metadata: Value::Null,
            },
            5 => EventKind::HookResolved {
                hook_id: id.into(),
                payload: Value::Int(n),
            },
            _ => EventKind::RunStarted,
        })
    }

    proptest! {
        #[test]
        fn fold_is_deterministic_and_prefix_consistent(kinds in proptest::collection::vec(arb_kind(), 0..40)) {
            let events = history(kinds);
            let run_id: RunId = "wrun_1".into();
            let full = RunAggregate::fold(&run_id, &events).unwrap();
            prop_assert_eq!(&RunAggregate::fold(&run_id, &events).unwrap(), &full);

            let mut incremental = RunAggregate::from_created(&events[0]).unwrap();
            for (i, event) in events.iter().enumerate().skip(1) {
                incremental.apply(event).unwrap();
                let prefix = RunAggregate::fold(&run_id, &events[..=i]).unwrap();
                prop_assert_eq!(&prefix, &incremental);
            }
            prop_assert_eq!(incremental, full);
        }
    }
}
