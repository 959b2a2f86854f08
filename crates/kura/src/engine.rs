//! Event-sourced [`Storage`] over any [`EventLog`].
//!
//! Every mutation follows the same path: take the run's lock, fold the
//! latest history, let [`RunAggregate::admit`] decide between append, replay
//! and error, then append at the next sequence. A backend whose log is shared
//! with other processes can still lose the sequence race; the engine then
//! reloads and re-decides.

use crate::locks::KeyedLocks;
use crate::log::{AppendOutcome, EventLog};
use async_trait::async_trait;
use chrono::Utc;
use kura_core::{
    Admission, CreateRun, EntityKind, Event, EventKind, FailureCause, Hook, HookId, Result, Run,
    RunAggregate, RunId, Step, StepEventKind, StepId, Storage, Value, WorldError,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

const MAX_APPEND_ATTEMPTS: u32 = 8;

/// Runs whose aggregates stay cached at once, by default.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

struct Cached {
    aggregate: RunAggregate,
    touched: u64,
}

/// Aggregates of non-terminal runs, evicting the least recently used.
///
/// Only an optimisation: every read catches the cached aggregate up with the
/// log, so an evicted or stale entry costs a refold and nothing else.
struct AggregateCache {
    capacity: usize,
    clock: u64,
    entries: HashMap<RunId, Cached>,
}

impl AggregateCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            clock: 0,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, run_id: &RunId) -> Option<RunAggregate> {
        self.clock += 1;
        let entry = self.entries.get_mut(run_id)?;
        entry.touched = self.clock;
        Some(entry.aggregate.clone())
    }

    fn put(&mut self, aggregate: &RunAggregate) {
        let run_id = aggregate.run_id();
        if aggregate.run().status.is_terminal() || self.capacity == 0 {
            self.entries.remove(run_id);
            return;
        }
        if let Some(existing) = self.entries.get(run_id) {
            if existing.aggregate.last_sequence() >= aggregate.last_sequence() {
                return;
            }
        }
        self.clock += 1;
        self.entries.insert(
            run_id.clone(),
            Cached {
                aggregate: aggregate.clone(),
                touched: self.clock,
            },
        );
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(run_id, _)| run_id.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// [`Storage`] implemented by folding an [`EventLog`].
///
/// Aggregates of active runs are cached and caught up by loading only the
/// events past their last sequence, so reads after a write never refold the
/// log. Terminal runs are folded from the log when read.
pub struct EventSourcedStorage<L> {
    log: L,
    locks: KeyedLocks,
    cache: Mutex<AggregateCache>,
}

impl<L> fmt::Debug for EventSourcedStorage<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourcedStorage").finish_non_exhaustive()
    }
}

impl<L: EventLog> EventSourcedStorage<L> {
    pub fn new(log: L) -> Self {
        Self::with_cache_capacity(log, DEFAULT_CACHE_CAPACITY)
    }

    /// Caches at most `capacity` run aggregates; zero disables the cache.
    pub fn with_cache_capacity(log: L, capacity: usize) -> Self {
        Self {
            log,
            locks: KeyedLocks::new(),
            cache: Mutex::new(AggregateCache::new(capacity)),
        }
    }

    /// The underlying event log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Number of run aggregates currently cached.
    pub fn cached_runs(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    async fn aggregate(&self, run_id: &RunId) -> Result<RunAggregate> {
        let cached = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id);
        let aggregate = match cached {
            Some(mut aggregate) => {
                let newer = self.log.load(run_id, aggregate.last_sequence()).await?;
                aggregate.apply_all(&newer)?;
                aggregate
            }
            None => {
                let events = self.log.load(run_id, 0).await?;
                RunAggregate::fold(run_id, &events)?
            }
        };
        self.remember(&aggregate);
        Ok(aggregate)
    }

    fn remember(&self, aggregate: &RunAggregate) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(aggregate);
    }

    /// Appends whatever `plan` decides against the latest state of the run.
    ///
    /// Returns the resulting aggregate and the events actually appended,
    /// which is empty for a replay.
    async fn commit<F>(&self, run_id: &RunId, plan: F) -> Result<(RunAggregate, Vec<Event>)>
    where
        F: Fn(&RunAggregate) -> Result<Vec<EventKind>> + Send + Sync,
    {
        let _guard = self.locks.lock(run_id.as_str()).await;
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let mut aggregate = self.aggregate(run_id).await?;
            let kinds = plan(&aggregate)?;
            if kinds.is_empty() {
                debug!("Run '{}' replayed at sequence {}", run_id, aggregate.last_sequence());
                return Ok((aggregate, Vec::new()));
            }

            let created_at = Utc::now();
            let events: Vec<Event> = kinds
                .into_iter()
                .zip(aggregate.last_sequence() + 1..)
                .map(|(kind, sequence)| Event {
                    run_id: run_id.clone(),
                    sequence,
                    created_at,
                    kind,
                })
                .collect();

            match self.log.append(run_id, events.clone()).await? {
                AppendOutcome::Appended => {
                    aggregate.apply_all(&events)?;
                    self.remember(&aggregate);
                    for event in &events {
                        debug!("Run '{}' appended {} at {}", run_id, event.kind, event.sequence);
                    }
                    return Ok((aggregate, events));
                }
                AppendOutcome::SequenceTaken => {
                    warn!(
                        "Run '{}' sequence {} was taken by another writer, reloading ({}/{})",
                        run_id,
                        aggregate.last_sequence() + 1,
                        attempt,
                        MAX_APPEND_ATTEMPTS
                    );
                }
            }
        }
        Err(WorldError::conflict(
            run_id,
            format!("lost the sequence race {MAX_APPEND_ATTEMPTS} times"),
        ))
    }

    async fn transition(&self, run_id: &RunId, kind: EventKind) -> Result<RunAggregate> {
        kind.validate()?;
        let (aggregate, _) = self.commit(run_id, admit_one(kind)).await?;
        Ok(aggregate)
    }

    /// Records a terminal run event and cancels the run's pending hooks in
    /// the same append.
    async fn finish(&self, run_id: &RunId, kind: EventKind) -> Result<Run> {
        kind.validate()?;
        let (aggregate, events) = self
            .commit(run_id, move |aggregate| {
                let mut kinds = match aggregate.admit(&kind)? {
                    Admission::Append => vec![kind.clone()],
                    Admission::Replay => Vec::new(),
                };
                kinds.extend(cancel_pending(aggregate));
                Ok(kinds)
            })
            .await?;
        if !events.is_empty() {
            info!("Run '{}' is now {}", run_id, aggregate.run().status);
        }
        Ok(aggregate.run().clone())
    }
}

fn admit_one(kind: EventKind) -> impl Fn(&RunAggregate) -> Result<Vec<EventKind>> + Send + Sync {
    move |aggregate| match aggregate.admit(&kind)? {
        Admission::Append => Ok(vec![kind.clone()]),
        Admission::Replay => Ok(Vec::new()),
    }
}

fn cancel_pending(aggregate: &RunAggregate) -> Vec<EventKind> {
    aggregate
        .pending_hooks()
        .map(|hook| EventKind::HookCancelled {
            hook_id: hook.hook_id.clone(),
        })
        .collect()
}

fn hook_of(aggregate: &RunAggregate, hook_id: &HookId) -> Result<Hook> {
    aggregate
        .hook(hook_id)
        .cloned()
        .ok_or_else(|| WorldError::not_found(EntityKind::Hook, hook_id))
}

#[async_trait]
impl<L: EventLog> Storage for EventSourcedStorage<L> {
    async fn create_run(&self, request: CreateRun) -> Result<Run> {
        let run_id = match request.run_id {
            Some(run_id) => run_id,
            None => RunId::generate()?,
        };
        let first = Event {
            run_id: run_id.clone(),
            sequence: 1,
            created_at: Utc::now(),
            kind: EventKind::RunCreated {
                workflow_name: request.workflow_name,
                input: request.input,
            },
        };
        first.kind.validate()?;

        let _guard = self.locks.lock(run_id.as_str()).await;
        self.log.create(first.clone()).await?;
        let aggregate = RunAggregate::from_created(&first)?;
        self.remember(&aggregate);
        info!(
            "Run '{}' created for workflow '{}'",
            run_id,
            aggregate.run().workflow_name
        );
        Ok(aggregate.run().clone())
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run> {
        Ok(self.aggregate(run_id).await?.run().clone())
    }

    async fn list_runs(&self) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        for run_id in self.log.run_ids().await? {
            runs.push(self.aggregate(&run_id).await?.run().clone());
        }
        runs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(runs)
    }

    async fn start_run(&self, run_id: &RunId) -> Result<Run> {
        let aggregate = self.transition(run_id, EventKind::RunStarted).await?;
        Ok(aggregate.run().clone())
    }

    async fn complete_run(&self, run_id: &RunId, output: Value) -> Result<Run> {
        self.finish(run_id, EventKind::RunCompleted { output }).await
    }

    async fn fail_run(&self, run_id: &RunId, cause: FailureCause) -> Result<Run> {
        self.finish(run_id, EventKind::RunFailed { cause }).await
    }

    async fn cancel_run(&self, run_id: &RunId) -> Result<Run> {
        self.finish(run_id, EventKind::RunCancelled).await
    }

    async fn append_step_event(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        kind: StepEventKind,
        payload: Value,
    ) -> Result<Step> {
        let aggregate = self
            .transition(run_id, kind.into_event(step_id.clone(), payload))
            .await?;
        aggregate
            .step(step_id)
            .cloned()
            .ok_or_else(|| WorldError::not_found(EntityKind::Step, step_id))
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<Step> {
        self.aggregate(run_id)
            .await?
            .step(step_id)
            .cloned()
            .ok_or_else(|| WorldError::not_found(EntityKind::Step, step_id))
    }

    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<Step>> {
        Ok(self.aggregate(run_id).await?.steps().to_vec())
    }

    async fn list_events(&self, run_id: &RunId) -> Result<Vec<Event>> {
        self.log.load(run_id, 0).await
    }

    async fn register_hook(
        &self,
        run_id: &RunId,
        hook_id: &HookId,
        metadata: Value,
    ) -> Result<Hook> {
        let kind = EventKind::HookRegistered {
            hook_id: hook_id.clone(),
            metadata,
        };
        let aggregate = self.transition(run_id, kind).await?;
        hook_of(&aggregate, hook_id)
    }

    async fn resolve_hook(&self, run_id: &RunId, hook_id: &HookId, payload: Value) -> Result<Hook> {
        let kind = EventKind::HookResolved {
            hook_id: hook_id.clone(),
            payload,
        };
        let aggregate = self.transition(run_id, kind).await?;
        hook_of(&aggregate, hook_id)
    }

    async fn cancel_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook> {
        let kind = EventKind::HookCancelled {
            hook_id: hook_id.clone(),
        };
        let aggregate = self.transition(run_id, kind).await?;
        hook_of(&aggregate, hook_id)
    }

    async fn cleanup_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>> {
        let (aggregate, events) = self
            .commit(run_id, |aggregate| Ok(cancel_pending(aggregate)))
            .await?;
        events
            .iter()
            .filter_map(|event| event.kind.hook_id())
            .map(|hook_id| hook_of(&aggregate, hook_id))
            .collect()
    }

    async fn get_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook> {
        hook_of(&self.aggregate(run_id).await?, hook_id)
    }

    async fn list_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>> {
        Ok(self.aggregate(run_id).await?.hooks().to_vec())
    }
}
