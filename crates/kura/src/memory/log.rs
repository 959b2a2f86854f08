use crate::log::{AppendOutcome, EventLog};
use async_trait::async_trait;
use kura_core::{EntityKind, Event, Result, RunId, WorldError};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Process-local [`EventLog`]; histories live as long as the log.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    runs: RwLock<HashMap<RunId, Vec<Event>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> WorldError {
    WorldError::transient("event log lock poisoned")
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn create(&self, first: Event) -> Result<()> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        if runs.contains_key(&first.run_id) {
            return Err(WorldError::already_exists(EntityKind::Run, &first.run_id));
        }
        runs.insert(first.run_id.clone(), vec![first]);
        Ok(())
    }

    async fn append(&self, run_id: &RunId, events: Vec<Event>) -> Result<AppendOutcome> {
        let mut runs = self.runs.write().map_err(poison_err)?;
        let history = runs
            .get_mut(run_id)
            .ok_or_else(|| WorldError::not_found(EntityKind::Run, run_id))?;
        let head = history.len() as u64;
        match events.first() {
            Some(first) if first.sequence != head + 1 => Ok(AppendOutcome::SequenceTaken),
            _ => {
                history.extend(events);
                Ok(AppendOutcome::Appended)
            }
        }
    }

    async fn load(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>> {
        let runs = self.runs.read().map_err(poison_err)?;
        let history = runs
            .get(run_id)
            .ok_or_else(|| WorldError::not_found(EntityKind::Run, run_id))?;
        let skip = usize::try_from(after).unwrap_or(usize::MAX);
        Ok(history.iter().skip(skip).cloned().collect())
    }

    async fn run_ids(&self) -> Result<Vec<RunId>> {
        let runs = self.runs.read().map_err(poison_err)?;
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kura_core::{EventKind, Value};

    fn event(run_id: &str, sequence: u64, kind: EventKind) -> Event {
        Event {
            run_id: run_id.into(),
            sequence,
            created_at: Utc::now(),
            kind,
        }
    }

    fn created(run_id: &str) -> Event {
        event(
            run_id,
            1,
            EventKind::RunCreated {
                workflow_name: "wf".to_string(),
                input: Value::Null,
            },
        )
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let log = InMemoryEventLog::new();
        log.create(created("wrun_1")).await.unwrap();
        let result = log.create(created("wrun_1")).await;
        assert!(matches!(
            result,
            Err(WorldError::AlreadyExists {
                entity: EntityKind::Run,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_append_at_stale_sequence_is_taken() {
        let log = InMemoryEventLog::new();
        let run_id: RunId = "wrun_1".into();
        log.create(created("wrun_1")).await.unwrap();
        let started = event("wrun_1", 2, EventKind::RunStarted);
        assert_eq!(
            log.append(&run_id, vec![started.clone()]).await.unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            log.append(&run_id, vec![started]).await.unwrap(),
            AppendOutcome::SequenceTaken
        );
        assert_eq!(log.load(&run_id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let log = InMemoryEventLog::new();
        let run_id: RunId = "wrun_missing".into();
        assert!(matches!(
            log.load(&run_id, 0).await,
            Err(WorldError::NotFound { .. })
        ));
        assert!(matches!(
            log.append(&run_id, vec![event("wrun_missing", 2, EventKind::RunStarted)])
                .await,
            Err(WorldError::NotFound { .. })
        ));
    }
}
