//! The append-only event log seam under [`EventSourcedStorage`](crate::EventSourcedStorage).

use async_trait::async_trait;
use kura_core::{Event, Result, RunId};

/// Outcome of an optimistic append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Another writer already holds the first sequence of the batch; reload and retry.
    SequenceTaken,
}

/// Durable storage of per-run event logs.
///
/// Implementations only store and return events. Sequencing and admission
/// are decided by the engine; a log must only guarantee that a batch lands
/// atomically and exactly after the current head.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Stores the `run_created` event of a new run.
    ///
    /// Fails with `AlreadyExists` when the run already has a history.
    async fn create(&self, first: Event) -> Result<()>;

    /// Appends a batch whose first sequence must be `head + 1`.
    ///
    /// Fails with `NotFound` for unknown runs.
    async fn append(&self, run_id: &RunId, events: Vec<Event>) -> Result<AppendOutcome>;

    /// Events with a sequence greater than `after`, in order.
    ///
    /// Fails with `NotFound` when the run has no history at all.
    async fn load(&self, run_id: &RunId, after: u64) -> Result<Vec<Event>>;

    /// Every run with a history.
    async fn run_ids(&self) -> Result<Vec<RunId>>;
}
