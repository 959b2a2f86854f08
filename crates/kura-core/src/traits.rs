//! The world contract: storage, streaming and queue traits.
//!
//! Every backend implements these traits; the conformance suite exercises
//! them through trait objects only.

use crate::error::Result;
use crate::event::{Event, StepEventKind};
use crate::ids::{HookId, ItemId, RunId, StepId};
use crate::model::{CreateRun, Hook, Run, Step};
use crate::stream::ChunkStream;
use crate::value::{FailureCause, Value};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Event-sourced run, step and hook storage.
///
/// Reads return independent copies; appends for one run are linearizable.
///
/// # Examples
///
/// ```ignore
/// use kura_core::{CreateRun, StepEventKind, Storage, Value};
///
/// async fn record(storage: &dyn Storage) -> kura_core::Result<()> {
///     let run = storage.create_run(CreateRun::new("report", Value::Null)).await?;
///     let step = "step_fetch".into();
///     storage
///         .append_step_event(&run.run_id, &step, StepEventKind::Started, Value::Null)
///         .await?;
///     storage
///         .append_step_event(&run.run_id, &step, StepEventKind::Completed, Value::Int(42))
///         .await?;
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates a run with a `run_created` event.
    ///
    /// Fails with `AlreadyExists` when a caller-supplied id is already taken.
    async fn create_run(&self, request: CreateRun) -> Result<Run>;

    async fn get_run(&self, run_id: &RunId) -> Result<Run>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<Run>>;

    async fn start_run(&self, run_id: &RunId) -> Result<Run>;

    /// Completes the run and cancels its pending hooks.
    async fn complete_run(&self, run_id: &RunId, output: Value) -> Result<Run>;

    /// Fails the run and cancels its pending hooks.
    async fn fail_run(&self, run_id: &RunId, cause: FailureCause) -> Result<Run>;

    /// Cancels the run and its pending hooks.
    async fn cancel_run(&self, run_id: &RunId) -> Result<Run>;

    /// Appends a step transition and returns the step's resulting state.
    ///
    /// Repeating a terminal transition with the same payload is a replay and
    /// returns the stored step; a different outcome fails with `Conflict`.
    async fn append_step_event(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        kind: StepEventKind,
        payload: Value,
    ) -> Result<Step>;

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> Result<Step>;

    /// Steps in invocation order.
    async fn list_steps(&self, run_id: &RunId) -> Result<Vec<Step>>;

    /// The run's full event log in sequence order.
    async fn list_events(&self, run_id: &RunId) -> Result<Vec<Event>>;

    async fn register_hook(&self, run_id: &RunId, hook_id: &HookId, metadata: Value)
        -> Result<Hook>;

    /// Resolves a pending hook. Resolving a settled hook is a no-op.
    async fn resolve_hook(&self, run_id: &RunId, hook_id: &HookId, payload: Value)
        -> Result<Hook>;

    /// Cancels a pending hook. Cancelling a settled hook is a no-op.
    async fn cancel_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook>;

    /// Cancels every pending hook of the run, returning the hooks it cancelled.
    async fn cleanup_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>>;

    async fn get_hook(&self, run_id: &RunId, hook_id: &HookId) -> Result<Hook>;

    /// Hooks in registration order.
    async fn list_hooks(&self, run_id: &RunId) -> Result<Vec<Hook>>;
}

/// Named, append-only byte streams.
///
/// Operations on one stream name are serialized: a write that returned is
/// visible to every later close and read.
#[async_trait]
pub trait Streamer: Send + Sync {
    /// Appends one chunk. Fails with `StreamClosed` after close.
    async fn write_to_stream(&self, name: &str, owner: &RunId, chunk: Bytes) -> Result<()>;

    /// Closes the stream. Closing twice is a no-op.
    async fn close_stream(&self, name: &str, owner: &RunId) -> Result<()>;

    /// Reads the stream from its first chunk.
    async fn read_from_stream(&self, name: &str) -> Result<ChunkStream>;

    /// Names of the streams written or closed by `owner`, sorted.
    async fn list_streams(&self, owner: &RunId) -> Result<Vec<String>>;

    /// Readers of `name` currently attached in this process.
    fn subscriber_count(&self, name: &str) -> usize;
}

/// A unit of work delivered by a [`Queue`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Idempotency key: an acknowledged id is never delivered again.
    pub id: ItemId,
    /// Where the item is delivered, e.g. a callback path.
    pub target: String,
    pub payload: Value,
}

impl QueueItem {
    pub fn new(target: impl Into<String>, payload: Value) -> Result<Self> {
        Ok(Self {
            id: ItemId::generate()?,
            target: target.into(),
            payload,
        })
    }

    pub fn with_id(id: impl Into<ItemId>, target: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            payload,
        }
    }
}

/// Buffer-then-deliver work queue with at-least-once delivery.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Buffers the item until [`start`](Queue::start), then dispatches immediately.
    async fn enqueue(&self, item: QueueItem) -> Result<()>;

    /// Activates the queue and dispatches buffered items in FIFO order.
    async fn start(&self) -> Result<()>;
}

/// Delivers one queue item, typically as an HTTP callback.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Returns `Transient` for failures worth retrying.
    async fn deliver(&self, item: &QueueItem) -> Result<()>;
}
