//! Core contract for kura workflow worlds.
//!
//! This crate defines what every backend must satisfy and holds no backend
//! code. The `kura` crate provides the backends.
//!
//! # Core Types
//!
//! - [`Event`] / [`EventKind`] - the append-only history of a run
//! - [`RunAggregate`] - folds events into [`Run`], [`Step`] and [`Hook`] state
//! - [`Value`] - structured, byte-exact payloads
//! - [`WorldError`] - error taxonomy shared by all backends
//!
//! # Traits
//!
//! - [`Storage`] - event-sourced run/step/hook storage
//! - [`Streamer`] - named byte streams read with [`ChunkStream`]
//! - [`Queue`] and [`Delivery`] - buffered callback delivery

mod error;
mod event;
mod ids;
mod materializer;
mod model;
mod retry;
mod stream;
mod traits;
pub mod value;

pub use error::{EntityKind, ErrorKind, Result, WorldError};
pub use event::{Event, EventKind, StepEventKind};
pub use ids::{next_ulid, HookId, ItemId, RunId, StepId};
pub use materializer::{Admission, RunAggregate};
pub use model::{CreateRun, Hook, HookStatus, Run, RunStatus, Step, StepStatus};
pub use retry::{Backoff, RetryPolicy};
pub use stream::ChunkStream;
pub use traits::{Delivery, Queue, QueueItem, Storage, Streamer};
pub use value::{FailureCause, Value};

pub use bytes::Bytes;
