//! Durable worlds for step-based workflow engines.
//!
//! A [`World`] bundles event-sourced [`Storage`], named byte streams and a
//! buffered callback [`Queue`], backed by memory or a SQLite file.
//!
//! # Example
//!
//! ```rust,ignore
//! use kura::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> kura::Result<()> {
//!     let world = World::create(&WorldConfig::from_env()?, Arc::new(HttpDelivery::new("http://localhost:3000")))?;
//!
//!     let run = world.storage.create_run(CreateRun::new("report", Value::Null)).await?;
//!     world.storage.start_run(&run.run_id).await?;
//!
//!     world.streamer.write_to_stream("report/out", &run.run_id, "working\n".into()).await?;
//!     world.streamer.close_stream("report/out", &run.run_id).await?;
//!
//!     world.storage.complete_run(&run.run_id, Value::from("done")).await?;
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
mod locks;
mod log;
pub mod memory;
pub mod queue;
mod signals;
#[cfg(feature = "sqlite")]
pub mod sqlite;
mod world;

// Re-export the contract
pub use kura_core::*;

pub use config::{BackendConfig, QueueConfig, WorldConfig};
pub use engine::EventSourcedStorage;
pub use log::{AppendOutcome, EventLog};
pub use queue::{ItemStatus, LocalQueue};
pub use world::World;

/// Prelude for convenient imports.
pub mod prelude {
    #[cfg(feature = "http")]
    pub use crate::queue::HttpDelivery;
    pub use crate::{
        ChunkStream, CreateRun, Delivery, FailureCause, HookId, LocalQueue, Queue, QueueItem,
        RetryPolicy, RunId, StepEventKind, StepId, Storage, Streamer, Value, World, WorldConfig,
        WorldError,
    };
}
