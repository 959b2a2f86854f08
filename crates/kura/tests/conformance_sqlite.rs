#![cfg(feature = "sqlite")]

use async_trait::async_trait;
use kura::{sqlite, Delivery, LocalQueue, Queue, RetryPolicy, Storage, Streamer};
use kura_conformance::WorldFactory;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// One database file per check, shared by its storage and streamer.
struct SqliteWorld {
    dir: TempDir,
}

impl SqliteWorld {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    fn path(&self) -> PathBuf {
        self.dir.path().join("world.db")
    }
}

#[async_trait]
impl WorldFactory for SqliteWorld {
    async fn create_storage(&self) -> Arc<dyn Storage> {
        Arc::new(sqlite::create_storage(self.path()).expect("open sqlite storage"))
    }

    async fn create_streamer(&self) -> Arc<dyn Streamer> {
        Arc::new(
            sqlite::create_streamer(self.path(), Duration::from_millis(20))
                .expect("open sqlite streamer"),
        )
    }

    async fn create_queue(&self, delivery: Arc<dyn Delivery>, policy: RetryPolicy) -> Arc<dyn Queue> {
        Arc::new(LocalQueue::new(delivery, policy))
    }
}

kura_conformance::conformance_tests!(SqliteWorld::new());
