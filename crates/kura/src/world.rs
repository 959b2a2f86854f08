use crate::config::{BackendConfig, WorldConfig};
use crate::memory;
use crate::queue::{self, LocalQueue};
use kura_core::{Delivery, Result, Storage, Streamer};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// The storage, streamer and queue a workflow engine runs against.
///
/// Storage and streamer are trait objects over the configured backend. The
/// queue is always a [`LocalQueue`], kept concrete so callers can inspect its
/// ledger and wait for it to drain; it coerces to `Arc<dyn Queue>`.
#[derive(Clone)]
pub struct World {
    pub storage: Arc<dyn Storage>,
    pub streamer: Arc<dyn Streamer>,
    pub queue: Arc<LocalQueue>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl World {
    /// Builds the world described by `config`; items are handed to `delivery`.
    ///
    /// The queue is not started.
    pub fn create(config: &WorldConfig, delivery: Arc<dyn Delivery>) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(queue::create_queue(&config.queue, delivery)?);
        let world = match &config.backend {
            BackendConfig::Memory => Self {
                storage: Arc::new(memory::create_storage()),
                streamer: Arc::new(memory::create_streamer()),
                queue,
            },
            #[cfg(feature = "sqlite")]
            BackendConfig::Sqlite {
                path,
                poll_interval_ms,
            } => {
                let db = crate::sqlite::SqliteDatabase::open(path)?;
                Self {
                    storage: Arc::new(crate::engine::EventSourcedStorage::new(
                        crate::sqlite::SqliteEventLog::new(db.clone()),
                    )),
                    streamer: Arc::new(crate::sqlite::SqliteStreamer::new(
                        db,
                        std::time::Duration::from_millis(*poll_interval_ms),
                    )),
                    queue,
                }
            }
            #[cfg(not(feature = "sqlite"))]
            BackendConfig::Sqlite { .. } => {
                return Err(kura_core::WorldError::Configuration(
                    "the sqlite backend needs the `sqlite` feature".to_string(),
                ))
            }
        };
        info!("World created with {:?} backend", config.backend);
        Ok(world)
    }

    /// Builds the world with [`HttpDelivery`](crate::queue::HttpDelivery) to
    /// `config.queue.base_url`.
    #[cfg(feature = "http")]
    pub fn with_http_delivery(config: &WorldConfig) -> Result<Self> {
        let base_url = config.queue.base_url.as_deref().ok_or_else(|| {
            kura_core::WorldError::Configuration("queue.base_url is required".to_string())
        })?;
        Self::create(config, Arc::new(queue::HttpDelivery::new(base_url)))
    }

    /// An in-memory world.
    pub fn in_memory(delivery: Arc<dyn Delivery>) -> Self {
        Self {
            storage: Arc::new(memory::create_storage()),
            streamer: Arc::new(memory::create_streamer()),
            queue: Arc::new(LocalQueue::new(delivery, Default::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::queue::ItemStatus;
    use kura_core::{CreateRun, Queue, QueueItem, Value};

    struct Discard;

    #[async_trait]
    impl Delivery for Discard {
        async fn deliver(&self, _item: &QueueItem) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_world_queue_exposes_its_ledger() {
        let world = World::in_memory(Arc::new(Discard));
        let queue: Arc<dyn Queue> = world.queue.clone();
        queue
            .enqueue(QueueItem::with_id("msg_world", "hooks/a", Value::Null))
            .await
            .unwrap();
        assert_eq!(world.queue.status(&"msg_world".into()), Some(ItemStatus::Buffered));

        queue.start().await.unwrap();
        world.queue.wait_idle().await;
        assert_eq!(
            world.queue.status(&"msg_world".into()),
            Some(ItemStatus::Acknowledged { attempts: 1 })
        );
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_sqlite_world_shares_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorldConfig::sqlite(dir.path().join("world.db"));
        let world = World::create(&config, Arc::new(Discard)).unwrap();
        let run = world
            .storage
            .create_run(CreateRun::new("wf", Value::Null))
            .await
            .unwrap();
        world
            .streamer
            .write_to_stream("out", &run.run_id, "hi".into())
            .await
            .unwrap();

        let reopened = World::create(&config, Arc::new(Discard)).unwrap();
        assert_eq!(reopened.storage.list_runs().await.unwrap().len(), 1);
        assert_eq!(
            reopened.streamer.list_streams(&run.run_id).await.unwrap(),
            vec!["out".to_string()]
        );
    }

    #[cfg(feature = "http")]
    #[test]
    fn test_http_world_requires_base_url() {
        let result = World::with_http_delivery(&WorldConfig::memory());
        assert!(matches!(
            result,
            Err(kura_core::WorldError::Configuration(_))
        ));
    }
}
