use async_trait::async_trait;
use kura::{memory, Delivery, LocalQueue, Queue, RetryPolicy, Storage, Streamer};
use kura_conformance::WorldFactory;
use std::sync::Arc;

struct MemoryWorld;

#[async_trait]
impl WorldFactory for MemoryWorld {
    async fn create_storage(&self) -> Arc<dyn Storage> {
        Arc::new(memory::create_storage())
    }

    async fn create_streamer(&self) -> Arc<dyn Streamer> {
        Arc::new(memory::create_streamer())
    }

    async fn create_queue(&self, delivery: Arc<dyn Delivery>, policy: RetryPolicy) -> Arc<dyn Queue> {
        Arc::new(LocalQueue::new(delivery, policy))
    }
}

kura_conformance::conformance_tests!(MemoryWorld);
