//! Buffer-then-deliver work queue.
//!
//! Items enqueued before [`Queue::start`] are held in a buffer; once started,
//! one dispatcher task delivers items in the order they were dispatched,
//! retrying transient failures according to the queue's [`RetryPolicy`].

#[cfg(feature = "http")]
mod http;

#[cfg(feature = "http")]
pub use http::{HttpDelivery, ITEM_ID_HEADER};

use crate::config::QueueConfig;
use async_trait::async_trait;
use kura_core::{value, Delivery, ItemId, Queue, QueueItem, Result, RetryPolicy, WorldError};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Where an item stands in the queue's ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    /// Waiting for the queue to start or for the dispatcher to reach it.
    Buffered,
    InFlight { attempt: u32 },
    /// Delivered; the id is never delivered again.
    Acknowledged { attempts: u32 },
    /// Gave up. A later `start` or re-enqueue tries again.
    Failed { attempts: u32, error: WorldError },
}

impl ItemStatus {
    fn name(&self) -> &'static str {
        match self {
            ItemStatus::Buffered => "buffered",
            ItemStatus::InFlight { .. } => "in flight",
            ItemStatus::Acknowledged { .. } => "acknowledged",
            ItemStatus::Failed { .. } => "failed",
        }
    }
}

struct Entry {
    item: QueueItem,
    status: ItemStatus,
}

#[derive(Default)]
struct Ledger {
    entries: HashMap<ItemId, Entry>,
    order: Vec<ItemId>,
    buffer: VecDeque<ItemId>,
    dispatch: Option<mpsc::UnboundedSender<ItemId>>,
}

struct Shared {
    delivery: Arc<dyn Delivery>,
    policy: RetryPolicy,
    ledger: Mutex<Ledger>,
    outstanding: watch::Sender<usize>,
}

impl Shared {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands `id` to the dispatcher, or buffers it until the queue starts.
    fn dispatch(&self, ledger: &mut Ledger, id: ItemId) {
        let Some(sender) = ledger.dispatch.as_ref() else {
            ledger.buffer.push_back(id);
            return;
        };
        self.outstanding.send_modify(|count| *count += 1);
        if let Err(mpsc::error::SendError(id)) = sender.send(id) {
            self.outstanding
                .send_modify(|count| *count = count.saturating_sub(1));
            ledger.buffer.push_back(id);
        }
    }

    fn set_status(&self, id: &ItemId, status: ItemStatus) {
        if let Some(entry) = self.ledger().entries.get_mut(id) {
            entry.status = status;
        }
    }

    async fn process(&self, id: &ItemId) {
        let item = {
            let mut ledger = self.ledger();
            match ledger.entries.get_mut(id) {
                Some(entry) if entry.status == ItemStatus::Buffered => {
                    entry.status = ItemStatus::InFlight { attempt: 1 };
                    entry.item.clone()
                }
                _ => return,
            }
        };
        let status = self.deliver_with_retry(&item).await;
        self.set_status(id, status);
    }

    async fn deliver_with_retry(&self, item: &QueueItem) -> ItemStatus {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            self.set_status(&item.id, ItemStatus::InFlight { attempt });
            match self.delivery.deliver(item).await {
                Ok(()) => {
                    info!(
                        "Item '{}' delivered to '{}' on attempt {}",
                        item.id, item.target, attempt
                    );
                    return ItemStatus::Acknowledged { attempts: attempt };
                }
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    self.log_and_wait_for_retry(item, attempt, &error).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        "Item '{}' to '{}' failed after {} attempt(s): {}",
                        item.id, item.target, attempt, error
                    );
                    return ItemStatus::Failed {
                        attempts: attempt,
                        error: WorldError::Delivery {
                            item_id: item.id.to_string(),
                            attempts: attempt,
                            details: error.to_string(),
                        },
                    };
                }
            }
        }
    }

    async fn log_and_wait_for_retry(&self, item: &QueueItem, attempt: u32, reason: &WorldError) {
        info!(
            "Item '{}' failed: {}, retrying ({}/{})",
            item.id,
            reason,
            attempt + 1,
            self.policy.max_attempts()
        );
        let delay = self.policy.delay_after(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn run_dispatcher(shared: Weak<Shared>, mut receiver: mpsc::UnboundedReceiver<ItemId>) {
    while let Some(id) = receiver.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.process(&id).await;
        shared
            .outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }
    debug!("Queue dispatcher stopped");
}

/// In-process [`Queue`] with a delivery ledger.
///
/// Delivery is at-least-once: a transient failure is retried, and an item is
/// acknowledged only after its delivery succeeded. Acknowledged ids are
/// remembered, so enqueueing one again is a no-op.
#[derive(Clone)]
pub struct LocalQueue {
    shared: Arc<Shared>,
}

impl fmt::Debug for LocalQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalQueue")
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

impl LocalQueue {
    pub fn new(delivery: Arc<dyn Delivery>, policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                delivery,
                policy,
                ledger: Mutex::new(Ledger::default()),
                outstanding: watch::Sender::new(0),
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.shared.ledger().dispatch.is_some()
    }

    pub fn status(&self, id: &ItemId) -> Option<ItemStatus> {
        self.shared
            .ledger()
            .entries
            .get(id)
            .map(|entry| entry.status.clone())
    }

    /// Waits until every dispatched item is acknowledged or failed.
    ///
    /// Items still buffered because the queue was never started do not count.
    pub async fn wait_idle(&self) {
        let mut outstanding = self.shared.outstanding.subscribe();
        let _ = outstanding.wait_for(|count| *count == 0).await;
    }
}

#[async_trait]
impl Queue for LocalQueue {
    async fn enqueue(&self, item: QueueItem) -> Result<()> {
        value::validate(&item.payload)?;
        let mut ledger = self.shared.ledger();
        let id = item.id.clone();
        match ledger.entries.get_mut(&id) {
            Some(entry) if matches!(entry.status, ItemStatus::Failed { .. }) => {
                entry.item = item;
                entry.status = ItemStatus::Buffered;
            }
            Some(entry) => {
                debug!("Item '{}' is already {}, ignoring", id, entry.status.name());
                return Ok(());
            }
            None => {
                ledger.order.push(id.clone());
                ledger.entries.insert(
                    id.clone(),
                    Entry {
                        item,
                        status: ItemStatus::Buffered,
                    },
                );
            }
        }
        debug!("Item '{}' enqueued", id);
        self.shared.dispatch(&mut ledger, id);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut ledger = self.shared.ledger();
        if ledger.dispatch.is_none() {
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatcher(Arc::downgrade(&self.shared), receiver));
            ledger.dispatch = Some(sender);
            info!("Queue started with {} buffered item(s)", ledger.buffer.len());
        }

        let failed: Vec<ItemId> = ledger
            .order
            .iter()
            .filter(|id| {
                ledger
                    .entries
                    .get(*id)
                    .is_some_and(|entry| matches!(entry.status, ItemStatus::Failed { .. }))
            })
            .cloned()
            .collect();
        for id in failed {
            if let Some(entry) = ledger.entries.get_mut(&id) {
                entry.status = ItemStatus::Buffered;
            }
            ledger.buffer.push_back(id);
        }

        let pending: Vec<ItemId> = ledger.buffer.drain(..).collect();
        for id in pending {
            self.shared.dispatch(&mut ledger, id);
        }
        Ok(())
    }
}

/// Builds a [`LocalQueue`] with the retry policy from `config`.
pub fn create_queue(config: &QueueConfig, delivery: Arc<dyn Delivery>) -> Result<LocalQueue> {
    Ok(LocalQueue::new(delivery, config.retry_policy()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kura_core::Value;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        delivered: Mutex<Vec<String>>,
        transient_failures: AtomicU32,
    }

    #[async_trait]
    impl Delivery for Recorder {
        async fn deliver(&self, item: &QueueItem) -> Result<()> {
            if item.target == "reject" {
                return Err(WorldError::Codec("bad payload".to_string()));
            }
            if self.transient_failures.load(Ordering::SeqCst) > 0 {
                self.transient_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(WorldError::transient("connection reset"));
            }
            self.delivered.lock().unwrap().push(item.id.to_string());
            Ok(())
        }
    }

    fn queue(recorder: &Arc<Recorder>) -> LocalQueue {
        LocalQueue::new(
            Arc::clone(recorder) as Arc<dyn Delivery>,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_items_wait_for_start() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue
            .enqueue(QueueItem::with_id("msg_1", "callback", Value::Null))
            .await
            .unwrap();
        queue.wait_idle().await;
        assert!(recorder.delivered.lock().unwrap().is_empty());
        assert_eq!(queue.status(&"msg_1".into()), Some(ItemStatus::Buffered));

        queue.start().await.unwrap();
        queue.wait_idle().await;
        assert_eq!(*recorder.delivered.lock().unwrap(), vec!["msg_1"]);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let recorder = Arc::new(Recorder::default());
        recorder.transient_failures.store(2, Ordering::SeqCst);
        let queue = queue(&recorder);
        queue.start().await.unwrap();
        queue
            .enqueue(QueueItem::with_id("msg_1", "callback", Value::Null))
            .await
            .unwrap();
        queue.wait_idle().await;
        assert_eq!(
            queue.status(&"msg_1".into()),
            Some(ItemStatus::Acknowledged { attempts: 3 })
        );
    }

    #[tokio::test]
    async fn test_terminal_failure_is_not_retried() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.start().await.unwrap();
        queue
            .enqueue(QueueItem::with_id("msg_1", "reject", Value::Null))
            .await
            .unwrap();
        queue.wait_idle().await;
        assert!(matches!(
            queue.status(&"msg_1".into()),
            Some(ItemStatus::Failed {
                attempts: 1,
                error: WorldError::Delivery { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_acknowledged_item_is_not_redelivered() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue(&recorder);
        queue.start().await.unwrap();
        let item = QueueItem::with_id("msg_1", "callback", Value::Null);
        queue.enqueue(item.clone()).await.unwrap();
        queue.wait_idle().await;

        queue.enqueue(item).await.unwrap();
        queue.start().await.unwrap();
        queue.wait_idle().await;
        assert_eq!(recorder.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restart_retries_failed_items() {
        let recorder = Arc::new(Recorder::default());
        recorder.transient_failures.store(3, Ordering::SeqCst);
        let queue = queue(&recorder);
        queue.start().await.unwrap();
        queue
            .enqueue(QueueItem::with_id("msg_1", "callback", Value::Null))
            .await
            .unwrap();
        queue.wait_idle().await;
        assert!(matches!(
            queue.status(&"msg_1".into()),
            Some(ItemStatus::Failed { attempts: 3, .. })
        ));

        queue.start().await.unwrap();
        queue.wait_idle().await;
        assert_eq!(
            queue.status(&"msg_1".into()),
            Some(ItemStatus::Acknowledged { attempts: 1 })
        );
    }
}
