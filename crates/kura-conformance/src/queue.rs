//! Queue checks: buffering, FIFO dispatch, bounded retry and idempotent restart.

use crate::{RecordingDelivery, WorldFactory};
use kura_core::{Delivery, ItemId, QueueItem, RetryPolicy, Value};
use std::sync::Arc;
use std::time::Duration;

const SETTLE_LIMIT: Duration = Duration::from_secs(10);

fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, Duration::from_millis(2))
}

fn item(id: &str, target: &str) -> QueueItem {
    QueueItem::with_id(id, target, Value::map([("id", Value::from(id))]))
}

/// Nothing is delivered before start; afterwards the buffer drains in FIFO order.
pub async fn buffered_items_deliver_in_order(factory: &dyn WorldFactory) {
    let delivery = RecordingDelivery::new();
    let queue = factory
        .create_queue(Arc::clone(&delivery) as Arc<dyn Delivery>, policy(3))
        .await;

    let ids: Vec<String> = (0..10).map(|index| format!("msg_{index:02}")).collect();
    for id in &ids {
        queue.enqueue(item(id, "callback")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivery.total_attempts(), 0);

    queue.start().await.unwrap();
    delivery
        .wait_until(SETTLE_LIMIT, |d| d.delivered().len() == ids.len())
        .await;
    let delivered: Vec<String> = delivery
        .delivered()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(delivered, ids);

    queue.enqueue(item("msg_after", "callback")).await.unwrap();
    delivery
        .wait_until(SETTLE_LIMIT, |d| d.delivered().len() == ids.len() + 1)
        .await;
    assert_eq!(
        delivery.delivered().last(),
        Some(&ItemId::new("msg_after"))
    );
}

/// Transient failures are retried until the item is acknowledged.
pub async fn transient_failures_are_retried(factory: &dyn WorldFactory) {
    let delivery = RecordingDelivery::new();
    let queue = factory
        .create_queue(Arc::clone(&delivery) as Arc<dyn Delivery>, policy(4))
        .await;
    let id = ItemId::new("msg_flaky");
    delivery.fail_next(&id, 2);

    queue.start().await.unwrap();
    queue.enqueue(item("msg_flaky", "callback")).await.unwrap();
    delivery
        .wait_until(SETTLE_LIMIT, |d| d.delivered().contains(&id))
        .await;
    assert_eq!(delivery.attempts_for(&id), 3);
}

/// A failing item stops after the attempt bound; a rejection is never retried.
pub async fn failure_is_terminal_after_bound(factory: &dyn WorldFactory) {
    let delivery = RecordingDelivery::new();
    let queue = factory
        .create_queue(Arc::clone(&delivery) as Arc<dyn Delivery>, policy(3))
        .await;
    queue.start().await.unwrap();

    let down = ItemId::new("msg_down");
    let rejected = ItemId::new("msg_rejected");
    queue.enqueue(item("msg_down", "down")).await.unwrap();
    queue.enqueue(item("msg_rejected", "reject")).await.unwrap();
    queue.enqueue(item("msg_ok", "callback")).await.unwrap();

    delivery
        .wait_until(SETTLE_LIMIT, |d| d.delivered().contains(&ItemId::new("msg_ok")))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivery.attempts_for(&down), 3);
    assert_eq!(delivery.attempts_for(&rejected), 1);
    assert_eq!(delivery.delivered(), vec![ItemId::new("msg_ok")]);
}

/// Restarting never redelivers an acknowledged item.
pub async fn restart_does_not_redeliver(factory: &dyn WorldFactory) {
    let delivery = RecordingDelivery::new();
    let queue = factory
        .create_queue(Arc::clone(&delivery) as Arc<dyn Delivery>, policy(3))
        .await;
    queue.enqueue(item("msg_once", "callback")).await.unwrap();
    queue.start().await.unwrap();
    let id = ItemId::new("msg_once");
    delivery
        .wait_until(SETTLE_LIMIT, |d| d.delivered().contains(&id))
        .await;

    queue.enqueue(item("msg_once", "callback")).await.unwrap();
    queue.start().await.unwrap();
    queue.enqueue(item("msg_next", "callback")).await.unwrap();
    delivery
        .wait_until(SETTLE_LIMIT, |d| {
            d.delivered().contains(&ItemId::new("msg_next"))
        })
        .await;
    assert_eq!(delivery.attempts_for(&id), 1);
}
