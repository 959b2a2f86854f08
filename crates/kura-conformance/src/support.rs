use async_trait::async_trait;
use kura_core::{Delivery, ItemId, QueueItem, Result, WorldError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A [`Delivery`] that records every attempt and fails on demand.
///
/// Items targeting `"down"` always fail transiently and items targeting
/// `"reject"` always fail terminally. [`fail_next`](Self::fail_next) makes the
/// next attempts of one item fail transiently.
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    attempts: Mutex<Vec<ItemId>>,
    delivered: Mutex<Vec<ItemId>>,
    failures: Mutex<HashMap<ItemId, u32>>,
}

impl RecordingDelivery {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, id: &ItemId, times: u32) {
        self.failures.lock().unwrap().insert(id.clone(), times);
    }

    /// Successfully delivered ids, in delivery order.
    pub fn delivered(&self) -> Vec<ItemId> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn attempts_for(&self, id: &ItemId) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|attempt| *attempt == id)
            .count()
    }

    pub fn total_attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Polls until `done` holds, panicking after `limit`.
    pub async fn wait_until(&self, limit: Duration, done: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + limit;
        while !done(self) {
            assert!(
                Instant::now() < deadline,
                "delivery did not settle within {limit:?}: {} attempt(s), delivered {:?}",
                self.total_attempts(),
                self.delivered()
            );
            sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, item: &QueueItem) -> Result<()> {
        self.attempts.lock().unwrap().push(item.id.clone());
        match item.target.as_str() {
            "down" => return Err(WorldError::transient("callback endpoint unavailable")),
            "reject" => {
                return Err(WorldError::Delivery {
                    item_id: item.id.to_string(),
                    attempts: 1,
                    details: "callback rejected the item".to_string(),
                })
            }
            _ => {}
        }
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&item.id).filter(|n| **n > 0) {
                *remaining -= 1;
                return Err(WorldError::transient("connection reset"));
            }
        }
        self.delivered.lock().unwrap().push(item.id.clone());
        Ok(())
    }
}
