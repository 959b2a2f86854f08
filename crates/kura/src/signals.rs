//! Wake-ups for blocked stream readers.
//!
//! Readers subscribe before they look at the stream and writers notify after
//! their chunk is visible, so a write can never slip between a reader's check
//! and its wait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Per-stream notification channels, created by the first subscriber and
/// dropped with the last.
#[derive(Debug, Clone, Default)]
pub(crate) struct StreamSignals {
    senders: Arc<Mutex<HashMap<String, watch::Sender<u64>>>>,
}

impl StreamSignals {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscribe(&self, name: &str) -> Subscription {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = senders
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe();
        Subscription {
            name: name.to_string(),
            receiver: Some(receiver),
            signals: self.clone(),
        }
    }

    /// Wakes every reader of `name`. Without readers this is a no-op.
    pub(crate) fn notify(&self, name: &str) {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = senders.get(name) {
            sender.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    /// Number of live readers of `name`.
    pub(crate) fn subscriber_count(&self, name: &str) -> usize {
        let senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        senders.get(name).map_or(0, watch::Sender::receiver_count)
    }
}

/// A reader's registration; dropping it unregisters the reader.
#[derive(Debug)]
pub(crate) struct Subscription {
    name: String,
    receiver: Option<watch::Receiver<u64>>,
    signals: StreamSignals,
}

impl Subscription {
    /// Waits for a notification newer than the last one seen.
    pub(crate) async fn changed(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            // The sender lives as long as this receiver, so this only
            // returns on a notification.
            let _ = receiver.changed().await;
        }
    }

    /// Waits for a notification or `interval`, whichever comes first.
    pub(crate) async fn changed_within(&mut self, interval: Duration) {
        let _ = tokio::time::timeout(interval, self.changed()).await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.receiver.take());
        let mut senders = self
            .signals
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if senders
            .get(&self.name)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            senders.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_notify_wakes_subscriber() {
        let signals = StreamSignals::new();
        let mut subscription = signals.subscribe("out");
        let mut waiting = task::spawn(subscription.changed());
        assert_pending!(waiting.poll());

        signals.notify("out");
        assert!(waiting.is_woken());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_notify_before_wait_is_not_lost() {
        let signals = StreamSignals::new();
        let mut subscription = signals.subscribe("out");
        signals.notify("out");
        let mut waiting = task::spawn(subscription.changed());
        assert_ready!(waiting.poll());
    }

    #[test]
    fn test_dropping_last_subscription_releases_channel() {
        let signals = StreamSignals::new();
        let first = signals.subscribe("out");
        let second = signals.subscribe("out");
        assert_eq!(signals.subscriber_count("out"), 2);
        drop(first);
        assert_eq!(signals.subscriber_count("out"), 1);
        drop(second);
        assert_eq!(signals.subscriber_count("out"), 0);
        assert!(signals
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty());
    }
}
