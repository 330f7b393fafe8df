//! # Notifier Registrations and the Change Feed
//!
//! Waiting is modelled as a registration that someone else deletes:
//!
//! ```text
//!  poller                      partition                       publisher
//!    │  poll → drained           │                                │
//!    │  (register n7 on page)    │                                │
//!    │──────────────────────────►│                                │
//!    │                           │◄───────────── offer ───────────│
//!    │                           │  take page notifiers [n7]      │
//!    │                           │  delete registration n7        │
//!    │◄═════ Notification(p, n7) ═══ broadcast                    │
//!    │  poll again               │                                │
//! ```
//!
//! Registration and delivery are not atomic. A waiter can be woken with
//! nothing new to read, or miss a wake-up and fall back to its timeout. It
//! must re-check state after every wake-up either way.
//!
//! ## Rust Concepts
//!
//! - **`tokio::sync::broadcast`**: every listener sees every notification and
//!   filters for its own notifier id. A lagging listener treats the lag as a
//!   wake-up, which is always safe.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::types::{NotifierId, PartitionId};

/// Capacity of the notification broadcast channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 4096;

// =============================================================================
// Notification
// =============================================================================

/// A fired notifier: the registration `(partition, notifier)` was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub partition: PartitionId,
    pub notifier: NotifierId,
}

// =============================================================================
// Hub
// =============================================================================

/// Fan-out point for fired notifiers, shared by all partitions of a topic.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Notification>,
}

impl NotificationHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_NOTIFICATION_CAPACITY);
        Self { tx }
    }

    /// Publishes a fired notifier. Having no listener is fine.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }

    /// A listener that sees every notification published from now on.
    ///
    /// Subscribe *before* issuing the operation that registers the notifier,
    /// or the wake-up may be missed.
    pub fn listen(&self) -> NotificationListener {
        NotificationListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the hub.
#[derive(Debug)]
pub struct NotificationListener {
    rx: broadcast::Receiver<Notification>,
}

impl NotificationListener {
    /// Waits until `notifier` fires in any partition, or `timeout` passes.
    ///
    /// Returns `true` on a wake-up (real, or a lag that may have hidden one)
    /// and `false` on timeout or when the hub is gone.
    pub async fn wait_for(&mut self, notifier: NotifierId, timeout: Duration) -> bool {
        let wait = async {
            loop {
                match self.rx.recv().await {
                    Ok(n) if n.notifier == notifier => return true,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => return true,
                    Err(RecvError::Closed) => return false,
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Drains notifications already queued, returning true if `notifier`
    /// was among them.
    pub fn drain_for(&mut self, notifier: NotifierId) -> bool {
        let mut seen = false;
        loop {
            match self.rx.try_recv() {
                Ok(n) => seen |= n.notifier == notifier,
                Err(broadcast::error::TryRecvError::Lagged(_)) => seen = true,
                Err(_) => return seen,
            }
        }
    }
}

// =============================================================================
// Registrations
// =============================================================================

/// A partition's live notifier registrations with their expiry instants.
///
/// Registrations are ephemeral; they are not persisted and do not survive
/// a restart.
#[derive(Debug, Default)]
pub struct NotifierRegistry {
    entries: HashMap<NotifierId, Instant>,
    expiry: Duration,
}

impl NotifierRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            expiry,
        }
    }

    /// Creates or refreshes a registration.
    pub fn register(&mut self, notifier: NotifierId, now: Instant) {
        self.entries.insert(notifier, now + self.expiry);
    }

    /// Deletes a registration. Returns true if it existed (and so fired).
    pub fn fire(&mut self, notifier: NotifierId) -> bool {
        self.entries.remove(&notifier).is_some()
    }

    /// Deletes and returns every registration that has expired.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<NotifierId> {
        let expired: Vec<NotifierId> = self
            .entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.entries.remove(id);
        }
        expired
    }

    pub fn is_registered(&self, notifier: NotifierId) -> bool {
        self.entries.contains_key(&notifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NotifierId {
        NotifierId::from_raw(id)
    }

    #[test]
    fn test_fire_only_once() {
        let mut registry = NotifierRegistry::new(Duration::from_secs(10));
        registry.register(n(1), Instant::now());
        assert!(registry.fire(n(1)));
        assert!(!registry.fire(n(1)));
    }

    #[test]
    fn test_sweep_expired() {
        let mut registry = NotifierRegistry::new(Duration::from_millis(5));
        let start = Instant::now();
        registry.register(n(1), start);
        registry.register(n(2), start + Duration::from_secs(1));

        let expired = registry.sweep_expired(start + Duration::from_millis(10));
        assert_eq!(expired, vec![n(1)]);
        assert!(registry.is_registered(n(2)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_wakes_for_its_notifier() {
        let hub = NotificationHub::new();
        let mut listener = hub.listen();

        hub.publish(Notification {
            partition: PartitionId::from_raw(0),
            notifier: n(3),
        });
        hub.publish(Notification {
            partition: PartitionId::from_raw(1),
            notifier: n(9),
        });

        assert!(listener.wait_for(n(9), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_listener_times_out() {
        let hub = NotificationHub::new();
        let mut listener = hub.listen();
        assert!(!listener.wait_for(n(1), Duration::from_millis(20)).await);
    }

    #[test]
    fn test_drain_for() {
        let hub = NotificationHub::new();
        let mut listener = hub.listen();
        hub.publish(Notification {
            partition: PartitionId::from_raw(0),
            notifier: n(4),
        });
        assert!(listener.drain_for(n(4)));
        assert!(!listener.drain_for(n(4)));
    }
}
