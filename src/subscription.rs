//! # Commit Subscriptions
//!
//! Every committed transaction broadcasts one [`CommitNotification`] per
//! version it advanced. Subscribers receive them live; there is no catch-up
//! phase because the commit graph itself is the history.
//!
//! ```text
//!   Transaction::commit ──► SubscriptionManager::broadcast ──► broadcast channel
//!                                                               │    │    │
//!                                                        CommitSubscription (x N)
//! ```
//!
//! ## Backpressure Handling
//!
//! The broadcast channel is bounded. A subscriber that falls behind gets
//! `Error::SubscriptionLagged(n)` once and then continues with the newest
//! notifications.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::{CommitId, VersionId};

/// Default capacity of the notification channel.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// A version moved to a new commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitNotification {
    pub version_id: VersionId,
    pub commit_id: CommitId,
    /// Schemas with changes in the commit, sorted.
    pub schema_keys: Vec<String>,
}

/// Owns the broadcast sender.
#[derive(Debug)]
pub struct SubscriptionManager {
    tx: broadcast::Sender<CommitNotification>,
}

impl SubscriptionManager {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns a new subscription, optionally limited to one version.
    pub fn subscribe(&self, version: Option<VersionId>) -> CommitSubscription {
        CommitSubscription {
            receiver: self.tx.subscribe(),
            version,
        }
    }

    /// Sends notifications. With no subscribers this is a no-op.
    pub fn broadcast(&self, notifications: Vec<CommitNotification>) {
        for notification in notifications {
            let _ = self.tx.send(notification);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A live stream of commit notifications.
pub struct CommitSubscription {
    receiver: broadcast::Receiver<CommitNotification>,
    version: Option<VersionId>,
}

impl CommitSubscription {
    /// Receives the next notification.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(n))` - next notification
    /// - `Some(Err(e))` - the subscriber lagged
    /// - `None` - the engine shut down
    pub async fn next(&mut self) -> Option<Result<CommitNotification>> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => {
                    if let Some(ref version) = self.version {
                        if &notification.version_id != version {
                            continue;
                        }
                    }
                    return Some(Ok(notification));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(version: &str, commit: &str) -> CommitNotification {
        CommitNotification {
            version_id: VersionId::new(version),
            commit_id: CommitId::new(commit),
            schema_keys: vec!["lix_key_value".to_string()],
        }
    }

    #[tokio::test]
    async fn test_subscription_receives_and_filters() {
        let manager = SubscriptionManager::new(16);
        let mut all = manager.subscribe(None);
        let mut main_only = manager.subscribe(Some(VersionId::new("main")));
        assert_eq!(manager.subscriber_count(), 2);

        manager.broadcast(vec![notification("global", "c1"), notification("main", "c2")]);

        assert_eq!(all.next().await.unwrap().unwrap().commit_id, CommitId::new("c1"));
        assert_eq!(all.next().await.unwrap().unwrap().commit_id, CommitId::new("c2"));
        assert_eq!(
            main_only.next().await.unwrap().unwrap().commit_id,
            CommitId::new("c2")
        );
    }

    #[tokio::test]
    async fn test_lagged_and_closed() {
        let manager = SubscriptionManager::new(2);
        let mut sub = manager.subscribe(None);
        manager.broadcast((0..5).map(|i| notification("main", &format!("c{i}"))).collect());

        assert!(matches!(sub.next().await, Some(Err(Error::SubscriptionLagged(_)))));
        assert!(sub.next().await.unwrap().is_ok());

        drop(manager);
        assert!(sub.next().await.unwrap().is_ok());
        assert!(sub.next().await.is_none());
    }
}
