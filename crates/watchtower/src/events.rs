//! Beacon notification feed.
//!
//! Subscribers register for a set of [`Topic`]s and receive matching
//! messages on an unbounded channel. Connection lifecycle notifications go to
//! every subscriber regardless of topics.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stakenode_core::{Epoch, ValidatorPubkey};
use tokio::sync::mpsc;
use tracing::debug;

/// Beacon event topics the watchtower listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "validator.exited")]
    ValidatorExited,
    #[serde(rename = "validator.withdrawable")]
    ValidatorWithdrawable,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::ValidatorExited, Topic::ValidatorWithdrawable];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidatorExited => "validator.exited",
            Self::ValidatorWithdrawable => "validator.withdrawable",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// A validator event pushed by the beacon node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconMessage {
    /// Topic the beacon node published this under.
    pub topic: Topic,
    pub pubkey: ValidatorPubkey,
    /// Epoch the event refers to.
    pub epoch: Epoch,
}

/// Everything the beacon feed delivers to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconNotification {
    /// The feed (re)connected to the beacon node.
    Connected,
    Disconnected { reason: String },
    Message(BeaconMessage),
}

impl BeaconNotification {
    /// `None` for connection lifecycle notifications.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::Message(msg) => Some(msg.topic),
            Self::Connected | Self::Disconnected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription. Dropping it unsubscribes on the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<BeaconNotification>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// `None` once the bus dropped this subscription.
    pub async fn recv(&mut self) -> Option<BeaconNotification> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BeaconNotification> {
        self.receiver.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriptionId,
    topics: HashSet<Topic>,
    sender: mpsc::UnboundedSender<BeaconNotification>,
}

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Fan-out of beacon notifications to topic subscribers.
#[derive(Default)]
pub struct NotificationBus {
    inner: Mutex<BusInner>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to messages on `topics` and to every lifecycle notification.
    pub fn subscribe(&self, topics: impl IntoIterator<Item = Topic>) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        let topics: HashSet<Topic> = topics.into_iter().collect();
        debug!(subscription = id.0, topics = ?topics, "subscribed");
        inner.subscribers.push(Subscriber { id, topics, sender });
        Subscription { id, receiver }
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != id);
        let removed = inner.subscribers.len() != before;
        if removed {
            debug!(subscription = id.0, "unsubscribed");
        }
        removed
    }

    /// Deliver to every matching subscriber, pruning closed ones.
    /// Returns the number of subscribers the notification reached.
    pub fn publish(&self, notification: BeaconNotification) -> usize {
        let topic = notification.topic();
        let mut inner = self.inner.lock();
        let mut delivered = 0;
        inner.subscribers.retain(|s| {
            if s.sender.is_closed() {
                debug!(subscription = s.id.0, "pruning closed subscriber");
                return false;
            }
            let wanted = topic.map_or(true, |t| s.topics.contains(&t));
            if !wanted {
                return true;
            }
            match s.sender.send(notification.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(byte: u8) -> BeaconNotification {
        BeaconNotification::Message(BeaconMessage {
            topic: Topic::ValidatorExited,
            pubkey: ValidatorPubkey::repeat_byte(byte),
            epoch: 10,
        })
    }

    #[test]
    fn test_topic_filtering() {
        let bus = NotificationBus::new();
        let mut exits = bus.subscribe([Topic::ValidatorExited]);
        let mut withdrawals = bus.subscribe([Topic::ValidatorWithdrawable]);

        assert_eq!(bus.publish(exited(1)), 1);
        assert_eq!(exits.try_recv(), Some(exited(1)));
        assert_eq!(withdrawals.try_recv(), None);
    }

    #[test]
    fn test_lifecycle_reaches_everyone() {
        let bus = NotificationBus::new();
        let mut a = bus.subscribe([Topic::ValidatorExited]);
        let mut b = bus.subscribe(Vec::<Topic>::new());

        assert_eq!(bus.publish(BeaconNotification::Connected), 2);
        assert_eq!(a.try_recv(), Some(BeaconNotification::Connected));
        assert_eq!(b.try_recv(), Some(BeaconNotification::Connected));
    }

    #[test]
    fn test_unsubscribe() {
        let bus = NotificationBus::new();
        let sub = bus.subscribe(Topic::ALL);
        assert_eq!(bus.subscriber_count(), 1);

        assert!(bus.unsubscribe(sub.id()));
        assert!(!bus.unsubscribe(sub.id()));
        assert_eq!(bus.publish(exited(1)), 0);
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let bus = NotificationBus::new();
        let kept = bus.subscribe(Topic::ALL);
        drop(bus.subscribe(Topic::ALL));
        assert_eq!(bus.subscriber_count(), 2);

        assert_eq!(bus.publish(exited(1)), 1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_topic_names() {
        assert_eq!("validator.exited".parse::<Topic>().unwrap(), Topic::ValidatorExited);
        assert_eq!(Topic::ValidatorWithdrawable.to_string(), "validator.withdrawable");
        assert!("validator.slashed".parse::<Topic>().is_err());
        assert_eq!(serde_json::to_string(&Topic::ValidatorExited).unwrap(), "\"validator.exited\"");
    }
}
