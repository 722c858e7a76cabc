//! Stakenode Watchtower
//!
//! Oracle nodes report minipool logouts and withdrawals for the whole
//! network. [`WatchtowerController`] turns that duty on and off as the
//! node's trusted status changes, and reacts to beacon notifications between
//! scheduled cycles.

pub mod controller;
pub mod events;

pub use controller::{TrustState, WatchtowerConfig, WatchtowerController};
pub use events::{
    BeaconMessage, BeaconNotification, NotificationBus, Subscription, SubscriptionId, Topic, UnknownTopic,
};
