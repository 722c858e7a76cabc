//! Trust-gated watchtower duty.
//!
//! The controller polls the node's oracle membership. While the node is
//! trusted it ticks the watchtower pipeline and listens for beacon
//! notifications; otherwise both are off. Losing trust stops new work only,
//! cycles already running complete.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stakenode_core::NodeAddress;
use stakenode_minipool::{ChainState, EntityOutcome, MinipoolPipeline};
use stakenode_tasks::{RunError, TaskScheduler};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{BeaconNotification, NotificationBus, Subscription, SubscriptionId, Topic};

/// Watchtower timing, stored in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchtowerConfig {
    /// How often oracle membership is re-checked.
    pub trust_poll_interval_secs: u64,
    /// Period of the full watchtower cycle. One beacon epoch by default.
    pub cycle_interval_secs: u64,
}

impl Default for WatchtowerConfig {
    fn default() -> Self {
        Self {
            trust_poll_interval_secs: 60,
            cycle_interval_secs: 384,
        }
    }
}

impl WatchtowerConfig {
    pub fn trust_poll_interval(&self) -> Duration {
        Duration::from_secs(self.trust_poll_interval_secs.max(1))
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs.max(1))
    }
}

/// Oracle membership as last observed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Untrusted,
    Trusted,
}

struct Listener {
    subscription: SubscriptionId,
    stop: CancellationToken,
    _handle: JoinHandle<()>,
}

struct ControllerState {
    trust: TrustState,
    listener: Option<Listener>,
}

/// Runs the watchtower pipeline and notification listener while the node is trusted.
pub struct WatchtowerController {
    node: NodeAddress,
    chain: Arc<dyn ChainState>,
    pipeline: Arc<MinipoolPipeline>,
    scheduler: Arc<TaskScheduler>,
    bus: Arc<NotificationBus>,
    config: WatchtowerConfig,
    state: Mutex<ControllerState>,
}

impl WatchtowerController {
    /// Starts untrusted; nothing runs until the first successful poll says otherwise.
    pub fn new(
        node: NodeAddress,
        chain: Arc<dyn ChainState>,
        pipeline: Arc<MinipoolPipeline>,
        bus: Arc<NotificationBus>,
        config: WatchtowerConfig,
    ) -> Self {
        let scheduler = Arc::new(TaskScheduler::new(
            Arc::clone(&pipeline).into_task(),
            config.cycle_interval(),
        ));
        Self {
            node,
            chain,
            pipeline,
            scheduler,
            bus,
            config,
            state: Mutex::new(ControllerState {
                trust: TrustState::Untrusted,
                listener: None,
            }),
        }
    }

    /// Current trust state.
    pub fn state(&self) -> TrustState {
        self.state.lock().trust
    }

    /// Scheduler of the full watchtower cycle.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// The watchtower pipeline, also used for single evaluations.
    pub fn pipeline(&self) -> &Arc<MinipoolPipeline> {
        &self.pipeline
    }

    /// Poll membership once and apply the transition. A failed poll keeps
    /// the current state.
    pub async fn poll_trust_once(&self) -> TrustState {
        match self.chain.is_trusted_node(self.node).await {
            Ok(trusted) => self.apply(trusted),
            Err(e) => {
                let state = self.state();
                warn!(node = %self.node, error = %e, state = ?state, "trust poll failed, keeping state");
                state
            }
        }
    }

    /// Poll until `shutdown` fires, then stop everything.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            node = %self.node,
            poll_secs = self.config.trust_poll_interval().as_secs(),
            "watchtower controller running"
        );
        loop {
            self.poll_trust_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.trust_poll_interval()) => {}
                _ = shutdown.cancelled() => {
                    info!("shutdown signal received, exiting trust poll loop");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Drop the subscription, stop ticking and cancel in-flight work.
    /// The controller stays untrusted afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let Some(listener) = state.listener.take() {
            self.detach(listener);
        }
        state.trust = TrustState::Untrusted;
        self.scheduler.shutdown();
    }

    fn apply(&self, trusted: bool) -> TrustState {
        let mut state = self.state.lock();
        match (state.trust, trusted) {
            (TrustState::Untrusted, true) if self.scheduler.is_shut_down() => {
                debug!(node = %self.node, "watchtower shut down, ignoring trust");
            }
            (TrustState::Untrusted, true) => {
                info!(node = %self.node, "node is trusted, starting watchtower");
                self.scheduler.start();
                let subscription = self.bus.subscribe(Topic::ALL);
                state.listener = Some(self.attach(subscription));
                state.trust = TrustState::Trusted;
            }
            (TrustState::Trusted, false) => {
                info!(node = %self.node, "node is no longer trusted, stopping watchtower");
                self.scheduler.stop();
                if let Some(listener) = state.listener.take() {
                    self.detach(listener);
                }
                state.trust = TrustState::Untrusted;
            }
            _ => {}
        }
        state.trust
    }

    fn attach(&self, subscription: Subscription) -> Listener {
        let stop = CancellationToken::new();
        let id = subscription.id();
        let handle = tokio::spawn(listen(
            subscription,
            Arc::clone(&self.pipeline),
            Arc::clone(&self.scheduler),
            stop.clone(),
        ));
        Listener {
            subscription: id,
            stop,
            _handle: handle,
        }
    }

    fn detach(&self, listener: Listener) {
        self.bus.unsubscribe(listener.subscription);
        // The listener finishes the notification it is handling, if any.
        listener.stop.cancel();
    }
}

async fn listen(
    mut subscription: Subscription,
    pipeline: Arc<MinipoolPipeline>,
    scheduler: Arc<TaskScheduler>,
    stop: CancellationToken,
) {
    let mut disconnected = false;
    loop {
        let notification = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = subscription.recv() => match next {
                Some(notification) => notification,
                None => break,
            },
        };

        match notification {
            BeaconNotification::Connected => {
                info!("beacon feed connected");
                if disconnected {
                    disconnected = false;
                    catch_up(&scheduler).await;
                }
            }
            BeaconNotification::Disconnected { reason } => {
                warn!(reason = %reason, "beacon feed disconnected");
                disconnected = true;
            }
            BeaconNotification::Message(msg) => {
                let Some(minipool) = pipeline.tracked_minipool(&msg.pubkey) else {
                    debug!(topic = %msg.topic, pubkey = %msg.pubkey, "notification for untracked validator");
                    continue;
                };
                debug!(topic = %msg.topic, minipool = %minipool, epoch = msg.epoch, "evaluating on notification");
                match pipeline.process_single(minipool).await {
                    Ok(EntityOutcome::Executed(receipt)) => {
                        info!(minipool = %minipool, action = %receipt.action, tx = %receipt.tx_hash, "acted on notification");
                    }
                    Ok(outcome) => debug!(minipool = %minipool, ?outcome, "notification handled"),
                    Err(e) => warn!(minipool = %minipool, error = %e, "notification handling failed"),
                }
            }
        }
    }
    debug!("notification listener exited");
}

/// Missed notifications are covered by a full cycle.
async fn catch_up(scheduler: &TaskScheduler) {
    match scheduler.trigger_now().await {
        Ok(()) => {}
        Err(RunError::AlreadyRunning { .. }) => debug!("cycle already running, skipping catch-up"),
        Err(RunError::ShutDown { .. }) => debug!("watchtower shut down, skipping catch-up"),
        Err(e) => warn!(error = %e, "catch-up cycle failed"),
    }
}
