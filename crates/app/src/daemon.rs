//! The node daemon: both duties sharing one submission lock.

use std::sync::Arc;

use stakenode_core::NodeAddress;
use stakenode_minipool::{
    ActionExecutor, BeaconClient, ChainState, Collaborators, Duty, MinipoolPipeline, SubmissionLock,
    Transactor, ValidatorKeys,
};
use stakenode_tasks::TaskScheduler;
use stakenode_watchtower::{NotificationBus, WatchtowerController};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::NodeConfig;
use crate::AppError;

/// External services the daemon is built from.
#[derive(Clone)]
pub struct NodeServices {
    /// Execution-layer reads: registries, minipool details, trust.
    pub chain: Arc<dyn ChainState>,
    /// Consensus-layer reads: epoch and validator facts.
    pub beacon: Arc<dyn BeaconClient>,
    /// Signs deposit data for the node's validators.
    pub keys: Arc<dyn ValidatorKeys>,
    /// Submits transactions and fetches their receipts.
    pub transactor: Arc<dyn Transactor>,
    /// Beacon feed the watchtower subscribes to while trusted.
    pub notifications: Arc<NotificationBus>,
}

/// Node-operator and watchtower duties of one node, sharing a submission lock.
pub struct NodeDaemon {
    node: NodeAddress,
    lock: SubmissionLock,
    operator: TaskScheduler,
    watchtower: WatchtowerController,
}

impl NodeDaemon {
    /// Fails if no node address is configured.
    pub fn new(config: &NodeConfig, services: NodeServices) -> Result<Self, AppError> {
        let node = config.node()?;
        let lock = SubmissionLock::new();
        let executor = Arc::new(ActionExecutor::new(services.transactor, lock.clone()));
        let collaborators = Collaborators {
            chain: Arc::clone(&services.chain),
            beacon: services.beacon,
            keys: services.keys,
        };

        let operator_pipeline = Arc::new(MinipoolPipeline::new(
            Duty::NodeOperator { node },
            config.pipeline,
            collaborators.clone(),
            Arc::clone(&executor),
        ));
        let operator = TaskScheduler::new(operator_pipeline.into_task(), config.node_operator.interval());

        let watchtower_pipeline = Arc::new(MinipoolPipeline::new(
            Duty::Watchtower,
            config.pipeline,
            collaborators,
            executor,
        ));
        let watchtower = WatchtowerController::new(
            node,
            services.chain,
            watchtower_pipeline,
            services.notifications,
            config.watchtower,
        );

        Ok(Self {
            node,
            lock,
            operator,
            watchtower,
        })
    }

    pub fn node(&self) -> NodeAddress {
        self.node
    }

    /// The lock every submission from this node goes through.
    pub fn submission_lock(&self) -> &SubmissionLock {
        &self.lock
    }

    /// Scheduler of the node-operator cycle.
    pub fn operator(&self) -> &TaskScheduler {
        &self.operator
    }

    pub fn watchtower(&self) -> &WatchtowerController {
        &self.watchtower
    }

    /// Run both duties until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(node = %self.node, "node daemon starting");
        self.operator.start();
        self.watchtower.run(shutdown).await;
        self.operator.shutdown();
        info!(node = %self.node, "node daemon stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stakenode_core::{
        Address, MinipoolDetails, MinipoolStatus, ValidatorFacts, ValidatorPubkey, WithdrawalCredentials,
        FAR_FUTURE_EPOCH,
    };
    use stakenode_minipool::testing::{InMemoryBeacon, InMemoryChain, RecordingTransactor, StaticValidatorKeys};
    use stakenode_minipool::ContractCall;
    use stakenode_watchtower::TrustState;

    const NODE: Address = Address::repeat_byte(0x0d);
    const OWN: Address = Address::repeat_byte(1);
    const OTHER: Address = Address::repeat_byte(2);

    struct Fixture {
        chain: Arc<InMemoryChain>,
        transactor: Arc<RecordingTransactor>,
        daemon: Arc<NodeDaemon>,
    }

    /// Our prelaunched minipool plus someone else's staking minipool that is
    /// due to log out.
    fn fixture() -> Fixture {
        let chain = Arc::new(InMemoryChain::new());
        let beacon = Arc::new(InMemoryBeacon::new(500));
        let keys = Arc::new(StaticValidatorKeys::default());

        let own_key = ValidatorPubkey::repeat_byte(1);
        chain.add_minipool(NODE, MinipoolDetails::new(OWN, MinipoolStatus::Prelaunch, 50, own_key));
        chain.set_withdrawal_credentials(OWN, WithdrawalCredentials::for_address(&OWN));
        beacon.set_facts(
            own_key,
            ValidatorFacts::from_beacon(FAR_FUTURE_EPOCH, FAR_FUTURE_EPOCH, FAR_FUTURE_EPOCH, 1_000_000_000),
        );
        keys.insert(own_key);

        let other_key = ValidatorPubkey::repeat_byte(2);
        chain.add_minipool(
            Address::repeat_byte(0xee),
            MinipoolDetails::new(OTHER, MinipoolStatus::Staking, 50, other_key),
        );
        beacon.set_facts(
            other_key,
            ValidatorFacts::from_beacon(100, FAR_FUTURE_EPOCH, FAR_FUTURE_EPOCH, 32_000_000_000),
        );

        let transactor = Arc::new(RecordingTransactor::new());
        let config = NodeConfig {
            node_address: Some(NODE),
            ..NodeConfig::default()
        };
        let services = NodeServices {
            chain: chain.clone(),
            beacon,
            keys,
            transactor: transactor.clone(),
            notifications: Arc::new(NotificationBus::new()),
        };
        let daemon = Arc::new(NodeDaemon::new(&config, services).unwrap());
        Fixture {
            chain,
            transactor,
            daemon,
        }
    }

    fn spawn(daemon: &Arc<NodeDaemon>, shutdown: &CancellationToken) -> tokio::task::JoinHandle<()> {
        let daemon = daemon.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { daemon.run(shutdown).await })
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrusted_node_only_stakes_its_own() {
        let f = fixture();
        let shutdown = CancellationToken::new();
        let handle = spawn(&f.daemon, &shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let calls = f.transactor.submissions();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], ContractCall::Stake { minipool: OWN, .. }));
        assert!(!f.daemon.operator().is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trusted_node_runs_both_duties() {
        let f = fixture();
        f.chain.set_trusted(NODE, true);
        let shutdown = CancellationToken::new();
        let handle = spawn(&f.daemon, &shutdown);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.daemon.watchtower().state(), TrustState::Trusted);
        shutdown.cancel();
        handle.await.unwrap();

        let mut minipools: Vec<Address> = f.transactor.submissions().iter().map(|c| c.minipool()).collect();
        minipools.sort();
        assert_eq!(minipools, vec![OWN, OTHER]);
        assert!(!f.daemon.submission_lock().is_held());
    }

    #[test]
    fn test_missing_node_address() {
        let services = NodeServices {
            chain: Arc::new(InMemoryChain::new()),
            beacon: Arc::new(InMemoryBeacon::new(0)),
            keys: Arc::new(StaticValidatorKeys::default()),
            transactor: Arc::new(RecordingTransactor::new()),
            notifications: Arc::new(NotificationBus::new()),
        };
        let result = NodeDaemon::new(&NodeConfig::default(), services);
        assert!(matches!(result, Err(AppError::MissingNodeAddress)));
    }
}
