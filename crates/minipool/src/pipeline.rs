//! One evaluation cycle over a registry of minipools.
//!
//! A cycle enumerates the registry for its [`Duty`], fetches every status,
//! keeps the minipools the duty acts on, reads validator facts for them and
//! then evaluates and executes entity by entity. A failure on one minipool is
//! recorded in the [`CycleReport`] and the cycle moves on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use stakenode_core::{
    ActionKind, ChainError, Epoch, MinipoolAddress, MinipoolDetails,
    MinipoolStatus, NodeAddress, ValidatorFacts, ValidatorPubkey,
};
use stakenode_tasks::{LockingBackgroundTask, TaskContext};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{BeaconClient, ChainState, Registry, ValidatorKeys};
use crate::evaluator::{assess, Assessment, EvaluationParams, SkipReason};
use crate::executor::{ActionExecutor, ActionReceipt, ExecutionError};
use crate::status::{query_partial, AggregationError, FanOut, StatusAggregator};

/// Whose minipools a pipeline looks after and what it may do to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    /// The node's own minipools. Stakes prelaunched minipools.
    NodeOperator { node: NodeAddress },
    /// Every minipool in the network. Reports logouts and withdrawals.
    Watchtower,
}

impl Duty {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NodeOperator { .. } => "node_operator",
            Self::Watchtower => "watchtower",
        }
    }

    pub fn registry(&self) -> Registry {
        match self {
            Self::NodeOperator { node } => Registry::Node(*node),
            Self::Watchtower => Registry::Network,
        }
    }

    pub fn permits(&self, kind: ActionKind) -> bool {
        match self {
            Self::NodeOperator { .. } => kind == ActionKind::Stake,
            Self::Watchtower => matches!(kind, ActionKind::LogOut | ActionKind::Withdraw),
        }
    }

    /// Statuses worth evaluating under this duty.
    pub fn watches(&self, status: MinipoolStatus) -> bool {
        match self {
            Self::NodeOperator { .. } => status == MinipoolStatus::Prelaunch,
            Self::Watchtower => matches!(status, MinipoolStatus::Staking | MinipoolStatus::LoggedOut),
        }
    }
}

/// How a failed status query affects the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    /// Any failed status query fails the whole cycle.
    AllOrNothing,
    /// Failed minipools are reported and the rest are processed.
    #[default]
    Partial,
}

/// Aggregation settings shared by every cycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrency of status and validator queries.
    pub fan_out: FanOut,
    /// What a failed status query does to the cycle.
    pub aggregation: AggregationPolicy,
}

/// Read-side collaborators a pipeline queries.
#[derive(Clone)]
pub struct Collaborators {
    /// Registry and minipool reads.
    pub chain: Arc<dyn ChainState>,
    /// Epoch and validator reads.
    pub beacon: Arc<dyn BeaconClient>,
    /// Deposit data for staking.
    pub keys: Arc<dyn ValidatorKeys>,
}

/// Errors that stop a cycle or a single evaluation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("registry enumeration failed: {0}")]
    Registry(#[source] ChainError),
    #[error("status aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
    #[error("current epoch unavailable: {0}")]
    Epoch(#[source] ChainError),
    #[error("query for minipool {minipool} failed: {source}")]
    Query {
        minipool: MinipoolAddress,
        #[source]
        source: ChainError,
    },
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

/// Where a per-minipool failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStage {
    Status,
    Facts,
    Credentials,
    Execution,
}

/// A minipool that could not be evaluated or acted on this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityFailure {
    pub minipool: MinipoolAddress,
    pub stage: FailureStage,
    pub error: String,
}

/// What happened to one minipool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityOutcome {
    Idle(SkipReason),
    Executed(ActionReceipt),
    /// An action for this minipool is already executing elsewhere.
    Busy,
    /// Decided, but not this duty's to take.
    NotPermitted(ActionKind),
    /// This action was already confirmed from the minipool's current status.
    AlreadyActed(ActionKind),
}

/// Summary of one cycle, logged when it completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Minipools the evaluator ran for.
    pub evaluated: usize,
    /// Evaluated, with nothing to do.
    pub skipped: usize,
    /// Skipped because an action for them was in flight.
    pub busy: usize,
    /// Confirmed actions, in processing order.
    pub submitted: Vec<ActionReceipt>,
    pub failures: Vec<EntityFailure>,
    /// Cancellation stopped the cycle before every minipool was visited.
    pub cancelled: bool,
}

impl CycleReport {
    /// No failures and not cancelled.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    fn fail(&mut self, minipool: MinipoolAddress, stage: FailureStage, error: impl ToString) {
        self.failures.push(EntityFailure {
            minipool,
            stage,
            error: error.to_string(),
        });
    }
}

enum EntityError {
    Credentials(ChainError),
    Execution(ExecutionError),
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<MinipoolAddress>>>,
    minipool: MinipoolAddress,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.minipool);
    }
}

/// Aggregate, evaluate and execute for one duty.
pub struct MinipoolPipeline {
    duty: Duty,
    config: PipelineConfig,
    collaborators: Collaborators,
    aggregator: StatusAggregator,
    executor: Arc<ActionExecutor>,
    in_flight: Arc<Mutex<HashSet<MinipoolAddress>>>,
    /// Last confirmed action per minipool and the status it was taken from.
    confirmed: Mutex<HashMap<MinipoolAddress, (MinipoolStatus, ActionKind)>>,
    tracked: RwLock<HashMap<ValidatorPubkey, MinipoolAddress>>,
}

impl MinipoolPipeline {
    pub fn new(
        duty: Duty,
        config: PipelineConfig,
        collaborators: Collaborators,
        executor: Arc<ActionExecutor>,
    ) -> Self {
        let aggregator = StatusAggregator::new(collaborators.chain.clone(), config.fan_out);
        Self {
            duty,
            config,
            collaborators,
            aggregator,
            executor,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            confirmed: Mutex::new(HashMap::new()),
            tracked: RwLock::new(HashMap::new()),
        }
    }

    pub fn duty(&self) -> Duty {
        self.duty
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Minipool whose validator is `pubkey`, as of the last cycle.
    pub fn tracked_minipool(&self, pubkey: &ValidatorPubkey) -> Option<MinipoolAddress> {
        self.tracked.read().get(pubkey).copied()
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.read().len()
    }

    /// Whether an action for `minipool` is executing right now.
    pub fn is_in_flight(&self, minipool: &MinipoolAddress) -> bool {
        self.in_flight.lock().contains(minipool)
    }

    /// Wrap full cycles in a locking task named after the duty.
    pub fn into_task(self: Arc<Self>) -> LockingBackgroundTask {
        let description = format!("evaluate {} minipools", self.duty.name());
        let name = self.duty.name();
        LockingBackgroundTask::new(name, description, move |ctx: TaskContext| {
            let pipeline = Arc::clone(&self);
            async move {
                pipeline.run_cycle(&ctx.cancel).await?;
                ctx.done.release();
                Ok::<(), anyhow::Error>(())
            }
        })
    }

    /// One full pass over the registry.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, PipelineError> {
        let mut report = CycleReport::default();
        let duty = self.duty.name();

        let ids = self
            .collaborators
            .chain
            .minipool_addresses(self.duty.registry())
            .await
            .map_err(PipelineError::Registry)?;
        debug!(duty, minipools = ids.len(), "registry enumerated");

        let statuses = match self.config.aggregation {
            AggregationPolicy::AllOrNothing => self.aggregator.fetch_all(&ids).await?,
            AggregationPolicy::Partial => {
                let partial = self.aggregator.fetch_partial(&ids).await;
                for (minipool, e) in partial.failures {
                    warn!(duty, minipool = %minipool, error = %e, "status query failed");
                    report.fail(minipool, FailureStage::Status, e);
                }
                partial.values
            }
        };

        let mut working: Vec<MinipoolDetails> = statuses
            .into_values()
            .filter(|details| !details.status.is_terminal())
            .collect();
        working.sort_by_key(|details| details.address);
        self.retrack(&working, &report);
        working.retain(|details| self.duty.watches(details.status));

        if working.is_empty() {
            self.log_report(&report);
            return Ok(report);
        }
        if cancel.is_cancelled() {
            report.cancelled = true;
            self.log_report(&report);
            return Ok(report);
        }

        let epoch = self
            .collaborators
            .beacon
            .current_epoch()
            .await
            .map_err(PipelineError::Epoch)?;

        let pubkeys: Arc<HashMap<MinipoolAddress, ValidatorPubkey>> = Arc::new(
            working
                .iter()
                .map(|details| (details.address, details.validator_pubkey))
                .collect(),
        );
        let addresses: Vec<MinipoolAddress> = pubkeys.keys().copied().collect();
        let beacon = Arc::clone(&self.collaborators.beacon);
        let mut facts = query_partial(&addresses, self.config.fan_out, move |minipool| {
            let beacon = Arc::clone(&beacon);
            let pubkey = pubkeys.get(&minipool).copied();
            async move {
                match pubkey {
                    Some(pubkey) => beacon.validator_facts(pubkey).await,
                    None => Err(ChainError::MinipoolNotFound(minipool)),
                }
            }
        })
        .await;

        for details in &working {
            if cancel.is_cancelled() {
                info!(duty, "cycle cancelled between minipools");
                report.cancelled = true;
                break;
            }

            let minipool = details.address;
            let validator = match facts.values.remove(&minipool) {
                Some(validator) => validator,
                None => {
                    let e = facts
                        .failures
                        .remove(&minipool)
                        .unwrap_or(ChainError::MinipoolNotFound(minipool));
                    warn!(duty, minipool = %minipool, error = %e, "validator query failed");
                    report.fail(minipool, FailureStage::Facts, e);
                    continue;
                }
            };

            match self.process(details, &validator, epoch).await {
                Ok(EntityOutcome::Busy) => report.busy += 1,
                Ok(EntityOutcome::Executed(receipt)) => {
                    report.evaluated += 1;
                    report.submitted.push(receipt);
                }
                Ok(EntityOutcome::Idle(_) | EntityOutcome::NotPermitted(_) | EntityOutcome::AlreadyActed(_)) => {
                    report.evaluated += 1;
                    report.skipped += 1;
                }
                Err(EntityError::Credentials(e)) => report.fail(minipool, FailureStage::Credentials, e),
                Err(EntityError::Execution(e)) => {
                    report.evaluated += 1;
                    report.fail(minipool, FailureStage::Execution, e);
                }
            }
        }

        self.log_report(&report);
        Ok(report)
    }

    /// Evaluate and execute for a single minipool, outside the cycle.
    pub async fn process_single(&self, minipool: MinipoolAddress) -> Result<EntityOutcome, PipelineError> {
        let details = self
            .collaborators
            .chain
            .minipool_details(minipool)
            .await
            .map_err(|source| PipelineError::Query { minipool, source })?;

        if details.status.is_terminal() {
            self.tracked.write().remove(&details.validator_pubkey);
            self.confirmed.lock().remove(&minipool);
            return Ok(EntityOutcome::Idle(SkipReason::NothingForStatus(details.status)));
        }
        if !self.duty.watches(details.status) {
            return Ok(EntityOutcome::Idle(SkipReason::NothingForStatus(details.status)));
        }

        let epoch = self
            .collaborators
            .beacon
            .current_epoch()
            .await
            .map_err(PipelineError::Epoch)?;
        let validator = self
            .collaborators
            .beacon
            .validator_facts(details.validator_pubkey)
            .await
            .map_err(|source| PipelineError::Query { minipool, source })?;

        self.process(&details, &validator, epoch).await.map_err(|e| match e {
            EntityError::Credentials(source) => PipelineError::Query { minipool, source },
            EntityError::Execution(e) => PipelineError::Execution(e),
        })
    }

    async fn process(
        &self,
        details: &MinipoolDetails,
        validator: &ValidatorFacts,
        epoch: Epoch,
    ) -> Result<EntityOutcome, EntityError> {
        let minipool = details.address;
        let Some(_guard) = self.claim(minipool) else {
            debug!(duty = self.duty.name(), minipool = %minipool, "action already in flight, skipping");
            return Ok(EntityOutcome::Busy);
        };

        let mut params = EvaluationParams::at_epoch(epoch);
        if details.status == MinipoolStatus::Prelaunch && self.duty.permits(ActionKind::Stake) {
            let credentials = self
                .collaborators
                .chain
                .withdrawal_credentials(minipool)
                .await
                .map_err(EntityError::Credentials)?;
            params.deposit = credentials.and_then(|creds| {
                self.collaborators
                    .keys
                    .deposit_data(&minipool, &details.validator_pubkey, &creds)
            });
            params.withdrawal_credentials = credentials;
        }

        let action = match assess(details, validator, &params) {
            Assessment::Act(action) => action,
            Assessment::Skipped(reason) => {
                debug!(
                    duty = self.duty.name(),
                    minipool = %minipool,
                    status = %details.status,
                    ?reason,
                    "nothing to do"
                );
                return Ok(EntityOutcome::Idle(reason));
            }
        };

        let Some(kind) = action.kind() else {
            return Ok(EntityOutcome::Idle(SkipReason::NothingForStatus(details.status)));
        };
        if !self.duty.permits(kind) {
            debug!(duty = self.duty.name(), minipool = %minipool, action = %kind, "action not permitted for duty");
            return Ok(EntityOutcome::NotPermitted(kind));
        }

        // A cycle decides from statuses read at its start; an out-of-band
        // evaluation may have acted on this minipool since.
        if self.confirmed.lock().get(&minipool) == Some(&(details.status, kind)) {
            debug!(
                duty = self.duty.name(),
                minipool = %minipool,
                status = %details.status,
                action = %kind,
                "action already confirmed from this status"
            );
            return Ok(EntityOutcome::AlreadyActed(kind));
        }

        info!(
            duty = self.duty.name(),
            minipool = %minipool,
            status = %details.status,
            action = %kind,
            epoch,
            "action decided"
        );
        let receipt = self
            .executor
            .execute(minipool, &action)
            .await
            .map_err(EntityError::Execution)?;
        self.confirmed.lock().insert(minipool, (details.status, kind));
        Ok(EntityOutcome::Executed(receipt))
    }

    fn claim(&self, minipool: MinipoolAddress) -> Option<InFlightGuard> {
        if !self.in_flight.lock().insert(minipool) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            minipool,
        })
    }

    /// Replace the working set with this cycle's non-terminal minipools,
    /// keeping those whose status could not be read. Confirmation records
    /// follow the same set.
    fn retrack(&self, live: &[MinipoolDetails], report: &CycleReport) {
        let unknown: HashSet<MinipoolAddress> = report
            .failures
            .iter()
            .filter(|f| f.stage == FailureStage::Status)
            .map(|f| f.minipool)
            .collect();
        let live_addresses: HashSet<MinipoolAddress> = live.iter().map(|d| d.address).collect();
        self.confirmed
            .lock()
            .retain(|minipool, _| live_addresses.contains(minipool) || unknown.contains(minipool));

        let mut tracked = self.tracked.write();
        tracked.retain(|_, minipool| unknown.contains(minipool));
        tracked.extend(live.iter().map(|d| (d.validator_pubkey, d.address)));
    }

    fn log_report(&self, report: &CycleReport) {
        info!(
            duty = self.duty.name(),
            evaluated = report.evaluated,
            skipped = report.skipped,
            busy = report.busy,
            submitted = report.submitted.len(),
            failures = report.failures.len(),
            cancelled = report.cancelled,
            tracked = self.tracked_count(),
            "cycle complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use stakenode_core::Address;

    #[test]
    fn test_duty_permissions() {
        let operator = Duty::NodeOperator {
            node: Address::repeat_byte(1),
        };
        assert!(operator.permits(ActionKind::Stake));
        assert!(!operator.permits(ActionKind::LogOut));
        assert!(!operator.permits(ActionKind::Withdraw));
        assert_eq!(operator.registry(), Registry::Node(Address::repeat_byte(1)));

        assert!(!Duty::Watchtower.permits(ActionKind::Stake));
        assert!(Duty::Watchtower.permits(ActionKind::LogOut));
        assert!(Duty::Watchtower.permits(ActionKind::Withdraw));
        assert_eq!(Duty::Watchtower.registry(), Registry::Network);
    }

    #[test]
    fn test_duty_watches() {
        let operator = Duty::NodeOperator {
            node: Address::repeat_byte(1),
        };
        assert!(operator.watches(MinipoolStatus::Prelaunch));
        assert!(!operator.watches(MinipoolStatus::Staking));
        assert!(Duty::Watchtower.watches(MinipoolStatus::Staking));
        assert!(Duty::Watchtower.watches(MinipoolStatus::LoggedOut));
        assert!(!Duty::Watchtower.watches(MinipoolStatus::Withdrawn));
    }

    #[test]
    fn test_pipeline_config_defaults_to_partial_unbounded() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.aggregation, AggregationPolicy::Partial);
        assert_eq!(config.fan_out, FanOut::Unbounded);

        let bounded: PipelineConfig =
            serde_json::from_str(r#"{"fan_out":{"bounded":4},"aggregation":"all_or_nothing"}"#).unwrap();
        assert_eq!(bounded.fan_out, FanOut::Bounded(4));
        assert_eq!(bounded.aggregation, AggregationPolicy::AllOrNothing);
    }
}
