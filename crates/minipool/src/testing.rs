//! In-memory collaborators for dry runs and tests.
//!
//! They behave like the real chain, beacon node and signer closely enough
//! for the pipeline to run end to end. Each exposes knobs to inject failures
//! and latency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stakenode_core::{
    ChainError, ContractEvent, DepositData, Epoch, MinipoolAddress, MinipoolDetails,
    MinipoolStatus, NodeAddress, TxHash, TxReceipt, ValidatorFacts, ValidatorPubkey,
    WithdrawalCredentials,
};
use tokio::time::Instant;

use crate::collaborators::{BeaconClient, ChainState, ContractCall, Registry, Transactor, ValidatorKeys};

#[derive(Default)]
struct ChainInner {
    minipools: BTreeMap<MinipoolAddress, (NodeAddress, MinipoolDetails)>,
    failing_details: HashSet<MinipoolAddress>,
    credentials: HashMap<MinipoolAddress, WithdrawalCredentials>,
    trusted: HashSet<NodeAddress>,
    registry_error: Option<ChainError>,
    trust_error: Option<ChainError>,
    query_delay: Duration,
}

/// Protocol contract state held in memory.
#[derive(Default)]
pub struct InMemoryChain {
    inner: Mutex<ChainInner>,
    active_queries: AtomicUsize,
    peak_queries: AtomicUsize,
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_minipool(&self, owner: NodeAddress, details: MinipoolDetails) {
        self.inner.lock().minipools.insert(details.address, (owner, details));
    }

    pub fn remove_minipool(&self, minipool: &MinipoolAddress) {
        self.inner.lock().minipools.remove(minipool);
    }

    pub fn set_status(&self, minipool: &MinipoolAddress, status: MinipoolStatus) {
        if let Some((_, details)) = self.inner.lock().minipools.get_mut(minipool) {
            details.status = status;
        }
    }

    pub fn status(&self, minipool: &MinipoolAddress) -> Option<MinipoolStatus> {
        self.inner.lock().minipools.get(minipool).map(|(_, d)| d.status)
    }

    pub fn set_withdrawal_credentials(&self, minipool: MinipoolAddress, credentials: WithdrawalCredentials) {
        self.inner.lock().credentials.insert(minipool, credentials);
    }

    /// Detail queries for `minipool` fail until [`Self::clear_failure`].
    pub fn fail_details(&self, minipool: MinipoolAddress) {
        self.inner.lock().failing_details.insert(minipool);
    }

    pub fn clear_failure(&self, minipool: &MinipoolAddress) {
        self.inner.lock().failing_details.remove(minipool);
    }

    pub fn fail_registry(&self, error: Option<ChainError>) {
        self.inner.lock().registry_error = error;
    }

    pub fn set_trusted(&self, node: NodeAddress, trusted: bool) {
        let mut inner = self.inner.lock();
        if trusted {
            inner.trusted.insert(node);
        } else {
            inner.trusted.remove(&node);
        }
    }

    pub fn fail_trust_poll(&self, error: Option<ChainError>) {
        self.inner.lock().trust_error = error;
    }

    /// Latency added to every detail query.
    pub fn set_query_delay(&self, delay: Duration) {
        self.inner.lock().query_delay = delay;
    }

    /// Most detail queries observed in flight at the same time.
    pub fn peak_concurrent_queries(&self) -> usize {
        self.peak_queries.load(Ordering::SeqCst)
    }
}

struct ActiveQuery<'a>(&'a AtomicUsize);

impl Drop for ActiveQuery<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainState for InMemoryChain {
    async fn minipool_addresses(&self, registry: Registry) -> Result<Vec<MinipoolAddress>, ChainError> {
        let inner = self.inner.lock();
        if let Some(e) = &inner.registry_error {
            return Err(e.clone());
        }
        Ok(inner
            .minipools
            .iter()
            .filter(|(_, (owner, _))| match registry {
                Registry::Node(node) => *owner == node,
                Registry::Network => true,
            })
            .map(|(addr, _)| *addr)
            .collect())
    }

    async fn minipool_details(&self, minipool: MinipoolAddress) -> Result<MinipoolDetails, ChainError> {
        let active = self.active_queries.fetch_add(1, Ordering::SeqCst) + 1;
        let _active = ActiveQuery(&self.active_queries);
        self.peak_queries.fetch_max(active, Ordering::SeqCst);

        let delay = self.inner.lock().query_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.lock();
        if inner.failing_details.contains(&minipool) {
            return Err(ChainError::Rpc(format!("details unavailable for {minipool}")));
        }
        inner
            .minipools
            .get(&minipool)
            .map(|(_, details)| details.clone())
            .ok_or(ChainError::MinipoolNotFound(minipool))
    }

    async fn withdrawal_credentials(
        &self,
        minipool: MinipoolAddress,
    ) -> Result<Option<WithdrawalCredentials>, ChainError> {
        Ok(self.inner.lock().credentials.get(&minipool).copied())
    }

    async fn is_trusted_node(&self, node: NodeAddress) -> Result<bool, ChainError> {
        let inner = self.inner.lock();
        match &inner.trust_error {
            Some(e) => Err(e.clone()),
            None => Ok(inner.trusted.contains(&node)),
        }
    }
}

#[derive(Default)]
struct BeaconInner {
    epoch: Epoch,
    validators: HashMap<ValidatorPubkey, ValidatorFacts>,
    failing: HashSet<ValidatorPubkey>,
    epoch_error: Option<ChainError>,
}

/// Beacon node view held in memory. Unknown pubkeys are reported as not found.
#[derive(Default)]
pub struct InMemoryBeacon {
    inner: Mutex<BeaconInner>,
}

impl InMemoryBeacon {
    pub fn new(epoch: Epoch) -> Self {
        let beacon = Self::default();
        beacon.set_epoch(epoch);
        beacon
    }

    pub fn set_epoch(&self, epoch: Epoch) {
        self.inner.lock().epoch = epoch;
    }

    pub fn set_facts(&self, pubkey: ValidatorPubkey, facts: ValidatorFacts) {
        self.inner.lock().validators.insert(pubkey, facts);
    }

    pub fn fail_validator(&self, pubkey: ValidatorPubkey) {
        self.inner.lock().failing.insert(pubkey);
    }

    pub fn fail_epoch(&self, error: Option<ChainError>) {
        self.inner.lock().epoch_error = error;
    }
}

#[async_trait]
impl BeaconClient for InMemoryBeacon {
    async fn current_epoch(&self) -> Result<Epoch, ChainError> {
        let inner = self.inner.lock();
        match &inner.epoch_error {
            Some(e) => Err(e.clone()),
            None => Ok(inner.epoch),
        }
    }

    async fn validator_facts(&self, pubkey: ValidatorPubkey) -> Result<ValidatorFacts, ChainError> {
        let inner = self.inner.lock();
        if inner.failing.contains(&pubkey) {
            return Err(ChainError::Beacon(format!("validator {pubkey} lookup failed")));
        }
        Ok(inner
            .validators
            .get(&pubkey)
            .cloned()
            .unwrap_or_else(ValidatorFacts::not_found))
    }
}

/// Deposit amount for the second stage of a minipool deposit.
pub const STAKE_DEPOSIT_GWEI: u64 = 31_000_000_000;

/// Keystore holding a fixed set of validator keys.
#[derive(Default)]
pub struct StaticValidatorKeys {
    keys: Mutex<HashSet<ValidatorPubkey>>,
}

impl StaticValidatorKeys {
    pub fn new(keys: impl IntoIterator<Item = ValidatorPubkey>) -> Self {
        Self {
            keys: Mutex::new(keys.into_iter().collect()),
        }
    }

    pub fn insert(&self, pubkey: ValidatorPubkey) {
        self.keys.lock().insert(pubkey);
    }
}

impl ValidatorKeys for StaticValidatorKeys {
    fn deposit_data(
        &self,
        _minipool: &MinipoolAddress,
        pubkey: &ValidatorPubkey,
        withdrawal_credentials: &WithdrawalCredentials,
    ) -> Option<DepositData> {
        if !self.keys.lock().contains(pubkey) {
            return None;
        }
        let mut deposit_data_root = [0u8; 32];
        deposit_data_root[..16].copy_from_slice(&pubkey.as_bytes()[..16]);
        deposit_data_root[16..].copy_from_slice(&withdrawal_credentials.as_bytes()[16..]);
        Some(DepositData {
            pubkey: *pubkey,
            withdrawal_credentials: *withdrawal_credentials,
            amount_gwei: STAKE_DEPOSIT_GWEI,
            signature: pubkey.as_bytes().iter().chain(pubkey.as_bytes()).copied().collect(),
            deposit_data_root,
        })
    }
}

#[derive(Default)]
struct TransactorInner {
    submissions: Vec<ContractCall>,
    intervals: Vec<(Instant, Instant)>,
    pending: HashMap<TxHash, ContractCall>,
    nonce: u64,
    fail_next: Option<ChainError>,
    omit_events: bool,
    revert: bool,
    submit_delay: Duration,
    receipt_delay: Duration,
}

/// Signer that records every call and mines it instantly.
#[derive(Default)]
pub struct RecordingTransactor {
    inner: Mutex<TransactorInner>,
}

impl RecordingTransactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next submission fails with `error`; later ones succeed.
    pub fn fail_next_submit(&self, error: ChainError) {
        self.inner.lock().fail_next = Some(error);
    }

    /// Mined receipts carry no decoded events.
    pub fn omit_events(&self, omit: bool) {
        self.inner.lock().omit_events = omit;
    }

    pub fn revert_receipts(&self, revert: bool) {
        self.inner.lock().revert = revert;
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.inner.lock().submit_delay = delay;
    }

    pub fn set_receipt_delay(&self, delay: Duration) {
        self.inner.lock().receipt_delay = delay;
    }

    /// Accepted calls in submission order.
    pub fn submissions(&self) -> Vec<ContractCall> {
        self.inner.lock().submissions.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.inner.lock().submissions.len()
    }

    /// Entry and exit instants of every `submit` call, failed ones included.
    pub fn submit_intervals(&self) -> Vec<(Instant, Instant)> {
        self.inner.lock().intervals.clone()
    }
}

fn tx_hash_for(nonce: u64) -> TxHash {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x7e;
    bytes[24..].copy_from_slice(&nonce.to_be_bytes());
    TxHash::new(bytes)
}

fn events_for(call: &ContractCall) -> Vec<ContractEvent> {
    let event = match call {
        ContractCall::Stake { minipool, pubkey, .. } => ContractEvent::MinipoolStaked {
            minipool: *minipool,
            pubkey: *pubkey,
        },
        ContractCall::LogOut { minipool } => ContractEvent::MinipoolLoggedOut { minipool: *minipool },
        ContractCall::Withdraw { minipool, balance_gwei } => ContractEvent::MinipoolWithdrawn {
            minipool: *minipool,
            node_amount_gwei: balance_gwei / 2,
            user_amount_gwei: balance_gwei - balance_gwei / 2,
        },
    };
    vec![
        ContractEvent::Other {
            name: "Transfer".to_string(),
        },
        event,
    ]
}

#[async_trait]
impl Transactor for RecordingTransactor {
    async fn submit(&self, call: &ContractCall) -> Result<TxHash, ChainError> {
        let entered = Instant::now();
        let delay = self.inner.lock().submit_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        let result = match inner.fail_next.take() {
            Some(e) => Err(e),
            None => {
                inner.nonce += 1;
                let tx_hash = tx_hash_for(inner.nonce);
                inner.submissions.push(call.clone());
                inner.pending.insert(tx_hash, call.clone());
                Ok(tx_hash)
            }
        };
        inner.intervals.push((entered, Instant::now()));
        result
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError> {
        let delay = self.inner.lock().receipt_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let inner = self.inner.lock();
        let call = inner
            .pending
            .get(&tx_hash)
            .ok_or(ChainError::TransactionNotFound(tx_hash))?;
        let index = inner.submissions.iter().position(|c| c == call).unwrap_or(0) as u64;
        Ok(TxReceipt {
            tx_hash,
            block_number: 1_000 + index,
            success: !inner.revert,
            gas_used: 90_000,
            events: if inner.omit_events { Vec::new() } else { events_for(call) },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakenode_core::Address;

    #[tokio::test]
    async fn test_registry_filters_by_owner() {
        let chain = InMemoryChain::new();
        let (alice, bob) = (Address::repeat_byte(0xa), Address::repeat_byte(0xb));
        chain.add_minipool(
            alice,
            MinipoolDetails::new(Address::repeat_byte(1), MinipoolStatus::Staking, 1, ValidatorPubkey::repeat_byte(1)),
        );
        chain.add_minipool(
            bob,
            MinipoolDetails::new(Address::repeat_byte(2), MinipoolStatus::Staking, 1, ValidatorPubkey::repeat_byte(2)),
        );

        assert_eq!(
            chain.minipool_addresses(Registry::Node(alice)).await.unwrap(),
            vec![Address::repeat_byte(1)]
        );
        assert_eq!(chain.minipool_addresses(Registry::Network).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_validator_is_not_found() {
        let beacon = InMemoryBeacon::new(5);
        let facts = beacon.validator_facts(ValidatorPubkey::repeat_byte(9)).await.unwrap();
        assert!(!facts.exists);
        assert_eq!(beacon.current_epoch().await.unwrap(), 5);
    }

    #[test]
    fn test_keys_only_sign_held_pubkeys() {
        let held = ValidatorPubkey::repeat_byte(1);
        let keys = StaticValidatorKeys::new([held]);
        let minipool = Address::repeat_byte(3);
        let creds = WithdrawalCredentials::for_address(&minipool);

        let deposit = keys.deposit_data(&minipool, &held, &creds).unwrap();
        assert_eq!(deposit.pubkey, held);
        assert_eq!(deposit.withdrawal_credentials, creds);
        assert_eq!(deposit.signature.len(), 96);
        assert!(keys
            .deposit_data(&minipool, &ValidatorPubkey::repeat_byte(2), &creds)
            .is_none());
    }

    #[tokio::test]
    async fn test_unknown_receipt() {
        let transactor = RecordingTransactor::new();
        let err = transactor.receipt(tx_hash_for(42)).await.unwrap_err();
        assert!(matches!(err, ChainError::TransactionNotFound(_)));
    }
}
