//! Serialized transaction submission.
//!
//! All submissions from the node account go through one [`SubmissionLock`].
//! The lock covers build, sign and send only. Waiting for the receipt happens
//! after it is released, so a slow block does not hold up the next submission.

use std::sync::Arc;

use stakenode_core::{
    ActionKind, ChainError, ContractEvent, EventName, LifecycleAction, MinipoolAddress, TxHash,
    TxReceipt, ValidatorPubkey,
};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::collaborators::{ContractCall, Transactor};

/// Why an action was not confirmed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("no action to execute for minipool {0}")]
    NothingToDo(MinipoolAddress),
    /// Nonce state is unknown after this; do not resend blindly.
    #[error("submitting {action} for minipool {minipool} failed: {source}")]
    SubmissionFailed {
        minipool: MinipoolAddress,
        action: ActionKind,
        #[source]
        source: ChainError,
    },
    #[error("could not retrieve receipt for {tx_hash}: {source}")]
    ReceiptUnavailable {
        tx_hash: TxHash,
        #[source]
        source: ChainError,
    },
    #[error("transaction {tx_hash} for minipool {minipool} reverted")]
    Reverted {
        minipool: MinipoolAddress,
        tx_hash: TxHash,
    },
    #[error("could not retrieve {event} confirmation event for minipool {minipool} in {tx_hash}")]
    ConfirmationMissing {
        minipool: MinipoolAddress,
        tx_hash: TxHash,
        event: &'static str,
    },
}

/// The one lock guarding submissions from the node account.
#[derive(Debug, Clone, Default)]
pub struct SubmissionLock(Arc<Mutex<()>>);

impl SubmissionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock. Submissions are serialized behind the guard.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().await
    }

    pub fn is_held(&self) -> bool {
        self.0.try_lock().is_err()
    }
}

/// What a confirmed action did, as read from its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Staked { pubkey: ValidatorPubkey },
    LoggedOut,
    Withdrawn { node_amount_gwei: u64, user_amount_gwei: u64 },
}

/// A confirmed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub minipool: MinipoolAddress,
    pub action: ActionKind,
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// What the confirming event reported.
    pub outcome: ActionOutcome,
}

/// Submits decided actions one at a time and confirms them.
pub struct ActionExecutor {
    transactor: Arc<dyn Transactor>,
    lock: SubmissionLock,
}

impl ActionExecutor {
    /// Executor submitting through `transactor` while holding `lock`.
    pub fn new(transactor: Arc<dyn Transactor>, lock: SubmissionLock) -> Self {
        Self { transactor, lock }
    }

    pub fn lock(&self) -> &SubmissionLock {
        &self.lock
    }

    /// Submit `action` for `minipool` and wait for its confirming event.
    ///
    /// Only the submission holds the lock; the receipt is awaited after it is
    /// released. `LifecycleAction::None` is rejected with `NothingToDo`.
    pub async fn execute(
        &self,
        minipool: MinipoolAddress,
        action: &LifecycleAction,
    ) -> Result<ActionReceipt, ExecutionError> {
        let call = ContractCall::from_action(minipool, action).ok_or(ExecutionError::NothingToDo(minipool))?;
        let kind = call.kind();

        let tx_hash = self.submit(&call).await?;
        info!(
            minipool = %minipool,
            action = %kind,
            method = call.method(),
            tx = %tx_hash,
            "transaction submitted"
        );

        let receipt = self.transactor.receipt(tx_hash).await.map_err(|source| {
            error!(minipool = %minipool, tx = %tx_hash, error = %source, "receipt unavailable");
            ExecutionError::ReceiptUnavailable { tx_hash, source }
        })?;

        if !receipt.success {
            error!(minipool = %minipool, tx = %tx_hash, "transaction reverted");
            return Err(ExecutionError::Reverted { minipool, tx_hash });
        }

        let outcome = confirmation(&call, &receipt).ok_or_else(|| {
            error!(
                minipool = %minipool,
                tx = %tx_hash,
                event = call.expected_event().as_str(),
                "confirmation event missing"
            );
            ExecutionError::ConfirmationMissing {
                minipool,
                tx_hash,
                event: call.expected_event().as_str(),
            }
        })?;

        info!(
            minipool = %minipool,
            action = %kind,
            tx = %tx_hash,
            block = receipt.block_number,
            "action confirmed"
        );

        Ok(ActionReceipt {
            minipool,
            action: kind,
            tx_hash,
            block_number: receipt.block_number,
            outcome,
        })
    }

    async fn submit(&self, call: &ContractCall) -> Result<TxHash, ExecutionError> {
        let _guard = self.lock.acquire().await;
        debug!(minipool = %call.minipool(), action = %call.kind(), "submission lock acquired");
        self.transactor.submit(call).await.map_err(|source| {
            error!(
                minipool = %call.minipool(),
                action = %call.kind(),
                error = %source,
                "submission failed"
            );
            ExecutionError::SubmissionFailed {
                minipool: call.minipool(),
                action: call.kind(),
                source,
            }
        })
    }
}

fn confirmation(call: &ContractCall, receipt: &TxReceipt) -> Option<ActionOutcome> {
    let minipool = call.minipool();
    match (call.expected_event(), receipt.find_event(call.expected_event(), &minipool)?) {
        (EventName::MinipoolStaked, ContractEvent::MinipoolStaked { pubkey, .. }) => {
            Some(ActionOutcome::Staked { pubkey: *pubkey })
        }
        (EventName::MinipoolLoggedOut, ContractEvent::MinipoolLoggedOut { .. }) => Some(ActionOutcome::LoggedOut),
        (
            EventName::MinipoolWithdrawn,
            ContractEvent::MinipoolWithdrawn {
                node_amount_gwei,
                user_amount_gwei,
                ..
            },
        ) => Some(ActionOutcome::Withdrawn {
            node_amount_gwei: *node_amount_gwei,
            user_amount_gwei: *user_amount_gwei,
        }),
        _ => None,
    }
}
