//! Pure lifecycle decisions.
//!
//! | status    | condition                                               | action   |
//! |-----------|---------------------------------------------------------|----------|
//! | Prelaunch | withdrawal credentials configured, deposit key present  | Stake    |
//! | Staking   | current epoch >= activation epoch + staking duration    | LogOut   |
//! | LoggedOut | current epoch >= withdrawable epoch                     | Withdraw |
//!
//! Anything else is `None`. A validator the beacon chain does not know yields
//! `None` for every status.

use stakenode_core::{
    DepositData, Epoch, LifecycleAction, MinipoolDetails, MinipoolStatus, ValidatorFacts,
    WithdrawalCredentials,
};

/// Inputs that do not come from the minipool or its validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationParams {
    /// Beacon epoch the decision is made at.
    pub current_epoch: Epoch,
    /// Credentials the minipool expects its validator to use. Prelaunch only.
    pub withdrawal_credentials: Option<WithdrawalCredentials>,
    /// Present only when the validator key is held by this node.
    pub deposit: Option<DepositData>,
}

impl EvaluationParams {
    /// Parameters for a non-prelaunch evaluation.
    pub fn at_epoch(current_epoch: Epoch) -> Self {
        Self {
            current_epoch,
            withdrawal_credentials: None,
            deposit: None,
        }
    }
}

/// Why no action was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ValidatorNotFound,
    CredentialsMissing,
    KeyUnavailable,
    /// Deposit data was signed for another pubkey or other credentials.
    DepositMismatch,
    NotActivated,
    StakingPeriodActive { eligible_epoch: Epoch },
    WithdrawableEpochUnknown,
    NotYetWithdrawable { withdrawable_epoch: Epoch },
    NothingForStatus(MinipoolStatus),
}

/// An evaluation with its reason when nothing is to be done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assessment {
    Act(LifecycleAction),
    Skipped(SkipReason),
}

impl Assessment {
    pub fn into_action(self) -> LifecycleAction {
        match self {
            Self::Act(action) => action,
            Self::Skipped(_) => LifecycleAction::None,
        }
    }
}

/// Epoch from which a staking validator may log out.
pub fn exit_eligible_epoch(activation_epoch: Epoch, staking_duration: u64) -> Epoch {
    activation_epoch.saturating_add(staking_duration)
}

/// Decide the next action for `minipool`.
pub fn evaluate(minipool: &MinipoolDetails, facts: &ValidatorFacts, params: &EvaluationParams) -> LifecycleAction {
    assess(minipool, facts, params).into_action()
}

/// Like [`evaluate`], keeping the reason for a `None`.
pub fn assess(minipool: &MinipoolDetails, facts: &ValidatorFacts, params: &EvaluationParams) -> Assessment {
    if !facts.exists {
        return Assessment::Skipped(SkipReason::ValidatorNotFound);
    }

    match minipool.status {
        MinipoolStatus::Prelaunch => assess_prelaunch(minipool, params),
        MinipoolStatus::Staking => {
            let Some(activation) = facts.activation_epoch else {
                return Assessment::Skipped(SkipReason::NotActivated);
            };
            let eligible_epoch = exit_eligible_epoch(activation, minipool.staking_duration);
            if params.current_epoch >= eligible_epoch {
                Assessment::Act(LifecycleAction::LogOut)
            } else {
                Assessment::Skipped(SkipReason::StakingPeriodActive { eligible_epoch })
            }
        }
        MinipoolStatus::LoggedOut => {
            let Some(withdrawable_epoch) = facts.withdrawable_epoch else {
                return Assessment::Skipped(SkipReason::WithdrawableEpochUnknown);
            };
            if params.current_epoch >= withdrawable_epoch {
                Assessment::Act(LifecycleAction::Withdraw {
                    balance_gwei: facts.balance_gwei,
                })
            } else {
                Assessment::Skipped(SkipReason::NotYetWithdrawable { withdrawable_epoch })
            }
        }
        other => Assessment::Skipped(SkipReason::NothingForStatus(other)),
    }
}

fn assess_prelaunch(minipool: &MinipoolDetails, params: &EvaluationParams) -> Assessment {
    let Some(credentials) = params.withdrawal_credentials else {
        return Assessment::Skipped(SkipReason::CredentialsMissing);
    };
    let Some(deposit) = &params.deposit else {
        return Assessment::Skipped(SkipReason::KeyUnavailable);
    };
    if deposit.pubkey != minipool.validator_pubkey || deposit.withdrawal_credentials != credentials {
        return Assessment::Skipped(SkipReason::DepositMismatch);
    }
    Assessment::Act(LifecycleAction::Stake {
        withdrawal_credentials: credentials,
        deposit: deposit.clone(),
    })
}
