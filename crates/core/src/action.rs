//! Lifecycle actions decided for a minipool.

use serde::{Deserialize, Serialize};

use crate::{ValidatorPubkey, WithdrawalCredentials};

/// Signed beacon deposit for the second stage of a minipool deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositData {
    pub pubkey: ValidatorPubkey,
    pub withdrawal_credentials: WithdrawalCredentials,
    /// Deposit amount in gwei.
    pub amount_gwei: u64,
    /// BLS signature over the deposit message (96 bytes).
    pub signature: Vec<u8>,
    pub deposit_data_root: [u8; 32],
}

/// The next thing a minipool needs. At most one per evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleAction {
    None,
    Stake {
        withdrawal_credentials: WithdrawalCredentials,
        deposit: DepositData,
    },
    LogOut,
    Withdraw {
        /// Validator balance observed when the withdrawal was decided.
        balance_gwei: u64,
    },
}

/// Discriminant of a non-empty [`LifecycleAction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Stake,
    LogOut,
    Withdraw,
}

impl LifecycleAction {
    /// `None` for `LifecycleAction::None`.
    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            Self::None => None,
            Self::Stake { .. } => Some(ActionKind::Stake),
            Self::LogOut => Some(ActionKind::LogOut),
            Self::Withdraw { .. } => Some(ActionKind::Withdraw),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Stake => "stake",
            Self::LogOut => "log_out",
            Self::Withdraw => "withdraw",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
