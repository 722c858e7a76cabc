//! Minipool lifecycle status and on-chain details.

use serde::{Deserialize, Serialize};

use crate::{MinipoolAddress, ValidatorPubkey};

/// Lifecycle state of a minipool as recorded by the protocol contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MinipoolStatus {
    Initialized = 0,
    Prelaunch = 1,
    Staking = 2,
    LoggedOut = 3,
    Withdrawn = 4,
    Dissolved = 5,
}

impl MinipoolStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initialized),
            1 => Some(Self::Prelaunch),
            2 => Some(Self::Staking),
            3 => Some(Self::LoggedOut),
            4 => Some(Self::Withdrawn),
            5 => Some(Self::Dissolved),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Prelaunch => "prelaunch",
            Self::Staking => "staking",
            Self::LoggedOut => "logged_out",
            Self::Withdrawn => "withdrawn",
            Self::Dissolved => "dissolved",
        }
    }

    /// Terminal minipools leave the working set for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Withdrawn | Self::Dissolved)
    }
}

impl std::fmt::Display for MinipoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// When the status last changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Execution-layer block number.
    pub block: u64,
    /// Unix timestamp in seconds.
    pub time: u64,
}

/// One managed minipool as reported by the chain registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinipoolDetails {
    pub address: MinipoolAddress,
    /// Status as last reported by the minipool contract.
    pub status: MinipoolStatus,
    pub status_changed: StatusChange,
    /// Epochs the validator must stay active before it may log out.
    pub staking_duration: u64,
    /// Pubkey of the validator this minipool deposited for.
    pub validator_pubkey: ValidatorPubkey,
}

impl MinipoolDetails {
    pub fn new(
        address: MinipoolAddress,
        status: MinipoolStatus,
        staking_duration: u64,
        validator_pubkey: ValidatorPubkey,
    ) -> Self {
        Self {
            address,
            status,
            status_changed: StatusChange::default(),
            staking_duration,
            validator_pubkey,
        }
    }

    pub fn with_status_changed(mut self, block: u64, time: u64) -> Self {
        self.status_changed = StatusChange { block, time };
        self
    }
}
