//! Beacon-chain facts observed for a validator.

use serde::{Deserialize, Serialize};

/// Beacon-chain epoch number.
pub type Epoch = u64;

/// Sentinel the beacon API uses for "not scheduled".
pub const FAR_FUTURE_EPOCH: Epoch = u64::MAX;

/// Validator state as seen on the beacon chain. Refetched every cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorFacts {
    /// `false` when the beacon node does not know the pubkey.
    pub exists: bool,
    /// `None` while the validator is not yet scheduled for activation.
    pub activation_epoch: Option<Epoch>,
    pub exit_epoch: Option<Epoch>,
    /// `None` until an exit has been initiated.
    pub withdrawable_epoch: Option<Epoch>,
    /// Current balance on the beacon chain.
    pub balance_gwei: u64,
}

impl ValidatorFacts {
    /// The beacon chain has no record of the validator.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Build from raw beacon API epochs, mapping [`FAR_FUTURE_EPOCH`] to `None`.
    pub fn from_beacon(
        activation_epoch: Epoch,
        exit_epoch: Epoch,
        withdrawable_epoch: Epoch,
        balance_gwei: u64,
    ) -> Self {
        let scheduled = |e: Epoch| (e != FAR_FUTURE_EPOCH).then_some(e);
        Self {
            exists: true,
            activation_epoch: scheduled(activation_epoch),
            exit_epoch: scheduled(exit_epoch),
            withdrawable_epoch: scheduled(withdrawable_epoch),
            balance_gwei,
        }
    }

    pub fn is_active_at(&self, epoch: Epoch) -> bool {
        match (self.exists, self.activation_epoch) {
            (true, Some(activation)) => {
                activation <= epoch && self.exit_epoch.map_or(true, |exit| epoch < exit)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_beacon_maps_far_future() {
        let facts = ValidatorFacts::from_beacon(10, FAR_FUTURE_EPOCH, FAR_FUTURE_EPOCH, 32_000_000_000);
        assert!(facts.exists);
        assert_eq!(facts.activation_epoch, Some(10));
        assert_eq!(facts.exit_epoch, None);
        assert_eq!(facts.withdrawable_epoch, None);
    }

    #[test]
    fn test_is_active_at() {
        let facts = ValidatorFacts::from_beacon(10, 20, 30, 0);
        assert!(!facts.is_active_at(9));
        assert!(facts.is_active_at(10));
        assert!(facts.is_active_at(19));
        assert!(!facts.is_active_at(20));
        assert!(!ValidatorFacts::not_found().is_active_at(15));
    }
}
