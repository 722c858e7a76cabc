//! Transaction receipts and the protocol events parsed from them.

use serde::{Deserialize, Serialize};

use crate::{MinipoolAddress, TxHash, ValidatorPubkey};

/// Names of the events the executor waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    MinipoolStaked,
    MinipoolLoggedOut,
    MinipoolWithdrawn,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinipoolStaked => "MinipoolStaked",
            Self::MinipoolLoggedOut => "MinipoolLoggedOut",
            Self::MinipoolWithdrawn => "MinipoolWithdrawn",
        }
    }
}

/// Decoded contract event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractEvent {
    MinipoolStaked {
        minipool: MinipoolAddress,
        pubkey: ValidatorPubkey,
    },
    MinipoolLoggedOut {
        minipool: MinipoolAddress,
    },
    MinipoolWithdrawn {
        minipool: MinipoolAddress,
        node_amount_gwei: u64,
        user_amount_gwei: u64,
    },
    /// Any log this daemon does not decode.
    Other { name: String },
}

impl ContractEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::MinipoolStaked { .. } => EventName::MinipoolStaked.as_str(),
            Self::MinipoolLoggedOut { .. } => EventName::MinipoolLoggedOut.as_str(),
            Self::MinipoolWithdrawn { .. } => EventName::MinipoolWithdrawn.as_str(),
            Self::Other { name } => name.as_str(),
        }
    }

    pub fn minipool(&self) -> Option<&MinipoolAddress> {
        match self {
            Self::MinipoolStaked { minipool, .. }
            | Self::MinipoolLoggedOut { minipool }
            | Self::MinipoolWithdrawn { minipool, .. } => Some(minipool),
            Self::Other { .. } => None,
        }
    }
}

/// Mined transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: u64,
    /// `false` when the transaction reverted.
    pub success: bool,
    pub gas_used: u64,
    /// Decoded logs, in emission order.
    pub events: Vec<ContractEvent>,
}

impl TxReceipt {
    /// First event named `name` emitted for `minipool`.
    pub fn find_event(&self, name: EventName, minipool: &MinipoolAddress) -> Option<&ContractEvent> {
        self.events
            .iter()
            .find(|e| e.name() == name.as_str() && e.minipool() == Some(minipool))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    #[test]
    fn test_find_event_matches_name_and_minipool() {
        let a = Address::repeat_byte(1);
        let b = Address::repeat_byte(2);
        let receipt = TxReceipt {
            tx_hash: TxHash::repeat_byte(9),
            block_number: 100,
            success: true,
            gas_used: 21_000,
            events: vec![
                ContractEvent::Other { name: "Transfer".into() },
                ContractEvent::MinipoolLoggedOut { minipool: b },
                ContractEvent::MinipoolLoggedOut { minipool: a },
            ],
        };

        let found = receipt.find_event(EventName::MinipoolLoggedOut, &a).unwrap();
        assert_eq!(found.minipool(), Some(&a));
        assert!(receipt.find_event(EventName::MinipoolWithdrawn, &a).is_none());
    }
}
