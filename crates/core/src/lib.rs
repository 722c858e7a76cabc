//! Stakenode Core
//!
//! Domain types, errors, and identifiers shared by all stakenode crates.

pub mod action;
pub mod beacon;
pub mod minipool;
pub mod tx;

pub use action::{ActionKind, DepositData, LifecycleAction};
pub use beacon::{Epoch, ValidatorFacts, FAR_FUTURE_EPOCH};
pub use minipool::{MinipoolDetails, MinipoolStatus, StatusChange};
pub use tx::{ContractEvent, EventName, TxReceipt};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors surfaced by chain, beacon and transaction collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error("beacon node error: {0}")]
    Beacon(String),
    #[error("minipool {0} not found")]
    MinipoolNotFound(Address),
    #[error("transaction {0} not found")]
    TransactionNotFound(TxHash),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("timeout")]
    Timeout,
}

/// Errors from parsing hex-encoded identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex: {0}")]
    Hex(String),
    #[error("expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            /// Fill every byte with `b`. Handy for fixtures.
            pub const fn repeat_byte(b: u8) -> Self {
                Self([b; $len])
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let stripped = s.strip_prefix("0x").unwrap_or(s);
                let raw = hex::decode(stripped).map_err(|e| ParseError::Hex(e.to_string()))?;
                let bytes: [u8; $len] = raw.as_slice().try_into().map_err(|_| {
                    ParseError::Length {
                        expected: $len,
                        actual: raw.len(),
                    }
                })?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 20-byte execution-layer account address (node accounts and minipool contracts).
    Address,
    20
);

fixed_bytes!(
    /// 48-byte BLS validator public key.
    ValidatorPubkey,
    48
);

fixed_bytes!(
    /// 32-byte transaction hash.
    TxHash,
    32
);

fixed_bytes!(
    /// 32-byte beacon-chain withdrawal credentials.
    WithdrawalCredentials,
    32
);

/// Identifier of a managed minipool contract.
pub type MinipoolAddress = Address;

/// Identifier of a node operator account.
pub type NodeAddress = Address;

impl WithdrawalCredentials {
    /// Execution-address (0x01) credentials pointing at `address`.
    pub fn for_address(address: &Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[12..].copy_from_slice(&address.0);
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = Address::repeat_byte(0xab);
        let text = addr.to_string();
        assert!(text.starts_with("0xabab"));
        assert_eq!(text.len(), 2 + 40);
        assert_eq!(text.parse::<Address>().unwrap(), addr);
        // Prefix is optional.
        assert_eq!(text[2..].parse::<Address>().unwrap(), addr);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            "0x1234".parse::<Address>(),
            Err(ParseError::Length { expected: 20, actual: 2 })
        ));
        assert!(matches!("0xzz".parse::<TxHash>(), Err(ParseError::Hex(_))));
    }

    #[test]
    fn test_pubkey_serde() {
        let pk = ValidatorPubkey::repeat_byte(7);
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk));
        let parsed: ValidatorPubkey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pk);
    }

    #[test]
    fn test_withdrawal_credentials_for_address() {
        let addr = Address::repeat_byte(0x42);
        let creds = WithdrawalCredentials::for_address(&addr);
        assert_eq!(creds.0[0], 0x01);
        assert!(creds.0[1..12].iter().all(|b| *b == 0));
        assert_eq!(&creds.0[12..], &addr.0);
    }
}
