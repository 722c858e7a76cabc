//! Interfaces to the chain, the beacon node, the validator keystore and the
//! transaction signer. Implementations live outside this crate; the in-memory
//! ones in [`crate::testing`] back dry runs and tests.

use async_trait::async_trait;
use stakenode_core::{
    ActionKind, ChainError, DepositData, Epoch, EventName, LifecycleAction, MinipoolAddress,
    MinipoolDetails, NodeAddress, TxHash, TxReceipt, ValidatorFacts, ValidatorPubkey,
    WithdrawalCredentials,
};

/// Which on-chain minipool registry to enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registry {
    /// Minipools owned by one node operator.
    Node(NodeAddress),
    /// Every minipool in the network.
    Network,
}

/// Read-only protocol contract state.
#[async_trait]
pub trait ChainState: Send + Sync {
    async fn minipool_addresses(&self, registry: Registry) -> Result<Vec<MinipoolAddress>, ChainError>;

    async fn minipool_details(&self, minipool: MinipoolAddress) -> Result<MinipoolDetails, ChainError>;

    /// `None` until the protocol has withdrawal credentials configured for the minipool.
    async fn withdrawal_credentials(
        &self,
        minipool: MinipoolAddress,
    ) -> Result<Option<WithdrawalCredentials>, ChainError>;

    /// Oracle DAO membership of `node`.
    async fn is_trusted_node(&self, node: NodeAddress) -> Result<bool, ChainError>;
}

/// Beacon node queries.
#[async_trait]
pub trait BeaconClient: Send + Sync {
    async fn current_epoch(&self) -> Result<Epoch, ChainError>;

    async fn validator_facts(&self, pubkey: ValidatorPubkey) -> Result<ValidatorFacts, ChainError>;
}

/// Local validator keystore.
pub trait ValidatorKeys: Send + Sync {
    /// Signed deposit for `pubkey`, or `None` when this node does not hold the key.
    fn deposit_data(
        &self,
        minipool: &MinipoolAddress,
        pubkey: &ValidatorPubkey,
        withdrawal_credentials: &WithdrawalCredentials,
    ) -> Option<DepositData>;
}

/// Signs and sends transactions from the node account.
#[async_trait]
pub trait Transactor: Send + Sync {
    /// Build, sign and broadcast. Returns once the transaction is accepted
    /// into the mempool, before it is mined.
    async fn submit(&self, call: &ContractCall) -> Result<TxHash, ChainError>;

    /// Wait for `tx_hash` to be mined.
    async fn receipt(&self, tx_hash: TxHash) -> Result<TxReceipt, ChainError>;
}

/// A contract call ready for signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractCall {
    Stake {
        minipool: MinipoolAddress,
        pubkey: ValidatorPubkey,
        withdrawal_credentials: WithdrawalCredentials,
        signature: Vec<u8>,
        deposit_data_root: [u8; 32],
    },
    LogOut {
        minipool: MinipoolAddress,
    },
    Withdraw {
        minipool: MinipoolAddress,
        balance_gwei: u64,
    },
}

impl ContractCall {
    /// `None` for [`LifecycleAction::None`].
    pub fn from_action(minipool: MinipoolAddress, action: &LifecycleAction) -> Option<Self> {
        match action {
            LifecycleAction::None => None,
            LifecycleAction::Stake {
                withdrawal_credentials,
                deposit,
            } => Some(Self::Stake {
                minipool,
                pubkey: deposit.pubkey,
                withdrawal_credentials: *withdrawal_credentials,
                signature: deposit.signature.clone(),
                deposit_data_root: deposit.deposit_data_root,
            }),
            LifecycleAction::LogOut => Some(Self::LogOut { minipool }),
            LifecycleAction::Withdraw { balance_gwei } => Some(Self::Withdraw {
                minipool,
                balance_gwei: *balance_gwei,
            }),
        }
    }

    pub fn minipool(&self) -> MinipoolAddress {
        match self {
            Self::Stake { minipool, .. }
            | Self::LogOut { minipool }
            | Self::Withdraw { minipool, .. } => *minipool,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Stake { .. } => ActionKind::Stake,
            Self::LogOut { .. } => ActionKind::LogOut,
            Self::Withdraw { .. } => ActionKind::Withdraw,
        }
    }

    /// Contract method name, for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Self::Stake { .. } => "stake",
            Self::LogOut { .. } => "submitMinipoolLogout",
            Self::Withdraw { .. } => "submitMinipoolWithdrawable",
        }
    }

    /// Event that confirms the call took effect.
    pub fn expected_event(&self) -> EventName {
        match self {
            Self::Stake { .. } => EventName::MinipoolStaked,
            Self::LogOut { .. } => EventName::MinipoolLoggedOut,
            Self::Withdraw { .. } => EventName::MinipoolWithdrawn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stakenode_core::Address;

    #[test]
    fn test_from_action_none_is_none() {
        assert!(ContractCall::from_action(Address::repeat_byte(1), &LifecycleAction::None).is_none());
    }

    #[test]
    fn test_from_action_stake_carries_deposit() {
        let minipool = Address::repeat_byte(1);
        let creds = WithdrawalCredentials::for_address(&minipool);
        let deposit = DepositData {
            pubkey: ValidatorPubkey::repeat_byte(2),
            withdrawal_credentials: creds,
            amount_gwei: 31_000_000_000,
            signature: vec![7u8; 96],
            deposit_data_root: [3u8; 32],
        };
        let call = ContractCall::from_action(
            minipool,
            &LifecycleAction::Stake {
                withdrawal_credentials: creds,
                deposit: deposit.clone(),
            },
        )
        .unwrap();

        assert_eq!(call.minipool(), minipool);
        assert_eq!(call.kind(), ActionKind::Stake);
        assert_eq!(call.expected_event(), EventName::MinipoolStaked);
        match call {
            ContractCall::Stake { pubkey, signature, .. } => {
                assert_eq!(pubkey, deposit.pubkey);
                assert_eq!(signature, deposit.signature);
            }
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn test_withdraw_call() {
        let minipool = Address::repeat_byte(4);
        let call = ContractCall::from_action(minipool, &LifecycleAction::Withdraw { balance_gwei: 32 }).unwrap();
        assert_eq!(call.kind(), ActionKind::Withdraw);
        assert_eq!(call.method(), "submitMinipoolWithdrawable");
        assert_eq!(call, ContractCall::Withdraw { minipool, balance_gwei: 32 });
    }
}
