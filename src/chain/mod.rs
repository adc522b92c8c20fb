//! Chain module - the boundary to the blockchain client and contract state
//!
//! This module provides:
//! - The `ChainClient` write interface (submit a call, get a pending handle)
//! - The `ChainState` read interface used by preconditions and reports
//! - The ethers-backed `RegistryProvider` implementing both

pub mod provider;

pub use provider::RegistryProvider;

use crate::error::OpsResult;
use crate::registry::Record;
use crate::tx::PendingRequest;

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, TxHash, I256, U256, U64};

/// A fully resolved contract write
#[derive(Debug, Clone, PartialEq)]
pub enum ContractCall {
    Mint {
        plus_code: String,
    },
    MintWithRecords {
        plus_code: String,
        keys: Vec<String>,
        values: Vec<String>,
    },
    Burn {
        token_id: U256,
    },
    Set {
        key: String,
        value: String,
        token_id: U256,
    },
    SetMany {
        keys: Vec<String>,
        values: Vec<String>,
        token_id: U256,
    },
    SetUser {
        token_id: U256,
        user: Address,
        expires: u64,
    },
    SetBaseUri {
        uri: String,
    },
    Withdraw {
        to: Address,
        amount: U256,
    },
    WithdrawErc20 {
        token: Address,
        to: Address,
        amount: U256,
    },
}

impl ContractCall {
    /// Solidity function name
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::Mint { .. } => "mint",
            ContractCall::MintWithRecords { .. } => "mintWithRecords",
            ContractCall::Burn { .. } => "burn",
            ContractCall::Set { .. } => "set",
            ContractCall::SetMany { .. } => "setMany",
            ContractCall::SetUser { .. } => "setUser",
            ContractCall::SetBaseUri { .. } => "setBaseURI",
            ContractCall::Withdraw { .. } => "withdraw",
            ContractCall::WithdrawErc20 { .. } => "withdrawErc20",
        }
    }

    /// Positional arguments rendered for logs
    pub fn args(&self) -> Vec<String> {
        match self {
            ContractCall::Mint { plus_code } => vec![plus_code.clone()],
            ContractCall::MintWithRecords {
                plus_code,
                keys,
                values,
            } => vec![plus_code.clone(), keys.join(","), values.join(",")],
            ContractCall::Burn { token_id } => vec![token_id.to_string()],
            ContractCall::Set {
                key,
                value,
                token_id,
            } => vec![key.clone(), value.clone(), token_id.to_string()],
            ContractCall::SetMany {
                keys,
                values,
                token_id,
            } => vec![keys.join(","), values.join(","), token_id.to_string()],
            ContractCall::SetUser {
                token_id,
                user,
                expires,
            } => vec![
                token_id.to_string(),
                format!("{:?}", user),
                expires.to_string(),
            ],
            ContractCall::SetBaseUri { uri } => vec![uri.clone()],
            ContractCall::Withdraw { to, amount } => {
                vec![format!("{:?}", to), amount.to_string()]
            }
            ContractCall::WithdrawErc20 { token, to, amount } => vec![
                format!("{:?}", token),
                format!("{:?}", to),
                amount.to_string(),
            ],
        }
    }
}

/// One outbound request handed to the chain client
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCall {
    /// Operator-facing operation name (e.g. "set-user")
    pub operation: &'static str,
    pub call: ContractCall,
    /// Gas limit override; `None` lets the client estimate
    pub gas_limit: Option<u64>,
    /// Native currency attached to the call
    pub value: Option<U256>,
}

/// Confirmation record for a finalized request
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub transaction_hash: TxHash,
    pub success: bool,
    pub gas_used: U256,
    pub effective_gas_price: Option<U256>,
    /// Nominal price from the transaction itself
    pub gas_price: Option<U256>,
    pub block_number: Option<u64>,
}

impl From<&TransactionReceipt> for Receipt {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self {
            transaction_hash: receipt.transaction_hash,
            // pre-Byzantium receipts carry no status
            success: receipt.status != Some(U64::zero()),
            gas_used: receipt.gas_used.unwrap_or(receipt.cumulative_gas_used),
            effective_gas_price: receipt.effective_gas_price,
            gas_price: None,
            block_number: receipt.block_number.map(|b| b.as_u64()),
        }
    }
}

/// Write side of the chain client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hand one call to the network.
    ///
    /// Returns `OpsError::SubmissionRejected` when the client refuses the
    /// call before it reaches the network. Confirmation or rejection is
    /// delivered later through the returned handle.
    async fn submit(&self, call: OutboundCall) -> OpsResult<PendingRequest>;
}

/// Read-only view of registry state
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainState: Send + Sync {
    /// Address of the domain registry contract
    fn registry_address(&self) -> Address;

    async fn token_exists(&self, token_id: U256) -> OpsResult<bool>;

    /// Current mint price in wei
    async fn mint_price(&self) -> OpsResult<U256>;

    /// Mint price in USD, 18 decimals
    async fn mint_cost_usd(&self) -> OpsResult<U256>;

    /// Latest answer of the registry's native/USD price feed
    async fn feed_data(&self) -> OpsResult<I256>;

    async fn owner(&self) -> OpsResult<Address>;

    async fn native_balance(&self, account: Address) -> OpsResult<U256>;

    async fn token_balance(&self, token: Address, account: Address) -> OpsResult<U256>;

    async fn user_of(&self, token_id: U256) -> OpsResult<Address>;

    async fn user_expires(&self, token_id: U256) -> OpsResult<U256>;

    async fn records_of(&self, token_id: U256) -> OpsResult<Vec<Record>>;

    async fn base_uri(&self) -> OpsResult<String>;
}
