//! Domain registry operations
//!
//! Each operation names its contract call, the state it requires before a
//! write is attempted, and the gas limit it is sent with by default.

use crate::error::{OpsError, OpsResult};

use ethers::types::{Address, U256};
use serde::Serialize;
use sha3::{Digest, Keccak256};

/// Default gas limit for most registry writes
pub const DEFAULT_GAS_LIMIT: u64 = 10_000_000;

/// Default gas limit for a single record write
pub const SET_RECORD_GAS_LIMIT: u64 = 300_000;

/// Default gas limit for a base URI change
pub const SET_BASE_URI_GAS_LIMIT: u64 = 300_000;

/// Off-chain token id for a Plus Code: keccak256 of its UTF-8 bytes
pub fn token_id(plus_code: &str) -> U256 {
    let digest = Keccak256::digest(plus_code.as_bytes());
    U256::from_big_endian(&digest)
}

/// A key/value record stored against a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Pair up parallel key and value lists
    pub fn zip(
        keys: Vec<String>,
        values: Vec<String>,
        operation: &'static str,
    ) -> OpsResult<Vec<Record>> {
        if keys.len() != values.len() {
            return Err(OpsError::InvalidArguments {
                operation,
                reason: format!("{} keys but {} values", keys.len(), values.len()),
            });
        }

        Ok(keys
            .into_iter()
            .zip(values)
            .map(|(key, value)| Record { key, value })
            .collect())
    }

    pub fn split(records: &[Record]) -> (Vec<String>, Vec<String>) {
        records
            .iter()
            .map(|r| (r.key.clone(), r.value.clone()))
            .unzip()
    }
}

/// Required token state before a write is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    TokenAbsent(U256),
    TokenPresent(U256),
}

/// A logical registry write
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Mint {
        plus_code: String,
        /// Payment in wei; absent or zero means the current mint price
        payment: Option<U256>,
    },
    MintWithRecords {
        plus_code: String,
        records: Vec<Record>,
        payment: Option<U256>,
    },
    Burn {
        plus_code: String,
    },
    SetRecord {
        plus_code: String,
        record: Record,
    },
    SetMany {
        plus_code: String,
        records: Vec<Record>,
    },
    SetUser {
        plus_code: String,
        user: Address,
        /// UNIX seconds
        expires: u64,
    },
    SetBaseUri {
        uri: String,
    },
    Withdraw {
        /// Payee; defaults to the contract owner
        to: Option<Address>,
        /// Amount in wei; absent or zero means the whole balance
        amount: Option<U256>,
    },
    WithdrawToken {
        token: Address,
        to: Option<Address>,
        amount: Option<U256>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Mint { .. } => "mint",
            Operation::MintWithRecords { .. } => "mint-with-records",
            Operation::Burn { .. } => "burn",
            Operation::SetRecord { .. } => "set-record",
            Operation::SetMany { .. } => "set-many",
            Operation::SetUser { .. } => "set-user",
            Operation::SetBaseUri { .. } => "set-base-uri",
            Operation::Withdraw { .. } => "withdraw",
            Operation::WithdrawToken { .. } => "withdraw-token",
        }
    }

    pub fn plus_code(&self) -> Option<&str> {
        match self {
            Operation::Mint { plus_code, .. }
            | Operation::MintWithRecords { plus_code, .. }
            | Operation::Burn { plus_code }
            | Operation::SetRecord { plus_code, .. }
            | Operation::SetMany { plus_code, .. }
            | Operation::SetUser { plus_code, .. } => Some(plus_code),
            _ => None,
        }
    }

    pub fn token_id(&self) -> Option<U256> {
        self.plus_code().map(token_id)
    }

    pub fn precondition(&self) -> Precondition {
        match (self, self.token_id()) {
            (Operation::Mint { .. } | Operation::MintWithRecords { .. }, Some(id)) => {
                Precondition::TokenAbsent(id)
            }
            (_, Some(id)) => Precondition::TokenPresent(id),
            (_, None) => Precondition::None,
        }
    }

    /// Gas limit sent when the caller gives no override
    pub fn default_gas_limit(&self) -> Option<u64> {
        match self {
            Operation::SetRecord { .. } => Some(SET_RECORD_GAS_LIMIT),
            Operation::SetBaseUri { .. } => Some(SET_BASE_URI_GAS_LIMIT),
            Operation::Withdraw { .. } | Operation::WithdrawToken { .. } => None,
            _ => Some(DEFAULT_GAS_LIMIT),
        }
    }

    /// Argument checks that need no chain state
    pub fn validate(&self) -> OpsResult<()> {
        let operation = self.name();
        if let Some(plus_code) = self.plus_code() {
            if plus_code.trim().is_empty() {
                return Err(OpsError::InvalidArguments {
                    operation,
                    reason: "plus code is empty".to_string(),
                });
            }
        }

        match self {
            Operation::MintWithRecords { records, .. } | Operation::SetMany { records, .. }
                if records.is_empty() =>
            {
                Err(OpsError::InvalidArguments {
                    operation,
                    reason: "at least one record is required".to_string(),
                })
            }
            Operation::SetRecord { record, .. } if record.key.is_empty() => {
                Err(OpsError::InvalidArguments {
                    operation,
                    reason: "record key is empty".to_string(),
                })
            }
            Operation::SetBaseUri { uri } if uri.is_empty() => Err(OpsError::InvalidArguments {
                operation,
                reason: "base URI is empty".to_string(),
            }),
            _ => Ok(()),
        }
    }
}
