//! Batch files: several independent operations run side by side
//!
//! ```toml
//! [[operation]]
//! kind = "set-record"
//! plus_code = "8FVC9G8F+6X"
//! key = "website"
//! value = "https://example.com"
//!
//! [[operation]]
//! kind = "withdraw"
//! amount = "1000000000000000"
//! gas_limit = 100000
//! ```

use crate::error::{OpsError, OpsResult};
use crate::registry::{Operation, Record};

use ethers::types::{Address, U256};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchFile {
    #[serde(default, rename = "operation")]
    operations: Vec<Entry>,
}

/// One `[[operation]]` table. Which fields apply depends on `kind`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Entry {
    kind: String,
    plus_code: Option<String>,
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    values: Vec<String>,
    user: Option<String>,
    expires: Option<u64>,
    uri: Option<String>,
    token: Option<String>,
    to: Option<String>,
    /// Wei, as a decimal string
    amount: Option<String>,
    /// Wei, as a decimal string
    payment: Option<String>,
    gas_limit: Option<u64>,
}

/// Read a batch file into operations and their gas limit overrides
pub fn load(path: &Path) -> OpsResult<Vec<(Operation, Option<u64>)>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        invalid(format!("failed to read batch file {}: {}", path.display(), e))
    })?;
    parse(&content)
}

pub fn parse(content: &str) -> OpsResult<Vec<(Operation, Option<u64>)>> {
    let file: BatchFile =
        toml::from_str(content).map_err(|e| invalid(format!("malformed batch file: {}", e)))?;
    if file.operations.is_empty() {
        return Err(invalid("batch file lists no operations".to_string()));
    }

    file.operations
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let gas_limit = entry.gas_limit;
            let operation = entry
                .into_operation()
                .map_err(|reason| invalid(format!("operation #{}: {}", index + 1, reason)))?;
            Ok((operation, gas_limit))
        })
        .collect()
}

impl Entry {
    fn into_operation(self) -> Result<Operation, String> {
        let operation = match self.kind.as_str() {
            "mint" => Operation::Mint {
                plus_code: required(self.plus_code, "plus_code")?,
                payment: optional_amount(self.payment.as_deref())?,
            },
            "mint-with-records" => Operation::MintWithRecords {
                plus_code: required(self.plus_code, "plus_code")?,
                records: records(self.keys, self.values)?,
                payment: optional_amount(self.payment.as_deref())?,
            },
            "burn" => Operation::Burn {
                plus_code: required(self.plus_code, "plus_code")?,
            },
            "set-record" => Operation::SetRecord {
                plus_code: required(self.plus_code, "plus_code")?,
                record: Record::new(required(self.key, "key")?, required(self.value, "value")?),
            },
            "set-many" => Operation::SetMany {
                plus_code: required(self.plus_code, "plus_code")?,
                records: records(self.keys, self.values)?,
            },
            "set-user" => Operation::SetUser {
                plus_code: required(self.plus_code, "plus_code")?,
                user: address(&required(self.user, "user")?)?,
                expires: required(self.expires, "expires")?,
            },
            "set-base-uri" => Operation::SetBaseUri {
                uri: required(self.uri, "uri")?,
            },
            "withdraw" => Operation::Withdraw {
                to: self.to.as_deref().map(address).transpose()?,
                amount: optional_amount(self.amount.as_deref())?,
            },
            "withdraw-token" => Operation::WithdrawToken {
                token: address(&required(self.token, "token")?)?,
                to: self.to.as_deref().map(address).transpose()?,
                amount: optional_amount(self.amount.as_deref())?,
            },
            other => return Err(format!("unknown kind {:?}", other)),
        };

        Ok(operation)
    }
}

fn invalid(reason: String) -> OpsError {
    OpsError::InvalidArguments {
        operation: "batch",
        reason,
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, String> {
    value.ok_or_else(|| format!("missing {}", field))
}

fn records(keys: Vec<String>, values: Vec<String>) -> Result<Vec<Record>, String> {
    Record::zip(keys, values, "batch").map_err(|e| e.to_string())
}

fn address(value: &str) -> Result<Address, String> {
    value
        .parse::<Address>()
        .map_err(|e| format!("invalid address {:?}: {}", value, e))
}

fn optional_amount(value: Option<&str>) -> Result<Option<U256>, String> {
    value
        .map(|v| U256::from_dec_str(v).map_err(|e| format!("invalid amount {:?}: {}", v, e)))
        .transpose()
}
