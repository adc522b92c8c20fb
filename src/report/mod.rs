//! Outcome reports
//!
//! Projects a terminal [`Outcome`] plus the before/after state read around
//! it into a display-ready summary. All operator-facing formatting lives
//! here; nothing in this module talks to the chain.

use crate::error::{OpsError, OpsResult};
use crate::lifecycle::{Outcome, OutcomeStatus};
use crate::registry::Record;

use chrono::{TimeZone, Utc};
use ethers::types::{Address, U256};
use ethers::utils::format_ether;
use serde::{Serialize, Serializer};
use std::fmt::Write;

/// Unit a balance is denominated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Native currency, shown in wei and ether
    Wei,
    /// Smallest unit of an ERC-20 token
    TokenUnits,
}

/// One piece of domain state shown alongside the outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Fact {
    /// An amount quoted or attached before the write
    Amount {
        label: String,
        #[serde(serialize_with = "decimal")]
        amount: U256,
        unit: Unit,
    },
    /// A balance read before and after the write
    Balance {
        label: String,
        #[serde(serialize_with = "decimal")]
        before: U256,
        #[serde(serialize_with = "decimal")]
        after: U256,
        unit: Unit,
    },
    /// Any other value read before and/or after the write
    Value {
        label: String,
        before: Option<String>,
        after: Option<String>,
    },
    /// Records stored against a token after the write
    Records { records: Vec<Record> },
    /// State that could not be read after the outcome was known
    Unavailable { label: String, reason: String },
}

impl Fact {
    pub fn value(
        label: impl Into<String>,
        before: Option<String>,
        after: Option<String>,
    ) -> Self {
        Fact::Value {
            label: label.into(),
            before,
            after,
        }
    }

    /// A value known only at one point, such as a quote read before the write
    pub fn reading(label: impl Into<String>, value: impl Into<String>) -> Self {
        Fact::Value {
            label: label.into(),
            before: None,
            after: Some(value.into()),
        }
    }

    pub fn balance(label: impl Into<String>, before: U256, after: U256, unit: Unit) -> Self {
        Fact::Balance {
            label: label.into(),
            before,
            after,
            unit,
        }
    }
}

/// Display-ready summary of one operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub operation: &'static str,
    pub lifecycle_id: String,
    /// Domain registry the write was sent to
    pub registry: Option<String>,
    pub plus_code: Option<String>,
    #[serde(serialize_with = "optional_decimal")]
    pub token_id: Option<U256>,
    pub status: OutcomeStatus,
    pub request_id: Option<String>,
    #[serde(serialize_with = "optional_decimal")]
    pub gas_used: Option<U256>,
    #[serde(serialize_with = "optional_decimal")]
    pub gas_price: Option<U256>,
    #[serde(serialize_with = "optional_decimal")]
    pub gas_cost: Option<U256>,
    pub submitted_at: String,
    pub elapsed_secs: f64,
    pub diagnostic: Option<String>,
    pub facts: Vec<Fact>,
}

impl Report {
    /// Project an outcome and its surrounding state. Pure.
    pub fn project(outcome: &Outcome, facts: Vec<Fact>) -> Self {
        let gas = outcome.gas();
        Self {
            operation: outcome.operation(),
            lifecycle_id: outcome.lifecycle_id().to_string(),
            registry: None,
            plus_code: None,
            token_id: None,
            status: outcome.status(),
            request_id: outcome
                .request_id()
                .map(|id| format!("0x{}", hex::encode(id.as_bytes()))),
            gas_used: gas.map(|g| g.gas_used),
            gas_price: gas.and_then(|g| g.gas_price),
            gas_cost: gas.and_then(|g| g.gas_cost),
            submitted_at: outcome.submitted_at().to_rfc3339(),
            elapsed_secs: outcome.elapsed().as_secs_f64(),
            diagnostic: outcome.diagnostic().map(str::to_string),
            facts,
        }
    }

    /// Name the registry and domain the write targeted
    pub fn about(
        mut self,
        registry: Address,
        plus_code: Option<&str>,
        token_id: Option<U256>,
    ) -> Self {
        self.registry = Some(address(registry));
        self.plus_code = plus_code.map(str::to_string);
        self.token_id = token_id;
        self
    }

    /// `Unknown` is never a usable result; surface it as an error
    pub fn ensure_consistent(&self) -> OpsResult<()> {
        match self.status {
            OutcomeStatus::Unknown => Err(OpsError::InconsistentOutcome {
                operation: self.operation,
                diagnostic: self
                    .diagnostic
                    .clone()
                    .unwrap_or_else(|| "no diagnostic recorded".to_string()),
            }),
            _ => Ok(()),
        }
    }

    pub fn to_json(&self) -> OpsResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| OpsError::Internal(format!("Failed to serialize report: {}", e)))
    }

    /// Plain text table for terminals
    pub fn render_text(&self) -> String {
        let mut out = String::new();

        row(&mut out, "Operation", self.operation);
        if let Some(registry) = &self.registry {
            row(&mut out, "Domain registry", registry);
        }
        if let Some(plus_code) = &self.plus_code {
            row(&mut out, "Plus Code", plus_code);
        }
        if let Some(token_id) = self.token_id {
            row(&mut out, "Token ID", &token_id.to_string());
        }
        row(&mut out, "Status", &self.status.to_string());
        row(&mut out, "Transaction", self.request_id.as_deref().unwrap_or("-"));
        row(&mut out, "Elapsed", &format!("{:.1}s", self.elapsed_secs));

        if let Some(gas_used) = self.gas_used {
            row(&mut out, "Gas used", &gas_used.to_string());
        }
        if let Some(price) = self.gas_price {
            row(&mut out, "Gas price", &format!("{} wei", price));
        }
        match self.gas_cost {
            Some(cost) => row(&mut out, "Gas cost", &native_amount(cost)),
            None if self.status.is_confirmed() => row(&mut out, "Gas cost", "unavailable"),
            None => {}
        }
        if let Some(diagnostic) = &self.diagnostic {
            row(&mut out, "Diagnostic", diagnostic);
        }

        for fact in &self.facts {
            match fact {
                Fact::Amount {
                    label,
                    amount,
                    unit,
                } => row(&mut out, label, &amount_in(*amount, *unit)),
                Fact::Balance {
                    label,
                    before,
                    after,
                    unit,
                } => {
                    row(&mut out, &format!("{} before", label), &amount_in(*before, *unit));
                    row(&mut out, &format!("{} after", label), &amount_in(*after, *unit));
                    row(&mut out, &format!("{} change", label), &delta(*before, *after));
                }
                Fact::Value {
                    label,
                    before,
                    after,
                } => {
                    let shown = match (before, after) {
                        (Some(before), Some(after)) => format!("{} -> {}", before, after),
                        (None, Some(after)) => after.clone(),
                        (Some(before), None) => format!("{} -> ?", before),
                        (None, None) => "-".to_string(),
                    };
                    row(&mut out, label, &shown);
                }
                Fact::Records { records } => {
                    if records.is_empty() {
                        row(&mut out, "Records", "none");
                    }
                    for record in records {
                        row(&mut out, &format!("Record {}", record.key), &record.value);
                    }
                }
                Fact::Unavailable { label, reason } => {
                    row(&mut out, label, &format!("unavailable ({})", reason))
                }
            }
        }

        out
    }
}

fn row(out: &mut String, label: &str, value: &str) {
    let _ = writeln!(out, "{:<22} {}", format!("{}:", label), value);
}

/// Address as shown to operators
pub fn address(address: Address) -> String {
    format!("{:?}", address)
}

/// ERC-4907 expiry: UNIX seconds plus the UTC timestamp
pub fn expiry(expires: U256) -> String {
    if expires.is_zero() {
        return "never set".to_string();
    }
    if expires > U256::from(i64::MAX as u64) {
        return expires.to_string();
    }

    match Utc.timestamp_opt(expires.as_u64() as i64, 0).single() {
        Some(at) => format!("{} ({})", expires, at.to_rfc3339()),
        None => expires.to_string(),
    }
}

/// USD amount carried with 18 decimals
pub fn usd(amount: U256) -> String {
    format!("{} USD", format_ether(amount))
}

fn native_amount(amount: U256) -> String {
    format!("{} wei ({} ETH)", amount, format_ether(amount))
}

fn amount_in(amount: U256, unit: Unit) -> String {
    match unit {
        Unit::Wei => native_amount(amount),
        Unit::TokenUnits => format!("{} units", amount),
    }
}

fn delta(before: U256, after: U256) -> String {
    if after >= before {
        format!("+{}", after - before)
    } else {
        format!("-{}", before - after)
    }
}

fn decimal<S: Serializer>(value: &U256, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_string())
}

fn optional_decimal<S: Serializer>(value: &Option<U256>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&value.to_string()),
        None => serializer.serialize_none(),
    }
}
