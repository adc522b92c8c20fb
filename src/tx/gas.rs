//! Gas limit validation and receipt-derived cost accounting

use crate::chain::Receipt;
use crate::error::{OpsError, OpsResult};

use ethers::types::U256;
use serde::Serialize;
use tracing::{debug, warn};

/// Validate a caller-supplied gas limit override.
///
/// Overrides above the ceiling are refused outright. Without an override the
/// operation's default applies, capped at the ceiling.
pub fn resolve_gas_limit(
    requested: Option<u64>,
    default: Option<u64>,
    ceiling: u64,
) -> OpsResult<Option<u64>> {
    match requested {
        Some(limit) if limit > ceiling => Err(OpsError::ResourceLimitExceeded {
            requested: limit,
            ceiling,
        }),
        Some(limit) => Ok(Some(limit)),
        None => Ok(default.map(|d| d.min(ceiling))),
    }
}

/// Gas accounting taken from a confirmation receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GasMetrics {
    pub gas_used: U256,
    /// Effective price, or the nominal price when the receipt lacks one
    pub gas_price: Option<U256>,
    /// `gas_used * gas_price`
    pub gas_cost: Option<U256>,
}

impl GasMetrics {
    pub fn from_receipt(receipt: &Receipt) -> Self {
        let gas_price = receipt.effective_gas_price.or(receipt.gas_price);
        let gas_cost = match gas_price {
            Some(price) => {
                let cost = receipt.gas_used.checked_mul(price);
                if cost.is_none() {
                    warn!(
                        "Gas cost overflow for {:?}: {} * {}",
                        receipt.transaction_hash, receipt.gas_used, price
                    );
                }
                cost
            }
            None => {
                warn!(
                    "Receipt {:?} carries no gas price; cost left unset",
                    receipt.transaction_hash
                );
                None
            }
        };

        debug!(
            "Gas for {:?}: used {} price {:?} cost {:?}",
            receipt.transaction_hash, receipt.gas_used, gas_price, gas_cost
        );

        Self {
            gas_used: receipt.gas_used,
            gas_price,
            gas_cost,
        }
    }
}
