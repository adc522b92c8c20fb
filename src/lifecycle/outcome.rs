//! Terminal outcome of a transaction lifecycle

use crate::tx::GasMetrics;

use chrono::{DateTime, Utc};
use ethers::types::TxHash;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Final status of a lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeStatus {
    /// Confirmed with a successful receipt
    Success,
    /// Confirmed, but the receipt marks execution failure
    Reverted,
    /// Budget elapsed before any signal; the transaction may still land
    TimedOut,
    /// The client gave up before the request reached the network
    RejectedBeforeSend,
    /// Signals contradicted each other; see the diagnostic
    Unknown,
}

impl OutcomeStatus {
    /// Whether a receipt was obtained
    pub fn is_confirmed(&self) -> bool {
        matches!(self, OutcomeStatus::Success | OutcomeStatus::Reverted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Success => "success",
            OutcomeStatus::Reverted => "reverted",
            OutcomeStatus::TimedOut => "timed_out",
            OutcomeStatus::RejectedBeforeSend => "rejected_before_send",
            OutcomeStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Success => write!(f, "Success"),
            OutcomeStatus::Reverted => write!(f, "Reverted"),
            OutcomeStatus::TimedOut => write!(f, "Timed out"),
            OutcomeStatus::RejectedBeforeSend => write!(f, "Rejected before send"),
            OutcomeStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Terminal record of one lifecycle. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    lifecycle_id: Uuid,
    operation: &'static str,
    status: OutcomeStatus,
    request_id: Option<TxHash>,
    gas: Option<GasMetrics>,
    submitted_at: DateTime<Utc>,
    elapsed: Duration,
    diagnostic: Option<String>,
}

impl Outcome {
    pub(crate) fn confirmed(
        lifecycle_id: Uuid,
        operation: &'static str,
        success: bool,
        request_id: TxHash,
        gas: GasMetrics,
        submitted_at: DateTime<Utc>,
        elapsed: Duration,
    ) -> Self {
        Self {
            lifecycle_id,
            operation,
            status: if success {
                OutcomeStatus::Success
            } else {
                OutcomeStatus::Reverted
            },
            request_id: Some(request_id),
            gas: Some(gas),
            submitted_at,
            elapsed,
            diagnostic: None,
        }
    }

    pub(crate) fn unconfirmed(
        lifecycle_id: Uuid,
        operation: &'static str,
        status: OutcomeStatus,
        request_id: Option<TxHash>,
        submitted_at: DateTime<Utc>,
        elapsed: Duration,
        diagnostic: Option<String>,
    ) -> Self {
        debug_assert!(!status.is_confirmed());
        Self {
            lifecycle_id,
            operation,
            status,
            request_id,
            gas: None,
            submitted_at,
            elapsed,
            diagnostic,
        }
    }

    /// Outcome for a call the client refused before it reached the network.
    /// No lifecycle ran, so nothing elapsed.
    pub fn rejected_before_send(operation: &'static str, reason: impl Into<String>) -> Self {
        Self {
            lifecycle_id: Uuid::new_v4(),
            operation,
            status: OutcomeStatus::RejectedBeforeSend,
            request_id: None,
            gas: None,
            submitted_at: Utc::now(),
            elapsed: Duration::ZERO,
            diagnostic: Some(reason.into()),
        }
    }

    pub fn lifecycle_id(&self) -> Uuid {
        self.lifecycle_id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn request_id(&self) -> Option<TxHash> {
        self.request_id
    }

    pub fn gas(&self) -> Option<&GasMetrics> {
        self.gas.as_ref()
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_before_send_has_no_gas_or_id() {
        let outcome = Outcome::rejected_before_send("mint", "insufficient funds");
        assert_eq!(outcome.status(), OutcomeStatus::RejectedBeforeSend);
        assert!(outcome.request_id().is_none());
        assert!(outcome.gas().is_none());
        assert_eq!(outcome.diagnostic(), Some("insufficient funds"));
        assert_eq!(outcome.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(OutcomeStatus::TimedOut.to_string(), "Timed out");
        assert_eq!(OutcomeStatus::Reverted.as_str(), "reverted");
        assert!(OutcomeStatus::Reverted.is_confirmed());
        assert!(!OutcomeStatus::Unknown.is_confirmed());
    }
}
