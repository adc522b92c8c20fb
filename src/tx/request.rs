//! Pending request handle and the client-side notifier that settles it

use crate::chain::Receipt;

use chrono::{DateTime, Utc};
use ethers::types::TxHash;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// Why the client gave up on a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: String,
}

/// A submitted, not yet final request.
///
/// Owned by the lifecycle coordinator until resolved. The signal receivers
/// are taken apart by the coordinator; nothing else can observe them.
#[derive(Debug)]
pub struct PendingRequest {
    pub(crate) operation: &'static str,
    pub(crate) submitted_at: DateTime<Utc>,
    pub(crate) started: Instant,
    pub(crate) request_id: watch::Receiver<Option<TxHash>>,
    pub(crate) confirmation: oneshot::Receiver<Receipt>,
    pub(crate) rejection: oneshot::Receiver<Rejection>,
}

impl PendingRequest {
    /// Create a request handle and the notifier a client uses to settle it
    pub fn new(operation: &'static str) -> (Self, RequestNotifier) {
        let (id_tx, id_rx) = watch::channel(None);
        let (confirm_tx, confirm_rx) = oneshot::channel();
        let (reject_tx, reject_rx) = oneshot::channel();

        let request = Self {
            operation,
            submitted_at: Utc::now(),
            started: Instant::now(),
            request_id: id_rx,
            confirmation: confirm_rx,
            rejection: reject_rx,
        };
        let notifier = RequestNotifier {
            operation,
            request_id: id_tx,
            confirmation: Some(confirm_tx),
            rejection: Some(reject_tx),
        };

        (request, notifier)
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Transaction hash, once the client has acknowledged the request
    pub fn request_id(&self) -> Option<TxHash> {
        *self.request_id.borrow()
    }
}

/// Client side of a pending request
///
/// Dropping a notifier that never sent a signal counts as a rejection.
#[derive(Debug)]
pub struct RequestNotifier {
    operation: &'static str,
    request_id: watch::Sender<Option<TxHash>>,
    confirmation: Option<oneshot::Sender<Receipt>>,
    rejection: Option<oneshot::Sender<Rejection>>,
}

impl RequestNotifier {
    /// Record the transaction hash assigned by the network
    pub fn acknowledge(&self, tx_hash: TxHash) {
        self.request_id.send_replace(Some(tx_hash));
    }

    /// Deliver the confirmation receipt. Returns false if nobody listens anymore.
    pub fn confirm(&mut self, receipt: Receipt) -> bool {
        match self.confirmation.take() {
            Some(tx) => tx.send(receipt).is_ok(),
            None => false,
        }
    }

    /// Completes once nobody can receive a signal anymore
    pub async fn abandoned(&mut self) {
        match (self.confirmation.as_mut(), self.rejection.as_mut()) {
            (Some(confirmation), Some(rejection)) => {
                tokio::join!(confirmation.closed(), rejection.closed());
            }
            (Some(confirmation), None) => confirmation.closed().await,
            (None, Some(rejection)) => rejection.closed().await,
            (None, None) => {}
        }
    }

    /// Deliver a rejection. Returns false if nobody listens anymore.
    pub fn reject(&mut self, reason: impl Into<String>) -> bool {
        match self.rejection.take() {
            Some(tx) => tx
                .send(Rejection {
                    reason: reason.into(),
                })
                .is_ok(),
            None => false,
        }
    }
}

impl Drop for RequestNotifier {
    fn drop(&mut self) {
        if self.confirmation.is_some() && self.rejection.is_some() {
            let reason = format!(
                "client released {} without a confirmation or rejection",
                self.operation
            );
            self.reject(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn receipt() -> Receipt {
        Receipt {
            transaction_hash: TxHash::repeat_byte(0xab),
            success: true,
            gas_used: U256::from(21_000),
            effective_gas_price: Some(U256::from(20)),
            gas_price: None,
            block_number: Some(1),
        }
    }

    #[tokio::test]
    async fn test_acknowledge_is_visible() {
        let (request, notifier) = PendingRequest::new("mint");
        assert_eq!(request.request_id(), None);

        notifier.acknowledge(TxHash::repeat_byte(1));
        assert_eq!(request.request_id(), Some(TxHash::repeat_byte(1)));
        assert_eq!(request.operation(), "mint");
    }

    #[tokio::test]
    async fn test_each_signal_delivered_once() {
        let (request, mut notifier) = PendingRequest::new("burn");

        assert!(notifier.confirm(receipt()));
        assert!(!notifier.confirm(receipt()));
        assert_eq!(request.confirmation.await.unwrap(), receipt());
    }

    #[tokio::test]
    async fn test_dropped_notifier_rejects() {
        let (request, notifier) = PendingRequest::new("withdraw");
        drop(notifier);

        let rejection = request.rejection.await.unwrap();
        assert!(rejection.reason.contains("withdraw"));
    }

    #[tokio::test]
    async fn test_drop_after_confirm_does_not_reject() {
        let (request, mut notifier) = PendingRequest::new("set-record");
        notifier.confirm(receipt());
        drop(notifier);

        assert!(request.rejection.await.is_err());
    }

    #[tokio::test]
    async fn test_abandoned_once_both_receivers_dropped() {
        let (request, mut notifier) = PendingRequest::new("set-base-uri");
        let PendingRequest {
            confirmation,
            rejection,
            ..
        } = request;

        drop(confirmation);
        {
            let mut waiting = tokio_test::task::spawn(notifier.abandoned());
            tokio_test::assert_pending!(waiting.poll());
        }

        drop(rejection);
        notifier.abandoned().await;
        assert!(!notifier.reject("too late"));
    }
}
