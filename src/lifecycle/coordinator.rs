//! Transaction lifecycle coordinator
//!
//! Owns the window between "request handed to the network" and "outcome
//! known". Three signals race for each pending request:
//! - confirmation: a receipt from the client
//! - rejection: the client gave up on the request
//! - the timeout budget elapsing
//!
//! The first to settle decides the terminal status. The losers are left to
//! finish on their own; if they settle later they are logged and counted but
//! never touch the outcome.

use super::outcome::{Outcome, OutcomeStatus};
use super::progress::{ProgressEmitter, ProgressSink};
use crate::chain::Receipt;
use crate::config::LifecycleConfig;
use crate::error::{OpsError, OpsResult};
use crate::tx::{GasMetrics, PendingRequest, Rejection};

use futures::future::{Fuse, FusedFuture, FutureExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep_until;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Wait budget for a single lifecycle. Built fresh for every lifecycle.
#[derive(Debug)]
pub struct TimeoutBudget {
    duration: Duration,
}

impl TimeoutBudget {
    pub fn new(duration: Duration) -> OpsResult<Self> {
        if duration.is_zero() {
            return Err(OpsError::InvalidBudget(
                "timeout budget must be greater than zero".to_string(),
            ));
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Counts of which signal decided each lifecycle, and of signals that
/// arrived after their lifecycle was already decided.
#[derive(Debug, Default)]
pub struct SignalCounters {
    pub confirmations_honoured: AtomicU64,
    pub rejections_honoured: AtomicU64,
    pub timeouts_honoured: AtomicU64,
    pub late_confirmations: AtomicU64,
    pub late_rejections: AtomicU64,
}

impl SignalCounters {
    pub fn honoured(&self) -> u64 {
        self.confirmations_honoured.load(Ordering::SeqCst)
            + self.rejections_honoured.load(Ordering::SeqCst)
            + self.timeouts_honoured.load(Ordering::SeqCst)
    }

    pub fn discarded(&self) -> u64 {
        self.late_confirmations.load(Ordering::SeqCst)
            + self.late_rejections.load(Ordering::SeqCst)
    }
}

enum Signal {
    Confirmed(Receipt),
    Rejected(Rejection),
    Elapsed,
}

/// Resolves pending requests to terminal outcomes
pub struct LifecycleCoordinator {
    timeout: Duration,
    tick: Duration,
    sink: Arc<dyn ProgressSink>,
    counters: Arc<SignalCounters>,
}

impl LifecycleCoordinator {
    pub fn new(config: &LifecycleConfig, sink: Arc<dyn ProgressSink>) -> OpsResult<Self> {
        Self::with_budget(config.timeout(), config.tick(), sink)
    }

    pub fn with_budget(
        timeout: Duration,
        tick: Duration,
        sink: Arc<dyn ProgressSink>,
    ) -> OpsResult<Self> {
        TimeoutBudget::new(timeout)?;
        if tick.is_zero() {
            return Err(OpsError::InvalidBudget(
                "progress tick must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            timeout,
            tick,
            sink,
            counters: Arc::new(SignalCounters::default()),
        })
    }

    pub fn counters(&self) -> &SignalCounters {
        &self.counters
    }

    /// Wait for the first of confirmation, rejection or timeout and classify it
    pub async fn resolve(&self, request: PendingRequest) -> OpsResult<Outcome> {
        let budget = TimeoutBudget::new(self.timeout)?;
        let lifecycle_id = Uuid::new_v4();
        let span = info_span!(
            "lifecycle",
            id = %lifecycle_id,
            operation = request.operation,
        );

        Ok(self
            .race(lifecycle_id, request, budget)
            .instrument(span)
            .await)
    }

    async fn race(
        &self,
        lifecycle_id: Uuid,
        request: PendingRequest,
        budget: TimeoutBudget,
    ) -> Outcome {
        let PendingRequest {
            operation,
            submitted_at,
            started,
            request_id,
            confirmation,
            rejection,
        } = request;
        let mut confirmation = confirmation.fuse();
        let mut rejection = rejection.fuse();

        info!("Transaction pending ...");
        let progress = ProgressEmitter::start(
            operation,
            started,
            budget.duration(),
            self.tick,
            self.sink.clone(),
        );

        let deadline = sleep_until(started + budget.duration());
        tokio::pin!(deadline);

        // Ties go to the timeout, then to the receipt
        let signal = tokio::select! {
            biased;
            _ = &mut deadline => Signal::Elapsed,
            Ok(receipt) = &mut confirmation => Signal::Confirmed(receipt),
            Ok(rejected) = &mut rejection => Signal::Rejected(rejected),
        };

        progress.stop().await;
        let elapsed = started.elapsed();
        let observed_id = *request_id.borrow();

        let outcome = match signal {
            Signal::Confirmed(receipt) => {
                self.counters
                    .confirmations_honoured
                    .fetch_add(1, Ordering::SeqCst);
                self.discard_late(operation, None, Some(rejection));

                if let Some(id) = observed_id {
                    if id != receipt.transaction_hash {
                        warn!(
                            "Receipt hash {:?} differs from acknowledged {:?}",
                            receipt.transaction_hash, id
                        );
                    }
                }

                let gas = GasMetrics::from_receipt(&receipt);
                Outcome::confirmed(
                    lifecycle_id,
                    operation,
                    receipt.success,
                    receipt.transaction_hash,
                    gas,
                    submitted_at,
                    elapsed,
                )
            }
            Signal::Rejected(rejected) => {
                self.counters
                    .rejections_honoured
                    .fetch_add(1, Ordering::SeqCst);
                self.discard_late(operation, Some(confirmation), None);

                match observed_id {
                    None => Outcome::unconfirmed(
                        lifecycle_id,
                        operation,
                        OutcomeStatus::RejectedBeforeSend,
                        None,
                        submitted_at,
                        elapsed,
                        Some(rejected.reason),
                    ),
                    Some(id) => {
                        let diagnostic = format!(
                            "rejection received after transaction {:?} was acknowledged by the network: {}",
                            id, rejected.reason
                        );
                        warn!("{}", diagnostic);
                        Outcome::unconfirmed(
                            lifecycle_id,
                            operation,
                            OutcomeStatus::Unknown,
                            Some(id),
                            submitted_at,
                            elapsed,
                            Some(diagnostic),
                        )
                    }
                }
            }
            Signal::Elapsed => {
                self.counters.timeouts_honoured.fetch_add(1, Ordering::SeqCst);
                self.discard_late(operation, Some(confirmation), Some(rejection));

                warn!(
                    "No confirmation within {:?}; {:?} may still be mined",
                    budget.duration(),
                    observed_id
                );
                Outcome::unconfirmed(
                    lifecycle_id,
                    operation,
                    OutcomeStatus::TimedOut,
                    observed_id,
                    submitted_at,
                    elapsed,
                    None,
                )
            }
        };

        info!(
            status = outcome.status().as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Status: {}",
            outcome.status()
        );
        crate::metrics::record_outcome(&outcome);

        outcome
    }

    /// Let the losing signals settle in the background. Whatever they carry
    /// is logged and counted only. Receivers that already completed, even
    /// with a closed channel, are not polled again.
    fn discard_late(
        &self,
        operation: &'static str,
        confirmation: Option<Fuse<oneshot::Receiver<Receipt>>>,
        rejection: Option<Fuse<oneshot::Receiver<Rejection>>>,
    ) {
        let confirmation = confirmation.filter(|c| !c.is_terminated());
        let rejection = rejection.filter(|r| !r.is_terminated());

        if let Some(confirmation) = confirmation {
            let counters = self.counters.clone();
            tokio::spawn(
                async move {
                    if let Ok(receipt) = confirmation.await {
                        counters.late_confirmations.fetch_add(1, Ordering::SeqCst);
                        crate::metrics::record_late_signal(operation, "confirmation");
                        info!(
                            "Late confirmation for {:?} (success: {}) ignored",
                            receipt.transaction_hash, receipt.success
                        );
                    }
                }
                .in_current_span(),
            );
        }

        if let Some(rejection) = rejection {
            let counters = self.counters.clone();
            tokio::spawn(
                async move {
                    if let Ok(rejected) = rejection.await {
                        counters.late_rejections.fetch_add(1, Ordering::SeqCst);
                        crate::metrics::record_late_signal(operation, "rejection");
                        debug!("Late rejection ignored: {}", rejected.reason);
                    }
                }
                .in_current_span(),
            );
        }
    }
}
