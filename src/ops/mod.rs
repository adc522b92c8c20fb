//! Operator: one registry write from arguments to report
//!
//! Reads the state an operator cares about before the write, submits it,
//! waits for the lifecycle to resolve, reads the same state again and
//! projects everything into a [`Report`].

pub mod batch;

use crate::chain::{ChainClient, ChainState, ContractCall, OutboundCall};
use crate::config::LifecycleConfig;
use crate::error::{OpsError, OpsResult};
use crate::lifecycle::{LifecycleCoordinator, Outcome, ProgressSink};
use crate::registry::{Operation, Record};
use crate::report::{self, Fact, Report, Unit};
use crate::tx::OperationSubmitter;

use ethers::types::{Address, U256};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to read around a write
#[derive(Debug, Default, Clone, Copy)]
struct Targets {
    /// Token whose existence changes with the write
    token: Option<U256>,
    /// Token whose records are shown after the write
    records: Option<U256>,
    /// Token whose rental user is shown
    user: Option<U256>,
    base_uri: bool,
    /// Contract balance, native or in the given ERC-20
    contract_balance: Option<Option<Address>>,
    /// Native balance of the withdrawal payee
    payee: Option<Address>,
    /// Mint price quote in wei, USD and the feed answer behind it
    quote: bool,
}

/// State read on one side of a write
#[derive(Debug, Default, Clone)]
struct Snapshot {
    token_exists: Option<bool>,
    records: Option<Vec<Record>>,
    user: Option<(Address, U256)>,
    base_uri: Option<String>,
    contract_balance: Option<U256>,
    payee_balance: Option<U256>,
}

/// Runs registry operations end to end
pub struct Operator {
    submitter: OperationSubmitter,
    coordinator: LifecycleCoordinator,
    state: Arc<dyn ChainState>,
}

impl Operator {
    pub fn new(
        client: Arc<dyn ChainClient>,
        state: Arc<dyn ChainState>,
        lifecycle: &LifecycleConfig,
        sink: Arc<dyn ProgressSink>,
    ) -> OpsResult<Self> {
        Ok(Self {
            submitter: OperationSubmitter::new(client, state.clone(), lifecycle.gas_limit_ceiling),
            coordinator: LifecycleCoordinator::new(lifecycle, sink)?,
            state,
        })
    }

    pub fn coordinator(&self) -> &LifecycleCoordinator {
        &self.coordinator
    }

    /// Execute one operation.
    ///
    /// Pre-submission failures are errors. Once a write was attempted the
    /// result is always a report, whatever its status.
    pub async fn execute(&self, operation: &Operation, gas_limit: Option<u64>) -> OpsResult<Report> {
        let name = operation.name();
        let call = self.submitter.prepare(operation, gas_limit).await?;

        let targets = targets_for(operation, &call);
        let before = self.snapshot(&targets, false).await?;
        let quoted = call.value;

        let mut facts = Vec::new();
        if targets.quote {
            facts.extend(self.quote().await);
        }

        let outcome = match self.submitter.send(call).await {
            Ok(request) => self.coordinator.resolve(request).await?,
            Err(OpsError::SubmissionRejected { operation, reason }) => {
                let outcome = Outcome::rejected_before_send(operation, reason);
                crate::metrics::record_outcome(&outcome);
                outcome
            }
            Err(e) => return Err(e),
        };

        if let Some(amount) = quoted {
            facts.push(Fact::Amount {
                label: "Payment".to_string(),
                amount,
                unit: Unit::Wei,
            });
        }

        match self.snapshot(&targets, true).await {
            Ok(after) => facts.extend(compare(operation, &before, &after)),
            Err(e) => {
                warn!("Could not read state after {}: {}", name, e);
                facts.push(Fact::Unavailable {
                    label: "State after".to_string(),
                    reason: e.to_string(),
                });
            }
        }

        info!("{} finished: {}", name, outcome.status());
        Ok(Report::project(&outcome, facts).about(
            self.state.registry_address(),
            operation.plus_code(),
            operation.token_id(),
        ))
    }

    /// Execute independent operations concurrently, each with its own budget
    pub async fn execute_batch(
        &self,
        operations: &[(Operation, Option<u64>)],
    ) -> Vec<OpsResult<Report>> {
        debug!("Executing batch of {} operations", operations.len());
        join_all(
            operations
                .iter()
                .map(|(operation, gas_limit)| self.execute(operation, *gas_limit)),
        )
        .await
    }

    /// Mint pricing as the registry quotes it. Unreadable parts are
    /// reported, not fatal.
    async fn quote(&self) -> Vec<Fact> {
        let mut facts = Vec::new();

        match self.state.mint_price().await {
            Ok(price) => facts.push(Fact::Amount {
                label: "Cost".to_string(),
                amount: price,
                unit: Unit::Wei,
            }),
            Err(e) => facts.push(unavailable("Cost", e)),
        }
        match self.state.mint_cost_usd().await {
            Ok(cost) => facts.push(Fact::reading("Cost USD", report::usd(cost))),
            Err(e) => facts.push(unavailable("Cost USD", e)),
        }
        match self.state.feed_data().await {
            Ok(answer) => facts.push(Fact::reading("Exchange value", answer.to_string())),
            Err(e) => facts.push(unavailable("Exchange value", e)),
        }

        facts
    }

    async fn snapshot(&self, targets: &Targets, after: bool) -> OpsResult<Snapshot> {
        let mut snapshot = Snapshot::default();

        // Existence and records only change meaningfully after the write
        if after {
            if let Some(token_id) = targets.token {
                snapshot.token_exists = Some(self.state.token_exists(token_id).await?);
            }
            if let Some(token_id) = targets.records {
                snapshot.records = Some(self.state.records_of(token_id).await?);
            }
        }

        if let Some(token_id) = targets.user {
            let user = self.state.user_of(token_id).await?;
            let expires = self.state.user_expires(token_id).await?;
            snapshot.user = Some((user, expires));
        }
        if targets.base_uri {
            snapshot.base_uri = Some(self.state.base_uri().await?);
        }

        let registry = self.state.registry_address();
        snapshot.contract_balance = match targets.contract_balance {
            Some(Some(token)) => Some(self.state.token_balance(token, registry).await?),
            Some(None) => Some(self.state.native_balance(registry).await?),
            None => None,
        };
        if let Some(payee) = targets.payee {
            snapshot.payee_balance = Some(self.state.native_balance(payee).await?);
        }

        Ok(snapshot)
    }
}

fn unavailable(label: &str, error: OpsError) -> Fact {
    warn!("Could not read {}: {}", label, error);
    Fact::Unavailable {
        label: label.to_string(),
        reason: error.to_string(),
    }
}

fn targets_for(operation: &Operation, call: &OutboundCall) -> Targets {
    let token_id = operation.token_id();
    let mut targets = Targets::default();

    match (operation, &call.call) {
        (Operation::Mint { .. }, _) => {
            targets.token = token_id;
            targets.quote = true;
        }
        (Operation::Burn { .. }, _) => targets.token = token_id,
        (Operation::MintWithRecords { .. }, _) => {
            targets.token = token_id;
            targets.records = token_id;
            targets.quote = true;
        }
        (Operation::SetRecord { .. }, _) | (Operation::SetMany { .. }, _) => {
            targets.records = token_id
        }
        (Operation::SetUser { .. }, _) => targets.user = token_id,
        (Operation::SetBaseUri { .. }, _) => targets.base_uri = true,
        (_, ContractCall::Withdraw { to, .. }) => {
            targets.contract_balance = Some(None);
            targets.payee = Some(*to);
        }
        (_, ContractCall::WithdrawErc20 { token, to, .. }) => {
            targets.contract_balance = Some(Some(*token));
            targets.payee = Some(*to);
        }
        _ => {}
    }

    targets
}

fn compare(operation: &Operation, before: &Snapshot, after: &Snapshot) -> Vec<Fact> {
    let mut facts = Vec::new();

    if let Some(exists) = after.token_exists {
        // The precondition already established the state before the write
        let existed = matches!(operation, Operation::Burn { .. });
        facts.push(Fact::value(
            "Token exists",
            Some(existed.to_string()),
            Some(exists.to_string()),
        ));
    }

    if let Some(records) = &after.records {
        facts.push(Fact::reading("Domain records", records.len().to_string()));
        facts.push(Fact::Records {
            records: records.clone(),
        });
    }

    if let Some((user, expires)) = after.user {
        let previous = before.user;
        facts.push(Fact::value(
            "User",
            previous.map(|(user, _)| report::address(user)),
            Some(report::address(user)),
        ));
        facts.push(Fact::value(
            "User expires",
            previous.map(|(_, expires)| report::expiry(expires)),
            Some(report::expiry(expires)),
        ));
    }

    if after.base_uri.is_some() {
        facts.push(Fact::value(
            "Base URI",
            before.base_uri.clone(),
            after.base_uri.clone(),
        ));
    }

    if let (Some(before_balance), Some(after_balance)) =
        (before.contract_balance, after.contract_balance)
    {
        let unit = match operation {
            Operation::WithdrawToken { .. } => Unit::TokenUnits,
            _ => Unit::Wei,
        };
        facts.push(Fact::balance(
            "Contract balance",
            before_balance,
            after_balance,
            unit,
        ));
    }

    if let (Some(before_balance), Some(after_balance)) = (before.payee_balance, after.payee_balance)
    {
        facts.push(Fact::balance(
            "Payee balance",
            before_balance,
            after_balance,
            Unit::Wei,
        ));
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, MockChainState, Receipt};
    use crate::lifecycle::{OutcomeStatus, TracingProgress};
    use crate::tx::PendingRequest;
    use async_trait::async_trait;
    use ethers::types::{TxHash, I256};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    /// How the scripted client answers the next submission
    enum Script {
        Confirm { after: Duration, success: bool },
        Silent,
        Refuse(&'static str),
    }

    /// Chain client that settles each request as scripted
    struct ScriptedClient {
        script: Mutex<VecDeque<Script>>,
        submitted: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                submitted: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedClient {
        async fn submit(&self, call: OutboundCall) -> OpsResult<PendingRequest> {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .expect("unscripted submission");
            let n = self.submitted.fetch_add(1, Ordering::SeqCst) as u8;
            let hash = TxHash::repeat_byte(n + 1);

            if let Script::Refuse(reason) = step {
                return Err(OpsError::SubmissionRejected {
                    operation: call.operation,
                    reason: reason.to_string(),
                });
            }

            let (request, mut notifier) = PendingRequest::new(call.operation);
            notifier.acknowledge(hash);

            tokio::spawn(async move {
                if let Script::Confirm { after, success } = step {
                    sleep(after).await;
                    notifier.confirm(Receipt {
                        transaction_hash: hash,
                        success,
                        gas_used: U256::from(21_000),
                        effective_gas_price: Some(U256::from(20)),
                        gas_price: None,
                        block_number: Some(1),
                    });
                }
                std::future::pending::<()>().await;
            });

            Ok(request)
        }
    }

    fn operator(client: Arc<dyn ChainClient>, state: MockChainState) -> Operator {
        Operator::new(
            client,
            Arc::new(state),
            &LifecycleConfig::default(),
            Arc::new(TracingProgress),
        )
        .unwrap()
    }

    fn set_user() -> Operation {
        Operation::SetUser {
            plus_code: "8FVC9G8F+6X".to_string(),
            user: Address::repeat_byte(0x33),
            expires: 1_700_000_000,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_user_reports_user_before_and_after() {
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(true));
        state.expect_registry_address().return_const(Address::zero());
        let mut reads = 0;
        state.expect_user_of().times(2).returning(move |_| {
            reads += 1;
            Ok(if reads == 1 {
                Address::zero()
            } else {
                Address::repeat_byte(0x33)
            })
        });
        let mut expiries = 0;
        state.expect_user_expires().times(2).returning(move |_| {
            expiries += 1;
            Ok(if expiries == 1 {
                U256::zero()
            } else {
                U256::from(1_700_000_000u64)
            })
        });

        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(3),
            success: true,
        }]);
        let report = operator(client, state)
            .execute(&set_user(), None)
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::Success);
        assert_eq!(report.gas_cost, Some(U256::from(420_000)));
        assert!(report.facts.contains(&Fact::value(
            "User",
            Some(report::address(Address::zero())),
            Some(report::address(Address::repeat_byte(0x33))),
        )));
        assert!(report.facts.contains(&Fact::value(
            "User expires",
            Some("never set".to_string()),
            Some("1700000000 (2023-11-14T22:13:20+00:00)".to_string()),
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_withdraw_reports_balance_deltas() {
        let registry = Address::repeat_byte(0x11);
        let owner = Address::repeat_byte(0x22);

        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(registry);
        state.expect_owner().returning(move || Ok(owner));
        let mut contract_reads = 0;
        state
            .expect_native_balance()
            .withf(move |account| *account == registry)
            .returning(move |_| {
                contract_reads += 1;
                // default amount, before, after
                Ok(if contract_reads < 3 {
                    U256::from(1_000)
                } else {
                    U256::zero()
                })
            });
        let mut payee_reads = 0;
        state
            .expect_native_balance()
            .withf(move |account| *account == owner)
            .returning(move |_| {
                payee_reads += 1;
                Ok(if payee_reads == 1 {
                    U256::from(5)
                } else {
                    U256::from(1_005)
                })
            });

        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(2),
            success: true,
        }]);
        let report = operator(client, state)
            .execute(
                &Operation::Withdraw {
                    to: None,
                    amount: None,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::Success);
        assert!(report.facts.contains(&Fact::balance(
            "Contract balance",
            U256::from(1_000),
            U256::zero(),
            Unit::Wei
        )));
        assert!(report.facts.contains(&Fact::balance(
            "Payee balance",
            U256::from(5),
            U256::from(1_005),
            Unit::Wei
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_submission_is_reported() {
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(true));
        state.expect_registry_address().return_const(Address::zero());
        state.expect_user_of().returning(|_| Ok(Address::zero()));
        state.expect_user_expires().returning(|_| Ok(U256::zero()));

        let client = ScriptedClient::new(vec![Script::Refuse("insufficient funds")]);
        let report = operator(client, state)
            .execute(&set_user(), None)
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::RejectedBeforeSend);
        assert!(report.request_id.is_none());
        assert!(report.gas_used.is_none());
        assert_eq!(report.diagnostic.as_deref(), Some("insufficient funds"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_network_times_out_at_budget() {
        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(Address::zero());
        state.expect_base_uri().returning(|| Ok("ipfs://old/".to_string()));

        let client = ScriptedClient::new(vec![Script::Silent]);
        let started = Instant::now();
        let report = operator(client, state)
            .execute(
                &Operation::SetBaseUri {
                    uri: "ipfs://new/".to_string(),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::TimedOut);
        assert!(report.gas_cost.is_none());
        assert!(report.request_id.is_some());
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn test_precondition_failure_never_submits() {
        let mut client = MockChainClient::new();
        client.expect_submit().never();
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(false));

        let err = operator(Arc::new(client), state)
            .execute(&set_user(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::PreconditionFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burn_reports_token_gone() {
        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(Address::zero());
        let mut checks = 0;
        state.expect_token_exists().times(2).returning(move |_| {
            checks += 1;
            Ok(checks == 1)
        });

        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(4),
            success: false,
        }]);
        let report = operator(client, state)
            .execute(
                &Operation::Burn {
                    plus_code: "8FVC9G8F+6X".to_string(),
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::Reverted);
        assert!(report.gas_cost.is_some());
        assert!(report.facts.contains(&Fact::value(
            "Token exists",
            Some("true".to_string()),
            Some("false".to_string()),
        )));
    }

    fn quoting_state(exists_after: bool) -> MockChainState {
        let mut state = MockChainState::new();
        state
            .expect_registry_address()
            .return_const(Address::repeat_byte(0x11));
        let mut checks = 0;
        state.expect_token_exists().times(2).returning(move |_| {
            checks += 1;
            Ok(checks > 1 && exists_after)
        });
        state
            .expect_mint_price()
            .returning(|| Ok(U256::from(2_500_000_000_000_000u64)));
        state
            .expect_mint_cost_usd()
            .returning(|| Ok(U256::exp10(18) * U256::from(5)));
        state
            .expect_feed_data()
            .returning(|| Ok(I256::from_raw(U256::from(200_000_000u64))));
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_mint_reports_quote_and_domain() {
        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(3),
            success: true,
        }]);
        let report = operator(client, quoting_state(true))
            .execute(
                &Operation::Mint {
                    plus_code: "8FVC9G8F+6X".to_string(),
                    payment: None,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::Success);
        assert_eq!(
            report.registry.as_deref(),
            Some("0x1111111111111111111111111111111111111111")
        );
        assert_eq!(report.plus_code.as_deref(), Some("8FVC9G8F+6X"));
        assert_eq!(report.token_id, Some(crate::registry::token_id("8FVC9G8F+6X")));

        let price = U256::from(2_500_000_000_000_000u64);
        assert!(report.facts.contains(&Fact::Amount {
            label: "Cost".to_string(),
            amount: price,
            unit: Unit::Wei,
        }));
        assert!(report.facts.contains(&Fact::Amount {
            label: "Payment".to_string(),
            amount: price,
            unit: Unit::Wei,
        }));
        assert!(report
            .facts
            .contains(&Fact::reading("Cost USD", "5.000000000000000000 USD")));
        assert!(report
            .facts
            .contains(&Fact::reading("Exchange value", "200000000")));
        assert!(report.facts.contains(&Fact::value(
            "Token exists",
            Some("false".to_string()),
            Some("true".to_string()),
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mint_with_records_counts_records() {
        let mut state = quoting_state(true);
        state.expect_records_of().returning(|_| {
            Ok(vec![
                Record::new("website", "https://example.com"),
                Record::new("email", "ops@example.com"),
            ])
        });

        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(5),
            success: true,
        }]);
        let report = operator(client, state)
            .execute(
                &Operation::MintWithRecords {
                    plus_code: "8FVC9G8F+6X".to_string(),
                    records: vec![
                        Record::new("website", "https://example.com"),
                        Record::new("email", "ops@example.com"),
                    ],
                    payment: Some(U256::from(3_000_000_000_000_000u64)),
                },
                None,
            )
            .await
            .unwrap();

        assert!(report.facts.contains(&Fact::reading("Domain records", "2")));
        assert!(report.facts.contains(&Fact::Amount {
            label: "Payment".to_string(),
            amount: U256::from(3_000_000_000_000_000u64),
            unit: Unit::Wei,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_quote_does_not_block_mint() {
        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(Address::zero());
        let mut checks = 0;
        state.expect_token_exists().returning(move |_| {
            checks += 1;
            Ok(checks > 1)
        });
        state.expect_mint_price().returning(|| Ok(U256::from(1_000)));
        state.expect_mint_cost_usd().returning(|| Ok(U256::exp10(18)));
        state.expect_feed_data().returning(|| {
            Err(OpsError::ContractRead {
                call: "getFeedData",
                message: "execution reverted".to_string(),
            })
        });

        let client = ScriptedClient::new(vec![Script::Confirm {
            after: Duration::from_secs(2),
            success: true,
        }]);
        let report = operator(client, state)
            .execute(
                &Operation::Mint {
                    plus_code: "8FVC9G8F+6X".to_string(),
                    payment: None,
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.status, OutcomeStatus::Success);
        assert!(report.facts.iter().any(|fact| matches!(
            fact,
            Fact::Unavailable { label, .. } if label == "Exchange value"
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_lifecycles_run_concurrently() {
        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(Address::zero());
        state.expect_token_exists().returning(|_| Ok(true));
        state.expect_records_of().returning(|_| Ok(vec![Record::new("a", "1")]));

        let client = ScriptedClient::new(vec![
            Script::Confirm {
                after: Duration::from_secs(3),
                success: true,
            },
            Script::Confirm {
                after: Duration::from_secs(10),
                success: true,
            },
        ]);
        let operator = operator(client, state);
        let record = |key: &str| Operation::SetRecord {
            plus_code: "8FVC9G8F+6X".to_string(),
            record: Record::new(key, "1"),
        };

        let started = Instant::now();
        let reports = operator
            .execute_batch(&[(record("a"), None), (record("b"), Some(500_000))])
            .await;

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| r.as_ref().unwrap().status == OutcomeStatus::Success));
        assert_eq!(reports[0].as_ref().unwrap().elapsed_secs, 3.0);
        assert_eq!(reports[1].as_ref().unwrap().elapsed_secs, 10.0);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(
            operator
                .coordinator()
                .counters()
                .confirmations_honoured
                .load(Ordering::SeqCst),
            2
        );
    }
}
