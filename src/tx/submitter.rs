//! Operation submitter: validation, preconditions and the single outbound write

use super::gas::resolve_gas_limit;
use super::request::PendingRequest;
use crate::chain::{ChainClient, ChainState, ContractCall, OutboundCall};
use crate::error::{OpsError, OpsResult};
use crate::registry::{Operation, Precondition, Record};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns logical operations into outbound calls and hands them to the client
pub struct OperationSubmitter {
    /// Chain client for writes
    client: Arc<dyn ChainClient>,
    /// Contract state for preconditions and argument defaults
    state: Arc<dyn ChainState>,
    /// Highest gas limit override accepted
    gas_limit_ceiling: u64,
}

impl OperationSubmitter {
    pub fn new(
        client: Arc<dyn ChainClient>,
        state: Arc<dyn ChainState>,
        gas_limit_ceiling: u64,
    ) -> Self {
        Self {
            client,
            state,
            gas_limit_ceiling,
        }
    }

    /// Everything that happens before the write: gas limit validation,
    /// argument checks, the precondition read and argument defaults.
    pub async fn prepare(
        &self,
        operation: &Operation,
        gas_limit: Option<u64>,
    ) -> OpsResult<OutboundCall> {
        let name = operation.name();

        // Must fail before any network interaction
        let gas_limit =
            resolve_gas_limit(gas_limit, operation.default_gas_limit(), self.gas_limit_ceiling)?;
        operation.validate()?;

        self.check_precondition(name, operation.precondition())
            .await?;

        let (call, value) = self.resolve_call(operation).await?;
        debug!("{} resolved to {}({:?})", name, call.method(), call.args());

        Ok(OutboundCall {
            operation: name,
            call,
            gas_limit,
            value,
        })
    }

    /// Hand a prepared call to the client. One network-bound write per call.
    pub async fn send(&self, call: OutboundCall) -> OpsResult<PendingRequest> {
        let operation = call.operation;
        info!(
            "Submitting {} (gas limit {:?}, value {:?})",
            operation, call.gas_limit, call.value
        );

        match self.client.submit(call).await {
            Ok(request) => {
                crate::metrics::record_submitted(operation);
                Ok(request)
            }
            Err(e) => {
                warn!("{} was not submitted: {}", operation, e);
                if matches!(e, OpsError::SubmissionRejected { .. }) {
                    crate::metrics::record_submission_rejected(operation);
                }
                Err(e)
            }
        }
    }

    async fn check_precondition(
        &self,
        operation: &'static str,
        precondition: Precondition,
    ) -> OpsResult<()> {
        match precondition {
            Precondition::None => Ok(()),
            Precondition::TokenAbsent(token_id) => {
                if self.state.token_exists(token_id).await? {
                    crate::metrics::record_precondition_failed(operation);
                    return Err(OpsError::PreconditionFailed {
                        operation,
                        reason: format!("token {} already exists", token_id),
                    });
                }
                Ok(())
            }
            Precondition::TokenPresent(token_id) => {
                if !self.state.token_exists(token_id).await? {
                    crate::metrics::record_precondition_failed(operation);
                    return Err(OpsError::PreconditionFailed {
                        operation,
                        reason: format!("token {} does not exist", token_id),
                    });
                }
                Ok(())
            }
        }
    }

    async fn resolve_call(&self, operation: &Operation) -> OpsResult<(ContractCall, Option<U256>)> {
        let resolved = match operation {
            Operation::Mint { plus_code, payment } => (
                ContractCall::Mint {
                    plus_code: plus_code.clone(),
                },
                Some(self.payment(*payment).await?),
            ),
            Operation::MintWithRecords {
                plus_code,
                records,
                payment,
            } => {
                let (keys, values) = Record::split(records);
                (
                    ContractCall::MintWithRecords {
                        plus_code: plus_code.clone(),
                        keys,
                        values,
                    },
                    Some(self.payment(*payment).await?),
                )
            }
            Operation::Burn { plus_code } => (
                ContractCall::Burn {
                    token_id: crate::registry::token_id(plus_code),
                },
                None,
            ),
            Operation::SetRecord { plus_code, record } => (
                ContractCall::Set {
                    key: record.key.clone(),
                    value: record.value.clone(),
                    token_id: crate::registry::token_id(plus_code),
                },
                None,
            ),
            Operation::SetMany { plus_code, records } => {
                let (keys, values) = Record::split(records);
                (
                    ContractCall::SetMany {
                        keys,
                        values,
                        token_id: crate::registry::token_id(plus_code),
                    },
                    None,
                )
            }
            Operation::SetUser {
                plus_code,
                user,
                expires,
            } => (
                ContractCall::SetUser {
                    token_id: crate::registry::token_id(plus_code),
                    user: *user,
                    expires: *expires,
                },
                None,
            ),
            Operation::SetBaseUri { uri } => (ContractCall::SetBaseUri { uri: uri.clone() }, None),
            Operation::Withdraw { to, amount } => {
                let to = match to {
                    Some(to) => *to,
                    None => self.state.owner().await?,
                };
                let amount = match amount {
                    Some(amount) if !amount.is_zero() => *amount,
                    _ => {
                        self.state
                            .native_balance(self.state.registry_address())
                            .await?
                    }
                };
                (ContractCall::Withdraw { to, amount }, None)
            }
            Operation::WithdrawToken { token, to, amount } => {
                let to = match to {
                    Some(to) => *to,
                    None => self.state.owner().await?,
                };
                let amount = match amount {
                    Some(amount) if !amount.is_zero() => *amount,
                    _ => {
                        self.state
                            .token_balance(*token, self.state.registry_address())
                            .await?
                    }
                };
                (
                    ContractCall::WithdrawErc20 {
                        token: *token,
                        to,
                        amount,
                    },
                    None,
                )
            }
        };

        Ok(resolved)
    }

    async fn payment(&self, payment: Option<U256>) -> OpsResult<U256> {
        match payment {
            Some(payment) if !payment.is_zero() => Ok(payment),
            _ => self.state.mint_price().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainClient, MockChainState};
    use ethers::types::Address;
    use mockall::predicate::eq;

    impl OperationSubmitter {
        async fn submit(
            &self,
            operation: &Operation,
            gas_limit: Option<u64>,
        ) -> OpsResult<PendingRequest> {
            let call = self.prepare(operation, gas_limit).await?;
            self.send(call).await
        }
    }

    fn submitter(client: MockChainClient, state: MockChainState) -> OperationSubmitter {
        OperationSubmitter::new(Arc::new(client), Arc::new(state), 10_000_000)
    }

    fn accepting_client(times: usize) -> MockChainClient {
        let mut client = MockChainClient::new();
        client
            .expect_submit()
            .times(times)
            .returning(|call| Ok(PendingRequest::new(call.operation).0));
        client
    }

    fn burn() -> Operation {
        Operation::Burn {
            plus_code: "8FVC9G8F+6X".to_string(),
        }
    }

    #[tokio::test]
    async fn test_gas_limit_over_ceiling_never_reaches_client() {
        let mut client = MockChainClient::new();
        client.expect_submit().never();
        let mut state = MockChainState::new();
        state.expect_token_exists().never();

        let err = submitter(client, state)
            .submit(&burn(), Some(10_000_001))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::ResourceLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn test_gas_limit_at_ceiling_accepted() {
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(true));

        let request = submitter(accepting_client(1), state)
            .submit(&burn(), Some(10_000_000))
            .await
            .unwrap();
        assert_eq!(request.operation(), "burn");
    }

    #[tokio::test]
    async fn test_mint_existing_token_never_submits() {
        let mut client = MockChainClient::new();
        client.expect_submit().never();
        let mut state = MockChainState::new();
        state
            .expect_token_exists()
            .with(eq(crate::registry::token_id("8FVC9G8F+6X")))
            .times(1)
            .returning(|_| Ok(true));

        let op = Operation::Mint {
            plus_code: "8FVC9G8F+6X".to_string(),
            payment: None,
        };
        let err = submitter(client, state).submit(&op, None).await.unwrap_err();
        assert!(
            matches!(err, OpsError::PreconditionFailed { ref reason, .. } if reason.contains("already exists"))
        );
    }

    #[tokio::test]
    async fn test_burn_missing_token_never_submits() {
        let mut client = MockChainClient::new();
        client.expect_submit().never();
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(false));

        let err = submitter(client, state)
            .submit(&burn(), None)
            .await
            .unwrap_err();
        assert!(
            matches!(err, OpsError::PreconditionFailed { ref reason, .. } if reason.contains("does not exist"))
        );
    }

    #[tokio::test]
    async fn test_mint_defaults_payment_to_price() {
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(false));
        state
            .expect_mint_price()
            .times(1)
            .returning(|| Ok(U256::from(5_000)));

        let op = Operation::Mint {
            plus_code: "8FVC9G8F+6X".to_string(),
            payment: Some(U256::zero()),
        };
        let call = submitter(MockChainClient::new(), state)
            .prepare(&op, None)
            .await
            .unwrap();

        assert_eq!(call.value, Some(U256::from(5_000)));
        assert_eq!(call.gas_limit, Some(10_000_000));
        assert_eq!(
            call.call,
            ContractCall::Mint {
                plus_code: "8FVC9G8F+6X".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_withdraw_defaults_to_owner_and_full_balance() {
        let registry = Address::repeat_byte(0x11);
        let owner = Address::repeat_byte(0x22);

        let mut state = MockChainState::new();
        state.expect_registry_address().return_const(registry);
        state.expect_owner().returning(move || Ok(owner));
        state
            .expect_native_balance()
            .with(eq(registry))
            .returning(|_| Ok(U256::from(777)));

        let op = Operation::Withdraw {
            to: None,
            amount: None,
        };
        let call = submitter(MockChainClient::new(), state)
            .prepare(&op, None)
            .await
            .unwrap();

        assert_eq!(
            call.call,
            ContractCall::Withdraw {
                to: owner,
                amount: U256::from(777)
            }
        );
        assert_eq!(call.gas_limit, None);
    }

    #[tokio::test]
    async fn test_client_rejection_propagates() {
        let mut client = MockChainClient::new();
        client.expect_submit().times(1).returning(|call| {
            Err(OpsError::SubmissionRejected {
                operation: call.operation,
                reason: "insufficient funds for gas * price + value".to_string(),
            })
        });
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(true));

        let err = submitter(client, state)
            .submit(&burn(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::SubmissionRejected { .. }));
    }

    #[tokio::test]
    async fn test_two_submits_are_two_attempts() {
        let mut state = MockChainState::new();
        state.expect_token_exists().returning(|_| Ok(true));
        let submitter = submitter(accepting_client(2), state);

        submitter.submit(&burn(), None).await.unwrap();
        submitter.submit(&burn(), None).await.unwrap();
    }
}
