//! Ethers-backed registry provider
//!
//! Signs and sends registry writes through a nonce-managed signer and watches
//! each transaction in a detached task that reports confirmation or rejection
//! back through the request's notifier.

use super::{ChainClient, ChainState, ContractCall, OutboundCall, Receipt};
use crate::config::{NetworkConfig, RegistryConfig};
use crate::error::{OpsError, OpsResult};
use crate::registry::Record;
use crate::tx::PendingRequest;

use async_trait::async_trait;
use ethers::abi::{parse_abi, Abi, Detokenize, Tokenize};
use ethers::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const REGISTRY_ABI: &[&str] = &[
    "function mint(string plusCode) external payable",
    "function mintWithRecords(string plusCode, string[] keys, string[] values) external payable",
    "function burn(uint256 tokenId) external",
    "function set(string key, string value, uint256 tokenId) external",
    "function setMany(string[] keys, string[] values, uint256 tokenId) external",
    "function setUser(uint256 tokenId, address user, uint64 expires) external",
    "function setBaseURI(string uri) external",
    "function withdraw(address to, uint256 amount) external",
    "function withdrawErc20(address token, address to, uint256 amount) external",
    "function exists(uint256 tokenId) external view returns (bool)",
    "function checkPrice() external view returns (uint256)",
    "function s_mintCostUsd() external view returns (uint256)",
    "function getFeedData() external view returns (int256)",
    "function owner() external view returns (address)",
    "function userOf(uint256 tokenId) external view returns (address)",
    "function userExpires(uint256 tokenId) external view returns (uint256)",
    "function getKeysOf(uint256 tokenId) external view returns (string[])",
    "function getMany(string[] keys, uint256 tokenId) external view returns (string[])",
    "function s_baseURI() external view returns (string)",
];

const ERC20_ABI: &[&str] = &["function balanceOf(address account) external view returns (uint256)"];

type SignerClient = SignerMiddleware<NonceManagerMiddleware<Provider<Http>>, LocalWallet>;

/// Domain registry access over JSON-RPC
pub struct RegistryProvider {
    client: Arc<SignerClient>,
    registry: Contract<SignerClient>,
    erc20_abi: Abi,
    confirmations: usize,
    poll_interval: Duration,
    watch_timeout: Duration,
}

/// How a detached transaction watch ended
enum Watch {
    Settled(Result<Option<TransactionReceipt>, ProviderError>),
    Abandoned,
    Expired,
}

impl RegistryProvider {
    /// Connect to the configured network and registry
    pub async fn connect(network: &NetworkConfig, registry: &RegistryConfig) -> OpsResult<Self> {
        let poll_interval = Duration::from_millis(network.poll_interval_ms);
        let provider = Provider::<Http>::try_from(network.rpc_url.as_str())
            .map_err(|e| OpsError::ChainConnection(format!("Invalid RPC URL: {}", e)))?
            .interval(poll_interval);

        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|e| OpsError::ChainConnection(e.to_string()))?;
        if chain_id.as_u64() != network.chain_id {
            return Err(OpsError::Config(format!(
                "RPC for {} reports chain id {}, expected {}",
                network.name, chain_id, network.chain_id
            )));
        }

        let wallet = load_wallet(&network.private_key_env)?.with_chain_id(network.chain_id);
        let sender = wallet.address();
        let provider = NonceManagerMiddleware::new(provider, sender);
        let client = Arc::new(SignerMiddleware::new(provider, wallet));

        let registry_address: Address = registry
            .domain_registry
            .parse()
            .map_err(|e| OpsError::Config(format!("Invalid registry address: {}", e)))?;
        let registry_abi = parse_abi(REGISTRY_ABI)
            .map_err(|e| OpsError::Internal(format!("Registry ABI: {}", e)))?;
        let erc20_abi =
            parse_abi(ERC20_ABI).map_err(|e| OpsError::Internal(format!("ERC20 ABI: {}", e)))?;

        debug!("Registry {:?} on {}", registry_address, network.name);

        Ok(Self {
            registry: Contract::new(registry_address, registry_abi, client.clone()),
            client,
            erc20_abi,
            confirmations: network.confirmations,
            poll_interval,
            watch_timeout: network.watch_timeout(),
        })
    }

    /// Address of the signing wallet
    pub fn sender(&self) -> Address {
        self.client.address()
    }

    fn build(
        &self,
        call: &ContractCall,
    ) -> Result<ethers::contract::ContractCall<SignerClient, ()>, AbiError> {
        let method = call.method();
        match call.clone() {
            ContractCall::Mint { plus_code } => self.registry.method(method, plus_code),
            ContractCall::MintWithRecords {
                plus_code,
                keys,
                values,
            } => self.registry.method(method, (plus_code, keys, values)),
            ContractCall::Burn { token_id } => self.registry.method(method, token_id),
            ContractCall::Set {
                key,
                value,
                token_id,
            } => self.registry.method(method, (key, value, token_id)),
            ContractCall::SetMany {
                keys,
                values,
                token_id,
            } => self.registry.method(method, (keys, values, token_id)),
            ContractCall::SetUser {
                token_id,
                user,
                expires,
            } => self.registry.method(method, (token_id, user, expires)),
            ContractCall::SetBaseUri { uri } => self.registry.method(method, uri),
            ContractCall::Withdraw { to, amount } => self.registry.method(method, (to, amount)),
            ContractCall::WithdrawErc20 { token, to, amount } => {
                self.registry.method(method, (token, to, amount))
            }
        }
    }

    async fn view<A, T>(&self, name: &'static str, args: A) -> OpsResult<T>
    where
        A: Tokenize,
        T: Detokenize,
    {
        self.registry
            .method::<A, T>(name, args)
            .map_err(|e| OpsError::ContractRead {
                call: name,
                message: e.to_string(),
            })?
            .call()
            .await
            .map_err(|e| OpsError::ContractRead {
                call: name,
                message: e.to_string(),
            })
    }
}

/// Load the signing wallet from the configured environment variable
fn load_wallet(key_env: &str) -> OpsResult<LocalWallet> {
    let key = std::env::var(key_env).map_err(|_| {
        OpsError::Wallet(format!(
            "No wallet configured. Set the {} environment variable",
            key_env
        ))
    })?;

    key.trim()
        .trim_start_matches("0x")
        .parse::<LocalWallet>()
        .map_err(|e| OpsError::Wallet(format!("Invalid private key: {}", e)))
}

#[async_trait]
impl ChainClient for RegistryProvider {
    async fn submit(&self, outbound: OutboundCall) -> OpsResult<PendingRequest> {
        let operation = outbound.operation;
        let mut call = self
            .build(&outbound.call)
            .map_err(|e| OpsError::Internal(format!("Encoding {}: {}", operation, e)))?;

        if let Some(limit) = outbound.gas_limit {
            call = call.gas(limit);
        }
        if let Some(value) = outbound.value {
            call = call.value(value);
        }

        let pending = call
            .send()
            .await
            .map_err(|e| OpsError::SubmissionRejected {
                operation,
                reason: e.to_string(),
            })?;
        let tx_hash = *pending;
        drop(pending);

        let (request, mut notifier) = PendingRequest::new(operation);
        notifier.acknowledge(tx_hash);
        info!("{} sent as {:?}", operation, tx_hash);

        let client = self.client.clone();
        let confirmations = self.confirmations;
        let poll_interval = self.poll_interval;
        let watch_timeout = self.watch_timeout;

        tokio::spawn(async move {
            let watched = PendingTransaction::new(tx_hash, client.provider())
                .confirmations(confirmations)
                .interval(poll_interval);

            let watch = tokio::select! {
                settled = watched => Watch::Settled(settled),
                _ = notifier.abandoned() => Watch::Abandoned,
                _ = tokio::time::sleep(watch_timeout) => Watch::Expired,
            };

            match watch {
                Watch::Settled(Ok(Some(raw))) => {
                    let mut receipt = Receipt::from(&raw);
                    if receipt.effective_gas_price.is_none() {
                        match client.get_transaction(tx_hash).await {
                            Ok(Some(tx)) => receipt.gas_price = tx.gas_price,
                            Ok(None) => warn!("Transaction {:?} not found for price lookup", tx_hash),
                            Err(e) => warn!("Price lookup for {:?} failed: {}", tx_hash, e),
                        }
                    }
                    notifier.confirm(receipt);
                }
                Watch::Settled(Ok(None)) => {
                    notifier.reject("transaction dropped from the mempool");
                }
                Watch::Settled(Err(e)) => {
                    notifier.reject(format!("watching transaction failed: {}", e));
                }
                Watch::Abandoned => {
                    debug!("Stopped watching {:?}: nobody is waiting for it", tx_hash);
                }
                Watch::Expired => {
                    warn!("Stopped watching {:?} after {:?}", tx_hash, watch_timeout);
                    notifier.reject(format!("no receipt within {:?}", watch_timeout));
                }
            }
        });

        Ok(request)
    }
}

#[async_trait]
impl ChainState for RegistryProvider {
    fn registry_address(&self) -> Address {
        self.registry.address()
    }

    async fn token_exists(&self, token_id: U256) -> OpsResult<bool> {
        self.view("exists", token_id).await
    }

    async fn mint_price(&self) -> OpsResult<U256> {
        self.view("checkPrice", ()).await
    }

    async fn mint_cost_usd(&self) -> OpsResult<U256> {
        self.view("s_mintCostUsd", ()).await
    }

    async fn feed_data(&self) -> OpsResult<I256> {
        self.view("getFeedData", ()).await
    }

    async fn owner(&self) -> OpsResult<Address> {
        self.view("owner", ()).await
    }

    async fn native_balance(&self, account: Address) -> OpsResult<U256> {
        self.client
            .get_balance(account, None)
            .await
            .map_err(|e| OpsError::ChainConnection(e.to_string()))
    }

    async fn token_balance(&self, token: Address, account: Address) -> OpsResult<U256> {
        let erc20 = Contract::new(token, self.erc20_abi.clone(), self.client.clone());
        erc20
            .method::<_, U256>("balanceOf", account)
            .map_err(|e| OpsError::ContractRead {
                call: "balanceOf",
                message: e.to_string(),
            })?
            .call()
            .await
            .map_err(|e| OpsError::ContractRead {
                call: "balanceOf",
                message: e.to_string(),
            })
    }

    async fn user_of(&self, token_id: U256) -> OpsResult<Address> {
        self.view("userOf", token_id).await
    }

    async fn user_expires(&self, token_id: U256) -> OpsResult<U256> {
        self.view("userExpires", token_id).await
    }

    async fn records_of(&self, token_id: U256) -> OpsResult<Vec<Record>> {
        let keys: Vec<String> = self.view("getKeysOf", token_id).await?;
        let values: Vec<String> = self.view("getMany", (keys.clone(), token_id)).await?;
        Record::zip(keys, values, "records")
    }

    async fn base_uri(&self) -> OpsResult<String> {
        self.view("s_baseURI", ()).await
    }
}
