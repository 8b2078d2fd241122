//! HTTP gateway with retry and endpoint failover

use super::retry::RetryPolicy;
use super::{BlockHeader, BlockRef, Receipt, RpcGateway};
use crate::config::RpcConfig;
use crate::error::{LoadError, LoadResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use url::Url;

/// Multi-endpoint JSON-RPC gateway with automatic failover
pub struct ChainProvider {
    /// HTTP providers (primary first, then fallbacks)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Backoff for transient network failures
    retry: RetryPolicy,
}

impl ChainProvider {
    /// Create a gateway for the configured endpoints. Performs no network I/O.
    pub fn new(config: &RpcConfig) -> LoadResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LoadError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let mut http_providers = Vec::new();
        for raw_url in config.urls() {
            match Url::parse(&raw_url) {
                Ok(url) => {
                    http_providers.push(Provider::new(Http::new_with_client(url, client.clone())));
                    debug!("Added HTTP provider: {}", raw_url);
                }
                Err(e) => {
                    warn!("Skipping invalid RPC url {}: {}", raw_url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(LoadError::Config("No valid RPC endpoints".to_string()));
        }

        Ok(Self {
            http_providers,
            current_provider: AtomicUsize::new(0),
            retry: RetryPolicy::from(&config.retry),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        if self.http_providers.len() < 2 {
            return;
        }
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("RPC failover to provider {}", next);
    }

    /// Run one RPC call under the retry policy, failing over on network errors
    async fn call<T, F, Fut>(&self, method: &'static str, f: F) -> LoadResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.retry
            .run(method, |_attempt| {
                let fut = f(self.http().clone());
                async move {
                    let result = fut.await.map_err(|e| map_provider_error(method, e));
                    if matches!(result, Err(LoadError::Network { .. })) {
                        self.failover();
                    }
                    result
                }
            })
            .await
    }
}

#[async_trait]
impl RpcGateway for ChainProvider {
    async fn get_balance(&self, address: Address, block: BlockRef) -> LoadResult<U256> {
        self.call("eth_getBalance", |p| async move {
            p.get_balance(address, Some(block.into())).await
        })
        .await
    }

    async fn get_nonce(&self, address: Address) -> LoadResult<u64> {
        let count = self
            .call("eth_getTransactionCount", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;

        u256_to_u64("eth_getTransactionCount", count)
    }

    async fn gas_price(&self) -> LoadResult<U256> {
        self.call("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn block_number(&self) -> LoadResult<u64> {
        let block = self
            .call("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await?;
        Ok(block.as_u64())
    }

    async fn chain_id(&self) -> LoadResult<u64> {
        let chain_id = self
            .call("eth_chainId", |p| async move { p.get_chainid().await })
            .await?;
        u256_to_u64("eth_chainId", chain_id)
    }

    async fn max_priority_fee(&self) -> LoadResult<U256> {
        self.call("eth_maxPriorityFeePerGas", |p| async move {
            p.request("eth_maxPriorityFeePerGas", ()).await
        })
        .await
    }

    async fn base_fee(&self) -> LoadResult<U256> {
        let history = self
            .call("eth_feeHistory", |p| async move {
                p.fee_history(1u64, BlockNumber::Latest, &[]).await
            })
            .await?;
        Ok(history.base_fee_per_gas.last().copied().unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> LoadResult<H256> {
        // Single attempt on the active endpoint. The caller decides what an
        // unanswered send means for its nonce.
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| map_provider_error("eth_sendRawTransaction", e))
    }

    async fn get_receipt(&self, tx_hash: H256) -> LoadResult<Option<Receipt>> {
        let receipt = self
            .call("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        Ok(receipt.as_ref().and_then(Receipt::from_node))
    }

    async fn get_block(&self, number: u64) -> LoadResult<Option<BlockHeader>> {
        let block = self
            .call("eth_getBlockByNumber", |p| async move { p.get_block(number).await })
            .await?;

        Ok(block.as_ref().and_then(BlockHeader::from_node))
    }
}

/// Map a provider error onto the gateway error taxonomy
fn map_provider_error(method: &str, err: ProviderError) -> LoadError {
    if let Some(resp) = err.as_error_response() {
        return LoadError::Rpc {
            method: method.to_string(),
            code: resp.code,
            message: resp.message.clone(),
        };
    }

    if let Some(serde_err) = err.as_serde_error() {
        return LoadError::MalformedResponse {
            method: method.to_string(),
            message: serde_err.to_string(),
        };
    }

    match err {
        ProviderError::HexError(e) => LoadError::MalformedResponse {
            method: method.to_string(),
            message: e.to_string(),
        },
        other => LoadError::Network {
            method: method.to_string(),
            message: other.to_string(),
        },
    }
}

fn u256_to_u64(method: &str, value: U256) -> LoadResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(LoadError::MalformedResponse {
            method: method.to_string(),
            message: format!("value {} does not fit in u64", value),
        });
    }
    Ok(value.as_u64())
}
