//! Chain module - typed JSON-RPC gateway to the target endpoint
//!
//! This module provides:
//! - The `RpcGateway` contract every other component talks to
//! - `ChainProvider`, an HTTP implementation with endpoint failover
//! - Exponential backoff for transient network failures

pub mod provider;
pub mod retry;
#[cfg(test)]
pub(crate) mod stub;

pub use provider::ChainProvider;
pub use retry::RetryPolicy;

use crate::error::LoadResult;

use async_trait::async_trait;
use ethers::types::{
    Address, Block, BlockId, BlockNumber, Bytes, TransactionReceipt, H256, U256,
};

/// Block selector for state queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Latest,
    Pending,
    Number(u64),
}

impl From<BlockRef> for BlockId {
    fn from(block: BlockRef) -> Self {
        match block {
            BlockRef::Latest => BlockId::Number(BlockNumber::Latest),
            BlockRef::Pending => BlockId::Number(BlockNumber::Pending),
            BlockRef::Number(n) => BlockId::Number(BlockNumber::Number(n.into())),
        }
    }
}

/// Execution status reported by a receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Included,
    Failed,
}

/// Inclusion record for a mined transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block_hash: H256,
    pub block_number: u64,
    pub status: ReceiptStatus,
    pub gas_used: U256,
}

impl Receipt {
    /// Convert a node receipt; `None` while the receipt has no block yet
    pub fn from_node(receipt: &TransactionReceipt) -> Option<Self> {
        let block_hash = receipt.block_hash?;
        let block_number = receipt.block_number?.as_u64();

        // Pre-byzantium receipts carry no status; treat them as included
        let status = match receipt.status {
            Some(s) if s.is_zero() => ReceiptStatus::Failed,
            _ => ReceiptStatus::Included,
        };

        Some(Self {
            tx_hash: receipt.transaction_hash,
            block_hash,
            block_number,
            status,
            gas_used: receipt.gas_used.unwrap_or_default(),
        })
    }
}

/// Header fields of a mined block used for throughput statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Seconds since the epoch
    pub timestamp: u64,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub tx_count: usize,
}

impl BlockHeader {
    /// Convert a node block; `None` for a pending block without a number
    pub fn from_node(block: &Block<H256>) -> Option<Self> {
        Some(Self {
            number: block.number?.as_u64(),
            timestamp: saturating_u64(block.timestamp),
            gas_used: saturating_u64(block.gas_used),
            gas_limit: saturating_u64(block.gas_limit),
            tx_count: block.transactions.len(),
        })
    }
}

fn saturating_u64(value: U256) -> u64 {
    value.min(U256::from(u64::MAX)).as_u64()
}

/// Typed view of the JSON-RPC calls used by the load generator.
///
/// Every call fails with `LoadError::Network` on connection or timeout
/// failures, `LoadError::Rpc` when the node answers with an error object,
/// and `LoadError::MalformedResponse` when the answer cannot be decoded.
/// Read calls spend the implementation's retry budget on `Network` errors
/// first. `Rpc` errors are never retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcGateway: Send + Sync {
    /// `eth_getBalance`
    async fn get_balance(&self, address: Address, block: BlockRef) -> LoadResult<U256>;

    /// `eth_getTransactionCount` at the pending block
    async fn get_nonce(&self, address: Address) -> LoadResult<u64>;

    /// `eth_gasPrice`
    async fn gas_price(&self) -> LoadResult<U256>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> LoadResult<u64>;

    /// `eth_chainId`
    async fn chain_id(&self) -> LoadResult<u64>;

    /// `eth_maxPriorityFeePerGas`
    async fn max_priority_fee(&self) -> LoadResult<U256>;

    /// Base fee of the newest block from `eth_feeHistory`, zero before London
    async fn base_fee(&self) -> LoadResult<U256>;

    /// `eth_sendRawTransaction`, attempted exactly once. A `Network` error
    /// leaves it unknown whether the node holds the transaction.
    async fn send_raw_transaction(&self, raw: Bytes) -> LoadResult<H256>;

    /// `eth_getTransactionReceipt`
    async fn get_receipt(&self, tx_hash: H256) -> LoadResult<Option<Receipt>>;

    /// `eth_getBlockByNumber` without transaction bodies
    async fn get_block(&self, number: u64) -> LoadResult<Option<BlockHeader>>;
}
