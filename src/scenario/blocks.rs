//! Block-level throughput and gas usage for the transactions a run landed

use super::driver::{Pipeline, ReceiptWait};
use crate::chain::BlockHeader;

use ethers::types::H256;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Receipt polls in flight while collecting
const RECEIPT_CONCURRENCY: usize = 16;

/// One block that holds at least one of the run's transactions
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub number: u64,
    pub timestamp: u64,
    /// All transactions in the block, not only the run's
    pub num_txs: usize,
    pub gas_used: u64,
    pub gas_limit: u64,
    /// Percent of the gas limit used
    pub gas_utilization: f64,
    /// Seconds since the parent block
    pub block_time: u64,
    pub txs_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockReport {
    pub total_blocks: usize,
    /// Accepted transactions found in a block
    pub total_txs: u64,
    /// Accepted transactions still without a receipt at the deadline
    pub unresolved_txs: u64,
    /// Sum of block times, in seconds
    pub total_time: u64,
    pub total_gas_used: u64,
    pub avg_gas_per_tx: u64,
    pub min_txs_per_second: f64,
    pub max_txs_per_second: f64,
    pub avg_txs_per_second: f64,
    pub min_gas_utilization: f64,
    pub max_gas_utilization: f64,
    pub avg_gas_utilization: f64,
    /// Ascending by number
    pub blocks: Vec<BlockStats>,
}

impl BlockReport {
    /// Statistics over `headers`. A block's parent timestamp comes from
    /// `headers` itself or else from `parent_timestamps`; a block whose
    /// parent is unknown gets a block time of zero.
    ///
    /// Blocks produced within the same second count as one second apart.
    pub fn compute(
        headers: &BTreeMap<u64, BlockHeader>,
        parent_timestamps: &HashMap<u64, u64>,
        total_txs: u64,
        unresolved_txs: u64,
    ) -> Self {
        let blocks: Vec<BlockStats> = headers
            .values()
            .map(|header| {
                let parent_timestamp = header
                    .number
                    .checked_sub(1)
                    .and_then(|parent| {
                        headers
                            .get(&parent)
                            .map(|b| b.timestamp)
                            .or_else(|| parent_timestamps.get(&parent).copied())
                    })
                    .unwrap_or(header.timestamp);
                let block_time = header.timestamp.abs_diff(parent_timestamp);

                BlockStats {
                    number: header.number,
                    timestamp: header.timestamp,
                    num_txs: header.tx_count,
                    gas_used: header.gas_used,
                    gas_limit: header.gas_limit,
                    gas_utilization: percent(header.gas_used, header.gas_limit),
                    block_time,
                    txs_per_second: header.tx_count as f64 / block_time.max(1) as f64,
                }
            })
            .collect();

        let total_time: u64 = blocks.iter().map(|b| b.block_time).sum();
        let total_gas_used = blocks
            .iter()
            .fold(0u64, |sum, b| sum.saturating_add(b.gas_used));
        let (min_tps, max_tps, _) = spread(blocks.iter().map(|b| b.txs_per_second));
        let (min_util, max_util, avg_util) = spread(blocks.iter().map(|b| b.gas_utilization));

        Self {
            total_blocks: blocks.len(),
            total_txs,
            unresolved_txs,
            total_time,
            total_gas_used,
            avg_gas_per_tx: total_gas_used.checked_div(total_txs).unwrap_or(0),
            min_txs_per_second: min_tps,
            max_txs_per_second: max_tps,
            avg_txs_per_second: if blocks.is_empty() {
                0.0
            } else {
                (total_txs as f64 / total_time.max(1) as f64).ceil()
            },
            min_gas_utilization: min_util,
            max_gas_utilization: max_util,
            avg_gas_utilization: avg_util,
            blocks,
        }
    }

    pub fn log(&self) {
        info!(
            blocks = self.total_blocks,
            txs = self.total_txs,
            unresolved = self.unresolved_txs,
            total_time_secs = self.total_time,
            total_gas_used = self.total_gas_used,
            avg_gas_per_tx = self.avg_gas_per_tx,
            min_tps = %format!("{:.2}", self.min_txs_per_second),
            max_tps = %format!("{:.2}", self.max_txs_per_second),
            avg_tps = %format!("{:.2}", self.avg_txs_per_second),
            avg_gas_utilization = %format!("{:.2}", self.avg_gas_utilization),
            "Block statistics"
        );
        for block in &self.blocks {
            debug!(
                block = block.number,
                txs = block.num_txs,
                block_time_secs = block.block_time,
                tps = %format!("{:.2}", block.txs_per_second),
                gas_utilization = %format!("{:.2}", block.gas_utilization),
                "Block"
            );
        }
    }
}

/// Resolve the block of every accepted transaction and summarize those
/// blocks. `mined` pairs each hash with its block number when a receipt was
/// already seen; the rest are polled within `wait`.
pub(super) async fn collect(
    pipeline: &Pipeline,
    mined: Vec<(H256, Option<u64>)>,
    wait: ReceiptWait,
) -> BlockReport {
    let mut numbers = BTreeSet::new();
    let mut pending = Vec::new();
    let mut total_txs = 0u64;
    let mut unresolved_txs = 0u64;
    for (tx_hash, block) in mined {
        match block {
            Some(number) => {
                numbers.insert(number);
                total_txs += 1;
            }
            None => pending.push(tx_hash),
        }
    }

    info!(
        awaiting = pending.len(),
        "Collecting receipts for block statistics"
    );

    let landed: Vec<Option<u64>> = futures::stream::iter(pending)
        .map(|tx_hash| async move {
            match pipeline
                .poller
                .await_receipt(tx_hash, wait.poll_interval, wait.timeout)
                .await
            {
                Ok(receipt) => Some(receipt.block_number),
                Err(e) => {
                    debug!(tx_hash = ?tx_hash, "No receipt for block statistics: {}", e);
                    None
                }
            }
        })
        .buffer_unordered(RECEIPT_CONCURRENCY)
        .collect()
        .await;

    for block in landed {
        match block {
            Some(number) => {
                numbers.insert(number);
                total_txs += 1;
            }
            None => unresolved_txs += 1,
        }
    }

    let mut headers = BTreeMap::new();
    for number in &numbers {
        if let Some(header) = fetch_block(pipeline, *number).await {
            headers.insert(*number, header);
        }
    }

    let mut parent_timestamps = HashMap::new();
    let missing_parents: Vec<u64> = headers
        .keys()
        .filter_map(|number| number.checked_sub(1))
        .filter(|parent| !headers.contains_key(parent))
        .collect();
    for parent in missing_parents {
        if let Some(header) = fetch_block(pipeline, parent).await {
            parent_timestamps.insert(parent, header.timestamp);
        }
    }

    if unresolved_txs > 0 {
        warn!(unresolved_txs, "Some accepted transactions have no receipt yet");
    }

    BlockReport::compute(&headers, &parent_timestamps, total_txs, unresolved_txs)
}

async fn fetch_block(pipeline: &Pipeline, number: u64) -> Option<BlockHeader> {
    match pipeline.gateway.get_block(number).await {
        Ok(Some(header)) => Some(header),
        Ok(None) => {
            warn!(block = number, "Block not found");
            None
        }
        Err(e) => {
            warn!(block = number, "Block unavailable: {}", e);
            None
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Min, max and mean; zeros when empty
fn spread(values: impl Iterator<Item = f64>) -> (f64, f64, f64) {
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::MAX;
    let mut max = 0.0f64;
    for value in values {
        count += 1;
        sum += value;
        min = min.min(value);
        max = max.max(value);
    }

    if count == 0 {
        (0.0, 0.0, 0.0)
    } else {
        (min, max, sum / count as f64)
    }
}
