//! Inclusion polling for submitted transactions

use crate::chain::{Receipt, RpcGateway};
use crate::error::{LoadError, LoadResult};

use ethers::types::H256;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::debug;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct ReceiptPoller {
    gateway: Arc<dyn RpcGateway>,
}

impl ReceiptPoller {
    pub fn new(gateway: Arc<dyn RpcGateway>) -> Self {
        Self { gateway }
    }

    /// Poll until `tx_hash` has a receipt or `timeout` elapses.
    ///
    /// A `Timeout` error says nothing about the transaction itself; it may
    /// still be mined later. Network errors during a poll are tolerated,
    /// node errors end the wait.
    pub async fn await_receipt(
        &self,
        tx_hash: H256,
        poll_interval: Duration,
        timeout: Duration,
    ) -> LoadResult<Receipt> {
        let started = Instant::now();

        let poll = async {
            let mut ticker = tokio::time::interval(poll_interval.max(MIN_POLL_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.gateway.get_receipt(tx_hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        debug!("Receipt poll for {:?} failed, will retry: {}", tx_hash, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(Ok(receipt)) => {
                crate::metrics::record_receipt_latency(started.elapsed().as_secs_f64());
                Ok(receipt)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(LoadError::Timeout {
                operation: format!("receipt of {:?}", tx_hash),
            }),
        }
    }
}
