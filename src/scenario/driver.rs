//! Per-VU iteration loop body

use crate::chain::{BlockRef, ReceiptStatus, RpcGateway};
use crate::error::{LoadError, LoadResult};
use crate::tx::{
    FeeQuote, GasEstimator, LeaseOutcome, NonceAllocator, ReceiptPoller, SubmissionResult,
    TransactionBuilder, TransactionSender, TxRequest,
};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Receipt wait parameters; absent means fire-and-forget
#[derive(Debug, Clone, Copy)]
pub struct ReceiptWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Everything an iteration needs, shared by all VUs
pub struct Pipeline {
    pub gateway: Arc<dyn RpcGateway>,
    pub allocator: Arc<NonceAllocator>,
    pub builder: TransactionBuilder,
    pub gas: GasEstimator,
    pub sender: TransactionSender,
    pub poller: ReceiptPoller,
    pub request: TxRequest,
    pub receipts: Option<ReceiptWait>,
}

/// What one iteration ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Accepted by the node, receipt not awaited
    Submitted { nonce: u64, tx_hash: H256 },
    /// Accepted and observed in a block
    Included {
        nonce: u64,
        tx_hash: H256,
        block_number: u64,
        status: ReceiptStatus,
    },
    /// Accepted, but inclusion is unknown (timeout or polling error)
    ReceiptUnknown {
        nonce: u64,
        tx_hash: H256,
        error_kind: &'static str,
    },
    /// The node rejected the transaction or its fate is ambiguous
    Rejected {
        nonce: u64,
        error_kind: &'static str,
        lease_outcome: LeaseOutcome,
    },
    /// Local validation failed before anything was sent
    Invalid { nonce: u64, error_kind: &'static str },
}

impl IterationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            IterationOutcome::Submitted { .. } => "submitted",
            IterationOutcome::Included {
                status: ReceiptStatus::Included,
                ..
            } => "included",
            IterationOutcome::Included {
                status: ReceiptStatus::Failed,
                ..
            } => "reverted",
            IterationOutcome::ReceiptUnknown { .. } => "receipt_unknown",
            IterationOutcome::Rejected {
                lease_outcome: LeaseOutcome::RejectedRetryable,
                ..
            } => "rejected_retryable",
            IterationOutcome::Rejected { .. } => "rejected_terminal",
            IterationOutcome::Invalid { .. } => "invalid",
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            IterationOutcome::Submitted { nonce, .. }
            | IterationOutcome::Included { nonce, .. }
            | IterationOutcome::ReceiptUnknown { nonce, .. }
            | IterationOutcome::Rejected { nonce, .. }
            | IterationOutcome::Invalid { nonce, .. } => *nonce,
        }
    }

    /// The node accepted the transaction
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            IterationOutcome::Submitted { .. }
                | IterationOutcome::Included { .. }
                | IterationOutcome::ReceiptUnknown { .. }
        )
    }

    /// How the nonce lease was resolved
    pub fn lease_outcome(&self) -> LeaseOutcome {
        match self {
            IterationOutcome::Rejected { lease_outcome, .. } => *lease_outcome,
            IterationOutcome::Invalid { .. } => LeaseOutcome::RejectedRetryable,
            _ => LeaseOutcome::Confirmed,
        }
    }

    pub fn error_kind(&self) -> Option<&'static str> {
        match self {
            IterationOutcome::ReceiptUnknown { error_kind, .. }
            | IterationOutcome::Rejected { error_kind, .. }
            | IterationOutcome::Invalid { error_kind, .. } => Some(*error_kind),
            _ => None,
        }
    }

    /// Block the transaction landed in, when its receipt was awaited
    pub fn block_number(&self) -> Option<u64> {
        match self {
            IterationOutcome::Included { block_number, .. } => Some(*block_number),
            _ => None,
        }
    }

    pub fn tx_hash(&self) -> Option<H256> {
        match self {
            IterationOutcome::Submitted { tx_hash, .. }
            | IterationOutcome::Included { tx_hash, .. }
            | IterationOutcome::ReceiptUnknown { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }
}

/// One concurrent lane of load
pub struct VirtualUser {
    id: usize,
    wallet: Arc<LocalWallet>,
    pipeline: Arc<Pipeline>,
    iteration: u64,
    /// Local expectation only; the allocator is authoritative
    next_nonce_hint: Option<u64>,
}

impl VirtualUser {
    pub fn new(id: usize, wallet: Arc<LocalWallet>, pipeline: Arc<Pipeline>) -> Self {
        Self {
            id,
            wallet,
            pipeline,
            iteration: 0,
            next_nonce_hint: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    /// Run one lease → build → submit → (receipt) → release cycle.
    ///
    /// Only allocator invariant violations are returned as errors; every
    /// other failure is reported through the outcome.
    pub async fn run_iteration(&mut self) -> LoadResult<IterationOutcome> {
        self.iteration += 1;
        let pipeline = self.pipeline.clone();
        let address = self.address();

        let mut lease = pipeline.allocator.lease(address)?;
        let nonce = lease.nonce();

        if let Some(hint) = self.next_nonce_hint {
            if hint != nonce {
                debug!(vu = self.id, expected = hint, leased = nonce, "Leased nonce differs from local hint");
            }
        }

        let (fees, balance) = self.observe(address).await;
        let gas_price = fees.map(|quote| quote.max_price_per_gas());

        let tx = match pipeline.builder.build(&pipeline.request, nonce, fees) {
            Ok(tx) => tx,
            Err(error) => {
                pipeline.allocator.release(lease, LeaseOutcome::RejectedRetryable)?;
                let outcome = IterationOutcome::Invalid {
                    nonce,
                    error_kind: error.kind(),
                };
                self.report(address, &outcome, gas_price, balance, Some(&error));
                return Ok(outcome);
            }
        };

        if let (Some(balance), Some(gas_limit)) = (balance, tx.gas_limit()) {
            let cost = GasEstimator::calculate_cost(tx.value(), gas_limit, tx.gas_price());
            if balance < cost {
                warn!(vu = self.id, nonce, %balance, %cost, "Balance below transaction cost");
            }
        }

        lease.mark_submitting();
        let submission = pipeline.sender.submit(&tx, &self.wallet).await;

        let (outcome, error) = match submission {
            SubmissionResult::Accepted { tx_hash, .. } => {
                lease.mark_acknowledged();
                pipeline.allocator.release(lease, LeaseOutcome::Confirmed)?;
                self.await_inclusion(nonce, tx_hash).await
            }
            SubmissionResult::Rejected { error, outcome } => {
                pipeline.allocator.release(lease, outcome)?;
                (
                    IterationOutcome::Rejected {
                        nonce,
                        error_kind: error.kind(),
                        lease_outcome: outcome,
                    },
                    Some(error),
                )
            }
        };

        self.next_nonce_hint = Some(nonce + 1);
        self.report(address, &outcome, gas_price, balance, error.as_ref());
        Ok(outcome)
    }

    /// Best-effort fee quote and balance at the current block
    async fn observe(&self, address: Address) -> (Option<FeeQuote>, Option<U256>) {
        let gateway = self.pipeline.gateway.as_ref();

        let gas = async {
            match self.pipeline.gas.get_fees(gateway).await {
                Ok(quote) => Some(quote),
                Err(e) => {
                    warn!(vu = self.id, "Fee quote unavailable: {}", e);
                    None
                }
            }
        };

        let balance = async {
            let block = match gateway.block_number().await {
                Ok(number) => BlockRef::Number(number),
                Err(e) => {
                    debug!(vu = self.id, "Block number unavailable, using latest: {}", e);
                    BlockRef::Latest
                }
            };
            match gateway.get_balance(address, block).await {
                Ok(balance) => Some(balance),
                Err(e) => {
                    warn!(vu = self.id, "Balance unavailable: {}", e);
                    None
                }
            }
        };

        tokio::join!(gas, balance)
    }

    async fn await_inclusion(&self, nonce: u64, tx_hash: H256) -> (IterationOutcome, Option<LoadError>) {
        let Some(wait) = self.pipeline.receipts else {
            return (IterationOutcome::Submitted { nonce, tx_hash }, None);
        };

        match self
            .pipeline
            .poller
            .await_receipt(tx_hash, wait.poll_interval, wait.timeout)
            .await
        {
            Ok(receipt) => (
                IterationOutcome::Included {
                    nonce,
                    tx_hash,
                    block_number: receipt.block_number,
                    status: receipt.status,
                },
                None,
            ),
            Err(error) => (
                IterationOutcome::ReceiptUnknown {
                    nonce,
                    tx_hash,
                    error_kind: error.kind(),
                },
                Some(error),
            ),
        }
    }

    /// One structured event per iteration, enough to rebuild the nonce timeline
    fn report(
        &self,
        address: Address,
        outcome: &IterationOutcome,
        gas_price: Option<U256>,
        balance: Option<U256>,
        error: Option<&LoadError>,
    ) {
        crate::metrics::record_iteration(outcome.label());

        let tx_hash = outcome.tx_hash().map(|h| format!("{:?}", h));
        let error_message = error.map(|e| e.to_string());

        if outcome.is_accepted() && error.is_none() {
            info!(
                vu = self.id,
                iteration = self.iteration,
                account = ?address,
                nonce = outcome.nonce(),
                gas_price = %display_or_none(gas_price),
                balance = %display_or_none(balance),
                tx_hash = %display_or_none(tx_hash),
                outcome = outcome.label(),
                lease_outcome = outcome.lease_outcome().as_str(),
                "Iteration complete"
            );
        } else {
            warn!(
                vu = self.id,
                iteration = self.iteration,
                account = ?address,
                nonce = outcome.nonce(),
                gas_price = %display_or_none(gas_price),
                balance = %display_or_none(balance),
                tx_hash = %display_or_none(tx_hash),
                outcome = outcome.label(),
                lease_outcome = outcome.lease_outcome().as_str(),
                error_kind = outcome.error_kind().unwrap_or("none"),
                error = %display_or_none(error_message),
                "Iteration failed"
            );
        }
    }
}

fn display_or_none<T: Display>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
}
