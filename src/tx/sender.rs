//! Transaction signing, submission and outcome classification

use super::builder::UnsignedTransaction;
use super::classify::{Classification, ErrorClassifier};
use super::nonce::LeaseOutcome;
use crate::chain::RpcGateway;
use crate::error::{LoadError, LoadResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Result of one submission attempt
#[derive(Debug, Clone)]
pub enum SubmissionResult {
    /// The node holds the transaction
    Accepted { tx_hash: H256, already_known: bool },
    /// The node rejected it, or the outcome is unknown
    Rejected {
        error: LoadError,
        outcome: LeaseOutcome,
    },
}

impl SubmissionResult {
    /// Outcome to release the submission's lease with
    pub fn lease_outcome(&self) -> LeaseOutcome {
        match self {
            SubmissionResult::Accepted { .. } => LeaseOutcome::Confirmed,
            SubmissionResult::Rejected { outcome, .. } => *outcome,
        }
    }

    pub fn tx_hash(&self) -> Option<H256> {
        match self {
            SubmissionResult::Accepted { tx_hash, .. } => Some(*tx_hash),
            SubmissionResult::Rejected { .. } => None,
        }
    }
}

/// Signs and submits transactions; one submission per call
pub struct TransactionSender {
    gateway: Arc<dyn RpcGateway>,
    classifier: ErrorClassifier,
}

impl TransactionSender {
    /// Create a new transaction sender
    pub fn new(gateway: Arc<dyn RpcGateway>, classifier: ErrorClassifier) -> Self {
        Self {
            gateway,
            classifier,
        }
    }

    /// Sign `tx` with `wallet` and submit it.
    ///
    /// Rejections carry the lease outcome the caller must release with.
    pub async fn submit(&self, tx: &UnsignedTransaction, wallet: &LocalWallet) -> SubmissionResult {
        let (raw, local_hash) = match sign(tx, wallet) {
            Ok(signed) => signed,
            Err(error) => {
                warn!("Failed to sign transaction with nonce {}: {}", tx.nonce(), error);
                let outcome = self.outcome_for(&error);
                return SubmissionResult::Rejected { error, outcome };
            }
        };

        let started = Instant::now();
        let result = self.gateway.send_raw_transaction(raw).await;
        crate::metrics::record_submission_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(tx_hash) => {
                if tx_hash != local_hash {
                    warn!(
                        "Node returned hash {:?} for nonce {}, locally computed {:?}",
                        tx_hash,
                        tx.nonce(),
                        local_hash
                    );
                }
                debug!("Transaction sent: {:?} (nonce {})", tx_hash, tx.nonce());
                SubmissionResult::Accepted {
                    tx_hash,
                    already_known: false,
                }
            }
            Err(error) => match self.classifier.classify(&error) {
                Classification::Accepted => {
                    debug!(
                        "Node already holds nonce {} as {:?}: {}",
                        tx.nonce(),
                        local_hash,
                        error
                    );
                    SubmissionResult::Accepted {
                        tx_hash: local_hash,
                        already_known: true,
                    }
                }
                Classification::Rejected(outcome) => SubmissionResult::Rejected { error, outcome },
            },
        }
    }

    fn outcome_for(&self, error: &LoadError) -> LeaseOutcome {
        match self.classifier.classify(error) {
            Classification::Accepted => LeaseOutcome::Confirmed,
            Classification::Rejected(outcome) => outcome,
        }
    }
}

/// Sign (EIP-155 legacy or EIP-1559) and RLP encode; returns the raw bytes and their hash
fn sign(tx: &UnsignedTransaction, wallet: &LocalWallet) -> LoadResult<(Bytes, H256)> {
    let typed = tx.to_typed();
    let chain_id = tx.chain_id().unwrap_or_else(|| wallet.chain_id());
    let wallet = wallet.clone().with_chain_id(chain_id);

    let signature = wallet
        .sign_transaction_sync(&typed)
        .map_err(|e| LoadError::Wallet(e.to_string()))?;

    let raw = typed.rlp_signed(&signature);
    let hash = H256::from(keccak256(&raw));
    Ok((raw, hash))
}
