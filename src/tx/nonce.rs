//! Nonce allocation for concurrent submission from shared accounts
//!
//! Handles:
//! - One in-memory counter per account, seeded once from the chain
//! - Lease/release of individual nonce values
//! - Requeue of rejected values ahead of fresh ones, oldest first
//! - Burning values whose on-chain fate is unknown
//!
//! Critical sections only touch in-memory state and never span an `.await`,
//! so RPC latency on one VU never serializes other VUs.

use crate::chain::RpcGateway;
use crate::error::{LoadError, LoadResult};

use dashmap::DashMap;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// How a leased nonce was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaseOutcome {
    /// The node acknowledged the transaction; the value is spent
    Confirmed,
    /// The node rejected the transaction; the value may be handed out again
    RejectedRetryable,
    /// The value's on-chain state is unknown or unusable; never reissue it
    RejectedTerminal,
}

impl LeaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseOutcome::Confirmed => "confirmed",
            LeaseOutcome::RejectedRetryable => "rejected-retryable",
            LeaseOutcome::RejectedTerminal => "rejected-terminal",
        }
    }
}

/// Progress of the submission that owns a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    /// Nothing has been sent yet
    Leased,
    /// Signed bytes handed to the gateway, no answer yet
    Submitting,
    /// The node returned a transaction hash
    Acknowledged,
}

/// What the allocator did with a released value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceDisposition {
    Spent,
    Requeued,
    Burned,
}

/// Point-in-time view of one account's bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NonceSnapshot {
    pub next: u64,
    pub queued: Vec<u64>,
    pub outstanding: Vec<u64>,
    pub burned: Vec<u64>,
}

/// Local bookkeeping compared against the chain at the end of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub address: Address,
    pub on_chain_nonce: u64,
    pub local: NonceSnapshot,
}

impl ReconciliationReport {
    /// Values below `next` that the chain will wait on forever
    pub fn gaps(&self) -> Vec<u64> {
        let mut gaps: Vec<u64> = self
            .local
            .burned
            .iter()
            .chain(self.local.queued.iter())
            .copied()
            .filter(|n| *n >= self.on_chain_nonce)
            .collect();
        gaps.sort_unstable();
        gaps
    }

    pub fn is_clean(&self) -> bool {
        self.local.outstanding.is_empty()
            && self.gaps().is_empty()
            && self.on_chain_nonce == self.local.next
    }
}

struct NonceState {
    /// Next never-issued value
    next: u64,
    /// Values returned by retryable rejections, oldest first
    retry_queue: VecDeque<u64>,
    /// Values currently leased
    outstanding: HashSet<u64>,
    /// Times each value has been requeued
    requeues: HashMap<u64, u32>,
    /// Values permanently skipped
    burned: Vec<u64>,
}

/// Per-account counter and retry queue
struct AccountNonces {
    address: Address,
    max_requeues: u32,
    state: Mutex<NonceState>,
    /// Set when a dropped lease could not be resolved; blocks further leases
    fault: OnceLock<String>,
}

impl AccountNonces {
    fn new(address: Address, start: u64, max_requeues: u32) -> Self {
        Self {
            address,
            max_requeues,
            state: Mutex::new(NonceState {
                next: start,
                retry_queue: VecDeque::new(),
                outstanding: HashSet::new(),
                requeues: HashMap::new(),
                burned: Vec::new(),
            }),
            fault: OnceLock::new(),
        }
    }

    /// Record an inconsistency no caller was around to see
    fn poison(&self, message: String) {
        let _ = self.fault.set(message);
    }

    fn lock(&self) -> LoadResult<MutexGuard<'_, NonceState>> {
        self.state.lock().map_err(|_| LoadError::AllocatorState {
            address: self.address,
            message: "nonce state lock poisoned".to_string(),
        })
    }

    fn current(&self) -> LoadResult<u64> {
        Ok(self.lock()?.next)
    }

    fn take(&self) -> LoadResult<u64> {
        if let Some(fault) = self.fault.get() {
            return Err(LoadError::AllocatorState {
                address: self.address,
                message: format!("bookkeeping faulted earlier: {}", fault),
            });
        }

        let mut state = self.lock()?;

        let nonce = match state.retry_queue.pop_front() {
            Some(requeued) => requeued,
            None => {
                let fresh = state.next;
                state.next += 1;
                fresh
            }
        };

        if !state.outstanding.insert(nonce) {
            return Err(LoadError::AllocatorState {
                address: self.address,
                message: format!("nonce {} issued while already outstanding", nonce),
            });
        }

        Ok(nonce)
    }

    fn resolve(&self, nonce: u64, outcome: LeaseOutcome) -> LoadResult<NonceDisposition> {
        let mut state = self.lock()?;

        if !state.outstanding.remove(&nonce) {
            return Err(LoadError::AllocatorState {
                address: self.address,
                message: format!("nonce {} released but not outstanding", nonce),
            });
        }

        let disposition = match outcome {
            LeaseOutcome::Confirmed => {
                state.requeues.remove(&nonce);
                NonceDisposition::Spent
            }
            LeaseOutcome::RejectedRetryable => {
                let count = state.requeues.entry(nonce).or_insert(0);
                *count += 1;
                if *count > self.max_requeues {
                    state.requeues.remove(&nonce);
                    state.burned.push(nonce);
                    NonceDisposition::Burned
                } else {
                    state.retry_queue.push_back(nonce);
                    NonceDisposition::Requeued
                }
            }
            LeaseOutcome::RejectedTerminal => {
                state.requeues.remove(&nonce);
                state.burned.push(nonce);
                NonceDisposition::Burned
            }
        };

        Ok(disposition)
    }

    fn snapshot(&self) -> LoadResult<NonceSnapshot> {
        let state = self.lock()?;
        let mut outstanding: Vec<u64> = state.outstanding.iter().copied().collect();
        outstanding.sort_unstable();

        Ok(NonceSnapshot {
            next: state.next,
            queued: state.retry_queue.iter().copied().collect(),
            outstanding,
            burned: state.burned.clone(),
        })
    }
}

/// Exclusive claim on one nonce value.
///
/// Release it through [`NonceAllocator::release`]. A lease dropped without
/// release (e.g. its task was cancelled) resolves from its phase:
/// `Leased` is requeued, `Acknowledged` is spent, and `Submitting` is burned
/// because the node may or may not hold the transaction.
pub struct NonceLease {
    account: Arc<AccountNonces>,
    nonce: u64,
    phase: LeasePhase,
    resolved: bool,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn address(&self) -> Address {
        self.account.address
    }

    pub fn phase(&self) -> LeasePhase {
        self.phase
    }

    /// Signed bytes are about to be handed to the gateway
    pub fn mark_submitting(&mut self) {
        self.phase = LeasePhase::Submitting;
    }

    /// The node returned a hash for this nonce
    pub fn mark_acknowledged(&mut self) {
        self.phase = LeasePhase::Acknowledged;
    }

    fn outcome_on_drop(&self) -> LeaseOutcome {
        match self.phase {
            LeasePhase::Leased => LeaseOutcome::RejectedRetryable,
            LeasePhase::Submitting => LeaseOutcome::RejectedTerminal,
            LeasePhase::Acknowledged => LeaseOutcome::Confirmed,
        }
    }
}

impl std::fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceLease")
            .field("address", &self.account.address)
            .field("nonce", &self.nonce)
            .field("phase", &self.phase)
            .finish()
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }

        let outcome = self.outcome_on_drop();
        if self.phase == LeasePhase::Submitting {
            error!(
                account = ?self.account.address,
                nonce = self.nonce,
                "Submission abandoned without acknowledgment; burning nonce, manual reconciliation required"
            );
        } else {
            debug!(
                account = ?self.account.address,
                nonce = self.nonce,
                outcome = outcome.as_str(),
                "Unreleased lease resolved on drop"
            );
        }

        match self.account.resolve(self.nonce, outcome) {
            Ok(disposition) => {
                crate::metrics::record_nonce_release(outcome);
                if disposition == NonceDisposition::Burned {
                    crate::metrics::record_nonce_burned();
                }
            }
            Err(e) => {
                error!("Failed to resolve dropped lease: {}", e);
                self.account.poison(e.to_string());
            }
        }
    }
}

/// Hands out nonces for any number of accounts shared across VUs
pub struct NonceAllocator {
    gateway: Arc<dyn RpcGateway>,
    accounts: DashMap<Address, Arc<OnceCell<Arc<AccountNonces>>>>,
    max_requeues: u32,
}

impl NonceAllocator {
    /// Create an allocator. Each value may be requeued at most
    /// `max_requeues` times before it is burned.
    pub fn new(gateway: Arc<dyn RpcGateway>, max_requeues: u32) -> Self {
        Self {
            gateway,
            accounts: DashMap::new(),
            max_requeues,
        }
    }

    /// Seed the counter for `address` from its on-chain pending nonce.
    ///
    /// Only the first call queries the gateway; later or concurrent calls
    /// return the counter's current value.
    pub async fn initialize(&self, address: Address) -> LoadResult<u64> {
        let cell = self
            .accounts
            .entry(address)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let account = cell
            .get_or_try_init(|| async {
                let start = self.gateway.get_nonce(address).await?;
                info!(account = ?address, nonce = start, "Initialized nonce counter");
                Ok::<_, LoadError>(Arc::new(AccountNonces::new(
                    address,
                    start,
                    self.max_requeues,
                )))
            })
            .await?;

        account.current()
    }

    /// Claim the next nonce for `address`: the oldest requeued value if any,
    /// otherwise a fresh one.
    pub fn lease(&self, address: Address) -> LoadResult<NonceLease> {
        let account = self.account(address)?;
        let nonce = account.take()?;

        debug!(account = ?address, nonce, "Leased nonce");
        crate::metrics::record_nonce_leased();

        Ok(NonceLease {
            account,
            nonce,
            phase: LeasePhase::Leased,
            resolved: false,
        })
    }

    /// Resolve a lease. A lease from another allocator is refused and left
    /// to resolve in its own allocator when dropped.
    pub fn release(&self, mut lease: NonceLease, outcome: LeaseOutcome) -> LoadResult<NonceDisposition> {
        let owned = self
            .account(lease.address())
            .map(|account| Arc::ptr_eq(&account, &lease.account))
            .unwrap_or(false);
        if !owned {
            return Err(LoadError::AllocatorState {
                address: lease.address(),
                message: format!("nonce {} released to an allocator that did not issue it", lease.nonce),
            });
        }

        lease.resolved = true;
        let disposition = lease.account.resolve(lease.nonce, outcome)?;
        crate::metrics::record_nonce_release(outcome);

        match disposition {
            NonceDisposition::Burned => {
                crate::metrics::record_nonce_burned();
                warn!(
                    account = ?lease.address(),
                    nonce = lease.nonce,
                    outcome = outcome.as_str(),
                    "Burned nonce; it will not be reissued"
                );
            }
            NonceDisposition::Requeued => {
                debug!(account = ?lease.address(), nonce = lease.nonce, "Requeued nonce");
            }
            NonceDisposition::Spent => {}
        }

        Ok(disposition)
    }

    /// Current local bookkeeping for `address`
    pub fn snapshot(&self, address: Address) -> LoadResult<NonceSnapshot> {
        self.account(address)?.snapshot()
    }

    /// Compare local bookkeeping with the chain's pending nonce
    pub async fn reconcile(&self, address: Address) -> LoadResult<ReconciliationReport> {
        let account = self.account(address)?;
        let on_chain_nonce = self.gateway.get_nonce(address).await?;
        let local = account.snapshot()?;

        let report = ReconciliationReport {
            address,
            on_chain_nonce,
            local,
        };

        if report.is_clean() {
            info!(account = ?address, nonce = on_chain_nonce, "Nonce bookkeeping matches chain");
        } else {
            warn!(
                account = ?address,
                on_chain = report.on_chain_nonce,
                local_next = report.local.next,
                gaps = ?report.gaps(),
                outstanding = ?report.local.outstanding,
                "Nonce bookkeeping diverges from chain"
            );
        }

        Ok(report)
    }

    /// Addresses with an initialized counter
    pub fn accounts(&self) -> Vec<Address> {
        self.accounts
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| *entry.key())
            .collect()
    }

    fn account(&self, address: Address) -> LoadResult<Arc<AccountNonces>> {
        self.accounts
            .get(&address)
            .and_then(|cell| cell.get().cloned())
            .ok_or(LoadError::AllocatorState {
                address,
                message: "account not initialized".to_string(),
            })
    }
}
