//! Spawns VUs, enforces run bounds and reports the result

use super::blocks::{self, BlockReport};
use super::driver::{IterationOutcome, Pipeline, ReceiptWait, VirtualUser};
use crate::chain::RpcGateway;
use crate::config::{AccountConfig, LoadTestConfig, Settings};
use crate::error::{LoadError, LoadResult};
use crate::tx::{
    parse_address, ErrorClassifier, FeeQuote, GasEstimator, NonceAllocator, ReceiptPoller,
    ReconciliationReport, TransactionBuilder, TransactionSender, TxRequest,
};

use dashmap::DashMap;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, H256, U256};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Outcome counts shared by all VU tasks
#[derive(Default)]
struct RunStats {
    outcomes: DashMap<&'static str, u64>,
    accepted: AtomicU64,
    /// Accepted hashes and their block when known; only kept for block stats
    track_blocks: bool,
    mined: DashMap<H256, Option<u64>>,
}

impl RunStats {
    fn new(track_blocks: bool) -> Self {
        Self {
            track_blocks,
            ..Self::default()
        }
    }

    fn record(&self, outcome: &IterationOutcome) {
        *self.outcomes.entry(outcome.label()).or_insert(0) += 1;
        if outcome.is_accepted() {
            self.accepted.fetch_add(1, Ordering::Relaxed);
        }
        if self.track_blocks {
            if let Some(tx_hash) = outcome.tx_hash() {
                self.mined.insert(tx_hash, outcome.block_number());
            }
        }
    }
}

/// End-of-run report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    #[serde(rename = "elapsedSecs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    /// Completed iterations by outcome label
    pub outcomes: BTreeMap<String, u64>,
    /// Transactions the node accepted
    pub accepted: u64,
    pub reconciliation: Vec<ReconciliationReport>,
    /// Present when block statistics were collected
    pub blocks: Option<BlockReport>,
}

fn as_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl RunSummary {
    pub fn iterations(&self) -> u64 {
        self.outcomes.values().sum()
    }

    pub fn count(&self, label: &str) -> u64 {
        self.outcomes.get(label).copied().unwrap_or(0)
    }

    /// Accepted transactions per second
    pub fn submission_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.accepted as f64 / secs
        } else {
            0.0
        }
    }

    /// Every account's bookkeeping matches the chain
    pub fn is_clean(&self) -> bool {
        self.reconciliation.iter().all(|r| r.is_clean())
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            iterations = self.iterations(),
            accepted = self.accepted,
            elapsed_secs = self.elapsed.as_secs_f64(),
            tx_per_sec = %format!("{:.2}", self.submission_rate()),
            "Run complete"
        );
        for (outcome, count) in &self.outcomes {
            info!(run_id = %self.run_id, outcome = %outcome, count, "Outcome total");
        }
        if let Some(blocks) = &self.blocks {
            blocks.log();
        }
    }

    /// Write the summary as pretty-printed JSON, creating parent directories
    pub fn save_json(&self, path: &Path) -> LoadResult<()> {
        let results = |e: &dyn std::fmt::Display| LoadError::Results(format!("{:?}: {}", path, e));

        let mut document = serde_json::to_value(self).map_err(|e| results(&e))?;
        document["iterations"] = serde_json::json!(self.iterations());
        document["submissionRate"] = serde_json::json!(self.submission_rate());
        let body = serde_json::to_string_pretty(&document).map_err(|e| results(&e))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| results(&e))?;
        }
        std::fs::write(path, body).map_err(|e| results(&e))?;

        info!(run_id = %self.run_id, path = ?path, "Results written");
        Ok(())
    }
}

/// Drives a full load test against one gateway
pub struct LoadTestRunner {
    run_id: Uuid,
    chain_id: u64,
    config: LoadTestConfig,
    pipeline: Arc<Pipeline>,
    wallets: Vec<Arc<LocalWallet>>,
}

impl LoadTestRunner {
    /// Assemble the pipeline from settings.
    ///
    /// Resolves the chain id from the gateway when none is configured and
    /// checks each account's optional address against its credential.
    pub async fn new(settings: &Settings, gateway: Arc<dyn RpcGateway>) -> LoadResult<Self> {
        let chain_id = match settings.defaults.chain_id {
            Some(id) => id,
            None => {
                let id = gateway.chain_id().await?;
                info!("Discovered chain id {}", id);
                id
            }
        };

        let wallets = settings
            .accounts
            .iter()
            .enumerate()
            .map(|(idx, account)| load_wallet(idx, account, chain_id).map(Arc::new))
            .collect::<LoadResult<Vec<_>>>()?;

        let config = settings.loadtest.clone();
        let receipts = config.wait_for_receipt.then(|| ReceiptWait {
            poll_interval: config.receipt_poll_interval(),
            timeout: config.receipt_timeout(),
        });

        let pipeline = Pipeline {
            gateway: gateway.clone(),
            allocator: Arc::new(NonceAllocator::new(gateway.clone(), config.max_requeues)),
            builder: TransactionBuilder::from_defaults(&settings.defaults, chain_id)?,
            gas: GasEstimator::new(config.gas_price_buffer_percent)
                .with_dynamic_fees(settings.defaults.dynamic_txs),
            sender: TransactionSender::new(
                gateway.clone(),
                ErrorClassifier::new(&settings.classification)?,
            ),
            poller: ReceiptPoller::new(gateway),
            request: TxRequest::from_target(&settings.target)?,
            receipts,
        };

        Self::with_pipeline(config, chain_id, pipeline, wallets)
    }

    /// Runner over an already assembled pipeline
    pub fn with_pipeline(
        config: LoadTestConfig,
        chain_id: u64,
        pipeline: Pipeline,
        wallets: Vec<Arc<LocalWallet>>,
    ) -> LoadResult<Self> {
        if wallets.is_empty() {
            return Err(LoadError::Config("no funding accounts".to_string()));
        }
        if config.vus == 0 {
            return Err(LoadError::Config("vus must be greater than 0".to_string()));
        }

        // Catch a bad recipient or value once, before any nonce is leased
        pipeline
            .builder
            .build(&pipeline.request, 0, Some(FeeQuote::legacy(U256::zero())))?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            chain_id,
            config,
            pipeline: Arc::new(pipeline),
            wallets,
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Distinct funding addresses in configuration order
    pub fn accounts(&self) -> Vec<Address> {
        let mut accounts: Vec<Address> = Vec::with_capacity(self.wallets.len());
        for wallet in &self.wallets {
            if !accounts.contains(&wallet.address()) {
                accounts.push(wallet.address());
            }
        }
        accounts
    }

    /// Seed every account's nonce counter from the chain
    pub async fn setup(&self) -> LoadResult<()> {
        for address in self.accounts() {
            let nonce = self.pipeline.allocator.initialize(address).await?;
            info!(run_id = %self.run_id, account = ?address, nonce, "Account ready");
        }
        Ok(())
    }

    /// Run every VU to completion, the duration bound, or `shutdown`.
    ///
    /// In-flight iterations are dropped on cancellation; their leases resolve
    /// from the phase they reached. An allocator invariant violation cancels
    /// all VUs and fails the run after the summary is logged.
    pub async fn run(&self, shutdown: CancellationToken) -> LoadResult<RunSummary> {
        self.setup().await?;

        let stop = shutdown.child_token();
        let stats = Arc::new(RunStats::new(self.config.block_stats));
        let started = Instant::now();

        info!(
            run_id = %self.run_id,
            vus = self.config.vus,
            iterations_per_vu = self.config.iterations_per_vu,
            duration_secs = ?self.config.duration_secs,
            accounts = self.wallets.len(),
            "Starting load test"
        );

        if let Some(secs) = self.config.duration_secs {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        info!("Run duration of {}s elapsed", secs);
                        stop.cancel();
                    }
                    _ = stop.cancelled() => {}
                }
            });
        }

        let interval = Duration::from_millis(self.config.iteration_interval_ms);
        let handles: Vec<_> = (0..self.config.vus)
            .map(|id| {
                let wallet = self.wallets[id % self.wallets.len()].clone();
                let vu = VirtualUser::new(id, wallet, self.pipeline.clone());
                tokio::spawn(drive(
                    vu,
                    self.config.iterations_per_vu,
                    interval,
                    stop.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        let mut fatal = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    error!("VU task failed: {}", e);
                    fatal.get_or_insert(LoadError::Internal(format!("VU task failed: {}", e)));
                }
            }
        }
        stop.cancel();

        let elapsed = started.elapsed();
        let blocks = if self.config.block_stats && fatal.is_none() {
            self.block_report(&stats, &shutdown).await
        } else {
            None
        };
        let reconciliation = self.reconcile().await;
        let summary = RunSummary {
            run_id: self.run_id,
            elapsed,
            outcomes: stats
                .outcomes
                .iter()
                .map(|entry| (entry.key().to_string(), *entry.value()))
                .collect(),
            accepted: stats.accepted.load(Ordering::Relaxed),
            reconciliation,
            blocks,
        };
        summary.log();

        match fatal {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Block statistics over every accepted transaction; skipped on shutdown
    async fn block_report(&self, stats: &RunStats, shutdown: &CancellationToken) -> Option<BlockReport> {
        let mined: Vec<(H256, Option<u64>)> = stats
            .mined
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        let wait = ReceiptWait {
            poll_interval: self.config.receipt_poll_interval(),
            timeout: self.config.receipt_timeout(),
        };

        tokio::select! {
            report = blocks::collect(&self.pipeline, mined, wait) => Some(report),
            _ = shutdown.cancelled() => {
                warn!(run_id = %self.run_id, "Shutdown requested, skipping block statistics");
                None
            }
        }
    }

    /// Best-effort reconciliation of every account
    async fn reconcile(&self) -> Vec<ReconciliationReport> {
        let mut reports = Vec::new();
        for address in self.accounts() {
            match self.pipeline.allocator.reconcile(address).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(account = ?address, "Reconciliation failed: {}", e),
            }
        }
        reports
    }
}

/// One VU's loop. Returns the number of iterations started.
async fn drive(
    mut vu: VirtualUser,
    iterations: u64,
    interval: Duration,
    stop: CancellationToken,
    stats: Arc<RunStats>,
) -> LoadResult<u64> {
    info!(vu = vu.id(), account = ?vu.address(), "VU started");

    while iterations == 0 || vu.iterations() < iterations {
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            result = vu.run_iteration() => result,
        };

        match result {
            Ok(outcome) => stats.record(&outcome),
            Err(e) if e.is_fatal() => {
                error!(vu = vu.id(), "Fatal error, cancelling run: {}", e);
                stop.cancel();
                return Err(e);
            }
            Err(e) => warn!(vu = vu.id(), "Iteration error: {}", e),
        }

        if !interval.is_zero() {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    info!(vu = vu.id(), iterations = vu.iterations(), "VU finished");
    Ok(vu.iterations())
}

fn load_wallet(idx: usize, account: &AccountConfig, chain_id: u64) -> LoadResult<LocalWallet> {
    let key = account.credential.trim();
    let key = key
        .strip_prefix("0x")
        .or_else(|| key.strip_prefix("0X"))
        .unwrap_or(key);

    let wallet = key
        .parse::<LocalWallet>()
        .map_err(|e| LoadError::Wallet(format!("account {}: invalid credential: {}", idx, e)))?
        .with_chain_id(chain_id);

    if let Some(expected) = &account.address {
        let expected = parse_address(expected)?;
        if expected != wallet.address() {
            return Err(LoadError::Config(format!(
                "account {}: credential derives {:?}, configured address is {:?}",
                idx,
                wallet.address(),
                expected
            )));
        }
    }

    Ok(wallet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockHeader, BlockRef, MockRpcGateway, Receipt, ReceiptStatus};
    use crate::tx::GasPriceSource;
    use async_trait::async_trait;
    use ethers::types::transaction::eip2718::TypedTransaction;
    use ethers::types::{Bytes, H256};
    use ethers::utils::keccak256;
    use ethers::utils::rlp::Rlp;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;

    const KEY_0: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const KEY_1: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
    const ADDRESS_0: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const ADDRESS_1: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    /// Transactions per block on the fake chain
    const TXS_PER_BLOCK: u64 = 5;

    /// In-memory chain that accepts each (sender, nonce) pair once and mines
    /// them into numbered blocks by nonce
    struct FakeChain {
        start: u64,
        send_delay: Duration,
        accepted: Mutex<HashMap<Address, BTreeSet<u64>>>,
        mined: Mutex<HashMap<H256, u64>>,
    }

    impl FakeChain {
        fn new(start: u64, send_delay: Duration) -> Self {
            Self {
                start,
                send_delay,
                accepted: Mutex::new(HashMap::new()),
                mined: Mutex::new(HashMap::new()),
            }
        }

        fn accepted(&self, address: Address) -> BTreeSet<u64> {
            self.accepted
                .lock()
                .unwrap()
                .get(&address)
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl RpcGateway for FakeChain {
        async fn get_balance(&self, _address: Address, _block: BlockRef) -> LoadResult<U256> {
            Ok(U256::exp10(21))
        }

        async fn get_nonce(&self, address: Address) -> LoadResult<u64> {
            let accepted = self.accepted(address);
            let mut next = self.start;
            while accepted.contains(&next) {
                next += 1;
            }
            Ok(next)
        }

        async fn gas_price(&self) -> LoadResult<U256> {
            Ok(U256::from(1_000_000_000u64))
        }

        async fn block_number(&self) -> LoadResult<u64> {
            Ok(1)
        }

        async fn chain_id(&self) -> LoadResult<u64> {
            Ok(1337)
        }

        async fn send_raw_transaction(&self, raw: Bytes) -> LoadResult<H256> {
            let malformed = |message: String| LoadError::MalformedResponse {
                method: "eth_sendRawTransaction".to_string(),
                message,
            };
            let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(&raw))
                .map_err(|e| malformed(e.to_string()))?;
            let from = signature
                .recover(tx.sighash())
                .map_err(|e| malformed(e.to_string()))?;
            let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();

            tokio::time::sleep(self.send_delay).await;

            let mut accepted = self.accepted.lock().unwrap();
            if !accepted.entry(from).or_default().insert(nonce) {
                return Err(LoadError::Rpc {
                    method: "eth_sendRawTransaction".to_string(),
                    code: -32000,
                    message: "nonce too low".to_string(),
                });
            }
            let tx_hash = H256::from(keccak256(&raw));
            self.mined
                .lock()
                .unwrap()
                .insert(tx_hash, 100 + nonce / TXS_PER_BLOCK);
            Ok(tx_hash)
        }

        async fn max_priority_fee(&self) -> LoadResult<U256> {
            Ok(U256::from(1_000_000_000u64))
        }

        async fn base_fee(&self) -> LoadResult<U256> {
            Ok(U256::from(1_000_000_000u64))
        }

        async fn get_receipt(&self, tx_hash: H256) -> LoadResult<Option<Receipt>> {
            let block_number = self.mined.lock().unwrap().get(&tx_hash).copied();
            Ok(block_number.map(|block_number| Receipt {
                tx_hash,
                block_hash: H256::from_low_u64_be(block_number),
                block_number,
                status: ReceiptStatus::Included,
                gas_used: U256::from(21_000),
            }))
        }

        async fn get_block(&self, number: u64) -> LoadResult<Option<BlockHeader>> {
            let tx_count = self
                .mined
                .lock()
                .unwrap()
                .values()
                .filter(|block| **block == number)
                .count();
            Ok(Some(BlockHeader {
                number,
                timestamp: number * 2,
                gas_used: 21_000 * tx_count as u64,
                gas_limit: 30_000_000,
                tx_count,
            }))
        }
    }

    fn wallet(key: &str) -> Arc<LocalWallet> {
        Arc::new(key.parse::<LocalWallet>().unwrap().with_chain_id(1337u64))
    }

    fn config(vus: usize, iterations_per_vu: u64) -> LoadTestConfig {
        LoadTestConfig {
            vus,
            iterations_per_vu,
            ..LoadTestConfig::default()
        }
    }

    fn runner(
        gateway: Arc<dyn RpcGateway>,
        config: LoadTestConfig,
        wallets: Vec<Arc<LocalWallet>>,
    ) -> LoadTestRunner {
        let pipeline = Pipeline {
            gateway: gateway.clone(),
            allocator: Arc::new(NonceAllocator::new(gateway.clone(), config.max_requeues)),
            builder: TransactionBuilder::new(Some(21_000), Some(1337), None),
            gas: GasEstimator::default(),
            sender: TransactionSender::new(gateway.clone(), ErrorClassifier::default()),
            poller: ReceiptPoller::new(gateway),
            request: TxRequest {
                to: "0xDEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF".to_string(),
                value: "0.0001ether".to_string(),
                gas_price: GasPriceSource::Network,
            },
            receipts: None,
        };
        LoadTestRunner::with_pipeline(config, 1337, pipeline, wallets).unwrap()
    }

    fn settings_toml(address: &str, chain_id: Option<u64>) -> String {
        let defaults = chain_id
            .map(|id| format!("[defaults]\nchain_id = {}\n", id))
            .unwrap_or_default();
        format!(
            r#"
            [rpc]
            url = "http://localhost:8545"

            [[accounts]]
            credential = "0x{KEY_0}"
            address = "{address}"

            [target]
            to = "0xDEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF"
            value = "0.0001ether"

            {defaults}
            "#
        )
    }

    #[tokio::test]
    async fn test_run_completes_all_iterations() {
        let chain = Arc::new(FakeChain::new(10, Duration::ZERO));
        let runner = runner(chain.clone(), config(4, 5), vec![wallet(KEY_0)]);

        let summary = runner.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.iterations(), 20);
        assert_eq!(summary.accepted, 20);
        assert_eq!(summary.count("submitted"), 20);
        assert!(summary.is_clean());

        let address: Address = ADDRESS_0.parse().unwrap();
        let sent: Vec<u64> = chain.accepted(address).into_iter().collect();
        assert_eq!(sent, (10..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_vus_are_spread_across_accounts() {
        let chain = Arc::new(FakeChain::new(0, Duration::ZERO));
        let runner = runner(
            chain.clone(),
            config(3, 2),
            vec![wallet(KEY_0), wallet(KEY_1)],
        );

        let summary = runner.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.accepted, 6);
        assert_eq!(summary.reconciliation.len(), 2);
        assert_eq!(chain.accepted(ADDRESS_0.parse().unwrap()).len(), 4);
        assert_eq!(chain.accepted(ADDRESS_1.parse().unwrap()).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_resolves_in_flight_leases() {
        let chain = Arc::new(FakeChain::new(0, Duration::from_millis(100)));
        let runner = Arc::new(runner(chain.clone(), config(8, 0), vec![wallet(KEY_0)]));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn({
            let runner = runner.clone();
            let shutdown = shutdown.clone();
            async move { runner.run(shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        shutdown.cancel();
        let summary = handle.await.unwrap().unwrap();

        assert!(summary.accepted > 0);
        assert_eq!(summary.count("rejected_retryable"), 0);
        assert_eq!(summary.count("rejected_terminal"), 0);

        let report = &summary.reconciliation[0];
        assert!(report.local.outstanding.is_empty());

        let sent = chain.accepted(ADDRESS_0.parse().unwrap());
        assert_eq!(sent.len() as u64, summary.accepted);
        for burned in &report.local.burned {
            assert!(!sent.contains(burned));
        }
        assert!(sent.iter().all(|n| *n < report.local.next));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_bounds_unbounded_run() {
        let chain = Arc::new(FakeChain::new(0, Duration::ZERO));
        let mut config = config(2, 0);
        config.duration_secs = Some(1);
        config.iteration_interval_ms = 100;
        let runner = runner(chain, config, vec![wallet(KEY_0)]);

        let summary = runner.run(CancellationToken::new()).await.unwrap();

        assert!(summary.iterations() >= 2);
        assert!(summary.iterations() <= 22);
        assert!(summary.is_clean());
    }

    #[tokio::test]
    async fn test_setup_failure_aborts_run() {
        let mut gateway = MockRpcGateway::new();
        gateway.expect_get_nonce().returning(|_| {
            Err(LoadError::Network {
                method: "eth_getTransactionCount".to_string(),
                message: "connection refused".to_string(),
            })
        });
        gateway.expect_send_raw_transaction().never();

        let runner = runner(Arc::new(gateway), config(2, 1), vec![wallet(KEY_0)]);
        let err = runner.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_fatal_iteration_cancels_run() {
        let chain: Arc<dyn RpcGateway> = Arc::new(FakeChain::new(0, Duration::ZERO));
        let runner = runner(chain, config(1, 1), vec![wallet(KEY_0)]);
        let stop = CancellationToken::new();

        // Account never initialized
        let vu = VirtualUser::new(0, wallet(KEY_0), runner.pipeline.clone());
        let err = drive(vu, 1, Duration::ZERO, stop.clone(), Arc::new(RunStats::default()))
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_new_discovers_chain_id() {
        let settings = Settings::from_toml(&settings_toml(ADDRESS_0, None)).unwrap();
        let mut gateway = MockRpcGateway::new();
        gateway.expect_chain_id().times(1).returning(|| Ok(31337));

        let runner = LoadTestRunner::new(&settings, Arc::new(gateway)).await.unwrap();
        assert_eq!(runner.chain_id(), 31337);
        assert_eq!(runner.accounts(), vec![ADDRESS_0.parse::<Address>().unwrap()]);
    }

    #[tokio::test]
    async fn test_new_rejects_mismatched_address() {
        let settings = Settings::from_toml(&settings_toml(ADDRESS_1, Some(1337))).unwrap();
        let mut gateway = MockRpcGateway::new();
        gateway.expect_chain_id().never();

        let err = LoadTestRunner::new(&settings, Arc::new(gateway))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_invalid_recipient_rejected_before_run() {
        let gateway: Arc<dyn RpcGateway> = Arc::new(FakeChain::new(0, Duration::ZERO));
        let pipeline = Pipeline {
            gateway: gateway.clone(),
            allocator: Arc::new(NonceAllocator::new(gateway.clone(), 3)),
            builder: TransactionBuilder::new(Some(21_000), Some(1337), None),
            gas: GasEstimator::default(),
            sender: TransactionSender::new(gateway.clone(), ErrorClassifier::default()),
            poller: ReceiptPoller::new(gateway),
            request: TxRequest {
                to: "0xDEAD".to_string(),
                value: "1".to_string(),
                gas_price: GasPriceSource::Network,
            },
            receipts: None,
        };

        let err = LoadTestRunner::with_pipeline(config(1, 1), 1337, pipeline, vec![wallet(KEY_0)])
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn test_block_stats_cover_accepted_transactions() {
        let chain = Arc::new(FakeChain::new(0, Duration::ZERO));
        let mut config = config(2, 5);
        config.block_stats = true;
        config.receipt_poll_interval_ms = 10;
        let runner = runner(chain, config, vec![wallet(KEY_0)]);

        let summary = runner.run(CancellationToken::new()).await.unwrap();
        let blocks = summary.blocks.expect("block statistics collected");

        assert_eq!(blocks.total_txs, 10);
        assert_eq!(blocks.unresolved_txs, 0);
        assert_eq!(
            blocks.blocks.iter().map(|b| b.number).collect::<Vec<_>>(),
            vec![100, 101]
        );
        assert!(blocks.blocks.iter().all(|b| b.num_txs == 5 && b.block_time == 2));
        assert!((blocks.max_txs_per_second - 2.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_block_stats_are_off_by_default() {
        let chain = Arc::new(FakeChain::new(0, Duration::ZERO));
        let runner = runner(chain, config(1, 2), vec![wallet(KEY_0)]);

        let summary = runner.run(CancellationToken::new()).await.unwrap();
        assert!(summary.blocks.is_none());
    }

    #[test]
    fn test_summary_saved_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("results.json");
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            elapsed: Duration::from_millis(2_500),
            outcomes: BTreeMap::from([("submitted".to_string(), 5)]),
            accepted: 5,
            reconciliation: vec![ReconciliationReport {
                address: ADDRESS_0.parse().unwrap(),
                on_chain_nonce: 5,
                local: crate::tx::NonceSnapshot {
                    next: 5,
                    queued: Vec::new(),
                    outstanding: Vec::new(),
                    burned: Vec::new(),
                },
            }],
            blocks: None,
        };

        summary.save_json(&path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["runId"], summary.run_id.to_string());
        assert_eq!(saved["elapsedSecs"], 2.5);
        assert_eq!(saved["outcomes"]["submitted"], 5);
        assert_eq!(saved["iterations"], 5);
        assert_eq!(saved["submissionRate"], 2.0);
        assert_eq!(saved["reconciliation"][0]["onChainNonce"], 5);
        assert!(saved["blocks"].is_null());
    }

    #[test]
    fn test_summary_rate() {
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            elapsed: Duration::from_secs(4),
            outcomes: BTreeMap::from([
                ("submitted".to_string(), 8),
                ("rejected_terminal".to_string(), 2),
            ]),
            accepted: 8,
            reconciliation: Vec::new(),
            blocks: None,
        };

        assert_eq!(summary.iterations(), 10);
        assert_eq!(summary.count("invalid"), 0);
        assert!((summary.submission_rate() - 2.0).abs() < f64::EPSILON);
    }
}
