//! Configuration management for the load generator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tx::LeaseOutcome;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub rpc: RpcConfig,
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub defaults: TxDefaults,
    pub target: TargetConfig,
    #[serde(default)]
    pub loadtest: LoadTestConfig,
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub url: String,
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl RpcConfig {
    /// Primary endpoint first, then fallbacks in order
    pub fn urls(&self) -> Vec<String> {
        std::iter::once(self.url.clone())
            .chain(self.fallback_urls.iter().cloned())
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Exponential backoff applied to transient network failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            max_attempts: 5,
        }
    }
}

/// Funding account credentials. `address` is optional and, when present,
/// must match the address derived from the credential.
#[derive(Clone, Deserialize)]
pub struct AccountConfig {
    pub credential: String,
    pub address: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("credential", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

/// Transaction defaults applied by the builder
#[derive(Debug, Clone, Deserialize)]
pub struct TxDefaults {
    pub gas_price: Option<String>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    pub chain_id: Option<u64>,
    /// Send EIP-1559 transactions priced from the fee market
    #[serde(default)]
    pub dynamic_txs: bool,
}

impl Default for TxDefaults {
    fn default() -> Self {
        Self {
            gas_price: None,
            gas_limit: default_gas_limit(),
            chain_id: None,
            dynamic_txs: false,
        }
    }
}

/// What every iteration sends
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub to: String,
    pub value: String,
    /// Fixed gas price; the network price is used when absent
    pub gas_price: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    pub vus: usize,
    /// Iterations per VU, 0 runs until duration or shutdown
    pub iterations_per_vu: u64,
    pub duration_secs: Option<u64>,
    pub iteration_interval_ms: u64,
    pub wait_for_receipt: bool,
    pub receipt_poll_interval_ms: u64,
    pub receipt_timeout_secs: u64,
    pub max_requeues: u32,
    pub gas_price_buffer_percent: u64,
    /// Collect receipts and block statistics for accepted transactions
    pub block_stats: bool,
    /// Write the run summary as JSON here when set
    pub results_file: Option<PathBuf>,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            vus: 1,
            iterations_per_vu: 1,
            duration_secs: None,
            iteration_interval_ms: 0,
            wait_for_receipt: false,
            receipt_poll_interval_ms: 1_000,
            receipt_timeout_secs: 30,
            max_requeues: 3,
            gas_price_buffer_percent: 0,
            block_stats: false,
            results_file: None,
        }
    }
}

impl LoadTestConfig {
    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.receipt_timeout_secs)
    }
}

/// Case-insensitive regex lists mapping node error messages to lease outcomes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub accepted: Vec<String>,
    pub retryable: Vec<String>,
    pub terminal: Vec<String>,
    pub unmatched: LeaseOutcome,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            accepted: vec![
                "already known".to_string(),
                "known transaction".to_string(),
                "already imported".to_string(),
            ],
            retryable: vec![
                "nonce too low".to_string(),
                "nonce too high".to_string(),
                "underpriced".to_string(),
                "max fee per gas less than block base fee".to_string(),
                "fee cap less than block base fee".to_string(),
                "txpool is full".to_string(),
                "try again later".to_string(),
            ],
            terminal: vec![
                "insufficient funds".to_string(),
                "intrinsic gas too low".to_string(),
                "exceeds block gas limit".to_string(),
                "invalid sender".to_string(),
            ],
            unmatched: LeaseOutcome::RejectedTerminal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_gas_limit() -> u64 {
    21_000
}

impl Settings {
    /// Load settings from the file named by `LOADTEST_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("LOADTEST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse settings from TOML text, substituting environment variables first
    pub fn from_toml(input: &str) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.rpc.url.trim().is_empty() {
            anyhow::bail!("rpc.url must be set");
        }

        if self.accounts.is_empty() {
            anyhow::bail!("At least one funding account must be configured");
        }

        for (idx, account) in self.accounts.iter().enumerate() {
            if account.credential.trim().is_empty() {
                anyhow::bail!("Account {} has an empty credential", idx);
            }
        }

        if self.loadtest.vus == 0 {
            anyhow::bail!("loadtest.vus must be greater than 0");
        }

        if self.loadtest.iterations_per_vu == 0 && self.loadtest.duration_secs.is_none() {
            tracing::warn!("Unbounded run: iterations_per_vu = 0 and no duration_secs");
        }

        if (self.loadtest.wait_for_receipt || self.loadtest.block_stats)
            && self.loadtest.receipt_poll_interval_ms >= self.loadtest.receipt_timeout_secs * 1_000
        {
            anyhow::bail!("receipt_poll_interval_ms must be shorter than receipt_timeout_secs");
        }

        if self.rpc.retry.max_attempts == 0 {
            anyhow::bail!("rpc.retry.max_attempts must be at least 1");
        }

        if self.rpc.retry.multiplier < 1.0 {
            anyhow::bail!("rpc.retry.multiplier must be >= 1.0");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [rpc]
        url = "http://127.0.0.1:8545"

        [[accounts]]
        credential = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"

        [target]
        to = "0xDEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF"
        value = "0.0001ether"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("LOADTEST_TEST_VAR", "test_value");
        let input = "url = \"https://rpc.example.com/${LOADTEST_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://rpc.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let settings = Settings::from_toml(MINIMAL).unwrap();

        assert_eq!(settings.defaults.gas_limit, 21_000);
        assert_eq!(settings.loadtest.vus, 1);
        assert_eq!(settings.loadtest.receipt_timeout_secs, 30);
        assert_eq!(settings.rpc.retry.max_attempts, 5);
        assert_eq!(settings.classification.unmatched, LeaseOutcome::RejectedTerminal);
        assert!(!settings.metrics.enabled);
        assert_eq!(settings.rpc.urls(), vec!["http://127.0.0.1:8545".to_string()]);
    }

    #[test]
    fn test_rejects_missing_accounts() {
        let input = r#"
            accounts = []

            [rpc]
            url = "http://127.0.0.1:8545"

            [target]
            to = "0xDEADBEEFDEADBEEFDEADBEEFDEADBEEFDEADBEEF"
            value = "1"
        "#;

        let err = Settings::from_toml(input).unwrap_err();
        assert!(err.to_string().contains("funding account"));
    }

    #[test]
    fn test_rejects_zero_vus() {
        let input = format!("{}\n[loadtest]\nvus = 0\n", MINIMAL);
        assert!(Settings::from_toml(&input).is_err());
    }

    #[test]
    fn test_unmatched_outcome_is_configurable() {
        let input = format!(
            "{}\n[classification]\nunmatched = \"rejected-retryable\"\n",
            MINIMAL
        );
        let settings = Settings::from_toml(&input).unwrap();
        assert_eq!(
            settings.classification.unmatched,
            LeaseOutcome::RejectedRetryable
        );
        // Lists not named keep their defaults
        assert!(!settings.classification.retryable.is_empty());
    }

    #[test]
    fn test_fee_market_options() {
        let input = format!(
            "{}{}",
            MINIMAL,
            r#"
            [defaults]
            dynamic_txs = true

            [loadtest]
            block_stats = true
            results_file = "out/results.json"
            "#
        );
        let settings = Settings::from_toml(&input).unwrap();

        assert!(settings.defaults.dynamic_txs);
        assert_eq!(settings.defaults.gas_limit, 21_000);
        assert!(settings.loadtest.block_stats);
        assert_eq!(
            settings.loadtest.results_file,
            Some(PathBuf::from("out/results.json"))
        );

        let defaults = Settings::from_toml(MINIMAL).unwrap();
        assert!(!defaults.defaults.dynamic_txs);
        assert!(defaults.loadtest.results_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.accounts.len(), 1);
        assert_eq!(settings.target.value, "0.0001ether");
    }

    #[test]
    fn test_shipped_config_parses() {
        let input = include_str!("../config/default.toml")
            .replace("${RPC_URL}", "http://127.0.0.1:8545")
            .replace("${LOADTEST_PRIVATE_KEY}", "0xabc");

        let settings = Settings::from_toml(&input).unwrap();
        assert_eq!(settings.loadtest.vus, 10);
        assert_eq!(settings.target.value, "0.0001ether");
        assert!(settings.defaults.chain_id.is_none());
        assert!(!settings.defaults.dynamic_txs);
        assert!(!settings.loadtest.block_stats);
    }

    #[test]
    fn test_credential_is_redacted_in_debug() {
        let settings = Settings::from_toml(MINIMAL).unwrap();
        let rendered = format!("{:?}", settings.accounts[0]);
        assert!(!rendered.contains("ac0974"));
    }
}
