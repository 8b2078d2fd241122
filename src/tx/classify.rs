//! Maps submission failures onto lease outcomes
//!
//! Node implementations word their rejections differently, so the mapping
//! is a set of configurable, case-insensitive patterns.

use super::nonce::LeaseOutcome;
use crate::config::ClassificationConfig;
use crate::error::{LoadError, LoadResult};

use regex::{RegexSet, RegexSetBuilder};

/// Verdict for one failed `eth_sendRawTransaction`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The node already holds these exact bytes
    Accepted,
    Rejected(LeaseOutcome),
}

pub struct ErrorClassifier {
    accepted: RegexSet,
    retryable: RegexSet,
    terminal: RegexSet,
    unmatched: LeaseOutcome,
}

impl ErrorClassifier {
    pub fn new(config: &ClassificationConfig) -> LoadResult<Self> {
        Ok(Self {
            accepted: build_set("accepted", &config.accepted)?,
            retryable: build_set("retryable", &config.retryable)?,
            terminal: build_set("terminal", &config.terminal)?,
            unmatched: config.unmatched,
        })
    }

    /// Classify a node error message. Terminal patterns win over retryable
    /// ones when both match.
    pub fn classify_message(&self, message: &str) -> Classification {
        if self.accepted.is_match(message) {
            Classification::Accepted
        } else if self.terminal.is_match(message) {
            Classification::Rejected(LeaseOutcome::RejectedTerminal)
        } else if self.retryable.is_match(message) {
            Classification::Rejected(LeaseOutcome::RejectedRetryable)
        } else {
            Classification::Rejected(self.unmatched)
        }
    }

    /// Classify any error returned while submitting
    pub fn classify(&self, error: &LoadError) -> Classification {
        match error {
            LoadError::Rpc { message, .. } => self.classify_message(message),
            // Nothing was handed to the node
            LoadError::Wallet(_) => Classification::Rejected(LeaseOutcome::RejectedRetryable),
            // The node may or may not hold the transaction
            _ => Classification::Rejected(LeaseOutcome::RejectedTerminal),
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ClassificationConfig::default()).expect("default patterns compile")
    }
}

fn build_set(name: &str, patterns: &[String]) -> LoadResult<RegexSet> {
    RegexSetBuilder::new(patterns)
        .case_insensitive(true)
        .build()
        .map_err(|e| LoadError::Config(format!("Invalid {} classification pattern: {}", name, e)))
}
