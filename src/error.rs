//! Error types for the load generator

use ethers::types::Address;
use thiserror::Error;

/// Main error type for the load generator
#[derive(Error, Debug, Clone)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error calling {method}: {message}")]
    Network { method: String, message: String },

    #[error("RPC error {code} from {method}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    #[error("Malformed response from {method}: {message}")]
    MalformedResponse { method: String, message: String },

    #[error("Invalid address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    #[error("Invalid amount {input:?}: {reason}")]
    InvalidAmount { input: String, reason: String },

    #[error("Gas price error: {0}")]
    GasEstimation(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Nonce allocator invariant violated for {address:?}: {message}")]
    AllocatorState { address: Address, message: String },

    #[error("Failed to write results: {0}")]
    Results(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LoadError {
    /// Check if error is retryable by the gateway
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Network { .. })
    }

    /// Invariant violations mean nonce uniqueness may already be broken
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::AllocatorState { .. })
    }

    /// Stable label used in log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Config(_) => "config",
            LoadError::Network { .. } => "network",
            LoadError::Rpc { .. } => "rpc",
            LoadError::MalformedResponse { .. } => "malformed_response",
            LoadError::InvalidAddress { .. } => "invalid_address",
            LoadError::InvalidAmount { .. } => "invalid_amount",
            LoadError::GasEstimation(_) => "gas_estimation",
            LoadError::Wallet(_) => "wallet",
            LoadError::Timeout { .. } => "timeout",
            LoadError::AllocatorState { .. } => "allocator_state",
            LoadError::Results(_) => "results",
            LoadError::Internal(_) => "internal",
        }
    }
}

/// Result type for load generator operations
pub type LoadResult<T> = Result<T, LoadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_errors_are_retryable() {
        let network = LoadError::Network {
            method: "eth_gasPrice".to_string(),
            message: "connection reset".to_string(),
        };
        let rpc = LoadError::Rpc {
            method: "eth_sendRawTransaction".to_string(),
            code: -32000,
            message: "nonce too low".to_string(),
        };
        let timeout = LoadError::Timeout {
            operation: "receipt".to_string(),
        };

        assert!(network.is_retryable());
        assert!(!rpc.is_retryable());
        assert!(!timeout.is_retryable());
    }

    #[test]
    fn test_allocator_state_is_fatal() {
        let err = LoadError::AllocatorState {
            address: Address::zero(),
            message: "released twice".to_string(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "allocator_state");
        assert!(!LoadError::Internal("x".to_string()).is_fatal());
    }
}
