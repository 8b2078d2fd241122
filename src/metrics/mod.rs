//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Iteration outcomes
//! - Nonce lease lifecycle
//! - Submission and inclusion latency
//! - RPC retries

use crate::error::{LoadError, LoadResult};
use crate::tx::LeaseOutcome;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;
use tracing::info;

lazy_static! {
    pub static ref ITERATIONS: CounterVec = register_counter_vec!(
        "loadtest_iterations_total",
        "Completed iterations by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref NONCES_LEASED: Counter = register_counter!(
        "loadtest_nonces_leased_total",
        "Total nonce leases handed out"
    ).unwrap();

    pub static ref NONCES_RELEASED: CounterVec = register_counter_vec!(
        "loadtest_nonces_released_total",
        "Nonce leases resolved by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref NONCES_BURNED: Counter = register_counter!(
        "loadtest_nonces_burned_total",
        "Nonce values permanently skipped"
    ).unwrap();

    pub static ref SUBMISSION_LATENCY: Histogram = register_histogram!(
        "loadtest_submission_latency_seconds",
        "eth_sendRawTransaction latency including retries",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    pub static ref RECEIPT_LATENCY: Histogram = register_histogram!(
        "loadtest_receipt_latency_seconds",
        "Time from submission to observed receipt",
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref RPC_RETRIES: CounterVec = register_counter_vec!(
        "loadtest_rpc_retries_total",
        "Transient RPC failures retried by method",
        &["method"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> LoadResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| LoadError::Internal(format!("Failed to bind metrics port: {}", e)))?;

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| LoadError::Internal(format!("Metrics server failed: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_iteration(outcome: &str) {
    ITERATIONS.with_label_values(&[outcome]).inc();
}

pub fn record_nonce_leased() {
    NONCES_LEASED.inc();
}

pub fn record_nonce_release(outcome: LeaseOutcome) {
    NONCES_RELEASED.with_label_values(&[outcome.as_str()]).inc();
}

pub fn record_nonce_burned() {
    NONCES_BURNED.inc();
}

pub fn record_submission_latency(latency_secs: f64) {
    SUBMISSION_LATENCY.observe(latency_secs);
}

pub fn record_receipt_latency(latency_secs: f64) {
    RECEIPT_LATENCY.observe(latency_secs);
}

pub fn record_rpc_retry(method: &str) {
    RPC_RETRIES.with_label_values(&[method]).inc();
}
