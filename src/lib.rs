//! Concurrent transaction load generator for Ethereum-compatible JSON-RPC
//! endpoints.
//!
//! Virtual users share funding accounts; nonces are handed out by a
//! per-account allocator so that concurrent submissions never collide.

pub mod chain;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scenario;
pub mod tx;
