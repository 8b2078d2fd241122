//! Transaction pipeline: nonce leasing, building, submission and receipts

mod builder;
mod classify;
mod gas;
mod nonce;
mod receipt;
mod sender;

pub use builder::{
    parse_address, parse_amount, FeeQuote, GasPriceSource, TransactionBuilder, TxRequest,
    UnsignedTransaction,
};
pub use classify::{Classification, ErrorClassifier};
pub use gas::GasEstimator;
pub use nonce::{
    LeaseOutcome, LeasePhase, NonceAllocator, NonceDisposition, NonceLease, NonceSnapshot,
    ReconciliationReport,
};
pub use receipt::ReceiptPoller;
pub use sender::{SubmissionResult, TransactionSender};
