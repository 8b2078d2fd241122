//! Virtual users and the runner that drives them

mod blocks;
mod driver;
mod runner;

pub use blocks::{BlockReport, BlockStats};
pub use driver::{IterationOutcome, Pipeline, ReceiptWait, VirtualUser};
pub use runner::{LoadTestRunner, RunSummary};
