//! Asynchronous transfer settlement.

pub mod settler;
pub mod state;
pub mod worker;

pub use settler::{SettlementOutcome, Settler};
pub use state::{SettlementProgress, SettlementState};
pub use worker::{SettlementWorker, SettlementWorkerHandle, WorkerStats};
