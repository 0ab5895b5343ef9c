//! Infrastructure layer: account store, mutation engine, transfer initiation
//! and settlement, buses, configuration.

pub mod accounts;
pub mod config;
pub mod context;
pub mod dead_letter;
pub mod engine;
pub mod event_bus;
pub mod initiator;
pub mod retry;
pub mod settlement;
pub mod store;

pub use accounts::{AccountDirectory, Statement};
pub use config::{BusBackend, PayflowConfig};
pub use context::LedgerContext;
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink};
pub use engine::BalanceMutationEngine;
pub use initiator::TransferInitiator;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use settlement::{
    SettlementOutcome, SettlementState, SettlementWorker, SettlementWorkerHandle, Settler,
    WorkerStats,
};
pub use store::{InMemoryLedgerStore, LedgerStore, LedgerTx, PostgresLedgerStore, StoreError};

#[cfg(test)]
mod integration_tests;
