//! Account store and ledger recorder boundary.
//!
//! Balance rows and ledger rows live in one store so a balance swap and its
//! ledger entries commit atomically in a single transaction.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryLedgerStore, InMemoryLedgerTx};
pub use postgres::{PgLedgerTx, PostgresLedgerStore};
pub use r#trait::{CasOutcome, InsertOutcome, LedgerStore, LedgerTx, StoreError};
