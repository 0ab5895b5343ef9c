//! `payflow-core`: ledger domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod account;
pub mod amount;
pub mod error;
pub mod id;
pub mod ledger;
pub mod receipt;
pub mod transfer;
pub mod version;

pub use account::Account;
pub use amount::Amount;
pub use error::{ErrorKind, ErrorPayload, LedgerError, LedgerResult};
pub use id::{AccountId, TransactionId};
pub use ledger::{EntryType, LedgerEntry, TransferLegs};
pub use receipt::{MutationOutcome, PaymentReceipt, TopUpReceipt, TransferReceipt};
pub use transfer::{TransferIntent, ValidatedIntent};
pub use version::ExpectedVersion;
