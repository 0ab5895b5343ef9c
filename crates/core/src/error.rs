//! Ledger error model.
//!
//! Every failure carries an [`ErrorKind`] that callers branch on, plus optional
//! context (account handle, account id, transfer id) used for structured logs
//! and for the HTTP collaborator's error payload.

use core::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::id::{AccountId, TransactionId};

/// Result type used across the ledger core.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Classification of a ledger failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The referenced account does not exist (or the id is malformed).
    AccountNotFound,
    /// Balance is lower than the requested debit.
    InsufficientFunds,
    /// The compare-and-swap on `version` lost a race.
    OptimisticLockConflict,
    /// The transfer intent could not be handed to the bus.
    PublishFailed,
    /// A bus payload could not be decoded.
    MalformedMessage,
    /// A ledger write carried an already-recorded transaction id.
    DuplicateSettlement,
    /// Connection loss, deadlock, serialization failure.
    TransientStoreError,
    /// Bus temporarily unavailable.
    TransientBusError,
    /// Input rejected before touching state.
    Validation,
    /// Registration with an already-taken handle.
    AccountExists,
    /// Non-retryable storage failure (constraint violation, corrupt row).
    StoreFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AccountNotFound => "ACCOUNT_NOT_FOUND",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::OptimisticLockConflict => "OPTIMISTIC_LOCK_CONFLICT",
            ErrorKind::PublishFailed => "PUBLISH_FAILED",
            ErrorKind::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorKind::DuplicateSettlement => "DUPLICATE_SETTLEMENT",
            ErrorKind::TransientStoreError => "TRANSIENT_STORE_ERROR",
            ErrorKind::TransientBusError => "TRANSIENT_BUS_ERROR",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::AccountExists => "ACCOUNT_EXISTS",
            ErrorKind::StoreFailure => "STORE_FAILURE",
        }
    }

    /// Whether the whole operation may be re-run with a chance of success.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::OptimisticLockConflict
                | ErrorKind::TransientStoreError
                | ErrorKind::TransientBusError
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_retryable()
    }

    /// HTTP status the synchronous endpoints map this kind to.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AccountNotFound => 404,
            ErrorKind::InsufficientFunds => 422,
            ErrorKind::OptimisticLockConflict | ErrorKind::AccountExists => 409,
            ErrorKind::DuplicateSettlement => 409,
            ErrorKind::Validation | ErrorKind::MalformedMessage => 400,
            ErrorKind::PublishFailed
            | ErrorKind::TransientStoreError
            | ErrorKind::TransientBusError => 503,
            ErrorKind::StoreFailure => 500,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged ledger error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct LedgerError {
    kind: ErrorKind,
    message: String,
    handle: Option<String>,
    account_id: Option<AccountId>,
    transfer_id: Option<TransactionId>,
}

impl LedgerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            handle: None,
            account_id: None,
            transfer_id: None,
        }
    }

    pub fn account_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccountNotFound, message)
    }

    pub fn insufficient_funds(balance: i64, requested: i64) -> Self {
        Self::new(
            ErrorKind::InsufficientFunds,
            format!("balance {balance} is lower than {requested}"),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OptimisticLockConflict, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedMessage, message)
    }

    pub fn transient_store(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientStoreError, message)
    }

    pub fn store_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreFailure, message)
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_transfer(mut self, transfer_id: TransactionId) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }

    pub fn account_id(&self) -> Option<AccountId> {
        self.account_id
    }

    pub fn transfer_id(&self) -> Option<TransactionId> {
        self.transfer_id
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Structured body for the HTTP collaborator.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind,
            message: self.message.clone(),
            transfer_id: self.transfer_id,
        }
    }
}

/// Serialisable error body returned to synchronous callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransactionId>,
}
