//! Account registration and read-side lookups.

use serde::Serialize;
use tracing::{info, instrument};

use payflow_core::transfer::wire_now;
use payflow_core::{Account, AccountId, ErrorKind, LedgerEntry, LedgerError, LedgerResult};

use crate::store::{InsertOutcome, LedgerStore};

/// An account with its ledger history, oldest entry first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    pub account: Account,
    pub entries: Vec<LedgerEntry>,
}

impl Statement {
    /// Net effect of all entries; equals the balance for an account opened at zero.
    pub fn net_movement(&self) -> i64 {
        self.entries.iter().map(LedgerEntry::signed_amount).sum()
    }
}

#[derive(Debug, Clone)]
pub struct AccountDirectory<S> {
    store: S,
}

impl<S: LedgerStore> AccountDirectory<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Register a new account at version 1 with a zero balance.
    #[instrument(skip(self), err)]
    pub async fn open(&self, handle: &str) -> LedgerResult<Account> {
        let account = Account::open(handle, wire_now())?;
        match self.store.insert_account(&account).await? {
            InsertOutcome::Inserted => {
                info!(account_id = %account.id, "account opened");
                Ok(account)
            }
            InsertOutcome::Duplicate => Err(LedgerError::new(
                ErrorKind::AccountExists,
                format!("handle {handle} is already registered"),
            )
            .with_handle(handle)),
        }
    }

    pub async fn by_handle(&self, handle: &str) -> LedgerResult<Account> {
        self.store.account_by_handle(handle).await?.ok_or_else(|| {
            LedgerError::account_not_found(format!("no account with handle {handle}"))
                .with_handle(handle)
        })
    }

    /// Look up by the id's string form; a malformed id is `AccountNotFound`.
    pub async fn by_id(&self, raw_id: &str) -> LedgerResult<Account> {
        let id = raw_id
            .parse::<AccountId>()
            .map_err(|e| LedgerError::account_not_found(e.message().to_string()))?;
        self.store
            .account_by_id(id)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(format!("no account {id}")).with_account(id))
    }

    pub async fn statement(&self, handle: &str) -> LedgerResult<Statement> {
        let account = self.by_handle(handle).await?;
        let entries = self.store.entries_for_account(account.id).await?;
        Ok(Statement { account, entries })
    }
}
