//! In-memory ledger store for tests/dev.
//!
//! Transactions buffer their writes and validate them at commit time: every
//! staged account swap must still find the version it was based on, and no
//! staged ledger key may have appeared meanwhile. A failed validation aborts
//! the commit with [`StoreError::Serialization`], which callers treat like a
//! Postgres serialization failure (retry the whole transaction).

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use payflow_core::{
    Account, AccountId, EntryType, ExpectedVersion, LedgerEntry, TransactionId, TransferLegs,
};

use super::r#trait::{CasOutcome, InsertOutcome, LedgerStore, LedgerTx, StoreError};

#[derive(Debug, Default)]
struct MemState {
    accounts: HashMap<AccountId, Account>,
    handles: HashMap<String, AccountId>,
    entries: BTreeMap<(TransactionId, EntryType), LedgerEntry>,
    fail_next_commits: u32,
    lose_next_commit_acks: u32,
    commits: u64,
}

impl MemState {
    fn entries_for(&self, id: TransactionId) -> Vec<LedgerEntry> {
        self.entries
            .range((id, EntryType::Credit)..=(id, EntryType::Debit))
            .map(|(_, e)| e.clone())
            .collect()
    }
}

/// In-memory account store + ledger.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<MemState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transient error.
    pub fn fail_next_commits(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_next_commits = n;
        }
    }

    /// Make the next `n` commits apply their writes and then report a
    /// transient error, like a connection dropped after the server committed.
    pub fn lose_next_commit_acks(&self, n: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.lose_next_commit_acks = n;
        }
    }

    /// Number of successfully committed transactions.
    pub fn commits(&self) -> u64 {
        self.state.lock().map(|s| s.commits).unwrap_or(0)
    }

    /// Total number of ledger rows.
    pub fn entry_count(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemState>, StoreError> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<MemState>) -> Result<MutexGuard<'_, MemState>, StoreError> {
    state
        .lock()
        .map_err(|_| StoreError::Corrupt("in-memory store lock poisoned".to_string()))
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryLedgerTx {
            state: self.state.clone(),
            writes: HashMap::new(),
            entries: BTreeMap::new(),
        })
    }

    async fn insert_account(&self, account: &Account) -> Result<InsertOutcome, StoreError> {
        let mut state = self.lock()?;
        if state.handles.contains_key(&account.handle) || state.accounts.contains_key(&account.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        if account.balance < 0 {
            return Err(StoreError::Constraint("balance must not be negative".to_string()));
        }
        state.handles.insert(account.handle.clone(), account.id);
        state.accounts.insert(account.id, account.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn account_by_handle(&self, handle: &str) -> Result<Option<Account>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .handles
            .get(handle)
            .and_then(|id| state.accounts.get(id))
            .cloned())
    }

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(self.lock()?.accounts.get(&id).cloned())
    }

    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self.lock()?.entries_for(id))
    }

    async fn entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let mut entries: Vec<LedgerEntry> = self
            .lock()?
            .entries
            .values()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }
}

/// Buffered transaction over [`InMemoryLedgerStore`].
#[derive(Debug)]
pub struct InMemoryLedgerTx {
    state: Arc<Mutex<MemState>>,
    /// Staged account rows keyed by id, with the committed version they were based on.
    writes: HashMap<AccountId, (ExpectedVersion, Account)>,
    entries: BTreeMap<(TransactionId, EntryType), LedgerEntry>,
}

impl InMemoryLedgerTx {
    /// Read-your-writes view of one account.
    fn current(&self, state: &MemState, id: AccountId) -> Option<Account> {
        self.writes
            .get(&id)
            .map(|(_, a)| a.clone())
            .or_else(|| state.accounts.get(&id).cloned())
    }

    fn key_taken(&self, state: &MemState, key: &(TransactionId, EntryType)) -> bool {
        self.entries.contains_key(key) || state.entries.contains_key(key)
    }
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn account_by_handle(&mut self, handle: &str) -> Result<Option<Account>, StoreError> {
        let state = lock(&self.state)?;
        Ok(state
            .handles
            .get(handle)
            .copied()
            .and_then(|id| self.current(&state, id)))
    }

    async fn account_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let state = lock(&self.state)?;
        Ok(self.current(&state, id))
    }

    async fn compare_and_swap(
        &mut self,
        id: AccountId,
        expected: ExpectedVersion,
        new_balance: i64,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let state = lock(&self.state)?;
        let Some(current) = self.current(&state, id) else {
            return Ok(CasOutcome::NotFound);
        };
        if !expected.matches(current.version) {
            return Ok(CasOutcome::Conflict {
                actual: current.version,
            });
        }
        if new_balance < 0 {
            return Err(StoreError::Constraint(format!(
                "balance of account {id} would become {new_balance}"
            )));
        }

        let written = current.mutated(new_balance, at);
        let base = match self.writes.get(&id) {
            Some((base, _)) => *base,
            None => expected,
        };
        drop(state);
        self.writes.insert(id, (base, written.clone()));
        Ok(CasOutcome::Applied(written))
    }

    async fn record_entry(&mut self, entry: &LedgerEntry) -> Result<InsertOutcome, StoreError> {
        let key = (entry.id, entry.entry_type);
        let state = lock(&self.state)?;
        if self.key_taken(&state, &key) {
            return Ok(InsertOutcome::Duplicate);
        }
        drop(state);
        self.entries.insert(key, entry.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn record_transfer(&mut self, legs: &TransferLegs) -> Result<InsertOutcome, StoreError> {
        let debit_key = (legs.id(), EntryType::Debit);
        let credit_key = (legs.id(), EntryType::Credit);
        let state = lock(&self.state)?;
        match (
            self.key_taken(&state, &debit_key),
            self.key_taken(&state, &credit_key),
        ) {
            (true, true) => return Ok(InsertOutcome::Duplicate),
            (false, false) => {}
            _ => {
                return Err(StoreError::Constraint(format!(
                    "transfer {} is half recorded",
                    legs.id()
                )));
            }
        }
        drop(state);
        self.entries.insert(debit_key, legs.debit().clone());
        self.entries.insert(credit_key, legs.credit().clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn is_recorded(&mut self, id: TransactionId) -> Result<bool, StoreError> {
        let state = lock(&self.state)?;
        Ok(self.key_taken(&state, &(id, EntryType::Debit))
            || self.key_taken(&state, &(id, EntryType::Credit)))
    }

    async fn commit(self) -> Result<(), StoreError> {
        let mut state = lock(&self.state)?;

        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            return Err(StoreError::Transient("injected commit failure".to_string()));
        }

        for (id, (base, _)) in &self.writes {
            match state.accounts.get(id) {
                Some(committed) if base.matches(committed.version) => {}
                Some(committed) => {
                    return Err(StoreError::Serialization(format!(
                        "account {id} moved from version {} to {}",
                        base.get(),
                        committed.version
                    )));
                }
                None => {
                    return Err(StoreError::Serialization(format!("account {id} vanished")));
                }
            }
        }
        if let Some(key) = self.entries.keys().find(|k| state.entries.contains_key(k)) {
            return Err(StoreError::Serialization(format!(
                "ledger key {} {} recorded concurrently",
                key.0, key.1
            )));
        }

        for (id, (_, account)) in self.writes {
            state.accounts.insert(id, account);
        }
        state.entries.extend(self.entries);
        state.commits += 1;

        if state.lose_next_commit_acks > 0 {
            state.lose_next_commit_acks -= 1;
            return Err(StoreError::Transient("connection lost after commit".to_string()));
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
