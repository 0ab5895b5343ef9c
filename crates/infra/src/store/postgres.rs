//! Postgres-backed ledger store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001`, `40P01` | `Serialization` | Serialization failure / deadlock |
//! | Database | `57P01`..`57P03`, `08xxx` | `Transient` | Server shutdown, connection failure |
//! | Database | `23505` | `Duplicate` | Unique violation (handle, ledger key) |
//! | Database | `23502`, `23503`, `23514` | `Constraint` | Not-null / FK / CHECK violation |
//! | Database | other | `Other` | Anything else reported by the server |
//! | PoolTimedOut, PoolClosed, Io, WorkerCrashed | N/A | `Transient` | Pool or network trouble |
//! | RowNotFound, ColumnDecode, Decode | N/A | `Corrupt` | Unexpected row shape |
//!
//! ## Optimistic Concurrency
//!
//! Account rows are never locked explicitly. `compare_and_swap` issues
//! `UPDATE … WHERE id = $id AND version = $v`; under READ COMMITTED a row
//! changed by a concurrent committed writer no longer matches, so the update
//! touches zero rows and a follow-up `SELECT version` tells a missing row
//! apart from a stale version.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument};

use payflow_core::{
    Account, AccountId, Amount, EntryType, ExpectedVersion, LedgerEntry, TransactionId,
    TransferLegs,
};

use super::r#trait::{CasOutcome, InsertOutcome, LedgerStore, LedgerTx, StoreError};
use crate::config::DatabaseConfig;

const ACCOUNT_COLUMNS: &str = "id, handle, balance, version, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, entry_type, account_id, counterparty_account_id, amount, \
     balance_before, balance_after, remarks, created_at, version";

/// Build the shared connection pool.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
        .connect(&config.url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    info!(
        max_connections = config.max_connections,
        "PostgreSQL connection pool established"
    );
    Ok(pool)
}

/// Postgres account store + ledger.
///
/// `Send + Sync`; clones share one pool. Every method acquires a connection
/// for the duration of one statement or one transaction only.
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Other(format!("migration failed: {e}")))
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("health_check", e))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    type Tx = PgLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(PgLedgerTx { tx })
    }

    #[instrument(skip(self, account), fields(account_id = %account.id, handle = %account.handle), err)]
    async fn insert_account(&self, account: &Account) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (id, handle, balance, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(account.id.as_uuid())
        .bind(&account.handle)
        .bind(account.balance)
        .bind(version_to_db(account.version)?)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_account", e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn account_by_handle(&self, handle: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE handle = $1"
        ))
        .bind(handle)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("account_by_handle", e))?;
        row.map(decode_account).transpose()
    }

    async fn account_by_id(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("account_by_id", e))?;
        row.map(decode_account).transpose()
    }

    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE id = $1 ORDER BY entry_type"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries_for_transaction", e))?;
        rows.into_iter().map(decode_entry).collect()
    }

    async fn entries_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE account_id = $1 \
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(account_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("entries_for_account", e))?;
        rows.into_iter().map(decode_entry).collect()
    }
}

/// One Postgres transaction. Dropping it without `commit` rolls back.
pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn account_by_handle(&mut self, handle: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE handle = $1"
        ))
        .bind(handle)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("tx.account_by_handle", e))?;
        row.map(decode_account).transpose()
    }

    async fn account_by_id(&mut self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("tx.account_by_id", e))?;
        row.map(decode_account).transpose()
    }

    #[instrument(skip(self), fields(account_id = %id, expected = expected.get()), err)]
    async fn compare_and_swap(
        &mut self,
        id: AccountId,
        expected: ExpectedVersion,
        new_balance: i64,
        at: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let updated = sqlx::query(&format!(
            r#"
            UPDATE accounts
            SET balance = $1, version = version + 1, updated_at = $2
            WHERE id = $3 AND version = $4
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(new_balance)
        .bind(at)
        .bind(id.as_uuid())
        .bind(version_to_db(expected.get())?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("compare_and_swap", e))?;

        if let Some(row) = updated {
            return Ok(CasOutcome::Applied(decode_account(row)?));
        }

        // Zero rows: either the account is gone or someone else won the race.
        let actual: Option<i64> = sqlx::query_scalar("SELECT version FROM accounts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("compare_and_swap.recheck", e))?;

        match actual {
            None => Ok(CasOutcome::NotFound),
            Some(v) => Ok(CasOutcome::Conflict {
                actual: version_from_db(v)?,
            }),
        }
    }

    async fn record_entry(&mut self, entry: &LedgerEntry) -> Result<InsertOutcome, StoreError> {
        let result = bind_entry(
            sqlx::query(
                r#"
                INSERT INTO ledger_entries
                    (id, entry_type, account_id, counterparty_account_id, amount,
                     balance_before, balance_after, remarks, created_at, version)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (id, entry_type) DO NOTHING
                "#,
            ),
            entry,
        )
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("record_entry", e))?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    #[instrument(skip(self, legs), fields(transfer_id = %legs.id()), err)]
    async fn record_transfer(&mut self, legs: &TransferLegs) -> Result<InsertOutcome, StoreError> {
        let query = sqlx::query(
            r#"
            INSERT INTO ledger_entries
                (id, entry_type, account_id, counterparty_account_id, amount,
                 balance_before, balance_after, remarks, created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10),
                   ($11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id, entry_type) DO NOTHING
            "#,
        );
        let query = bind_entry(bind_entry(query, legs.debit()), legs.credit());
        let result = query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("record_transfer", e))?;

        match result.rows_affected() {
            2 => Ok(InsertOutcome::Inserted),
            0 => Ok(InsertOutcome::Duplicate),
            n => Err(StoreError::Constraint(format!(
                "transfer {} is half recorded ({n} of 2 legs inserted)",
                legs.id()
            ))),
        }
    }

    async fn is_recorded(&mut self, id: TransactionId) -> Result<bool, StoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM ledger_entries WHERE id = $1)")
            .bind(id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("is_recorded", e))
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_entry<'q>(query: PgQuery<'q>, entry: &'q LedgerEntry) -> PgQuery<'q> {
    query
        .bind(entry.id.as_uuid())
        .bind(entry.entry_type.as_str())
        .bind(entry.account_id.as_uuid())
        .bind(entry.counterparty_account_id.map(uuid::Uuid::from))
        .bind(entry.amount.get())
        .bind(entry.balance_before)
        .bind(entry.balance_after)
        .bind(entry.remarks.as_deref())
        .bind(entry.created_at)
        .bind(entry.version)
}

fn version_to_db(version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Constraint(format!("version {version} out of range")))
}

fn version_from_db(version: i64) -> Result<u64, StoreError> {
    u64::try_from(version).map_err(|_| StoreError::Corrupt(format!("negative version {version}")))
}

/// Map a SQLx error onto the store taxonomy.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") => StoreError::Serialization(msg),
                Some("23505") => StoreError::Duplicate(msg),
                Some("23502") | Some("23503") | Some("23514") => StoreError::Constraint(msg),
                Some(code) if code.starts_with("08") || code.starts_with("57P") => {
                    StoreError::Transient(msg)
                }
                _ => StoreError::Other(msg),
            }
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Transient(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Transient(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::Io(e) => StoreError::Transient(format!("io error in {}: {}", operation, e)),
        sqlx::Error::WorkerCrashed => {
            StoreError::Transient(format!("connection worker crashed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Corrupt(format!("unexpected row not found in {}", operation))
        }
        e @ (sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_)) => {
            StoreError::Corrupt(format!("decode error in {}: {}", operation, e))
        }
        _ => StoreError::Other(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct AccountRow {
    id: uuid::Uuid,
    handle: String,
    balance: i64,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for AccountRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(AccountRow {
            id: row.try_get("id")?,
            handle: row.try_get("handle")?,
            balance: row.try_get("balance")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

fn decode_account(row: PgRow) -> Result<Account, StoreError> {
    let row = AccountRow::from_row(&row).map_err(|e| map_sqlx_error("decode account", e))?;
    Ok(Account {
        id: AccountId::from_uuid(row.id),
        handle: row.handle,
        balance: row.balance,
        version: version_from_db(row.version)?,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[derive(Debug)]
struct LedgerEntryRow {
    id: uuid::Uuid,
    entry_type: String,
    account_id: uuid::Uuid,
    counterparty_account_id: Option<uuid::Uuid>,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    remarks: Option<String>,
    created_at: DateTime<Utc>,
    version: i32,
}

impl<'r> FromRow<'r, PgRow> for LedgerEntryRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerEntryRow {
            id: row.try_get("id")?,
            entry_type: row.try_get("entry_type")?,
            account_id: row.try_get("account_id")?,
            counterparty_account_id: row.try_get("counterparty_account_id")?,
            amount: row.try_get("amount")?,
            balance_before: row.try_get("balance_before")?,
            balance_after: row.try_get("balance_after")?,
            remarks: row.try_get("remarks")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

fn decode_entry(row: PgRow) -> Result<LedgerEntry, StoreError> {
    let row = LedgerEntryRow::from_row(&row).map_err(|e| map_sqlx_error("decode entry", e))?;
    let corrupt = |e: payflow_core::LedgerError| StoreError::Corrupt(e.to_string());
    Ok(LedgerEntry {
        id: TransactionId::from_uuid(row.id),
        entry_type: row.entry_type.parse::<EntryType>().map_err(corrupt)?,
        account_id: AccountId::from_uuid(row.account_id),
        counterparty_account_id: row.counterparty_account_id.map(AccountId::from_uuid),
        amount: Amount::new(row.amount).map_err(corrupt)?,
        balance_before: row.balance_before,
        balance_after: row.balance_after,
        remarks: row.remarks,
        created_at: row.created_at,
        version: row.version,
    })
}
