//! `SQLite` persistence for the marketplace points engine.
//!
//! Every balance change goes through the Balance Guard in [`ledger`], which
//! is only callable inside an open write transaction. Purchase, recharge
//! confirmation and execution charging compose it with their own writes in a
//! single `BEGIN IMMEDIATE` transaction, so either all of a unit commits or
//! none of it does.

#![allow(clippy::missing_errors_doc)]

mod catalog;
mod execution;
mod ledger;
mod purchase;
mod recharge;

use std::path::Path;

use agent_market_core::{format_rfc3339, now_utc, parse_rfc3339_utc, MarketError, UserId};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

pub use catalog::WorkflowDeletion;

pub type StoreResult<T> = Result<T, MarketError>;

const MARKET_MIGRATION_VERSION: i64 = 1;
const MAX_BUSY_TIMEOUT_MS: u64 = 60_000;

const SCHEMA_MARKET_V1: &str = r"
CREATE TABLE IF NOT EXISTS user_accounts (
  user_id TEXT PRIMARY KEY,
  points INTEGER NOT NULL DEFAULT 0 CHECK (points >= 0),
  version INTEGER NOT NULL DEFAULT 0 CHECK (version >= 0),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
  entry_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  entry_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  entry_type TEXT NOT NULL CHECK (
    entry_type IN ('recharge', 'purchase', 'execution', 'refund')
  ),
  amount INTEGER NOT NULL CHECK (amount <> 0),
  balance_after INTEGER NOT NULL CHECK (balance_after >= 0),
  description TEXT NOT NULL,
  related_id TEXT,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES user_accounts(user_id)
);

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
  SELECT RAISE(FAIL, 'ledger_entries is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_ledger_entries_user_seq
  ON ledger_entries(user_id, entry_seq);
CREATE INDEX IF NOT EXISTS idx_ledger_entries_user_type_seq
  ON ledger_entries(user_id, entry_type, entry_seq);

CREATE TABLE IF NOT EXISTS agents (
  agent_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  definition_json TEXT NOT NULL,
  price INTEGER NOT NULL CHECK (price >= 0),
  purchase_count INTEGER NOT NULL DEFAULT 0 CHECK (purchase_count >= 0),
  is_public INTEGER NOT NULL DEFAULT 1 CHECK (is_public IN (0, 1)),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_public_popularity
  ON agents(is_public, purchase_count DESC, created_at DESC);

CREATE TABLE IF NOT EXISTS workflows (
  workflow_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  agent_id TEXT,
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  definition_json TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('draft', 'active', 'inactive', 'archived')),
  run_count INTEGER NOT NULL DEFAULT 0 CHECK (run_count >= 0),
  last_run_at TEXT,
  purchased_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES user_accounts(user_id),
  FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_workflows_user_agent
  ON workflows(user_id, agent_id) WHERE agent_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_workflows_user_created
  ON workflows(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS recharge_orders (
  order_id TEXT PRIMARY KEY,
  order_no TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  amount INTEGER NOT NULL CHECK (amount >= 1),
  points INTEGER NOT NULL CHECK (points >= 1),
  payment_method TEXT NOT NULL CHECK (
    payment_method IN ('alipay', 'wechat', 'union', 'paypal')
  ),
  status TEXT NOT NULL CHECK (status IN ('pending', 'paid', 'cancelled', 'refunded')),
  payment_id TEXT,
  paid_at TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES user_accounts(user_id)
);

CREATE INDEX IF NOT EXISTS idx_recharge_orders_user_created
  ON recharge_orders(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS workflow_executions (
  execution_id TEXT PRIMARY KEY,
  workflow_id TEXT NOT NULL,
  user_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('pending', 'running', 'success', 'failed', 'cancelled')
  ),
  started_at TEXT NOT NULL,
  claimed_at TEXT,
  completed_at TEXT,
  duration_ms INTEGER CHECK (duration_ms IS NULL OR duration_ms >= 0),
  input_json TEXT NOT NULL,
  output_json TEXT,
  error_message TEXT,
  logs TEXT,
  charged_points INTEGER NOT NULL DEFAULT 0 CHECK (charged_points >= 0),
  FOREIGN KEY (workflow_id) REFERENCES workflows(workflow_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_workflow_executions_status_started
  ON workflow_executions(status, started_at);
CREATE INDEX IF NOT EXISTS idx_workflow_executions_workflow_started
  ON workflow_executions(workflow_id, started_at DESC);
";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub busy_timeout_ms: u64,
    /// Points debited per execution start; zero disables charging.
    pub execution_cost_points: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            execution_cost_points: 0,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> StoreResult<()> {
        if self.busy_timeout_ms > MAX_BUSY_TIMEOUT_MS {
            return Err(MarketError::Validation(format!(
                "busy_timeout_ms MUST be <= {MAX_BUSY_TIMEOUT_MS}"
            )));
        }
        if self.execution_cost_points < 0 {
            return Err(MarketError::Validation(
                "execution_cost_points MUST be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct SqliteMarketStore {
    conn: Connection,
    config: StoreConfig,
}

impl SqliteMarketStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Self::open_with_config(path, StoreConfig::default())
    }

    pub fn open_with_config(path: &Path, config: StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let conn = Connection::open(path).storage(&format!(
            "failed to open sqlite database at {}",
            path.display()
        ))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {};",
            config.busy_timeout_ms
        ))
        .storage("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.config
    }

    pub fn migrate(&self) -> StoreResult<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .storage("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_MARKET_V1)
            .storage("failed to apply market schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![MARKET_MIGRATION_VERSION, now],
            )
            .storage("failed to register market schema migration")?;

        Ok(())
    }

    pub fn schema_version(&self) -> StoreResult<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .map(Option::flatten)
            .storage("failed to read schema version")
    }

    /// Opens a write transaction that takes the database write lock up front,
    /// so a read-check-write sequence inside it cannot interleave with
    /// another writer.
    fn begin_write(&mut self) -> StoreResult<Transaction<'_>> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .storage("failed to begin write transaction")
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Attaches context to a storage failure and classifies it as internal.
trait StorageContext<T> {
    fn storage(self, context: &str) -> StoreResult<T>;
}

impl<T> StorageContext<T> for rusqlite::Result<T> {
    fn storage(self, context: &str) -> StoreResult<T> {
        self.map_err(|err| MarketError::Internal(format!("{context}: {err}")))
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn ensure_account_exists(conn: &Connection, user_id: &UserId) -> StoreResult<()> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM user_accounts WHERE user_id = ?1",
            params![user_id.as_str()],
            |_| Ok(()),
        )
        .optional()
        .storage("failed to look up user account")?;

    match exists {
        Some(()) => Ok(()),
        None => Err(MarketError::NotFound(format!("user {user_id}"))),
    }
}

fn conversion_error(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Ulid> {
    let raw: String = row.get(index)?;
    Ulid::from_string(&raw)
        .map_err(|_| conversion_error(index, Type::Text, format!("invalid ULID: {raw}")))
}

fn parse_optional_ulid_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<Ulid>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        Ulid::from_string(&value)
            .map_err(|_| conversion_error(index, Type::Text, format!("invalid ULID: {value}")))
    })
    .transpose()
}

fn parse_user_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<UserId> {
    let raw: String = row.get(index)?;
    UserId::parse(&raw).map_err(|err| conversion_error(index, Type::Text, err.to_string()))
}

fn parse_time_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| conversion_error(index, Type::Text, err.to_string()))
}

fn parse_optional_time_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<OffsetDateTime>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        parse_rfc3339_utc(&value)
            .map_err(|err| conversion_error(index, Type::Text, err.to_string()))
    })
    .transpose()
}

fn parse_json_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(index)?;
    serde_json::from_str(&raw).map_err(|err| {
        conversion_error(index, Type::Text, format!("invalid stored JSON: {err}"))
    })
}

fn parse_optional_json_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| {
        serde_json::from_str(&value).map_err(|err| {
            conversion_error(index, Type::Text, format!("invalid stored JSON: {err}"))
        })
    })
    .transpose()
}

fn parse_enum_column<T>(
    row: &rusqlite::Row<'_>,
    index: usize,
    label: &str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(index)?;
    parse(&raw).ok_or_else(|| conversion_error(index, Type::Text, format!("invalid {label}: {raw}")))
}

fn to_json_text(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|err| MarketError::Internal(format!("failed to serialize JSON document: {err}")))
}

fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> StoreResult<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.storage("failed to decode row")?);
    }
    Ok(values)
}
