//! Accounts, the append-only ledger and the Balance Guard.

use agent_market_core::{
    audit_entries, format_rfc3339, now_utc, Account, EntryId, LedgerAudit, LedgerEntry,
    LedgerEntryType, LedgerMutation, MarketError, Page, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info, warn};

use crate::{
    collect_rows, ensure_account_exists, parse_enum_column, parse_time_column,
    parse_ulid_column, parse_user_column, SqliteMarketStore, StorageContext, StoreResult,
};

const LEDGER_COLUMNS: &str = "entry_seq, entry_id, user_id, entry_type, amount, balance_after,
     description, related_id, created_at";

impl SqliteMarketStore {
    /// Creates a zero-balance account, or returns the existing one.
    pub fn register_user(&mut self, user_id: &UserId) -> StoreResult<Account> {
        let now = format_rfc3339(now_utc())?;
        let tx = self.begin_write()?;
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO user_accounts(user_id, points, version, created_at, updated_at)
                 VALUES (?1, 0, 0, ?2, ?2)",
                params![user_id.as_str(), now],
            )
            .storage("failed to register user account")?;
        let account = select_account(&tx, user_id)?
            .ok_or_else(|| MarketError::Internal(format!("account {user_id} vanished")))?;
        tx.commit().storage("failed to commit account registration")?;

        if inserted == 1 {
            info!(user_id = %user_id, "user account registered");
        }
        Ok(account)
    }

    pub fn get_account(&self, user_id: &UserId) -> StoreResult<Account> {
        select_account(&self.conn, user_id)?
            .ok_or_else(|| MarketError::NotFound(format!("user {user_id}")))
    }

    pub fn balance(&self, user_id: &UserId) -> StoreResult<i64> {
        self.get_account(user_id).map(|account| account.points)
    }

    /// Applies one balance change and appends its ledger entry atomically.
    ///
    /// Fails with [`MarketError::InsufficientFunds`] when the change would
    /// take the balance below zero; nothing is written in that case.
    pub fn apply_ledger_mutation(&mut self, mutation: &LedgerMutation) -> StoreResult<LedgerEntry> {
        let tx = self.begin_write()?;
        let entry = apply_mutation_in_tx(&tx, mutation)?;
        tx.commit().storage("failed to commit ledger mutation")?;
        Ok(entry)
    }

    /// Newest-first ledger history for one user.
    pub fn list_ledger_entries(
        &self,
        user_id: &UserId,
        entry_type: Option<LedgerEntryType>,
        page: Page,
    ) -> StoreResult<Vec<LedgerEntry>> {
        ensure_account_exists(&self.conn, user_id)?;
        let query = format!(
            "SELECT {LEDGER_COLUMNS}
             FROM ledger_entries
             WHERE user_id = ?1 AND (?2 IS NULL OR entry_type = ?2)
             ORDER BY entry_seq DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare ledger listing")?;
        let rows = stmt
            .query_map(
                params![
                    user_id.as_str(),
                    entry_type.map(LedgerEntryType::as_str),
                    i64::from(page.limit),
                    i64::from(page.offset)
                ],
                parse_ledger_row,
            )
            .storage("failed to list ledger entries")?;
        collect_rows(rows)
    }

    pub fn get_ledger_entry(&self, user_id: &UserId, entry_id: EntryId) -> StoreResult<LedgerEntry> {
        let query = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE entry_id = ?1 AND user_id = ?2"
        );
        self.conn
            .query_row(
                &query,
                params![entry_id.to_string(), user_id.as_str()],
                parse_ledger_row,
            )
            .optional()
            .storage("failed to load ledger entry")?
            .ok_or_else(|| MarketError::NotFound(format!("ledger entry {entry_id}")))
    }

    /// Replays the user's full ledger against the live balance.
    pub fn audit_ledger(&self, user_id: &UserId) -> StoreResult<LedgerAudit> {
        let account = self.get_account(user_id)?;
        let query = format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE user_id = ?1 ORDER BY entry_seq ASC"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare ledger replay")?;
        let rows = stmt
            .query_map(params![user_id.as_str()], parse_ledger_row)
            .storage("failed to read ledger for audit")?;
        let entries = collect_rows(rows)?;

        let audit = audit_entries(user_id, &entries, account.points);
        if audit.consistent {
            debug!(user_id = %user_id, entries = audit.entry_count, "ledger audit clean");
        } else {
            warn!(
                user_id = %user_id,
                issues = audit.issues.len(),
                balance = audit.balance,
                ledger_sum = audit.ledger_sum,
                "ledger audit found inconsistencies"
            );
        }
        Ok(audit)
    }
}

/// The Balance Guard.
///
/// Must run inside a write transaction opened with `begin_write`.
/// The balance update is conditional on the result staying non-negative, and
/// the ledger row is inserted in the same transaction, so the pair commits or
/// rolls back together with whatever else the caller wrote.
pub(crate) fn apply_mutation_in_tx(
    tx: &Transaction<'_>,
    mutation: &LedgerMutation,
) -> StoreResult<LedgerEntry> {
    mutation.validate()?;
    let created_at = now_utc();
    let created_at_raw = format_rfc3339(created_at)?;

    let updated = tx
        .execute(
            "UPDATE user_accounts
             SET points = points + ?1, version = version + 1, updated_at = ?3
             WHERE user_id = ?2 AND points + ?1 >= 0",
            params![mutation.amount, mutation.user_id.as_str(), created_at_raw],
        )
        .storage("failed to apply balance update")?;

    if updated == 0 {
        let balance = select_account(tx, &mutation.user_id)?.map(|account| account.points);
        return Err(match balance {
            None => MarketError::NotFound(format!("user {}", mutation.user_id)),
            Some(balance) => {
                info!(
                    user_id = %mutation.user_id,
                    balance,
                    requested = -mutation.amount,
                    "ledger debit rejected"
                );
                MarketError::InsufficientFunds {
                    balance,
                    requested: -mutation.amount,
                }
            }
        });
    }

    let balance_after = select_account(tx, &mutation.user_id)?
        .map(|account| account.points)
        .ok_or_else(|| MarketError::Internal(format!("account {} vanished", mutation.user_id)))?;

    let entry_id = EntryId::new();
    tx.execute(
        "INSERT INTO ledger_entries(
            entry_id, user_id, entry_type, amount, balance_after,
            description, related_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry_id.to_string(),
            mutation.user_id.as_str(),
            mutation.entry_type.as_str(),
            mutation.amount,
            balance_after,
            mutation.description,
            mutation.related_id,
            created_at_raw,
        ],
    )
    .storage("failed to append ledger entry")?;
    let entry_seq = tx.last_insert_rowid();

    info!(
        user_id = %mutation.user_id,
        entry_type = %mutation.entry_type,
        amount = mutation.amount,
        balance_after,
        "ledger mutation applied"
    );

    Ok(LedgerEntry {
        entry_seq,
        entry_id,
        user_id: mutation.user_id.clone(),
        entry_type: mutation.entry_type,
        amount: mutation.amount,
        balance_after,
        description: mutation.description.clone(),
        related_id: mutation.related_id.clone(),
        created_at,
    })
}

fn select_account(conn: &Connection, user_id: &UserId) -> StoreResult<Option<Account>> {
    conn.query_row(
        "SELECT user_id, points, version, created_at, updated_at
         FROM user_accounts WHERE user_id = ?1",
        params![user_id.as_str()],
        |row| {
            Ok(Account {
                user_id: parse_user_column(row, 0)?,
                points: row.get(1)?,
                version: row.get(2)?,
                created_at: parse_time_column(row, 3)?,
                updated_at: parse_time_column(row, 4)?,
            })
        },
    )
    .optional()
    .storage("failed to load user account")
}

fn parse_ledger_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        entry_seq: row.get(0)?,
        entry_id: EntryId(parse_ulid_column(row, 1)?),
        user_id: parse_user_column(row, 2)?,
        entry_type: parse_enum_column(row, 3, "entry_type", LedgerEntryType::parse)?,
        amount: row.get(4)?,
        balance_after: row.get(5)?,
        description: row.get(6)?,
        related_id: row.get(7)?,
        created_at: parse_time_column(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::StoreConfig;
    use proptest::prelude::*;
    use std::path::Path;

    fn debit(user_id: &UserId, amount: i64) -> LedgerMutation {
        LedgerMutation {
            user_id: user_id.clone(),
            entry_type: LedgerEntryType::Purchase,
            amount: -amount,
            description: format!("debit {amount}"),
            related_id: None,
        }
    }

    fn credit(user_id: &UserId, amount: i64) -> LedgerMutation {
        LedgerMutation {
            user_id: user_id.clone(),
            entry_type: LedgerEntryType::Recharge,
            amount,
            description: format!("credit {amount}"),
            related_id: Some("order-fixture".to_string()),
        }
    }

    #[test]
    fn register_user_is_idempotent() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 40);
        let again = must(store.register_user(&user));
        assert_eq!(again.points, 40);
        assert_eq!(ledger_row_count(&store, &user), 1);
    }

    #[test]
    fn debit_beyond_balance_is_rejected_without_rows() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 40);

        let err = must_err(store.apply_ledger_mutation(&debit(&user, 60)));
        assert_eq!(
            err,
            MarketError::InsufficientFunds {
                balance: 40,
                requested: 60
            }
        );
        assert_eq!(must(store.balance(&user)), 40);
        assert_eq!(ledger_row_count(&store, &user), 1);
    }

    #[test]
    fn account_version_counts_committed_changes_only() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 40);
        let before = must(store.get_account(&user)).version;

        let _ = must_err(store.apply_ledger_mutation(&debit(&user, 60)));
        assert_eq!(must(store.get_account(&user)).version, before);

        let _ = must(store.apply_ledger_mutation(&debit(&user, 15)));
        assert_eq!(must(store.get_account(&user)).version, before + 1);
    }

    #[test]
    fn debit_to_exactly_zero_is_allowed() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 40);
        let entry = must(store.apply_ledger_mutation(&debit(&user, 40)));
        assert_eq!(entry.balance_after, 0);
        assert_eq!(must(store.balance(&user)), 0);
    }

    #[test]
    fn zero_amount_and_unknown_user_are_rejected() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 10);
        let mut zero = credit(&user, 1);
        zero.amount = 0;
        assert!(matches!(
            store.apply_ledger_mutation(&zero),
            Err(MarketError::Validation(_))
        ));

        let ghost = must(UserId::parse("ghost"));
        assert!(matches!(
            store.apply_ledger_mutation(&credit(&ghost, 5)),
            Err(MarketError::NotFound(_))
        ));
    }

    #[test]
    fn append_only_trigger_blocks_updates_and_deletes() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 10);
        let entry = must(store.apply_ledger_mutation(&credit(&user, 5)));

        let update_result = store.connection().execute(
            "UPDATE ledger_entries SET amount = 500 WHERE entry_seq = ?1",
            params![entry.entry_seq],
        );
        assert!(update_result.is_err());

        let delete_result = store.connection().execute(
            "DELETE FROM ledger_entries WHERE entry_seq = ?1",
            params![entry.entry_seq],
        );
        assert!(delete_result.is_err());
    }

    #[test]
    fn history_is_newest_first_and_filterable() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 100);
        let _ = must(store.apply_ledger_mutation(&debit(&user, 30)));
        let last = must(store.apply_ledger_mutation(&credit(&user, 5)));

        let all = must(store.list_ledger_entries(&user, None, Page::default()));
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].entry_id, last.entry_id);

        let purchases = must(store.list_ledger_entries(
            &user,
            Some(LedgerEntryType::Purchase),
            Page::default(),
        ));
        assert_eq!(purchases.len(), 1);
        assert_eq!(purchases[0].amount, -30);
        assert_eq!(purchases[0].balance_after, 70);

        let paged = must(store.list_ledger_entries(&user, None, must(Page::new(Some(1), Some(1)))));
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].amount, -30);

        let fetched = must(store.get_ledger_entry(&user, last.entry_id));
        assert_eq!(fetched, last);

        let other = fixture_user(&mut store, "bob", 0);
        assert!(matches!(
            store.get_ledger_entry(&other, last.entry_id),
            Err(MarketError::NotFound(_))
        ));
    }

    #[test]
    fn audit_is_clean_after_mixed_activity() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 100);
        let _ = must(store.apply_ledger_mutation(&debit(&user, 99)));
        let _ = store.apply_ledger_mutation(&debit(&user, 2));
        let _ = must(store.apply_ledger_mutation(&credit(&user, 7)));

        let audit = must(store.audit_ledger(&user));
        assert!(audit.consistent, "issues: {:?}", audit.issues);
        assert_eq!(audit.balance, 8);
        assert_eq!(audit.entry_count, 3);
    }

    #[test]
    fn audit_detects_balance_written_outside_the_guard() {
        let mut store = fixture_store();
        let user = fixture_user(&mut store, "alice", 100);
        if let Err(err) = store.connection().execute(
            "UPDATE user_accounts SET points = 1000 WHERE user_id = ?1",
            params![user.as_str()],
        ) {
            panic!("failed to tamper balance: {err}");
        }

        let audit = must(store.audit_ledger(&user));
        assert!(!audit.consistent);
        assert_eq!(audit.issues[0].code, "balance_drift");
    }

    #[test]
    fn concurrent_debits_on_one_user_never_overdraw() {
        let db_path = unique_temp_db_path("concurrent-debits");
        {
            let mut setup = must(SqliteMarketStore::open(&db_path));
            must(setup.migrate());
            let _ = fixture_user(&mut setup, "alice", 100);
        }

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = db_path.clone();
                std::thread::spawn(move || {
                    let mut store = match SqliteMarketStore::open_with_config(
                        &path,
                        StoreConfig {
                            busy_timeout_ms: 10_000,
                            execution_cost_points: 0,
                        },
                    ) {
                        Ok(value) => value,
                        Err(err) => panic!("failed to open worker store: {err}"),
                    };
                    let user = match UserId::parse("alice") {
                        Ok(value) => value,
                        Err(err) => panic!("invalid fixture user: {err}"),
                    };
                    let mut accepted = 0_i64;
                    for _ in 0..10 {
                        match store.apply_ledger_mutation(&debit(&user, 10)) {
                            Ok(_) => accepted += 1,
                            Err(MarketError::InsufficientFunds { .. }) => {}
                            Err(err) => panic!("unexpected debit failure: {err}"),
                        }
                    }
                    accepted
                })
            })
            .collect();

        let mut accepted = 0_i64;
        for handle in handles {
            accepted += match handle.join() {
                Ok(value) => value,
                Err(err) => panic!("debit thread join failed: {err:?}"),
            };
        }
        assert_eq!(accepted, 10);

        let store = must(SqliteMarketStore::open(&db_path));
        let user = must(UserId::parse("alice"));
        assert_eq!(must(store.balance(&user)), 0);
        assert!(must(store.audit_ledger(&user)).consistent);
        drop(store);
        let _ = std::fs::remove_file(&db_path);
    }

    #[test]
    fn busy_timeout_allows_write_after_lock_release() {
        let db_path = unique_temp_db_path("lock");
        {
            let mut setup = must(SqliteMarketStore::open(&db_path));
            must(setup.migrate());
            let _ = fixture_user(&mut setup, "alice", 10);
        }

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let write_path = db_path.clone();
        let write_handle = std::thread::spawn(move || {
            let mut store = match SqliteMarketStore::open(Path::new(&write_path)) {
                Ok(value) => value,
                Err(err) => panic!("failed to open write store: {err}"),
            };
            let user = match UserId::parse("alice") {
                Ok(value) => value,
                Err(err) => panic!("invalid fixture user: {err}"),
            };
            store.apply_ledger_mutation(&credit(&user, 5))
        });

        std::thread::sleep(std::time::Duration::from_millis(150));
        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }

        let write_result = match write_handle.join() {
            Ok(result) => result,
            Err(err) => panic!("write thread join failed: {err:?}"),
        };
        assert!(
            write_result.is_ok(),
            "write should succeed after lock release: {:?}",
            write_result.err()
        );
        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_ledger_conserves_balance(stream in prop::collection::vec(-80i64..120, 1..60)) {
            let mut store = fixture_store();
            let user = fixture_user(&mut store, "prop-user", 0);
            let mut expected = 0i64;
            let mut rows = 0i64;

            for amount in stream {
                if amount == 0 {
                    continue;
                }
                let mutation = if amount > 0 { credit(&user, amount) } else { debit(&user, -amount) };
                match store.apply_ledger_mutation(&mutation) {
                    Ok(entry) => {
                        expected += amount;
                        rows += 1;
                        prop_assert_eq!(entry.balance_after, expected);
                    }
                    Err(MarketError::InsufficientFunds { balance, .. }) => {
                        prop_assert!(expected + amount < 0);
                        prop_assert_eq!(balance, expected);
                    }
                    Err(err) => panic!("unexpected ledger failure: {err}"),
                }
                prop_assert!(must(store.balance(&user)) >= 0);
            }

            prop_assert_eq!(must(store.balance(&user)), expected);
            prop_assert_eq!(ledger_row_count(&store, &user), rows);
            prop_assert!(must(store.audit_ledger(&user)).consistent);
        }
    }
}
