//! Execution Lifecycle.
//!
//! Every transition is a conditional update on the current status, so the
//! first terminal write wins and later reports are rejected as conflicts.

use agent_market_core::{
    duration_ms, format_rfc3339, now_utc, Execution, ExecutionId, ExecutionReport,
    ExecutionStatus, LedgerEntryType, LedgerMutation, Lifecycle, MarketError, Page, UserId,
    WorkflowId, WorkflowStatus,
};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::catalog::select_workflow;
use crate::ledger::apply_mutation_in_tx;
use crate::{
    collect_rows, parse_enum_column, parse_json_column, parse_optional_json_column,
    parse_optional_time_column, parse_time_column, parse_ulid_column, parse_user_column,
    to_json_text, SqliteMarketStore, StorageContext, StoreResult,
};

const EXECUTION_COLUMNS: &str = "e.execution_id, e.workflow_id, e.user_id, e.status,
     e.started_at, e.completed_at, e.duration_ms, e.input_json, e.output_json,
     e.error_message, e.logs, e.charged_points";

const CANCEL_LOG: &str = "execution cancelled by user";

impl SqliteMarketStore {
    /// Creates a `pending` execution for an active workflow owned by
    /// `user_id` and bumps the workflow's run counters.
    ///
    /// Missing, foreign and inactive workflows all fail with
    /// [`MarketError::WorkflowNotActive`]. When an execution cost is
    /// configured the debit happens in the same transaction, so insufficient
    /// funds leave no execution row behind.
    pub fn start_execution(
        &mut self,
        workflow_id: WorkflowId,
        user_id: &UserId,
        input_data: Value,
    ) -> StoreResult<Execution> {
        let cost = self.config.execution_cost_points;
        let input_json = to_json_text(&input_data)?;
        let tx = self.begin_write()?;

        let workflow = select_workflow(&tx, workflow_id)?
            .filter(|workflow| &workflow.user_id == user_id)
            .filter(|workflow| workflow.status == WorkflowStatus::Active)
            .ok_or(MarketError::WorkflowNotActive)?;

        if cost > 0 {
            apply_mutation_in_tx(
                &tx,
                &LedgerMutation {
                    user_id: user_id.clone(),
                    entry_type: LedgerEntryType::Execution,
                    amount: -cost,
                    description: format!("execution: {}", workflow.name),
                    related_id: Some(workflow_id.to_string()),
                },
            )?;
        }

        let started_at = now_utc();
        let started_raw = format_rfc3339(started_at)?;
        let execution = Execution {
            execution_id: ExecutionId::new(),
            workflow_id,
            user_id: user_id.clone(),
            status: ExecutionStatus::Pending,
            started_at,
            completed_at: None,
            duration_ms: None,
            input_data,
            output_data: None,
            error_message: None,
            logs: None,
            charged_points: cost.max(0),
        };

        tx.execute(
            "INSERT INTO workflow_executions(
                execution_id, workflow_id, user_id, status, started_at,
                completed_at, duration_ms, input_json, output_json,
                error_message, logs, charged_points
             ) VALUES (?1, ?2, ?3, 'pending', ?4, NULL, NULL, ?5, NULL, NULL, NULL, ?6)",
            params![
                execution.execution_id.to_string(),
                workflow_id.to_string(),
                user_id.as_str(),
                started_raw,
                input_json,
                execution.charged_points,
            ],
        )
        .storage("failed to insert execution")?;

        tx.execute(
            "UPDATE workflows
             SET run_count = run_count + 1, last_run_at = ?2, updated_at = ?2
             WHERE workflow_id = ?1",
            params![workflow_id.to_string(), started_raw],
        )
        .storage("failed to bump workflow run count")?;

        tx.commit().storage("failed to commit execution start")?;

        info!(
            user_id = %user_id,
            workflow_id = %workflow_id,
            execution_id = %execution.execution_id,
            charged_points = execution.charged_points,
            "execution started"
        );
        Ok(execution)
    }

    /// Worker claim: `pending -> running`.
    pub fn mark_running(&mut self, execution_id: ExecutionId) -> StoreResult<Execution> {
        let tx = self.begin_write()?;
        let current = select_execution(&tx, execution_id)?
            .ok_or_else(|| MarketError::NotFound(format!("execution {execution_id}")))?;
        if current.status != ExecutionStatus::Pending {
            return Err(MarketError::InvalidTransition {
                entity: ExecutionStatus::ENTITY,
                from: current.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }

        let claimed_raw = format_rfc3339(now_utc())?;
        let claimed = tx
            .execute(
                "UPDATE workflow_executions SET status = 'running', claimed_at = ?2
                 WHERE execution_id = ?1 AND status = 'pending'",
                params![execution_id.to_string(), claimed_raw],
            )
            .storage("failed to claim execution")?;
        if claimed != 1 {
            return Err(MarketError::Internal(format!(
                "execution {execution_id} changed during claim"
            )));
        }

        let running = reselect(&tx, execution_id)?;
        tx.commit().storage("failed to commit execution claim")?;
        info!(execution_id = %execution_id, "execution running");
        Ok(running)
    }

    /// Records the runner's terminal report.
    ///
    /// Rejected with [`MarketError::InvalidTransition`] when the execution is
    /// already terminal, which is how a report that lost the race against a
    /// cancellation is discarded.
    pub fn complete_execution(
        &mut self,
        execution_id: ExecutionId,
        report: &ExecutionReport,
    ) -> StoreResult<Execution> {
        report.validate()?;
        let output_json = report.output_data.as_ref().map(to_json_text).transpose()?;

        let tx = self.begin_write()?;
        let current = select_execution(&tx, execution_id)?
            .ok_or_else(|| MarketError::NotFound(format!("execution {execution_id}")))?;
        if let Err(err) = current.status.ensure_transition(report.status) {
            warn!(
                execution_id = %execution_id,
                current = %current.status,
                reported = %report.status,
                "completion rejected for settled execution"
            );
            return Err(err);
        }

        let completed_at = now_utc();
        let updated = tx
            .execute(
                "UPDATE workflow_executions
                 SET status = ?2, completed_at = ?3, duration_ms = ?4,
                     output_json = ?5, error_message = ?6, logs = ?7
                 WHERE execution_id = ?1 AND status IN ('pending', 'running')",
                params![
                    execution_id.to_string(),
                    report.status.as_str(),
                    format_rfc3339(completed_at)?,
                    duration_ms(current.started_at, completed_at),
                    output_json,
                    report.error_message,
                    report.logs,
                ],
            )
            .storage("failed to complete execution")?;
        if updated != 1 {
            return Err(MarketError::Internal(format!(
                "execution {execution_id} changed during completion"
            )));
        }

        let completed = reselect(&tx, execution_id)?;
        tx.commit().storage("failed to commit execution completion")?;
        info!(
            execution_id = %execution_id,
            status = %completed.status,
            duration_ms = completed.duration_ms,
            "execution completed"
        );
        Ok(completed)
    }

    /// Cooperative cancel; in-flight work is not interrupted.
    ///
    /// Ownership is checked through the owning workflow. A charged execution
    /// that never left `pending` is refunded in the same transaction.
    pub fn cancel_execution(
        &mut self,
        execution_id: ExecutionId,
        user_id: &UserId,
    ) -> StoreResult<Execution> {
        let tx = self.begin_write()?;
        let current = select_owned_execution(&tx, user_id, execution_id)?;
        if !current.status.is_open() {
            info!(
                execution_id = %execution_id,
                status = %current.status,
                "cancel rejected for settled execution"
            );
            return Err(MarketError::InvalidCancelState(current.status));
        }

        let completed_at = now_utc();
        let updated = tx
            .execute(
                "UPDATE workflow_executions
                 SET status = 'cancelled', completed_at = ?2, duration_ms = ?3, logs = ?4
                 WHERE execution_id = ?1 AND status IN ('pending', 'running')",
                params![
                    execution_id.to_string(),
                    format_rfc3339(completed_at)?,
                    duration_ms(current.started_at, completed_at),
                    CANCEL_LOG,
                ],
            )
            .storage("failed to cancel execution")?;
        if updated != 1 {
            return Err(MarketError::Internal(format!(
                "execution {execution_id} changed during cancel"
            )));
        }

        let refunded = current.status == ExecutionStatus::Pending && current.charged_points > 0;
        if refunded {
            apply_mutation_in_tx(
                &tx,
                &LedgerMutation {
                    user_id: user_id.clone(),
                    entry_type: LedgerEntryType::Refund,
                    amount: current.charged_points,
                    description: format!("refund: cancelled execution {execution_id}"),
                    related_id: Some(execution_id.to_string()),
                },
            )?;
        }

        let cancelled = reselect(&tx, execution_id)?;
        tx.commit().storage("failed to commit execution cancel")?;
        info!(
            user_id = %user_id,
            execution_id = %execution_id,
            from = %current.status,
            refunded,
            "execution cancelled"
        );
        Ok(cancelled)
    }

    pub fn get_execution(&self, user_id: &UserId, execution_id: ExecutionId) -> StoreResult<Execution> {
        select_owned_execution(&self.conn, user_id, execution_id)
    }

    /// Unscoped lookup for the worker, which acts on behalf of the system.
    pub fn get_execution_by_id(&self, execution_id: ExecutionId) -> StoreResult<Execution> {
        select_execution(&self.conn, execution_id)?
            .ok_or_else(|| MarketError::NotFound(format!("execution {execution_id}")))
    }

    pub fn list_executions(
        &self,
        user_id: &UserId,
        workflow_id: Option<WorkflowId>,
        status: Option<ExecutionStatus>,
        page: Page,
    ) -> StoreResult<Vec<Execution>> {
        let query = format!(
            "SELECT {EXECUTION_COLUMNS}
             FROM workflow_executions e
             JOIN workflows w ON w.workflow_id = e.workflow_id
             WHERE w.user_id = ?1
               AND (?2 IS NULL OR e.workflow_id = ?2)
               AND (?3 IS NULL OR e.status = ?3)
             ORDER BY e.started_at DESC, e.execution_id DESC
             LIMIT ?4 OFFSET ?5"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare execution listing")?;
        let rows = stmt
            .query_map(
                params![
                    user_id.as_str(),
                    workflow_id.map(|id| id.to_string()),
                    status.map(ExecutionStatus::as_str),
                    i64::from(page.limit),
                    i64::from(page.offset)
                ],
                parse_execution_row,
            )
            .storage("failed to list executions")?;
        collect_rows(rows)
    }

    /// Oldest first, for the worker poller.
    pub fn list_pending_executions(&self, limit: u32) -> StoreResult<Vec<ExecutionId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT execution_id FROM workflow_executions
                 WHERE status = 'pending'
                 ORDER BY started_at ASC, execution_id ASC
                 LIMIT ?1",
            )
            .storage("failed to prepare pending execution query")?;
        let rows = stmt
            .query_map(params![i64::from(limit)], |row| {
                parse_ulid_column(row, 0).map(ExecutionId)
            })
            .storage("failed to list pending executions")?;
        collect_rows(rows)
    }

    /// Executions claimed longer than `stalled_for` ago that are still
    /// `running`, oldest claim first.
    pub fn list_stalled_executions(
        &self,
        stalled_for: Duration,
        limit: u32,
    ) -> StoreResult<Vec<ExecutionId>> {
        let Some(cutoff) = time::Duration::try_from(stalled_for)
            .ok()
            .and_then(|stalled_for| now_utc().checked_sub(stalled_for))
        else {
            return Ok(Vec::new());
        };
        let cutoff_raw = format_rfc3339(cutoff)?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT execution_id FROM workflow_executions
                 WHERE status = 'running' AND claimed_at < ?1
                 ORDER BY claimed_at ASC, execution_id ASC
                 LIMIT ?2",
            )
            .storage("failed to prepare stalled execution query")?;
        let rows = stmt
            .query_map(params![cutoff_raw, i64::from(limit)], |row| {
                parse_ulid_column(row, 0).map(ExecutionId)
            })
            .storage("failed to list stalled executions")?;
        collect_rows(rows)
    }
}

fn select_execution(conn: &Connection, execution_id: ExecutionId) -> StoreResult<Option<Execution>> {
    let query = format!(
        "SELECT {EXECUTION_COLUMNS} FROM workflow_executions e WHERE e.execution_id = ?1"
    );
    conn.query_row(&query, params![execution_id.to_string()], parse_execution_row)
        .optional()
        .storage("failed to load execution")
}

fn select_owned_execution(
    conn: &Connection,
    user_id: &UserId,
    execution_id: ExecutionId,
) -> StoreResult<Execution> {
    let query = format!(
        "SELECT {EXECUTION_COLUMNS}
         FROM workflow_executions e
         JOIN workflows w ON w.workflow_id = e.workflow_id
         WHERE e.execution_id = ?1 AND w.user_id = ?2"
    );
    conn.query_row(
        &query,
        params![execution_id.to_string(), user_id.as_str()],
        parse_execution_row,
    )
    .optional()
    .storage("failed to load execution")?
    .ok_or_else(|| MarketError::NotFound(format!("execution {execution_id}")))
}

fn reselect(conn: &Connection, execution_id: ExecutionId) -> StoreResult<Execution> {
    select_execution(conn, execution_id)?
        .ok_or_else(|| MarketError::Internal(format!("execution {execution_id} vanished")))
}

fn parse_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        execution_id: ExecutionId(parse_ulid_column(row, 0)?),
        workflow_id: WorkflowId(parse_ulid_column(row, 1)?),
        user_id: parse_user_column(row, 2)?,
        status: parse_enum_column(row, 3, "execution status", ExecutionStatus::parse)?,
        started_at: parse_time_column(row, 4)?,
        completed_at: parse_optional_time_column(row, 5)?,
        duration_ms: row.get(6)?,
        input_data: parse_json_column(row, 7)?,
        output_data: parse_optional_json_column(row, 8)?,
        error_message: row.get(9)?,
        logs: row.get(10)?,
        charged_points: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::StoreConfig;
    use proptest::prelude::*;
    use serde_json::json;

    fn charged_store(cost: i64) -> SqliteMarketStore {
        fixture_store_with(StoreConfig {
            execution_cost_points: cost,
            ..StoreConfig::default()
        })
    }

    #[test]
    fn start_requires_owned_active_workflow() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let bob = fixture_user(&mut store, "bob", 0);
        let draft = fixture_workflow(&mut store, &alice, WorkflowStatus::Draft);
        let active = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);

        for (workflow_id, user) in [
            (draft.workflow_id, &alice),
            (active.workflow_id, &bob),
            (WorkflowId::new(), &alice),
        ] {
            assert_eq!(
                must_err(store.start_execution(workflow_id, user, json!({}))),
                MarketError::WorkflowNotActive
            );
        }
        assert!(must(store.list_pending_executions(10)).is_empty());
    }

    #[test]
    fn start_bumps_run_count_with_each_row() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);

        let first = must(store.start_execution(workflow.workflow_id, &alice, json!({"n": 1})));
        let _ = must(store.start_execution(workflow.workflow_id, &alice, json!({"n": 2})));

        assert_eq!(first.status, ExecutionStatus::Pending);
        assert_eq!(first.input_data, json!({"n": 1}));
        let reloaded = must(store.get_workflow(&alice, workflow.workflow_id));
        assert_eq!(reloaded.run_count, 2);
        assert!(reloaded.last_run_at.is_some());
        let rows = must(store.list_executions(&alice, Some(workflow.workflow_id), None, Page::default()));
        assert_eq!(rows.len(), 2);
        assert_eq!(must(store.list_pending_executions(10)).len(), 2);
    }

    #[test]
    fn stalled_listing_only_returns_old_running_claims() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let claimed = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
        let waiting = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
        let _ = must(store.mark_running(claimed.execution_id));
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(
            must(store.list_stalled_executions(Duration::ZERO, 10)),
            vec![claimed.execution_id]
        );
        assert!(must(store.list_stalled_executions(Duration::from_secs(3600), 10)).is_empty());
        assert!(must(store.list_stalled_executions(Duration::MAX, 10)).is_empty());

        let _ = must(store.complete_execution(
            claimed.execution_id,
            &ExecutionReport::failed("worker gone"),
        ));
        assert!(must(store.list_stalled_executions(Duration::ZERO, 10)).is_empty());
        assert_eq!(must(store.list_pending_executions(10)), vec![waiting.execution_id]);
    }

    #[test]
    fn complete_records_output_and_duration() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));

        let running = must(store.mark_running(execution.execution_id));
        assert_eq!(running.status, ExecutionStatus::Running);
        assert!(matches!(
            store.mark_running(execution.execution_id),
            Err(MarketError::InvalidTransition { .. })
        ));

        let done = must(store.complete_execution(
            execution.execution_id,
            &ExecutionReport::success(json!({"result": "ok"}), "finished"),
        ));
        assert_eq!(done.status, ExecutionStatus::Success);
        assert_eq!(done.output_data, Some(json!({"result": "ok"})));
        assert_eq!(done.logs.as_deref(), Some("finished"));
        assert!(done.completed_at.is_some());
        assert!(done.duration_ms.is_some_and(|ms| ms >= 0));
    }

    #[test]
    fn completion_report_must_be_terminal_outcome() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));

        let mut report = ExecutionReport::failed("boom");
        report.status = ExecutionStatus::Cancelled;
        assert!(matches!(
            store.complete_execution(execution.execution_id, &report),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn cancel_then_late_success_stays_cancelled() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));

        let cancelled = must(store.cancel_execution(execution.execution_id, &alice));
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert_eq!(cancelled.logs.as_deref(), Some(CANCEL_LOG));

        let err = must_err(store.complete_execution(
            execution.execution_id,
            &ExecutionReport::success(json!({}), "late"),
        ));
        assert!(matches!(err, MarketError::InvalidTransition { .. }));

        let reloaded = must(store.get_execution(&alice, execution.execution_id));
        assert_eq!(reloaded.status, ExecutionStatus::Cancelled);
        assert_eq!(reloaded.completed_at, cancelled.completed_at);
        assert_eq!(reloaded.output_data, None);
    }

    #[test]
    fn cancel_of_settled_execution_reports_current_state() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
        let _ = must(store.complete_execution(execution.execution_id, &ExecutionReport::failed("boom")));

        assert_eq!(
            must_err(store.cancel_execution(execution.execution_id, &alice)),
            MarketError::InvalidCancelState(ExecutionStatus::Failed)
        );
    }

    #[test]
    fn cancel_by_another_user_looks_missing() {
        let mut store = fixture_store();
        let alice = fixture_user(&mut store, "alice", 0);
        let bob = fixture_user(&mut store, "bob", 0);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));

        assert!(matches!(
            store.cancel_execution(execution.execution_id, &bob),
            Err(MarketError::NotFound(_))
        ));
        assert_eq!(
            must(store.get_execution_by_id(execution.execution_id)).status,
            ExecutionStatus::Pending
        );
        assert!(must(store.list_executions(&bob, None, None, Page::default())).is_empty());
    }

    #[test]
    fn charged_start_debits_and_pending_cancel_refunds() {
        let mut store = charged_store(5);
        let alice = fixture_user(&mut store, "alice", 12);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);

        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
        assert_eq!(execution.charged_points, 5);
        assert_eq!(must(store.balance(&alice)), 7);

        let _ = must(store.cancel_execution(execution.execution_id, &alice));
        assert_eq!(must(store.balance(&alice)), 12);
        let refunds = must(store.list_ledger_entries(&alice, Some(LedgerEntryType::Refund), Page::default()));
        assert_eq!(refunds.len(), 1);
        assert_eq!(refunds[0].related_id, Some(execution.execution_id.to_string()));
        assert!(must(store.audit_ledger(&alice)).consistent);
    }

    #[test]
    fn running_cancel_keeps_the_charge() {
        let mut store = charged_store(5);
        let alice = fixture_user(&mut store, "alice", 10);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
        let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
        let _ = must(store.mark_running(execution.execution_id));

        let _ = must(store.cancel_execution(execution.execution_id, &alice));
        assert_eq!(must(store.balance(&alice)), 5);
    }

    #[test]
    fn insufficient_funds_blocks_start_without_a_row() {
        let mut store = charged_store(5);
        let alice = fixture_user(&mut store, "alice", 4);
        let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);

        let err = must_err(store.start_execution(workflow.workflow_id, &alice, json!({})));
        assert!(matches!(err, MarketError::InsufficientFunds { balance: 4, requested: 5 }));
        assert!(must(store.list_executions(&alice, None, None, Page::default())).is_empty());
        assert_eq!(must(store.get_workflow(&alice, workflow.workflow_id)).run_count, 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Action {
        Claim,
        Succeed,
        Fail,
        Cancel,
    }

    fn action_strategy() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Claim),
            Just(Action::Succeed),
            Just(Action::Fail),
            Just(Action::Cancel),
        ]
    }

    proptest! {
        #[test]
        fn prop_terminal_state_is_never_overwritten(actions in prop::collection::vec(action_strategy(), 1..12)) {
            let mut store = fixture_store();
            let alice = fixture_user(&mut store, "alice", 0);
            let workflow = fixture_workflow(&mut store, &alice, WorkflowStatus::Active);
            let execution = must(store.start_execution(workflow.workflow_id, &alice, json!({})));
            let id = execution.execution_id;

            let mut settled: Option<Execution> = None;
            for action in actions {
                let result = match action {
                    Action::Claim => store.mark_running(id),
                    Action::Succeed => store.complete_execution(id, &ExecutionReport::success(json!({}), "ok")),
                    Action::Fail => store.complete_execution(id, &ExecutionReport::failed("boom")),
                    Action::Cancel => store.cancel_execution(id, &alice),
                };
                let current = must(store.get_execution_by_id(id));
                if let Some(terminal) = &settled {
                    prop_assert!(result.is_err());
                    prop_assert_eq!(current.status, terminal.status);
                    prop_assert_eq!(current.completed_at, terminal.completed_at);
                } else if !current.status.is_open() {
                    settled = Some(current);
                }
            }
        }
    }
}
