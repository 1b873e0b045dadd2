//! Purchase Engine: agent template to owned workflow, paid from the ledger.

use agent_market_core::{
    format_rfc3339, now_utc, AgentId, LedgerEntryType, LedgerMutation, MarketError, UserId,
    Workflow, WorkflowId, WorkflowStatus,
};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use crate::catalog::{insert_workflow, select_agent};
use crate::ledger::apply_mutation_in_tx;
use crate::{ensure_account_exists, is_unique_violation, SqliteMarketStore, StorageContext, StoreResult};

impl SqliteMarketStore {
    /// Buys `agent_id` for `user_id`.
    ///
    /// Debit, workflow creation and the purchase-count increment share one
    /// immediate transaction; any failure rolls back all three. A free agent
    /// produces no ledger row since the ledger never records zero amounts.
    pub fn purchase_agent(&mut self, user_id: &UserId, agent_id: AgentId) -> StoreResult<Workflow> {
        let tx = self.begin_write()?;

        let agent = select_agent(&tx, agent_id)?
            .filter(|agent| agent.is_public)
            .ok_or(MarketError::AgentNotFoundOrPrivate)?;
        ensure_account_exists(&tx, user_id)?;

        let owned: Option<String> = tx
            .query_row(
                "SELECT workflow_id FROM workflows WHERE user_id = ?1 AND agent_id = ?2",
                params![user_id.as_str(), agent_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .storage("failed to check existing purchase")?;
        if owned.is_some() {
            return Err(MarketError::AlreadyPurchased);
        }

        let debit = if agent.price > 0 {
            Some(apply_mutation_in_tx(
                &tx,
                &LedgerMutation {
                    user_id: user_id.clone(),
                    entry_type: LedgerEntryType::Purchase,
                    amount: -agent.price,
                    description: format!("purchase: {}", agent.name),
                    related_id: Some(agent_id.to_string()),
                },
            )?)
        } else {
            None
        };

        let now = now_utc();
        let workflow = Workflow {
            workflow_id: WorkflowId::new(),
            user_id: user_id.clone(),
            agent_id: Some(agent_id),
            name: agent.name.clone(),
            description: agent.description.clone(),
            definition: agent.definition.clone(),
            status: WorkflowStatus::Active,
            run_count: 0,
            last_run_at: None,
            purchased_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        insert_workflow(&tx, &workflow)?.map_err(|err| {
            if is_unique_violation(&err) {
                MarketError::AlreadyPurchased
            } else {
                MarketError::Internal(format!("failed to insert purchased workflow: {err}"))
            }
        })?;

        let bumped = tx
            .execute(
                "UPDATE agents SET purchase_count = purchase_count + 1, updated_at = ?2
                 WHERE agent_id = ?1",
                params![agent_id.to_string(), format_rfc3339(now)?],
            )
            .storage("failed to increment purchase count")?;
        if bumped != 1 {
            return Err(MarketError::Internal(format!(
                "purchase count update touched {bumped} rows for agent {agent_id}"
            )));
        }

        tx.commit().storage("failed to commit purchase")?;

        info!(
            user_id = %user_id,
            agent_id = %agent_id,
            workflow_id = %workflow.workflow_id,
            price = agent.price,
            balance_after = debit.map(|entry| entry.balance_after),
            "agent purchased"
        );
        Ok(workflow)
    }
}
