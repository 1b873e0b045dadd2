//! Agent templates and user-owned workflows.

use agent_market_core::{
    format_rfc3339, now_utc, validate_definition, Agent, AgentId, AgentInput, Lifecycle,
    MarketError, Page, UserId, Workflow, WorkflowId, WorkflowInput, WorkflowStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::{
    bool_to_sql, collect_rows, ensure_account_exists, parse_enum_column, parse_json_column,
    parse_optional_time_column, parse_optional_ulid_column, parse_time_column,
    parse_ulid_column, parse_user_column, to_json_text, SqliteMarketStore, StorageContext,
    StoreResult,
};

const AGENT_COLUMNS: &str = "agent_id, name, description, definition_json, price,
     purchase_count, is_public, created_at, updated_at";

const WORKFLOW_COLUMNS: &str = "workflow_id, user_id, agent_id, name, description,
     definition_json, status, run_count, last_run_at, purchased_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowDeletion {
    pub workflow_id: WorkflowId,
    pub executions_deleted: usize,
}

impl SqliteMarketStore {
    pub fn create_agent(&mut self, input: &AgentInput) -> StoreResult<Agent> {
        input.validate()?;
        let now = now_utc();
        let now_raw = format_rfc3339(now)?;
        let agent = Agent {
            agent_id: AgentId::new(),
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            definition: input.definition.clone(),
            price: input.price,
            purchase_count: 0,
            is_public: input.is_public,
            created_at: now,
            updated_at: now,
        };

        self.conn
            .execute(
                "INSERT INTO agents(
                    agent_id, name, description, definition_json, price,
                    purchase_count, is_public, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?7)",
                params![
                    agent.agent_id.to_string(),
                    agent.name,
                    agent.description,
                    to_json_text(&agent.definition)?,
                    agent.price,
                    bool_to_sql(agent.is_public),
                    now_raw,
                ],
            )
            .storage("failed to insert agent")?;

        info!(agent_id = %agent.agent_id, price = agent.price, is_public = agent.is_public, "agent created");
        Ok(agent)
    }

    pub fn get_agent(&self, agent_id: AgentId) -> StoreResult<Agent> {
        select_agent(&self.conn, agent_id)?
            .ok_or_else(|| MarketError::NotFound(format!("agent {agent_id}")))
    }

    /// Public catalog, most purchased first.
    pub fn list_public_agents(&self, page: Page) -> StoreResult<Vec<Agent>> {
        let query = format!(
            "SELECT {AGENT_COLUMNS}
             FROM agents
             WHERE is_public = 1
             ORDER BY purchase_count DESC, created_at DESC, agent_id ASC
             LIMIT ?1 OFFSET ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare agent listing")?;
        let rows = stmt
            .query_map(
                params![i64::from(page.limit), i64::from(page.offset)],
                parse_agent_row,
            )
            .storage("failed to list agents")?;
        collect_rows(rows)
    }

    pub fn set_agent_visibility(&mut self, agent_id: AgentId, is_public: bool) -> StoreResult<Agent> {
        let now = format_rfc3339(now_utc())?;
        let updated = self
            .conn
            .execute(
                "UPDATE agents SET is_public = ?2, updated_at = ?3 WHERE agent_id = ?1",
                params![agent_id.to_string(), bool_to_sql(is_public), now],
            )
            .storage("failed to update agent visibility")?;
        if updated == 0 {
            return Err(MarketError::NotFound(format!("agent {agent_id}")));
        }
        self.get_agent(agent_id)
    }

    /// Creates a workflow authored from scratch (no source agent).
    pub fn create_workflow(&mut self, user_id: &UserId, input: &WorkflowInput) -> StoreResult<Workflow> {
        input.validate()?;
        let now = now_utc();
        let workflow = Workflow {
            workflow_id: WorkflowId::new(),
            user_id: user_id.clone(),
            agent_id: None,
            name: input.name.trim().to_string(),
            description: input.description.clone(),
            definition: input.definition.clone(),
            status: input.status,
            run_count: 0,
            last_run_at: None,
            purchased_at: None,
            created_at: now,
            updated_at: now,
        };

        let tx = self.begin_write()?;
        ensure_account_exists(&tx, user_id)?;
        insert_workflow(&tx, &workflow)?.storage("failed to insert workflow")?;
        tx.commit().storage("failed to commit workflow creation")?;

        info!(workflow_id = %workflow.workflow_id, user_id = %user_id, status = %workflow.status, "workflow created");
        Ok(workflow)
    }

    pub fn get_workflow(&self, user_id: &UserId, workflow_id: WorkflowId) -> StoreResult<Workflow> {
        select_owned_workflow(&self.conn, user_id, workflow_id)
    }

    pub fn list_workflows(
        &self,
        user_id: &UserId,
        status: Option<WorkflowStatus>,
        page: Page,
    ) -> StoreResult<Vec<Workflow>> {
        let query = format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflows
             WHERE user_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, workflow_id DESC
             LIMIT ?3 OFFSET ?4"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare workflow listing")?;
        let rows = stmt
            .query_map(
                params![
                    user_id.as_str(),
                    status.map(WorkflowStatus::as_str),
                    i64::from(page.limit),
                    i64::from(page.offset)
                ],
                parse_workflow_row,
            )
            .storage("failed to list workflows")?;
        collect_rows(rows)
    }

    /// Workflows that came from a purchase, most recent purchase first.
    pub fn list_purchases(&self, user_id: &UserId, page: Page) -> StoreResult<Vec<Workflow>> {
        let query = format!(
            "SELECT {WORKFLOW_COLUMNS}
             FROM workflows
             WHERE user_id = ?1 AND agent_id IS NOT NULL
             ORDER BY purchased_at DESC, workflow_id DESC
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .storage("failed to prepare purchase listing")?;
        let rows = stmt
            .query_map(
                params![user_id.as_str(), i64::from(page.limit), i64::from(page.offset)],
                parse_workflow_row,
            )
            .storage("failed to list purchases")?;
        collect_rows(rows)
    }

    /// Replaces the workflow's own copy of its definition.
    pub fn update_workflow_definition(
        &mut self,
        user_id: &UserId,
        workflow_id: WorkflowId,
        definition: &Value,
    ) -> StoreResult<Workflow> {
        validate_definition(definition)?;
        let now = format_rfc3339(now_utc())?;
        let tx = self.begin_write()?;
        let current = select_owned_workflow(&tx, user_id, workflow_id)?;
        if current.status == WorkflowStatus::Archived {
            return Err(MarketError::Validation(
                "archived workflows are read-only".to_string(),
            ));
        }
        tx.execute(
            "UPDATE workflows SET definition_json = ?2, updated_at = ?3 WHERE workflow_id = ?1",
            params![workflow_id.to_string(), to_json_text(definition)?, now],
        )
        .storage("failed to update workflow definition")?;
        let updated = select_owned_workflow(&tx, user_id, workflow_id)?;
        tx.commit().storage("failed to commit workflow definition")?;
        Ok(updated)
    }

    pub fn set_workflow_status(
        &mut self,
        user_id: &UserId,
        workflow_id: WorkflowId,
        status: WorkflowStatus,
    ) -> StoreResult<Workflow> {
        let now = format_rfc3339(now_utc())?;
        let tx = self.begin_write()?;
        let current = select_owned_workflow(&tx, user_id, workflow_id)?;
        current.status.ensure_transition(status)?;
        tx.execute(
            "UPDATE workflows SET status = ?2, updated_at = ?3 WHERE workflow_id = ?1 AND status = ?4",
            params![
                workflow_id.to_string(),
                status.as_str(),
                now,
                current.status.as_str()
            ],
        )
        .storage("failed to update workflow status")?;
        let updated = select_owned_workflow(&tx, user_id, workflow_id)?;
        tx.commit().storage("failed to commit workflow status")?;

        info!(workflow_id = %workflow_id, from = %current.status, to = %status, "workflow status changed");
        Ok(updated)
    }

    /// Deletes a workflow together with its executions. Ledger rows that
    /// reference it are history and stay untouched.
    pub fn delete_workflow(
        &mut self,
        user_id: &UserId,
        workflow_id: WorkflowId,
    ) -> StoreResult<WorkflowDeletion> {
        let tx = self.begin_write()?;
        let _ = select_owned_workflow(&tx, user_id, workflow_id)?;
        let executions: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM workflow_executions WHERE workflow_id = ?1",
                params![workflow_id.to_string()],
                |row| row.get(0),
            )
            .storage("failed to count workflow executions")?;
        tx.execute(
            "DELETE FROM workflows WHERE workflow_id = ?1",
            params![workflow_id.to_string()],
        )
        .storage("failed to delete workflow")?;
        tx.commit().storage("failed to commit workflow deletion")?;

        let executions_deleted = usize::try_from(executions).unwrap_or_default();
        info!(workflow_id = %workflow_id, executions_deleted, "workflow deleted");
        Ok(WorkflowDeletion {
            workflow_id,
            executions_deleted,
        })
    }
}

pub(crate) fn select_agent(conn: &Connection, agent_id: AgentId) -> StoreResult<Option<Agent>> {
    let query = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1");
    conn.query_row(&query, params![agent_id.to_string()], parse_agent_row)
        .optional()
        .storage("failed to load agent")
}

pub(crate) fn select_workflow(
    conn: &Connection,
    workflow_id: WorkflowId,
) -> StoreResult<Option<Workflow>> {
    let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_id = ?1");
    conn.query_row(&query, params![workflow_id.to_string()], parse_workflow_row)
        .optional()
        .storage("failed to load workflow")
}

/// Workflows owned by someone else are reported exactly like missing ones.
pub(crate) fn select_owned_workflow(
    conn: &Connection,
    user_id: &UserId,
    workflow_id: WorkflowId,
) -> StoreResult<Workflow> {
    select_workflow(conn, workflow_id)?
        .filter(|workflow| &workflow.user_id == user_id)
        .ok_or_else(|| MarketError::NotFound(format!("workflow {workflow_id}")))
}

/// Returns the raw insert result so callers can classify constraint
/// violations themselves.
pub(crate) fn insert_workflow(
    conn: &Connection,
    workflow: &Workflow,
) -> StoreResult<rusqlite::Result<()>> {
    let definition = to_json_text(&workflow.definition)?;
    let last_run_at = workflow.last_run_at.map(format_rfc3339).transpose()?;
    let purchased_at = workflow.purchased_at.map(format_rfc3339).transpose()?;
    let created_at = format_rfc3339(workflow.created_at)?;
    let updated_at = format_rfc3339(workflow.updated_at)?;

    Ok(conn
        .execute(
            "INSERT INTO workflows(
                workflow_id, user_id, agent_id, name, description,
                definition_json, status, run_count, last_run_at, purchased_at,
                created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                workflow.workflow_id.to_string(),
                workflow.user_id.as_str(),
                workflow.agent_id.map(|agent_id| agent_id.to_string()),
                workflow.name,
                workflow.description,
                definition,
                workflow.status.as_str(),
                workflow.run_count,
                last_run_at,
                purchased_at,
                created_at,
                updated_at,
            ],
        )
        .map(|_| ()))
}

fn parse_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let is_public: i64 = row.get(6)?;
    Ok(Agent {
        agent_id: AgentId(parse_ulid_column(row, 0)?),
        name: row.get(1)?,
        description: row.get(2)?,
        definition: parse_json_column(row, 3)?,
        price: row.get(4)?,
        purchase_count: row.get(5)?,
        is_public: is_public == 1,
        created_at: parse_time_column(row, 7)?,
        updated_at: parse_time_column(row, 8)?,
    })
}

fn parse_workflow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workflow> {
    Ok(Workflow {
        workflow_id: WorkflowId(parse_ulid_column(row, 0)?),
        user_id: parse_user_column(row, 1)?,
        agent_id: parse_optional_ulid_column(row, 2)?.map(AgentId),
        name: row.get(3)?,
        description: row.get(4)?,
        definition: parse_json_column(row, 5)?,
        status: parse_enum_column(row, 6, "workflow status", WorkflowStatus::parse)?,
        run_count: row.get(7)?,
        last_run_at: parse_optional_time_column(row, 8)?,
        purchased_at: parse_optional_time_column(row, 9)?,
        created_at: parse_time_column(row, 10)?,
        updated_at: parse_time_column(row, 11)?,
    })
}
