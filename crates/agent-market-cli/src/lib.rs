//! Command surface for the marketplace points engine.
//!
//! Embedders can drive it through:
//! - [`run_cli`] for a fully parsed command line.
//! - [`run_market_with_db`] for a [`MarketCommand`] against a database path.
//! - [`run_market`] for a [`MarketCommand`] against an open [`SqliteMarketStore`].
//!
//! Every command prints one pretty JSON document on stdout. Failures are
//! rendered by [`error_payload`] so callers can branch on a stable `code`.

use std::path::{Path, PathBuf};

use agent_market_core::{
    parse_json_document, payment_url, AgentId, AgentInput, EntryId, ExecutionId, ExecutionReport,
    ExecutionStatus, LedgerEntryType, LedgerMutation, MarketError, OrderId, OrderStatus, Page,
    PaymentMethod, PaymentNotice, RechargeRequest, UserId, WorkflowId, WorkflowInput,
    WorkflowStatus, RECHARGE_PACKAGES,
};
use agent_market_store_sqlite::{SqliteMarketStore, StoreConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "am")]
#[command(about = "Agent marketplace points ledger CLI")]
pub struct Cli {
    #[arg(long, env = "AGENT_MARKET_DB", default_value = "./agent_market.sqlite3")]
    db: PathBuf,

    /// Points debited per execution start; 0 disables charging.
    #[arg(long, env = "AGENT_MARKET_EXECUTION_COST", default_value_t = 0)]
    execution_cost: i64,

    #[arg(long, env = "AGENT_MARKET_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    busy_timeout_ms: u64,

    #[command(subcommand)]
    command: MarketCommand,
}

impl Cli {
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            busy_timeout_ms: self.busy_timeout_ms,
            execution_cost_points: self.execution_cost,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum MarketCommand {
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
    Agent {
        #[command(subcommand)]
        command: Box<AgentCommand>,
    },
    Workflow {
        #[command(subcommand)]
        command: Box<WorkflowCommand>,
    },
    /// Buy a public agent and receive an active workflow copy.
    Purchase(PurchaseArgs),
    Recharge {
        #[command(subcommand)]
        command: Box<RechargeCommand>,
    },
    Execution {
        #[command(subcommand)]
        command: Box<ExecutionCommand>,
    },
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    user: String,
}

#[derive(Debug, Args)]
pub struct PageArgs {
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    offset: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(UserArgs),
    Balance(UserArgs),
    /// Replay the ledger and compare it with the live balance.
    Audit(UserArgs),
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    List(LedgerListArgs),
    Show(LedgerShowArgs),
    /// Apply a manual adjustment through the balance guard.
    Apply(LedgerApplyArgs),
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    entry_type: Option<EntryTypeArg>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct LedgerShowArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    entry_id: String,
}

#[derive(Debug, Args)]
pub struct LedgerApplyArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    entry_type: EntryTypeArg,
    #[arg(long, allow_hyphen_values = true)]
    amount: i64,
    #[arg(long)]
    description: String,
    #[arg(long)]
    related_id: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommand {
    Create(AgentCreateArgs),
    Show(AgentIdArgs),
    /// Public catalog, most purchased first.
    List(PageArgs),
    Visibility(AgentVisibilityArgs),
}

#[derive(Debug, Args)]
pub struct AgentCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    definition_json: String,
    #[arg(long)]
    price: i64,
    #[arg(long)]
    private: bool,
}

#[derive(Debug, Args)]
pub struct AgentIdArgs {
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Args)]
pub struct AgentVisibilityArgs {
    #[arg(long)]
    agent_id: String,
    #[arg(long, action = clap::ArgAction::Set)]
    public: bool,
}

#[derive(Debug, Subcommand)]
pub enum WorkflowCommand {
    Create(WorkflowCreateArgs),
    Show(WorkflowIdArgs),
    List(WorkflowListArgs),
    /// Workflows obtained by purchasing an agent.
    Purchases(WorkflowPurchasesArgs),
    Status(WorkflowStatusArgs),
    Definition(WorkflowDefinitionArgs),
    Delete(WorkflowIdArgs),
}

#[derive(Debug, Args)]
pub struct WorkflowCreateArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    description: String,
    #[arg(long)]
    definition_json: String,
    #[arg(long, value_enum, default_value_t = WorkflowStatusArg::Draft)]
    status: WorkflowStatusArg,
}

#[derive(Debug, Args)]
pub struct WorkflowIdArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    workflow_id: String,
}

#[derive(Debug, Args)]
pub struct WorkflowListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    status: Option<WorkflowStatusArg>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct WorkflowPurchasesArgs {
    #[arg(long)]
    user: String,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct WorkflowStatusArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    workflow_id: String,
    #[arg(long)]
    status: WorkflowStatusArg,
}

#[derive(Debug, Args)]
pub struct WorkflowDefinitionArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    workflow_id: String,
    #[arg(long)]
    definition_json: String,
}

#[derive(Debug, Args)]
pub struct PurchaseArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    agent_id: String,
}

#[derive(Debug, Subcommand)]
pub enum RechargeCommand {
    /// List the fixed recharge packages.
    Packages,
    Create(RechargeCreateArgs),
    /// Apply a payment notice; safe to repeat.
    Confirm(RechargeConfirmArgs),
    Show(RechargeShowArgs),
    List(RechargeListArgs),
}

#[derive(Debug, Args)]
pub struct RechargeCreateArgs {
    #[arg(long)]
    user: String,
    #[arg(long, conflicts_with_all = ["amount", "points"])]
    package: Option<u32>,
    #[arg(long, requires = "points")]
    amount: Option<i64>,
    #[arg(long, requires = "amount")]
    points: Option<i64>,
    #[arg(long)]
    method: PaymentMethodArg,
}

#[derive(Debug, Args)]
pub struct RechargeConfirmArgs {
    #[arg(long)]
    order_no: String,
    #[arg(long, default_value = "")]
    payment_id: String,
    /// Gateway status such as success, paid, failed or cancelled.
    #[arg(long)]
    status: String,
    #[arg(long)]
    amount: i64,
}

#[derive(Debug, Args)]
pub struct RechargeShowArgs {
    #[arg(long)]
    user: Option<String>,
    #[arg(long, conflicts_with = "order_no", requires = "user")]
    order_id: Option<String>,
    #[arg(long)]
    order_no: Option<String>,
}

#[derive(Debug, Args)]
pub struct RechargeListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    status: Option<OrderStatusArg>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Subcommand)]
pub enum ExecutionCommand {
    Start(ExecutionStartArgs),
    /// Claim a pending execution for a runner.
    Running(ExecutionIdArgs),
    Complete(ExecutionCompleteArgs),
    Cancel(ExecutionOwnedArgs),
    Show(ExecutionOwnedArgs),
    List(ExecutionListArgs),
    /// Pending execution ids, oldest first.
    Pending(ExecutionPendingArgs),
}

#[derive(Debug, Args)]
pub struct ExecutionStartArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    workflow_id: String,
    #[arg(long, default_value = "{}")]
    input_json: String,
}

#[derive(Debug, Args)]
pub struct ExecutionIdArgs {
    #[arg(long)]
    execution_id: String,
}

#[derive(Debug, Args)]
pub struct ExecutionOwnedArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    execution_id: String,
}

#[derive(Debug, Args)]
pub struct ExecutionCompleteArgs {
    #[arg(long)]
    execution_id: String,
    #[arg(long)]
    status: CompletionStatusArg,
    #[arg(long)]
    output_json: Option<String>,
    #[arg(long)]
    error_message: Option<String>,
    #[arg(long)]
    logs: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExecutionListArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    workflow_id: Option<String>,
    #[arg(long)]
    status: Option<ExecutionStatusArg>,
    #[command(flatten)]
    page: PageArgs,
}

#[derive(Debug, Args)]
pub struct ExecutionPendingArgs {
    #[arg(long, default_value_t = 50)]
    limit: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EntryTypeArg {
    Recharge,
    Purchase,
    Execution,
    Refund,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WorkflowStatusArg {
    Draft,
    Active,
    Inactive,
    Archived,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OrderStatusArg {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExecutionStatusArg {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CompletionStatusArg {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PaymentMethodArg {
    Alipay,
    Wechat,
    Union,
    Paypal,
}

/// Executes the parsed top-level command line.
///
/// # Errors
/// Returns an error when configuration, migration, or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = cli.store_config();
    run_market_with_db(&cli.db, config, cli.command)
}

/// Executes `command` against the database at `db_path`, migrating it first.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails.
pub fn run_market_with_db(db_path: &Path, config: StoreConfig, command: MarketCommand) -> Result<()> {
    if matches!(
        &command,
        MarketCommand::Recharge { command } if matches!(**command, RechargeCommand::Packages)
    ) {
        return emit(&RECHARGE_PACKAGES);
    }

    let mut store = SqliteMarketStore::open_with_config(db_path, config)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    store.migrate()?;
    debug!(db = %db_path.display(), "market store ready");
    run_market(command, &mut store)
}

/// Executes `command` against an open store.
///
/// # Errors
/// Returns an error when argument parsing or the store operation fails.
pub fn run_market(command: MarketCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        MarketCommand::User { command } => run_user(*command, store),
        MarketCommand::Ledger { command } => run_ledger(*command, store),
        MarketCommand::Agent { command } => run_agent(*command, store),
        MarketCommand::Workflow { command } => run_workflow(*command, store),
        MarketCommand::Purchase(args) => {
            let workflow =
                store.purchase_agent(&parse_user(&args.user)?, parse_agent_id(&args.agent_id)?)?;
            emit(&workflow)
        }
        MarketCommand::Recharge { command } => run_recharge(*command, store),
        MarketCommand::Execution { command } => run_execution(*command, store),
    }
}

fn run_user(command: UserCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        UserCommand::Register(args) => emit(&store.register_user(&parse_user(&args.user)?)?),
        UserCommand::Balance(args) => {
            let user_id = parse_user(&args.user)?;
            let balance = store.balance(&user_id)?;
            emit(&json!({ "user_id": user_id, "points": balance }))
        }
        UserCommand::Audit(args) => emit(&store.audit_ledger(&parse_user(&args.user)?)?),
    }
}

fn run_ledger(command: LedgerCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        LedgerCommand::List(args) => {
            let entries = store.list_ledger_entries(
                &parse_user(&args.user)?,
                args.entry_type.map(map_entry_type),
                parse_page(&args.page)?,
            )?;
            emit(&entries)
        }
        LedgerCommand::Show(args) => {
            let entry =
                store.get_ledger_entry(&parse_user(&args.user)?, EntryId::parse(&args.entry_id)?)?;
            emit(&entry)
        }
        LedgerCommand::Apply(args) => {
            let entry = store.apply_ledger_mutation(&LedgerMutation {
                user_id: parse_user(&args.user)?,
                entry_type: map_entry_type(args.entry_type),
                amount: args.amount,
                description: args.description,
                related_id: args.related_id,
            })?;
            emit(&entry)
        }
    }
}

fn run_agent(command: AgentCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        AgentCommand::Create(args) => {
            let agent = store.create_agent(&AgentInput {
                name: args.name,
                description: args.description,
                definition: parse_json_document(&args.definition_json)?,
                price: args.price,
                is_public: !args.private,
            })?;
            emit(&agent)
        }
        AgentCommand::Show(args) => emit(&store.get_agent(parse_agent_id(&args.agent_id)?)?),
        AgentCommand::List(page) => emit(&store.list_public_agents(parse_page(&page)?)?),
        AgentCommand::Visibility(args) => {
            let agent = store.set_agent_visibility(parse_agent_id(&args.agent_id)?, args.public)?;
            emit(&agent)
        }
    }
}

fn run_workflow(command: WorkflowCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        WorkflowCommand::Create(args) => {
            let workflow = store.create_workflow(
                &parse_user(&args.user)?,
                &WorkflowInput {
                    name: args.name,
                    description: args.description,
                    definition: parse_json_document(&args.definition_json)?,
                    status: map_workflow_status(args.status),
                },
            )?;
            emit(&workflow)
        }
        WorkflowCommand::Show(args) => {
            let workflow = store
                .get_workflow(&parse_user(&args.user)?, parse_workflow_id(&args.workflow_id)?)?;
            emit(&workflow)
        }
        WorkflowCommand::List(args) => {
            let workflows = store.list_workflows(
                &parse_user(&args.user)?,
                args.status.map(map_workflow_status),
                parse_page(&args.page)?,
            )?;
            emit(&workflows)
        }
        WorkflowCommand::Purchases(args) => {
            let workflows =
                store.list_purchases(&parse_user(&args.user)?, parse_page(&args.page)?)?;
            emit(&workflows)
        }
        WorkflowCommand::Status(args) => {
            let workflow = store.set_workflow_status(
                &parse_user(&args.user)?,
                parse_workflow_id(&args.workflow_id)?,
                map_workflow_status(args.status),
            )?;
            emit(&workflow)
        }
        WorkflowCommand::Definition(args) => {
            let workflow = store.update_workflow_definition(
                &parse_user(&args.user)?,
                parse_workflow_id(&args.workflow_id)?,
                &parse_json_document(&args.definition_json)?,
            )?;
            emit(&workflow)
        }
        WorkflowCommand::Delete(args) => {
            let deletion = store
                .delete_workflow(&parse_user(&args.user)?, parse_workflow_id(&args.workflow_id)?)?;
            emit(&deletion)
        }
    }
}

fn run_recharge(command: RechargeCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        RechargeCommand::Packages => emit(&RECHARGE_PACKAGES),
        RechargeCommand::Create(args) => {
            let request = match (args.package, args.amount, args.points) {
                (Some(package), None, None) => RechargeRequest::Package(package),
                (None, Some(amount), Some(points)) => RechargeRequest::Custom { amount, points },
                _ => {
                    return Err(MarketError::Validation(
                        "either --package or both --amount and --points MUST be provided"
                            .to_string(),
                    )
                    .into())
                }
            };
            let order = store.create_order(
                &parse_user(&args.user)?,
                request,
                map_payment_method(args.method),
            )?;
            let url = payment_url(&order);
            emit(&json!({ "order": order, "payment_url": url }))
        }
        RechargeCommand::Confirm(args) => {
            let order = store.confirm_payment(&PaymentNotice {
                order_no: args.order_no,
                payment_id: args.payment_id,
                status: args.status,
                amount: args.amount,
            })?;
            emit(&order)
        }
        RechargeCommand::Show(args) => match (args.order_no, args.order_id, args.user) {
            (Some(order_no), None, _) => emit(&store.get_order_by_no(&order_no)?),
            (None, Some(order_id), Some(user)) => {
                let order_id = OrderId::parse(&order_id)?;
                emit(&store.get_order(&parse_user(&user)?, order_id)?)
            }
            _ => Err(MarketError::Validation(
                "either --order-no or --user with --order-id MUST be provided".to_string(),
            )
            .into()),
        },
        RechargeCommand::List(args) => {
            let orders = store.list_orders(
                &parse_user(&args.user)?,
                args.status.map(map_order_status),
                parse_page(&args.page)?,
            )?;
            emit(&orders)
        }
    }
}

fn run_execution(command: ExecutionCommand, store: &mut SqliteMarketStore) -> Result<()> {
    match command {
        ExecutionCommand::Start(args) => {
            let execution = store.start_execution(
                parse_workflow_id(&args.workflow_id)?,
                &parse_user(&args.user)?,
                parse_json_document(&args.input_json)?,
            )?;
            emit(&execution)
        }
        ExecutionCommand::Running(args) => {
            emit(&store.mark_running(parse_execution_id(&args.execution_id)?)?)
        }
        ExecutionCommand::Complete(args) => {
            let report = ExecutionReport {
                status: match args.status {
                    CompletionStatusArg::Success => ExecutionStatus::Success,
                    CompletionStatusArg::Failed => ExecutionStatus::Failed,
                },
                output_data: args
                    .output_json
                    .as_deref()
                    .map(parse_json_document)
                    .transpose()?,
                error_message: args.error_message,
                logs: args.logs,
            };
            let execution =
                store.complete_execution(parse_execution_id(&args.execution_id)?, &report)?;
            emit(&execution)
        }
        ExecutionCommand::Cancel(args) => {
            let execution = store.cancel_execution(
                parse_execution_id(&args.execution_id)?,
                &parse_user(&args.user)?,
            )?;
            emit(&execution)
        }
        ExecutionCommand::Show(args) => {
            let execution = store.get_execution(
                &parse_user(&args.user)?,
                parse_execution_id(&args.execution_id)?,
            )?;
            emit(&execution)
        }
        ExecutionCommand::List(args) => {
            let workflow_id = args
                .workflow_id
                .as_deref()
                .map(parse_workflow_id)
                .transpose()?;
            let executions = store.list_executions(
                &parse_user(&args.user)?,
                workflow_id,
                args.status.map(map_execution_status),
                parse_page(&args.page)?,
            )?;
            emit(&executions)
        }
        ExecutionCommand::Pending(args) => emit(&store.list_pending_executions(args.limit)?),
    }
}

/// Renders a command failure as a JSON document with a stable `code`.
///
/// Marketplace errors carry their own code and kind; anything else is
/// reported as `internal_error`.
#[must_use]
pub fn error_payload(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<MarketError>() {
        Some(market) => json!({
            "error": {
                "code": market.code(),
                "kind": market.kind(),
                "retry_safe": market.is_retry_safe(),
                "message": format!("{err:#}"),
            }
        }),
        None => json!({
            "error": {
                "code": "internal_error",
                "kind": "internal",
                "retry_safe": false,
                "message": format!("{err:#}"),
            }
        }),
    }
}

fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_user(raw: &str) -> Result<UserId> {
    Ok(UserId::parse(raw)?)
}

fn parse_agent_id(raw: &str) -> Result<AgentId> {
    Ok(AgentId::parse(raw)?)
}

fn parse_workflow_id(raw: &str) -> Result<WorkflowId> {
    Ok(WorkflowId::parse(raw)?)
}

fn parse_execution_id(raw: &str) -> Result<ExecutionId> {
    Ok(ExecutionId::parse(raw)?)
}

fn parse_page(args: &PageArgs) -> Result<Page> {
    Ok(Page::new(args.limit, args.offset)?)
}

fn map_entry_type(value: EntryTypeArg) -> LedgerEntryType {
    match value {
        EntryTypeArg::Recharge => LedgerEntryType::Recharge,
        EntryTypeArg::Purchase => LedgerEntryType::Purchase,
        EntryTypeArg::Execution => LedgerEntryType::Execution,
        EntryTypeArg::Refund => LedgerEntryType::Refund,
    }
}

fn map_workflow_status(value: WorkflowStatusArg) -> WorkflowStatus {
    match value {
        WorkflowStatusArg::Draft => WorkflowStatus::Draft,
        WorkflowStatusArg::Active => WorkflowStatus::Active,
        WorkflowStatusArg::Inactive => WorkflowStatus::Inactive,
        WorkflowStatusArg::Archived => WorkflowStatus::Archived,
    }
}

fn map_order_status(value: OrderStatusArg) -> OrderStatus {
    match value {
        OrderStatusArg::Pending => OrderStatus::Pending,
        OrderStatusArg::Paid => OrderStatus::Paid,
        OrderStatusArg::Cancelled => OrderStatus::Cancelled,
        OrderStatusArg::Refunded => OrderStatus::Refunded,
    }
}

fn map_execution_status(value: ExecutionStatusArg) -> ExecutionStatus {
    match value {
        ExecutionStatusArg::Pending => ExecutionStatus::Pending,
        ExecutionStatusArg::Running => ExecutionStatus::Running,
        ExecutionStatusArg::Success => ExecutionStatus::Success,
        ExecutionStatusArg::Failed => ExecutionStatus::Failed,
        ExecutionStatusArg::Cancelled => ExecutionStatus::Cancelled,
    }
}

fn map_payment_method(value: PaymentMethodArg) -> PaymentMethod {
    match value {
        PaymentMethodArg::Alipay => PaymentMethod::Alipay,
        PaymentMethodArg::Wechat => PaymentMethod::Wechat,
        PaymentMethodArg::Union => PaymentMethod::Union,
        PaymentMethodArg::Paypal => PaymentMethod::Paypal,
    }
}
