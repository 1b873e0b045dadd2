//! Domain model for the agent marketplace points engine.
//!
//! Everything here is pure: identifiers, closed status enumerations with
//! their allowed-transition tables, validated inputs, the recharge package
//! catalog, payment-status normalization and ledger replay. Persistence lives
//! in `agent-market-store-sqlite`.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;
const MAX_USER_ID_LEN: usize = 64;
const MAX_NAME_LEN: usize = 200;
/// Largest magnitude a single ledger entry may move.
pub const MAX_LEDGER_AMOUNT: i64 = 1_000_000_000_000;
const STORAGE_TIMESTAMP_FORMAT: &str =
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z";
const PAYMENT_GATEWAY_URL: &str = "https://pay.example.invalid/pay";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum MarketError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },
    #[error("agent not found or not public")]
    AgentNotFoundOrPrivate,
    #[error("agent already purchased")]
    AlreadyPurchased,
    #[error("payment amount mismatch: expected {expected}, received {received}")]
    AmountMismatch { expected: i64, received: i64 },
    #[error("workflow is not active")]
    WorkflowNotActive,
    #[error("execution cannot be cancelled from status {0}")]
    InvalidCancelState(ExecutionStatus),
    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error class a transport layer maps to its own status codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientFunds,
    Conflict,
    Internal,
}

impl MarketError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::AmountMismatch { .. } => ErrorKind::Validation,
            Self::NotFound(_) | Self::AgentNotFoundOrPrivate => ErrorKind::NotFound,
            Self::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            Self::AlreadyPurchased
            | Self::WorkflowNotActive
            | Self::InvalidCancelState(_)
            | Self::InvalidTransition { .. } => ErrorKind::Conflict,
            Self::Integrity(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code for the error variant.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::AgentNotFoundOrPrivate => "agent_not_found_or_private",
            Self::AlreadyPurchased => "already_purchased",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::WorkflowNotActive => "workflow_not_active",
            Self::InvalidCancelState(_) => "invalid_cancel_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Integrity(_) => "integrity_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Only storage-level failures are safe to retry: every write is
    /// all-or-nothing, so a failed attempt leaves no partial effect.
    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parses a ULID string.
            ///
            /// # Errors
            /// Returns [`MarketError::Validation`] when `value` is not a ULID.
            pub fn parse(value: &str) -> Result<Self, MarketError> {
                Ulid::from_string(value.trim()).map(Self).map_err(|err| {
                    MarketError::Validation(format!("invalid {} `{value}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(AgentId, "agent_id");
ulid_id!(WorkflowId, "workflow_id");
ulid_id!(ExecutionId, "execution_id");
ulid_id!(OrderId, "order_id");
ulid_id!(
    /// Identifier of one immutable ledger row.
    EntryId,
    "entry_id"
);

/// Business identity supplied by the identity collaborator.
///
/// Accepted as given, but restricted to a conservative character set so it
/// can be logged and stored without escaping.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// # Errors
    /// Returns [`MarketError::Validation`] for empty, oversized or
    /// non `[A-Za-z0-9_-]` identifiers.
    pub fn parse(value: &str) -> Result<Self, MarketError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MarketError::Validation("user_id MUST be provided".to_string()));
        }
        if trimmed.len() > MAX_USER_ID_LEN {
            return Err(MarketError::Validation(format!(
                "user_id MUST be at most {MAX_USER_ID_LEN} characters"
            )));
        }
        if !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        {
            return Err(MarketError::Validation(format!(
                "user_id `{trimmed}` contains unsupported characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = MarketError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A closed status enumeration with an explicit allowed-transition table.
pub trait Lifecycle: Copy + Eq + Display + 'static {
    const ENTITY: &'static str;

    fn allowed_next(self) -> &'static [Self];

    fn can_transition_to(self, next: Self) -> bool {
        self.allowed_next().contains(&next)
    }

    fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// # Errors
    /// Returns [`MarketError::InvalidTransition`] when `next` is not in the
    /// table for `self`.
    fn ensure_transition(self, next: Self) -> Result<(), MarketError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(MarketError::InvalidTransition {
                entity: Self::ENTITY,
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Recharge,
    Purchase,
    Execution,
    Refund,
}

impl LedgerEntryType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recharge => "recharge",
            Self::Purchase => "purchase",
            Self::Execution => "execution",
            Self::Refund => "refund",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "recharge" => Some(Self::Recharge),
            "purchase" => Some(Self::Purchase),
            "execution" => Some(Self::Execution),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Credits add points; debits remove them.
    #[must_use]
    pub fn is_credit(self) -> bool {
        matches!(self, Self::Recharge | Self::Refund)
    }
}

impl Display for LedgerEntryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Inactive,
    Archived,
}

impl WorkflowStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Archived => "archived",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

impl Display for WorkflowStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for WorkflowStatus {
    const ENTITY: &'static str = "workflow";

    fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Draft => &[Self::Active, Self::Archived],
            Self::Active => &[Self::Inactive, Self::Archived],
            Self::Inactive => &[Self::Active, Self::Archived],
            Self::Archived => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Paid,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
            Self::Refunded => "refunded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "cancelled" => Some(Self::Cancelled),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

impl Display for OrderStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for OrderStatus {
    const ENTITY: &'static str = "recharge_order";

    // `refunded` is representable for imported history but no operation
    // reaches it.
    fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Paid, Self::Cancelled],
            Self::Paid | Self::Cancelled | Self::Refunded => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl Display for ExecutionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Lifecycle for ExecutionStatus {
    const ENTITY: &'static str = "execution";

    // A runner may report completion without an observed `running` claim.
    fn allowed_next(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Running, Self::Success, Self::Failed, Self::Cancelled],
            Self::Running => &[Self::Success, Self::Failed, Self::Cancelled],
            Self::Success | Self::Failed | Self::Cancelled => &[],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Alipay,
    Wechat,
    Union,
    Paypal,
}

impl PaymentMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alipay => "alipay",
            Self::Wechat => "wechat",
            Self::Union => "union",
            Self::Paypal => "paypal",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "alipay" => Some(Self::Alipay),
            "wechat" => Some(Self::Wechat),
            "union" => Some(Self::Union),
            "paypal" => Some(Self::Paypal),
            _ => None,
        }
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Two-way outcome every external payment status collapses into.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Paid,
    Cancelled,
}

impl PaymentOutcome {
    #[must_use]
    pub fn order_status(self) -> OrderStatus {
        match self {
            Self::Paid => OrderStatus::Paid,
            Self::Cancelled => OrderStatus::Cancelled,
        }
    }
}

/// Normalizes a payment collaborator status string.
///
/// # Errors
/// Returns [`MarketError::Validation`] for statuses outside the known
/// vocabulary.
pub fn normalize_payment_status(raw: &str) -> Result<PaymentOutcome, MarketError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "success" | "paid" | "completed" => Ok(PaymentOutcome::Paid),
        "failed" | "cancelled" | "canceled" => Ok(PaymentOutcome::Cancelled),
        other => Err(MarketError::Validation(format!(
            "unsupported payment status `{other}`"
        ))),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct RechargePackage {
    pub id: u32,
    pub name: &'static str,
    /// Price in the smallest currency unit.
    pub amount: i64,
    pub points: i64,
    pub bonus_points: i64,
    pub total_points: i64,
    pub popular: bool,
}

pub const RECHARGE_PACKAGES: [RechargePackage; 4] = [
    RechargePackage {
        id: 1,
        name: "starter",
        amount: 1000,
        points: 1000,
        bonus_points: 0,
        total_points: 1000,
        popular: false,
    },
    RechargePackage {
        id: 2,
        name: "standard",
        amount: 5000,
        points: 5000,
        bonus_points: 500,
        total_points: 5500,
        popular: true,
    },
    RechargePackage {
        id: 3,
        name: "premium",
        amount: 10000,
        points: 10000,
        bonus_points: 2000,
        total_points: 12000,
        popular: false,
    },
    RechargePackage {
        id: 4,
        name: "professional",
        amount: 20000,
        points: 20000,
        bonus_points: 5000,
        total_points: 25000,
        popular: false,
    },
];

#[must_use]
pub fn recharge_package(id: u32) -> Option<RechargePackage> {
    RECHARGE_PACKAGES.iter().copied().find(|package| package.id == id)
}

/// What the buyer asked to pay for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RechargeRequest {
    Package(u32),
    Custom { amount: i64, points: i64 },
}

impl RechargeRequest {
    /// Resolves the request into `(amount, points)`.
    ///
    /// # Errors
    /// Returns [`MarketError::NotFound`] for unknown package ids and
    /// [`MarketError::Validation`] for custom values outside
    /// `1..=MAX_LEDGER_AMOUNT`, which no ledger credit could settle.
    pub fn resolve(self) -> Result<(i64, i64), MarketError> {
        match self {
            Self::Package(id) => recharge_package(id)
                .map(|package| (package.amount, package.total_points))
                .ok_or_else(|| MarketError::NotFound(format!("recharge package {id}"))),
            Self::Custom { amount, points } => {
                for (field, value) in [("amount", amount), ("points", points)] {
                    if !(1..=MAX_LEDGER_AMOUNT).contains(&value) {
                        return Err(MarketError::Validation(format!(
                            "{field} MUST be between 1 and {MAX_LEDGER_AMOUNT}"
                        )));
                    }
                }
                Ok((amount, points))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    pub user_id: UserId,
    pub points: i64,
    /// Bumped on every balance change. Informational only; the balance guard
    /// does not compare it.
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub entry_seq: i64,
    pub entry_id: EntryId,
    pub user_id: UserId,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub balance_after: i64,
    pub description: String,
    pub related_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One requested change to a user's balance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMutation {
    pub user_id: UserId,
    pub entry_type: LedgerEntryType,
    pub amount: i64,
    pub description: String,
    pub related_id: Option<String>,
}

impl LedgerMutation {
    /// # Errors
    /// Returns [`MarketError::Validation`] for a zero amount, an amount whose
    /// sign disagrees with the entry type, or an empty description.
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.amount == 0 {
            return Err(MarketError::Validation("amount MUST NOT be zero".to_string()));
        }
        if self.amount.unsigned_abs() > MAX_LEDGER_AMOUNT.unsigned_abs() {
            return Err(MarketError::Validation(format!(
                "amount magnitude MUST be <= {MAX_LEDGER_AMOUNT}"
            )));
        }
        if self.entry_type.is_credit() && self.amount < 0 {
            return Err(MarketError::Validation(format!(
                "{} entries MUST credit (amount > 0)",
                self.entry_type
            )));
        }
        if !self.entry_type.is_credit() && self.amount > 0 {
            return Err(MarketError::Validation(format!(
                "{} entries MUST debit (amount < 0)",
                self.entry_type
            )));
        }
        if self.description.trim().is_empty() {
            return Err(MarketError::Validation(
                "description MUST be provided for every ledger entry".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub agent_id: AgentId,
    pub name: String,
    pub description: String,
    pub definition: Value,
    pub price: i64,
    pub purchase_count: i64,
    pub is_public: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInput {
    pub name: String,
    pub description: String,
    pub definition: Value,
    pub price: i64,
    pub is_public: bool,
}

impl AgentInput {
    /// # Errors
    /// Returns [`MarketError::Validation`] for a blank name, a negative price
    /// or a null definition.
    pub fn validate(&self) -> Result<(), MarketError> {
        validate_name(&self.name)?;
        if self.price < 0 {
            return Err(MarketError::Validation("price MUST be >= 0".to_string()));
        }
        validate_definition(&self.definition)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub agent_id: Option<AgentId>,
    pub name: String,
    pub description: String,
    pub definition: Value,
    pub status: WorkflowStatus,
    pub run_count: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_run_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub purchased_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInput {
    pub name: String,
    pub description: String,
    pub definition: Value,
    pub status: WorkflowStatus,
}

impl WorkflowInput {
    /// # Errors
    /// Returns [`MarketError::Validation`] for a blank name, a null
    /// definition, or an initial status other than `draft`/`active`.
    pub fn validate(&self) -> Result<(), MarketError> {
        validate_name(&self.name)?;
        validate_definition(&self.definition)?;
        if !matches!(self.status, WorkflowStatus::Draft | WorkflowStatus::Active) {
            return Err(MarketError::Validation(format!(
                "new workflows MUST start as draft or active, got {}",
                self.status
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RechargeOrder {
    pub order_id: OrderId,
    pub order_no: String,
    pub user_id: UserId,
    pub amount: i64,
    pub points: i64,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Checkout link handed to the buyer; building it has no side effect.
#[must_use]
pub fn payment_url(order: &RechargeOrder) -> String {
    format!(
        "{PAYMENT_GATEWAY_URL}?orderNo={}&method={}",
        order.order_no, order.payment_method
    )
}

#[must_use]
pub fn new_order_no() -> String {
    format!("RO{}", Ulid::new())
}

/// Verified payment signal delivered by the payment collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentNotice {
    pub order_no: String,
    pub payment_id: String,
    pub status: String,
    pub amount: i64,
}

impl PaymentNotice {
    /// Validates the notice shape and normalizes its status.
    ///
    /// # Errors
    /// Returns [`MarketError::Validation`] for a missing order number, an
    /// unknown status, or a paid notice without a payment id.
    pub fn outcome(&self) -> Result<PaymentOutcome, MarketError> {
        if self.order_no.trim().is_empty() {
            return Err(MarketError::Validation("order_no MUST be provided".to_string()));
        }
        let outcome = normalize_payment_status(&self.status)?;
        if outcome == PaymentOutcome::Paid && self.payment_id.trim().is_empty() {
            return Err(MarketError::Validation(
                "payment_id MUST be provided for a paid notice".to_string(),
            ));
        }
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub user_id: UserId,
    pub status: ExecutionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub charged_points: i64,
}

/// Terminal report from the execution worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub output_data: Option<Value>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
}

impl ExecutionReport {
    #[must_use]
    pub fn success(output_data: Value, logs: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Success,
            output_data: Some(output_data),
            error_message: None,
            logs: Some(logs.into()),
        }
    }

    #[must_use]
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output_data: None,
            error_message: Some(error_message.into()),
            logs: None,
        }
    }

    /// # Errors
    /// Returns [`MarketError::Validation`] unless the status is `success` or
    /// `failed`.
    pub fn validate(&self) -> Result<(), MarketError> {
        if !matches!(self.status, ExecutionStatus::Success | ExecutionStatus::Failed) {
            return Err(MarketError::Validation(format!(
                "completion status MUST be success or failed, got {}",
                self.status
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// # Errors
    /// Returns [`MarketError::Validation`] when `limit` is outside
    /// `1..=MAX_PAGE_LIMIT`.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Result<Self, MarketError> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(MarketError::Validation(format!(
                "limit MUST be in [1, {MAX_PAGE_LIMIT}]"
            )));
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditIssue {
    pub code: String,
    pub entry_seq: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub balance: i64,
    pub ledger_sum: i64,
    pub entry_count: usize,
    pub consistent: bool,
    pub issues: Vec<AuditIssue>,
}

/// Replays a user's ledger in write order and checks it against the live
/// balance.
///
/// Every `balance_after` must equal the running sum at that entry, the
/// running sum must never go negative, and the final sum must equal
/// `live_balance`.
#[must_use]
pub fn audit_entries(user_id: &UserId, entries: &[LedgerEntry], live_balance: i64) -> LedgerAudit {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().collect();
    ordered.sort_by_key(|entry| entry.entry_seq);

    let mut issues = Vec::new();
    let mut running: i64 = 0;
    for entry in &ordered {
        if &entry.user_id != user_id {
            issues.push(AuditIssue {
                code: "foreign_entry".to_string(),
                entry_seq: Some(entry.entry_seq),
                message: format!("entry belongs to {}", entry.user_id),
            });
            continue;
        }
        running = running.saturating_add(entry.amount);
        if entry.balance_after != running {
            issues.push(AuditIssue {
                code: "snapshot_mismatch".to_string(),
                entry_seq: Some(entry.entry_seq),
                message: format!(
                    "balance_after {} does not match replayed balance {running}",
                    entry.balance_after
                ),
            });
        }
        if running < 0 {
            issues.push(AuditIssue {
                code: "negative_balance".to_string(),
                entry_seq: Some(entry.entry_seq),
                message: format!("replayed balance dropped to {running}"),
            });
        }
    }

    if running != live_balance {
        issues.push(AuditIssue {
            code: "balance_drift".to_string(),
            entry_seq: None,
            message: format!("ledger sum {running} does not match live balance {live_balance}"),
        });
    }

    LedgerAudit {
        user_id: user_id.clone(),
        balance: live_balance,
        ledger_sum: running,
        entry_count: ordered.len(),
        consistent: issues.is_empty(),
        issues,
    }
}

/// # Errors
/// Returns [`MarketError::Validation`] for a null definition document.
pub fn validate_definition(definition: &Value) -> Result<(), MarketError> {
    if definition.is_null() {
        return Err(MarketError::Validation(
            "definition MUST be a JSON document".to_string(),
        ));
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), MarketError> {
    if name.trim().is_empty() {
        return Err(MarketError::Validation("name MUST be provided".to_string()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(MarketError::Validation(format!(
            "name MUST be at most {MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Parses a JSON document supplied as text.
///
/// # Errors
/// Returns [`MarketError::Validation`] when `raw` is not valid JSON.
pub fn parse_json_document(raw: &str) -> Result<Value, MarketError> {
    serde_json::from_str(raw)
        .map_err(|err| MarketError::Validation(format!("invalid JSON document: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`MarketError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, MarketError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| MarketError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(MarketError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 UTC with a fixed nine-digit fraction, so
/// stored timestamps sort lexically in time order.
///
/// # Errors
/// Returns [`MarketError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, MarketError> {
    let format = time::format_description::parse(STORAGE_TIMESTAMP_FORMAT)
        .map_err(|err| MarketError::Internal(format!("invalid timestamp format: {err}")))?;
    value
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| MarketError::Internal(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Milliseconds between two instants, clamped at zero.
#[must_use]
pub fn duration_ms(started_at: OffsetDateTime, completed_at: OffsetDateTime) -> i64 {
    if completed_at <= started_at {
        return 0;
    }
    i64::try_from((completed_at - started_at).whole_milliseconds()).unwrap_or(i64::MAX)
}
