//! # Types
//!
//! Core domain types for berth: companies, users, workspaces, templates,
//! action sequences and their execution records, subscriptions, payments,
//! invoices, metrics, and the shared error taxonomy.
//!
//! ## Serialization
//!
//! Every entity implements `Serialize`/`Deserialize` from `serde` so rows can
//! be round-tripped through the repository layer and surfaced verbatim in API
//! payloads. Status enums serialize as `snake_case` strings matching the
//! values the store persists.
//!
//! ## Ownership
//!
//! Entities refer to each other by id only. A `Workspace` holds `company_id`
//! and `user_id`; relations are materialized by repository queries, never by
//! embedded back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use berth_retry::RetrySpec;

/// Subscription plan tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Starter,
    Team,
    Enterprise,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Starter => "starter",
            PlanTier::Team => "team",
            PlanTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starter" => Some(PlanTier::Starter),
            "team" => Some(PlanTier::Team),
            "enterprise" => Some(PlanTier::Enterprise),
            _ => None,
        }
    }
}

/// Currencies accepted by the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "TRY")]
    Try,
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "EUR")]
    Eur,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Try => "TRY",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRY" => Some(Currency::Try),
            "USD" => Some(Currency::Usd),
            "EUR" => Some(Currency::Eur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    Active,
    Suspended,
    Cancelled,
}

/// A tenant. One company owns many users and workspaces and at most one
/// subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    /// Unique across the platform; the workspace subdomain prefix.
    pub subdomain: String,
    pub plan: PlanTier,
    pub status: CompanyStatus,
    /// Derived from the plan; mutates only through a plan change.
    pub max_workspaces: u32,
    pub preferred_currency: Currency,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Member,
}

/// Acceptance record for a legal document (terms of service, privacy policy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegalAcceptance {
    pub accepted: bool,
    pub accepted_at: Option<DateTime<Utc>>,
    pub accepted_ip: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub role: UserRole,
    pub company_id: i64,
    /// Workspaces this user may own. Always at least 1; the sum across a
    /// company's users must not exceed `Company::max_workspaces`.
    pub workspace_quota: u32,
    pub failed_login_attempts: u32,
    pub account_locked_until: Option<DateTime<Utc>>,
    pub terms: LegalAcceptance,
    pub privacy: LegalAcceptance,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.account_locked_until.map(|t| t > now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Pending,
    Provisioning,
    Active,
    Paused,
    Stopped,
    Failed,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Pending => "pending",
            WorkspaceStatus::Provisioning => "provisioning",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Paused => "paused",
            WorkspaceStatus::Stopped => "stopped",
            WorkspaceStatus::Failed => "failed",
        }
    }
}

/// Coarse phase of workspace initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    Created,
    Provisioning,
    AwaitingSshVerification,
    Completed,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisioningState::Created => "created",
            ProvisioningState::Provisioning => "provisioning",
            ProvisioningState::AwaitingSshVerification => "awaiting_ssh_verification",
            ProvisioningState::Completed => "completed",
            ProvisioningState::Failed => "failed",
        }
    }
}

/// A per-tenant isolated IDE instance: one Linux user, one TCP port, one
/// systemd service instance, one reverse-proxy route.
///
/// `(port, linux_username, subdomain)` are reserved exclusively for as long
/// as the row exists; only deprovisioning releases them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: i64,
    pub company_id: i64,
    pub user_id: i64,
    /// Unique within the company.
    pub name: String,
    /// Globally unique, e.g. `acme-x`.
    pub subdomain: String,
    /// Globally unique, e.g. `acme_x`.
    pub linux_username: String,
    /// Globally unique, within the configured range.
    pub port: u16,
    pub code_server_password: String,
    pub status: WorkspaceStatus,
    pub provisioning_state: ProvisioningState,
    pub progress_message: Option<String>,
    pub is_running: bool,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_stopped_at: Option<DateTime<Utc>>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    /// 0 disables auto-stop.
    pub auto_stop_hours: u32,
    pub cpu_limit_percent: u32,
    pub memory_limit_mb: u32,
    pub disk_quota_gb: u32,
    pub template_id: Option<i64>,
    pub access_token: String,
    pub ssh_public_key: Option<String>,
    /// Free-form state bag (resume cursor, ssh verification markers, ...).
    pub extra_data: Value,
    pub created_at: DateTime<Utc>,
}

impl Workspace {
    /// Home directory under the configured base dir.
    pub fn home_directory(&self, base_dir: &str) -> String {
        format!("{}/{}", base_dir.trim_end_matches('/'), self.linux_username)
    }

    /// Instantiated systemd unit name for this workspace.
    pub fn service_name(&self) -> String {
        format!("code-server@{}.service", self.linux_username)
    }

    pub fn access_url(&self, base_domain: &str) -> String {
        format!("https://{}.{}", self.subdomain, base_domain)
    }

    /// Reads a boolean marker out of `extra_data`.
    pub fn extra_flag(&self, key: &str) -> bool {
        self.extra_data
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateVisibility {
    Official,
    Company,
    User,
}

/// The recipe for initializing a workspace environment: an ordered,
/// DAG-structured set of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceTemplate {
    pub id: i64,
    pub name: String,
    pub visibility: TemplateVisibility,
    pub category: String,
    pub config: Value,
    /// When true, a fatal action failure unwinds completed actions.
    pub rollback_on_fatal_error: bool,
    pub created_at: DateTime<Utc>,
}

/// Runtime condition gating an action. The expression language is limited to
/// four predicates plus AND/OR/NOT; see the condition module in `berth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCondition {
    pub expression: String,
}

/// One step of a template: which handler to run, with which parameters,
/// where in the order, and how to retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateActionSequence {
    pub id: i64,
    pub template_id: i64,
    /// Stable handle within the template; dependency edges refer to it.
    pub action_id: String,
    /// Handler kind, e.g. `generate_ssh_key`.
    pub action_type: String,
    /// Explicit ordering; ties break on `action_id`.
    pub order: i32,
    pub parameters: Value,
    pub condition: Option<ActionCondition>,
    /// `action_id`s that must complete before this one starts.
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub retry: RetrySpec,
    pub fatal_on_error: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }

    /// Terminal states never move forward again (`rolled_back` included).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Skipped
                | ExecutionStatus::RolledBack
        )
    }
}

/// Per-step execution record. Rows are created in plan order; status only
/// progresses forward, except the terminal `rolled_back`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: i64,
    pub workspace_id: i64,
    pub action_sequence_id: i64,
    pub action_id: String,
    pub action_type: String,
    pub status: ExecutionStatus,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub stack_trace: Option<String>,
    pub rollback_attempted: bool,
    pub rollback_successful: Option<bool>,
    pub rollback_error: Option<String>,
}

impl ActionExecution {
    pub fn new(workspace_id: i64, seq: &TemplateActionSequence) -> Self {
        Self {
            id: 0,
            workspace_id,
            action_sequence_id: seq.id,
            action_id: seq.action_id.clone(),
            action_type: seq.action_type.clone(),
            status: ExecutionStatus::Pending,
            attempt_number: 0,
            max_attempts: seq.retry.max_attempts,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            result: None,
            error_message: None,
            stack_trace: None,
            rollback_attempted: false,
            rollback_successful: None,
            rollback_error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Cancelled,
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    /// One subscription per company.
    pub company_id: i64,
    pub plan: PlanTier,
    pub status: SubscriptionStatus,
    pub trial_starts_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_ends_at.map(|t| t <= now).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// A terminal payment is never transitioned again; repeated gateway
    /// callbacks for it are acknowledged without side effects.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// One payment attempt against the gateway. `merchant_oid` is the
/// platform-generated idempotency key across callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: i64,
    pub company_id: i64,
    pub subscription_id: Option<i64>,
    pub merchant_oid: String,
    /// Minor units (cents / kuruş).
    pub amount: i64,
    pub currency: Currency,
    pub plan: PlanTier,
    pub status: PaymentStatus,
    pub payment_type: String,
    pub failure_reason_code: Option<String>,
    pub failure_reason_message: Option<String>,
    pub test_mode: bool,
    pub user_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Draft,
    Sent,
    Paid,
    Void,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: i64,
    pub company_id: i64,
    pub payment_id: i64,
    /// `INV-YYYY-NNNNN`, monotonic within the year.
    pub invoice_number: String,
    pub subtotal: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub currency: Currency,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub invoice_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub status: InvoiceStatus,
    pub description: String,
}

impl Invoice {
    /// Formats a year-scoped sequential invoice number.
    pub fn format_number(year: i32, seq: u32) -> String {
        format!("INV-{}-{:05}", year, seq)
    }
}

/// Time-series resource usage sample for one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMetrics {
    pub workspace_id: i64,
    pub collected_at: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub memory_percent: f64,
    pub process_count: u32,
    pub uptime_seconds: u64,
}

/// Daily exchange rate, unique per `(source, target, effective_date)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub source_currency: Currency,
    pub target_currency: Currency,
    /// Rate scaled by 10^6 to avoid floating point drift in money math.
    pub rate_micros: i64,
    pub effective_date: chrono::NaiveDate,
}

impl ExchangeRate {
    pub const SCALE: i64 = 1_000_000;
}

/// Append-only audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub user_id: Option<i64>,
    pub company_id: Option<i64>,
    pub workspace_id: Option<i64>,
    pub ip_address: Option<String>,
    pub detail: Value,
}

/// One open/close interval of workspace usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSession {
    pub id: i64,
    pub workspace_id: i64,
    pub user_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Login attempt record; feeds the account lockout counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub id: i64,
    pub email: String,
    pub ip_address: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Outbound email record. Delivery itself is out of scope; the row exists so
/// the trail is auditable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailLog {
    pub id: i64,
    pub user_id: Option<i64>,
    pub company_id: Option<i64>,
    pub recipient: String,
    pub subject: String,
    pub kind: String,
    pub sent_at: DateTime<Utc>,
}

/// The authenticated caller of a core operation. Authentication itself is an
/// external concern; the core only checks ownership and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: i64,
    pub company_id: i64,
    pub role: UserRole,
}

/// Error taxonomy shared across the core. Handlers raise the specific kinds;
/// the executor wraps them with execution-record context; the provisioner
/// translates into `ProvisionFailed`.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("no available ports in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("action {action_id} failed: {message}")]
    ActionFailed { action_id: String, message: String },

    #[error("Circular dependency detected in action sequences")]
    CircularDependency,

    #[error("{program} failed with exit code {exit_code:?}: {stderr_tail}")]
    CommandFailed {
        program: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("callback hash verification failed")]
    PayloadAuthFailed,

    #[error("payment {merchant_oid} already in terminal state")]
    IdempotencyConflict { merchant_oid: String },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("provisioning failed after steps {completed_steps:?}: {message}")]
    ProvisionFailed {
        message: String,
        completed_steps: Vec<String>,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        CoreError::InvalidInput(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
