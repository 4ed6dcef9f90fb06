//! Narrow repository traits over the external relational store.
//!
//! The core never issues queries of its own; each trait lists exactly the
//! typed lookups and updates one subsystem needs. Deployments wire in a
//! backend for the platform database; [`MemoryStore`] is the in-process
//! backend used by tests and single-host development mode.
//!
//! Uniqueness of `(port, subdomain, linux_username)` and of workspace names
//! within a company is enforced at insert, so reservation invariants hold no
//! matter which subsystem writes first.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};

use berth_types::{
    ActionExecution, AuditEvent, Company, CoreResult, Currency, ExchangeRate, Invoice, Payment,
    Subscription, TemplateActionSequence, User, Workspace, WorkspaceMetrics, WorkspaceSession,
    WorkspaceTemplate,
};

mod memory;

pub use memory::MemoryStore;

pub trait CompanyRepo: Send + Sync {
    fn insert_company(&self, company: Company) -> CoreResult<Company>;
    fn company(&self, id: i64) -> CoreResult<Company>;
    fn company_by_subdomain(&self, subdomain: &str) -> CoreResult<Option<Company>>;
    fn update_company(&self, company: &Company) -> CoreResult<()>;
}

pub trait UserRepo: Send + Sync {
    fn insert_user(&self, user: User) -> CoreResult<User>;
    fn user(&self, id: i64) -> CoreResult<User>;
    fn user_by_email(&self, email: &str) -> CoreResult<Option<User>>;
    fn users_of_company(&self, company_id: i64) -> CoreResult<Vec<User>>;
    fn update_user(&self, user: &User) -> CoreResult<()>;
}

pub trait WorkspaceRepo: Send + Sync {
    /// Inserts and reserves `(port, subdomain, linux_username)` plus the
    /// per-company name. Fails on any collision.
    fn insert_workspace(&self, workspace: Workspace) -> CoreResult<Workspace>;
    fn workspace(&self, id: i64) -> CoreResult<Workspace>;
    fn workspace_by_subdomain(&self, subdomain: &str) -> CoreResult<Option<Workspace>>;
    fn update_workspace(&self, workspace: &Workspace) -> CoreResult<()>;
    /// Cascade-deletes the workspace's executions, metrics, and sessions,
    /// releasing its reservations.
    fn delete_workspace(&self, id: i64) -> CoreResult<()>;
    fn workspaces_of_company(&self, company_id: i64) -> CoreResult<Vec<Workspace>>;
    fn workspaces_of_user(&self, user_id: i64) -> CoreResult<Vec<Workspace>>;
    fn list_workspaces(&self) -> CoreResult<Vec<Workspace>>;
    /// Every port currently reserved by a workspace row, failed rows
    /// included.
    fn reserved_ports(&self) -> CoreResult<BTreeSet<u16>>;
}

pub trait TemplateRepo: Send + Sync {
    fn insert_template(&self, template: WorkspaceTemplate) -> CoreResult<WorkspaceTemplate>;
    fn template(&self, id: i64) -> CoreResult<WorkspaceTemplate>;
    /// Refused while any workspace references the template.
    fn delete_template(&self, id: i64) -> CoreResult<()>;
    fn insert_sequence(
        &self,
        sequence: TemplateActionSequence,
    ) -> CoreResult<TemplateActionSequence>;
    /// All sequences of a template ordered by `order`, then `action_id`.
    fn sequences_of_template(&self, template_id: i64) -> CoreResult<Vec<TemplateActionSequence>>;
}

pub trait ExecutionRepo: Send + Sync {
    fn insert_execution(&self, execution: ActionExecution) -> CoreResult<ActionExecution>;
    fn update_execution(&self, execution: &ActionExecution) -> CoreResult<()>;
    fn executions_of_workspace(&self, workspace_id: i64) -> CoreResult<Vec<ActionExecution>>;
    /// The non-terminal execution record for one sequence, if any — the
    /// record a paused workflow will pick back up.
    fn open_execution(
        &self,
        workspace_id: i64,
        action_sequence_id: i64,
    ) -> CoreResult<Option<ActionExecution>>;
}

pub trait PaymentRepo: Send + Sync {
    /// `merchant_oid` is unique; a duplicate insert fails.
    fn insert_payment(&self, payment: Payment) -> CoreResult<Payment>;
    fn payment_by_merchant_oid(&self, merchant_oid: &str) -> CoreResult<Option<Payment>>;
    fn update_payment(&self, payment: &Payment) -> CoreResult<()>;
    fn payments_of_company(&self, company_id: i64) -> CoreResult<Vec<Payment>>;
}

pub trait SubscriptionRepo: Send + Sync {
    fn insert_subscription(&self, subscription: Subscription) -> CoreResult<Subscription>;
    fn subscription_of_company(&self, company_id: i64) -> CoreResult<Option<Subscription>>;
    fn update_subscription(&self, subscription: &Subscription) -> CoreResult<()>;
}

pub trait InvoiceRepo: Send + Sync {
    fn insert_invoice(&self, invoice: Invoice) -> CoreResult<Invoice>;
    /// 1-based sequence number for the next invoice of the given year.
    fn next_invoice_seq(&self, year: i32) -> CoreResult<u32>;
    fn invoices_of_company(&self, company_id: i64) -> CoreResult<Vec<Invoice>>;
}

pub trait MetricsRepo: Send + Sync {
    fn insert_metrics(&self, metrics: WorkspaceMetrics) -> CoreResult<()>;
    fn metrics_of_workspace(
        &self,
        workspace_id: i64,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<WorkspaceMetrics>>;
    /// Drops samples older than the cutoff; returns how many went.
    fn prune_metrics_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize>;
}

pub trait RateRepo: Send + Sync {
    /// Insert-or-replace on `(source, target, effective_date)`.
    fn upsert_rate(&self, rate: ExchangeRate) -> CoreResult<()>;
    /// The most recent rate at or before the given date.
    fn rate_on_or_before(
        &self,
        source: Currency,
        target: Currency,
        date: NaiveDate,
    ) -> CoreResult<Option<ExchangeRate>>;
}

pub trait AuditRepo: Send + Sync {
    fn append_audit_event(&self, event: AuditEvent) -> CoreResult<AuditEvent>;
    fn recent_audit_events(&self, limit: usize) -> CoreResult<Vec<AuditEvent>>;
}

pub trait SessionRepo: Send + Sync {
    fn open_session(&self, session: WorkspaceSession) -> CoreResult<WorkspaceSession>;
    fn close_session(&self, id: i64, ended_at: DateTime<Utc>) -> CoreResult<()>;
    fn open_session_of_workspace(&self, workspace_id: i64)
    -> CoreResult<Option<WorkspaceSession>>;
}

/// Everything the control plane needs from the store, as one object-safe
/// bound. `MemoryStore` implements it; a SQL backend would too.
pub trait Store:
    CompanyRepo
    + UserRepo
    + WorkspaceRepo
    + TemplateRepo
    + ExecutionRepo
    + PaymentRepo
    + SubscriptionRepo
    + InvoiceRepo
    + MetricsRepo
    + RateRepo
    + AuditRepo
    + SessionRepo
{
}

impl<T> Store for T where
    T: CompanyRepo
        + UserRepo
        + WorkspaceRepo
        + TemplateRepo
        + ExecutionRepo
        + PaymentRepo
        + SubscriptionRepo
        + InvoiceRepo
        + MetricsRepo
        + RateRepo
        + AuditRepo
        + SessionRepo
{
}

#[cfg(test)]
pub(crate) fn memory_test_workspace(company_id: i64, name: &str, port: u16) -> Workspace {
    use berth_types::{ProvisioningState, WorkspaceStatus};

    Workspace {
        id: 0,
        company_id,
        user_id: 1,
        name: name.to_string(),
        subdomain: format!("acme-{name}"),
        linux_username: format!("acme_{name}"),
        port,
        code_server_password: "pw".to_string(),
        status: WorkspaceStatus::Pending,
        provisioning_state: ProvisioningState::Created,
        progress_message: None,
        is_running: false,
        last_started_at: None,
        last_stopped_at: None,
        last_accessed_at: None,
        auto_stop_hours: 0,
        cpu_limit_percent: 100,
        memory_limit_mb: 2048,
        disk_quota_gb: 10,
        template_id: None,
        access_token: "tok".to_string(),
        ssh_public_key: None,
        extra_data: serde_json::json!({}),
        created_at: Utc::now(),
    }
}
