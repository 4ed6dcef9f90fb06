//! In-memory store backend.
//!
//! Every repository trait implemented over one `Mutex<State>`, which makes
//! each call atomic — the same granularity a SQL backend gets from its
//! per-statement transactions. Used by tests and by single-host development
//! deployments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, NaiveDate, Utc};

use berth_types::{
    ActionExecution, AuditEvent, Company, CoreError, CoreResult, Currency, ExchangeRate, Invoice,
    Payment, Subscription, TemplateActionSequence, User, Workspace, WorkspaceMetrics,
    WorkspaceSession, WorkspaceTemplate,
};

use super::{
    AuditRepo, CompanyRepo, ExecutionRepo, InvoiceRepo, MetricsRepo, PaymentRepo, RateRepo,
    SessionRepo, SubscriptionRepo, TemplateRepo, UserRepo, WorkspaceRepo,
};

#[derive(Default)]
struct State {
    next_id: i64,
    companies: BTreeMap<i64, Company>,
    users: BTreeMap<i64, User>,
    workspaces: BTreeMap<i64, Workspace>,
    templates: BTreeMap<i64, WorkspaceTemplate>,
    sequences: BTreeMap<i64, TemplateActionSequence>,
    executions: BTreeMap<i64, ActionExecution>,
    payments: BTreeMap<i64, Payment>,
    subscriptions: BTreeMap<i64, Subscription>,
    invoices: BTreeMap<i64, Invoice>,
    metrics: Vec<WorkspaceMetrics>,
    rates: BTreeMap<(Currency, Currency, NaiveDate), ExchangeRate>,
    audit: Vec<AuditEvent>,
    sessions: BTreeMap<i64, WorkspaceSession>,
}

impl State {
    fn fresh_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// The in-memory backend. Cheap to clone handles via `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }
}

impl CompanyRepo for MemoryStore {
    fn insert_company(&self, mut company: Company) -> CoreResult<Company> {
        self.with(|state| {
            if state
                .companies
                .values()
                .any(|c| c.subdomain == company.subdomain)
            {
                return Err(CoreError::invalid_input(format!(
                    "company subdomain taken: {}",
                    company.subdomain
                )));
            }
            company.id = state.fresh_id();
            state.companies.insert(company.id, company.clone());
            Ok(company)
        })
    }

    fn company(&self, id: i64) -> CoreResult<Company> {
        self.with(|state| {
            state
                .companies
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("company {id}")))
        })
    }

    fn company_by_subdomain(&self, subdomain: &str) -> CoreResult<Option<Company>> {
        self.with(|state| {
            Ok(state
                .companies
                .values()
                .find(|c| c.subdomain == subdomain)
                .cloned())
        })
    }

    fn update_company(&self, company: &Company) -> CoreResult<()> {
        self.with(|state| {
            if !state.companies.contains_key(&company.id) {
                return Err(CoreError::not_found(format!("company {}", company.id)));
            }
            state.companies.insert(company.id, company.clone());
            Ok(())
        })
    }
}

impl UserRepo for MemoryStore {
    fn insert_user(&self, mut user: User) -> CoreResult<User> {
        self.with(|state| {
            if state.users.values().any(|u| u.email == user.email) {
                return Err(CoreError::invalid_input(format!(
                    "email already registered: {}",
                    user.email
                )));
            }
            user.id = state.fresh_id();
            state.users.insert(user.id, user.clone());
            Ok(user)
        })
    }

    fn user(&self, id: i64) -> CoreResult<User> {
        self.with(|state| {
            state
                .users
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("user {id}")))
        })
    }

    fn user_by_email(&self, email: &str) -> CoreResult<Option<User>> {
        self.with(|state| Ok(state.users.values().find(|u| u.email == email).cloned()))
    }

    fn users_of_company(&self, company_id: i64) -> CoreResult<Vec<User>> {
        self.with(|state| {
            Ok(state
                .users
                .values()
                .filter(|u| u.company_id == company_id)
                .cloned()
                .collect())
        })
    }

    fn update_user(&self, user: &User) -> CoreResult<()> {
        self.with(|state| {
            if !state.users.contains_key(&user.id) {
                return Err(CoreError::not_found(format!("user {}", user.id)));
            }
            state.users.insert(user.id, user.clone());
            Ok(())
        })
    }
}

impl WorkspaceRepo for MemoryStore {
    fn insert_workspace(&self, mut workspace: Workspace) -> CoreResult<Workspace> {
        self.with(|state| {
            for existing in state.workspaces.values() {
                if existing.port == workspace.port {
                    return Err(CoreError::invalid_input(format!(
                        "port already reserved: {}",
                        workspace.port
                    )));
                }
                if existing.subdomain == workspace.subdomain {
                    return Err(CoreError::invalid_input(format!(
                        "subdomain already reserved: {}",
                        workspace.subdomain
                    )));
                }
                if existing.linux_username == workspace.linux_username {
                    return Err(CoreError::invalid_input(format!(
                        "linux username already reserved: {}",
                        workspace.linux_username
                    )));
                }
                if existing.company_id == workspace.company_id && existing.name == workspace.name {
                    return Err(CoreError::invalid_input(format!(
                        "workspace name already used in company: {}",
                        workspace.name
                    )));
                }
            }
            workspace.id = state.fresh_id();
            state.workspaces.insert(workspace.id, workspace.clone());
            Ok(workspace)
        })
    }

    fn workspace(&self, id: i64) -> CoreResult<Workspace> {
        self.with(|state| {
            state
                .workspaces
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("workspace {id}")))
        })
    }

    fn workspace_by_subdomain(&self, subdomain: &str) -> CoreResult<Option<Workspace>> {
        self.with(|state| {
            Ok(state
                .workspaces
                .values()
                .find(|w| w.subdomain == subdomain)
                .cloned())
        })
    }

    fn update_workspace(&self, workspace: &Workspace) -> CoreResult<()> {
        self.with(|state| {
            if !state.workspaces.contains_key(&workspace.id) {
                return Err(CoreError::not_found(format!("workspace {}", workspace.id)));
            }
            state.workspaces.insert(workspace.id, workspace.clone());
            Ok(())
        })
    }

    fn delete_workspace(&self, id: i64) -> CoreResult<()> {
        self.with(|state| {
            if state.workspaces.remove(&id).is_none() {
                return Err(CoreError::not_found(format!("workspace {id}")));
            }
            state.executions.retain(|_, e| e.workspace_id != id);
            state.metrics.retain(|m| m.workspace_id != id);
            state.sessions.retain(|_, s| s.workspace_id != id);
            Ok(())
        })
    }

    fn workspaces_of_company(&self, company_id: i64) -> CoreResult<Vec<Workspace>> {
        self.with(|state| {
            Ok(state
                .workspaces
                .values()
                .filter(|w| w.company_id == company_id)
                .cloned()
                .collect())
        })
    }

    fn workspaces_of_user(&self, user_id: i64) -> CoreResult<Vec<Workspace>> {
        self.with(|state| {
            Ok(state
                .workspaces
                .values()
                .filter(|w| w.user_id == user_id)
                .cloned()
                .collect())
        })
    }

    fn list_workspaces(&self) -> CoreResult<Vec<Workspace>> {
        self.with(|state| Ok(state.workspaces.values().cloned().collect()))
    }

    fn reserved_ports(&self) -> CoreResult<BTreeSet<u16>> {
        self.with(|state| Ok(state.workspaces.values().map(|w| w.port).collect()))
    }
}

impl TemplateRepo for MemoryStore {
    fn insert_template(&self, mut template: WorkspaceTemplate) -> CoreResult<WorkspaceTemplate> {
        self.with(|state| {
            template.id = state.fresh_id();
            state.templates.insert(template.id, template.clone());
            Ok(template)
        })
    }

    fn template(&self, id: i64) -> CoreResult<WorkspaceTemplate> {
        self.with(|state| {
            state
                .templates
                .get(&id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("template {id}")))
        })
    }

    fn delete_template(&self, id: i64) -> CoreResult<()> {
        self.with(|state| {
            if state.workspaces.values().any(|w| w.template_id == Some(id)) {
                return Err(CoreError::InvalidStateTransition(format!(
                    "template {id} is referenced by workspaces"
                )));
            }
            if state.templates.remove(&id).is_none() {
                return Err(CoreError::not_found(format!("template {id}")));
            }
            state.sequences.retain(|_, s| s.template_id != id);
            Ok(())
        })
    }

    fn insert_sequence(
        &self,
        mut sequence: TemplateActionSequence,
    ) -> CoreResult<TemplateActionSequence> {
        self.with(|state| {
            if !state.templates.contains_key(&sequence.template_id) {
                return Err(CoreError::not_found(format!(
                    "template {}",
                    sequence.template_id
                )));
            }
            sequence.id = state.fresh_id();
            state.sequences.insert(sequence.id, sequence.clone());
            Ok(sequence)
        })
    }

    fn sequences_of_template(&self, template_id: i64) -> CoreResult<Vec<TemplateActionSequence>> {
        self.with(|state| {
            let mut out: Vec<_> = state
                .sequences
                .values()
                .filter(|s| s.template_id == template_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.order.cmp(&b.order).then(a.action_id.cmp(&b.action_id)));
            Ok(out)
        })
    }
}

impl ExecutionRepo for MemoryStore {
    fn insert_execution(&self, mut execution: ActionExecution) -> CoreResult<ActionExecution> {
        self.with(|state| {
            execution.id = state.fresh_id();
            state.executions.insert(execution.id, execution.clone());
            Ok(execution)
        })
    }

    fn update_execution(&self, execution: &ActionExecution) -> CoreResult<()> {
        self.with(|state| {
            if !state.executions.contains_key(&execution.id) {
                return Err(CoreError::not_found(format!("execution {}", execution.id)));
            }
            state.executions.insert(execution.id, execution.clone());
            Ok(())
        })
    }

    fn executions_of_workspace(&self, workspace_id: i64) -> CoreResult<Vec<ActionExecution>> {
        self.with(|state| {
            Ok(state
                .executions
                .values()
                .filter(|e| e.workspace_id == workspace_id)
                .cloned()
                .collect())
        })
    }

    fn open_execution(
        &self,
        workspace_id: i64,
        action_sequence_id: i64,
    ) -> CoreResult<Option<ActionExecution>> {
        self.with(|state| {
            Ok(state
                .executions
                .values()
                .find(|e| {
                    e.workspace_id == workspace_id
                        && e.action_sequence_id == action_sequence_id
                        && !e.status.is_terminal()
                })
                .cloned())
        })
    }
}

impl PaymentRepo for MemoryStore {
    fn insert_payment(&self, mut payment: Payment) -> CoreResult<Payment> {
        self.with(|state| {
            if state
                .payments
                .values()
                .any(|p| p.merchant_oid == payment.merchant_oid)
            {
                return Err(CoreError::invalid_input(format!(
                    "merchant_oid already exists: {}",
                    payment.merchant_oid
                )));
            }
            payment.id = state.fresh_id();
            state.payments.insert(payment.id, payment.clone());
            Ok(payment)
        })
    }

    fn payment_by_merchant_oid(&self, merchant_oid: &str) -> CoreResult<Option<Payment>> {
        self.with(|state| {
            Ok(state
                .payments
                .values()
                .find(|p| p.merchant_oid == merchant_oid)
                .cloned())
        })
    }

    fn update_payment(&self, payment: &Payment) -> CoreResult<()> {
        self.with(|state| {
            if !state.payments.contains_key(&payment.id) {
                return Err(CoreError::not_found(format!("payment {}", payment.id)));
            }
            state.payments.insert(payment.id, payment.clone());
            Ok(())
        })
    }

    fn payments_of_company(&self, company_id: i64) -> CoreResult<Vec<Payment>> {
        self.with(|state| {
            Ok(state
                .payments
                .values()
                .filter(|p| p.company_id == company_id)
                .cloned()
                .collect())
        })
    }
}

impl SubscriptionRepo for MemoryStore {
    fn insert_subscription(&self, mut subscription: Subscription) -> CoreResult<Subscription> {
        self.with(|state| {
            if state
                .subscriptions
                .values()
                .any(|s| s.company_id == subscription.company_id)
            {
                return Err(CoreError::invalid_input(format!(
                    "company {} already has a subscription",
                    subscription.company_id
                )));
            }
            subscription.id = state.fresh_id();
            state
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(subscription)
        })
    }

    fn subscription_of_company(&self, company_id: i64) -> CoreResult<Option<Subscription>> {
        self.with(|state| {
            Ok(state
                .subscriptions
                .values()
                .find(|s| s.company_id == company_id)
                .cloned())
        })
    }

    fn update_subscription(&self, subscription: &Subscription) -> CoreResult<()> {
        self.with(|state| {
            if !state.subscriptions.contains_key(&subscription.id) {
                return Err(CoreError::not_found(format!(
                    "subscription {}",
                    subscription.id
                )));
            }
            state
                .subscriptions
                .insert(subscription.id, subscription.clone());
            Ok(())
        })
    }
}

impl InvoiceRepo for MemoryStore {
    fn insert_invoice(&self, mut invoice: Invoice) -> CoreResult<Invoice> {
        self.with(|state| {
            if state
                .invoices
                .values()
                .any(|i| i.invoice_number == invoice.invoice_number)
            {
                return Err(CoreError::invalid_input(format!(
                    "invoice number already exists: {}",
                    invoice.invoice_number
                )));
            }
            invoice.id = state.fresh_id();
            state.invoices.insert(invoice.id, invoice.clone());
            Ok(invoice)
        })
    }

    fn next_invoice_seq(&self, year: i32) -> CoreResult<u32> {
        self.with(|state| {
            let count = state
                .invoices
                .values()
                .filter(|i| i.invoice_date.year() == year)
                .count() as u32;
            Ok(count + 1)
        })
    }

    fn invoices_of_company(&self, company_id: i64) -> CoreResult<Vec<Invoice>> {
        self.with(|state| {
            Ok(state
                .invoices
                .values()
                .filter(|i| i.company_id == company_id)
                .cloned()
                .collect())
        })
    }
}

impl MetricsRepo for MemoryStore {
    fn insert_metrics(&self, metrics: WorkspaceMetrics) -> CoreResult<()> {
        self.with(|state| {
            state.metrics.push(metrics);
            Ok(())
        })
    }

    fn metrics_of_workspace(
        &self,
        workspace_id: i64,
        since: DateTime<Utc>,
    ) -> CoreResult<Vec<WorkspaceMetrics>> {
        self.with(|state| {
            Ok(state
                .metrics
                .iter()
                .filter(|m| m.workspace_id == workspace_id && m.collected_at >= since)
                .cloned()
                .collect())
        })
    }

    fn prune_metrics_before(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        self.with(|state| {
            let before = state.metrics.len();
            state.metrics.retain(|m| m.collected_at >= cutoff);
            Ok(before - state.metrics.len())
        })
    }
}

impl RateRepo for MemoryStore {
    fn upsert_rate(&self, rate: ExchangeRate) -> CoreResult<()> {
        self.with(|state| {
            state.rates.insert(
                (rate.source_currency, rate.target_currency, rate.effective_date),
                rate,
            );
            Ok(())
        })
    }

    fn rate_on_or_before(
        &self,
        source: Currency,
        target: Currency,
        date: NaiveDate,
    ) -> CoreResult<Option<ExchangeRate>> {
        self.with(|state| {
            Ok(state
                .rates
                .range((source, target, NaiveDate::MIN)..=(source, target, date))
                .next_back()
                .map(|(_, rate)| rate.clone()))
        })
    }
}

impl AuditRepo for MemoryStore {
    fn append_audit_event(&self, mut event: AuditEvent) -> CoreResult<AuditEvent> {
        self.with(|state| {
            event.id = state.fresh_id();
            state.audit.push(event.clone());
            Ok(event)
        })
    }

    fn recent_audit_events(&self, limit: usize) -> CoreResult<Vec<AuditEvent>> {
        self.with(|state| {
            let start = state.audit.len().saturating_sub(limit);
            Ok(state.audit[start..].to_vec())
        })
    }
}

impl SessionRepo for MemoryStore {
    fn open_session(&self, mut session: WorkspaceSession) -> CoreResult<WorkspaceSession> {
        self.with(|state| {
            session.id = state.fresh_id();
            state.sessions.insert(session.id, session.clone());
            Ok(session)
        })
    }

    fn close_session(&self, id: i64, ended_at: DateTime<Utc>) -> CoreResult<()> {
        self.with(|state| {
            let session = state
                .sessions
                .get_mut(&id)
                .ok_or_else(|| CoreError::not_found(format!("session {id}")))?;
            session.ended_at = Some(ended_at);
            Ok(())
        })
    }

    fn open_session_of_workspace(
        &self,
        workspace_id: i64,
    ) -> CoreResult<Option<WorkspaceSession>> {
        self.with(|state| {
            Ok(state
                .sessions
                .values()
                .find(|s| s.workspace_id == workspace_id && s.ended_at.is_none())
                .cloned())
        })
    }
}
