//! The core contract consumed by the HTTP front-end.
//!
//! Transport-free: every operation takes an authenticated [`Actor`] and
//! returns typed results the HTTP layer serializes. Session handling, CSRF,
//! and rendering live outside the core; ownership and role checks live here.
//!
//! State-changing workspace operations serialize per workspace id through
//! the [`LockMap`], so at most one provisioning or lifecycle operation runs
//! concurrently per workspace.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use berth_config::Settings;
use berth_types::{
    Actor, CoreError, CoreResult, Currency, ExecutionStatus, PlanTier, ProvisioningState,
    UserRole, Workspace, WorkspaceStatus,
};

use crate::audit::{AuditLogger, event};
use crate::billing::{BillingService, CallbackDisposition, CallbackForm, CheckoutSession};
use crate::lockmap::LockMap;
use crate::provisioner::{ProvisionOutcome, Provisioner};
use crate::repo::{
    CompanyRepo, ExecutionRepo, Store, TemplateRepo, UserRepo, WorkspaceRepo,
};
use crate::secret;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkspaceRequest {
    pub name: String,
    pub template_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateWorkspaceResponse {
    pub workspace_id: i64,
    pub status: &'static str,
    /// Where the UI polls for provisioning progress.
    pub poll_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionStatusRow {
    pub action_name: String,
    pub status: &'static str,
    pub started_at: Option<chrono::DateTime<Utc>>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    /// Wall-clock seconds for an action still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceStatusResponse {
    pub is_running: bool,
    pub status: &'static str,
    pub provisioning_state: &'static str,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    pub actions: Vec<ActionStatusRow>,
}

/// What the forward-auth endpoint should answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AuthDecision {
    /// 200 — forward to the workspace.
    Allow,
    /// 302 — anonymous; redirect to login preserving the workspace URL.
    RedirectToLogin { next: String },
    /// 403 — authenticated but not entitled to this workspace.
    Forbidden,
}

/// HTTP-shaped reply for the gateway callback.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackReply {
    pub http_status: u16,
    pub body: &'static str,
}

pub struct Api<'a> {
    store: &'a dyn Store,
    settings: &'a Settings,
    provisioner: Provisioner<'a>,
    locks: LockMap,
}

impl<'a> Api<'a> {
    pub fn new(store: &'a dyn Store, settings: &'a Settings) -> Self {
        Self {
            store,
            settings,
            provisioner: Provisioner::new(store, settings),
            locks: LockMap::new(),
        }
    }

    pub fn provisioner(&self) -> &Provisioner<'a> {
        &self.provisioner
    }

    fn billing(&self) -> BillingService<'_> {
        BillingService::new(self.store, self.settings).with_storage_upgrader(&self.provisioner)
    }

    fn audit(&self) -> AuditLogger<'_> {
        AuditLogger::new(self.store)
    }

    /// Loads a workspace and enforces tenancy: same company, and members
    /// only reach their own workspaces.
    fn owned_workspace(&self, actor: Actor, workspace_id: i64) -> CoreResult<Workspace> {
        let workspace = self.store.workspace(workspace_id)?;
        if workspace.company_id != actor.company_id {
            return Err(CoreError::invalid_input("workspace belongs to another company"));
        }
        if actor.role != UserRole::Admin && workspace.user_id != actor.user_id {
            return Err(CoreError::invalid_input("workspace belongs to another user"));
        }
        Ok(workspace)
    }

    /// `POST /workspaces` — validates quotas, reserves the identifiers, and
    /// persists the `pending` row. Provisioning itself runs on a background
    /// worker via [`Api::run_provisioning`].
    pub fn create_workspace(
        &self,
        actor: Actor,
        request: CreateWorkspaceRequest,
        ip: Option<&str>,
    ) -> CoreResult<CreateWorkspaceResponse> {
        let name = validate_workspace_name(&request.name)?;
        let user = self.store.user(actor.user_id)?;
        let company = self.store.company(actor.company_id)?;

        let user_count = self.store.workspaces_of_user(user.id)?.len() as u32;
        if user_count >= user.workspace_quota {
            return Err(CoreError::QuotaExceeded(format!(
                "user workspace quota reached ({}/{})",
                user_count, user.workspace_quota
            )));
        }
        let company_count = self.store.workspaces_of_company(company.id)?.len() as u32;
        if company_count >= company.max_workspaces {
            return Err(CoreError::QuotaExceeded(format!(
                "company workspace limit reached ({}/{})",
                company_count, company.max_workspaces
            )));
        }

        if let Some(template_id) = request.template_id {
            // Fail fast on a dangling template id.
            self.store.template(template_id)?;
        }

        let subdomain = format!("{}-{}", company.subdomain, name);
        let linux_username = subdomain.replace('-', "_");
        let port = self.provisioner.allocate_port()?;

        let workspace = self.store.insert_workspace(Workspace {
            id: 0,
            company_id: company.id,
            user_id: user.id,
            name,
            subdomain,
            linux_username,
            port,
            code_server_password: secret::password(),
            status: WorkspaceStatus::Pending,
            provisioning_state: ProvisioningState::Created,
            progress_message: None,
            is_running: false,
            last_started_at: None,
            last_stopped_at: None,
            last_accessed_at: None,
            auto_stop_hours: self.settings.default_auto_stop_hours,
            cpu_limit_percent: 100,
            memory_limit_mb: 2048,
            disk_quota_gb: self.settings.default_disk_quota_gb,
            template_id: request.template_id,
            access_token: secret::access_token(),
            ssh_public_key: None,
            extra_data: json!({}),
            created_at: Utc::now(),
        })?;

        self.audit().workspace_created(actor, &workspace, ip)?;
        info!(workspace = workspace.id, "workspace row created");

        Ok(CreateWorkspaceResponse {
            workspace_id: workspace.id,
            status: "pending",
            poll_url: format!("/workspaces/{}/status", workspace.id),
        })
    }

    /// Drives the full provisioning run for a pending workspace; intended to
    /// be submitted to the worker pool right after `create_workspace`.
    pub fn run_provisioning(&self, workspace_id: i64) -> CoreResult<ProvisionOutcome> {
        let lock = self.locks.lock(workspace_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = self.provisioner.provision(workspace_id);
        if let Err(err) = &outcome {
            if let Ok(workspace) = self.store.workspace(workspace_id) {
                let _ = self.audit().workspace_failed(&workspace, &err.to_string());
            }
        }
        outcome
    }

    /// `GET /workspaces/{id}/status`
    pub fn workspace_status(
        &self,
        actor: Actor,
        workspace_id: i64,
    ) -> CoreResult<WorkspaceStatusResponse> {
        let workspace = self.owned_workspace(actor, workspace_id)?;
        let mut executions = self.store.executions_of_workspace(workspace_id)?;
        executions.sort_by_key(|e| e.id);

        let now = Utc::now();
        let actions: Vec<ActionStatusRow> = executions
            .iter()
            .map(|e| ActionStatusRow {
                action_name: e.action_id.clone(),
                status: e.status.as_str(),
                started_at: e.started_at,
                completed_at: e.completed_at,
                duration_seconds: e.duration_seconds,
                elapsed_seconds: match (e.status, e.started_at) {
                    (ExecutionStatus::Running, Some(started)) => {
                        Some((now - started).num_seconds().max(0))
                    }
                    _ => None,
                },
                error_message: e.error_message.clone(),
            })
            .collect();

        let progress_percent = if actions.is_empty() {
            match workspace.status {
                WorkspaceStatus::Active => 100,
                _ => 0,
            }
        } else {
            let terminal = actions
                .iter()
                .filter(|a| a.completed_at.is_some())
                .count();
            ((terminal * 100) / actions.len()) as u8
        };

        Ok(WorkspaceStatusResponse {
            is_running: workspace.is_running,
            status: workspace.status.as_str(),
            provisioning_state: workspace.provisioning_state.as_str(),
            progress_percent,
            progress_message: workspace.progress_message,
            actions,
        })
    }

    /// `POST /workspaces/{id}/start|stop|restart`
    pub fn start_workspace(&self, actor: Actor, workspace_id: i64) -> CoreResult<LifecycleResponse> {
        self.lifecycle_op(actor, workspace_id, "start")
    }

    pub fn stop_workspace(&self, actor: Actor, workspace_id: i64) -> CoreResult<LifecycleResponse> {
        self.lifecycle_op(actor, workspace_id, "stop")
    }

    pub fn restart_workspace(
        &self,
        actor: Actor,
        workspace_id: i64,
    ) -> CoreResult<LifecycleResponse> {
        self.lifecycle_op(actor, workspace_id, "restart")
    }

    fn lifecycle_op(
        &self,
        actor: Actor,
        workspace_id: i64,
        op: &str,
    ) -> CoreResult<LifecycleResponse> {
        let workspace = self.owned_workspace(actor, workspace_id)?;
        let lock = self.locks.lock(workspace_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let (result, event_type) = match op {
            "start" => (self.provisioner.start(workspace_id), event::WORKSPACE_STARTED),
            "stop" => (self.provisioner.stop(workspace_id), event::WORKSPACE_STOPPED),
            "restart" => (self.provisioner.restart(workspace_id), event::WORKSPACE_STARTED),
            _ => return Err(CoreError::invalid_input(format!("unknown operation: {op}"))),
        };

        match result {
            Ok(_) => {
                self.audit().log(
                    event_type,
                    Some(actor),
                    Some(workspace_id),
                    None,
                    json!({"operation": op}),
                )?;
                Ok(LifecycleResponse {
                    success: true,
                    message: format!("workspace {} {}ed", workspace.name, op),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// `POST /workspaces/{id}/verify-ssh` — the explicit resume trigger for
    /// a workflow parked on SSH key verification.
    pub fn verify_ssh(&self, actor: Actor, workspace_id: i64) -> CoreResult<ProvisionOutcome> {
        self.owned_workspace(actor, workspace_id)?;
        let lock = self.locks.lock(workspace_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.provisioner
            .resume_after_ssh_verification(workspace_id, actor.user_id)
    }

    /// Resume trigger for a workflow parked on a manual step.
    pub fn complete_manual_step(
        &self,
        actor: Actor,
        workspace_id: i64,
    ) -> CoreResult<ProvisionOutcome> {
        self.owned_workspace(actor, workspace_id)?;
        let lock = self.locks.lock(workspace_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.provisioner
            .resume_after_manual_step(workspace_id, actor.user_id)
    }

    /// `GET /workspaces/{id}/logs`
    pub fn workspace_logs(
        &self,
        actor: Actor,
        workspace_id: i64,
        lines: u32,
        since: Option<&str>,
    ) -> CoreResult<String> {
        self.owned_workspace(actor, workspace_id)?;
        self.provisioner.logs(workspace_id, lines.clamp(1, 5_000), since)
    }

    /// Deprovisions and deletes a workspace.
    pub fn delete_workspace(&self, actor: Actor, workspace_id: i64) -> CoreResult<()> {
        let workspace = self.owned_workspace(actor, workspace_id)?;
        let lock = self.locks.lock(workspace_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.provisioner.deprovision(workspace_id)?;
        self.audit().log(
            event::WORKSPACE_DELETED,
            Some(actor),
            Some(workspace_id),
            None,
            json!({"name": workspace.name, "subdomain": workspace.subdomain}),
        )?;
        Ok(())
    }

    /// `POST /billing/subscribe/{plan}` — admin only.
    pub fn subscribe(
        &self,
        actor: Actor,
        plan: &str,
        currency: Option<&str>,
        user_ip: &str,
        user_email: &str,
    ) -> CoreResult<CheckoutSession> {
        if actor.role != UserRole::Admin {
            return Err(CoreError::invalid_input("only admins manage billing"));
        }
        let plan = PlanTier::parse(plan)
            .ok_or_else(|| CoreError::invalid_input(format!("unknown plan: {plan}")))?;
        let currency = match currency {
            Some(code) => Currency::parse(code)
                .ok_or_else(|| CoreError::invalid_input(format!("unknown currency: {code}")))?,
            None => self
                .store
                .company(actor.company_id)?
                .preferred_currency,
        };

        let session = self
            .billing()
            .start_checkout(actor.company_id, plan, currency, user_ip, user_email)?;
        self.audit().log(
            event::PAYMENT_INITIATED,
            Some(actor),
            None,
            Some(user_ip),
            json!({"plan": plan.as_str(), "merchant_oid": session.merchant_oid}),
        )?;
        Ok(session)
    }

    /// `POST /billing/callback` — the gateway webhook. CSRF-exempt by
    /// definition; authentication is the HMAC itself.
    pub fn payment_callback(&self, form: &CallbackForm) -> CoreResult<CallbackReply> {
        let disposition = self.billing().process_callback(form)?;
        let reply = match disposition {
            CallbackDisposition::Accepted => CallbackReply {
                http_status: 200,
                body: "OK",
            },
            CallbackDisposition::InvalidSignature => CallbackReply {
                http_status: 400,
                body: "PAYLOAD_AUTH_FAILED",
            },
            CallbackDisposition::UnknownPayment => CallbackReply {
                http_status: 404,
                body: "PAYMENT_NOT_FOUND",
            },
        };
        if disposition == CallbackDisposition::Accepted {
            let event_type = if form.status == "success" {
                event::PAYMENT_SUCCEEDED
            } else {
                event::PAYMENT_FAILED
            };
            self.audit().log(
                event_type,
                None,
                None,
                None,
                json!({"merchant_oid": form.merchant_oid, "status": form.status}),
            )?;
        }
        Ok(reply)
    }

    /// `GET /api/auth/verify` — the forward-auth subrequest. Decides purely
    /// from the session actor and the `X-Workspace-Host` header.
    pub fn auth_verify(
        &self,
        session: Option<Actor>,
        workspace_host: &str,
    ) -> CoreResult<AuthDecision> {
        let next = format!("https://{workspace_host}");
        let Some(actor) = session else {
            return Ok(AuthDecision::RedirectToLogin { next });
        };

        let suffix = format!(".{}", self.settings.base_domain);
        let Some(subdomain) = workspace_host.strip_suffix(&suffix) else {
            return Ok(AuthDecision::Forbidden);
        };
        let Some(mut workspace) = self.store.workspace_by_subdomain(subdomain)? else {
            return Ok(AuthDecision::Forbidden);
        };

        if workspace.company_id != actor.company_id {
            return Ok(AuthDecision::Forbidden);
        }
        if actor.role != UserRole::Admin && workspace.user_id != actor.user_id {
            return Ok(AuthDecision::Forbidden);
        }

        // Access tracking feeds the auto-stop scheduler.
        workspace.last_accessed_at = Some(Utc::now());
        self.store.update_workspace(&workspace)?;
        crate::audit::SessionTracker::new(self.store).touch(workspace.id, actor.user_id)?;

        Ok(AuthDecision::Allow)
    }
}

/// Workspace names become DNS labels and Linux usernames: lowercase
/// alphanumerics and dashes, starting with a letter, at most 24 chars.
fn validate_workspace_name(name: &str) -> CoreResult<String> {
    let name = name.trim().to_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 24
        && name.chars().next().map(|c| c.is_ascii_lowercase()).unwrap_or(false)
        && !name.ends_with('-')
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(name)
    } else {
        Err(CoreError::invalid_input(format!(
            "invalid workspace name: {name:?} (lowercase letters, digits, dashes)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use berth_types::{CompanyStatus, LegalAcceptance, PaymentStatus, User};

    use super::*;
    use crate::billing::callback_signature;
    use crate::repo::{
        CompanyRepo, MemoryStore, PaymentRepo, SessionRepo, UserRepo, WorkspaceRepo,
        memory_test_workspace,
    };

    fn seeded() -> (MemoryStore, Actor, Actor) {
        let store = MemoryStore::new();
        let company = store
            .insert_company(berth_types::Company {
                id: 0,
                name: "Acme".to_string(),
                subdomain: "acme".to_string(),
                plan: PlanTier::Starter,
                status: CompanyStatus::Active,
                max_workspaces: 2,
                preferred_currency: Currency::Usd,
                created_at: Utc::now(),
            })
            .expect("company");

        let admin = store
            .insert_user(User {
                id: 0,
                email: "admin@acme.test".to_string(),
                password_hash: "x".to_string(),
                role: UserRole::Admin,
                company_id: company.id,
                workspace_quota: 2,
                failed_login_attempts: 0,
                account_locked_until: None,
                terms: LegalAcceptance::default(),
                privacy: LegalAcceptance::default(),
                created_at: Utc::now(),
            })
            .expect("admin");
        let member = store
            .insert_user(User {
                id: 0,
                email: "member@acme.test".to_string(),
                password_hash: "x".to_string(),
                role: UserRole::Member,
                company_id: company.id,
                workspace_quota: 1,
                failed_login_attempts: 0,
                account_locked_until: None,
                terms: LegalAcceptance::default(),
                privacy: LegalAcceptance::default(),
                created_at: Utc::now(),
            })
            .expect("member");

        let admin_actor = Actor {
            user_id: admin.id,
            company_id: company.id,
            role: UserRole::Admin,
        };
        let member_actor = Actor {
            user_id: member.id,
            company_id: company.id,
            role: UserRole::Member,
        };
        (store, admin_actor, member_actor)
    }

    #[test]
    fn create_workspace_reserves_identifiers() {
        let (store, admin, _) = seeded();
        let settings = Settings::default();
        let api = Api::new(&store, &settings);

        let response = api
            .create_workspace(
                admin,
                CreateWorkspaceRequest {
                    name: "X".to_string(),
                    template_id: None,
                },
                Some("10.0.0.1"),
            )
            .expect("create");
        assert_eq!(response.status, "pending");
        assert_eq!(response.poll_url, format!("/workspaces/{}/status", response.workspace_id));

        let ws = store.workspace(response.workspace_id).expect("ws");
        assert_eq!(ws.name, "x");
        assert_eq!(ws.subdomain, "acme-x");
        assert_eq!(ws.linux_username, "acme_x");
        assert_eq!(ws.port, settings.port_range_start);
        assert_eq!(ws.status, WorkspaceStatus::Pending);
        assert_eq!(ws.disk_quota_gb, settings.default_disk_quota_gb);
        assert_eq!(ws.code_server_password.len(), 18);

        // Duplicate name in the company is rejected.
        assert!(
            api.create_workspace(
                admin,
                CreateWorkspaceRequest {
                    name: "x".to_string(),
                    template_id: None
                },
                None,
            )
            .is_err()
        );
    }

    #[test]
    fn quotas_are_enforced_per_user_and_company() {
        let (store, admin, member) = seeded();
        let settings = Settings::default();
        let api = Api::new(&store, &settings);

        // Member has quota 1.
        api.create_workspace(
            member,
            CreateWorkspaceRequest { name: "one".to_string(), template_id: None },
            None,
        )
        .expect("first");
        let err = api
            .create_workspace(
                member,
                CreateWorkspaceRequest { name: "two".to_string(), template_id: None },
                None,
            )
            .expect_err("member quota");
        assert!(matches!(err, CoreError::QuotaExceeded(_)));

        // Company max is 2: admin gets one more, then the company is full.
        api.create_workspace(
            admin,
            CreateWorkspaceRequest { name: "three".to_string(), template_id: None },
            None,
        )
        .expect("second");
        let err = api
            .create_workspace(
                admin,
                CreateWorkspaceRequest { name: "four".to_string(), template_id: None },
                None,
            )
            .expect_err("company quota");
        assert!(matches!(err, CoreError::QuotaExceeded(_)));
    }

    #[test]
    fn workspace_names_are_validated() {
        assert_eq!(validate_workspace_name(" Dev-1 ").expect("ok"), "dev-1");
        assert!(validate_workspace_name("").is_err());
        assert!(validate_workspace_name("1abc").is_err());
        assert!(validate_workspace_name("bad_name").is_err());
        assert!(validate_workspace_name("trailing-").is_err());
        assert!(validate_workspace_name("waaaaaaaaaaaaaaaaay-too-long-name").is_err());
    }

    #[test]
    fn status_reports_progress_from_execution_records() {
        let (store, admin, _) = seeded();
        let settings = Settings::default();
        let api = Api::new(&store, &settings);

        let response = api
            .create_workspace(
                admin,
                CreateWorkspaceRequest { name: "x".to_string(), template_id: None },
                None,
            )
            .expect("create");

        let status = api.workspace_status(admin, response.workspace_id).expect("status");
        assert_eq!(status.status, "pending");
        assert_eq!(status.progress_percent, 0);
        assert!(status.actions.is_empty());
    }

    #[test]
    fn cross_tenant_access_is_rejected() {
        let (store, admin, member) = seeded();
        let settings = Settings::default();

        // A workspace belonging to a different company.
        let other_company = store
            .insert_company(berth_types::Company {
                id: 0,
                name: "Globex".to_string(),
                subdomain: "globex".to_string(),
                plan: PlanTier::Starter,
                status: CompanyStatus::Active,
                max_workspaces: 5,
                preferred_currency: Currency::Usd,
                created_at: Utc::now(),
            })
            .expect("company");
        let mut foreign = memory_test_workspace(other_company.id, "w", 8099);
        foreign.subdomain = "globex-w".to_string();
        foreign.linux_username = "globex_w".to_string();
        let foreign = store.insert_workspace(foreign).expect("ws");

        let api = Api::new(&store, &settings);
        assert!(api.workspace_status(admin, foreign.id).is_err());

        // A member cannot reach a teammate's workspace either.
        let mut teammate = memory_test_workspace(admin.company_id, "m", 8050);
        teammate.user_id = admin.user_id;
        teammate.subdomain = "acme-m".to_string();
        teammate.linux_username = "acme_m".to_string();
        let teammate = store.insert_workspace(teammate).expect("ws");
        assert!(api.workspace_status(member, teammate.id).is_err());
        assert!(api.workspace_status(admin, teammate.id).is_ok());
    }

    #[test]
    fn auth_verify_decides_allow_redirect_forbidden() {
        let (store, admin, member) = seeded();
        let settings = Settings::default();

        let mut ws = memory_test_workspace(admin.company_id, "x", 8001);
        ws.user_id = admin.user_id;
        let ws = store.insert_workspace(ws).expect("ws");

        let api = Api::new(&store, &settings);
        let host = format!("acme-x.{}", settings.base_domain);

        // Anonymous: redirect with the workspace URL preserved.
        let decision = api.auth_verify(None, &host).expect("verify");
        assert_eq!(
            decision,
            AuthDecision::RedirectToLogin { next: format!("https://{host}") }
        );

        // The owner (admin) gets through, and access is tracked.
        assert_eq!(api.auth_verify(Some(admin), &host).expect("verify"), AuthDecision::Allow);
        let tracked = store.workspace(ws.id).expect("ws");
        assert!(tracked.last_accessed_at.is_some());
        assert!(store.open_session_of_workspace(ws.id).expect("session").is_some());

        // A member who does not own it is forbidden.
        assert_eq!(
            api.auth_verify(Some(member), &host).expect("verify"),
            AuthDecision::Forbidden
        );

        // Unknown hosts are forbidden.
        let unknown = format!("ghost.{}", settings.base_domain);
        assert_eq!(
            api.auth_verify(Some(admin), &unknown).expect("verify"),
            AuthDecision::Forbidden
        );
    }

    #[test]
    fn callback_reply_maps_dispositions_to_http() {
        let (store, _, _) = seeded();
        let mut settings = Settings::default();
        settings.gateway.merchant_id = "m".to_string();
        settings.gateway.merchant_key = "k".to_string();
        settings.gateway.merchant_salt = "s".to_string();

        store
            .insert_payment(berth_types::Payment {
                id: 0,
                company_id: 1,
                subscription_id: None,
                merchant_oid: "BRT9".to_string(),
                amount: 2_900,
                currency: Currency::Usd,
                plan: PlanTier::Starter,
                status: PaymentStatus::Pending,
                payment_type: "initial".to_string(),
                failure_reason_code: None,
                failure_reason_message: None,
                test_mode: true,
                user_ip: None,
                created_at: Utc::now(),
                completed_at: None,
            })
            .expect("payment");

        let api = Api::new(&store, &settings);

        let good = CallbackForm {
            merchant_oid: "BRT9".to_string(),
            status: "success".to_string(),
            total_amount: "2900".to_string(),
            hash: callback_signature(&settings, "BRT9", "success", "2900"),
            ..CallbackForm::default()
        };
        let reply = api.payment_callback(&good).expect("callback");
        assert_eq!((reply.http_status, reply.body), (200, "OK"));

        let forged = CallbackForm {
            hash: "AAAA".to_string(),
            ..good.clone()
        };
        let reply = api.payment_callback(&forged).expect("callback");
        assert_eq!(reply.http_status, 400);

        let unknown = CallbackForm {
            merchant_oid: "BRT-nope".to_string(),
            hash: callback_signature(&settings, "BRT-nope", "success", "2900"),
            ..good
        };
        let reply = api.payment_callback(&unknown).expect("callback");
        assert_eq!(reply.http_status, 404);
    }

    #[test]
    fn subscribe_requires_admin_and_known_plan() {
        let (store, _, member) = seeded();
        let settings = Settings::default();
        let api = Api::new(&store, &settings);

        assert!(
            api.subscribe(member, "team", None, "10.0.0.1", "member@acme.test")
                .is_err()
        );

        let admin = Actor { role: UserRole::Admin, ..member };
        assert!(
            api.subscribe(admin, "galactic", None, "10.0.0.1", "admin@acme.test")
                .is_err()
        );
    }
}
