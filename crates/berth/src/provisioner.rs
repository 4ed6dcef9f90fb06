//! Workspace provisioning orchestration.
//!
//! Wraps the action engine with the OS-level steps a workspace needs before
//! and after its template runs: Linux account, code-server config, systemd
//! instance, disk quota, and finally the reverse-proxy route. The route goes
//! live last so a half-built workspace is never reachable.
//!
//! On any step failure the completed infrastructure steps are unwound in
//! reverse order (proxy route → systemd instance → Linux user), the
//! workspace row is marked `failed`, and `ProvisionFailed` carries the list
//! of steps that had completed. A failed row keeps its port/subdomain/user
//! reservations until an explicit deprovision.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};

use berth_config::Settings;
use berth_proxy::ProxyManager;
use berth_types::{
    CoreError, CoreResult, ProvisioningState, Workspace, WorkspaceStatus,
};

use crate::executor::{ActionExecutor, PausedInfo, set_extra_key};
use crate::handlers::{HandlerRegistry, WorkspaceContext};
use crate::repo::{CompanyRepo, Store, TemplateRepo, UserRepo, WorkspaceRepo};
use crate::secret;
use crate::system::{SystemManager, service_unit};

/// Result of a provision or resume call.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionOutcome {
    pub workspace_id: i64,
    pub steps_completed: Vec<String>,
    pub workspace_url: Option<String>,
    pub paused: Option<PausedInfo>,
    pub message: String,
}

pub struct Provisioner<'a> {
    store: &'a dyn Store,
    settings: &'a Settings,
    system: SystemManager,
    proxy: ProxyManager,
    registry: HandlerRegistry,
}

impl<'a> Provisioner<'a> {
    pub fn new(store: &'a dyn Store, settings: &'a Settings) -> Self {
        let system = SystemManager::new(
            settings.workspace_base_dir.clone(),
            settings.systemd_unit_dir.clone(),
        );
        let proxy = ProxyManager::new(
            settings.proxy_config_path.clone(),
            settings.base_domain.clone(),
            format!("{}/api/auth/verify", settings.base_url),
        );
        Self {
            store,
            settings,
            system,
            proxy,
            registry: HandlerRegistry::standard(),
        }
    }

    pub fn proxy(&self) -> &ProxyManager {
        &self.proxy
    }

    pub fn system(&self) -> &SystemManager {
        &self.system
    }

    /// First free port in the configured range, scanning the reserved set
    /// from the store.
    pub fn allocate_port(&self) -> CoreResult<u16> {
        let reserved = self.store.reserved_ports()?;
        for port in self.settings.port_range_start..=self.settings.port_range_end {
            if !reserved.contains(&port) {
                return Ok(port);
            }
        }
        Err(CoreError::PortExhausted {
            start: self.settings.port_range_start,
            end: self.settings.port_range_end,
        })
    }

    /// Handler context for a workspace, with user/company facts resolved.
    pub fn build_context(&self, workspace: &Workspace) -> CoreResult<WorkspaceContext> {
        let user = self.store.user(workspace.user_id).ok();
        let company = self.store.company(workspace.company_id).ok();
        Ok(WorkspaceContext {
            workspace_id: workspace.id,
            workspace_name: workspace.name.clone(),
            linux_username: workspace.linux_username.clone(),
            home_directory: self.system.home_directory(&workspace.linux_username),
            subdomain: workspace.subdomain.clone(),
            base_domain: self.settings.base_domain.clone(),
            port: workspace.port,
            user_id: user.as_ref().map(|u| u.id),
            user_email: user.map(|u| u.email),
            company_name: company.map(|c| c.name),
            extra: workspace.extra_data.clone(),
        })
    }

    /// Full provisioning run for a pending workspace.
    pub fn provision(&self, workspace_id: i64) -> CoreResult<ProvisionOutcome> {
        let mut workspace = self.store.workspace(workspace_id)?;
        if workspace.status != WorkspaceStatus::Pending {
            return Err(CoreError::InvalidStateTransition(format!(
                "workspace {} is {}, expected pending",
                workspace_id,
                workspace.status.as_str()
            )));
        }

        workspace.status = WorkspaceStatus::Provisioning;
        workspace.provisioning_state = ProvisioningState::Provisioning;
        self.store.update_workspace(&workspace)?;

        let mut steps: Vec<String> = Vec::new();
        match self.provision_steps(&mut workspace, &mut steps) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(workspace = workspace_id, %err, "provisioning failed, cleaning up");
                self.cleanup_failed(&workspace, &steps);
                workspace.status = WorkspaceStatus::Failed;
                workspace.provisioning_state = ProvisioningState::Failed;
                workspace.progress_message = Some(err.to_string());
                if let Err(update_err) = self.store.update_workspace(&workspace) {
                    error!(workspace = workspace_id, %update_err, "failed to persist failure");
                }
                Err(CoreError::ProvisionFailed {
                    message: err.to_string(),
                    completed_steps: steps,
                })
            }
        }
    }

    fn provision_steps(
        &self,
        workspace: &mut Workspace,
        steps: &mut Vec<String>,
    ) -> CoreResult<ProvisionOutcome> {
        if workspace.port < self.settings.port_range_start
            || workspace.port > self.settings.port_range_end
        {
            return Err(CoreError::invalid_input(format!(
                "workspace port {} outside configured range",
                workspace.port
            )));
        }

        if workspace.code_server_password.is_empty() {
            workspace.code_server_password = secret::password();
            self.store.update_workspace(workspace)?;
        }

        self.system
            .create_linux_user(&workspace.linux_username, &workspace.code_server_password)?;
        steps.push("linux_user_created".to_string());

        self.system
            .write_code_server_config(&workspace.linux_username, workspace.port)?;
        steps.push("code_server_configured".to_string());

        self.system.ensure_template_unit()?;
        self.system
            .write_port_dropin(&workspace.linux_username, workspace.port)?;
        self.system.daemon_reload()?;
        let unit = service_unit(&workspace.linux_username);
        self.system.enable_service(&unit)?;
        self.system.start_service(&unit)?;
        steps.push("systemd_service_started".to_string());

        // Quota is best-effort: hosts without quota tooling still provision.
        self.system
            .set_disk_quota(&workspace.linux_username, workspace.disk_quota_gb);
        steps.push("disk_quota_requested".to_string());

        if let Some(template_id) = workspace.template_id {
            let template = self.store.template(template_id)?;
            let ctx = self.build_context(workspace)?;
            let executor = ActionExecutor::new(self.store, &self.registry);
            let report = executor.run(workspace, &template, &ctx)?;

            if let Some(paused) = report.paused {
                steps.push("template_actions_paused".to_string());
                info!(workspace = workspace.id, "provisioning paused for verification");
                return Ok(ProvisionOutcome {
                    workspace_id: workspace.id,
                    steps_completed: steps.clone(),
                    workspace_url: None,
                    paused: Some(paused),
                    message: "Provisioning paused, awaiting external confirmation".to_string(),
                });
            }
            if !report.success {
                return Err(CoreError::ActionFailed {
                    action_id: report.failed_action.unwrap_or_default(),
                    message: report.error.unwrap_or_else(|| "template execution failed".into()),
                });
            }
            steps.push("template_actions_executed".to_string());
        }

        let url = self
            .proxy
            .add_route(&workspace.subdomain, workspace.port)
            .map_err(CoreError::Other)?;
        steps.push("proxy_route_added".to_string());

        self.finalize_active(workspace)?;
        info!(workspace = workspace.id, %url, "workspace provisioned");

        Ok(ProvisionOutcome {
            workspace_id: workspace.id,
            steps_completed: steps.clone(),
            workspace_url: Some(url),
            paused: None,
            message: format!("Workspace {} provisioned", workspace.name),
        })
    }

    fn finalize_active(&self, workspace: &mut Workspace) -> CoreResult<()> {
        workspace.status = WorkspaceStatus::Active;
        workspace.provisioning_state = ProvisioningState::Completed;
        workspace.is_running = true;
        workspace.last_started_at = Some(Utc::now());
        workspace.progress_message = None;
        self.store.update_workspace(workspace)
    }

    /// Reverse-order unwind of the infrastructure steps that completed.
    fn cleanup_failed(&self, workspace: &Workspace, steps: &[String]) {
        let has = |s: &str| steps.iter().any(|x| x == s);

        if has("proxy_route_added") {
            if let Err(err) = self.proxy.remove_route(&workspace.subdomain) {
                warn!(workspace = workspace.id, %err, "cleanup: proxy route removal failed");
            }
        }
        if has("systemd_service_started") {
            let unit = service_unit(&workspace.linux_username);
            self.system.silence_service(&unit);
            if let Err(err) = self.system.remove_port_dropin(&workspace.linux_username) {
                warn!(workspace = workspace.id, %err, "cleanup: drop-in removal failed");
            }
            let _ = self.system.daemon_reload();
        }
        if has("linux_user_created") {
            if let Err(err) = self.system.delete_linux_user(&workspace.linux_username) {
                warn!(workspace = workspace.id, %err, "cleanup: user removal failed");
            }
        }
    }

    /// Removes every trace of the workspace and deletes the row, releasing
    /// its port/subdomain/username reservations.
    pub fn deprovision(&self, workspace_id: i64) -> CoreResult<()> {
        let workspace = self.store.workspace(workspace_id)?;

        self.proxy
            .remove_route(&workspace.subdomain)
            .map_err(CoreError::Other)?;

        let unit = service_unit(&workspace.linux_username);
        self.system.silence_service(&unit);
        self.system.remove_port_dropin(&workspace.linux_username)?;
        let _ = self.system.daemon_reload();

        self.system.delete_linux_user(&workspace.linux_username)?;
        self.store.delete_workspace(workspace_id)?;

        info!(workspace = workspace_id, "workspace deprovisioned");
        Ok(())
    }

    pub fn start(&self, workspace_id: i64) -> CoreResult<Workspace> {
        let mut workspace = self.store.workspace(workspace_id)?;
        self.system.start_service(&service_unit(&workspace.linux_username))?;
        workspace.is_running = true;
        workspace.status = WorkspaceStatus::Active;
        workspace.last_started_at = Some(Utc::now());
        self.store.update_workspace(&workspace)?;
        Ok(workspace)
    }

    pub fn stop(&self, workspace_id: i64) -> CoreResult<Workspace> {
        let mut workspace = self.store.workspace(workspace_id)?;
        self.system.stop_service(&service_unit(&workspace.linux_username))?;
        workspace.is_running = false;
        workspace.status = WorkspaceStatus::Stopped;
        workspace.last_stopped_at = Some(Utc::now());
        self.store.update_workspace(&workspace)?;
        Ok(workspace)
    }

    pub fn restart(&self, workspace_id: i64) -> CoreResult<Workspace> {
        let mut workspace = self.store.workspace(workspace_id)?;
        self.system
            .restart_service(&service_unit(&workspace.linux_username))?;
        workspace.is_running = true;
        workspace.status = WorkspaceStatus::Active;
        workspace.last_started_at = Some(Utc::now());
        self.store.update_workspace(&workspace)?;
        Ok(workspace)
    }

    /// Journal tail for the workspace's service.
    pub fn logs(&self, workspace_id: i64, lines: u32, since: Option<&str>) -> CoreResult<String> {
        let workspace = self.store.workspace(workspace_id)?;
        self.system
            .journal_tail(&service_unit(&workspace.linux_username), lines, since)
    }

    /// Continues a workflow parked on SSH key verification.
    pub fn resume_after_ssh_verification(
        &self,
        workspace_id: i64,
        user_id: i64,
    ) -> CoreResult<ProvisionOutcome> {
        let mut workspace = self.store.workspace(workspace_id)?;
        if workspace.provisioning_state != ProvisioningState::AwaitingSshVerification {
            return Err(CoreError::InvalidStateTransition(format!(
                "workspace {} is not awaiting ssh verification (state: {})",
                workspace_id,
                workspace.provisioning_state.as_str()
            )));
        }

        set_extra_key(&mut workspace, "ssh_verified", json!(true));
        set_extra_key(&mut workspace, "ssh_verified_at", json!(Utc::now().to_rfc3339()));
        set_extra_key(&mut workspace, "ssh_verified_by", json!(user_id));
        self.resume_template(workspace, "Resuming after SSH verification")
    }

    /// Continues a workflow parked on a manual step.
    pub fn resume_after_manual_step(
        &self,
        workspace_id: i64,
        user_id: i64,
    ) -> CoreResult<ProvisionOutcome> {
        let mut workspace = self.store.workspace(workspace_id)?;
        if workspace.status != WorkspaceStatus::Paused {
            return Err(CoreError::InvalidStateTransition(format!(
                "workspace {} is not paused",
                workspace_id
            )));
        }

        set_extra_key(&mut workspace, "manual_step_completed", json!(true));
        set_extra_key(
            &mut workspace,
            "manual_step_completed_by",
            json!(user_id),
        );
        self.resume_template(workspace, "Resuming after manual step")
    }

    fn resume_template(
        &self,
        mut workspace: Workspace,
        message: &str,
    ) -> CoreResult<ProvisionOutcome> {
        let template_id = workspace.template_id.ok_or_else(|| {
            CoreError::InvalidStateTransition(format!(
                "workspace {} has no template to resume",
                workspace.id
            ))
        })?;
        let template = self.store.template(template_id)?;

        workspace.status = WorkspaceStatus::Provisioning;
        workspace.provisioning_state = ProvisioningState::Provisioning;
        workspace.progress_message = Some(message.to_string());
        self.store.update_workspace(&workspace)?;

        let ctx = self.build_context(&workspace)?;
        let executor = ActionExecutor::new(self.store, &self.registry);
        let report = match executor.resume(&mut workspace, &template, &ctx) {
            Ok(report) => report,
            Err(err) => {
                workspace.status = WorkspaceStatus::Failed;
                workspace.provisioning_state = ProvisioningState::Failed;
                workspace.progress_message = Some(err.to_string());
                let _ = self.store.update_workspace(&workspace);
                return Err(err);
            }
        };

        if let Some(paused) = report.paused {
            return Ok(ProvisionOutcome {
                workspace_id: workspace.id,
                steps_completed: vec!["template_actions_resumed".to_string()],
                workspace_url: None,
                paused: Some(paused),
                message: "Provisioning paused again".to_string(),
            });
        }

        if !report.success {
            let message = report
                .error
                .unwrap_or_else(|| "resumed template execution failed".to_string());
            workspace.status = WorkspaceStatus::Failed;
            workspace.provisioning_state = ProvisioningState::Failed;
            workspace.progress_message = Some(message.clone());
            self.store.update_workspace(&workspace)?;
            return Err(CoreError::ProvisionFailed {
                message,
                completed_steps: vec!["template_actions_resumed".to_string()],
            });
        }

        let url = self
            .proxy
            .add_route(&workspace.subdomain, workspace.port)
            .map_err(CoreError::Other)?;
        self.finalize_active(&mut workspace)?;
        info!(workspace = workspace.id, "resumed provisioning completed");

        Ok(ProvisionOutcome {
            workspace_id: workspace.id,
            steps_completed: vec![
                "template_actions_resumed".to_string(),
                "proxy_route_added".to_string(),
            ],
            workspace_url: Some(url),
            paused: None,
            message: "Provisioning resumed and completed".to_string(),
        })
    }

    /// Raises the disk quota; lowering is refused.
    pub fn resize_workspace_disk(
        &self,
        workspace_id: i64,
        new_quota_gb: u32,
    ) -> CoreResult<Workspace> {
        let mut workspace = self.store.workspace(workspace_id)?;
        if new_quota_gb < workspace.disk_quota_gb {
            return Err(CoreError::invalid_input(format!(
                "disk quota can only be raised ({}GB -> {}GB requested)",
                workspace.disk_quota_gb, new_quota_gb
            )));
        }
        if new_quota_gb > workspace.disk_quota_gb {
            self.system
                .set_disk_quota(&workspace.linux_username, new_quota_gb);
            workspace.disk_quota_gb = new_quota_gb;
            self.store.update_workspace(&workspace)?;
        }
        Ok(workspace)
    }
}

impl crate::billing::StorageUpgrader for Provisioner<'_> {
    fn upgrade_storage(&self, workspace_id: i64, new_quota_gb: u32) -> CoreResult<()> {
        self.resize_workspace_disk(workspace_id, new_quota_gb).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use berth_types::{CompanyStatus, Currency, PlanTier};
    use chrono::Utc;

    use super::*;
    use crate::repo::{CompanyRepo, MemoryStore, WorkspaceRepo, memory_test_workspace};

    fn settings(range: (u16, u16)) -> Settings {
        Settings {
            port_range_start: range.0,
            port_range_end: range.1,
            ..Settings::default()
        }
    }

    fn store_with_company() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let company = store
            .insert_company(berth_types::Company {
                id: 0,
                name: "Acme".to_string(),
                subdomain: "acme".to_string(),
                plan: PlanTier::Starter,
                status: CompanyStatus::Active,
                max_workspaces: 5,
                preferred_currency: Currency::Usd,
                created_at: Utc::now(),
            })
            .expect("company");
        (store, company.id)
    }

    #[test]
    fn allocate_port_returns_first_free() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8003));
        store
            .insert_workspace(memory_test_workspace(company_id, "a", 8001))
            .expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        assert_eq!(provisioner.allocate_port().expect("port"), 8002);
    }

    #[test]
    fn allocate_port_exhaustion() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8002));
        store
            .insert_workspace(memory_test_workspace(company_id, "a", 8001))
            .expect("insert");
        store
            .insert_workspace(memory_test_workspace(company_id, "b", 8002))
            .expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        assert!(matches!(
            provisioner.allocate_port(),
            Err(CoreError::PortExhausted { start: 8001, end: 8002 })
        ));
    }

    #[test]
    fn failed_rows_keep_their_port_reserved() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8002));
        let mut ws = memory_test_workspace(company_id, "a", 8001);
        ws.status = WorkspaceStatus::Failed;
        store.insert_workspace(ws).expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        // The failed row still holds 8001.
        assert_eq!(provisioner.allocate_port().expect("port"), 8002);
    }

    #[test]
    fn provision_rejects_non_pending_workspace() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8010));
        let mut ws = memory_test_workspace(company_id, "a", 8001);
        ws.status = WorkspaceStatus::Active;
        let ws = store.insert_workspace(ws).expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        assert!(matches!(
            provisioner.provision(ws.id),
            Err(CoreError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn resize_refuses_to_lower_quota() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8010));
        let mut ws = memory_test_workspace(company_id, "a", 8001);
        ws.disk_quota_gb = 50;
        let ws = store.insert_workspace(ws).expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        assert!(provisioner.resize_workspace_disk(ws.id, 10).is_err());

        // Equal quota is a no-op, not an error.
        let unchanged = provisioner.resize_workspace_disk(ws.id, 50).expect("same");
        assert_eq!(unchanged.disk_quota_gb, 50);
    }

    #[test]
    fn resume_requires_awaiting_state() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8010));
        let ws = store
            .insert_workspace(memory_test_workspace(company_id, "a", 8001))
            .expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        assert!(matches!(
            provisioner.resume_after_ssh_verification(ws.id, 1),
            Err(CoreError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn build_context_resolves_home_and_domain() {
        let (store, company_id) = store_with_company();
        let s = settings((8001, 8010));
        let ws = store
            .insert_workspace(memory_test_workspace(company_id, "a", 8001))
            .expect("insert");

        let provisioner = Provisioner::new(&store, &s);
        let ctx = provisioner.build_context(&ws).expect("ctx");
        assert_eq!(ctx.home_directory, "/home/acme_a");
        assert_eq!(ctx.base_domain, s.base_domain);
        assert_eq!(ctx.company_name.as_deref(), Some("Acme"));
        assert_eq!(ctx.port, 8001);
    }
}
