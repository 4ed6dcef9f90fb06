//! End-to-end provisioning scenarios against fake host tooling.
//!
//! Every external binary the provisioner touches is swapped for a shell
//! script through the `BERTH_<NAME>_BIN` overrides, so a full provision run
//! exercises the real orchestration (port allocation, user creation, unit
//! files, template actions, proxy config) without touching the host.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use serial_test::serial;

use berth::api::{Api, CreateWorkspaceRequest};
use berth::provisioner::Provisioner;
use berth::repo::{
    CompanyRepo, ExecutionRepo, MemoryStore, TemplateRepo, UserRepo, WorkspaceRepo,
};
use berth_config::Settings;
use berth_retry::RetrySpec;
use berth_types::{
    Actor, CompanyStatus, CoreError, Currency, ExecutionStatus, LegalAcceptance, PlanTier,
    ProvisioningState, TemplateActionSequence, TemplateVisibility, UserRole, WorkspaceStatus,
    WorkspaceTemplate,
};

struct Fixture {
    store: MemoryStore,
    settings: Settings,
    actor: Actor,
    #[allow(dead_code)]
    root: tempfile::TempDir,
    bin: tempfile::TempDir,
}

fn fake_bin(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write fake bin");
    let mut perms = std::fs::metadata(&path).expect("meta").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).expect("chmod");
    path
}

fn logged(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(format!("{name}.log")))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

impl Fixture {
    fn new() -> Self {
        let root = tempfile::tempdir().expect("root");
        let bin = tempfile::tempdir().expect("bin");

        let mut settings = Settings::default();
        settings.port_range_start = 8001;
        settings.port_range_end = 8003;
        settings.workspace_base_dir = root.path().join("home").to_string_lossy().to_string();
        settings.systemd_unit_dir = root.path().join("units").to_string_lossy().to_string();
        settings.proxy_config_path = root
            .path()
            .join("proxy/workspaces.yml")
            .to_string_lossy()
            .to_string();

        std::fs::create_dir_all(root.path().join("home")).expect("mkdir");

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
        let user = store
            .insert_user(berth_types::User {
                id: 0,
                email: "admin@acme.test".to_string(),
                password_hash: "x".to_string(),
                role: UserRole::Admin,
                company_id: company.id,
                workspace_quota: 3,
                failed_login_attempts: 0,
                account_locked_until: None,
                terms: LegalAcceptance::default(),
                privacy: LegalAcceptance::default(),
                created_at: Utc::now(),
            })
            .expect("user");

        let actor = Actor {
            user_id: user.id,
            company_id: company.id,
            role: UserRole::Admin,
        };

        Self {
            store,
            settings,
            actor,
            root,
            bin,
        }
    }

    /// Standard fakes: logging no-op host tools, a working ssh-keygen.
    fn env_vars(&self) -> Vec<(String, Option<String>)> {
        let dir = self.bin.path();
        let log = |name: &str| {
            fake_bin(
                dir,
                name,
                &format!("echo \"$@\" >> '{}/{name}.log'\nexit 0", dir.display()),
            )
        };
        let useradd = log("useradd");
        let userdel = log("userdel");
        let systemctl = log("systemctl");
        let journalctl = fake_bin(dir, "journalctl", "echo 'journal line one'\necho 'journal line two'");
        let setquota = log("setquota");
        let chown = fake_bin(dir, "chown", "exit 0");
        let chpasswd = fake_bin(
            dir,
            "chpasswd",
            &format!("cat >> '{}/chpasswd.log'\nexit 0", dir.display()),
        );
        let keygen = fake_bin(
            dir,
            "ssh-keygen",
            &format!(
                "echo \"$@\" >> '{}/ssh-keygen.log'\n\
                 while [ $# -gt 0 ]; do if [ \"$1\" = \"-f\" ]; then f=\"$2\"; fi; shift; done\n\
                 echo private > \"$f\"\n\
                 echo 'ssh-ed25519 AAAA dev@acme.test' > \"$f.pub\"",
                dir.display()
            ),
        );

        vec![
            ("BERTH_USERADD_BIN".to_string(), Some(useradd.to_string_lossy().to_string())),
            ("BERTH_USERDEL_BIN".to_string(), Some(userdel.to_string_lossy().to_string())),
            ("BERTH_SYSTEMCTL_BIN".to_string(), Some(systemctl.to_string_lossy().to_string())),
            ("BERTH_JOURNALCTL_BIN".to_string(), Some(journalctl.to_string_lossy().to_string())),
            ("BERTH_SETQUOTA_BIN".to_string(), Some(setquota.to_string_lossy().to_string())),
            ("BERTH_CHOWN_BIN".to_string(), Some(chown.to_string_lossy().to_string())),
            ("BERTH_CHPASSWD_BIN".to_string(), Some(chpasswd.to_string_lossy().to_string())),
            ("BERTH_SSH_KEYGEN_BIN".to_string(), Some(keygen.to_string_lossy().to_string())),
        ]
    }

    fn insert_template(
        &self,
        rollback_on_fatal: bool,
        sequences: Vec<(&str, &str, i32, Vec<&str>, serde_json::Value, RetrySpec, bool)>,
    ) -> i64 {
        let template = self
            .store
            .insert_template(WorkspaceTemplate {
                id: 0,
                name: "python-dev".to_string(),
                visibility: TemplateVisibility::Official,
                category: "development".to_string(),
                config: json!({}),
                rollback_on_fatal_error: rollback_on_fatal,
                created_at: Utc::now(),
            })
            .expect("template");

        for (action_id, action_type, order, deps, params, retry, fatal) in sequences {
            self.store
                .insert_sequence(TemplateActionSequence {
                    id: 0,
                    template_id: template.id,
                    action_id: action_id.to_string(),
                    action_type: action_type.to_string(),
                    order,
                    parameters: params,
                    condition: None,
                    dependencies: deps.into_iter().map(str::to_string).collect(),
                    retry,
                    fatal_on_error: fatal,
                    enabled: true,
                })
                .expect("sequence");
        }
        template.id
    }

    fn home(&self, username: &str) -> PathBuf {
        PathBuf::from(&self.settings.workspace_base_dir).join(username)
    }
}

#[test]
#[serial]
fn happy_path_provision_end_to_end() {
    let fx = Fixture::new();
    let template_id = fx.insert_template(
        false,
        vec![
            ("ssh_key", "generate_ssh_key", 1, vec![], json!({}), RetrySpec::default(), true),
            (
                "workdir",
                "create_directory",
                2,
                vec!["ssh_key"],
                json!({"path": "{home_directory}/work"}),
                RetrySpec::default(),
                true,
            ),
            (
                "done",
                "display_completion_message",
                3,
                vec!["workdir"],
                json!({}),
                RetrySpec::default(),
                false,
            ),
        ],
    );

    temp_env::with_vars(fx.env_vars(), || {
        let api = Api::new(&fx.store, &fx.settings);
        let created = api
            .create_workspace(
                fx.actor,
                CreateWorkspaceRequest {
                    name: "x".to_string(),
                    template_id: Some(template_id),
                },
                Some("10.0.0.1"),
            )
            .expect("create");

        let outcome = api.run_provisioning(created.workspace_id).expect("provision");
        assert!(outcome.paused.is_none());
        assert_eq!(
            outcome.workspace_url.as_deref(),
            Some("https://acme-x.berth.dev")
        );

        // Row facts.
        let ws = fx.store.workspace(created.workspace_id).expect("ws");
        assert_eq!(ws.subdomain, "acme-x");
        assert_eq!(ws.linux_username, "acme_x");
        assert_eq!(ws.port, 8001);
        assert_eq!(ws.status, WorkspaceStatus::Active);
        assert_eq!(ws.provisioning_state, ProvisioningState::Completed);
        assert!(ws.is_running);
        assert!(ws.last_started_at.is_some());

        // All three execution records completed.
        let mut execs = fx.store.executions_of_workspace(ws.id).expect("execs");
        execs.sort_by_key(|e| e.id);
        assert_eq!(execs.len(), 3);
        assert!(execs.iter().all(|e| e.status == ExecutionStatus::Completed));

        // OS side effects (through the fakes).
        assert_eq!(
            logged(fx.bin.path(), "useradd"),
            vec![format!("-m -s /bin/bash -d {} acme_x", fx.home("acme_x").display())]
        );
        let systemctl_calls = logged(fx.bin.path(), "systemctl");
        assert!(systemctl_calls.contains(&"daemon-reload".to_string()));
        assert!(systemctl_calls.contains(&"enable code-server@acme_x.service".to_string()));
        assert!(systemctl_calls.contains(&"start code-server@acme_x.service".to_string()));

        // Template side effects in the workspace home.
        assert!(fx.home("acme_x").join(".ssh/id_ed25519.pub").is_file());
        assert!(fx.home("acme_x").join("work").is_dir());

        // code-server config and the per-instance drop-in.
        let cs_config = std::fs::read_to_string(
            fx.home("acme_x").join(".config/code-server/config.yaml"),
        )
        .expect("config");
        assert_eq!(cs_config, "bind-addr: 127.0.0.1:8001\nauth: none\ncert: false\n");
        let dropin = std::fs::read_to_string(
            PathBuf::from(&fx.settings.systemd_unit_dir)
                .join("code-server@acme_x.service.d/override.conf"),
        )
        .expect("dropin");
        assert!(dropin.contains("Environment=\"PORT=8001\""));

        // Proxy dynamic config carries the router and backend.
        let proxy_yaml =
            std::fs::read_to_string(&fx.settings.proxy_config_path).expect("proxy yaml");
        assert!(proxy_yaml.contains("workspace-acme-x"));
        assert!(proxy_yaml.contains("Host(`acme-x.berth.dev`)"));
        assert!(proxy_yaml.contains("http://127.0.0.1:8001"));

        // Status endpoint reports completion.
        let status = api.workspace_status(fx.actor, ws.id).expect("status");
        assert_eq!(status.status, "active");
        assert_eq!(status.progress_percent, 100);
        assert_eq!(status.actions.len(), 3);

        // Journal tail flows through.
        let logs = api.workspace_logs(fx.actor, ws.id, 50, None).expect("logs");
        assert!(logs.contains("journal line one"));
    });
}

#[test]
#[serial]
fn circular_dependencies_abort_before_any_action() {
    let fx = Fixture::new();
    let template_id = fx.insert_template(
        false,
        vec![
            ("a", "create_directory", 1, vec!["b"], json!({"path": "~/a"}), RetrySpec::default(), true),
            ("b", "create_directory", 2, vec!["a"], json!({"path": "~/b"}), RetrySpec::default(), true),
        ],
    );

    temp_env::with_vars(fx.env_vars(), || {
        let api = Api::new(&fx.store, &fx.settings);
        let created = api
            .create_workspace(
                fx.actor,
                CreateWorkspaceRequest {
                    name: "loop".to_string(),
                    template_id: Some(template_id),
                },
                None,
            )
            .expect("create");

        let err = api.run_provisioning(created.workspace_id).expect_err("must fail");
        assert!(matches!(err, CoreError::ProvisionFailed { .. }));

        let ws = fx.store.workspace(created.workspace_id).expect("ws");
        assert_eq!(ws.status, WorkspaceStatus::Failed);
        assert!(
            ws.progress_message.as_deref().unwrap_or_default().contains("Circular"),
            "progress message should name the cycle: {:?}",
            ws.progress_message
        );

        // Zero actions ran.
        assert!(fx.store.executions_of_workspace(ws.id).expect("execs").is_empty());

        // Infrastructure was unwound: the user created earlier got deleted.
        assert_eq!(logged(fx.bin.path(), "userdel"), vec!["-r acme_loop"]);
    });
}

#[test]
#[serial]
fn fatal_action_failure_rolls_back_completed_work() {
    let fx = Fixture::new();
    // git always fails; three attempts with no delay.
    let template_id = fx.insert_template(
        true,
        vec![
            ("ssh_key", "generate_ssh_key", 1, vec![], json!({}), RetrySpec::default(), true),
            (
                "clone",
                "clone_git_repository",
                2,
                vec!["ssh_key"],
                json!({
                    "repository_url": "git@github.com:acme/app.git",
                    "destination_path": "{home_directory}/app",
                }),
                RetrySpec {
                    max_attempts: 3,
                    retry_delay_seconds: 0,
                    exponential_backoff: true,
                },
                true,
            ),
        ],
    );

    let mut env = fx.env_vars();
    let git = fake_bin(
        fx.bin.path(),
        "git",
        &format!(
            "echo \"$@\" >> '{}/git.log'\necho 'fatal: could not read from remote' >&2\nexit 128",
            fx.bin.path().display()
        ),
    );
    env.push(("BERTH_GIT_BIN".to_string(), Some(git.to_string_lossy().to_string())));

    temp_env::with_vars(env, || {
        let api = Api::new(&fx.store, &fx.settings);
        let created = api
            .create_workspace(
                fx.actor,
                CreateWorkspaceRequest {
                    name: "x".to_string(),
                    template_id: Some(template_id),
                },
                None,
            )
            .expect("create");

        let err = api.run_provisioning(created.workspace_id).expect_err("must fail");
        assert!(matches!(err, CoreError::ProvisionFailed { .. }));

        let ws = fx.store.workspace(created.workspace_id).expect("ws");
        assert_eq!(ws.status, WorkspaceStatus::Failed);

        // All three clone attempts actually ran.
        assert_eq!(logged(fx.bin.path(), "git").len(), 3);

        // Records: the key generation rolled back, the clone failed.
        let mut execs = fx.store.executions_of_workspace(ws.id).expect("execs");
        execs.sort_by_key(|e| e.id);
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].action_id, "ssh_key");
        assert_eq!(execs[0].status, ExecutionStatus::RolledBack);
        assert_eq!(execs[0].rollback_successful, Some(true));
        assert_eq!(execs[1].action_id, "clone");
        assert_eq!(execs[1].status, ExecutionStatus::Failed);
        assert_eq!(execs[1].attempt_number, 3);

        // Compensated side effects: no key files, no clone directory.
        assert!(!fx.home("acme_x").join(".ssh/id_ed25519").exists());
        assert!(!fx.home("acme_x").join("app").exists());

        // The failed row still holds its reservations.
        let reserved = fx.store.reserved_ports().expect("ports");
        assert!(reserved.contains(&8001));
    });
}

#[test]
#[serial]
fn pause_for_ssh_verification_then_resume_to_active() {
    let fx = Fixture::new();
    let template_id = fx.insert_template(
        false,
        vec![
            ("ssh_key", "generate_ssh_key", 1, vec![], json!({}), RetrySpec::default(), true),
            (
                "verify",
                "verify_ssh_key",
                2,
                vec!["ssh_key"],
                json!({}),
                RetrySpec::default(),
                true,
            ),
            (
                "workdir",
                "create_directory",
                3,
                vec!["verify"],
                json!({"path": "{home_directory}/work"}),
                RetrySpec::default(),
                true,
            ),
        ],
    );

    temp_env::with_vars(fx.env_vars(), || {
        let api = Api::new(&fx.store, &fx.settings);
        let created = api
            .create_workspace(
                fx.actor,
                CreateWorkspaceRequest {
                    name: "x".to_string(),
                    template_id: Some(template_id),
                },
                None,
            )
            .expect("create");

        // First run pauses awaiting verification; the key is on disk and
        // surfaced in the pause payload; no proxy route yet.
        let outcome = api.run_provisioning(created.workspace_id).expect("provision");
        let paused = outcome.paused.expect("must pause");
        assert_eq!(paused.action_id, "verify");
        assert_eq!(paused.payload["public_key"], "ssh-ed25519 AAAA dev@acme.test");

        let ws = fx.store.workspace(created.workspace_id).expect("ws");
        assert_eq!(ws.status, WorkspaceStatus::Paused);
        assert_eq!(ws.provisioning_state, ProvisioningState::AwaitingSshVerification);
        assert!(fx.home("acme_x").join(".ssh/id_ed25519.pub").is_file());
        assert!(!std::path::Path::new(&fx.settings.proxy_config_path).exists());

        // The user confirms via the API; the workflow finishes.
        let outcome = api.verify_ssh(fx.actor, created.workspace_id).expect("resume");
        assert!(outcome.paused.is_none());
        assert_eq!(
            outcome.workspace_url.as_deref(),
            Some("https://acme-x.berth.dev")
        );

        let ws = fx.store.workspace(created.workspace_id).expect("ws");
        assert_eq!(ws.status, WorkspaceStatus::Active);
        assert_eq!(ws.provisioning_state, ProvisioningState::Completed);
        assert!(ws.extra_flag("ssh_verified"));
        assert!(fx.home("acme_x").join("work").is_dir());

        let proxy_yaml =
            std::fs::read_to_string(&fx.settings.proxy_config_path).expect("proxy yaml");
        assert!(proxy_yaml.contains("workspace-acme-x"));

        // Resuming again is a state error.
        assert!(matches!(
            api.verify_ssh(fx.actor, created.workspace_id),
            Err(CoreError::InvalidStateTransition(_))
        ));
    });
}

#[test]
#[serial]
fn provision_then_deprovision_leaves_no_residue() {
    let fx = Fixture::new();

    temp_env::with_vars(fx.env_vars(), || {
        let api = Api::new(&fx.store, &fx.settings);
        let created = api
            .create_workspace(
                fx.actor,
                CreateWorkspaceRequest {
                    name: "x".to_string(),
                    template_id: None,
                },
                None,
            )
            .expect("create");
        api.run_provisioning(created.workspace_id).expect("provision");

        api.delete_workspace(fx.actor, created.workspace_id).expect("delete");

        // Row gone, port released.
        assert!(fx.store.workspace(created.workspace_id).is_err());
        assert!(fx.store.reserved_ports().expect("ports").is_empty());

        // Proxy route gone.
        let proxy_yaml =
            std::fs::read_to_string(&fx.settings.proxy_config_path).expect("proxy yaml");
        assert!(!proxy_yaml.contains("workspace-acme-x"));

        // Drop-in directory gone; user deleted with home tree.
        assert!(
            !PathBuf::from(&fx.settings.systemd_unit_dir)
                .join("code-server@acme_x.service.d")
                .exists()
        );
        assert_eq!(logged(fx.bin.path(), "userdel"), vec!["-r acme_x"]);
        let systemctl_calls = logged(fx.bin.path(), "systemctl");
        assert!(systemctl_calls.contains(&"stop code-server@acme_x.service".to_string()));
        assert!(systemctl_calls.contains(&"disable code-server@acme_x.service".to_string()));
    });
}

#[test]
#[serial]
fn port_allocation_fills_range_then_exhausts() {
    let fx = Fixture::new();

    temp_env::with_vars(fx.env_vars(), || {
        let api = Api::new(&fx.store, &fx.settings);
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let created = api
                .create_workspace(
                    fx.actor,
                    CreateWorkspaceRequest {
                        name: name.to_string(),
                        template_id: None,
                    },
                    None,
                )
                .expect("create");
            let ws = fx.store.workspace(created.workspace_id).expect("ws");
            assert_eq!(ws.port, 8001 + i as u16);
        }

        // Range 8001..=8003 is now full.
        let provisioner = Provisioner::new(&fx.store, &fx.settings);
        assert!(matches!(
            provisioner.allocate_port(),
            Err(CoreError::PortExhausted { start: 8001, end: 8003 })
        ));
    });
}
