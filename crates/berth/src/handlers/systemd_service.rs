//! Custom systemd units for workspace daemons (database sidecars, dev
//! servers). The code-server unit itself is owned by the provisioner, not by
//! templates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::info;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_bool, opt_str, require_str,
    run_checked,
};

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_UNIT_DIR: &str = "/etc/systemd/system";

pub struct SystemdService {
    ctx: WorkspaceContext,
}

impl SystemdService {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    fn unit_path(&self, params: &Value, name: &str) -> PathBuf {
        let dir = opt_str(params, "unit_dir").unwrap_or(DEFAULT_UNIT_DIR);
        Path::new(dir).join(format!("{name}.service"))
    }

    fn compose_unit(&self, params: &Value) -> CoreResult<String> {
        if let Some(content) = opt_str(params, "unit_content") {
            return Ok(content.to_string());
        }
        let exec_start = require_str(params, "exec_start")?;
        let description = opt_str(params, "description").unwrap_or("berth workspace service");
        let working_dir = opt_str(params, "working_directory")
            .map(str::to_string)
            .unwrap_or_else(|| self.ctx.home_directory.clone());

        Ok(format!(
            "[Unit]\n\
             Description={description}\n\
             After=network.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             User={user}\n\
             WorkingDirectory={working_dir}\n\
             ExecStart={exec_start}\n\
             Restart=always\n\
             RestartSec=10\n\
             NoNewPrivileges=true\n\
             PrivateTmp=true\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            user = self.ctx.linux_username,
        ))
    }
}

impl ActionHandler for SystemdService {
    fn kind(&self) -> &'static str {
        "systemd_service"
    }

    fn display_name(&self) -> &'static str {
        "Systemd Service"
    }

    fn category(&self) -> &'static str {
        "services"
    }

    fn description(&self) -> &'static str {
        "Install, enable, and start a systemd unit"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["service_name"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &[
            "unit_content",
            "exec_start",
            "description",
            "working_directory",
            "unit_dir",
            "enable",
            "start",
        ]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("systemctl")?;
        let name = require_str(params, "service_name")?;
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.@".contains(c))
        {
            return Err(CoreError::invalid_input(format!("invalid service name: {name}")));
        }
        if opt_str(params, "unit_content").is_none() && opt_str(params, "exec_start").is_none() {
            return Err(CoreError::invalid_input(
                "either unit_content or exec_start must be provided",
            ));
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let name = require_str(params, "service_name")?;
        let unit_path = self.unit_path(params, name);
        let unit = self.compose_unit(params)?;

        let replaced_existing = unit_path.exists();
        if let Some(parent) = unit_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&unit_path, unit).map_err(|e| {
            CoreError::Other(anyhow::anyhow!("failed to write {}: {e}", unit_path.display()))
        })?;

        systemctl(&["daemon-reload"])?;

        let enable = opt_bool(params, "enable", true);
        if enable {
            systemctl(&["enable", &format!("{name}.service")])?;
        }
        let start = opt_bool(params, "start", true);
        if start {
            systemctl(&["start", &format!("{name}.service")])?;
        }

        info!(service = name, "systemd unit installed");
        Ok(HandlerOutcome::Completed(json!({
            "service_name": name,
            "unit_path": unit_path.to_string_lossy(),
            "replaced_existing": replaced_existing,
            "enabled": enable,
            "started": start,
        })))
    }

    fn rollback(&self, params: &Value, _result: &Value) -> CoreResult<()> {
        let name = require_str(params, "service_name")?;
        let service = format!("{name}.service");

        // Stop/disable are best-effort; the unit may never have started.
        let _ = CommandSpec::new("systemctl")
            .args(["stop", service.as_str()])
            .timeout(SYSTEMCTL_TIMEOUT)
            .run();
        let _ = CommandSpec::new("systemctl")
            .args(["disable", service.as_str()])
            .timeout(SYSTEMCTL_TIMEOUT)
            .run();

        let unit_path = self.unit_path(params, name);
        match std::fs::remove_file(&unit_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(CoreError::Other(anyhow::anyhow!(
                    "failed to remove {}: {e}",
                    unit_path.display()
                )));
            }
        }

        systemctl(&["daemon-reload"])?;
        Ok(())
    }
}

fn systemctl(args: &[&str]) -> CoreResult<berth_process::CommandOutput> {
    run_checked(
        CommandSpec::new("systemctl")
            .args(args.iter().copied())
            .timeout(SYSTEMCTL_TIMEOUT),
        "systemctl",
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use serial_test::serial;

    use super::*;
    use crate::handlers::test_context;
    use crate::testutil::{bin_env, fake_bin, logged_calls};

    #[test]
    #[serial]
    fn composes_unit_and_drives_systemctl() {
        let home = tempfile::tempdir().expect("tempdir");
        let units = tempfile::tempdir().expect("unitdir");
        let bin = tempfile::tempdir().expect("bindir");
        let sysctl = fake_bin(
            bin.path(),
            "systemctl",
            &format!("echo \"$@\" >> '{}/systemctl.log'\nexit 0", bin.path().display()),
        );

        temp_env::with_var(bin_env("systemctl"), Some(sysctl.to_str().unwrap()), || {
            let handler = SystemdService::new(test_context(home.path()));
            let params = json!({
                "service_name": "acme-worker",
                "exec_start": "/home/acme_x/venv/bin/python worker.py",
                "description": "Acme background worker",
                "unit_dir": units.path().to_str().unwrap(),
            });
            handler.validate(&params).expect("validate");

            let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute")
            else {
                panic!("expected completion");
            };
            assert_eq!(result["replaced_existing"], false);

            let unit = std::fs::read_to_string(units.path().join("acme-worker.service"))
                .expect("unit file");
            assert!(unit.contains("Description=Acme background worker"));
            assert!(unit.contains("User=acme_x"));
            assert!(unit.contains("ExecStart=/home/acme_x/venv/bin/python worker.py"));
            assert!(unit.contains("Restart=always"));

            assert_eq!(
                logged_calls(bin.path(), "systemctl"),
                vec![
                    "daemon-reload",
                    "enable acme-worker.service",
                    "start acme-worker.service"
                ]
            );

            handler.rollback(&params, &result).expect("rollback");
            assert!(!units.path().join("acme-worker.service").exists());
            let calls = logged_calls(bin.path(), "systemctl");
            assert_eq!(
                &calls[3..],
                ["stop acme-worker.service", "disable acme-worker.service", "daemon-reload"]
            );
        });
    }

    #[test]
    #[serial]
    fn explicit_unit_content_wins_and_overwrites() {
        let home = tempfile::tempdir().expect("tempdir");
        let units = tempfile::tempdir().expect("unitdir");
        let bin = tempfile::tempdir().expect("bindir");
        let sysctl = fake_bin(bin.path(), "systemctl", "exit 0");
        std::fs::write(units.path().join("thing.service"), "old").expect("write");

        temp_env::with_var(bin_env("systemctl"), Some(sysctl.to_str().unwrap()), || {
            let handler = SystemdService::new(test_context(home.path()));
            let params = json!({
                "service_name": "thing",
                "unit_content": "[Service]\nExecStart=/bin/true\n",
                "unit_dir": units.path().to_str().unwrap(),
                "enable": false,
                "start": false,
            });

            let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute")
            else {
                panic!("expected completion");
            };
            assert_eq!(result["replaced_existing"], true);
            assert_eq!(
                std::fs::read_to_string(units.path().join("thing.service")).unwrap(),
                "[Service]\nExecStart=/bin/true\n"
            );
        });
    }

    #[test]
    fn validate_rejects_bad_names_and_missing_exec() {
        let home = tempfile::tempdir().expect("tempdir");
        let handler = SystemdService::new(test_context(home.path()));
        assert!(
            handler
                .validate(&json!({"service_name": "bad name", "exec_start": "x"}))
                .is_err()
        );
        assert!(handler.validate(&json!({"service_name": "ok"})).is_err());
    }
}
