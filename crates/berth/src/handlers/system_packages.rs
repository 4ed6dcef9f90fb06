//! OS package installation. Runs with elevated privileges; the only handler
//! that does.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_bool, run_checked, str_list,
};

const APT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct InstallSystemPackages {
    #[allow(dead_code)]
    ctx: WorkspaceContext,
}

impl InstallSystemPackages {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for InstallSystemPackages {
    fn kind(&self) -> &'static str {
        "install_system_packages"
    }

    fn display_name(&self) -> &'static str {
        "Install System Packages"
    }

    fn category(&self) -> &'static str {
        "packages"
    }

    fn description(&self) -> &'static str {
        "Install apt packages on the host"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["packages"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["update"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("apt-get")?;
        let packages = str_list(params, "packages");
        if packages.is_empty() {
            return Err(CoreError::invalid_input("packages list must not be empty"));
        }
        for name in &packages {
            if !name.chars().all(|c| c.is_ascii_alphanumeric() || "+-._:".contains(c)) {
                return Err(CoreError::invalid_input(format!("invalid package name: {name}")));
            }
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let packages = str_list(params, "packages");
        let update = opt_bool(params, "update", true);

        if update {
            run_checked(
                CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout(APT_TIMEOUT),
                "apt-get",
            )?;
        }

        let mut installed = Vec::new();
        for name in &packages {
            run_checked(
                CommandSpec::new("apt-get")
                    .args(["install", "-y", name.as_str()])
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .timeout(APT_TIMEOUT),
                "apt-get",
            )?;
            installed.push(name.clone());
        }

        info!(count = installed.len(), "installed system packages");
        Ok(HandlerOutcome::Completed(json!({
            "installed": installed,
            "updated_index": update,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        // Remove what we know got in; a package that failed to install is
        // not in the result and is left alone.
        let installed = result
            .get("installed")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_else(|| str_list(params, "packages"));

        for name in installed {
            let out = CommandSpec::new("apt-get")
                .args(["remove", "-y", name.as_str()])
                .env("DEBIAN_FRONTEND", "noninteractive")
                .timeout(APT_TIMEOUT)
                .run();
            if let Ok(out) = out {
                if !out.success() {
                    warn!(package = %name, "best-effort package removal failed");
                }
            }
        }
        Ok(())
    }
}
