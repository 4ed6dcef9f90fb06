//! pip installs, into a venv or the system interpreter.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_bool, opt_str, run_checked,
    str_list,
};

const PIP_TIMEOUT: Duration = Duration::from_secs(900);

pub struct InstallPipRequirements {
    ctx: WorkspaceContext,
}

impl InstallPipRequirements {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    fn pip_program(params: &Value) -> String {
        match opt_str(params, "venv_path") {
            Some(venv) => format!("{venv}/bin/pip"),
            None => "pip".to_string(),
        }
    }
}

impl ActionHandler for InstallPipRequirements {
    fn kind(&self) -> &'static str {
        "install_pip_requirements"
    }

    fn display_name(&self) -> &'static str {
        "Install Pip Requirements"
    }

    fn category(&self) -> &'static str {
        "python"
    }

    fn description(&self) -> &'static str {
        "Install Python packages from a requirements file and/or a list"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["requirements_file", "packages", "venv_path", "upgrade"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        let has_file = opt_str(params, "requirements_file").is_some();
        let has_packages = !str_list(params, "packages").is_empty();
        if !has_file && !has_packages {
            return Err(CoreError::invalid_input(
                "either requirements_file or packages must be provided",
            ));
        }
        // A venv ships its own pip; only the system install needs the tool.
        if opt_str(params, "venv_path").is_none() {
            ensure_tool("pip")?;
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let pip = Self::pip_program(params);
        let packages = str_list(params, "packages");
        let upgrade = opt_bool(params, "upgrade", false);

        let mut spec = CommandSpec::new(&pip)
            .arg("install")
            .env("HOME", &self.ctx.home_directory)
            .timeout(PIP_TIMEOUT);
        if upgrade {
            spec = spec.arg("--upgrade");
        }
        if let Some(file) = opt_str(params, "requirements_file") {
            spec = spec.args(["-r", file]);
        }
        spec = spec.args(packages.iter().cloned());

        run_checked(spec, &pip)?;

        Ok(HandlerOutcome::Completed(json!({
            "pip": pip,
            "packages": packages,
            "requirements_file": opt_str(params, "requirements_file"),
            "upgraded": upgrade,
        })))
    }

    fn rollback(&self, params: &Value, _result: &Value) -> CoreResult<()> {
        // Only the explicitly listed packages are uninstalled; unpicking a
        // requirements file would take out shared dependencies.
        let packages = str_list(params, "packages");
        if packages.is_empty() {
            return Ok(());
        }
        let pip = Self::pip_program(params);
        let mut spec = CommandSpec::new(&pip)
            .args(["uninstall", "-y"])
            .timeout(PIP_TIMEOUT);
        spec = spec.args(packages.iter().cloned());
        if let Ok(out) = spec.run() {
            if !out.success() {
                warn!(pip = %pip, "best-effort pip uninstall failed");
            }
        }
        Ok(())
    }
}
