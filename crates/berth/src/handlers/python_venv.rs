//! Python virtualenv creation.

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_str, require_str,
    run_checked,
};

pub struct CreatePythonVenv {
    ctx: WorkspaceContext,
}

impl CreatePythonVenv {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for CreatePythonVenv {
    fn kind(&self) -> &'static str {
        "create_python_venv"
    }

    fn display_name(&self) -> &'static str {
        "Create Python Virtualenv"
    }

    fn category(&self) -> &'static str {
        "python"
    }

    fn description(&self) -> &'static str {
        "Create a Python virtual environment in the workspace"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["venv_path"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["python_binary"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        let python = opt_str(params, "python_binary").unwrap_or("python3");
        ensure_tool(python)?;
        require_str(params, "venv_path")?;
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let venv_path = require_str(params, "venv_path")?;
        let python = opt_str(params, "python_binary").unwrap_or("python3");

        // Refuse to overwrite; an existing venv may carry user state.
        if Path::new(venv_path).exists() {
            return Err(CoreError::invalid_input(format!(
                "venv path already exists: {venv_path}"
            )));
        }

        run_checked(
            CommandSpec::new(python)
                .args(["-m", "venv", venv_path])
                .env("HOME", &self.ctx.home_directory)
                .timeout(Duration::from_secs(120)),
            python,
        )?;

        let _ = CommandSpec::new("chown")
            .arg("-R")
            .arg(format!("{0}:{0}", self.ctx.linux_username))
            .arg(venv_path)
            .timeout(Duration::from_secs(30))
            .run();

        Ok(HandlerOutcome::Completed(json!({
            "venv_path": venv_path,
            "python_binary": python,
        })))
    }

    fn rollback(&self, params: &Value, _result: &Value) -> CoreResult<()> {
        let venv_path = require_str(params, "venv_path")?;
        match std::fs::remove_dir_all(venv_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Other(anyhow::anyhow!(
                "failed to remove {venv_path}: {e}"
            ))),
        }
    }
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
    fn creates_venv_and_refuses_overwrite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = tempfile::tempdir().expect("bindir");
        let python = fake_bin(
            bin.path(),
            "python3",
            &format!(
                "echo \"$@\" >> '{}/python3.log'\nmkdir -p \"$3\"\nexit 0",
                bin.path().display()
            ),
        );
        let chown = fake_bin(bin.path(), "chown", "exit 0");

        temp_env::with_vars(
            [
                (bin_env("python3"), Some(python.to_str().unwrap().to_string())),
                (bin_env("chown"), Some(chown.to_str().unwrap().to_string())),
            ],
            || {
                let handler = CreatePythonVenv::new(test_context(dir.path()));
                let venv = dir.path().join("venv");
                let params = json!({"venv_path": venv.to_str().unwrap()});
                handler.validate(&params).expect("validate");

                handler.execute(&params).expect("execute");
                assert!(venv.is_dir());
                assert_eq!(
                    logged_calls(bin.path(), "python3"),
                    vec![format!("-m venv {}", venv.display())]
                );

                let err = handler.execute(&params).expect_err("must fail");
                assert!(err.to_string().contains("already exists"));

                handler.rollback(&params, &json!({})).expect("rollback");
                assert!(!venv.exists());
                handler.rollback(&params, &json!({})).expect("rollback twice");
            },
        );
    }
}
