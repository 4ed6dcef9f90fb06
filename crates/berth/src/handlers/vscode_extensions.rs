//! IDE extension installs via `code-server --install-extension`.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, str_list};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Installs each extension id in turn. Failures are collected; the handler
/// succeeds only if every install succeeded, and the result records which
/// ids made it in so rollback can unpick exactly those.
pub struct InstallVscodeExtensions {
    ctx: WorkspaceContext,
}

impl InstallVscodeExtensions {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for InstallVscodeExtensions {
    fn kind(&self) -> &'static str {
        "install_vscode_extensions"
    }

    fn display_name(&self) -> &'static str {
        "Install IDE Extensions"
    }

    fn category(&self) -> &'static str {
        "ide"
    }

    fn description(&self) -> &'static str {
        "Install code-server extensions for the workspace"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["extensions"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("code-server")?;
        let extensions = str_list(params, "extensions");
        if extensions.is_empty() {
            return Err(CoreError::invalid_input("extensions list must not be empty"));
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let extensions = str_list(params, "extensions");
        let mut installed = Vec::new();
        let mut failed = Vec::new();

        for id in &extensions {
            let out = CommandSpec::new("code-server")
                .args(["--install-extension", id.as_str()])
                .env("HOME", &self.ctx.home_directory)
                .timeout(INSTALL_TIMEOUT)
                .run()
                .map_err(CoreError::Other)?;
            if out.success() {
                installed.push(id.clone());
            } else {
                warn!(extension = %id, "extension install failed");
                failed.push(json!({"id": id, "error": out.stderr_tail(3)}));
            }
        }

        if !failed.is_empty() {
            return Err(CoreError::invalid_input(format!(
                "{} of {} extensions failed to install",
                failed.len(),
                extensions.len()
            )));
        }

        Ok(HandlerOutcome::Completed(json!({
            "installed": installed,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        let installed: Vec<String> = result
            .get("installed")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| str_list(params, "extensions"));

        for id in installed {
            let _ = CommandSpec::new("code-server")
                .args(["--uninstall-extension", id.as_str()])
                .env("HOME", &self.ctx.home_directory)
                .timeout(INSTALL_TIMEOUT)
                .run();
        }
        Ok(())
    }
}
