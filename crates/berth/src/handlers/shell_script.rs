//! Arbitrary shell commands in the workspace home. The escape hatch for
//! anything the typed handlers do not cover; no automatic idempotency and no
//! rollback.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use serde_json::{Value, json};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, opt_str, opt_u64, run_checked, tail};

const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub struct ExecuteShellScript {
    ctx: WorkspaceContext,
}

impl ExecuteShellScript {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for ExecuteShellScript {
    fn kind(&self) -> &'static str {
        "execute_shell_script"
    }

    fn display_name(&self) -> &'static str {
        "Execute Shell Script"
    }

    fn category(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Run an inline command, a script file, or inline script content"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["command", "script_file", "content", "timeout_seconds"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        let sources = [
            opt_str(params, "command").is_some(),
            opt_str(params, "script_file").is_some(),
            opt_str(params, "content").is_some(),
        ];
        match sources.iter().filter(|x| **x).count() {
            0 => Err(CoreError::invalid_input(
                "one of command, script_file, or content is required",
            )),
            1 => Ok(()),
            _ => Err(CoreError::invalid_input(
                "command, script_file, and content are mutually exclusive",
            )),
        }
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let timeout = Duration::from_secs(opt_u64(params, "timeout_seconds", DEFAULT_TIMEOUT_SECS));

        // Inline content is staged as a script file in the home directory
        // and removed afterwards.
        let mut staged: Option<String> = None;
        let (program, args): (String, Vec<String>) = if let Some(command) = opt_str(params, "command")
        {
            ("sh".to_string(), vec!["-c".to_string(), command.to_string()])
        } else if let Some(file) = opt_str(params, "script_file") {
            ("sh".to_string(), vec![file.to_string()])
        } else {
            let content = opt_str(params, "content")
                .ok_or_else(|| CoreError::invalid_input("content missing"))?;
            let path = format!(
                "{}/.berth-script-{}.sh",
                self.ctx.home_directory,
                std::process::id()
            );
            std::fs::write(&path, content)
                .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to stage script: {e}")))?;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700));
            staged = Some(path.clone());
            ("sh".to_string(), vec![path])
        };

        let result = run_checked(
            CommandSpec::new(&program)
                .args(args)
                .current_dir(&self.ctx.home_directory)
                .env("HOME", &self.ctx.home_directory)
                .env("USER", &self.ctx.linux_username)
                .timeout(timeout),
            "sh",
        );

        if let Some(path) = staged {
            let _ = std::fs::remove_file(path);
        }

        let out = result?;
        Ok(HandlerOutcome::Completed(json!({
            "exit_code": out.exit_code,
            "stdout_tail": tail(&out.stdout, 50),
            "stderr_tail": tail(&out.stderr, 50),
            "duration_ms": out.duration.as_millis() as u64,
        })))
    }

    fn rollback(&self, _params: &Value, _result: &Value) -> CoreResult<()> {
        // Arbitrary shell effects have no general inverse.
        Ok(())
    }
}
