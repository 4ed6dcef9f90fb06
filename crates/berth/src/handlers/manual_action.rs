//! Manual steps: the workflow pauses, the user does something by hand, the
//! resume API continues.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, PauseKind, PauseReason, WorkspaceContext, opt_bool, opt_str,
    opt_u64, require_str, tail,
};

pub struct ManualAction {
    ctx: WorkspaceContext,
}

impl ManualAction {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for ManualAction {
    fn kind(&self) -> &'static str {
        "manual_action"
    }

    fn display_name(&self) -> &'static str {
        "Manual Action"
    }

    fn category(&self) -> &'static str {
        "manual"
    }

    fn description(&self) -> &'static str {
        "Pause provisioning for a manual step, optionally verified by a command"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["instructions"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["verification_command", "timeout_seconds", "allow_skip"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        require_str(params, "instructions")?;
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let instructions = require_str(params, "instructions")?;
        let allow_skip = opt_bool(params, "allow_skip", false);

        // First pass pauses; the resumed pass (marker set by the resume API)
        // verifies and completes.
        if !self.ctx.extra_flag("manual_step_completed") {
            return Ok(HandlerOutcome::Paused(PauseReason {
                kind: PauseKind::ManualStep,
                message: "Waiting for a manual step".to_string(),
                payload: json!({
                    "instructions": instructions,
                    "allow_skip": allow_skip,
                    "timeout_seconds": opt_u64(params, "timeout_seconds", 600),
                }),
            }));
        }

        let mut verified = false;
        let mut verification_output = None;
        if let Some(command) = opt_str(params, "verification_command") {
            let out = CommandSpec::new("sh")
                .args(["-c", command])
                .current_dir(&self.ctx.home_directory)
                .env("HOME", &self.ctx.home_directory)
                .timeout(Duration::from_secs(30))
                .run()
                .map_err(CoreError::Other)?;
            verified = out.success();
            verification_output = Some(tail(&out.stdout, 20));
            if !verified && !allow_skip {
                warn!(workspace = self.ctx.workspace_id, "manual step verification failed");
                return Err(CoreError::ActionFailed {
                    action_id: "manual_action".to_string(),
                    message: format!(
                        "manual step verification failed: {}",
                        out.stderr_tail(3)
                    ),
                });
            }
        } else {
            verified = true;
        }

        Ok(HandlerOutcome::Completed(json!({
            "instructions": instructions,
            "verified": verified,
            "verification_output": verification_output,
        })))
    }

    fn rollback(&self, _params: &Value, _result: &Value) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::test_context;

    #[test]
    fn first_run_pauses_with_instructions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = ManualAction::new(test_context(dir.path()));
        let params = json!({"instructions": "Import your license file"});

        let HandlerOutcome::Paused(reason) = handler.execute(&params).expect("execute") else {
            panic!("expected pause");
        };
        assert_eq!(reason.kind, PauseKind::ManualStep);
        assert_eq!(reason.payload["instructions"], "Import your license file");
    }

    #[test]
    fn resumed_run_verifies_and_completes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("license.key"), "x").expect("write");

        let mut ctx = test_context(dir.path());
        ctx.extra = json!({"manual_step_completed": true});
        let handler = ManualAction::new(ctx);
        let params = json!({
            "instructions": "Import your license file",
            "verification_command": "test -f license.key",
        });

        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["verified"], true);
    }

    #[test]
    fn failed_verification_fails_unless_skippable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(dir.path());
        ctx.extra = json!({"manual_step_completed": true});
        let handler = ManualAction::new(ctx);

        let strict = json!({
            "instructions": "x",
            "verification_command": "test -f missing.key",
        });
        assert!(handler.execute(&strict).is_err());

        let lenient = json!({
            "instructions": "x",
            "verification_command": "test -f missing.key",
            "allow_skip": true,
        });
        let HandlerOutcome::Completed(result) = handler.execute(&lenient).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["verified"], false);
    }

    #[test]
    fn no_verification_command_means_trust_the_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ctx = test_context(dir.path());
        ctx.extra = json!({"manual_step_completed": true});
        let handler = ManualAction::new(ctx);

        let HandlerOutcome::Completed(result) = handler
            .execute(&json!({"instructions": "x"}))
            .expect("execute")
        else {
            panic!("expected completion");
        };
        assert_eq!(result["verified"], true);
    }
}
