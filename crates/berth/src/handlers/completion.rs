//! Terminal message of a provisioning run.

use serde_json::{Value, json};

use berth_types::CoreResult;

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, opt_bool, opt_str};

/// Emits the final message shown to the user, with the workspace URL and a
/// flag telling the front-end whether to reveal credentials. No side effect.
pub struct DisplayCompletionMessage {
    ctx: WorkspaceContext,
}

impl DisplayCompletionMessage {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for DisplayCompletionMessage {
    fn kind(&self) -> &'static str {
        "display_completion_message"
    }

    fn display_name(&self) -> &'static str {
        "Display Completion Message"
    }

    fn description(&self) -> &'static str {
        "Show the final provisioning message with workspace URLs"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["message", "show_url", "show_credentials"]
    }

    fn validate(&self, _params: &Value) -> CoreResult<()> {
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let message = opt_str(params, "message")
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("Workspace {} is ready.", self.ctx.workspace_name)
            });

        Ok(HandlerOutcome::Completed(json!({
            "message": message,
            "workspace_url": opt_bool(params, "show_url", true)
                .then(|| self.ctx.workspace_url()),
            "show_credentials": opt_bool(params, "show_credentials", false),
        })))
    }

    fn rollback(&self, _params: &Value, _result: &Value) -> CoreResult<()> {
        Ok(())
    }
}
