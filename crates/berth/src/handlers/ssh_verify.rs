//! Human-in-the-loop SSH key verification.
//!
//! The first run surfaces the public key and pauses the workflow; the
//! workspace row is parked in `awaiting_ssh_verification` until the user
//! confirms the key was added to their Git host and the resume API sets the
//! `ssh_verified` marker. The resumed run completes, optionally after an
//! `ssh -T` connection probe.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{info, warn};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, PauseKind, PauseReason, WorkspaceContext, opt_bool, opt_str,
};

const KEY_CANDIDATES: [&str; 3] = ["id_ed25519.pub", "id_rsa.pub", "id_ecdsa.pub"];

pub struct VerifySshKey {
    ctx: WorkspaceContext,
}

impl VerifySshKey {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    /// The public key to present: an explicit `key_path` parameter, a
    /// well-known name, or the newest `*.pub` in `~/.ssh`.
    fn locate_public_key(&self, params: &Value) -> CoreResult<PathBuf> {
        let ssh_dir = PathBuf::from(format!("{}/.ssh", self.ctx.home_directory));

        if let Some(key_path) = opt_str(params, "key_path") {
            let path = if key_path.starts_with('/') {
                PathBuf::from(key_path)
            } else {
                ssh_dir.join(key_path)
            };
            if path.exists() {
                return Ok(path);
            }
            return Err(CoreError::invalid_input(format!(
                "ssh public key not found at {}",
                path.display()
            )));
        }

        for candidate in KEY_CANDIDATES {
            let path = ssh_dir.join(candidate);
            if path.exists() {
                return Ok(path);
            }
        }

        // Fall back to the most recently modified .pub file.
        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        if let Ok(entries) = std::fs::read_dir(&ssh_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("pub") {
                    if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
                            newest = Some((modified, path));
                        }
                    }
                }
            }
        }
        newest.map(|(_, p)| p).ok_or_else(|| {
            CoreError::invalid_input(
                "no ssh public key found; run generate_ssh_key before verify_ssh_key",
            )
        })
    }
}

impl ActionHandler for VerifySshKey {
    fn kind(&self) -> &'static str {
        "verify_ssh_key"
    }

    fn display_name(&self) -> &'static str {
        "Verify SSH Key"
    }

    fn category(&self) -> &'static str {
        "security"
    }

    fn description(&self) -> &'static str {
        "Pause until the user confirms the SSH key was added to their Git host"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["key_path", "verification_url", "run_connection_test"]
    }

    fn validate(&self, _params: &Value) -> CoreResult<()> {
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let key_path = self.locate_public_key(params)?;
        let public_key = std::fs::read_to_string(&key_path)
            .map(|s| s.trim().to_string())
            .map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to read {}: {e}", key_path.display()))
            })?;
        let verification_url =
            opt_str(params, "verification_url").unwrap_or("https://github.com/settings/keys");

        if !self.ctx.extra_flag("ssh_verified") {
            info!(workspace = self.ctx.workspace_id, "pausing for ssh key verification");
            return Ok(HandlerOutcome::Paused(PauseReason {
                kind: PauseKind::SshVerification,
                message: "Add the public key to your Git host, then confirm".to_string(),
                payload: json!({
                    "public_key": public_key,
                    "key_path": key_path.to_string_lossy(),
                    "verification_url": verification_url,
                }),
            }));
        }

        let mut connection_tested = false;
        if opt_bool(params, "run_connection_test", false) {
            // GitHub answers a successful auth probe with exit code 1 and a
            // greeting on stderr.
            let out = CommandSpec::new("ssh")
                .args([
                    "-T",
                    "-o",
                    "StrictHostKeyChecking=no",
                    "-o",
                    "ConnectTimeout=10",
                    "git@github.com",
                ])
                .run_as(&self.ctx.linux_username)
                .timeout(Duration::from_secs(15))
                .run()
                .map_err(CoreError::Other)?;
            connection_tested =
                out.exit_code == 1 && out.stderr.contains("successfully authenticated");
            if !connection_tested {
                warn!(
                    workspace = self.ctx.workspace_id,
                    "ssh connection probe did not confirm authentication"
                );
            }
        }

        Ok(HandlerOutcome::Completed(json!({
            "verified": true,
            "connection_tested": connection_tested,
            "public_key": public_key,
            "key_path": key_path.to_string_lossy(),
        })))
    }

    fn rollback(&self, _params: &Value, _result: &Value) -> CoreResult<()> {
        Ok(())
    }
}
