//! SSH keypair generation for the workspace account.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, info};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_bool, opt_str, run_checked,
};

/// Creates `~/.ssh` (0700) and an `id_<type>` keypair (0600/0644), optionally
/// seeding `known_hosts` with GitHub's host keys. Re-running with an existing
/// key is a no-op reported as `already_existed`.
pub struct GenerateSshKey {
    ctx: WorkspaceContext,
}

impl GenerateSshKey {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    fn key_paths(&self, params: &Value) -> (String, String, String) {
        let key_type = opt_str(params, "key_type").unwrap_or("ed25519").to_string();
        let name = opt_str(params, "key_name")
            .map(str::to_string)
            .unwrap_or_else(|| format!("id_{key_type}"));
        let private = format!("{}/.ssh/{}", self.ctx.home_directory, name);
        let public = format!("{private}.pub");
        (key_type, private, public)
    }
}

impl ActionHandler for GenerateSshKey {
    fn kind(&self) -> &'static str {
        "generate_ssh_key"
    }

    fn display_name(&self) -> &'static str {
        "Generate SSH Key"
    }

    fn category(&self) -> &'static str {
        "security"
    }

    fn description(&self) -> &'static str {
        "Generate an SSH keypair in the workspace account"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["key_type", "key_name", "comment", "add_github_known_hosts"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("ssh-keygen")?;
        let key_type = opt_str(params, "key_type").unwrap_or("ed25519");
        if !matches!(key_type, "ed25519" | "rsa" | "ecdsa") {
            return Err(CoreError::invalid_input(format!(
                "unsupported key type: {key_type}"
            )));
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let (key_type, private, public) = self.key_paths(params);
        let ssh_dir = format!("{}/.ssh", self.ctx.home_directory);

        std::fs::create_dir_all(&ssh_dir)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to create {ssh_dir}: {e}")))?;
        set_mode(&ssh_dir, 0o700);

        if Path::new(&private).exists() {
            debug!(key = %private, "ssh key already present");
            let public_key = read_public_key(&public)?;
            return Ok(HandlerOutcome::Completed(json!({
                "key_path": private,
                "public_key_path": public,
                "public_key": public_key,
                "key_type": key_type,
                "already_existed": true,
            })));
        }

        let comment = opt_str(params, "comment")
            .map(str::to_string)
            .or_else(|| self.ctx.user_email.clone())
            .unwrap_or_else(|| {
                format!("{}@{}", self.ctx.linux_username, self.ctx.base_domain)
            });

        run_checked(
            CommandSpec::new("ssh-keygen")
                .args([
                    "-t",
                    key_type.as_str(),
                    "-f",
                    private.as_str(),
                    "-N",
                    "",
                    "-C",
                    comment.as_str(),
                ])
                .timeout(Duration::from_secs(30)),
            "ssh-keygen",
        )?;

        set_mode(&private, 0o600);
        set_mode(&public, 0o644);

        if opt_bool(params, "add_github_known_hosts", false) {
            let known_hosts = format!("{ssh_dir}/known_hosts");
            let scan = CommandSpec::new("ssh-keyscan")
                .args(["-t", "ed25519,rsa", "github.com"])
                .timeout(Duration::from_secs(15))
                .run();
            if let Ok(out) = scan {
                if out.success() {
                    append_file(&known_hosts, &out.stdout);
                    set_mode(&known_hosts, 0o644);
                }
            }
        }

        // Ownership fix-up is best-effort: on a real host the service runs
        // privileged and hands the tree to the workspace account.
        let _ = CommandSpec::new("chown")
            .arg("-R")
            .arg(format!("{0}:{0}", self.ctx.linux_username))
            .arg(&ssh_dir)
            .timeout(Duration::from_secs(10))
            .run();

        let public_key = read_public_key(&public)?;
        info!(key = %private, "generated ssh key");

        Ok(HandlerOutcome::Completed(json!({
            "key_path": private,
            "public_key_path": public,
            "public_key": public_key,
            "key_type": key_type,
            "already_existed": false,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        // Leave keys that predate this action alone.
        if result.get("already_existed").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let (_, private, public) = self.key_paths(params);
        for path in [&private, &public] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CoreError::Other(anyhow::anyhow!(
                        "failed to remove {path}: {e}"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn set_mode(path: &str, mode: u32) {
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

fn append_file(path: &str, content: &str) {
    use std::io::Write;
    if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
        let _ = file.write_all(content.as_bytes());
    }
}

fn read_public_key(path: &str) -> CoreResult<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to read {path}: {e}")))
}
