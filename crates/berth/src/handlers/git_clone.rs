//! Repository cloning into the workspace home.

use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::info;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_bool, opt_str, opt_u64,
    require_str, run_checked,
};

const CLONE_TIMEOUT: Duration = Duration::from_secs(600);

/// `git clone` with optional branch/depth/submodules. Fails when the
/// destination already exists; a partial clone left by a failed attempt is
/// wiped so the retry starts clean.
pub struct CloneGitRepository {
    ctx: WorkspaceContext,
}

impl CloneGitRepository {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for CloneGitRepository {
    fn kind(&self) -> &'static str {
        "clone_git_repository"
    }

    fn display_name(&self) -> &'static str {
        "Clone Git Repository"
    }

    fn category(&self) -> &'static str {
        "repository"
    }

    fn description(&self) -> &'static str {
        "Clone a git repository into the workspace"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["repository_url", "destination_path"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["branch", "depth", "recursive"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("git")?;
        require_str(params, "repository_url")?;
        require_str(params, "destination_path")?;
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let url = require_str(params, "repository_url")?;
        let dest = require_str(params, "destination_path")?;

        if Path::new(dest).exists() {
            return Err(CoreError::invalid_input(format!(
                "clone destination already exists: {dest}"
            )));
        }

        let mut spec = CommandSpec::new("git")
            .arg("clone")
            .env("HOME", &self.ctx.home_directory)
            .timeout(CLONE_TIMEOUT);
        if let Some(branch) = opt_str(params, "branch") {
            spec = spec.args(["--branch", branch]);
        }
        let depth = opt_u64(params, "depth", 0);
        if depth > 0 {
            spec = spec.arg("--depth").arg(depth.to_string());
        }
        if opt_bool(params, "recursive", false) {
            spec = spec.arg("--recursive");
        }
        spec = spec.arg(url).arg(dest);

        if let Err(err) = run_checked(spec, "git") {
            // Do not leave a partial tree behind for the retry.
            let _ = std::fs::remove_dir_all(dest);
            return Err(err);
        }

        let commit = git_query(dest, &["rev-parse", "HEAD"]);
        let branch = git_query(dest, &["rev-parse", "--abbrev-ref", "HEAD"]);

        let _ = CommandSpec::new("chown")
            .arg("-R")
            .arg(format!("{0}:{0}", self.ctx.linux_username))
            .arg(dest)
            .timeout(Duration::from_secs(30))
            .run();

        info!(repository = url, destination = dest, "cloned repository");
        Ok(HandlerOutcome::Completed(json!({
            "repository_url": url,
            "destination_path": dest,
            "commit": commit,
            "branch": branch,
        })))
    }

    fn rollback(&self, params: &Value, _result: &Value) -> CoreResult<()> {
        let dest = require_str(params, "destination_path")?;
        match std::fs::remove_dir_all(dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CoreError::Other(anyhow::anyhow!(
                "failed to remove {dest}: {e}"
            ))),
        }
    }
}

fn git_query(repo: &str, args: &[&str]) -> Option<String> {
    let out = CommandSpec::new("git")
        .args(["-C", repo])
        .args(args.iter().copied())
        .timeout(Duration::from_secs(15))
        .run()
        .ok()?;
    out.success().then(|| out.stdout.trim().to_string())
}
