//! Directory creation inside the workspace home.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, opt_bool, require_str};

pub struct CreateDirectory {
    ctx: WorkspaceContext,
}

impl CreateDirectory {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for CreateDirectory {
    fn kind(&self) -> &'static str {
        "create_directory"
    }

    fn display_name(&self) -> &'static str {
        "Create Directory"
    }

    fn category(&self) -> &'static str {
        "filesystem"
    }

    fn description(&self) -> &'static str {
        "Create a directory with optional mode"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["mode", "parents", "exist_ok"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        require_str(params, "path")?;
        if params.get("mode").is_some() && parse_mode(params.get("mode")).is_none() {
            return Err(CoreError::invalid_input("mode must be an octal string like \"0755\""));
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let path = require_str(params, "path")?;
        let parents = opt_bool(params, "parents", true);
        let exist_ok = opt_bool(params, "exist_ok", true);

        let pre_existing = Path::new(path).is_dir();
        if pre_existing && !exist_ok {
            return Err(CoreError::invalid_input(format!(
                "directory already exists: {path}"
            )));
        }

        if !pre_existing {
            let result = if parents {
                std::fs::create_dir_all(path)
            } else {
                std::fs::create_dir(path)
            };
            result.map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to create {path}: {e}"))
            })?;
        }

        if let Some(mode) = parse_mode(params.get("mode")) {
            let perms = std::fs::Permissions::from_mode(mode);
            std::fs::set_permissions(path, perms).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to chmod {path}: {e}"))
            })?;
        }

        let _ = CommandSpec::new("chown")
            .arg(format!("{0}:{0}", self.ctx.linux_username))
            .arg(path)
            .timeout(Duration::from_secs(10))
            .run();

        Ok(HandlerOutcome::Completed(json!({
            "path": path,
            "pre_existing": pre_existing,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        if result.get("pre_existing").and_then(Value::as_bool) == Some(true) {
            return Ok(());
        }
        let path = require_str(params, "path")?;
        // Only an empty directory is removed; anything the user put inside
        // outlives the rollback.
        match std::fs::remove_dir(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(_) => Ok(()),
        }
    }
}

/// Accepts `"0755"`, `"755"`, or a JSON number holding octal-looking digits.
fn parse_mode(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::String(s) => u32::from_str_radix(s.trim_start_matches("0o").trim_start_matches('0').trim_start_matches('o'), 8)
            .ok()
            .or_else(|| u32::from_str_radix(s, 8).ok()),
        Value::Number(n) => {
            let digits = n.as_u64()?.to_string();
            u32::from_str_radix(&digits, 8).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::test_context;

    #[test]
    fn creates_nested_directory_with_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = CreateDirectory::new(test_context(dir.path()));
        let target = dir.path().join("a/b/c");
        let params = json!({"path": target.to_str().unwrap(), "mode": "0750"});

        handler.validate(&params).expect("validate");
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert!(target.is_dir());
        assert_eq!(result["pre_existing"], false);
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[test]
    fn exist_ok_defaults_true_and_can_be_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = CreateDirectory::new(test_context(dir.path()));
        let target = dir.path().join("w");
        std::fs::create_dir(&target).expect("mkdir");

        let params = json!({"path": target.to_str().unwrap()});
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["pre_existing"], true);

        let strict = json!({"path": target.to_str().unwrap(), "exist_ok": false});
        assert!(handler.execute(&strict).is_err());
    }

    #[test]
    fn parents_false_fails_on_missing_intermediate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = CreateDirectory::new(test_context(dir.path()));
        let target = dir.path().join("missing/leaf");
        let params = json!({"path": target.to_str().unwrap(), "parents": false});
        assert!(handler.execute(&params).is_err());
    }

    #[test]
    fn rollback_removes_only_empty_created_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = CreateDirectory::new(test_context(dir.path()));
        let target = dir.path().join("w");
        let params = json!({"path": target.to_str().unwrap()});

        handler.execute(&params).expect("execute");
        handler
            .rollback(&params, &json!({"pre_existing": false}))
            .expect("rollback");
        assert!(!target.exists());

        // Pre-existing directories survive rollback.
        std::fs::create_dir(&target).expect("mkdir");
        handler
            .rollback(&params, &json!({"pre_existing": true}))
            .expect("rollback");
        assert!(target.exists());

        // A non-empty directory is left in place.
        std::fs::write(target.join("keep.txt"), "x").expect("write");
        handler
            .rollback(&params, &json!({"pre_existing": false}))
            .expect("rollback");
        assert!(target.exists());
    }

    #[test]
    fn mode_parsing_accepts_common_spellings() {
        assert_eq!(parse_mode(Some(&json!("0755"))), Some(0o755));
        assert_eq!(parse_mode(Some(&json!("755"))), Some(0o755));
        assert_eq!(parse_mode(Some(&json!(700))), Some(0o700));
        assert_eq!(parse_mode(Some(&json!("porridge"))), None);
        assert_eq!(parse_mode(None), None);
    }
}
