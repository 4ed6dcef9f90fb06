//! Configuration file writes with prior-version backup.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use serde_json::{Value, json};

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, opt_bool, opt_str, require_str};

/// Writes text (`content`) or JSON (`config_data`) to a path. An existing
/// file is copied to `<path>.backup` first so rollback can restore it.
pub struct WriteConfigurationFile {
    ctx: WorkspaceContext,
}

impl WriteConfigurationFile {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }
}

impl ActionHandler for WriteConfigurationFile {
    fn kind(&self) -> &'static str {
        "write_configuration_file"
    }

    fn display_name(&self) -> &'static str {
        "Write Configuration File"
    }

    fn category(&self) -> &'static str {
        "filesystem"
    }

    fn description(&self) -> &'static str {
        "Write a configuration file, backing up any previous version"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["content", "config_data", "mode", "backup"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        require_str(params, "path")?;
        let has_content = opt_str(params, "content").is_some();
        let has_data = params.get("config_data").map(Value::is_object).unwrap_or(false);
        if !has_content && !has_data {
            return Err(CoreError::invalid_input(
                "either content or config_data must be provided",
            ));
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let path = require_str(params, "path")?;
        let backup = opt_bool(params, "backup", true);

        let body = match opt_str(params, "content") {
            Some(text) => text.to_string(),
            None => {
                let data = params
                    .get("config_data")
                    .ok_or_else(|| CoreError::invalid_input("config_data missing"))?;
                serde_json::to_string_pretty(data)
                    .map_err(|e| CoreError::Other(anyhow::anyhow!("bad config_data: {e}")))?
            }
        };

        let existed = Path::new(path).is_file();
        let backup_path = format!("{path}.backup");
        if existed && backup {
            std::fs::copy(path, &backup_path).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to back up {path}: {e}"))
            })?;
        }

        if let Some(parent) = Path::new(path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(path, &body)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to write {path}: {e}")))?;

        if let Some(mode) = opt_str(params, "mode").and_then(|s| u32::from_str_radix(s.trim_start_matches('0'), 8).ok()) {
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
        }

        let _ = CommandSpec::new("chown")
            .arg(format!("{0}:{0}", self.ctx.linux_username))
            .arg(path)
            .timeout(Duration::from_secs(10))
            .run();

        Ok(HandlerOutcome::Completed(json!({
            "path": path,
            "bytes_written": body.len(),
            "backed_up": existed && backup,
            "created": !existed,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        let path = require_str(params, "path")?;
        let backup_path = format!("{path}.backup");

        if result.get("backed_up").and_then(Value::as_bool) == Some(true)
            && Path::new(&backup_path).is_file()
        {
            std::fs::rename(&backup_path, path).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to restore {path}: {e}"))
            })?;
            return Ok(());
        }

        if result.get("created").and_then(Value::as_bool) == Some(true) {
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

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::handlers::test_context;

    #[test]
    fn writes_text_content_with_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = WriteConfigurationFile::new(test_context(dir.path()));
        let path = dir.path().join("app.conf");
        let params = json!({
            "path": path.to_str().unwrap(),
            "content": "key = value\n",
            "mode": "0600",
        });

        handler.validate(&params).expect("validate");
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "key = value\n");
        assert_eq!(result["created"], true);
        assert_eq!(result["backed_up"], false);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn serializes_config_data_as_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = WriteConfigurationFile::new(test_context(dir.path()));
        let path = dir.path().join("settings.json");
        let params = json!({
            "path": path.to_str().unwrap(),
            "config_data": {"debug": false, "port": 8001},
        });

        handler.execute(&params).expect("execute");
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).expect("json");
        assert_eq!(written, json!({"debug": false, "port": 8001}));
    }

    #[test]
    fn backs_up_and_restores_previous_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = WriteConfigurationFile::new(test_context(dir.path()));
        let path = dir.path().join("app.conf");
        std::fs::write(&path, "original\n").expect("write");

        let params = json!({"path": path.to_str().unwrap(), "content": "replaced\n"});
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["backed_up"], true);
        assert_eq!(result["created"], false);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("app.conf.backup")).unwrap(),
            "original\n"
        );

        handler.rollback(&params, &result).expect("rollback");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original\n");
        assert!(!dir.path().join("app.conf.backup").exists());
    }

    #[test]
    fn rollback_deletes_newly_created_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = WriteConfigurationFile::new(test_context(dir.path()));
        let path = dir.path().join("fresh.conf");
        let params = json!({"path": path.to_str().unwrap(), "content": "x"});

        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        handler.rollback(&params, &result).expect("rollback");
        assert!(!path.exists());

        // Safe when the file is already gone.
        handler.rollback(&params, &result).expect("rollback twice");
    }

    #[test]
    fn validate_needs_some_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = WriteConfigurationFile::new(test_context(dir.path()));
        assert!(handler.validate(&json!({"path": "/tmp/x"})).is_err());
    }
}
