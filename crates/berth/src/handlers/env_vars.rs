//! Shell environment variables appended to the workspace's shell config.

use std::io::Write;
use std::path::Path;

use serde_json::{Value, json};

use berth_types::{CoreError, CoreResult};

use super::{ActionHandler, HandlerOutcome, WorkspaceContext, opt_bool, opt_str};

const SENTINEL: &str = "# managed by berth";

/// Appends `export K="V"` lines (or bare `K="V"`) to the shell config,
/// backing up the prior file. Repeated runs append again — deduplication is
/// the template author's responsibility.
pub struct SetEnvironmentVariables {
    ctx: WorkspaceContext,
}

impl SetEnvironmentVariables {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    fn config_path(&self, params: &Value) -> String {
        opt_str(params, "shell_config")
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}/.bashrc", self.ctx.home_directory))
    }
}

impl ActionHandler for SetEnvironmentVariables {
    fn kind(&self) -> &'static str {
        "set_environment_variables"
    }

    fn display_name(&self) -> &'static str {
        "Set Environment Variables"
    }

    fn category(&self) -> &'static str {
        "filesystem"
    }

    fn description(&self) -> &'static str {
        "Append environment variables to the workspace shell config"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["variables"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["shell_config", "export"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        let variables = params
            .get("variables")
            .and_then(Value::as_object)
            .ok_or_else(|| CoreError::invalid_input("variables must be an object"))?;
        if variables.is_empty() {
            return Err(CoreError::invalid_input("variables must not be empty"));
        }
        for key in variables.keys() {
            let valid = !key.is_empty()
                && key.chars().next().map(|c| c.is_ascii_alphabetic() || c == '_').unwrap_or(false)
                && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(CoreError::invalid_input(format!(
                    "invalid environment variable name: {key}"
                )));
            }
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let path = self.config_path(params);
        let export = opt_bool(params, "export", true);
        let variables = params
            .get("variables")
            .and_then(Value::as_object)
            .ok_or_else(|| CoreError::invalid_input("variables must be an object"))?;

        let existed = Path::new(&path).is_file();
        let backup_path = format!("{path}.backup");
        if existed {
            std::fs::copy(&path, &backup_path).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to back up {path}: {e}"))
            })?;
        }

        let mut block = format!("\n{SENTINEL}\n");
        let mut keys = Vec::new();
        for (key, value) in variables {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let escaped = value.replace('\\', r"\\").replace('"', "\\\"");
            if export {
                block.push_str(&format!("export {key}=\"{escaped}\"\n"));
            } else {
                block.push_str(&format!("{key}=\"{escaped}\"\n"));
            }
            keys.push(key.clone());
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to open {path}: {e}")))?;
        file.write_all(block.as_bytes())
            .map_err(|e| CoreError::Other(anyhow::anyhow!("failed to write {path}: {e}")))?;

        Ok(HandlerOutcome::Completed(json!({
            "path": path,
            "keys": keys,
            "backed_up": existed,
            "created": !existed,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        let path = self.config_path(params);
        let backup_path = format!("{path}.backup");

        if result.get("backed_up").and_then(Value::as_bool) == Some(true)
            && Path::new(&backup_path).is_file()
        {
            std::fs::rename(&backup_path, &path).map_err(|e| {
                CoreError::Other(anyhow::anyhow!("failed to restore {path}: {e}"))
            })?;
        } else if result.get("created").and_then(Value::as_bool) == Some(true) {
            match std::fs::remove_file(&path) {
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
    fn appends_export_lines_with_sentinel() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".bashrc"), "# existing\n").expect("write");

        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        let params = json!({"variables": {"EDITOR": "vim", "APP_PORT": 8001}});
        handler.validate(&params).expect("validate");

        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["backed_up"], true);

        let content = std::fs::read_to_string(dir.path().join(".bashrc")).unwrap();
        assert!(content.starts_with("# existing\n"));
        assert!(content.contains(SENTINEL));
        assert!(content.contains("export APP_PORT=\"8001\""));
        assert!(content.contains("export EDITOR=\"vim\""));
    }

    #[test]
    fn bare_assignments_without_export() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        let params = json!({"variables": {"LANG": "C.UTF-8"}, "export": false});

        handler.execute(&params).expect("execute");
        let content = std::fs::read_to_string(dir.path().join(".bashrc")).unwrap();
        assert!(content.contains("LANG=\"C.UTF-8\""));
        assert!(!content.contains("export LANG"));
    }

    #[test]
    fn values_with_quotes_are_escaped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        let params = json!({"variables": {"GREETING": "say \"hi\""}});

        handler.execute(&params).expect("execute");
        let content = std::fs::read_to_string(dir.path().join(".bashrc")).unwrap();
        assert!(content.contains(r#"export GREETING="say \"hi\"""#));
    }

    #[test]
    fn rollback_restores_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(".bashrc"), "pristine\n").expect("write");

        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        let params = json!({"variables": {"A": "1"}});
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };

        handler.rollback(&params, &result).expect("rollback");
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".bashrc")).unwrap(),
            "pristine\n"
        );
    }

    #[test]
    fn rollback_removes_file_it_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        let params = json!({"variables": {"A": "1"}});
        let HandlerOutcome::Completed(result) = handler.execute(&params).expect("execute") else {
            panic!("expected completion");
        };
        assert_eq!(result["created"], true);

        handler.rollback(&params, &result).expect("rollback");
        assert!(!dir.path().join(".bashrc").exists());
    }

    #[test]
    fn validate_rejects_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let handler = SetEnvironmentVariables::new(test_context(dir.path()));
        assert!(handler.validate(&json!({"variables": {}})).is_err());
        assert!(handler.validate(&json!({"variables": {"1BAD": "x"}})).is_err());
        assert!(handler.validate(&json!({"variables": {"A B": "x"}})).is_err());
        assert!(handler.validate(&json!({"variables": "not-an-object"})).is_err());
    }
}
