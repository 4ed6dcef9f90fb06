//! Action handlers: the atomic, idempotent, rollback-capable side effects a
//! template composes into a provisioning workflow.
//!
//! Every handler implements [`ActionHandler`]: a pure parameter check
//! (`validate`), the side effect itself (`execute`), and a best-effort
//! inverse (`rollback`) that must be safe when the action partially
//! completed or never ran. Handlers are constructed per action with the
//! workspace's [`WorkspaceContext`] and share no mutable state.
//!
//! The [`HandlerRegistry`] maps an `action_type` string to a factory; the
//! executor asks it for a fresh handler per step. Parameter schemas for
//! template-builder UIs are generated from the same metadata the engine
//! uses.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use berth_process::{CommandOutput, CommandSpec, resolve_program};
use berth_types::{CoreError, CoreResult};

mod completion;
mod config_file;
mod directory;
mod env_vars;
mod git_clone;
mod manual_action;
mod pip_requirements;
mod postgres;
mod python_venv;
mod shell_script;
mod ssh_key;
mod ssh_verify;
mod system_packages;
mod systemd_service;
mod vscode_extensions;

pub use completion::DisplayCompletionMessage;
pub use config_file::WriteConfigurationFile;
pub use directory::CreateDirectory;
pub use env_vars::SetEnvironmentVariables;
pub use git_clone::CloneGitRepository;
pub use manual_action::ManualAction;
pub use pip_requirements::InstallPipRequirements;
pub use postgres::CreatePostgresDatabase;
pub use python_venv::CreatePythonVenv;
pub use shell_script::ExecuteShellScript;
pub use ssh_key::GenerateSshKey;
pub use ssh_verify::VerifySshKey;
pub use system_packages::InstallSystemPackages;
pub use systemd_service::SystemdService;
pub use vscode_extensions::InstallVscodeExtensions;

/// The workspace facts a handler may depend on. Substitution draws from the
/// same context, so handlers see parameters that already reference concrete
/// paths and names.
#[derive(Debug, Clone)]
pub struct WorkspaceContext {
    pub workspace_id: i64,
    pub workspace_name: String,
    pub linux_username: String,
    pub home_directory: String,
    pub subdomain: String,
    /// Apex domain the workspace hangs off of.
    pub base_domain: String,
    pub port: u16,
    pub user_id: Option<i64>,
    pub user_email: Option<String>,
    pub company_name: Option<String>,
    /// Snapshot of `workspace.extra_data`; refreshed on resume so handlers
    /// observe verification markers set while the workflow was paused.
    pub extra: Value,
}

impl WorkspaceContext {
    pub fn workspace_url(&self) -> String {
        format!("https://{}.{}", self.subdomain, self.base_domain)
    }

    pub fn extra_flag(&self, key: &str) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Why a handler asked the workflow to stop and wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseKind {
    SshVerification,
    ManualStep,
}

/// A non-terminal outcome: persist state and yield until an external signal
/// resumes the workflow.
#[derive(Debug, Clone)]
pub struct PauseReason {
    pub kind: PauseKind,
    pub message: String,
    /// Surfaced to the front-end (public key, instructions, ...).
    pub payload: Value,
}

/// Result of a successful `execute`.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Completed(Value),
    Paused(PauseReason),
}

pub trait ActionHandler: Send {
    /// The `action_type` string templates use.
    fn kind(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn category(&self) -> &'static str {
        "general"
    }
    fn description(&self) -> &'static str;
    fn required_parameters(&self) -> &'static [&'static str];
    fn optional_parameters(&self) -> &'static [&'static str] {
        &[]
    }

    /// Pure check of presence, types, and tool availability. Runs after
    /// variable substitution; a failure is never retried.
    fn validate(&self, params: &Value) -> CoreResult<()>;

    /// Performs the side effect. Substituted parameters only.
    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome>;

    /// Best-effort inverse given the original parameters and the recorded
    /// execution result.
    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()>;

    /// Parameter schema for template-builder UIs. The default derives input
    /// types and labels from parameter names.
    fn parameter_schema(&self) -> Value {
        let mut schema = Map::new();
        for name in self.required_parameters() {
            schema.insert(name.to_string(), field_schema(name, true));
        }
        for name in self.optional_parameters() {
            schema.insert(name.to_string(), field_schema(name, false));
        }
        Value::Object(schema)
    }
}

fn field_schema(name: &str, required: bool) -> Value {
    json!({
        "type": infer_field_type(name),
        "label": field_label(name),
        "required": required,
    })
}

fn field_label(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn infer_field_type(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("is_")
        || lower.starts_with("enable")
        || lower.starts_with("allow")
        || matches!(lower.as_str(), "recursive" | "force" | "backup" | "exist_ok" | "upgrade")
    {
        return "checkbox";
    }
    if ["port", "timeout", "depth", "count", "quota", "length", "mode"]
        .iter()
        .any(|x| lower.contains(x))
    {
        return "number";
    }
    if ["content", "script", "message", "instructions", "config_data"]
        .iter()
        .any(|x| lower.contains(x))
    {
        return "textarea";
    }
    "text"
}

type Factory = fn(WorkspaceContext) -> Box<dyn ActionHandler>;

/// Maps `action_type` strings to handler factories.
pub struct HandlerRegistry {
    factories: BTreeMap<&'static str, Factory>,
}

impl HandlerRegistry {
    /// The registry with every built-in handler kind.
    pub fn standard() -> Self {
        let mut factories: BTreeMap<&'static str, Factory> = BTreeMap::new();
        factories.insert("generate_ssh_key", |ctx| Box::new(GenerateSshKey::new(ctx)));
        factories.insert("verify_ssh_key", |ctx| Box::new(VerifySshKey::new(ctx)));
        factories.insert("clone_git_repository", |ctx| {
            Box::new(CloneGitRepository::new(ctx))
        });
        factories.insert("install_system_packages", |ctx| {
            Box::new(InstallSystemPackages::new(ctx))
        });
        factories.insert("create_python_venv", |ctx| Box::new(CreatePythonVenv::new(ctx)));
        factories.insert("install_pip_requirements", |ctx| {
            Box::new(InstallPipRequirements::new(ctx))
        });
        factories.insert("create_directory", |ctx| Box::new(CreateDirectory::new(ctx)));
        factories.insert("write_configuration_file", |ctx| {
            Box::new(WriteConfigurationFile::new(ctx))
        });
        factories.insert("create_postgresql_database", |ctx| {
            Box::new(CreatePostgresDatabase::new(ctx))
        });
        factories.insert("install_vscode_extensions", |ctx| {
            Box::new(InstallVscodeExtensions::new(ctx))
        });
        factories.insert("set_environment_variables", |ctx| {
            Box::new(SetEnvironmentVariables::new(ctx))
        });
        factories.insert("execute_shell_script", |ctx| Box::new(ExecuteShellScript::new(ctx)));
        factories.insert("systemd_service", |ctx| Box::new(SystemdService::new(ctx)));
        factories.insert("display_completion_message", |ctx| {
            Box::new(DisplayCompletionMessage::new(ctx))
        });
        factories.insert("manual_action", |ctx| Box::new(ManualAction::new(ctx)));
        Self { factories }
    }

    pub fn create(&self, kind: &str, ctx: WorkspaceContext) -> Option<Box<dyn ActionHandler>> {
        self.factories.get(kind).map(|factory| factory(ctx))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.factories.keys().copied()
    }

    /// Metadata catalog for UIs: display name, category, description, and
    /// parameter schema per kind.
    pub fn catalog(&self, ctx: &WorkspaceContext) -> Value {
        let mut out = Map::new();
        for (kind, factory) in &self.factories {
            let handler = factory(ctx.clone());
            out.insert(
                kind.to_string(),
                json!({
                    "display_name": handler.display_name(),
                    "category": handler.category(),
                    "description": handler.description(),
                    "parameters": handler.parameter_schema(),
                }),
            );
        }
        Value::Object(out)
    }
}

// ---- shared parameter helpers ----

pub(crate) fn require_str<'a>(params: &'a Value, key: &str) -> CoreResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoreError::invalid_input(format!("missing required parameter: {key}")))
}

pub(crate) fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

pub(crate) fn opt_bool(params: &Value, key: &str, default: bool) -> bool {
    params.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn opt_u64(params: &Value, key: &str, default: u64) -> u64 {
    params.get(key).and_then(Value::as_u64).unwrap_or(default)
}

pub(crate) fn str_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Checks that a tool is invokable: either its `BERTH_*_BIN` override points
/// at an existing file, or the bare name resolves on `PATH`.
pub(crate) fn ensure_tool(program: &str) -> CoreResult<()> {
    let resolved = resolve_program(program);
    let path = std::path::Path::new(&resolved);
    let available = if path.is_absolute() {
        path.exists()
    } else {
        which::which(&resolved).is_ok()
    };
    if available {
        Ok(())
    } else {
        Err(CoreError::invalid_input(format!(
            "required tool not available: {program}"
        )))
    }
}

/// Runs a command and converts a non-zero exit into `CommandFailed`.
pub(crate) fn run_checked(spec: CommandSpec, program: &str) -> CoreResult<CommandOutput> {
    let out = spec.run().map_err(CoreError::Other)?;
    if out.success() {
        Ok(out)
    } else {
        Err(CoreError::CommandFailed {
            program: program.to_string(),
            exit_code: if out.timed_out { None } else { Some(out.exit_code) },
            stderr_tail: out.stderr_tail(5),
        })
    }
}

/// Truncated output fields for execution results.
pub(crate) fn tail(s: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
pub(crate) fn test_context(home: &std::path::Path) -> WorkspaceContext {
    WorkspaceContext {
        workspace_id: 1,
        workspace_name: "x".to_string(),
        linux_username: "acme_x".to_string(),
        home_directory: home.to_string_lossy().to_string(),
        subdomain: "acme-x".to_string(),
        base_domain: "berth.dev".to_string(),
        port: 8001,
        user_id: Some(10),
        user_email: Some("dev@acme.test".to_string()),
        company_name: Some("Acme".to_string()),
        extra: json!({}),
    }
}
