//! Template variable substitution.
//!
//! Before an action runs, a fixed set of placeholders is substituted into
//! every string of its parameter tree, recursing through nested objects and
//! arrays. The set is closed: templates cannot reference arbitrary state.

use serde_json::Value;

use crate::handlers::WorkspaceContext;

/// The resolved substitution table for one workspace.
#[derive(Debug, Clone)]
pub struct Substitutions {
    pairs: Vec<(&'static str, String)>,
    home_directory: String,
}

impl Substitutions {
    pub fn from_context(ctx: &WorkspaceContext) -> Self {
        let pairs = vec![
            ("{workspace_id}", ctx.workspace_id.to_string()),
            ("{workspace_name}", ctx.workspace_name.clone()),
            ("{workspace_linux_username}", ctx.linux_username.clone()),
            ("{workspace_subdomain}", ctx.subdomain.clone()),
            ("{user_email}", ctx.user_email.clone().unwrap_or_default()),
            (
                "{user_id}",
                ctx.user_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            ("{company_name}", ctx.company_name.clone().unwrap_or_default()),
            ("{home_directory}", ctx.home_directory.clone()),
            ("{port}", ctx.port.to_string()),
            ("${HOME}", ctx.home_directory.clone()),
            ("${USER}", ctx.linux_username.clone()),
        ];
        Self {
            pairs,
            home_directory: ctx.home_directory.clone(),
        }
    }

    /// Substitutes placeholders in one string, expanding a leading `~/`.
    pub fn apply_str(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (placeholder, replacement) in &self.pairs {
            if out.contains(placeholder) {
                out = out.replace(placeholder, replacement);
            }
        }
        if let Some(rest) = out.strip_prefix("~/") {
            out = format!("{}/{}", self.home_directory, rest);
        }
        out
    }

    /// Recursively substitutes through a JSON tree. Non-string leaves pass
    /// through untouched.
    pub fn apply_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.apply_str(s)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.apply_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.apply_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
