//! PostgreSQL role and database creation. Runs as the `postgres`
//! administrator through `psql`.

use std::time::Duration;

use serde_json::{Value, json};
use tracing::info;

use berth_process::CommandSpec;
use berth_types::{CoreError, CoreResult};

use super::{
    ActionHandler, HandlerOutcome, WorkspaceContext, ensure_tool, opt_str, require_str,
    run_checked,
};

const PSQL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct CreatePostgresDatabase {
    ctx: WorkspaceContext,
}

impl CreatePostgresDatabase {
    pub fn new(ctx: WorkspaceContext) -> Self {
        Self { ctx }
    }

    fn owner_role<'a>(&'a self, params: &'a Value) -> &'a str {
        opt_str(params, "owner_role").unwrap_or(&self.ctx.linux_username)
    }
}

impl ActionHandler for CreatePostgresDatabase {
    fn kind(&self) -> &'static str {
        "create_postgresql_database"
    }

    fn display_name(&self) -> &'static str {
        "Create PostgreSQL Database"
    }

    fn category(&self) -> &'static str {
        "database"
    }

    fn description(&self) -> &'static str {
        "Create a PostgreSQL role and database owned by it"
    }

    fn required_parameters(&self) -> &'static [&'static str] {
        &["database_name"]
    }

    fn optional_parameters(&self) -> &'static [&'static str] {
        &["owner_role", "role_password", "encoding", "locale"]
    }

    fn validate(&self, params: &Value) -> CoreResult<()> {
        ensure_tool("psql")?;
        let database = require_str(params, "database_name")?;
        ensure_identifier(database)?;
        ensure_identifier(self.owner_role(params))?;
        if let Some(encoding) = opt_str(params, "encoding") {
            if !encoding.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(CoreError::invalid_input(format!("invalid encoding: {encoding}")));
            }
        }
        Ok(())
    }

    fn execute(&self, params: &Value) -> CoreResult<HandlerOutcome> {
        let database = require_str(params, "database_name")?;
        let role = self.owner_role(params);
        let encoding = opt_str(params, "encoding").unwrap_or("UTF8");

        let role_existed = exists_query(&format!(
            "SELECT 1 FROM pg_roles WHERE rolname='{role}'"
        ))?;
        if !role_existed {
            let sql = match opt_str(params, "role_password") {
                Some(password) => {
                    let password = password.replace('\'', "''");
                    format!("CREATE ROLE \"{role}\" LOGIN PASSWORD '{password}'")
                }
                None => format!("CREATE ROLE \"{role}\" LOGIN"),
            };
            admin_sql(&sql)?;
        }

        let db_existed = exists_query(&format!(
            "SELECT 1 FROM pg_database WHERE datname='{database}'"
        ))?;
        if !db_existed {
            let mut sql =
                format!("CREATE DATABASE \"{database}\" OWNER \"{role}\" ENCODING '{encoding}'");
            if let Some(locale) = opt_str(params, "locale") {
                let locale = locale.replace('\'', "''");
                sql.push_str(&format!(" LC_COLLATE '{locale}' LC_CTYPE '{locale}' TEMPLATE template0"));
            }
            admin_sql(&sql)?;
        }

        admin_sql(&format!(
            "GRANT ALL PRIVILEGES ON DATABASE \"{database}\" TO \"{role}\""
        ))?;

        info!(database, role, "postgres database ready");
        Ok(HandlerOutcome::Completed(json!({
            "database": database,
            "role": role,
            "created_role": !role_existed,
            "created_database": !db_existed,
        })))
    }

    fn rollback(&self, params: &Value, result: &Value) -> CoreResult<()> {
        let database = require_str(params, "database_name")?;
        let role = self.owner_role(params);

        // Pre-existing objects are never dropped.
        if result.get("created_database").and_then(Value::as_bool) == Some(true) {
            admin_sql(&format!("DROP DATABASE IF EXISTS \"{database}\""))?;
        }
        if result.get("created_role").and_then(Value::as_bool) == Some(true) {
            admin_sql(&format!("DROP ROLE IF EXISTS \"{role}\""))?;
        }
        Ok(())
    }
}

/// Valid conservative SQL identifier; blocks quoting tricks in names coming
/// from template parameters.
fn ensure_identifier(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().next().map(|c| c.is_ascii_lowercase() || c == '_').unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid_input(format!(
            "invalid postgres identifier: {name}"
        )))
    }
}

fn admin_sql(sql: &str) -> CoreResult<berth_process::CommandOutput> {
    run_checked(
        CommandSpec::new("psql")
            .args(["-v", "ON_ERROR_STOP=1", "-tAc", sql])
            .timeout(PSQL_TIMEOUT),
        "psql",
    )
}

fn exists_query(sql: &str) -> CoreResult<bool> {
    let out = admin_sql(sql)?;
    Ok(out.stdout.lines().any(|line| line.trim() == "1"))
}
