//! The template action engine.
//!
//! Runs all enabled action sequences of a template against a workspace with
//! deterministic ordering, per-action retry, conditional skipping, and
//! compensating rollback. Every transition is persisted to the execution
//! records as it happens, so the status endpoint always reflects reality and
//! a paused workflow survives a process restart.
//!
//! Ordering is Kahn's algorithm over the declared dependency edges, with the
//! ready set sorted by the explicit `order` field (ties break on
//! `action_id`). A cycle aborts the run before any action starts.
//!
//! Pause/resume: a handler may return [`HandlerOutcome::Paused`]; the engine
//! parks the execution record, stores the plan index in
//! `workspace.extra_data["resume_cursor"]`, flips the workspace to
//! `awaiting_ssh_verification` (or paused, for manual steps), and returns.
//! [`ActionExecutor::resume`] re-reads the cursor and continues with fresh
//! variable state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use berth_types::{
    ActionExecution, CoreError, CoreResult, ExecutionStatus, ProvisioningState,
    TemplateActionSequence, Workspace, WorkspaceStatus, WorkspaceTemplate,
};

use crate::condition;
use crate::handlers::{HandlerOutcome, HandlerRegistry, PauseKind, WorkspaceContext};
use crate::repo::{ExecutionRepo, TemplateRepo, WorkspaceRepo};
use crate::subst::Substitutions;

/// Outcome of one engine run over a template.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub total_actions: usize,
    pub completed_actions: Vec<String>,
    pub skipped_actions: Vec<String>,
    pub failed_action: Option<String>,
    pub error: Option<String>,
    pub rolled_back: bool,
    pub paused: Option<PausedInfo>,
}

impl ExecutionReport {
    fn new(total: usize) -> Self {
        Self {
            success: false,
            total_actions: total,
            completed_actions: Vec::new(),
            skipped_actions: Vec::new(),
            failed_action: None,
            error: None,
            rolled_back: false,
            paused: None,
        }
    }
}

/// Where and why a run paused.
#[derive(Debug, Clone, Serialize)]
pub struct PausedInfo {
    pub action_id: String,
    pub kind: PauseKind,
    pub message: String,
    pub payload: Value,
    /// Plan index to resume from.
    pub cursor: usize,
}

/// Key under `workspace.extra_data` holding the resume cursor.
pub const RESUME_CURSOR_KEY: &str = "resume_cursor";

pub struct ActionExecutor<'a> {
    store: &'a (dyn crate::repo::Store),
    registry: &'a HandlerRegistry,
}

impl<'a> ActionExecutor<'a> {
    pub fn new(store: &'a dyn crate::repo::Store, registry: &'a HandlerRegistry) -> Self {
        Self { store, registry }
    }

    /// Runs the template from the beginning.
    pub fn run(
        &self,
        workspace: &mut Workspace,
        template: &WorkspaceTemplate,
        ctx: &WorkspaceContext,
    ) -> CoreResult<ExecutionReport> {
        self.execute_from(workspace, template, ctx, 0)
    }

    /// Continues a paused run from the persisted cursor.
    pub fn resume(
        &self,
        workspace: &mut Workspace,
        template: &WorkspaceTemplate,
        ctx: &WorkspaceContext,
    ) -> CoreResult<ExecutionReport> {
        let cursor = workspace
            .extra_data
            .get(RESUME_CURSOR_KEY)
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                CoreError::InvalidStateTransition(format!(
                    "workspace {} has no resume cursor",
                    workspace.id
                ))
            })?;
        self.execute_from(workspace, template, ctx, cursor as usize)
    }

    fn execute_from(
        &self,
        workspace: &mut Workspace,
        template: &WorkspaceTemplate,
        base_ctx: &WorkspaceContext,
        start: usize,
    ) -> CoreResult<ExecutionReport> {
        let sequences: Vec<_> = self
            .store
            .sequences_of_template(template.id)?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();

        if sequences.is_empty() {
            let mut report = ExecutionReport::new(0);
            report.success = true;
            return Ok(report);
        }

        let plan = resolve_order(&sequences)?;
        let mut report = ExecutionReport::new(plan.len());
        let mut completed: Vec<(TemplateActionSequence, Value, Value, ActionExecution)> =
            Vec::new();

        for (index, seq) in plan.iter().enumerate() {
            if index < start {
                continue;
            }

            // Handlers observe the live extra_data, so a resumed run sees
            // the verification markers set while it was parked.
            let mut ctx = base_ctx.clone();
            ctx.extra = workspace.extra_data.clone();
            let subst = Substitutions::from_context(&ctx);

            workspace.progress_message = Some(format!(
                "Running action {} ({}/{})",
                seq.action_id,
                index + 1,
                plan.len()
            ));
            self.store.update_workspace(workspace)?;

            if let Some(cond) = &seq.condition {
                match condition::evaluate(&cond.expression, &subst) {
                    Ok(true) => {}
                    Ok(false) => {
                        let mut exec = ActionExecution::new(workspace.id, seq);
                        exec.status = ExecutionStatus::Skipped;
                        exec.completed_at = Some(Utc::now());
                        self.store.insert_execution(exec)?;
                        report.skipped_actions.push(seq.action_id.clone());
                        continue;
                    }
                    Err(err) => {
                        // An unresolvable condition defaults to executing.
                        warn!(
                            action = %seq.action_id,
                            %err,
                            "condition evaluation failed, running action anyway"
                        );
                    }
                }
            }

            let Some(handler) = self.registry.create(&seq.action_type, ctx.clone()) else {
                let mut exec = self.open_or_new_execution(workspace.id, seq)?;
                exec.status = ExecutionStatus::Failed;
                exec.completed_at = Some(Utc::now());
                exec.error_message =
                    Some(format!("no handler registered for action type: {}", seq.action_type));
                self.store.update_execution(&exec)?;
                if let Some(final_report) = self.handle_failure(
                    workspace, template, base_ctx, seq, &mut report, &completed, exec,
                )? {
                    return Ok(final_report);
                }
                continue;
            };

            let params = subst.apply_value(&seq.parameters);
            let mut exec = self.open_or_new_execution(workspace.id, seq)?;
            let max_attempts = seq.retry.max_attempts.max(1);

            let mut action_done = false;
            while exec.attempt_number < max_attempts {
                exec.attempt_number += 1;
                exec.status = ExecutionStatus::Running;
                exec.started_at = Some(Utc::now());
                self.store.update_execution(&exec)?;
                let attempt_start = Instant::now();

                if let Err(err) = handler.validate(&params) {
                    // Bad parameters never get better by retrying.
                    exec.status = ExecutionStatus::Failed;
                    exec.completed_at = Some(Utc::now());
                    exec.duration_seconds = Some(attempt_start.elapsed().as_secs_f64());
                    exec.error_message = Some(format!("parameter validation failed: {err}"));
                    self.store.update_execution(&exec)?;
                    break;
                }

                match handler.execute(&params) {
                    Ok(HandlerOutcome::Completed(result)) => {
                        exec.status = ExecutionStatus::Completed;
                        exec.completed_at = Some(Utc::now());
                        exec.duration_seconds = Some(attempt_start.elapsed().as_secs_f64());
                        exec.result = Some(result.clone());
                        exec.error_message = None;
                        self.store.update_execution(&exec)?;
                        report.completed_actions.push(seq.action_id.clone());
                        completed.push((seq.clone(), params.clone(), result, exec.clone()));
                        action_done = true;
                    }
                    Ok(HandlerOutcome::Paused(reason)) => {
                        // Park the record so the resumed run picks it up
                        // with a clean attempt budget.
                        exec.status = ExecutionStatus::Pending;
                        exec.started_at = None;
                        exec.attempt_number = 0;
                        self.store.update_execution(&exec)?;
                        self.park_workspace(workspace, index, &reason.kind, &reason.message)?;
                        info!(
                            workspace = workspace.id,
                            action = %seq.action_id,
                            "workflow paused"
                        );
                        report.paused = Some(PausedInfo {
                            action_id: seq.action_id.clone(),
                            kind: reason.kind,
                            message: reason.message,
                            payload: reason.payload,
                            cursor: index,
                        });
                        report.success = true;
                        return Ok(report);
                    }
                    Err(err) => {
                        exec.error_message = Some(err.to_string());
                        exec.duration_seconds = Some(attempt_start.elapsed().as_secs_f64());
                        if exec.attempt_number < max_attempts {
                            self.store.update_execution(&exec)?;
                            let delay = seq.retry.delay_before_attempt(exec.attempt_number + 1);
                            if !delay.is_zero() {
                                std::thread::sleep(delay);
                            }
                        } else {
                            exec.status = ExecutionStatus::Failed;
                            exec.completed_at = Some(Utc::now());
                            self.store.update_execution(&exec)?;
                        }
                    }
                }

                if action_done {
                    break;
                }
            }

            if !action_done {
                if exec.status != ExecutionStatus::Failed {
                    exec.status = ExecutionStatus::Failed;
                    exec.completed_at = Some(Utc::now());
                    self.store.update_execution(&exec)?;
                }
                if let Some(final_report) = self.handle_failure(
                    workspace, template, base_ctx, seq, &mut report, &completed, exec,
                )? {
                    return Ok(final_report);
                }
                // Non-fatal: carry on with the next action.
            }
        }

        clear_extra_key(workspace, RESUME_CURSOR_KEY);
        workspace.progress_message = None;
        self.store.update_workspace(workspace)?;

        report.success = true;
        Ok(report)
    }

    /// Fatal actions stop the run (rolling back when the template says so);
    /// non-fatal failures record and continue. Returns `Ok(Some(report))`
    /// when the run must stop.
    #[allow(clippy::too_many_arguments)]
    fn handle_failure(
        &self,
        workspace: &mut Workspace,
        template: &WorkspaceTemplate,
        base_ctx: &WorkspaceContext,
        seq: &TemplateActionSequence,
        report: &mut ExecutionReport,
        completed: &[(TemplateActionSequence, Value, Value, ActionExecution)],
        exec: ActionExecution,
    ) -> CoreResult<Option<ExecutionReport>> {
        warn!(
            workspace = workspace.id,
            action = %seq.action_id,
            fatal = seq.fatal_on_error,
            "action failed"
        );

        if !seq.fatal_on_error {
            return Ok(None);
        }

        if template.rollback_on_fatal_error {
            self.rollback_completed(workspace, base_ctx, completed)?;
            report.rolled_back = true;
        }

        report.success = false;
        report.failed_action = Some(seq.action_id.clone());
        report.error = Some(
            exec.error_message
                .unwrap_or_else(|| format!("fatal error in action {}", seq.action_id)),
        );
        Ok(Some(report.clone()))
    }

    /// Compensates completed actions in reverse order. A failing rollback is
    /// recorded and does not stop the chain.
    fn rollback_completed(
        &self,
        workspace: &Workspace,
        base_ctx: &WorkspaceContext,
        completed: &[(TemplateActionSequence, Value, Value, ActionExecution)],
    ) -> CoreResult<()> {
        for (seq, params, result, exec) in completed.iter().rev() {
            let mut exec = exec.clone();
            exec.rollback_attempted = true;

            let mut ctx = base_ctx.clone();
            ctx.extra = workspace.extra_data.clone();
            let handler = self.registry.create(&seq.action_type, ctx);

            match handler {
                Some(handler) => match handler.rollback(params, result) {
                    Ok(()) => {
                        exec.rollback_successful = Some(true);
                        exec.status = ExecutionStatus::RolledBack;
                    }
                    Err(err) => {
                        exec.rollback_successful = Some(false);
                        exec.rollback_error = Some(err.to_string());
                    }
                },
                None => {
                    exec.rollback_successful = Some(false);
                    exec.rollback_error =
                        Some(format!("no handler for action type: {}", seq.action_type));
                }
            }
            self.store.update_execution(&exec)?;
        }
        Ok(())
    }

    fn open_or_new_execution(
        &self,
        workspace_id: i64,
        seq: &TemplateActionSequence,
    ) -> CoreResult<ActionExecution> {
        match self.store.open_execution(workspace_id, seq.id)? {
            Some(existing) => Ok(existing),
            None => self.store.insert_execution(ActionExecution::new(workspace_id, seq)),
        }
    }

    fn park_workspace(
        &self,
        workspace: &mut Workspace,
        cursor: usize,
        kind: &PauseKind,
        message: &str,
    ) -> CoreResult<()> {
        set_extra_key(workspace, RESUME_CURSOR_KEY, json!(cursor));
        workspace.status = WorkspaceStatus::Paused;
        if *kind == PauseKind::SshVerification {
            workspace.provisioning_state = ProvisioningState::AwaitingSshVerification;
        }
        workspace.progress_message = Some(message.to_string());
        self.store.update_workspace(workspace)
    }
}

/// Deterministic execution order: Kahn's algorithm with the ready set keyed
/// by `(order, action_id)`. Dependency tokens may name an `action_id` or a
/// sequence row id; unknown tokens are ignored. A cycle fails the whole run.
pub fn resolve_order(
    sequences: &[TemplateActionSequence],
) -> CoreResult<Vec<TemplateActionSequence>> {
    let by_action_id: BTreeMap<&str, &TemplateActionSequence> =
        sequences.iter().map(|s| (s.action_id.as_str(), s)).collect();
    let by_row_id: BTreeMap<i64, &TemplateActionSequence> =
        sequences.iter().map(|s| (s.id, s)).collect();

    let resolve_dep = |token: &str| -> Option<&str> {
        if let Some(seq) = by_action_id.get(token) {
            return Some(seq.action_id.as_str());
        }
        token
            .parse::<i64>()
            .ok()
            .and_then(|id| by_row_id.get(&id))
            .map(|seq| seq.action_id.as_str())
    };

    let mut indegree: BTreeMap<&str, usize> =
        sequences.iter().map(|s| (s.action_id.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for seq in sequences {
        for token in &seq.dependencies {
            if let Some(dep_id) = resolve_dep(token) {
                if dep_id == seq.action_id {
                    continue;
                }
                dependents.entry(dep_id).or_default().push(&seq.action_id);
                *indegree.entry(seq.action_id.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<(i32, &str)> = indegree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| (by_action_id[id].order, *id))
        .collect();

    let mut out = Vec::with_capacity(sequences.len());
    while let Some(&(order, id)) = ready.iter().next() {
        ready.remove(&(order, id));
        out.push((*by_action_id[id]).clone());

        if let Some(children) = dependents.get(id) {
            for child in children {
                let deg = indegree
                    .get_mut(child)
                    .expect("dependent must be a known action");
                *deg -= 1;
                if *deg == 0 {
                    ready.insert((by_action_id[child].order, child));
                }
            }
        }
    }

    if out.len() != sequences.len() {
        return Err(CoreError::CircularDependency);
    }
    Ok(out)
}

pub(crate) fn set_extra_key(workspace: &mut Workspace, key: &str, value: Value) {
    if !workspace.extra_data.is_object() {
        workspace.extra_data = json!({});
    }
    if let Some(map) = workspace.extra_data.as_object_mut() {
        map.insert(key.to_string(), value);
    }
}

fn clear_extra_key(workspace: &mut Workspace, key: &str) {
    if let Some(map) = workspace.extra_data.as_object_mut() {
        map.remove(key);
    }
}
