//! Workspace lifecycle upkeep: the auto-stop sweep, the resource metrics
//! collector, and metrics retention. All three are periodic tasks invoked by
//! an external scheduler (cron or a systemd timer) through the CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use berth_types::{CoreResult, Workspace, WorkspaceMetrics};

use crate::provisioner::Provisioner;
use crate::repo::{MetricsRepo, Store, WorkspaceRepo};
use crate::system::{SystemManager, service_unit};

/// Outcome of one auto-stop sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoStopSummary {
    pub checked: usize,
    pub stopped: usize,
    pub skipped: usize,
    pub errors: usize,
    pub stopped_workspace_ids: Vec<i64>,
    pub errors_detail: Vec<WorkspaceError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceError {
    pub workspace_id: i64,
    pub error: String,
}

/// Hours a workspace has been idle: time since the last access, falling back
/// to the last start when access tracking has no sample yet.
fn idle_hours(workspace: &Workspace, now: DateTime<Utc>) -> Option<f64> {
    let reference = workspace.last_accessed_at.or(workspace.last_started_at)?;
    Some((now - reference).num_seconds().max(0) as f64 / 3600.0)
}

/// Scans running workspaces with auto-stop enabled and stops those idle past
/// their threshold. Errors are isolated per workspace.
pub fn auto_stop_sweep(
    store: &dyn Store,
    provisioner: &Provisioner<'_>,
    now: DateTime<Utc>,
) -> CoreResult<AutoStopSummary> {
    let mut summary = AutoStopSummary::default();

    let candidates: Vec<Workspace> = store
        .list_workspaces()?
        .into_iter()
        .filter(|w| w.is_running && w.auto_stop_hours > 0)
        .collect();
    summary.checked = candidates.len();

    for workspace in candidates {
        let Some(idle) = idle_hours(&workspace, now) else {
            warn!(workspace = workspace.id, "no access or start timestamp, skipping");
            summary.skipped += 1;
            continue;
        };

        if idle < workspace.auto_stop_hours as f64 {
            debug!(
                workspace = workspace.id,
                idle_hours = idle,
                threshold = workspace.auto_stop_hours,
                "within auto-stop threshold"
            );
            summary.skipped += 1;
            continue;
        }

        match provisioner.stop(workspace.id) {
            Ok(_) => {
                info!(
                    workspace = workspace.id,
                    idle_hours = %format!("{idle:.1}"),
                    "auto-stopped idle workspace"
                );
                summary.stopped += 1;
                summary.stopped_workspace_ids.push(workspace.id);
            }
            Err(err) => {
                warn!(workspace = workspace.id, %err, "auto-stop failed");
                summary.errors += 1;
                summary.errors_detail.push(WorkspaceError {
                    workspace_id: workspace.id,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(
        checked = summary.checked,
        stopped = summary.stopped,
        skipped = summary.skipped,
        errors = summary.errors,
        "auto-stop sweep complete"
    );
    Ok(summary)
}

/// Outcome of one metrics collection pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectSummary {
    pub collected: usize,
    pub errors: usize,
    pub errors_detail: Vec<WorkspaceError>,
}

/// Samples `ps` and `systemctl show` for every running workspace and
/// persists one time-series row each.
pub fn collect_metrics(
    store: &dyn Store,
    system: &SystemManager,
    now: DateTime<Utc>,
) -> CoreResult<CollectSummary> {
    let mut summary = CollectSummary::default();
    let total_memory_mb = system.total_memory_mb();

    let running: Vec<Workspace> = store
        .list_workspaces()?
        .into_iter()
        .filter(|w| w.is_running)
        .collect();

    for workspace in running {
        match sample_workspace(store, system, &workspace, total_memory_mb, now) {
            Ok(()) => summary.collected += 1,
            Err(err) => {
                warn!(workspace = workspace.id, %err, "metrics collection failed");
                summary.errors += 1;
                summary.errors_detail.push(WorkspaceError {
                    workspace_id: workspace.id,
                    error: err.to_string(),
                });
            }
        }
    }

    info!(collected = summary.collected, errors = summary.errors, "metrics pass complete");
    Ok(summary)
}

fn sample_workspace(
    store: &dyn Store,
    system: &SystemManager,
    workspace: &Workspace,
    total_memory_mb: Option<u64>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let stats = system.user_process_stats(&workspace.linux_username)?;
    let service = system.service_status(&service_unit(&workspace.linux_username))?;

    let memory_percent = match total_memory_mb {
        Some(total) if total > 0 => {
            ((stats.memory_mb as f64 / total as f64) * 10_000.0).round() / 100.0
        }
        _ => 0.0,
    };

    store.insert_metrics(WorkspaceMetrics {
        workspace_id: workspace.id,
        collected_at: now,
        cpu_percent: stats.cpu_percent,
        memory_mb: stats.memory_mb,
        memory_percent,
        process_count: stats.process_count,
        uptime_seconds: service.uptime_seconds(now),
    })
}

/// Deletes metrics rows older than the retention window; returns the count.
pub fn prune_metrics(
    store: &dyn Store,
    retention_days: u32,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let cutoff = now - chrono::Duration::days(retention_days as i64);
    let dropped = store.prune_metrics_before(cutoff)?;
    info!(dropped, retention_days, "metrics retention pass complete");
    Ok(dropped)
}
