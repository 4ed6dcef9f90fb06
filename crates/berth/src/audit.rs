//! Append-only audit trail and workspace session tracking.

use chrono::Utc;
use serde_json::{Value, json};

use berth_types::{Actor, AuditEvent, CoreResult, Workspace, WorkspaceSession};

use crate::repo::{AuditRepo, SessionRepo};

/// Canonical event type strings. Kept as constants so dashboards can filter
/// without chasing typos.
pub mod event {
    pub const WORKSPACE_CREATED: &str = "workspace.created";
    pub const WORKSPACE_DELETED: &str = "workspace.deleted";
    pub const WORKSPACE_STARTED: &str = "workspace.started";
    pub const WORKSPACE_STOPPED: &str = "workspace.stopped";
    pub const WORKSPACE_FAILED: &str = "workspace.failed";
    pub const PAYMENT_INITIATED: &str = "payment.initiated";
    pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const QUOTA_CHANGED: &str = "quota.changed";
    pub const LOGIN_SUCCEEDED: &str = "login.succeeded";
    pub const LOGIN_FAILED: &str = "login.failed";
}

pub struct AuditLogger<'a> {
    store: &'a dyn AuditRepo,
}

impl<'a> AuditLogger<'a> {
    pub fn new(store: &'a dyn AuditRepo) -> Self {
        Self { store }
    }

    /// Generic event append.
    pub fn log(
        &self,
        event_type: &str,
        actor: Option<Actor>,
        workspace_id: Option<i64>,
        ip_address: Option<&str>,
        detail: Value,
    ) -> CoreResult<()> {
        self.store.append_audit_event(AuditEvent {
            id: 0,
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            user_id: actor.map(|a| a.user_id),
            company_id: actor.map(|a| a.company_id),
            workspace_id,
            ip_address: ip_address.map(str::to_string),
            detail,
        })?;
        Ok(())
    }

    pub fn workspace_created(
        &self,
        actor: Actor,
        workspace: &Workspace,
        ip: Option<&str>,
    ) -> CoreResult<()> {
        self.log(
            event::WORKSPACE_CREATED,
            Some(actor),
            Some(workspace.id),
            ip,
            json!({
                "name": workspace.name,
                "subdomain": workspace.subdomain,
                "linux_username": workspace.linux_username,
                "port": workspace.port,
            }),
        )
    }

    pub fn workspace_failed(&self, workspace: &Workspace, cause: &str) -> CoreResult<()> {
        self.log(
            event::WORKSPACE_FAILED,
            None,
            Some(workspace.id),
            None,
            json!({"cause": cause}),
        )
    }
}

/// Tracks open/close intervals of workspace usage; the forward-auth endpoint
/// opens a session on first access and the stop path closes it.
pub struct SessionTracker<'a> {
    store: &'a dyn SessionRepo,
}

impl<'a> SessionTracker<'a> {
    pub fn new(store: &'a dyn SessionRepo) -> Self {
        Self { store }
    }

    /// Opens a session unless one is already open for the workspace.
    pub fn touch(&self, workspace_id: i64, user_id: i64) -> CoreResult<WorkspaceSession> {
        if let Some(open) = self.store.open_session_of_workspace(workspace_id)? {
            return Ok(open);
        }
        self.store.open_session(WorkspaceSession {
            id: 0,
            workspace_id,
            user_id,
            started_at: Utc::now(),
            ended_at: None,
        })
    }

    /// Closes the open session, if any.
    pub fn close(&self, workspace_id: i64) -> CoreResult<()> {
        if let Some(open) = self.store.open_session_of_workspace(workspace_id)? {
            self.store.close_session(open.id, Utc::now())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use berth_types::UserRole;

    use super::*;
    use crate::repo::{MemoryStore, memory_test_workspace};

    #[test]
    fn workspace_created_records_linux_username() {
        let store = MemoryStore::new();
        let logger = AuditLogger::new(&store);
        let actor = Actor {
            user_id: 10,
            company_id: 1,
            role: UserRole::Admin,
        };
        let ws = memory_test_workspace(1, "x", 8001);

        logger
            .workspace_created(actor, &ws, Some("10.1.2.3"))
            .expect("log");

        let events = store.recent_audit_events(10).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, event::WORKSPACE_CREATED);
        assert_eq!(events[0].user_id, Some(10));
        assert_eq!(events[0].ip_address.as_deref(), Some("10.1.2.3"));
        assert_eq!(events[0].detail["linux_username"], "acme_x");
    }

    #[test]
    fn recent_events_keeps_append_order_and_limit() {
        let store = MemoryStore::new();
        let logger = AuditLogger::new(&store);
        for i in 0..5 {
            logger
                .log(event::LOGIN_FAILED, None, None, None, json!({"attempt": i}))
                .expect("log");
        }
        let events = store.recent_audit_events(2).expect("events");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].detail["attempt"], 3);
        assert_eq!(events[1].detail["attempt"], 4);
    }

    #[test]
    fn touch_reuses_the_open_session() {
        let store = MemoryStore::new();
        let tracker = SessionTracker::new(&store);

        let first = tracker.touch(7, 10).expect("open");
        let second = tracker.touch(7, 10).expect("reuse");
        assert_eq!(first.id, second.id);

        tracker.close(7).expect("close");
        let third = tracker.touch(7, 10).expect("reopen");
        assert_ne!(first.id, third.id);

        // Closing with nothing open is harmless.
        tracker.close(99).expect("noop");
    }
}
