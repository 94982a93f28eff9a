//! SQLite-backed durable store.
//!
//! All shared mutable state (tasks, reports, conflicts, events, locks, the
//! notification and cycle audit logs) lives here; no in-memory state is
//! authoritative across processes. The database is opened in WAL mode so a
//! process restart replays exactly the pending tasks and unresolved
//! conflicts that existed at the last checkpoint.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::agent::AgentRole;
use crate::core::{
    Conflict, ConflictId, CycleEvent, ReportCategory, Resolution, ScheduleEvent, StatusReport,
    Task, TaskId, TaskStatus, TaskTarget, TriggerKind,
};
use crate::orchestration::locks::Lock;
use crate::orchestration::notify::Priority;
use crate::{mlog_debug, mlog_trace, Error, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL,
    agent_role      TEXT NOT NULL,
    window          INTEGER NOT NULL,
    scheduled_at    TEXT NOT NULL,
    interval_secs   INTEGER,
    note            TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    status          TEXT NOT NULL,
    status_detail   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_due
    ON tasks (status, scheduled_at);
CREATE INDEX IF NOT EXISTS idx_tasks_target
    ON tasks (project_id, agent_role, window);

CREATE TABLE IF NOT EXISTS status_reports (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id      TEXT NOT NULL,
    agent_role      TEXT NOT NULL,
    category        TEXT NOT NULL,
    outcome         TEXT NOT NULL,
    subject         TEXT,
    detail          TEXT NOT NULL,
    reported_at     TEXT NOT NULL,
    authoritative   INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_reports_active
    ON status_reports (project_id, agent_role, category, reported_at);

CREATE TABLE IF NOT EXISTS conflicts (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL,
    category        TEXT NOT NULL,
    report_ids      TEXT NOT NULL,
    detected_at     TEXT NOT NULL,
    resolution      TEXT
);
CREATE INDEX IF NOT EXISTS idx_conflicts_open
    ON conflicts (project_id, category);

CREATE TABLE IF NOT EXISTS schedule_events (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id              TEXT NOT NULL,
    agent_role              TEXT NOT NULL,
    fired_at                TEXT NOT NULL,
    interval_requested_secs INTEGER,
    trigger_kind            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_target
    ON schedule_events (project_id, agent_role, fired_at);

CREATE TABLE IF NOT EXISTS locks (
    resource_key    TEXT PRIMARY KEY,
    holder_id       TEXT NOT NULL,
    acquired_at     TEXT NOT NULL,
    expires_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notifications (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at      TEXT NOT NULL,
    priority        TEXT NOT NULL,
    recipients      TEXT NOT NULL,
    message         TEXT NOT NULL,
    outcome         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cycle_events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    kind            TEXT NOT NULL,
    project_id      TEXT NOT NULL,
    evidence        TEXT NOT NULL,
    action_taken    TEXT NOT NULL,
    detected_at     TEXT NOT NULL
);
";

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Bad timestamp '{}': {}", s, e)))
}

/// Drain a mapped-row iterator, surfacing both SQLite read errors and
/// mapper decode errors. A corrupted row fails the query rather than
/// silently vanishing from the result.
fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<Result<T>>>,
) -> Result<Vec<T>> {
    rows.collect::<rusqlite::Result<Vec<_>>>()?
        .into_iter()
        .collect()
}

/// The durable store shared by every component.
///
/// A single connection guarded by a mutex; cross-process concurrency is
/// handled by SQLite itself (WAL + busy timeout), per-resource concurrency
/// by the locks table.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (and migrate) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        mlog_debug!("Store::open path={}", path.display());
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store. Used by tests and the unit-test fixtures;
    /// the daemon never runs against a memory-only store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        // WAL is the durability guarantee: committed rows survive a crash.
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        mlog_trace!("Store journal_mode={}", mode);
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(())
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means another thread panicked mid-statement; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------- tasks ----------

    pub fn insert_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO tasks (id, project_id, agent_role, window, scheduled_at, interval_secs,
                                note, retry_count, max_retries, status, status_detail,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                task.id.to_string(),
                task.target.project_id,
                task.target.agent_role.as_str(),
                task.target.window,
                ts(task.scheduled_at),
                task.interval_secs,
                task.note,
                task.retry_count,
                task.max_retries,
                task.status.kind_str(),
                task.status.detail(),
                ts(task.created_at),
                ts(task.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn update_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE tasks SET scheduled_at = ?2, interval_secs = ?3, note = ?4,
                              retry_count = ?5, status = ?6, status_detail = ?7, updated_at = ?8
             WHERE id = ?1",
            params![
                task.id.to_string(),
                ts(task.scheduled_at),
                task.interval_secs,
                task.note,
                task.retry_count,
                task.status.kind_str(),
                task.status.detail(),
                ts(task.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(Error::TaskNotFound(task.id.to_string()));
        }
        Ok(())
    }

    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, project_id, agent_role, window, scheduled_at, interval_secs, note,
                    retry_count, max_retries, status, status_detail, created_at, updated_at
             FROM tasks WHERE id = ?1",
            params![id.to_string()],
            row_to_task,
        )
        .optional()?
        .ok_or_else(|| Error::TaskNotFound(id.to_string()))?
    }

    /// Pending task for the same target with a scheduled time within the
    /// dedup window of `scheduled_at`, if one exists.
    pub fn find_pending_duplicate(
        &self,
        target: &TaskTarget,
        scheduled_at: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Option<Task>> {
        let conn = self.lock_conn();
        let low = ts(scheduled_at - window);
        let high = ts(scheduled_at + window);
        let task = conn
            .query_row(
                "SELECT id, project_id, agent_role, window, scheduled_at, interval_secs, note,
                        retry_count, max_retries, status, status_detail, created_at, updated_at
                 FROM tasks
                 WHERE project_id = ?1 AND agent_role = ?2 AND window = ?3
                   AND status = 'pending'
                   AND scheduled_at BETWEEN ?4 AND ?5
                 ORDER BY scheduled_at LIMIT 1",
                params![
                    target.project_id,
                    target.agent_role.as_str(),
                    target.window,
                    low,
                    high
                ],
                row_to_task,
            )
            .optional()?;
        task.transpose()
    }

    /// All pending tasks whose scheduled time has elapsed, oldest first.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, agent_role, window, scheduled_at, interval_secs, note,
                    retry_count, max_retries, status, status_detail, created_at, updated_at
             FROM tasks
             WHERE status = 'pending' AND scheduled_at <= ?1
             ORDER BY scheduled_at",
        )?;
        let rows = stmt.query_map(params![ts(now)], row_to_task)?;
        collect_rows(rows)
    }

    /// List tasks, optionally filtered by status kind and/or project.
    pub fn list_tasks(
        &self,
        status: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let conn = self.lock_conn();
        let mut sql = String::from(
            "SELECT id, project_id, agent_role, window, scheduled_at, interval_secs, note,
                    retry_count, max_retries, status, status_detail, created_at, updated_at
             FROM tasks WHERE 1=1",
        );
        let mut sql_params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(s) = status {
            sql.push_str(" AND status = ?");
            sql_params.push(Box::new(s.to_string()));
        }
        if let Some(p) = project_id {
            sql.push_str(" AND project_id = ?");
            sql_params.push(Box::new(p.to_string()));
        }
        sql.push_str(" ORDER BY scheduled_at");
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            sql_params.iter().map(AsRef::as_ref).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), row_to_task)?;
        collect_rows(rows)
    }

    /// Pending tasks for a (project, agent) pair, any window. Used by the
    /// rapid-reschedule action to cancel duplicate triggers.
    pub fn pending_tasks_for_agent(
        &self,
        project_id: &str,
        agent_role: AgentRole,
    ) -> Result<Vec<Task>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, agent_role, window, scheduled_at, interval_secs, note,
                    retry_count, max_retries, status, status_detail, created_at, updated_at
             FROM tasks
             WHERE project_id = ?1 AND agent_role = ?2 AND status = 'pending'
             ORDER BY scheduled_at",
        )?;
        let rows = stmt.query_map(params![project_id, agent_role.as_str()], row_to_task)?;
        collect_rows(rows)
    }

    // ---------- status reports ----------

    /// Append a report and return its rowid. Reports are never updated
    /// except to clear the authoritative flag.
    pub fn insert_report(&self, report: &StatusReport) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO status_reports (project_id, agent_role, category, outcome, subject,
                                         detail, reported_at, authoritative)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                report.project_id,
                report.agent_role.as_str(),
                report.category.as_str(),
                report.outcome.as_str(),
                report.subject,
                report.detail,
                ts(report.reported_at),
                report.authoritative as i64,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_report(&self, id: i64) -> Result<StatusReport> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, project_id, agent_role, category, outcome, subject, detail,
                    reported_at, authoritative
             FROM status_reports WHERE id = ?1",
            params![id],
            row_to_report,
        )
        .optional()?
        .ok_or_else(|| Error::Validation(format!("No status report with id {}", id)))?
    }

    /// The active (latest per agent+category) reports for a project.
    pub fn active_reports(&self, project_id: &str) -> Result<Vec<StatusReport>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, agent_role, category, outcome, subject, detail,
                    reported_at, authoritative
             FROM status_reports
             WHERE project_id = ?1
               AND id IN (
                   SELECT MAX(id) FROM status_reports
                   WHERE project_id = ?1
                   GROUP BY agent_role, category
               )
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![project_id], row_to_report)?;
        collect_rows(rows)
    }

    /// Clear the authoritative flag on a report ruled against.
    pub fn demote_report(&self, id: i64) -> Result<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE status_reports SET authoritative = 0 WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(Error::Validation(format!("No status report with id {}", id)));
        }
        Ok(())
    }

    // ---------- conflicts ----------

    pub fn insert_conflict(&self, conflict: &Conflict) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO conflicts (id, project_id, category, report_ids, detected_at, resolution)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL)",
            params![
                conflict.id.to_string(),
                conflict.project_id,
                conflict.category.as_str(),
                serde_json::to_string(&conflict.report_ids)?,
                ts(conflict.detected_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_conflict(&self, id: ConflictId) -> Result<Conflict> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, project_id, category, report_ids, detected_at, resolution
             FROM conflicts WHERE id = ?1",
            params![id.to_string()],
            row_to_conflict,
        )
        .optional()?
        .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?
    }

    /// The open conflict for (project, category), if any. The invariant is
    /// that at most one exists.
    pub fn unresolved_conflict(
        &self,
        project_id: &str,
        category: ReportCategory,
    ) -> Result<Option<Conflict>> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT id, project_id, category, report_ids, detected_at, resolution
                 FROM conflicts
                 WHERE project_id = ?1 AND category = ?2 AND resolution IS NULL
                 ORDER BY detected_at LIMIT 1",
                params![project_id, category.as_str()],
                row_to_conflict,
            )
            .optional()?;
        row.transpose()
    }

    /// Add a late report to an open conflict's participant list.
    pub fn update_conflict_reports(&self, id: ConflictId, report_ids: &[i64]) -> Result<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE conflicts SET report_ids = ?2 WHERE id = ?1 AND resolution IS NULL",
            params![id.to_string(), serde_json::to_string(report_ids)?],
        )?;
        if changed == 0 {
            return Err(Error::ConflictNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Append a resolution. Only an unresolved conflict can be written to;
    /// callers check for an existing resolution first to stay idempotent.
    pub fn resolve_conflict(&self, id: ConflictId, resolution: &Resolution) -> Result<()> {
        let conn = self.lock_conn();
        let changed = conn.execute(
            "UPDATE conflicts SET resolution = ?2 WHERE id = ?1 AND resolution IS NULL",
            params![id.to_string(), serde_json::to_string(resolution)?],
        )?;
        if changed == 0 {
            return Err(Error::ConflictNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn list_unresolved_conflicts(&self) -> Result<Vec<Conflict>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, category, report_ids, detected_at, resolution
             FROM conflicts WHERE resolution IS NULL ORDER BY detected_at",
        )?;
        let rows = stmt.query_map([], row_to_conflict)?;
        collect_rows(rows)
    }

    // ---------- schedule events ----------

    pub fn append_schedule_event(&self, event: &ScheduleEvent) -> Result<i64> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO schedule_events (project_id, agent_role, fired_at,
                                          interval_requested_secs, trigger_kind)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.project_id,
                event.agent_role.as_str(),
                ts(event.fired_at),
                event.interval_requested_secs,
                event.trigger_kind.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events for one (project, agent) since a cutoff, oldest first.
    pub fn events_for_target_since(
        &self,
        project_id: &str,
        agent_role: AgentRole,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScheduleEvent>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, agent_role, fired_at, interval_requested_secs, trigger_kind
             FROM schedule_events
             WHERE project_id = ?1 AND agent_role = ?2 AND fired_at >= ?3
             ORDER BY id",
        )?;
        let rows = stmt.query_map(
            params![project_id, agent_role.as_str(), ts(since)],
            row_to_event,
        )?;
        collect_rows(rows)
    }

    /// Count of recovery-kind events for a project since a cutoff. Feeds the
    /// circuit breaker.
    pub fn recovery_count_since(&self, project_id: &str, since: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM schedule_events
             WHERE project_id = ?1 AND trigger_kind = 'recovery' AND fired_at >= ?2",
            params![project_id, ts(since)],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent dispatch time for a project across all agents, if any.
    pub fn last_event_for_project(&self, project_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn();
        let fired: Option<String> = conn
            .query_row(
                "SELECT fired_at FROM schedule_events
                 WHERE project_id = ?1 ORDER BY id DESC LIMIT 1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        fired.map(|s| parse_ts(&s)).transpose()
    }

    // ---------- locks ----------

    pub fn get_lock(&self, resource_key: &str) -> Result<Option<Lock>> {
        let conn = self.lock_conn();
        let row = conn
            .query_row(
                "SELECT resource_key, holder_id, acquired_at, expires_at
                 FROM locks WHERE resource_key = ?1",
                params![resource_key],
                row_to_lock,
            )
            .optional()?;
        row.transpose()
    }

    /// Insert a lock row; fails on a primary-key collision, which the lock
    /// manager treats as Busy after its own staleness check.
    pub fn insert_lock(&self, lock: &Lock) -> Result<bool> {
        let conn = self.lock_conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO locks (resource_key, holder_id, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                lock.resource_key,
                lock.holder_id,
                ts(lock.acquired_at),
                ts(lock.expires_at),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Delete a lock row held by `holder_id`. Returns whether a row went.
    pub fn delete_lock(&self, resource_key: &str, holder_id: &str) -> Result<bool> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM locks WHERE resource_key = ?1 AND holder_id = ?2",
            params![resource_key, holder_id],
        )?;
        Ok(deleted == 1)
    }

    /// Delete a lock row regardless of holder, but only if it has expired.
    /// This is the staleness reclaim, the single non-owner mutation allowed.
    pub fn delete_stale_lock(&self, resource_key: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn();
        let deleted = conn.execute(
            "DELETE FROM locks WHERE resource_key = ?1 AND expires_at < ?2",
            params![resource_key, ts(now)],
        )?;
        Ok(deleted == 1)
    }

    pub fn list_locks(&self) -> Result<Vec<Lock>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT resource_key, holder_id, acquired_at, expires_at
             FROM locks ORDER BY resource_key",
        )?;
        let rows = stmt.query_map([], row_to_lock)?;
        collect_rows(rows)
    }

    // ---------- audit logs ----------

    pub fn append_notification(
        &self,
        priority: Priority,
        recipients: &[AgentRole],
        message: &str,
        outcome: &str,
    ) -> Result<()> {
        let conn = self.lock_conn();
        let names: Vec<&str> = recipients.iter().map(AgentRole::as_str).collect();
        conn.execute(
            "INSERT INTO notifications (created_at, priority, recipients, message, outcome)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ts(Utc::now()),
                priority.as_str(),
                serde_json::to_string(&names)?,
                message,
                outcome,
            ],
        )?;
        Ok(())
    }

    pub fn recent_notifications(&self, limit: usize) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT created_at || ' [' || priority || '] ' || recipients || ' ' || message
                    || ' -> ' || outcome
             FROM notifications ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn append_cycle_event(&self, event: &CycleEvent) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO cycle_events (kind, project_id, evidence, action_taken, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.kind.as_str(),
                event.project_id,
                event.evidence,
                serde_json::to_string(&event.action_taken)?,
                ts(event.detected_at),
            ],
        )?;
        Ok(())
    }

    pub fn recent_cycle_events(&self, limit: usize) -> Result<Vec<CycleEvent>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT kind, project_id, evidence, action_taken, detected_at
             FROM cycle_events ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let kind: String = row.get(0)?;
            let project_id: String = row.get(1)?;
            let evidence: String = row.get(2)?;
            let action: String = row.get(3)?;
            let detected: String = row.get(4)?;
            Ok((kind, project_id, evidence, action, detected))
        })?;
        let mut events = Vec::new();
        for row in rows {
            let (kind, project_id, evidence, action, detected) = row?;
            let kind = match kind.as_str() {
                "rapid_reschedule" => crate::core::CycleKind::RapidReschedule,
                "fixed_interval_loop" => crate::core::CycleKind::FixedIntervalLoop,
                "oscillation" => crate::core::CycleKind::Oscillation,
                "dependency_cycle" => crate::core::CycleKind::DependencyCycle,
                other => {
                    return Err(Error::Validation(format!("Unknown cycle kind: {}", other)))
                }
            };
            events.push(CycleEvent {
                kind,
                project_id,
                evidence,
                action_taken: serde_json::from_str(&action)?,
                detected_at: parse_ts(&detected)?,
            });
        }
        Ok(events)
    }
}

// ---------- row mappers ----------
//
// Mappers return Result<crate::Result<T>> so parse failures inside a row
// surface as crate errors instead of panics; collect sites flatten them.

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Result<Task>> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let agent_role: String = row.get(2)?;
    let window: u32 = row.get(3)?;
    let scheduled_at: String = row.get(4)?;
    let interval_secs: Option<u64> = row.get(5)?;
    let note: String = row.get(6)?;
    let retry_count: u32 = row.get(7)?;
    let max_retries: u32 = row.get(8)?;
    let status: String = row.get(9)?;
    let status_detail: Option<String> = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;

    Ok((|| {
        Ok(Task {
            id: id
                .parse()
                .map_err(|_| Error::Validation(format!("Bad task id: {}", id)))?,
            target: TaskTarget {
                project_id,
                agent_role: agent_role.parse()?,
                window,
            },
            scheduled_at: parse_ts(&scheduled_at)?,
            interval_secs,
            note,
            retry_count,
            max_retries,
            status: TaskStatus::from_db(&status, status_detail)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

fn row_to_report(row: &Row<'_>) -> rusqlite::Result<Result<StatusReport>> {
    let id: i64 = row.get(0)?;
    let project_id: String = row.get(1)?;
    let agent_role: String = row.get(2)?;
    let category: String = row.get(3)?;
    let outcome: String = row.get(4)?;
    let subject: Option<String> = row.get(5)?;
    let detail: String = row.get(6)?;
    let reported_at: String = row.get(7)?;
    let authoritative: i64 = row.get(8)?;

    Ok((|| {
        Ok(StatusReport {
            id,
            project_id,
            agent_role: agent_role.parse()?,
            category: category.parse()?,
            outcome: outcome.parse()?,
            subject,
            detail,
            reported_at: parse_ts(&reported_at)?,
            authoritative: authoritative != 0,
        })
    })())
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<Result<Conflict>> {
    let id: String = row.get(0)?;
    let project_id: String = row.get(1)?;
    let category: String = row.get(2)?;
    let report_ids: String = row.get(3)?;
    let detected_at: String = row.get(4)?;
    let resolution: Option<String> = row.get(5)?;

    Ok((|| {
        Ok(Conflict {
            id: id
                .parse()
                .map_err(|_| Error::Validation(format!("Bad conflict id: {}", id)))?,
            project_id,
            category: category.parse()?,
            report_ids: serde_json::from_str(&report_ids)?,
            detected_at: parse_ts(&detected_at)?,
            resolution: resolution
                .map(|json| serde_json::from_str(&json))
                .transpose()?,
        })
    })())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Result<ScheduleEvent>> {
    let id: i64 = row.get(0)?;
    let project_id: String = row.get(1)?;
    let agent_role: String = row.get(2)?;
    let fired_at: String = row.get(3)?;
    let interval_requested_secs: Option<u64> = row.get(4)?;
    let trigger_kind: String = row.get(5)?;

    Ok((|| {
        Ok(ScheduleEvent {
            id,
            project_id,
            agent_role: agent_role.parse()?,
            fired_at: parse_ts(&fired_at)?,
            interval_requested_secs,
            trigger_kind: trigger_kind.parse::<TriggerKind>()?,
        })
    })())
}

fn row_to_lock(row: &Row<'_>) -> rusqlite::Result<Result<Lock>> {
    let resource_key: String = row.get(0)?;
    let holder_id: String = row.get(1)?;
    let acquired_at: String = row.get(2)?;
    let expires_at: String = row.get(3)?;

    Ok((|| {
        Ok(Lock {
            resource_key,
            holder_id,
            acquired_at: parse_ts(&acquired_at)?,
            expires_at: parse_ts(&expires_at)?,
        })
    })())
}
