//! TaskPilot relational cache.
//!
//! A per-install SQLite database mirroring the HubSpot objects the dashboard
//! and the automation rules operate on: tasks, contacts, list memberships,
//! plus the two tables TaskPilot owns outright — the automation run ledger
//! and the sync execution log.
//!
//! Every write is an upsert or a single-row conditional update keyed by a
//! stable external id or run id, so concurrent invocations converge
//! (last writer wins) instead of corrupting state. The run ledger's
//! `success` flag is the sole idempotency gate: `mark_run_success` only
//! applies where `success=0 AND blocked=0` and reports whether it won.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// Format a timestamp the way every table stores it: RFC3339 UTC with
/// milliseconds and a `Z` suffix, so lexicographic SQL comparisons agree
/// with chronological order.
pub fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp; malformed values collapse to the epoch so a
/// corrupt row surfaces as "very old" instead of a panic.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_default()
}

/// The TaskPilot cache database.
pub struct CacheDb {
    conn: Mutex<Connection>,
}

// ── Record types ──────────────────────────────

/// An automation rule row. The rule body (task templates, schedule, exit
/// behavior) lives in the JSON `definition` column; the automation crate
/// owns its typed shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRecord {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    /// External list whose entries trigger this automation.
    pub list_id: String,
    /// Task queue/category the automation's tasks belong to.
    pub queue_id: String,
    pub definition: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// What kind of action a run represents.
pub const RUN_CREATE_ON_ENTRY: &str = "create_on_entry";
pub const RUN_CREATE_FROM_SEQUENCE: &str = "create_from_sequence";
pub const RUN_COMPLETE_ON_EXIT: &str = "complete_on_exit";
pub const RUN_COMPLETE_ON_ENGAGEMENT: &str = "complete_on_engagement";

/// One planned-or-executed automation action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub automation_id: String,
    pub run_type: String,
    /// List id, task id, or call id depending on run_type.
    pub trigger_object_id: String,
    pub membership_id: String,
    pub contact_id: String,
    pub queue_id: String,
    /// Absolute planned instant (RFC3339 UTC).
    pub planned_at: String,
    /// Human-readable zoned rendering of planned_at.
    pub planned_local: String,
    pub task_name: String,
    /// no_owner | contact_owner | previous_task_owner — resolved at execution.
    pub owner_mode: String,
    /// Owner id captured from the triggering task (previous_task_owner mode).
    pub previous_owner_id: String,
    pub position: i64,
    pub success: bool,
    /// exit_contact_list_block — permanently disqualifies the run.
    pub blocked: bool,
    /// Completed early because the contact engaged (future-dated task).
    pub skipped: bool,
    pub external_task_id: String,
    pub failure_note: String,
    pub created_at: String,
    pub executed_at: Option<String>,
}

/// Local mirror of an external task object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTask {
    pub id: String,
    pub subject: String,
    pub status: String,
    pub due_at: String,
    pub owner_id: String,
    pub queue_id: String,
    pub contact_id: String,
    pub completed_at: String,
    /// Which automation created this task ('' = not automation-created).
    pub created_by_automation: String,
    /// Which automation completed this task ('' = completed by a human).
    pub completed_by_automation: String,
    pub updated_at: String,
}

/// Local mirror of a CRM contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub owner_id: String,
    pub updated_at: String,
}

/// Per-list, per-contact membership. A non-null exit date (or an absent row)
/// is the sole signal that a contact has left the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipRecord {
    pub id: String,
    pub list_id: String,
    pub contact_id: String,
    pub entered_at: String,
    pub exited_at: Option<String>,
}

/// One sync/sweep execution row for the monitor view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncExecution {
    pub id: i64,
    pub kind: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub detail: String,
}

/// Outcome of trying to start a single-flight execution.
#[derive(Debug, Clone, PartialEq)]
pub enum BeginExecution {
    /// We own the execution; carry on and finish it.
    Started(i64),
    /// Another execution of this kind is still running; do nothing.
    AlreadyRunning,
}

impl CacheDb {
    /// Open or create the cache database.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| format!("Cache DB open error: {e}"))?;

        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database (tests).
    pub fn open_in_memory() -> Result<Self, String> {
        Self::open(Path::new(":memory:"))
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS automations (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                list_id TEXT NOT NULL DEFAULT '',
                queue_id TEXT NOT NULL DEFAULT '',
                definition TEXT NOT NULL DEFAULT '{}',   -- JSON rule body
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS automation_runs (
                id TEXT PRIMARY KEY,
                automation_id TEXT NOT NULL,
                run_type TEXT NOT NULL,
                trigger_object_id TEXT NOT NULL DEFAULT '',
                membership_id TEXT NOT NULL DEFAULT '',
                contact_id TEXT NOT NULL DEFAULT '',
                queue_id TEXT NOT NULL DEFAULT '',
                planned_at TEXT NOT NULL,
                planned_local TEXT NOT NULL DEFAULT '',
                task_name TEXT NOT NULL DEFAULT '',
                owner_mode TEXT NOT NULL DEFAULT 'no_owner',
                previous_owner_id TEXT NOT NULL DEFAULT '',
                position INTEGER NOT NULL DEFAULT 1,
                success INTEGER NOT NULL DEFAULT 0,
                blocked INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                external_task_id TEXT NOT NULL DEFAULT '',
                failure_note TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL,
                executed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_runs_pending
                ON automation_runs(success, blocked, run_type, planned_at);
            CREATE INDEX IF NOT EXISTS idx_runs_contact
                ON automation_runs(contact_id, queue_id);

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                subject TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT '',
                due_at TEXT NOT NULL DEFAULT '',
                owner_id TEXT NOT NULL DEFAULT '',
                queue_id TEXT NOT NULL DEFAULT '',
                contact_id TEXT NOT NULL DEFAULT '',
                completed_at TEXT NOT NULL DEFAULT '',
                created_by_automation TEXT NOT NULL DEFAULT '',
                completed_by_automation TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks(queue_id, status);

            CREATE TABLE IF NOT EXISTS contacts (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL DEFAULT '',
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                owner_id TEXT NOT NULL DEFAULT '',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS list_memberships (
                id TEXT PRIMARY KEY,
                list_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                entered_at TEXT NOT NULL DEFAULT '',
                exited_at TEXT,
                UNIQUE (list_id, contact_id)
            );

            CREATE TABLE IF NOT EXISTS sync_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'running',  -- running, completed, failed, skipped
                started_at TEXT NOT NULL,
                finished_at TEXT,
                detail TEXT NOT NULL DEFAULT ''
            );
            ",
        )
        .map_err(|e| format!("Migration error: {e}"))?;
        Ok(())
    }

    // ── Automations ──────────────────────────────

    /// Create or update an automation rule.
    pub fn upsert_automation(
        &self,
        id: &str,
        name: &str,
        enabled: bool,
        list_id: &str,
        queue_id: &str,
        definition: &serde_json::Value,
    ) -> Result<AutomationRecord, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO automations (id, name, enabled, list_id, queue_id, definition, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
               name=?2, enabled=?3, list_id=?4, queue_id=?5, definition=?6, updated_at=?7",
            params![id, name, enabled as i32, list_id, queue_id, definition.to_string(), now],
        )
        .map_err(|e| format!("Upsert automation: {e}"))?;
        drop(conn);
        self.get_automation(id)
    }

    /// Get a single automation.
    pub fn get_automation(&self, id: &str) -> Result<AutomationRecord, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.query_row(
            "SELECT id, name, enabled, list_id, queue_id, definition, created_at, updated_at
             FROM automations WHERE id=?1",
            params![id],
            row_to_automation,
        )
        .map_err(|e| format!("Get automation: {e}"))
    }

    /// List all automations (enabled and disabled).
    pub fn list_automations(&self) -> Result<Vec<AutomationRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, enabled, list_id, queue_id, definition, created_at, updated_at
                 FROM automations ORDER BY name",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map([], row_to_automation)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Delete an automation rule.
    pub fn delete_automation(&self, id: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute("DELETE FROM automations WHERE id=?1", params![id])
            .map_err(|e| format!("Delete automation: {e}"))?;
        Ok(())
    }

    // ── Run ledger ──────────────────────────────

    /// Insert a run in planned state. Insert-once: a duplicate id is an error.
    pub fn insert_run(&self, run: &RunRecord) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "INSERT INTO automation_runs
             (id, automation_id, run_type, trigger_object_id, membership_id, contact_id, queue_id,
              planned_at, planned_local, task_name, owner_mode, previous_owner_id, position,
              success, blocked, skipped, external_task_id, failure_note, created_at, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                run.id,
                run.automation_id,
                run.run_type,
                run.trigger_object_id,
                run.membership_id,
                run.contact_id,
                run.queue_id,
                run.planned_at,
                run.planned_local,
                run.task_name,
                run.owner_mode,
                run.previous_owner_id,
                run.position,
                run.success as i32,
                run.blocked as i32,
                run.skipped as i32,
                run.external_task_id,
                run.failure_note,
                run.created_at,
                run.executed_at,
            ],
        )
        .map_err(|e| format!("Insert run: {e}"))?;
        Ok(())
    }

    /// Get a single run.
    pub fn get_run(&self, id: &str) -> Result<RunRecord, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.query_row(
            &format!("SELECT {RUN_COLS} FROM automation_runs WHERE id=?1"),
            params![id],
            row_to_run,
        )
        .map_err(|e| format!("Get run: {e}"))
    }

    /// Transition a run to successful, attaching the external task id.
    /// Conditional on `success=0 AND blocked=0` — returns whether this call
    /// won the transition. Once true, the run is immutable.
    pub fn mark_run_success(&self, id: &str, external_task_id: &str) -> Result<bool, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let n = conn
            .execute(
                "UPDATE automation_runs
                 SET success=1, external_task_id=?2, executed_at=?3, failure_note=''
                 WHERE id=?1 AND success=0 AND blocked=0",
                params![id, external_task_id, ts(Utc::now())],
            )
            .map_err(|e| format!("Mark run success: {e}"))?;
        Ok(n == 1)
    }

    /// Mark a run blocked (contact exited the triggering list). Skipped for
    /// runs already successful or already blocked.
    pub fn mark_run_blocked(&self, id: &str) -> Result<bool, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let n = conn
            .execute(
                "UPDATE automation_runs SET blocked=1 WHERE id=?1 AND success=0 AND blocked=0",
                params![id],
            )
            .map_err(|e| format!("Mark run blocked: {e}"))?;
        Ok(n == 1)
    }

    /// Attach a failure note to an unexecuted run. The run stays pending and
    /// falls back into the reconciler's window (or ages out of it).
    pub fn set_run_failure(&self, id: &str, note: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "UPDATE automation_runs SET failure_note=?2 WHERE id=?1 AND success=0",
            params![id, note],
        )
        .map_err(|e| format!("Set run failure: {e}"))?;
        Ok(())
    }

    /// Stuck-run selection: unexecuted, unblocked creation runs whose planned
    /// time lies strictly between the two bounds. Bounded by `limit`.
    pub fn stuck_runs(
        &self,
        lower: DateTime<Utc>,
        upper: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RunRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM automation_runs
                 WHERE success=0 AND blocked=0
                   AND run_type IN ('create_on_entry', 'create_from_sequence')
                   AND planned_at > ?1 AND planned_at < ?2
                 ORDER BY planned_at LIMIT ?3"
            ))
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![ts(lower), ts(upper), limit as i64], row_to_run)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// All pending (unexecuted, unblocked) runs for a contact in a queue.
    pub fn pending_runs_for_contact(
        &self,
        contact_id: &str,
        queue_id: &str,
    ) -> Result<Vec<RunRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM automation_runs
                 WHERE contact_id=?1 AND queue_id=?2 AND success=0 AND blocked=0
                 ORDER BY planned_at"
            ))
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![contact_id, queue_id], row_to_run)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Distinct contacts that still have pending runs in a queue.
    pub fn contacts_with_pending_runs(&self, queue_id: &str) -> Result<Vec<String>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT contact_id FROM automation_runs
                 WHERE queue_id=?1 AND success=0 AND blocked=0 AND contact_id != ''",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![queue_id], |row| row.get(0))
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Block every pending run for a contact in a queue whose planned time is
    /// still in the future. Returns how many runs were blocked.
    pub fn block_pending_runs(
        &self,
        contact_id: &str,
        queue_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let n = conn
            .execute(
                "UPDATE automation_runs SET blocked=1
                 WHERE contact_id=?1 AND queue_id=?2 AND success=0 AND blocked=0
                   AND planned_at > ?3",
                params![contact_id, queue_id, ts(now)],
            )
            .map_err(|e| format!("Block pending runs: {e}"))?;
        Ok(n)
    }

    /// Most recent runs, newest first (monitor view).
    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RUN_COLS} FROM automation_runs ORDER BY created_at DESC LIMIT ?1"
            ))
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_run)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Tasks ──────────────────────────────

    /// Upsert a cached task by external id.
    pub fn upsert_task(&self, t: &CachedTask) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "INSERT INTO tasks (id, subject, status, due_at, owner_id, queue_id, contact_id,
                                completed_at, created_by_automation, completed_by_automation, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
               subject=?2, status=?3, due_at=?4, owner_id=?5, queue_id=?6, contact_id=?7,
               completed_at=?8, created_by_automation=?9, completed_by_automation=?10, updated_at=?11",
            params![
                t.id,
                t.subject,
                t.status,
                t.due_at,
                t.owner_id,
                t.queue_id,
                t.contact_id,
                t.completed_at,
                t.created_by_automation,
                t.completed_by_automation,
                ts(Utc::now()),
            ],
        )
        .map_err(|e| format!("Upsert task: {e}"))?;
        Ok(())
    }

    /// Upsert a task from a full resync. Sync never learns provenance from
    /// the remote side, so on conflict the `created_by_automation` and
    /// `completed_by_automation` columns keep their local values.
    pub fn upsert_task_from_sync(&self, t: &CachedTask) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "INSERT INTO tasks (id, subject, status, due_at, owner_id, queue_id, contact_id,
                                completed_at, created_by_automation, completed_by_automation, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '', '', ?9)
             ON CONFLICT(id) DO UPDATE SET
               subject=?2, status=?3, due_at=?4, owner_id=?5, queue_id=?6, contact_id=?7,
               completed_at=?8, updated_at=?9",
            params![
                t.id,
                t.subject,
                t.status,
                t.due_at,
                t.owner_id,
                t.queue_id,
                t.contact_id,
                t.completed_at,
                ts(Utc::now()),
            ],
        )
        .map_err(|e| format!("Upsert task from sync: {e}"))?;
        Ok(())
    }

    /// Get a cached task.
    pub fn get_task(&self, id: &str) -> Result<Option<CachedTask>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        match conn.query_row(
            "SELECT id, subject, status, due_at, owner_id, queue_id, contact_id, completed_at,
                    created_by_automation, completed_by_automation, updated_at
             FROM tasks WHERE id=?1",
            params![id],
            row_to_task,
        ) {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(format!("Get task: {e}")),
        }
    }

    /// Open (not completed) tasks created by an automation in its queue.
    pub fn open_tasks_for_automation(
        &self,
        automation_id: &str,
        queue_id: &str,
    ) -> Result<Vec<CachedTask>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subject, status, due_at, owner_id, queue_id, contact_id, completed_at,
                        created_by_automation, completed_by_automation, updated_at
                 FROM tasks
                 WHERE created_by_automation=?1 AND queue_id=?2 AND status != 'COMPLETED'
                 ORDER BY due_at",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![automation_id, queue_id], row_to_task)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Open automation-created tasks for one contact, for one automation.
    pub fn open_tasks_for_contact(
        &self,
        automation_id: &str,
        contact_id: &str,
    ) -> Result<Vec<CachedTask>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subject, status, due_at, owner_id, queue_id, contact_id, completed_at,
                        created_by_automation, completed_by_automation, updated_at
                 FROM tasks
                 WHERE created_by_automation=?1 AND contact_id=?2 AND status != 'COMPLETED'
                 ORDER BY due_at",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![automation_id, contact_id], row_to_task)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Mirror an automation-driven completion locally before the next sync
    /// confirms it.
    pub fn mark_task_completed(
        &self,
        id: &str,
        automation_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "UPDATE tasks SET status='COMPLETED', completed_at=?2, completed_by_automation=?3, updated_at=?4
             WHERE id=?1",
            params![id, ts(completed_at), automation_id, ts(Utc::now())],
        )
        .map_err(|e| format!("Mark task completed: {e}"))?;
        Ok(())
    }

    // ── Contacts ──────────────────────────────

    /// Upsert a cached contact by external id.
    pub fn upsert_contact(&self, c: &ContactRecord) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "INSERT INTO contacts (id, email, first_name, last_name, owner_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               email=?2, first_name=?3, last_name=?4, owner_id=?5, updated_at=?6",
            params![c.id, c.email, c.first_name, c.last_name, c.owner_id, ts(Utc::now())],
        )
        .map_err(|e| format!("Upsert contact: {e}"))?;
        Ok(())
    }

    /// Get a cached contact.
    pub fn get_contact(&self, id: &str) -> Result<Option<ContactRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        match conn.query_row(
            "SELECT id, email, first_name, last_name, owner_id, updated_at FROM contacts WHERE id=?1",
            params![id],
            |row| {
                Ok(ContactRecord {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    first_name: row.get(2)?,
                    last_name: row.get(3)?,
                    owner_id: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            },
        ) {
            Ok(c) => Ok(Some(c)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(format!("Get contact: {e}")),
        }
    }

    // ── List memberships ──────────────────────────────

    /// Upsert a membership. The (list, contact) pair is the real identity:
    /// the webhook and the resync can hand the same membership different
    /// external ids, so the conflict target is the pair and the latest
    /// writer's id wins.
    pub fn upsert_membership(&self, m: &MembershipRecord) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "INSERT INTO list_memberships (id, list_id, contact_id, entered_at, exited_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(list_id, contact_id) DO UPDATE SET
               id=excluded.id, entered_at=excluded.entered_at, exited_at=excluded.exited_at",
            params![m.id, m.list_id, m.contact_id, m.entered_at, m.exited_at],
        )
        .map_err(|e| format!("Upsert membership: {e}"))?;
        Ok(())
    }

    /// Membership for a (list, contact) pair, if any.
    pub fn get_membership(
        &self,
        list_id: &str,
        contact_id: &str,
    ) -> Result<Option<MembershipRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        match conn.query_row(
            "SELECT id, list_id, contact_id, entered_at, exited_at
             FROM list_memberships WHERE list_id=?1 AND contact_id=?2",
            params![list_id, contact_id],
            row_to_membership,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(format!("Get membership: {e}")),
        }
    }

    /// All memberships of a list that have not recorded an exit.
    pub fn active_memberships(&self, list_id: &str) -> Result<Vec<MembershipRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, list_id, contact_id, entered_at, exited_at
                 FROM list_memberships WHERE list_id=?1 AND exited_at IS NULL",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![list_id], row_to_membership)
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Record that a contact left a list. No-op if the exit is already set.
    pub fn mark_membership_exited(&self, id: &str, at: DateTime<Utc>) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "UPDATE list_memberships SET exited_at=?2 WHERE id=?1 AND exited_at IS NULL",
            params![id, ts(at)],
        )
        .map_err(|e| format!("Mark membership exited: {e}"))?;
        Ok(())
    }

    /// Membership by its external id (run records reference it when the
    /// contact id was not known at trigger time).
    pub fn membership_by_id(&self, id: &str) -> Result<Option<MembershipRecord>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        match conn.query_row(
            "SELECT id, list_id, contact_id, entered_at, exited_at FROM list_memberships WHERE id=?1",
            params![id],
            row_to_membership,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(format!("Get membership by id: {e}")),
        }
    }

    // ── Sync executions ──────────────────────────────

    /// Try to start a single-flight execution of `kind`.
    ///
    /// Advisory lock: if a row of this kind is still `running` and younger
    /// than `timeout_secs`, the caller backs off. A `running` row older than
    /// the timeout is marked failed so the new execution may proceed. This is
    /// a coarse check — a missed exclusion costs staleness, not corruption.
    pub fn begin_execution(&self, kind: &str, timeout_secs: u64) -> Result<BeginExecution, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let now = Utc::now();
        let cutoff = ts(now - chrono::Duration::seconds(timeout_secs as i64));

        // Time out anything that has been "running" for too long.
        conn.execute(
            "UPDATE sync_executions SET status='failed', finished_at=?1, detail='timed out'
             WHERE kind=?2 AND status='running' AND started_at < ?3",
            params![ts(now), kind, cutoff],
        )
        .map_err(|e| format!("Expire stale executions: {e}"))?;

        let running: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sync_executions WHERE kind=?1 AND status='running'",
                params![kind],
                |r| r.get(0),
            )
            .map_err(|e| format!("Check running: {e}"))?;
        if running > 0 {
            return Ok(BeginExecution::AlreadyRunning);
        }

        conn.execute(
            "INSERT INTO sync_executions (kind, status, started_at) VALUES (?1, 'running', ?2)",
            params![kind, ts(now)],
        )
        .map_err(|e| format!("Insert execution: {e}"))?;
        Ok(BeginExecution::Started(conn.last_insert_rowid()))
    }

    /// Finish an execution with a terminal status and detail payload.
    pub fn finish_execution(&self, id: i64, status: &str, detail: &str) -> Result<(), String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        conn.execute(
            "UPDATE sync_executions SET status=?2, finished_at=?3, detail=?4 WHERE id=?1",
            params![id, status, ts(Utc::now()), detail],
        )
        .map_err(|e| format!("Finish execution: {e}"))?;
        Ok(())
    }

    /// Record a completed sweep directly (reconciler/reactor runs are short
    /// enough that they do not hold a running row).
    pub fn record_execution(&self, kind: &str, status: &str, detail: &str) -> Result<i64, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO sync_executions (kind, status, started_at, finished_at, detail)
             VALUES (?1, ?2, ?3, ?3, ?4)",
            params![kind, status, now, detail],
        )
        .map_err(|e| format!("Record execution: {e}"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent executions, newest first (monitor view).
    pub fn recent_executions(&self, limit: usize) -> Result<Vec<SyncExecution>, String> {
        let conn = self.conn.lock().map_err(|e| format!("Lock: {e}"))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, kind, status, started_at, finished_at, detail
                 FROM sync_executions ORDER BY id DESC LIMIT ?1",
            )
            .map_err(|e| format!("Prepare: {e}"))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SyncExecution {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    status: row.get(2)?,
                    started_at: row.get(3)?,
                    finished_at: row.get(4)?,
                    detail: row.get(5)?,
                })
            })
            .map_err(|e| format!("Query: {e}"))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

const RUN_COLS: &str = "id, automation_id, run_type, trigger_object_id, membership_id, contact_id, \
     queue_id, planned_at, planned_local, task_name, owner_mode, previous_owner_id, position, \
     success, blocked, skipped, external_task_id, failure_note, created_at, executed_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        automation_id: row.get(1)?,
        run_type: row.get(2)?,
        trigger_object_id: row.get(3)?,
        membership_id: row.get(4)?,
        contact_id: row.get(5)?,
        queue_id: row.get(6)?,
        planned_at: row.get(7)?,
        planned_local: row.get(8)?,
        task_name: row.get(9)?,
        owner_mode: row.get(10)?,
        previous_owner_id: row.get(11)?,
        position: row.get(12)?,
        success: row.get::<_, i32>(13)? != 0,
        blocked: row.get::<_, i32>(14)? != 0,
        skipped: row.get::<_, i32>(15)? != 0,
        external_task_id: row.get(16)?,
        failure_note: row.get(17)?,
        created_at: row.get(18)?,
        executed_at: row.get(19)?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedTask> {
    Ok(CachedTask {
        id: row.get(0)?,
        subject: row.get(1)?,
        status: row.get(2)?,
        due_at: row.get(3)?,
        owner_id: row.get(4)?,
        queue_id: row.get(5)?,
        contact_id: row.get(6)?,
        completed_at: row.get(7)?,
        created_by_automation: row.get(8)?,
        completed_by_automation: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipRecord> {
    Ok(MembershipRecord {
        id: row.get(0)?,
        list_id: row.get(1)?,
        contact_id: row.get(2)?,
        entered_at: row.get(3)?,
        exited_at: row.get(4)?,
    })
}

fn row_to_automation(row: &rusqlite::Row<'_>) -> rusqlite::Result<AutomationRecord> {
    let definition_str: String = row.get(5)?;
    Ok(AutomationRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        enabled: row.get::<_, i32>(2)? != 0,
        list_id: row.get(3)?,
        queue_id: row.get(4)?,
        definition: serde_json::from_str(&definition_str).unwrap_or_default(),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_db() -> CacheDb {
        CacheDb::open_in_memory().unwrap()
    }

    fn planned_run(id: &str, planned: DateTime<Utc>) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            automation_id: "auto-1".into(),
            run_type: RUN_CREATE_ON_ENTRY.into(),
            trigger_object_id: "list-1".into(),
            membership_id: "m-1".into(),
            contact_id: "c-1".into(),
            queue_id: "q-1".into(),
            planned_at: ts(planned),
            planned_local: String::new(),
            task_name: "Call back".into(),
            owner_mode: "contact_owner".into(),
            previous_owner_id: String::new(),
            position: 1,
            success: false,
            blocked: false,
            skipped: false,
            external_task_id: String::new(),
            failure_note: String::new(),
            created_at: ts(Utc::now()),
            executed_at: None,
        }
    }

    #[test]
    fn test_automation_crud() {
        let db = temp_db();
        let def = serde_json::json!({"initial_task": {"name": "Call back"}});
        let a = db
            .upsert_automation("auto-1", "New leads", true, "list-9", "queue-3", &def)
            .unwrap();
        assert_eq!(a.name, "New leads");
        assert!(a.enabled);
        assert_eq!(a.definition["initial_task"]["name"], "Call back");

        let a2 = db
            .upsert_automation("auto-1", "New leads v2", false, "list-9", "queue-3", &def)
            .unwrap();
        assert_eq!(a2.name, "New leads v2");
        assert!(!a2.enabled);
        assert_eq!(db.list_automations().unwrap().len(), 1);

        db.delete_automation("auto-1").unwrap();
        assert!(db.get_automation("auto-1").is_err());
    }

    #[test]
    fn test_run_success_gate_applies_once() {
        let db = temp_db();
        db.insert_run(&planned_run("r-1", Utc::now())).unwrap();

        assert!(db.mark_run_success("r-1", "task-100").unwrap());
        // Second attempt loses the gate.
        assert!(!db.mark_run_success("r-1", "task-200").unwrap());

        let run = db.get_run("r-1").unwrap();
        assert!(run.success);
        assert_eq!(run.external_task_id, "task-100");
        assert!(run.executed_at.is_some());
    }

    #[test]
    fn test_blocked_run_cannot_succeed() {
        let db = temp_db();
        db.insert_run(&planned_run("r-1", Utc::now())).unwrap();
        assert!(db.mark_run_blocked("r-1").unwrap());
        assert!(!db.mark_run_success("r-1", "task-100").unwrap());
        let run = db.get_run("r-1").unwrap();
        assert!(run.blocked);
        assert!(!run.success);
    }

    #[test]
    fn test_successful_run_cannot_be_blocked() {
        let db = temp_db();
        db.insert_run(&planned_run("r-1", Utc::now())).unwrap();
        assert!(db.mark_run_success("r-1", "task-1").unwrap());
        assert!(!db.mark_run_blocked("r-1").unwrap());
    }

    #[test]
    fn test_stuck_run_window() {
        let db = temp_db();
        let now = Utc::now();
        // Inside the window (2h overdue).
        db.insert_run(&planned_run("r-in", now - Duration::hours(2))).unwrap();
        // Too fresh (5 min overdue, inside grace).
        db.insert_run(&planned_run("r-fresh", now - Duration::minutes(5))).unwrap();
        // Too old (3 days).
        db.insert_run(&planned_run("r-old", now - Duration::hours(72))).unwrap();
        // Overdue but already blocked.
        db.insert_run(&planned_run("r-blocked", now - Duration::hours(3))).unwrap();
        db.mark_run_blocked("r-blocked").unwrap();
        // Overdue but a completion run, not a creation run.
        let mut exit_run = planned_run("r-exit", now - Duration::hours(2));
        exit_run.run_type = RUN_COMPLETE_ON_EXIT.into();
        db.insert_run(&exit_run).unwrap();

        let lower = now - Duration::hours(48);
        let upper = now - Duration::minutes(10);
        let stuck = db.stuck_runs(lower, upper, 100).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "r-in");
    }

    #[test]
    fn test_stuck_run_limit() {
        let db = temp_db();
        let now = Utc::now();
        for i in 0..5i64 {
            db.insert_run(&planned_run(&format!("r-{i}"), now - Duration::hours(1 + i)))
                .unwrap();
        }
        let stuck = db
            .stuck_runs(now - Duration::hours(48), now - Duration::minutes(10), 3)
            .unwrap();
        assert_eq!(stuck.len(), 3);
        // Oldest planned first.
        assert_eq!(stuck[0].id, "r-4");
    }

    #[test]
    fn test_block_pending_future_runs_only() {
        let db = temp_db();
        let now = Utc::now();
        db.insert_run(&planned_run("r-future", now + Duration::hours(4))).unwrap();
        db.insert_run(&planned_run("r-due", now - Duration::hours(1))).unwrap();
        db.insert_run(&planned_run("r-done", now + Duration::hours(2))).unwrap();
        db.mark_run_success("r-done", "t-1").unwrap();

        let blocked = db.block_pending_runs("c-1", "q-1", now).unwrap();
        assert_eq!(blocked, 1);
        assert!(db.get_run("r-future").unwrap().blocked);
        assert!(!db.get_run("r-due").unwrap().blocked);
        assert!(!db.get_run("r-done").unwrap().blocked);

        // A blocked run never reappears in the stuck selection.
        let stuck = db
            .stuck_runs(now - Duration::hours(48), now + Duration::hours(24), 100)
            .unwrap();
        assert!(stuck.iter().all(|r| r.id != "r-future"));
    }

    #[test]
    fn test_task_upsert_and_completion() {
        let db = temp_db();
        let task = CachedTask {
            id: "t-1".into(),
            subject: "Call back".into(),
            status: "NOT_STARTED".into(),
            due_at: ts(Utc::now()),
            owner_id: "o-1".into(),
            queue_id: "q-1".into(),
            contact_id: "c-1".into(),
            completed_at: String::new(),
            created_by_automation: "auto-1".into(),
            completed_by_automation: String::new(),
            updated_at: String::new(),
        };
        db.upsert_task(&task).unwrap();
        assert_eq!(db.open_tasks_for_automation("auto-1", "q-1").unwrap().len(), 1);

        db.mark_task_completed("t-1", "auto-1", Utc::now()).unwrap();
        let t = db.get_task("t-1").unwrap().unwrap();
        assert_eq!(t.status, "COMPLETED");
        assert_eq!(t.completed_by_automation, "auto-1");
        assert!(db.open_tasks_for_automation("auto-1", "q-1").unwrap().is_empty());
    }

    #[test]
    fn test_sync_upsert_preserves_provenance() {
        let db = temp_db();
        let task = CachedTask {
            id: "t-1".into(),
            subject: "Call back".into(),
            status: "NOT_STARTED".into(),
            due_at: ts(Utc::now()),
            owner_id: "o-1".into(),
            queue_id: "q-1".into(),
            contact_id: "c-1".into(),
            completed_at: String::new(),
            created_by_automation: "auto-1".into(),
            completed_by_automation: String::new(),
            updated_at: String::new(),
        };
        db.upsert_task(&task).unwrap();

        let mut from_sync = task.clone();
        from_sync.subject = "Call back (renamed)".into();
        from_sync.created_by_automation = String::new();
        db.upsert_task_from_sync(&from_sync).unwrap();

        let got = db.get_task("t-1").unwrap().unwrap();
        assert_eq!(got.subject, "Call back (renamed)");
        assert_eq!(got.created_by_automation, "auto-1");
    }

    #[test]
    fn test_active_memberships_and_exit() {
        let db = temp_db();
        for (id, contact) in [("m-1", "c-1"), ("m-2", "c-2")] {
            db.upsert_membership(&MembershipRecord {
                id: id.into(),
                list_id: "list-1".into(),
                contact_id: contact.into(),
                entered_at: ts(Utc::now()),
                exited_at: None,
            })
            .unwrap();
        }
        assert_eq!(db.active_memberships("list-1").unwrap().len(), 2);

        db.mark_membership_exited("m-2", Utc::now()).unwrap();
        let active = db.active_memberships("list-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "m-1");
    }

    #[test]
    fn test_membership_lookup() {
        let db = temp_db();
        let m = MembershipRecord {
            id: "m-1".into(),
            list_id: "list-1".into(),
            contact_id: "c-1".into(),
            entered_at: ts(Utc::now()),
            exited_at: None,
        };
        db.upsert_membership(&m).unwrap();
        assert!(db.get_membership("list-1", "c-1").unwrap().is_some());
        assert!(db.get_membership("list-1", "c-2").unwrap().is_none());

        // Record an exit.
        let mut exited = m.clone();
        exited.exited_at = Some(ts(Utc::now()));
        db.upsert_membership(&exited).unwrap();
        let got = db.membership_by_id("m-1").unwrap().unwrap();
        assert!(got.exited_at.is_some());
    }

    #[test]
    fn test_membership_upsert_keys_on_list_and_contact() {
        let db = temp_db();
        // The webhook caches the membership under the id it was handed.
        db.upsert_membership(&MembershipRecord {
            id: "m-123".into(),
            list_id: "list-1".into(),
            contact_id: "c-1".into(),
            entered_at: ts(Utc::now()),
            exited_at: None,
        })
        .unwrap();
        // A later resync writes the same pair under a synthesized id. That
        // must update the row, not trip the pair's unique constraint.
        db.upsert_membership(&MembershipRecord {
            id: "list-1:c-1".into(),
            list_id: "list-1".into(),
            contact_id: "c-1".into(),
            entered_at: ts(Utc::now()),
            exited_at: None,
        })
        .unwrap();

        let active = db.active_memberships("list-1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "list-1:c-1");
        let got = db.get_membership("list-1", "c-1").unwrap().unwrap();
        assert_eq!(got.id, "list-1:c-1");
    }

    #[test]
    fn test_execution_single_flight() {
        let db = temp_db();
        let first = db.begin_execution("full_sync", 600).unwrap();
        let id = match first {
            BeginExecution::Started(id) => id,
            other => panic!("expected Started, got {other:?}"),
        };
        // Second invocation backs off while the first is running.
        assert_eq!(
            db.begin_execution("full_sync", 600).unwrap(),
            BeginExecution::AlreadyRunning
        );
        db.finish_execution(id, "completed", "tasks=10").unwrap();
        // And proceeds once the first has finished.
        assert!(matches!(
            db.begin_execution("full_sync", 600).unwrap(),
            BeginExecution::Started(_)
        ));
    }

    #[test]
    fn test_stale_running_execution_is_failed() {
        let db = temp_db();
        // Timeout of zero: any running row is immediately stale.
        let first = db.begin_execution("full_sync", 0).unwrap();
        assert!(matches!(first, BeginExecution::Started(_)));
        let second = db.begin_execution("full_sync", 0).unwrap();
        assert!(matches!(second, BeginExecution::Started(_)));

        let execs = db.recent_executions(10).unwrap();
        assert_eq!(execs.len(), 2);
        // The older one was marked failed by the newer invocation.
        let failed = execs.iter().filter(|e| e.status == "failed").count();
        assert_eq!(failed, 1);
    }

    #[test]
    fn test_ts_ordering_is_lexicographic() {
        let a = Utc::now();
        let b = a + Duration::milliseconds(1);
        assert!(ts(a) < ts(b));
        // Roundtrip keeps millisecond precision.
        let back = parse_ts(&ts(a));
        assert_eq!(ts(back), ts(a));
    }

    #[test]
    fn test_parse_ts_malformed_is_epoch() {
        assert_eq!(parse_ts("not a date").timestamp(), 0);
    }
}
