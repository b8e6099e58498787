//! Full cache resync.
//!
//! Pages every task, contact, and watched list membership out of the CRM and
//! upserts them into the cache. Single-flight: concurrent invocations back
//! off via the execution log's advisory lock, and the sync gives itself a
//! hard wall-clock budget so a wedged CRM cannot hold the lock forever.

use chrono::Utc;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use taskpilot_core::config::SyncConfig;
use taskpilot_core::{Result, TaskPilotError};
use taskpilot_crm::CrmApi;
use taskpilot_db::{BeginExecution, CacheDb, CachedTask, ContactRecord, MembershipRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Completed,
    /// Another resync was already running.
    Skipped,
    /// The wall-clock budget ran out mid-sync.
    TimedOut,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub tasks: usize,
    pub contacts: usize,
    pub memberships: usize,
}

impl SyncReport {
    fn empty(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            tasks: 0,
            contacts: 0,
            memberships: 0,
        }
    }
}

/// Run a full resync of the cache from the CRM.
pub async fn full_resync(db: &CacheDb, crm: &dyn CrmApi, cfg: &SyncConfig) -> Result<SyncReport> {
    let exec_id = match db
        .begin_execution("full_sync", cfg.timeout_secs)
        .map_err(TaskPilotError::Db)?
    {
        BeginExecution::Started(id) => id,
        BeginExecution::AlreadyRunning => {
            tracing::info!("🔄 Full resync already running; skipping");
            return Ok(SyncReport::empty(SyncOutcome::Skipped));
        }
    };

    let started = Instant::now();
    let budget = Duration::from_secs(cfg.timeout_secs);
    let mut report = SyncReport::empty(SyncOutcome::Completed);
    tracing::info!("🔄 Full resync started (execution {exec_id})");

    match resync_inner(db, crm, started, budget, &mut report).await {
        Ok(true) => {
            let detail = serde_json::to_string(&report).unwrap_or_default();
            db.finish_execution(exec_id, "completed", &detail)
                .map_err(TaskPilotError::Db)?;
            tracing::info!(
                "🔄 Full resync done: {} task(s), {} contact(s), {} membership(s)",
                report.tasks,
                report.contacts,
                report.memberships
            );
            Ok(report)
        }
        Ok(false) => {
            report.outcome = SyncOutcome::TimedOut;
            db.finish_execution(exec_id, "failed", "wall-clock budget exceeded")
                .map_err(TaskPilotError::Db)?;
            tracing::warn!("🔄 Full resync exceeded its {}s budget", cfg.timeout_secs);
            Ok(report)
        }
        Err(e) => {
            db.finish_execution(exec_id, "failed", &e.to_string())
                .map_err(TaskPilotError::Db)?;
            Err(e)
        }
    }
}

/// Returns `Ok(false)` when the budget ran out before all pages were synced.
async fn resync_inner(
    db: &CacheDb,
    crm: &dyn CrmApi,
    started: Instant,
    budget: Duration,
    report: &mut SyncReport,
) -> Result<bool> {
    // Tasks.
    let mut after: Option<String> = None;
    loop {
        if started.elapsed() >= budget {
            return Ok(false);
        }
        let page = crm.list_tasks_page(after.as_deref()).await?;
        for task in &page.results {
            db.upsert_task_from_sync(&CachedTask {
                id: task.id.clone(),
                subject: task.subject.clone(),
                status: task.status.clone(),
                due_at: task.due_at.clone(),
                owner_id: task.owner_id.clone(),
                queue_id: task.queue_id.clone(),
                contact_id: task.contact_id.clone(),
                completed_at: task.completed_at.clone(),
                created_by_automation: String::new(),
                completed_by_automation: String::new(),
                updated_at: String::new(),
            })
            .map_err(TaskPilotError::Db)?;
        }
        report.tasks += page.results.len();
        after = page.after;
        if after.is_none() {
            break;
        }
    }

    // Contacts.
    let mut after: Option<String> = None;
    loop {
        if started.elapsed() >= budget {
            return Ok(false);
        }
        let page = crm.list_contacts_page(after.as_deref()).await?;
        for contact in &page.results {
            db.upsert_contact(&ContactRecord {
                id: contact.id.clone(),
                email: contact.email.clone(),
                first_name: contact.first_name.clone(),
                last_name: contact.last_name.clone(),
                owner_id: contact.owner_id.clone(),
                updated_at: String::new(),
            })
            .map_err(TaskPilotError::Db)?;
        }
        report.contacts += page.results.len();
        after = page.after;
        if after.is_none() {
            break;
        }
    }

    // Memberships of every list an automation watches. The listing endpoint
    // only returns current members; a cached membership that disappeared
    // from the listing is an exit.
    let lists: HashSet<String> = db
        .list_automations()
        .map_err(TaskPilotError::Db)?
        .into_iter()
        .filter(|a| !a.list_id.is_empty())
        .map(|a| a.list_id)
        .collect();
    let now = Utc::now();

    for list_id in lists {
        let mut seen: HashSet<String> = HashSet::new();
        let mut after: Option<String> = None;
        loop {
            if started.elapsed() >= budget {
                return Ok(false);
            }
            let page = crm.list_memberships_page(&list_id, after.as_deref()).await?;
            for m in &page.results {
                db.upsert_membership(&MembershipRecord {
                    id: m.id.clone(),
                    list_id: list_id.clone(),
                    contact_id: m.contact_id.clone(),
                    entered_at: m.entered_at.clone(),
                    exited_at: None,
                })
                .map_err(TaskPilotError::Db)?;
                seen.insert(m.contact_id.clone());
            }
            report.memberships += page.results.len();
            after = page.after;
            if after.is_none() {
                break;
            }
        }

        for cached in db.active_memberships(&list_id).map_err(TaskPilotError::Db)? {
            if !seen.contains(&cached.contact_id) {
                db.mark_membership_exited(&cached.id, now)
                    .map_err(TaskPilotError::Db)?;
            }
        }
    }

    Ok(true)
}
