//! Stuck-run reconciliation.
//!
//! Planned runs only become real CRM tasks here. The sweep selects runs whose
//! planned time fell into the retry window (overdue past the grace period but
//! not older than the window), refreshes the contacts involved, resolves each
//! task's owner, and issues one batch create. Per-item outcomes drive the run
//! ledger: the conditional success flip is what makes concurrent sweeps safe.

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use taskpilot_core::config::SyncConfig;
use taskpilot_core::{Result, TaskPilotError};
use taskpilot_crm::{CrmApi, NewTask};
use taskpilot_db::{CacheDb, CachedTask, ContactRecord, RunRecord, parse_ts, ts};

use crate::definitions::OwnerMode;

/// Outcome counts of one reconciliation sweep.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RetryReport {
    /// Runs selected from the retry window.
    pub selected: usize,
    /// Tasks created (run flipped to successful).
    pub created: usize,
    /// Per-item API failures (run stays pending with a note).
    pub failed: usize,
    /// Runs skipped: unresolvable contact, or lost the success gate to a
    /// concurrent sweep.
    pub skipped: usize,
}

/// Run one reconciliation sweep.
pub async fn sweep(db: &CacheDb, crm: &dyn CrmApi, cfg: &SyncConfig) -> Result<RetryReport> {
    sweep_at(db, crm, cfg, Utc::now()).await
}

pub async fn sweep_at(
    db: &CacheDb,
    crm: &dyn CrmApi,
    cfg: &SyncConfig,
    now: DateTime<Utc>,
) -> Result<RetryReport> {
    let lower = now - Duration::hours(cfg.retry_window_hours);
    let upper = now - Duration::minutes(cfg.retry_grace_minutes);
    let runs = db
        .stuck_runs(lower, upper, cfg.retry_batch_limit)
        .map_err(TaskPilotError::Db)?;

    let mut report = RetryReport {
        selected: runs.len(),
        ..Default::default()
    };
    if runs.is_empty() {
        tracing::debug!("🔁 Reconciler: no stuck runs");
        return Ok(report);
    }
    tracing::info!("🔁 Reconciler: {} stuck run(s) selected", runs.len());

    // Resolve each run's contact, via the membership row when the trigger
    // did not know the contact id.
    let mut contact_of: HashMap<String, String> = HashMap::new();
    for run in &runs {
        let contact_id = if !run.contact_id.is_empty() {
            Some(run.contact_id.clone())
        } else if !run.membership_id.is_empty() {
            db.membership_by_id(&run.membership_id)
                .map_err(TaskPilotError::Db)?
                .map(|m| m.contact_id)
        } else {
            None
        };
        if let Some(id) = contact_id {
            contact_of.insert(run.id.clone(), id);
        }
    }

    // Refresh the contacts involved so owner assignment does not act on a
    // stale cache. A fetch failure falls back to whatever is cached.
    let distinct: BTreeSet<&String> = contact_of.values().collect();
    for contact_id in distinct {
        match crm.fetch_contact(contact_id).await {
            Ok(Some(c)) => {
                db.upsert_contact(&ContactRecord {
                    id: c.id,
                    email: c.email,
                    first_name: c.first_name,
                    last_name: c.last_name,
                    owner_id: c.owner_id,
                    updated_at: String::new(),
                })
                .map_err(TaskPilotError::Db)?;
            }
            Ok(None) => {
                tracing::warn!("🔁 Contact {contact_id} no longer exists in the CRM");
            }
            Err(e) => {
                tracing::warn!("🔁 Contact {contact_id} refresh failed: {e}");
            }
        }
    }

    // Build the creation batch, skipping runs that cannot be resolved.
    let mut eligible: Vec<(&RunRecord, NewTask)> = Vec::new();
    for run in &runs {
        let Some(contact_id) = contact_of.get(&run.id) else {
            db.set_run_failure(&run.id, "contact could not be resolved")
                .map_err(TaskPilotError::Db)?;
            report.skipped += 1;
            continue;
        };
        let owner_id = match resolve_owner(db, run, contact_id)? {
            OwnerResolution::Owner(owner) => owner,
            OwnerResolution::Unresolvable(note) => {
                db.set_run_failure(&run.id, &note)
                    .map_err(TaskPilotError::Db)?;
                report.skipped += 1;
                continue;
            }
        };
        eligible.push((
            run,
            NewTask {
                subject: run.task_name.clone(),
                due_at: parse_ts(&run.planned_at),
                owner_id,
                queue_id: run.queue_id.clone(),
                contact_id: contact_id.clone(),
            },
        ));
    }

    if eligible.is_empty() {
        record(db, &report);
        return Ok(report);
    }

    let tasks: Vec<NewTask> = eligible.iter().map(|(_, t)| t.clone()).collect();
    let outcomes = crm.batch_create_tasks(&tasks).await?;

    for ((run, task), outcome) in eligible.iter().zip(outcomes) {
        if outcome.success {
            let won = db
                .mark_run_success(&run.id, &outcome.external_id)
                .map_err(TaskPilotError::Db)?;
            if won {
                report.created += 1;
                // Mirror the new task locally ahead of the next resync.
                db.upsert_task(&CachedTask {
                    id: outcome.external_id.clone(),
                    subject: task.subject.clone(),
                    status: "NOT_STARTED".into(),
                    due_at: ts(task.due_at),
                    owner_id: task.owner_id.clone().unwrap_or_default(),
                    queue_id: task.queue_id.clone(),
                    contact_id: task.contact_id.clone(),
                    completed_at: String::new(),
                    created_by_automation: run.automation_id.clone(),
                    completed_by_automation: String::new(),
                    updated_at: String::new(),
                })
                .map_err(TaskPilotError::Db)?;
            } else {
                // A concurrent sweep or an exit block won the gate first.
                report.skipped += 1;
            }
        } else {
            db.set_run_failure(&run.id, &outcome.error)
                .map_err(TaskPilotError::Db)?;
            report.failed += 1;
        }
    }

    tracing::info!(
        "🔁 Reconciler done: {} created, {} failed, {} skipped",
        report.created,
        report.failed,
        report.skipped
    );
    record(db, &report);
    Ok(report)
}

enum OwnerResolution {
    Owner(Option<String>),
    Unresolvable(String),
}

/// Owner resolution happens at execution time so it sees the contact's
/// current owner, not the owner at trigger time.
fn resolve_owner(db: &CacheDb, run: &RunRecord, contact_id: &str) -> Result<OwnerResolution> {
    let resolution = match OwnerMode::parse(&run.owner_mode) {
        OwnerMode::NoOwner => OwnerResolution::Owner(None),
        OwnerMode::PreviousTaskOwner => {
            if run.previous_owner_id.is_empty() {
                OwnerResolution::Owner(None)
            } else {
                OwnerResolution::Owner(Some(run.previous_owner_id.clone()))
            }
        }
        OwnerMode::ContactOwner => match db.get_contact(contact_id).map_err(TaskPilotError::Db)? {
            // An owner-less contact is a valid outcome; only a missing
            // contact row makes the run unresolvable.
            Some(c) if c.owner_id.is_empty() => OwnerResolution::Owner(None),
            Some(c) => OwnerResolution::Owner(Some(c.owner_id)),
            None => OwnerResolution::Unresolvable(format!(
                "contact {contact_id} not found for owner assignment"
            )),
        },
    };
    Ok(resolution)
}

fn record(db: &CacheDb, report: &RetryReport) {
    let detail = serde_json::to_string(report).unwrap_or_default();
    if let Err(e) = db.record_execution("reconcile", "completed", &detail) {
        tracing::warn!("🔁 Could not record reconcile execution: {e}");
    }
}
