//! List-exit and engagement reactors.
//!
//! Exit handling is two independent behaviors, each opt-in per automation:
//! completing the automation's open tasks for contacts that left the list,
//! and blocking pending future runs so the sequence stops. Engagement
//! handling completes a contact's open tasks when an outbound call is logged,
//! marking future-dated tasks as skipped-early in the ledger.
//!
//! Every completion is written to the run ledger whether or not the remote
//! update succeeded, so the monitor shows exactly what was attempted.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use taskpilot_core::{Result, TaskPilotError};
use taskpilot_crm::CrmApi;
use taskpilot_db::{
    AutomationRecord, CacheDb, CachedTask, RUN_COMPLETE_ON_ENGAGEMENT, RUN_COMPLETE_ON_EXIT,
    RunRecord, parse_ts, ts,
};
use uuid::Uuid;

use crate::definitions::AutomationDefinition;

/// Outcome counts of one exit sweep.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExitReport {
    /// Distinct exited contacts acted on.
    pub contacts_exited: usize,
    pub tasks_completed: usize,
    /// Pending future runs blocked.
    pub runs_blocked: usize,
    /// Completion attempts that failed remotely.
    pub failures: usize,
}

/// Outcome counts of one engagement reaction.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EngagementReport {
    /// Automations that had open tasks for the contact.
    pub automations: usize,
    pub tasks_completed: usize,
    /// Of the completed tasks, how many were future-dated (skipped early).
    pub tasks_skipped_early: usize,
    pub failures: usize,
}

/// Sweep all enabled automations for contacts that left their list.
pub async fn sweep_exited(db: &CacheDb, crm: &dyn CrmApi) -> Result<ExitReport> {
    sweep_exited_at(db, crm, Utc::now()).await
}

pub async fn sweep_exited_at(
    db: &CacheDb,
    crm: &dyn CrmApi,
    now: DateTime<Utc>,
) -> Result<ExitReport> {
    let mut report = ExitReport::default();

    for record in db.list_automations().map_err(TaskPilotError::Db)? {
        if !record.enabled {
            continue;
        }
        let def = match AutomationDefinition::from_value(&record.definition) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("🚪 Skipping automation '{}': {e}", record.id);
                continue;
            }
        };
        if !def.auto_complete_on_exit_enabled && !def.sequence_exit_enabled {
            continue;
        }

        // One bad automation must not stop the others.
        if let Err(e) = sweep_one(db, crm, &record, &def, now, &mut report).await {
            tracing::warn!("🚪 Exit sweep failed for automation '{}': {e}", record.id);
            report.failures += 1;
        }
    }

    tracing::info!(
        "🚪 Exit sweep done: {} contact(s), {} task(s) completed, {} run(s) blocked",
        report.contacts_exited,
        report.tasks_completed,
        report.runs_blocked
    );
    let detail = serde_json::to_string(&report).unwrap_or_default();
    if let Err(e) = db.record_execution("exit_sweep", "completed", &detail) {
        tracing::warn!("🚪 Could not record exit sweep execution: {e}");
    }
    Ok(report)
}

async fn sweep_one(
    db: &CacheDb,
    crm: &dyn CrmApi,
    record: &AutomationRecord,
    def: &AutomationDefinition,
    now: DateTime<Utc>,
    report: &mut ExitReport,
) -> Result<()> {
    let open = db
        .open_tasks_for_automation(&record.id, &record.queue_id)
        .map_err(TaskPilotError::Db)?;

    // A contact counts as exited when its membership row records an exit or
    // is missing entirely (the resync removed it).
    let mut exited_tasks: Vec<CachedTask> = Vec::new();
    let mut exited_contacts: BTreeSet<String> = BTreeSet::new();
    for task in open {
        if task.contact_id.is_empty() {
            continue;
        }
        let exited = match db
            .get_membership(&record.list_id, &task.contact_id)
            .map_err(TaskPilotError::Db)?
        {
            None => true,
            Some(m) => m.exited_at.is_some(),
        };
        if exited {
            exited_contacts.insert(task.contact_id.clone());
            exited_tasks.push(task);
        }
    }

    if def.auto_complete_on_exit_enabled && !exited_tasks.is_empty() {
        let ids: Vec<String> = exited_tasks.iter().map(|t| t.id.clone()).collect();
        match crm.batch_complete_tasks(&ids).await {
            Ok(outcomes) => {
                for (task, outcome) in exited_tasks.iter().zip(outcomes) {
                    let run = completion_run(
                        record,
                        RUN_COMPLETE_ON_EXIT,
                        &record.list_id,
                        task,
                        now,
                        outcome.success,
                        false,
                        &outcome.error,
                    );
                    db.insert_run(&run).map_err(TaskPilotError::Db)?;
                    if outcome.success {
                        db.mark_task_completed(&task.id, &record.id, now)
                            .map_err(TaskPilotError::Db)?;
                        report.tasks_completed += 1;
                    } else {
                        report.failures += 1;
                    }
                }
            }
            Err(e) => {
                // Transport failure: every item in this batch failed. Record
                // the attempts so the monitor surfaces them.
                let note = e.to_string();
                for task in &exited_tasks {
                    let run = completion_run(
                        record,
                        RUN_COMPLETE_ON_EXIT,
                        &record.list_id,
                        task,
                        now,
                        false,
                        false,
                        &note,
                    );
                    db.insert_run(&run).map_err(TaskPilotError::Db)?;
                }
                report.failures += exited_tasks.len();
            }
        }
    }

    if def.sequence_exit_enabled {
        // Pending runs exist for contacts that have no open task yet, so the
        // exited-contact check runs over the ledger, not just the task cache.
        for contact_id in db
            .contacts_with_pending_runs(&record.queue_id)
            .map_err(TaskPilotError::Db)?
        {
            let exited = match db
                .get_membership(&record.list_id, &contact_id)
                .map_err(TaskPilotError::Db)?
            {
                None => true,
                Some(m) => m.exited_at.is_some(),
            };
            if exited {
                report.runs_blocked += db
                    .block_pending_runs(&contact_id, &record.queue_id, now)
                    .map_err(TaskPilotError::Db)?;
                exited_contacts.insert(contact_id);
            }
        }
    }

    report.contacts_exited += exited_contacts.len();
    Ok(())
}

/// React to a logged call engagement: complete the contact's open
/// automation tasks. Inbound calls and calls without a contact are ignored.
pub async fn on_call_engagement(
    db: &CacheDb,
    crm: &dyn CrmApi,
    call_id: &str,
) -> Result<EngagementReport> {
    let Some(call) = crm.fetch_call(call_id).await? else {
        tracing::debug!("📞 Call {call_id} not found; ignoring");
        return Ok(EngagementReport::default());
    };
    if !call.direction.eq_ignore_ascii_case("OUTBOUND") {
        tracing::debug!("📞 Call {call_id} is {}; ignoring", call.direction);
        return Ok(EngagementReport::default());
    }
    let Some(contact_id) = call.contact_id else {
        tracing::debug!("📞 Call {call_id} has no associated contact; ignoring");
        return Ok(EngagementReport::default());
    };
    on_contact_engagement_at(db, crm, &contact_id, call_id, Utc::now()).await
}

pub async fn on_contact_engagement_at(
    db: &CacheDb,
    crm: &dyn CrmApi,
    contact_id: &str,
    call_id: &str,
    now: DateTime<Utc>,
) -> Result<EngagementReport> {
    let mut report = EngagementReport::default();

    for record in db.list_automations().map_err(TaskPilotError::Db)? {
        if !record.enabled {
            continue;
        }
        let def = match AutomationDefinition::from_value(&record.definition) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("📞 Skipping automation '{}': {e}", record.id);
                continue;
            }
        };
        if !def.auto_complete_on_engagement {
            continue;
        }
        let open = db
            .open_tasks_for_contact(&record.id, contact_id)
            .map_err(TaskPilotError::Db)?;
        if open.is_empty() {
            continue;
        }
        report.automations += 1;

        let ids: Vec<String> = open.iter().map(|t| t.id.clone()).collect();
        match crm.batch_complete_tasks(&ids).await {
            Ok(outcomes) => {
                for (task, outcome) in open.iter().zip(outcomes) {
                    // A future-dated task is completed anyway; the skipped
                    // marker distinguishes "done early" from "done on time".
                    let future_dated = parse_ts(&task.due_at) > now;
                    let run = completion_run(
                        &record,
                        RUN_COMPLETE_ON_ENGAGEMENT,
                        call_id,
                        task,
                        now,
                        outcome.success,
                        future_dated,
                        &outcome.error,
                    );
                    db.insert_run(&run).map_err(TaskPilotError::Db)?;
                    if outcome.success {
                        db.mark_task_completed(&task.id, &record.id, now)
                            .map_err(TaskPilotError::Db)?;
                        report.tasks_completed += 1;
                        if future_dated {
                            report.tasks_skipped_early += 1;
                        }
                    } else {
                        report.failures += 1;
                    }
                }
            }
            Err(e) => {
                let note = e.to_string();
                for task in &open {
                    let run = completion_run(
                        &record,
                        RUN_COMPLETE_ON_ENGAGEMENT,
                        call_id,
                        task,
                        now,
                        false,
                        false,
                        &note,
                    );
                    db.insert_run(&run).map_err(TaskPilotError::Db)?;
                }
                report.failures += open.len();
            }
        }
    }

    if report.automations > 0 {
        tracing::info!(
            "📞 Engagement by contact {contact_id}: {} task(s) completed ({} early)",
            report.tasks_completed,
            report.tasks_skipped_early
        );
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn completion_run(
    record: &AutomationRecord,
    run_type: &str,
    trigger_object_id: &str,
    task: &CachedTask,
    now: DateTime<Utc>,
    success: bool,
    skipped: bool,
    failure_note: &str,
) -> RunRecord {
    RunRecord {
        id: Uuid::new_v4().to_string(),
        automation_id: record.id.clone(),
        run_type: run_type.to_string(),
        trigger_object_id: trigger_object_id.to_string(),
        membership_id: String::new(),
        contact_id: task.contact_id.clone(),
        queue_id: record.queue_id.clone(),
        planned_at: ts(now),
        planned_local: String::new(),
        task_name: task.subject.clone(),
        owner_mode: String::new(),
        previous_owner_id: String::new(),
        position: 0,
        success,
        blocked: false,
        skipped,
        external_task_id: task.id.clone(),
        failure_note: failure_note.to_string(),
        created_at: ts(now),
        executed_at: success.then(|| ts(now)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockCrm, utc};
    use chrono::Duration;
    use taskpilot_crm::CrmCall;
    use taskpilot_db::MembershipRecord;

    fn insert_automation(db: &CacheDb, id: &str, definition: serde_json::Value) {
        db.upsert_automation(id, &format!("Automation {id}"), true, "list-1", "q-1", &definition)
            .unwrap();
    }

    fn open_task(db: &CacheDb, id: &str, automation_id: &str, contact_id: &str, due: DateTime<Utc>) {
        db.upsert_task(&CachedTask {
            id: id.into(),
            subject: format!("Task {id}"),
            status: "NOT_STARTED".into(),
            due_at: ts(due),
            owner_id: String::new(),
            queue_id: "q-1".into(),
            contact_id: contact_id.into(),
            completed_at: String::new(),
            created_by_automation: automation_id.into(),
            completed_by_automation: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
    }

    fn member(db: &CacheDb, id: &str, contact_id: &str, exited: Option<DateTime<Utc>>) {
        db.upsert_membership(&MembershipRecord {
            id: id.into(),
            list_id: "list-1".into(),
            contact_id: contact_id.into(),
            entered_at: String::new(),
            exited_at: exited.map(ts),
        })
        .unwrap();
    }

    #[tokio::test]
    async fn test_exit_completes_tasks_and_blocks_future_runs() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        insert_automation(
            &db,
            "auto-1",
            serde_json::json!({
                "initial_task": {"name": "Call back"},
                "sequence_exit_enabled": true,
                "auto_complete_on_exit_enabled": true
            }),
        );
        // c-gone exited, c-here is still a member.
        member(&db, "m-1", "c-gone", Some(now - Duration::hours(1)));
        member(&db, "m-2", "c-here", None);
        open_task(&db, "t-gone", "auto-1", "c-gone", now - Duration::hours(2));
        open_task(&db, "t-here", "auto-1", "c-here", now - Duration::hours(2));
        // A pending future run for the exited contact.
        db.insert_run(&crate::testutil::pending_run(
            "r-future",
            "c-gone",
            now + Duration::hours(6),
        ))
        .unwrap();

        let report = sweep_exited_at(&db, &crm, now).await.unwrap();
        assert_eq!(report.contacts_exited, 1);
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(report.runs_blocked, 1);
        assert_eq!(report.failures, 0);

        assert_eq!(db.get_task("t-gone").unwrap().unwrap().status, "COMPLETED");
        assert_eq!(db.get_task("t-here").unwrap().unwrap().status, "NOT_STARTED");
        assert!(db.get_run("r-future").unwrap().blocked);

        // The completion was written to the ledger.
        let runs = db.recent_runs(10).unwrap();
        let exit_run = runs.iter().find(|r| r.run_type == RUN_COMPLETE_ON_EXIT).unwrap();
        assert!(exit_run.success);
        assert_eq!(exit_run.external_task_id, "t-gone");
    }

    #[tokio::test]
    async fn test_missing_membership_row_counts_as_exited() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        insert_automation(
            &db,
            "auto-1",
            serde_json::json!({
                "initial_task": {"name": "Call back"},
                "auto_complete_on_exit_enabled": true
            }),
        );
        // No membership row at all for c-vanished.
        open_task(&db, "t-1", "auto-1", "c-vanished", now - Duration::hours(2));

        let report = sweep_exited_at(&db, &crm, now).await.unwrap();
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(db.get_task("t-1").unwrap().unwrap().status, "COMPLETED");
    }

    #[tokio::test]
    async fn test_exit_flags_act_independently() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        // Only sequence_exit: runs are blocked but tasks stay open.
        insert_automation(
            &db,
            "auto-1",
            serde_json::json!({
                "initial_task": {"name": "Call back"},
                "sequence_exit_enabled": true
            }),
        );
        member(&db, "m-1", "c-gone", Some(now - Duration::hours(1)));
        open_task(&db, "t-1", "auto-1", "c-gone", now - Duration::hours(2));
        db.insert_run(&crate::testutil::pending_run(
            "r-future",
            "c-gone",
            now + Duration::hours(6),
        ))
        .unwrap();

        let report = sweep_exited_at(&db, &crm, now).await.unwrap();
        assert_eq!(report.runs_blocked, 1);
        assert_eq!(report.tasks_completed, 0);
        assert_eq!(db.get_task("t-1").unwrap().unwrap().status, "NOT_STARTED");
        assert!(crm.completed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exit_batch_transport_failure_is_isolated() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        // auto-bad's batch errors out; auto-good still completes its task.
        insert_automation(
            &db,
            "auto-bad",
            serde_json::json!({
                "initial_task": {"name": "X"},
                "auto_complete_on_exit_enabled": true
            }),
        );
        insert_automation(
            &db,
            "auto-good",
            serde_json::json!({
                "initial_task": {"name": "Y"},
                "auto_complete_on_exit_enabled": true
            }),
        );
        member(&db, "m-1", "c-gone", Some(now - Duration::hours(1)));
        open_task(&db, "t-bad", "auto-bad", "c-gone", now - Duration::hours(2));
        open_task(&db, "t-good", "auto-good", "c-gone", now - Duration::hours(2));
        crm.poison_complete_ids.lock().unwrap().insert("t-bad".into());

        let report = sweep_exited_at(&db, &crm, now).await.unwrap();
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(report.failures, 1);
        assert_eq!(db.get_task("t-good").unwrap().unwrap().status, "COMPLETED");
        assert_eq!(db.get_task("t-bad").unwrap().unwrap().status, "NOT_STARTED");

        // The failed attempt still landed in the ledger.
        let runs = db.recent_runs(10).unwrap();
        let failed = runs
            .iter()
            .find(|r| r.external_task_id == "t-bad" && r.run_type == RUN_COMPLETE_ON_EXIT)
            .unwrap();
        assert!(!failed.success);
        assert!(!failed.failure_note.is_empty());
    }

    #[tokio::test]
    async fn test_engagement_completes_due_and_future_tasks() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        insert_automation(
            &db,
            "auto-1",
            serde_json::json!({
                "initial_task": {"name": "Call back"},
                "auto_complete_on_engagement": true
            }),
        );
        open_task(&db, "t-due", "auto-1", "c-1", now - Duration::hours(2));
        open_task(&db, "t-future", "auto-1", "c-1", now + Duration::days(2));
        crm.calls.lock().unwrap().insert(
            "call-1".into(),
            CrmCall {
                id: "call-1".into(),
                direction: "OUTBOUND".into(),
                contact_id: Some("c-1".into()),
            },
        );

        let report = on_call_engagement(&db, &crm, "call-1").await.unwrap();
        assert_eq!(report.automations, 1);
        assert_eq!(report.tasks_completed, 2);
        assert_eq!(report.tasks_skipped_early, 1);

        assert_eq!(db.get_task("t-due").unwrap().unwrap().status, "COMPLETED");
        assert_eq!(db.get_task("t-future").unwrap().unwrap().status, "COMPLETED");

        // Only the future-dated task carries the skipped marker.
        let runs = db.recent_runs(10).unwrap();
        let due_run = runs.iter().find(|r| r.external_task_id == "t-due").unwrap();
        let future_run = runs.iter().find(|r| r.external_task_id == "t-future").unwrap();
        assert_eq!(due_run.run_type, RUN_COMPLETE_ON_ENGAGEMENT);
        assert!(!due_run.skipped);
        assert!(future_run.skipped);
        assert_eq!(future_run.trigger_object_id, "call-1");
    }

    #[tokio::test]
    async fn test_inbound_and_contactless_calls_are_ignored() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        insert_automation(
            &db,
            "auto-1",
            serde_json::json!({
                "initial_task": {"name": "Call back"},
                "auto_complete_on_engagement": true
            }),
        );
        open_task(&db, "t-1", "auto-1", "c-1", now - Duration::hours(2));
        crm.calls.lock().unwrap().insert(
            "call-in".into(),
            CrmCall {
                id: "call-in".into(),
                direction: "INBOUND".into(),
                contact_id: Some("c-1".into()),
            },
        );
        crm.calls.lock().unwrap().insert(
            "call-orphan".into(),
            CrmCall {
                id: "call-orphan".into(),
                direction: "OUTBOUND".into(),
                contact_id: None,
            },
        );

        let inbound = on_call_engagement(&db, &crm, "call-in").await.unwrap();
        assert_eq!(inbound.tasks_completed, 0);
        let orphan = on_call_engagement(&db, &crm, "call-orphan").await.unwrap();
        assert_eq!(orphan.tasks_completed, 0);
        let unknown = on_call_engagement(&db, &crm, "call-unknown").await.unwrap();
        assert_eq!(unknown.tasks_completed, 0);
        assert_eq!(db.get_task("t-1").unwrap().unwrap().status, "NOT_STARTED");
    }

    #[tokio::test]
    async fn test_engagement_only_touches_opted_in_automations() {
        let db = CacheDb::open_in_memory().unwrap();
        let crm = MockCrm::default();
        let now = utc("2024-01-10T12:00:00Z");
        insert_automation(
            &db,
            "auto-opted",
            serde_json::json!({
                "initial_task": {"name": "X"},
                "auto_complete_on_engagement": true
            }),
        );
        insert_automation(
            &db,
            "auto-plain",
            serde_json::json!({"initial_task": {"name": "Y"}}),
        );
        open_task(&db, "t-opted", "auto-opted", "c-1", now - Duration::hours(1));
        open_task(&db, "t-plain", "auto-plain", "c-1", now - Duration::hours(1));

        let report = on_contact_engagement_at(&db, &crm, "c-1", "call-1", now)
            .await
            .unwrap();
        assert_eq!(report.tasks_completed, 1);
        assert_eq!(db.get_task("t-opted").unwrap().unwrap().status, "COMPLETED");
        assert_eq!(db.get_task("t-plain").unwrap().unwrap().status, "NOT_STARTED");
    }
}
