//! Trigger processing: turn an external event into a planned run.
//!
//! A trigger never talks to the CRM. It resolves the task template, applies
//! the delay and the working-hours schedule, and records a planned row in
//! the run ledger. Actual task creation happens in the reconciler sweep.

use chrono::{DateTime, Utc};
use taskpilot_core::{Result, TaskPilotError};
use taskpilot_db::{
    CacheDb, MembershipRecord, RUN_CREATE_FROM_SEQUENCE, RUN_CREATE_ON_ENTRY, RunRecord, ts,
};
use uuid::Uuid;

use crate::definitions::{AutomationDefinition, TaskTemplate};
use crate::schedule::{next_execution, zoned_display};

/// An external event an automation reacts to by planning a task.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    /// A contact entered the automation's list.
    ListEntry {
        membership_id: String,
        contact_id: String,
    },
    /// A sequence task was completed; plan the next one in the chain.
    TaskCompleted {
        task_id: String,
        /// 1-indexed position of the task that was just completed.
        position: usize,
        completed_at: DateTime<Utc>,
        /// Owner of the completed task, for previous_task_owner mode.
        owner_id: String,
        contact_id: String,
    },
}

/// What a successful trigger planned.
#[derive(Debug, Clone)]
pub struct PlannedRun {
    pub run_id: String,
    pub planned_at: DateTime<Utc>,
    pub planned_local: String,
    pub task_name: String,
    pub position: i64,
}

/// Process a trigger event against an automation, planning a run.
pub fn process_event(
    db: &CacheDb,
    automation: &taskpilot_db::AutomationRecord,
    event: TriggerEvent,
) -> Result<PlannedRun> {
    process_event_at(db, automation, event, Utc::now())
}

pub fn process_event_at(
    db: &CacheDb,
    automation: &taskpilot_db::AutomationRecord,
    event: TriggerEvent,
    now: DateTime<Utc>,
) -> Result<PlannedRun> {
    if !automation.enabled {
        return Err(TaskPilotError::Config(format!(
            "Automation '{}' is disabled",
            automation.id
        )));
    }
    let def = AutomationDefinition::from_value(&automation.definition)?;

    match event {
        TriggerEvent::ListEntry {
            membership_id,
            contact_id,
        } => {
            // Keep the membership cached so exit sweeps can see the entry
            // even before the next full resync.
            if !membership_id.is_empty() {
                db.upsert_membership(&MembershipRecord {
                    id: membership_id.clone(),
                    list_id: automation.list_id.clone(),
                    contact_id: contact_id.clone(),
                    entered_at: ts(now),
                    exited_at: None,
                })
                .map_err(TaskPilotError::Db)?;
            }
            let planned_at = next_execution(now, def.schedule.as_ref())?;
            plan(
                db,
                automation,
                &def,
                PlanInput {
                    run_type: RUN_CREATE_ON_ENTRY,
                    template: &def.initial_task,
                    position: 1,
                    trigger_object_id: &automation.list_id,
                    membership_id: &membership_id,
                    contact_id: &contact_id,
                    previous_owner_id: "",
                    planned_at,
                    now,
                },
            )
        }
        TriggerEvent::TaskCompleted {
            task_id,
            position,
            completed_at,
            owner_id,
            contact_id,
        } => {
            let next_position = position + 1;
            let template = def.template_at(next_position).ok_or_else(|| {
                TaskPilotError::Config(format!(
                    "No sequence task after position {position} in automation '{}'",
                    automation.id
                ))
            })?;
            let delay = template.delay.map(|d| d.as_duration()).unwrap_or_default();
            let planned_at = next_execution(completed_at + delay, def.schedule.as_ref())?;
            if planned_at < now {
                return Err(TaskPilotError::PastDue { planned: planned_at });
            }
            plan(
                db,
                automation,
                &def,
                PlanInput {
                    run_type: RUN_CREATE_FROM_SEQUENCE,
                    template,
                    position: next_position as i64,
                    trigger_object_id: &task_id,
                    membership_id: "",
                    contact_id: &contact_id,
                    previous_owner_id: &owner_id,
                    planned_at,
                    now,
                },
            )
        }
    }
}

struct PlanInput<'a> {
    run_type: &'static str,
    template: &'a TaskTemplate,
    position: i64,
    trigger_object_id: &'a str,
    membership_id: &'a str,
    contact_id: &'a str,
    previous_owner_id: &'a str,
    planned_at: DateTime<Utc>,
    now: DateTime<Utc>,
}

fn plan(
    db: &CacheDb,
    automation: &taskpilot_db::AutomationRecord,
    def: &AutomationDefinition,
    input: PlanInput<'_>,
) -> Result<PlannedRun> {
    let planned_local = zoned_display(input.planned_at, def.schedule.as_ref());
    let run = RunRecord {
        id: Uuid::new_v4().to_string(),
        automation_id: automation.id.clone(),
        run_type: input.run_type.to_string(),
        trigger_object_id: input.trigger_object_id.to_string(),
        membership_id: input.membership_id.to_string(),
        contact_id: input.contact_id.to_string(),
        queue_id: automation.queue_id.clone(),
        planned_at: ts(input.planned_at),
        planned_local: planned_local.clone(),
        task_name: input.template.name.clone(),
        owner_mode: input.template.owner.as_str().to_string(),
        previous_owner_id: input.previous_owner_id.to_string(),
        position: input.position,
        success: false,
        blocked: false,
        skipped: false,
        external_task_id: String::new(),
        failure_note: String::new(),
        created_at: ts(input.now),
        executed_at: None,
    };
    db.insert_run(&run).map_err(TaskPilotError::Db)?;
    tracing::info!(
        "🗓️ Planned {} run {} for automation '{}' at {}",
        input.run_type,
        run.id,
        automation.id,
        run.planned_at
    );
    Ok(PlannedRun {
        run_id: run.id,
        planned_at: input.planned_at,
        planned_local,
        task_name: input.template.name.clone(),
        position: input.position,
    })
}
