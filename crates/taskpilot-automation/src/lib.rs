//! # TaskPilot Automation
//!
//! The task-automation rules engine: create follow-up tasks when contacts
//! enter lists, chain sequence tasks after completions, and curtail in-flight
//! work when contacts exit or engage. A modest rules engine, not a scheduler:
//! no durable queue, no leader election — re-entrancy is made safe by the run
//! ledger's success flag, and full resyncs by a coarse advisory lock.
//!
//! ## Architecture
//! ```text
//! External event (webhook / direct call)
//!   ├── list entry ──────→ trigger::process_event ─┐
//!   ├── task completion ─→ trigger::process_event ─┤→ schedule::next_execution
//!   │                                              └→ run ledger (planned)
//!   ├── cron/manual ─────→ reconcile::sweep ───────→ batch create via CrmApi
//!   │                                              └→ run ledger (success)
//!   ├── list exit ───────→ exits::sweep_exited ────→ batch complete + block runs
//!   └── outbound call ───→ exits::on_call_engagement → complete due + future
//! ```

pub mod definitions;
pub mod exits;
pub mod reconcile;
pub mod schedule;
pub mod sync;
pub mod trigger;

#[cfg(test)]
pub mod testutil;

pub use definitions::{
    AutomationDefinition, DayWindow, Delay, DelayUnit, OwnerMode, ScheduleConfig, TaskTemplate,
    WeekSchedule,
};
pub use exits::{EngagementReport, ExitReport};
pub use reconcile::RetryReport;
pub use schedule::next_execution;
pub use sync::{SyncOutcome, SyncReport};
pub use trigger::{PlannedRun, TriggerEvent};
