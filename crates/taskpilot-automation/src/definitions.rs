//! Typed shape of an automation rule body.
//!
//! The cache stores the rule as opaque JSON; this module owns the schema.
//! Parsing is lenient where the dashboard may send partial configs (missing
//! flags default to off, missing schedule means "run any time") and strict
//! where a wrong value would silently misfire.

use chrono::{Duration, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use taskpilot_core::{Result, TaskPilotError};

/// How the owner of a created task is resolved at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnerMode {
    #[default]
    NoOwner,
    ContactOwner,
    PreviousTaskOwner,
}

impl OwnerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerMode::NoOwner => "no_owner",
            OwnerMode::ContactOwner => "contact_owner",
            OwnerMode::PreviousTaskOwner => "previous_task_owner",
        }
    }

    /// Parse a stored mode string; unknown values fall back to no owner.
    pub fn parse(s: &str) -> OwnerMode {
        match s {
            "contact_owner" => OwnerMode::ContactOwner,
            "previous_task_owner" => OwnerMode::PreviousTaskOwner,
            _ => OwnerMode::NoOwner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

/// Offset between a sequence trigger and the next task's due time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Delay {
    pub amount: i64,
    pub unit: DelayUnit,
}

impl Delay {
    pub fn as_duration(&self) -> Duration {
        let millis = match self.unit {
            DelayUnit::Minutes => self.amount * 60 * 1000,
            DelayUnit::Hours => self.amount * 60 * 60 * 1000,
            DelayUnit::Days => self.amount * 24 * 60 * 60 * 1000,
        };
        Duration::milliseconds(millis)
    }
}

/// Template for one task the automation creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub owner: OwnerMode,
    /// Offset from the triggering event. `None` means immediately.
    #[serde(default)]
    pub delay: Option<Delay>,
}

/// One weekday's working window. Times are "HH:MM" strings as the dashboard
/// sends them; parsing happens lazily so one bad day does not reject the
/// whole rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayWindow {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

impl DayWindow {
    /// Parsed (start, end) window. `None` when the day is unusable: either
    /// bound missing or unparsable, or the window empty/inverted.
    pub fn window(&self) -> Option<(NaiveTime, NaiveTime)> {
        let start = NaiveTime::parse_from_str(self.start_time.as_deref()?, "%H:%M").ok()?;
        let end = NaiveTime::parse_from_str(self.end_time.as_deref()?, "%H:%M").ok()?;
        if start < end { Some((start, end)) } else { None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeekSchedule {
    #[serde(default)]
    pub monday: DayWindow,
    #[serde(default)]
    pub tuesday: DayWindow,
    #[serde(default)]
    pub wednesday: DayWindow,
    #[serde(default)]
    pub thursday: DayWindow,
    #[serde(default)]
    pub friday: DayWindow,
    #[serde(default)]
    pub saturday: DayWindow,
    #[serde(default)]
    pub sunday: DayWindow,
}

impl WeekSchedule {
    pub fn day(&self, weekday: Weekday) -> &DayWindow {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Working-hours configuration for an automation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// IANA zone name, e.g. "Europe/Berlin".
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub week: WeekSchedule,
    /// Holidays and other whole-day exclusions.
    #[serde(default)]
    pub non_working_dates: Vec<NaiveDate>,
}

/// The full rule body stored in an automation's `definition` column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationDefinition {
    /// Task created when a contact enters the list (position 1).
    pub initial_task: TaskTemplate,
    /// Follow-up chain; `sequence_tasks[0]` is position 2.
    #[serde(default)]
    pub sequence_tasks: Vec<TaskTemplate>,
    /// Block pending future runs when the contact leaves the list.
    #[serde(default)]
    pub sequence_exit_enabled: bool,
    /// Complete this automation's open tasks when the contact leaves the list.
    #[serde(default)]
    pub auto_complete_on_exit_enabled: bool,
    /// Complete this automation's open tasks when the contact is called.
    #[serde(default)]
    pub auto_complete_on_engagement: bool,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

impl AutomationDefinition {
    /// Parse the JSON rule body of an automation record.
    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| TaskPilotError::Config(format!("Invalid automation definition: {e}")))
    }

    /// Template at a 1-indexed position: 1 is the initial task, N is
    /// `sequence_tasks[N-2]`.
    pub fn template_at(&self, position: usize) -> Option<&TaskTemplate> {
        match position {
            0 => None,
            1 => Some(&self.initial_task),
            n => self.sequence_tasks.get(n - 2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_definition_parses() {
        let def = AutomationDefinition::from_value(&serde_json::json!({
            "initial_task": {"name": "Call back"}
        }))
        .unwrap();
        assert_eq!(def.initial_task.name, "Call back");
        assert_eq!(def.initial_task.owner, OwnerMode::NoOwner);
        assert!(def.sequence_tasks.is_empty());
        assert!(!def.sequence_exit_enabled);
        assert!(def.schedule.is_none());
    }

    #[test]
    fn test_full_definition_parses() {
        let def = AutomationDefinition::from_value(&serde_json::json!({
            "initial_task": {"name": "Call back", "owner": "contact_owner"},
            "sequence_tasks": [
                {"name": "Follow up", "owner": "previous_task_owner",
                 "delay": {"amount": 2, "unit": "days"}}
            ],
            "sequence_exit_enabled": true,
            "auto_complete_on_exit_enabled": true,
            "schedule": {
                "enabled": true,
                "timezone": "Europe/Berlin",
                "week": {"monday": {"enabled": true, "start_time": "09:00", "end_time": "17:00"}},
                "non_working_dates": ["2024-12-25"]
            }
        }))
        .unwrap();
        assert_eq!(def.sequence_tasks.len(), 1);
        let delay = def.sequence_tasks[0].delay.unwrap();
        assert_eq!(delay.as_duration(), Duration::days(2));
        let schedule = def.schedule.unwrap();
        assert_eq!(schedule.timezone, "Europe/Berlin");
        assert!(schedule.week.monday.window().is_some());
        assert_eq!(schedule.non_working_dates.len(), 1);
    }

    #[test]
    fn test_template_positions() {
        let def = AutomationDefinition::from_value(&serde_json::json!({
            "initial_task": {"name": "First"},
            "sequence_tasks": [{"name": "Second"}, {"name": "Third"}]
        }))
        .unwrap();
        assert_eq!(def.template_at(1).unwrap().name, "First");
        assert_eq!(def.template_at(2).unwrap().name, "Second");
        assert_eq!(def.template_at(3).unwrap().name, "Third");
        assert!(def.template_at(0).is_none());
        assert!(def.template_at(4).is_none());
    }

    #[test]
    fn test_day_window_rejects_inverted_or_partial() {
        let inverted = DayWindow {
            enabled: true,
            start_time: Some("18:00".into()),
            end_time: Some("09:00".into()),
        };
        assert!(inverted.window().is_none());

        let partial = DayWindow {
            enabled: true,
            start_time: Some("09:00".into()),
            end_time: None,
        };
        assert!(partial.window().is_none());

        let garbage = DayWindow {
            enabled: true,
            start_time: Some("nine".into()),
            end_time: Some("17:00".into()),
        };
        assert!(garbage.window().is_none());
    }

    #[test]
    fn test_unknown_owner_mode_is_rejected_in_json() {
        let res = AutomationDefinition::from_value(&serde_json::json!({
            "initial_task": {"name": "X", "owner": "manager_owner"}
        }));
        assert!(res.is_err());
    }
}
