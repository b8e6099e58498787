//! Shared test fixtures: an in-memory scriptable CRM and record builders.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use taskpilot_core::{Result, TaskPilotError};
use taskpilot_crm::{
    BatchOutcome, CrmApi, CrmCall, CrmContact, CrmMembership, CrmPage, CrmTask, NewTask,
};
use taskpilot_db::{AutomationRecord, ts};

pub fn utc(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn automation_record(id: &str, definition: serde_json::Value) -> AutomationRecord {
    AutomationRecord {
        id: id.to_string(),
        name: format!("Automation {id}"),
        enabled: true,
        list_id: "list-1".into(),
        queue_id: "q-1".into(),
        definition,
        created_at: ts(Utc::now()),
        updated_at: ts(Utc::now()),
    }
}

/// A pending creation run for a contact, planned at `planned`.
pub fn pending_run(id: &str, contact_id: &str, planned: DateTime<Utc>) -> taskpilot_db::RunRecord {
    taskpilot_db::RunRecord {
        id: id.to_string(),
        automation_id: "auto-1".into(),
        run_type: taskpilot_db::RUN_CREATE_ON_ENTRY.into(),
        trigger_object_id: "list-1".into(),
        membership_id: String::new(),
        contact_id: contact_id.to_string(),
        queue_id: "q-1".into(),
        planned_at: ts(planned),
        planned_local: String::new(),
        task_name: "Call back".into(),
        owner_mode: "no_owner".into(),
        previous_owner_id: String::new(),
        position: 1,
        success: false,
        blocked: false,
        skipped: false,
        external_task_id: String::new(),
        failure_note: String::new(),
        created_at: ts(planned),
        executed_at: None,
    }
}

/// Scriptable CRM fake. Batch creates hand out sequential ids; individual
/// items can be scripted to fail by subject or by task id.
#[derive(Default)]
pub struct MockCrm {
    pub contacts: Mutex<HashMap<String, CrmContact>>,
    pub calls: Mutex<HashMap<String, CrmCall>>,
    /// Subjects whose batch-create items fail.
    pub fail_create_subjects: Mutex<HashSet<String>>,
    /// Task ids whose batch-complete items fail.
    pub fail_complete_ids: Mutex<HashSet<String>>,
    /// Task ids that make the whole batch-complete call error out.
    pub poison_complete_ids: Mutex<HashSet<String>>,
    pub created: Mutex<Vec<NewTask>>,
    pub completed: Mutex<Vec<String>>,
    pub task_pages: Mutex<Vec<Vec<CrmTask>>>,
    pub contact_pages: Mutex<Vec<Vec<CrmContact>>>,
    pub membership_pages: Mutex<Vec<Vec<CrmMembership>>>,
    next_id: Mutex<u64>,
}

impl MockCrm {
    pub fn with_contact(self, contact: CrmContact) -> Self {
        self.contacts
            .lock()
            .unwrap()
            .insert(contact.id.clone(), contact);
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// The cursor is simply an index into the scripted pages.
    fn pop_page<T: Clone>(pages: &Mutex<Vec<Vec<T>>>, after: Option<&str>) -> CrmPage<T> {
        let pages = pages.lock().unwrap();
        let index: usize = after.map(|a| a.parse().unwrap_or(0)).unwrap_or(0);
        let results = pages.get(index).cloned().unwrap_or_default();
        let has_next = index + 1 < pages.len();
        CrmPage {
            results,
            after: has_next.then(|| (index + 1).to_string()),
        }
    }
}

pub fn contact(id: &str, owner_id: &str) -> CrmContact {
    CrmContact {
        id: id.to_string(),
        email: format!("{id}@example.com"),
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        owner_id: owner_id.to_string(),
    }
}

#[async_trait]
impl CrmApi for MockCrm {
    async fn fetch_contact(&self, id: &str) -> Result<Option<CrmContact>> {
        Ok(self.contacts.lock().unwrap().get(id).cloned())
    }

    async fn fetch_call(&self, id: &str) -> Result<Option<CrmCall>> {
        Ok(self.calls.lock().unwrap().get(id).cloned())
    }

    async fn batch_create_tasks(&self, items: &[NewTask]) -> Result<Vec<BatchOutcome>> {
        let fail = self.fail_create_subjects.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items {
            if fail.contains(&item.subject) {
                outcomes.push(BatchOutcome {
                    success: false,
                    external_id: String::new(),
                    error: format!("creation of '{}' rejected", item.subject),
                });
            } else {
                *next_id += 1;
                let id = format!("task-{}", *next_id);
                self.created.lock().unwrap().push(item.clone());
                outcomes.push(BatchOutcome {
                    success: true,
                    external_id: id,
                    error: String::new(),
                });
            }
        }
        Ok(outcomes)
    }

    async fn batch_complete_tasks(&self, ids: &[String]) -> Result<Vec<BatchOutcome>> {
        let poison = self.poison_complete_ids.lock().unwrap();
        if ids.iter().any(|id| poison.contains(id)) {
            return Err(TaskPilotError::Crm("batch update returned 500".into()));
        }
        let fail = self.fail_complete_ids.lock().unwrap();
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            if fail.contains(id) {
                outcomes.push(BatchOutcome {
                    success: false,
                    external_id: String::new(),
                    error: format!("completion of '{id}' rejected"),
                });
            } else {
                self.completed.lock().unwrap().push(id.clone());
                outcomes.push(BatchOutcome {
                    success: true,
                    external_id: id.clone(),
                    error: String::new(),
                });
            }
        }
        Ok(outcomes)
    }

    async fn list_tasks_page(&self, after: Option<&str>) -> Result<CrmPage<CrmTask>> {
        Ok(Self::pop_page(&self.task_pages, after))
    }

    async fn list_contacts_page(&self, after: Option<&str>) -> Result<CrmPage<CrmContact>> {
        Ok(Self::pop_page(&self.contact_pages, after))
    }

    async fn list_memberships_page(
        &self,
        _list_id: &str,
        after: Option<&str>,
    ) -> Result<CrmPage<CrmMembership>> {
        Ok(Self::pop_page(&self.membership_pages, after))
    }
}
