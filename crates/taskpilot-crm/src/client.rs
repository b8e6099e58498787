//! HubSpot v3 REST client.

use async_trait::async_trait;
use chrono::SecondsFormat;
use std::collections::HashMap;
use taskpilot_core::{Result, TaskPilotError};

use crate::CrmApi;
use crate::types::*;

const PAGE_LIMIT: usize = 100;
const TASK_PROPS: &str =
    "hs_task_subject,hs_task_status,hs_timestamp,hubspot_owner_id,hs_queue_membership_ids,hs_task_completion_date";
const CONTACT_PROPS: &str = "email,firstname,lastname,hubspot_owner_id";

/// Task ↔ contact association type id (HubSpot-defined).
const TASK_TO_CONTACT: u32 = 204;

/// Concrete HubSpot client.
pub struct CrmClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl CrmClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await
            .map_err(|e| TaskPilotError::Crm(format!("GET {path} failed: {e}")))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(TaskPilotError::Crm(format!(
                "GET {path} returned {}",
                resp.status()
            )));
        }
        let body = resp
            .json::<T>()
            .await
            .map_err(|e| TaskPilotError::Crm(format!("GET {path}: invalid response: {e}")))?;
        Ok(Some(body))
    }

    async fn post_batch<T: serde::Serialize>(
        &self,
        path: &str,
        inputs: Vec<T>,
    ) -> Result<Vec<BatchOutcome>> {
        let count = inputs.len();
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(&BatchRequest { inputs })
            .send()
            .await
            .map_err(|e| TaskPilotError::Crm(format!("POST {path} failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(TaskPilotError::Crm(format!(
                "POST {path} returned {}",
                resp.status()
            )));
        }
        let body: BatchResponse = resp
            .json()
            .await
            .map_err(|e| TaskPilotError::Crm(format!("POST {path}: invalid response: {e}")))?;

        let mut outcomes: Vec<BatchOutcome> = body
            .results
            .into_iter()
            .map(BatchResultItem::into_outcome)
            .collect();
        // A short results array means the API dropped items; the tail is
        // failed so callers never treat an unreported item as created.
        while outcomes.len() < count {
            outcomes.push(BatchOutcome {
                success: false,
                external_id: String::new(),
                error: "no result returned for batch item".into(),
            });
        }
        outcomes.truncate(count);
        Ok(outcomes)
    }

    fn envelope_to_task(env: &ObjectEnvelope) -> CrmTask {
        let contact_id = env
            .associations
            .as_ref()
            .and_then(|a| a.contacts.as_ref())
            .and_then(|c| c.results.first())
            .map(|r| r.id.clone())
            .unwrap_or_default();
        CrmTask {
            id: env.id.clone(),
            subject: env.prop("hs_task_subject"),
            status: env.prop("hs_task_status"),
            due_at: env.prop("hs_timestamp"),
            owner_id: env.prop("hubspot_owner_id"),
            queue_id: env.prop("hs_queue_membership_ids"),
            contact_id,
            completed_at: env.prop("hs_task_completion_date"),
        }
    }

    fn envelope_to_contact(env: &ObjectEnvelope) -> CrmContact {
        CrmContact {
            id: env.id.clone(),
            email: env.prop("email"),
            first_name: env.prop("firstname"),
            last_name: env.prop("lastname"),
            owner_id: env.prop("hubspot_owner_id"),
        }
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn fetch_contact(&self, id: &str) -> Result<Option<CrmContact>> {
        let env: Option<ObjectEnvelope> = self
            .get_json(
                &format!("/crm/v3/objects/contacts/{id}"),
                &[("properties", CONTACT_PROPS.to_string())],
            )
            .await?;
        Ok(env.as_ref().map(Self::envelope_to_contact))
    }

    async fn fetch_call(&self, id: &str) -> Result<Option<CrmCall>> {
        let env: Option<ObjectEnvelope> = self
            .get_json(
                &format!("/crm/v3/objects/calls/{id}"),
                &[
                    ("properties", "hs_call_direction".to_string()),
                    ("associations", "contacts".to_string()),
                ],
            )
            .await?;
        Ok(env.map(|env| {
            let contact_id = env
                .associations
                .as_ref()
                .and_then(|a| a.contacts.as_ref())
                .and_then(|c| c.results.first())
                .map(|r| r.id.clone());
            CrmCall {
                id: env.id.clone(),
                direction: env.prop("hs_call_direction"),
                contact_id,
            }
        }))
    }

    async fn batch_create_tasks(&self, items: &[NewTask]) -> Result<Vec<BatchOutcome>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<BatchCreateInput> = items
            .iter()
            .map(|t| {
                let mut properties = HashMap::new();
                properties.insert("hs_task_subject".into(), t.subject.clone());
                properties.insert("hs_task_status".into(), "NOT_STARTED".into());
                properties.insert("hs_task_type".into(), "TODO".into());
                properties.insert(
                    "hs_timestamp".into(),
                    t.due_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
                if !t.queue_id.is_empty() {
                    properties.insert("hs_queue_membership_ids".into(), t.queue_id.clone());
                }
                if let Some(owner) = &t.owner_id {
                    properties.insert("hubspot_owner_id".into(), owner.clone());
                }
                let associations = if t.contact_id.is_empty() {
                    Vec::new()
                } else {
                    vec![BatchAssociation {
                        to: AssociationTarget {
                            id: t.contact_id.clone(),
                        },
                        types: vec![AssociationType {
                            association_category: "HUBSPOT_DEFINED".into(),
                            association_type_id: TASK_TO_CONTACT,
                        }],
                    }]
                };
                BatchCreateInput {
                    properties,
                    associations,
                }
            })
            .collect();

        tracing::debug!("📤 Batch-creating {} task(s)", items.len());
        self.post_batch("/crm/v3/objects/tasks/batch/create", inputs)
            .await
    }

    async fn batch_complete_tasks(&self, ids: &[String]) -> Result<Vec<BatchOutcome>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let inputs: Vec<BatchUpdateInput> = ids
            .iter()
            .map(|id| {
                let mut properties = HashMap::new();
                properties.insert("hs_task_status".into(), "COMPLETED".into());
                BatchUpdateInput {
                    id: id.clone(),
                    properties,
                }
            })
            .collect();

        tracing::debug!("📤 Batch-completing {} task(s)", ids.len());
        self.post_batch("/crm/v3/objects/tasks/batch/update", inputs)
            .await
    }

    async fn list_tasks_page(&self, after: Option<&str>) -> Result<CrmPage<CrmTask>> {
        let mut query = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("properties", TASK_PROPS.to_string()),
            ("associations", "contacts".to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let resp: Option<CollectionResponse<ObjectEnvelope>> =
            self.get_json("/crm/v3/objects/tasks", &query).await?;
        let resp = resp
            .ok_or_else(|| TaskPilotError::Crm("task listing endpoint not found".into()))?;
        Ok(CrmPage {
            results: resp.results.iter().map(Self::envelope_to_task).collect(),
            after: resp.paging.and_then(|p| p.next).map(|n| n.after),
        })
    }

    async fn list_contacts_page(&self, after: Option<&str>) -> Result<CrmPage<CrmContact>> {
        let mut query = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("properties", CONTACT_PROPS.to_string()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let resp: Option<CollectionResponse<ObjectEnvelope>> =
            self.get_json("/crm/v3/objects/contacts", &query).await?;
        let resp = resp
            .ok_or_else(|| TaskPilotError::Crm("contact listing endpoint not found".into()))?;
        Ok(CrmPage {
            results: resp.results.iter().map(Self::envelope_to_contact).collect(),
            after: resp.paging.and_then(|p| p.next).map(|n| n.after),
        })
    }

    async fn list_memberships_page(
        &self,
        list_id: &str,
        after: Option<&str>,
    ) -> Result<CrmPage<CrmMembership>> {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct MembershipRow {
            record_id: String,
            #[serde(default)]
            membership_timestamp: Option<String>,
        }

        let mut query = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let resp: Option<CollectionResponse<MembershipRow>> = self
            .get_json(&format!("/crm/v3/lists/{list_id}/memberships"), &query)
            .await?;
        let resp = resp
            .ok_or_else(|| TaskPilotError::Crm(format!("list {list_id} not found")))?;
        Ok(CrmPage {
            results: resp
                .results
                .into_iter()
                .map(|m| CrmMembership {
                    id: format!("{list_id}:{}", m.record_id),
                    contact_id: m.record_id,
                    entered_at: m.membership_timestamp.unwrap_or_default(),
                })
                .collect(),
            after: resp.paging.and_then(|p| p.next).map(|n| n.after),
        })
    }
}
