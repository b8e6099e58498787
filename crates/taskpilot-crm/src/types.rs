//! Wire types for the HubSpot v3 API and the flattened shapes TaskPilot
//! actually works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Flattened domain shapes ──────────────────────────────

/// A contact as TaskPilot sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub owner_id: String,
}

/// A task as TaskPilot sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmTask {
    pub id: String,
    pub subject: String,
    pub status: String,
    pub due_at: String,
    pub owner_id: String,
    pub queue_id: String,
    pub contact_id: String,
    pub completed_at: String,
}

/// A phone-call engagement with its associated contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmCall {
    pub id: String,
    /// OUTBOUND or INBOUND.
    pub direction: String,
    pub contact_id: Option<String>,
}

/// A current list membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmMembership {
    pub id: String,
    pub contact_id: String,
    pub entered_at: String,
}

/// A task to create via the batch endpoint.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub subject: String,
    pub due_at: DateTime<Utc>,
    pub owner_id: Option<String>,
    pub queue_id: String,
    pub contact_id: String,
}

/// Per-item outcome of a batch call, index-aligned with the request.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub success: bool,
    /// External object id on success.
    pub external_id: String,
    /// API error message on failure.
    pub error: String,
}

/// One page of results plus the cursor for the next page.
#[derive(Debug, Clone)]
pub struct CrmPage<T> {
    pub results: Vec<T>,
    pub after: Option<String>,
}

// ── Raw HubSpot payloads ──────────────────────────────

/// Generic `{id, properties}` object envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectEnvelope {
    pub id: String,
    #[serde(default)]
    pub properties: HashMap<String, Option<String>>,
    #[serde(default)]
    pub associations: Option<Associations>,
}

impl ObjectEnvelope {
    /// Property value or empty string.
    pub fn prop(&self, key: &str) -> String {
        self.properties
            .get(key)
            .and_then(|v| v.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Associations {
    #[serde(default)]
    pub contacts: Option<AssociationList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssociationList {
    #[serde(default)]
    pub results: Vec<AssociationRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssociationRef {
    pub id: String,
}

/// Paged collection response.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectionResponse<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub paging: Option<Paging>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paging {
    pub next: Option<PagingNext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PagingNext {
    pub after: String,
}

/// `{inputs: [...]}` batch request wrapper.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest<T> {
    pub inputs: Vec<T>,
}

/// One input of a batch create call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCreateInput {
    pub properties: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub associations: Vec<BatchAssociation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAssociation {
    pub to: AssociationTarget,
    pub types: Vec<AssociationType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssociationTarget {
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationType {
    pub association_category: String,
    pub association_type_id: u32,
}

/// One input of a batch update call.
#[derive(Debug, Clone, Serialize)]
pub struct BatchUpdateInput {
    pub id: String,
    pub properties: HashMap<String, String>,
}

/// Batch response: per-item results in input order.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    #[serde(default = "Vec::new")]
    pub results: Vec<BatchResultItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchResultItem {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl BatchResultItem {
    pub fn into_outcome(self) -> BatchOutcome {
        let failed = self
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("error"))
            .unwrap_or(self.id.is_none());
        if failed {
            BatchOutcome {
                success: false,
                external_id: String::new(),
                error: self.message.unwrap_or_else(|| "batch item failed".into()),
            }
        } else {
            BatchOutcome {
                success: true,
                external_id: self.id.unwrap_or_default(),
                error: String::new(),
            }
        }
    }
}
