//! TaskPilot CRM client.
//!
//! Thin typed wrapper over the HubSpot v3 REST API: batch create/complete
//! for tasks, reads for contacts, calls, and list memberships, and paged
//! listing for the full resync. The automation crates depend on the
//! [`CrmApi`] trait, not the concrete client, so sweeps are testable with an
//! in-memory fake.

pub mod client;
pub mod types;

pub use client::CrmClient;
pub use types::{
    BatchOutcome, CrmCall, CrmContact, CrmMembership, CrmPage, CrmTask, NewTask,
};

use async_trait::async_trait;
use taskpilot_core::Result;

/// The external CRM surface the automation core consumes.
///
/// Batch operations accept up to ~100 items per call and return per-item
/// success/failure in input order. A transport-level failure is an `Err`;
/// callers treat that as "every item in this batch failed" and isolate it
/// from other groups.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Fetch one contact, `None` if it does not exist.
    async fn fetch_contact(&self, id: &str) -> Result<Option<CrmContact>>;

    /// Fetch one call engagement with its associated contact, if any.
    async fn fetch_call(&self, id: &str) -> Result<Option<CrmCall>>;

    /// Batch-create tasks. Result vector is index-aligned with `items`.
    async fn batch_create_tasks(&self, items: &[NewTask]) -> Result<Vec<BatchOutcome>>;

    /// Batch-complete tasks by external id. Index-aligned with `ids`.
    async fn batch_complete_tasks(&self, ids: &[String]) -> Result<Vec<BatchOutcome>>;

    /// One page of tasks (full resync).
    async fn list_tasks_page(&self, after: Option<&str>) -> Result<CrmPage<CrmTask>>;

    /// One page of contacts (full resync).
    async fn list_contacts_page(&self, after: Option<&str>) -> Result<CrmPage<CrmContact>>;

    /// One page of a list's current memberships (full resync).
    async fn list_memberships_page(
        &self,
        list_id: &str,
        after: Option<&str>,
    ) -> Result<CrmPage<CrmMembership>>;
}
