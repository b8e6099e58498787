//! TaskPilot HTTP gateway.
//!
//! The dashboard and HubSpot talk to TaskPilot through this crate: automation
//! CRUD, trigger/sweep endpoints, the monitor views, and the webhook ingress
//! with optional HMAC validation.

pub mod routes;
pub mod server;
pub mod webhook;

pub use server::{AppState, build_router, start};
