//! HubSpot webhook ingress: signature validation and event extraction.
//!
//! HubSpot posts a JSON array of event objects. Shapes vary by subscription
//! version, so extraction is deliberately lenient: events we cannot read are
//! logged and dropped, never an error, because the webhook endpoint must keep
//! returning 2xx or HubSpot disables the subscription.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Object type id HubSpot uses for call engagements.
const OBJECT_TYPE_CALL: &str = "0-48";

/// Verify the v3-style signature header: base64(HMAC-SHA256(secret, body)).
/// An empty secret disables validation.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        return true;
    }
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
    // Signatures are not secret-length; plain comparison is fine here.
    expected == signature
}

/// Something a webhook event asks TaskPilot to do.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookAction {
    /// A call engagement was created; react to the engagement.
    CallCreated { call_id: String },
}

/// Extract the actionable events from a webhook payload. Unknown events are
/// counted but otherwise ignored.
pub fn extract_actions(payload: &serde_json::Value) -> (Vec<WebhookAction>, usize) {
    let Some(events) = payload.as_array() else {
        tracing::debug!("📨 Webhook payload is not an event array; ignoring");
        return (Vec::new(), 0);
    };

    let mut actions = Vec::new();
    let mut ignored = 0;
    for event in events {
        let subscription = event["subscriptionType"].as_str().unwrap_or("");
        let object_type = event["objectTypeId"].as_str().unwrap_or("");
        let object_id = match &event["objectId"] {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => String::new(),
        };

        let is_call_creation = (object_type == OBJECT_TYPE_CALL
            && subscription.ends_with(".creation"))
            || subscription == "call.creation";
        if is_call_creation && !object_id.is_empty() {
            actions.push(WebhookAction::CallCreated { call_id: object_id });
        } else {
            tracing::debug!(
                "📨 Ignoring webhook event (subscription='{subscription}', type='{object_type}')"
            );
            ignored += 1;
        }
    }
    (actions, ignored)
}
