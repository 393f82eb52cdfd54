//! # Messenger Webhook
//!
//! Facebook Messenger subscription handshake and event intake. Event delivery is always
//! acknowledged with `200 EVENT_RECEIVED`; bad signatures and malformed payloads are logged
//! and counted, never rejected.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use utoipa::IntoParams;

use crate::server::AppState;
use crate::webhook_verification::{SIGNATURE_HEADER, verify_hub_signature, verify_token_matches};

pub const EVENT_RECEIVED: &str = "EVENT_RECEIVED";

/// Subscription handshake parameters
#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    #[param(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    #[param(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    #[param(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// A messaging event reduced to what is logged
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessengerEvent {
    pub page_id: Option<String>,
    pub sender_id: Option<String>,
    pub message_id: Option<String>,
    pub postback: Option<String>,
}

/// Extracts messaging events from a webhook payload.
///
/// Returns `None` for payloads that are not `object: page`.
pub fn parse_events(payload: &JsonValue) -> Option<Vec<MessengerEvent>> {
    if payload.get("object").and_then(JsonValue::as_str) != Some("page") {
        return None;
    }

    let entries = payload
        .get("entry")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let text = |value: Option<&JsonValue>| -> Option<String> {
        value.and_then(|v| match v {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };

    let events = entries
        .iter()
        .flat_map(|entry| {
            let page_id = text(entry.get("id"));
            entry
                .get("messaging")
                .and_then(JsonValue::as_array)
                .into_iter()
                .flatten()
                .map(move |event| MessengerEvent {
                    page_id: page_id.clone(),
                    sender_id: text(event.pointer("/sender/id")),
                    message_id: text(event.pointer("/message/mid")),
                    postback: text(event.pointer("/postback/payload")),
                })
        })
        .collect();

    Some(events)
}

/// Messenger subscription handshake
#[utoipa::path(
    get,
    path = "/api/webhooks/messenger",
    params(VerifyQuery),
    responses(
        (status = 200, description = "Challenge echoed", body = String, content_type = "text/plain"),
        (status = 403, description = "Mode or verify token mismatch")
    ),
    tag = "webhooks"
)]
pub async fn verify_subscription(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let expected = state.config.messenger_verify_token.as_deref().unwrap_or_default();
    let provided = query.verify_token.as_deref().unwrap_or_default();

    if query.mode.as_deref() == Some("subscribe") && verify_token_matches(provided, expected) {
        info!("Messenger webhook subscription verified");
        let challenge = query.challenge.unwrap_or_default();
        return (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], challenge).into_response();
    }

    warn!(mode = ?query.mode, "Messenger webhook verification rejected");
    StatusCode::FORBIDDEN.into_response()
}

/// Messenger event delivery
#[utoipa::path(
    post,
    path = "/api/webhooks/messenger",
    request_body(content = String, description = "Messenger webhook payload", content_type = "application/json"),
    responses(
        (status = 200, description = "Always acknowledged", body = String, content_type = "text/plain")
    ),
    tag = "webhooks"
)]
pub async fn receive_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    if let Some(secret) = state.config.messenger_app_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        if let Err(e) = verify_hub_signature(&body, signature, secret) {
            warn!(error = %e, "Messenger webhook signature verification failed");
            counter!("messenger_events_total", "outcome" => "bad_signature").increment(1);
            return (StatusCode::OK, EVENT_RECEIVED);
        }
    }

    let payload: JsonValue = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, body_size = body.len(), "Malformed Messenger webhook payload");
            counter!("messenger_events_total", "outcome" => "malformed").increment(1);
            return (StatusCode::OK, EVENT_RECEIVED);
        }
    };

    match parse_events(&payload) {
        Some(events) => {
            for event in &events {
                info!(
                    page_id = event.page_id.as_deref().unwrap_or("-"),
                    sender_id = event.sender_id.as_deref().unwrap_or("-"),
                    message_id = event.message_id.as_deref().unwrap_or("-"),
                    postback = event.postback.is_some(),
                    "Messenger event received"
                );
            }
            counter!("messenger_events_total", "outcome" => "received")
                .increment(events.len() as u64);
        }
        None => {
            debug!(object = ?payload.get("object"), "Ignoring non-page Messenger payload");
            counter!("messenger_events_total", "outcome" => "ignored").increment(1);
        }
    }

    (StatusCode::OK, EVENT_RECEIVED)
}
