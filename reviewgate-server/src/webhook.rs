use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::ingress::{self, Ingress};
use crate::state_machine::repository::DeliveryClaimResult;
use crate::AppState;
use crate::{CorrelationId, Direction, EventType, RecordedEvent, Sanitizer};

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

fn respond(message: impl Into<String>) -> Json<WebhookResponse> {
    Json(WebhookResponse {
        message: message.into(),
    })
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison.
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    if let Some(ref logger) = state.recording_logger {
        let headers_map = headers_to_hashmap(&parts.headers);
        logger.record(RecordedEvent::new(
            correlation_id.0.clone(),
            EventType::WebhookReceived,
            Direction::Request,
            "webhook",
            serde_json::json!({
                "headers": Sanitizer::sanitize_headers(&headers_map),
                "body": serde_json::from_slice::<serde_json::Value>(&bytes)
                    .map(|body| Sanitizer::sanitize_json(&body))
                    .unwrap_or(serde_json::Value::Null)
            }),
        ));
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

fn headers_to_hashmap(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in headers {
        if let Ok(value_str) = value.to_str() {
            map.insert(name.to_string(), value_str.to_string());
        }
    }
    map
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Handler: POST /webhook
///
/// Responds 2xx once the delivery has been applied (or deliberately
/// discarded) and 5xx when redelivery might succeed.
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let Some(event_type) = header_value(&parts.headers, EVENT_HEADER) else {
        warn!("Webhook without {} header", EVENT_HEADER);
        return Err(StatusCode::BAD_REQUEST);
    };
    let delivery_id = header_value(&parts.headers, DELIVERY_HEADER);

    let events = match ingress::normalize(&event_type, &bytes) {
        Ok(Ingress::Events(events)) => events,
        Ok(Ingress::Ignored(reason)) => {
            debug!("Ignoring {} webhook: {}", event_type, reason);
            return Ok(respond(format!("ignored: {}", reason)));
        }
        Err(e) => {
            warn!("Discarding webhook {:?}: {}", delivery_id, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let repository = state.service.store().repository().clone();

    if let Some(delivery_id) = &delivery_id {
        match repository.try_claim_delivery(delivery_id).await {
            Ok(DeliveryClaimResult::Claimed) => {}
            Ok(DeliveryClaimResult::Completed) => {
                info!("Delivery {} already processed", delivery_id);
                return Ok(respond("duplicate delivery"));
            }
            Ok(DeliveryClaimResult::InProgress) => {
                info!("Delivery {} is being processed elsewhere", delivery_id);
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            }
            Err(e) => {
                error!("Failed to claim delivery {}: {}", delivery_id, e);
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    } else {
        warn!("{} webhook without {}; duplicates cannot be detected", event_type, DELIVERY_HEADER);
    }

    info!(
        "Processing {} webhook {:?} ({} event(s))",
        event_type,
        delivery_id,
        events.len()
    );

    for event in events {
        if let Err(e) = state.service.handle(event, correlation_id.clone()).await {
            if e.is_retryable() {
                error!("Failed to handle {} webhook: {}", event_type, e);
                if let Some(delivery_id) = &delivery_id {
                    if let Err(release_err) = repository.release_delivery(delivery_id).await {
                        error!("Failed to release delivery {}: {}", delivery_id, release_err);
                    }
                }
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
            warn!("Discarding {} event: {}", event_type, e);
        }
    }

    if let Some(delivery_id) = &delivery_id {
        if let Err(e) = repository.complete_delivery(delivery_id).await {
            // The events were applied; a redelivery would be absorbed by
            // the idempotent transitions.
            error!("Failed to mark delivery {} completed: {}", delivery_id, e);
        }
    }

    Ok(respond("processed"))
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}
