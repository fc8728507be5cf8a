use super::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Sanitizer,
    CORRELATION_ID_HEADER,
};
use axum::http;
use reqwest::header::HeaderValue;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::collections::HashMap;
use uuid::Uuid;

/// Records every outbound platform call (sanitized) and makes sure it
/// carries a correlation ID.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger) -> Self {
        Self { logger }
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| extensions.get::<CorrelationId>().map(|id| id.0.clone()))
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = HeaderValue::from_str(&correlation_id) {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let request_data = extract_request_data(&req);
        let operation = format!("{} {}", request_data.method, extract_path(&request_data.url));
        self.logger.record(RecordedEvent::new(
            &correlation_id,
            EventType::PlatformApiCall,
            Direction::Request,
            operation.clone(),
            serde_json::to_value(&request_data).unwrap_or(serde_json::Value::Null),
        ));

        let response = next.run(req, extensions).await;

        let event = match &response {
            Ok(resp) => {
                let response_data = extract_response_data(resp);
                RecordedEvent::new(
                    &correlation_id,
                    EventType::PlatformApiCall,
                    Direction::Response,
                    operation,
                    serde_json::to_value(&response_data).unwrap_or(serde_json::Value::Null),
                )
                .with_metadata("status", response_data.status_code.to_string())
            }
            Err(err) => RecordedEvent::new(
                &correlation_id,
                EventType::PlatformApiCall,
                Direction::Response,
                operation,
                serde_json::json!({ "error": err.to_string() }),
            )
            .with_metadata("status", "error"),
        };
        self.logger.record(event);

        response
    }
}

fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

fn extract_request_data(request: &Request) -> RequestData {
    let body = match request.body().and_then(|b| b.as_bytes()) {
        Some(bytes) if bytes.len() > 10_000 => {
            serde_json::Value::String(format!("[LARGE_BODY_{}b]", bytes.len()))
        }
        Some(bytes) => match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(json) => Sanitizer::sanitize_json(&json),
            Err(_) => serde_json::Value::String(format!("[NON_JSON_BODY_{}b]", bytes.len())),
        },
        None => serde_json::Value::Null,
    };

    RequestData {
        method: request.method().to_string(),
        url: request.url().to_string(),
        headers: Sanitizer::sanitize_headers(&headers_to_map(request.headers())),
        body,
    }
}

fn extract_response_data(response: &Response) -> ResponseData {
    ResponseData {
        status_code: response.status().as_u16(),
        headers: Sanitizer::sanitize_headers(&headers_to_map(response.headers())),
        body_size: response.content_length().unwrap_or(0),
    }
}

#[derive(Debug, serde::Serialize)]
struct RequestData {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: serde_json::Value,
}

#[derive(Debug, serde::Serialize)]
struct ResponseData {
    status_code: u16,
    headers: HashMap<String, String>,
    body_size: u64,
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}
