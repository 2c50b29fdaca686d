use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Client, Request, Response};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::context::value_to_string;
use crate::engine::ShutdownReceiver;
use crate::error::HttpError;
use crate::flow::HttpMethod;
use crate::metrics::MetricsAggregator;

use super::url::UrlPlan;

/// Total attempts per request: the first try plus two retries.
const MAX_ATTEMPTS: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Synthetic status stored in the context when the transport failed and no
/// response was ever received.
pub const STATUS_TRANSPORT_ERROR: u16 = 598;
/// Synthetic status stored in the context when the request could not be
/// prepared (bad URL or body) and was never dispatched.
pub const STATUS_INVALID_REQUEST: u16 = 599;

/// A fully substituted request, ready to dispatch.
#[derive(Debug)]
pub struct PreparedRequest {
    pub method: HttpMethod,
    pub plan: UrlPlan,
    /// Final ordered header set; later entries already won any merge.
    pub headers: Vec<(String, String)>,
    /// Post-substitution body; maps and lists serialize as JSON.
    pub body: Option<Value>,
}

/// What one request step produced: either a received response (any status)
/// or a transport failure after retries were exhausted.
#[derive(Debug)]
pub struct StepOutcome {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Value,
    /// Transport error message; `None` whenever a response was received.
    pub error: Option<String>,
}

/// Merges header layers in priority order: session defaults, then flow
/// globals, then step headers. Later layers replace case-insensitively.
#[must_use]
pub fn merge_headers(
    session: &[(String, String)],
    flow: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = session.to_vec();
    for (name, value) in flow.iter().chain(step.iter()) {
        insert_header(&mut merged, name, value);
    }
    merged
}

/// Sets a header, replacing an existing entry whose name matches
/// case-insensitively.
pub fn insert_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
    {
        Some((_, existing_value)) => *existing_value = value.to_owned(),
        None => headers.push((name.to_owned(), value.to_owned())),
    }
}

fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers
        .iter()
        .any(|(existing, _)| existing.eq_ignore_ascii_case(name))
}

/// Executes one request with the retry policy: transport errors and 5xx
/// responses retry with exponential backoff, 4xx never retries. Records one
/// metrics increment per received final response.
///
/// Returns `None` when cancellation interrupted the request or a backoff
/// sleep.
pub async fn execute_step_request(
    client: &Client,
    shutdown_rx: &mut ShutdownReceiver,
    prepared: &PreparedRequest,
    metrics: &MetricsAggregator,
    step_label: &str,
) -> Option<StepOutcome> {
    debug!(
        "Step {}: {} {} headers={:?}",
        step_label,
        prepared.method.as_str(),
        prepared.plan.request_url,
        redacted_headers(&prepared.headers)
    );
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let request = match build_request(client, prepared) {
            Ok(request) => request,
            Err(err) => {
                warn!("Step {}: failed to build request: {}", step_label, err);
                return Some(StepOutcome {
                    status: STATUS_INVALID_REQUEST,
                    headers: HeaderMap::new(),
                    body: Value::Null,
                    error: Some(format!("request build failed: {}", err)),
                });
            }
        };

        let result = tokio::select! {
            _ = shutdown_rx.recv() => return None,
            result = client.execute(request) => result,
        };

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                if status >= 500 && attempt < MAX_ATTEMPTS {
                    warn!(
                        "Step {}: server error {} on attempt {}/{}. Retrying.",
                        step_label, status, attempt, MAX_ATTEMPTS
                    );
                    if backoff(shutdown_rx, attempt).await {
                        return None;
                    }
                    continue;
                }
                let headers = response.headers().clone();
                let body = read_response_body(response).await;
                metrics.record_request();
                return Some(StepOutcome {
                    status,
                    headers,
                    body,
                    error: None,
                });
            }
            Err(err) => {
                if attempt < MAX_ATTEMPTS {
                    warn!(
                        "Step {}: attempt {}/{} failed: {}. Retrying.",
                        step_label, attempt, MAX_ATTEMPTS, err
                    );
                    if backoff(shutdown_rx, attempt).await {
                        return None;
                    }
                    continue;
                }
                return Some(StepOutcome {
                    status: STATUS_TRANSPORT_ERROR,
                    headers: HeaderMap::new(),
                    body: Value::Null,
                    error: Some(format!(
                        "transport error after {} attempts: {}",
                        MAX_ATTEMPTS, err
                    )),
                });
            }
        }
    }
}

/// Exponential backoff between attempts; returns true when cancelled.
async fn backoff(shutdown_rx: &mut ShutdownReceiver, attempt: u32) -> bool {
    let delay = BASE_RETRY_DELAY * 2_u32.saturating_pow(attempt.saturating_sub(1));
    tokio::select! {
        _ = shutdown_rx.recv() => true,
        () = sleep(delay) => false,
    }
}

fn build_request(client: &Client, prepared: &PreparedRequest) -> Result<Request, HttpError> {
    let mut builder = client.request(
        prepared.method.as_reqwest(),
        prepared.plan.request_url.clone(),
    );

    for (name, value) in &prepared.headers {
        builder = builder.header(name, value);
    }
    if let Some(host) = prepared.plan.host_header.as_ref()
        && !has_header(&prepared.headers, "host")
    {
        builder = builder.header("Host", host);
    }

    if !prepared.method.is_bodyless()
        && let Some(body) = prepared.body.as_ref()
    {
        builder = match body {
            Value::Null => builder,
            Value::Object(_) | Value::Array(_) => {
                let serialized = serde_json::to_string(body)
                    .map_err(|err| HttpError::SerializeBodyFailed { source: err })?;
                if !has_header(&prepared.headers, "content-type") {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                }
                builder.body(serialized)
            }
            Value::String(text) => builder.body(text.clone()),
            scalar => builder.body(value_to_string(scalar)),
        };
    }

    builder
        .build()
        .map_err(|err| HttpError::BuildRequestFailed { source: err })
}

/// Reads the response body: JSON when the content type declares it and the
/// payload parses, text for textual or untyped bodies, and a short
/// placeholder for binary payloads.
async fn read_response_body(response: Response) -> Value {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.contains("application/json") {
        match response.text().await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(parsed) => parsed,
                Err(err) => {
                    debug!("JSON content type but body failed to parse: {}", err);
                    Value::String(text)
                }
            },
            Err(err) => Value::String(format!("error reading response body: {}", err)),
        }
    } else if content_type.starts_with("text/") || content_type.is_empty() {
        match response.text().await {
            Ok(text) => Value::String(text),
            Err(err) => Value::String(format!("error reading response body: {}", err)),
        }
    } else {
        match response.bytes().await {
            Ok(bytes) => Value::String(format!(
                "[binary body: {}, {} bytes]",
                content_type,
                bytes.len()
            )),
            Err(err) => Value::String(format!("error reading response body: {}", err)),
        }
    }
}

/// Header view for debug logs with credential values masked.
fn redacted_headers(headers: &[(String, String)]) -> Vec<(&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| {
            let masked = if name.eq_ignore_ascii_case("authorization")
                || name.eq_ignore_ascii_case("cookie")
                || name.eq_ignore_ascii_case("set-cookie")
            {
                "********"
            } else {
                value.as_str()
            };
            (name.as_str(), masked)
        })
        .collect()
}

/// Response headers flattened for context storage; repeated names join with
/// `", "` to match extraction semantics.
#[must_use]
pub fn headers_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for key in headers.keys() {
        let joined = headers
            .get_all(key)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(", ");
        map.insert(key.as_str().to_owned(), Value::String(joined));
    }
    Value::Object(map)
}
