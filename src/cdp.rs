//! Translation of Chrome DevTools Protocol `Network.*` events into lifecycle events.
//!
//! | CDP method                            | phase                    |
//! |---------------------------------------|--------------------------|
//! | `Network.requestWillBeSent`           | `request-start`          |
//! | `Network.requestWillBeSentExtraInfo`  | `request-headers-extra`  |
//! | `Network.responseReceived`            | `response-received`      |
//! | `Network.responseReceivedExtraInfo`   | `response-headers-extra` |
//! | `Network.loadingFinished`             | `body-available`         |
//! | `Network.loadingFailed`               | `loading-failed`         |
//!
//! `loadingFinished` carries no body on the wire; a collector that fetched it
//! with `Network.getResponseBody` is expected to merge it into the params as
//! `body`. A body flagged `base64Encoded` is binary and is replaced by a
//! length marker. A `requestWillBeSent` with a `redirectResponse` closes the previous
//! hop before starting the next one under the same `requestId`.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::types::{EventFields, Headers, LifecycleEvent, Phase};

/// A raw CDP event message
#[derive(Debug, Clone, Deserialize)]
pub struct CdpMessage {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Translate one CDP event. `received_at` is used when the event carries no wall time.
pub fn translate(method: &str, params: &Value, received_at: DateTime<Utc>) -> Vec<LifecycleEvent> {
    let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
        return Vec::new();
    };
    let timestamp = wall_time(params).unwrap_or(received_at);
    let event = |phase: Phase, fields: EventFields| {
        LifecycleEvent::new(request_id, phase, timestamp, fields)
    };

    match method {
        "Network.requestWillBeSent" => {
            let mut out = Vec::new();
            if let Some(redirect) = params.get("redirectResponse") {
                out.push(event(Phase::ResponseReceived, response_fields(redirect)));
            }
            let request = params.get("request").unwrap_or(&Value::Null);
            out.push(event(
                Phase::RequestStart,
                EventFields {
                    method: str_field(request, "method"),
                    url: str_field(request, "url"),
                    headers: headers_field(request.get("headers")),
                    post_data: str_field(request, "postData"),
                    ..Default::default()
                },
            ));
            out
        }
        "Network.requestWillBeSentExtraInfo" => vec![event(
            Phase::RequestHeadersExtra,
            EventFields {
                headers: headers_field(params.get("headers")),
                ..Default::default()
            },
        )],
        "Network.responseReceived" => {
            let response = params.get("response").unwrap_or(&Value::Null);
            vec![event(Phase::ResponseReceived, response_fields(response))]
        }
        "Network.responseReceivedExtraInfo" => vec![event(
            Phase::ResponseHeadersExtra,
            EventFields {
                status: params
                    .get("statusCode")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok()),
                headers: headers_field(params.get("headers")),
                ..Default::default()
            },
        )],
        "Network.loadingFinished" => vec![event(
            Phase::BodyAvailable,
            EventFields {
                body: body_field(params),
                ..Default::default()
            },
        )],
        "Network.loadingFailed" => vec![event(
            Phase::LoadingFailed,
            EventFields {
                error_text: str_field(params, "errorText"),
                ..Default::default()
            },
        )],
        _ => Vec::new(),
    }
}

pub fn translate_message(message: &CdpMessage, received_at: DateTime<Utc>) -> Vec<LifecycleEvent> {
    translate(&message.method, &message.params, received_at)
}

fn response_fields(response: &Value) -> EventFields {
    EventFields {
        url: str_field(response, "url"),
        status: response
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok()),
        status_text: str_field(response, "statusText"),
        mime_type: str_field(response, "mimeType"),
        headers: headers_field(response.get("headers")),
        ..Default::default()
    }
}

fn body_field(params: &Value) -> Option<String> {
    let body = str_field(params, "body")?;
    if params.get("base64Encoded").and_then(Value::as_bool) == Some(true) {
        return Some(format!("<binary body: {} base64 chars>", body.len()));
    }
    Some(body)
}

fn str_field(value: &Value, name: &str) -> Option<String> {
    value.get(name).and_then(Value::as_str).map(str::to_string)
}

fn headers_field(value: Option<&Value>) -> Option<Headers> {
    let map = value?.as_object()?;
    Some(
        map.iter()
            .map(|(name, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.as_str(), text)
            })
            .collect(),
    )
}

/// `wallTime` is seconds since the epoch as a float.
fn wall_time(params: &Value) -> Option<DateTime<Utc>> {
    let secs = params.get("wallTime").and_then(Value::as_f64)?;
    Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
}
