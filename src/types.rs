use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// Opaque identifier the event source assigns to one request/response cycle.
/// Sources may reuse an id once its lifecycle has completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle phases delivered by the instrumentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    RequestStart,
    RequestHeadersExtra,
    ResponseReceived,
    ResponseHeadersExtra,
    BodyAvailable,
    /// The request failed or was cancelled; no body will follow.
    LoadingFailed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::RequestStart => "request-start",
            Phase::RequestHeadersExtra => "request-headers-extra",
            Phase::ResponseReceived => "response-received",
            Phase::ResponseHeadersExtra => "response-headers-extra",
            Phase::BodyAvailable => "body-available",
            Phase::LoadingFailed => "loading-failed",
        }
    }

    /// Phases after which no further events are expected for the exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::BodyAvailable | Phase::LoadingFailed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = crate::error::CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request-start" => Ok(Phase::RequestStart),
            "request-headers-extra" => Ok(Phase::RequestHeadersExtra),
            "response-received" => Ok(Phase::ResponseReceived),
            "response-headers-extra" => Ok(Phase::ResponseHeadersExtra),
            "body-available" => Ok(Phase::BodyAvailable),
            "loading-failed" => Ok(Phase::LoadingFailed),
            other => Err(crate::error::CaptureError::UnknownPhase(other.to_string())),
        }
    }
}

/// Header map with lower-cased names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Copy every header from `other`, replacing values for names already present.
    pub fn merge(&mut self, other: &Headers) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// Headers from `self` overlaid with `overlay`, which wins on conflicts.
    pub fn overlaid(&self, overlay: &Headers) -> Headers {
        let mut out = self.clone();
        out.merge(overlay);
        out
    }
}

impl From<BTreeMap<String, String>> for Headers {
    fn from(map: BTreeMap<String, String>) -> Self {
        let mut headers = Headers::new();
        for (name, value) in map {
            headers.insert(&name, value);
        }
        headers
    }
}

impl From<Headers> for BTreeMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name.as_ref(), value);
        }
        headers
    }
}

/// A captured body: the raw text plus a best-effort JSON parse
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub raw: String,
    pub parsed: Option<serde_json::Value>,
}

impl Body {
    /// Parse as JSON first, falling back to raw text. Never fails.
    pub fn from_text(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let parsed = serde_json::from_str::<serde_json::Value>(raw.trim()).ok();
        Self { raw, parsed }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_text(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// Phase-specific payload carried by a lifecycle event; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

/// One raw event from the instrumentation stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub exchange_id: ExchangeId,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: EventFields,
}

impl LifecycleEvent {
    pub fn new(
        exchange_id: impl Into<String>,
        phase: Phase,
        timestamp: DateTime<Utc>,
        fields: EventFields,
    ) -> Self {
        Self {
            exchange_id: ExchangeId::new(exchange_id),
            phase,
            timestamp,
            fields,
        }
    }
}

/// Exchange progress. Ordered so that merges only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeState {
    Started,
    ResponseReceived,
    BodyAvailable,
    Finalized,
    Abandoned,
}

/// One observed request/response cycle, assembled from lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub id: ExchangeId,
    pub method: Option<String>,
    pub url: Option<Url>,
    pub request_headers: Headers,
    /// Wire-level headers reported separately; they win over `request_headers`.
    pub request_headers_extra: Headers,
    pub request_body: Option<Body>,
    pub status: Option<u16>,
    /// Wire-level status reported with the extra response headers.
    pub status_extra: Option<u16>,
    pub status_text: Option<String>,
    pub mime_type: Option<String>,
    pub response_headers: Headers,
    pub response_headers_extra: Headers,
    pub response_body: Option<Body>,
    pub error_text: Option<String>,
    pub state: ExchangeState,
    /// Whether a request-start has been merged into this exchange.
    pub started: bool,
    /// Created from an enrichment event for an id never seen starting.
    pub synthetic: bool,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Exchange {
    pub fn new(id: ExchangeId, at: DateTime<Utc>) -> Self {
        Self {
            id,
            method: None,
            url: None,
            request_headers: Headers::new(),
            request_headers_extra: Headers::new(),
            request_body: None,
            status: None,
            status_extra: None,
            status_text: None,
            mime_type: None,
            response_headers: Headers::new(),
            response_headers_extra: Headers::new(),
            response_body: None,
            error_text: None,
            state: ExchangeState::Started,
            started: false,
            synthetic: false,
            first_seen_at: at,
            last_updated_at: at,
        }
    }

    pub fn effective_request_headers(&self) -> Headers {
        self.request_headers.overlaid(&self.request_headers_extra)
    }

    pub fn effective_response_headers(&self) -> Headers {
        self.response_headers.overlaid(&self.response_headers_extra)
    }

    /// The wire-level status when one was reported, else the response status.
    pub fn effective_status(&self) -> Option<u16> {
        self.status_extra.or(self.status)
    }
}

/// Endpoint identity: method plus host+path template
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey {
    pub method: String,
    pub template: String,
}

impl CanonicalKey {
    pub fn new(method: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            template: template.into(),
        }
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.template)
    }
}

/// Where a credential-like value was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    Header,
    Payload,
    Response,
}

/// A located, redacted credential-like value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialFragment {
    pub source: CredentialSource,
    pub path: String,
    pub redacted_value: String,
}

impl CredentialFragment {
    pub fn identity(&self) -> (CredentialSource, &str) {
        (self.source, self.path.as_str())
    }
}

/// An exchange handed from the correlator to the catalog.
/// Samples and the example URL are already redacted.
#[derive(Debug, Clone)]
pub struct FinalizedExchange {
    pub exchange: Exchange,
    pub key: CanonicalKey,
    pub example_url: String,
    pub request_sample: Option<serde_json::Value>,
    pub response_sample: Option<serde_json::Value>,
    pub credentials: Vec<CredentialFragment>,
    /// Finalized without a body (idle timeout, failure, or session end).
    pub partial: bool,
}
