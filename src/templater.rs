//! Reduces concrete URLs to canonical `(method, template)` keys.
//!
//! The scheme and host are kept verbatim. Each path segment is tested against
//! an ordered table of matchers and replaced by the placeholder of the first
//! match; unmatched segments stay as they are. The query string never takes
//! part in the key.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::error::{CaptureError, Result};
use crate::types::CanonicalKey;

static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("valid regex"));
static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .expect("valid regex")
});
static OBJECT_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{24}$").expect("valid regex"));
static OPAQUE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_\-]{20,}$").expect("valid regex"));
static HANDLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(@|%40)[A-Za-z0-9_.\-]+$").expect("valid regex"));

/// A single-segment matcher and the placeholder it substitutes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRule {
    Numeric,
    Uuid,
    ObjectId,
    OpaqueToken,
    Handle,
}

impl SegmentRule {
    /// Priority order used by the templater.
    pub const ORDER: [SegmentRule; 5] = [
        SegmentRule::Numeric,
        SegmentRule::Uuid,
        SegmentRule::ObjectId,
        SegmentRule::OpaqueToken,
        SegmentRule::Handle,
    ];

    pub fn placeholder(&self) -> &'static str {
        match self {
            SegmentRule::Numeric => "{id}",
            SegmentRule::Uuid => "{uuid}",
            SegmentRule::ObjectId => "{objectId}",
            SegmentRule::OpaqueToken => "{token}",
            SegmentRule::Handle => "{username}",
        }
    }

    pub fn matches(&self, segment: &str) -> bool {
        match self {
            SegmentRule::Numeric => NUMERIC.is_match(segment),
            SegmentRule::Uuid => UUID.is_match(segment),
            SegmentRule::ObjectId => OBJECT_ID.is_match(segment),
            // Separated runs of words are slugs unless a digit shows up
            SegmentRule::OpaqueToken => {
                OPAQUE_TOKEN.is_match(segment)
                    && (segment.chars().all(|c| c.is_ascii_alphanumeric())
                        || segment.chars().any(|c| c.is_ascii_digit()))
            }
            SegmentRule::Handle => HANDLE.is_match(segment),
        }
    }
}

/// A segment that is variable because of the literal segment preceding it,
/// e.g. the post shortcode in `/p/<shortcode>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRule {
    pub after: String,
    pub placeholder: String,
}

impl ContextRule {
    pub fn new(after: &str, placeholder: &str) -> Self {
        Self {
            after: after.to_string(),
            placeholder: placeholder.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlTemplater {
    context_rules: Vec<ContextRule>,
}

impl Default for UrlTemplater {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlTemplater {
    pub fn new() -> Self {
        Self {
            context_rules: vec![
                ContextRule::new("p", "{shortcode}"),
                ContextRule::new("reel", "{shortcode}"),
                ContextRule::new("reels", "{shortcode}"),
                ContextRule::new("tv", "{shortcode}"),
                ContextRule::new("stories", "{username}"),
                ContextRule::new("explore", "{section}"),
            ],
        }
    }

    /// Template a raw URL string. Fails only when the URL cannot be parsed.
    pub fn template(&self, method: &str, url: &str) -> Result<CanonicalKey> {
        let parsed = Url::parse(url).map_err(|e| CaptureError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        self.template_url(method, &parsed)
    }

    pub fn template_url(&self, method: &str, url: &Url) -> Result<CanonicalKey> {
        let host = url.host_str().ok_or_else(|| CaptureError::InvalidUrl {
            url: url.to_string(),
            reason: "URL has no host".to_string(),
        })?;

        let mut template = format!("{}://{}", url.scheme(), host);
        if let Some(port) = url.port() {
            template.push(':');
            template.push_str(&port.to_string());
        }
        template.push_str(&self.template_path(url.path()));

        Ok(CanonicalKey::new(method.to_ascii_uppercase(), template))
    }

    /// Template a bare path, keeping its leading and trailing slashes.
    pub fn template_path(&self, path: &str) -> String {
        let mut previous: Option<&str> = None;
        let segments: Vec<String> = path
            .split('/')
            .map(|segment| {
                let out = self.template_segment(segment, previous);
                previous = Some(segment);
                out
            })
            .collect();
        let joined = segments.join("/");
        if joined.is_empty() {
            "/".to_string()
        } else {
            joined
        }
    }

    fn template_segment(&self, segment: &str, previous: Option<&str>) -> String {
        if segment.is_empty() {
            return String::new();
        }
        // Already a placeholder; templating must be a fixed point
        if segment.starts_with('{') && segment.ends_with('}') {
            return segment.to_string();
        }
        if let Some(rule) = SegmentRule::ORDER.iter().find(|r| r.matches(segment)) {
            return rule.placeholder().to_string();
        }
        if let Some(prev) = previous {
            if let Some(rule) = self.context_rules.iter().find(|r| r.after == prev) {
                return rule.placeholder.clone();
            }
        }
        segment.to_string()
    }
}
