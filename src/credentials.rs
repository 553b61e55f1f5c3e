//! Finds token-like values in headers and bodies and redacts them.
//!
//! Raw credential values never leave this module: fragments carry only the
//! redacted form, and the body/URL sanitizers rewrite the same values before
//! samples are handed to the catalog.

use std::collections::BTreeMap;

use serde_json::Value;
use url::{form_urlencoded, Url};

use crate::config::CaptureConfig;
use crate::constants::{
    CREDENTIAL_HEADERS, CREDENTIAL_KEY_FRAGMENTS, DEFAULT_MAX_WALK_DEPTH,
    DEFAULT_REDACTION_AFFIX, DEFAULT_REDACTION_THRESHOLD,
};
use crate::types::{Body, CredentialFragment, CredentialSource, Headers};
use crate::walker::TreeWalker;

/// Stands in for sample subtrees nested deeper than the walk depth.
pub const DEPTH_MARKER: &str = "<nested too deep>";

#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    threshold: usize,
    affix: usize,
    walker: TreeWalker,
}

impl Default for CredentialExtractor {
    fn default() -> Self {
        Self::new(
            DEFAULT_REDACTION_THRESHOLD,
            DEFAULT_REDACTION_AFFIX,
            DEFAULT_MAX_WALK_DEPTH,
        )
    }
}

impl CredentialExtractor {
    pub fn new(threshold: usize, affix: usize, max_depth: usize) -> Self {
        Self {
            threshold,
            // prefix and suffix never overlap
            affix: affix.min(threshold / 2),
            walker: TreeWalker::new(max_depth),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(
            config.redaction_threshold,
            config.redaction_affix,
            config.max_walk_depth,
        )
    }

    /// `prefix...suffix` for values longer than the threshold, the value itself otherwise.
    /// A long value never redacts to itself.
    pub fn redact(&self, value: &str) -> String {
        let len = value.chars().count();
        if len <= self.threshold {
            return value.to_string();
        }
        let prefix: String = value.chars().take(self.affix).collect();
        let suffix: String = value.chars().skip(len - self.affix).collect();
        let redacted = format!("{}...{}", prefix, suffix);
        if redacted == value {
            // The raw value already has `...` at the seam; a shorter marker differs
            return format!("{}\u{2026}{}", prefix, suffix);
        }
        redacted
    }

    pub fn is_credential_header(name: &str) -> bool {
        CREDENTIAL_HEADERS
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }

    pub fn is_credential_key(key: &str) -> bool {
        let lowered = key.to_ascii_lowercase();
        CREDENTIAL_KEY_FRAGMENTS
            .iter()
            .any(|fragment| lowered.contains(fragment))
    }

    /// All fragments for one exchange, deduplicated by `(source, path)`.
    pub fn extract(
        &self,
        headers: &Headers,
        request_body: Option<&Body>,
        response_body: Option<&Body>,
    ) -> Vec<CredentialFragment> {
        let mut found = Vec::new();
        found.extend(self.extract_headers(headers));
        if let Some(body) = request_body {
            found.extend(self.extract_body(body, CredentialSource::Payload));
        }
        if let Some(body) = response_body {
            found.extend(self.extract_body(body, CredentialSource::Response));
        }
        dedupe(found)
    }

    pub fn extract_headers(&self, headers: &Headers) -> Vec<CredentialFragment> {
        let mut out = Vec::new();
        for (name, value) in headers.iter() {
            if !Self::is_credential_header(name) {
                continue;
            }
            if name == "cookie" {
                for (cookie, cookie_value) in split_cookies(value) {
                    out.push(self.fragment(
                        CredentialSource::Header,
                        format!("cookie.{}", cookie),
                        cookie_value,
                    ));
                }
            } else {
                out.push(self.fragment(CredentialSource::Header, name.to_string(), value));
            }
        }
        out
    }

    /// Cookies the server sets. Multiple `Set-Cookie` values arrive newline-joined.
    pub fn extract_set_cookies(&self, response_headers: &Headers) -> Vec<CredentialFragment> {
        let Some(value) = response_headers.get("set-cookie") else {
            return Vec::new();
        };
        value
            .lines()
            .filter_map(|line| line.split(';').next())
            .filter_map(|pair| pair.split_once('='))
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, v)| {
                self.fragment(
                    CredentialSource::Header,
                    format!("set-cookie.{}", name.trim()),
                    v.trim(),
                )
            })
            .collect()
    }

    pub fn extract_body(&self, body: &Body, source: CredentialSource) -> Vec<CredentialFragment> {
        let mut out = Vec::new();
        if let Some(tree) = &body.parsed {
            self.walker
                .walk(tree, &mut |key| Self::is_credential_key(key), &mut |path, value| {
                    if let Value::String(s) = value {
                        out.push(self.fragment(source, path.to_string(), s));
                    }
                });
        } else if looks_like_form(&body.raw) {
            for (key, value) in form_urlencoded::parse(body.raw.trim().as_bytes()) {
                if Self::is_credential_key(&key) {
                    out.push(self.fragment(source, key.into_owned(), &value));
                }
            }
        }
        out
    }

    /// A catalog-safe copy of a body. Oversized JSON is replaced by a size marker,
    /// nesting past the walk depth by a depth marker, and every string under a
    /// credential key is redacted.
    pub fn sanitize_body(&self, body: &Body, max_bytes: usize) -> Value {
        if let Some(tree) = &body.parsed {
            if body.raw.len() > max_bytes {
                return Value::String(format!("<{} bytes omitted>", body.raw.len()));
            }
            let mut copy = tree.clone();
            self.walker
                .prune(&mut copy, &Value::String(DEPTH_MARKER.to_string()));
            self.walker.walk_mut(
                &mut copy,
                &mut |key| Self::is_credential_key(key),
                &mut |_, value| self.redact_tree(value),
            );
            return copy;
        }
        if looks_like_form(&body.raw) {
            let redacted = self.redact_form(body.raw.trim());
            return Value::String(truncate(&redacted, max_bytes));
        }
        Value::String(truncate(&body.raw, max_bytes))
    }

    /// The URL with credential-like query values redacted.
    pub fn sanitize_url(&self, url: &Url) -> String {
        if url.query().is_none() {
            return url.to_string();
        }
        let mut copy = url.clone();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let v = if Self::is_credential_key(&k) {
                    self.redact(&v)
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();
        copy.query_pairs_mut().clear().extend_pairs(pairs);
        copy.to_string()
    }

    fn redact_tree(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.redact(s),
            Value::Array(items) => items.iter_mut().for_each(|item| self.redact_tree(item)),
            Value::Object(map) => map.values_mut().for_each(|item| self.redact_tree(item)),
            _ => {}
        }
    }

    fn redact_form(&self, raw: &str) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            if Self::is_credential_key(&key) {
                serializer.append_pair(&key, &self.redact(&value));
            } else {
                serializer.append_pair(&key, &value);
            }
        }
        serializer.finish()
    }

    fn fragment(&self, source: CredentialSource, path: String, value: &str) -> CredentialFragment {
        CredentialFragment {
            source,
            path,
            redacted_value: self.redact(value),
        }
    }
}

fn split_cookies(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(name, value)| (name.trim(), value.trim()))
        .filter(|(name, _)| !name.is_empty())
}

fn looks_like_form(raw: &str) -> bool {
    let raw = raw.trim();
    !raw.is_empty()
        && raw.contains('=')
        && !raw.starts_with('{')
        && !raw.starts_with('[')
        && !raw.starts_with('<')
        && !raw.chars().any(char::is_whitespace)
}

fn truncate(raw: &str, max_bytes: usize) -> String {
    if raw.len() <= max_bytes {
        return raw.to_string();
    }
    let mut end = max_bytes;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[truncated {} bytes]", &raw[..end], raw.len() - end)
}

fn dedupe(fragments: Vec<CredentialFragment>) -> Vec<CredentialFragment> {
    let mut by_identity: BTreeMap<(CredentialSource, String), CredentialFragment> = BTreeMap::new();
    for fragment in fragments {
        by_identity.insert((fragment.source, fragment.path.clone()), fragment);
    }
    by_identity.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: &str = "abcdefghijklmnopqrstuvwxyz";

    #[test]
    fn test_redaction_threshold() {
        let extractor = CredentialExtractor::default();
        assert_eq!(extractor.redact(LONG), "abcdefghij...qrstuvwxyz");
        assert_eq!(extractor.redact("short-token"), "short-token");
        let exactly_twenty = "a".repeat(20);
        assert_eq!(extractor.redact(&exactly_twenty), exactly_twenty);
    }

    #[test]
    fn test_redaction_never_returns_the_raw_value() {
        let extractor = CredentialExtractor::default();
        let seam = "abcdefghij...qrstuvwxyz";
        let redacted = extractor.redact(seam);
        assert_ne!(redacted, seam);
        assert_eq!(redacted, "abcdefghij\u{2026}qrstuvwxyz");
    }

    #[test]
    fn test_redaction_handles_multibyte() {
        let extractor = CredentialExtractor::default();
        let value = "é".repeat(30);
        let redacted = extractor.redact(&value);
        assert_eq!(redacted.chars().count(), 23);
        assert_ne!(redacted, value);
    }

    #[test]
    fn test_header_names_match_exactly() {
        let headers: Headers = [
            ("Authorization", format!("Bearer {}", LONG)),
            ("X-CSRFToken", "abc".to_string()),
            ("X-Authorization-Hint", "not a credential header".to_string()),
            ("Accept", "*/*".to_string()),
        ]
        .into_iter()
        .collect();

        let fragments = CredentialExtractor::default().extract_headers(&headers);
        let paths: Vec<&str> = fragments.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["authorization", "x-csrftoken"]);
        assert_eq!(fragments[0].redacted_value, "Bearer abc...qrstuvwxyz");
    }

    #[test]
    fn test_cookies_split_into_fragments() {
        let headers: Headers = [("Cookie", "csrftoken=abc; sessionid=xyz; empty=")]
            .into_iter()
            .collect();
        let fragments = CredentialExtractor::default().extract_headers(&headers);
        let paths: Vec<&str> = fragments.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["cookie.csrftoken", "cookie.sessionid", "cookie.empty"]);
        assert_eq!(fragments[1].redacted_value, "xyz");
    }

    #[test]
    fn test_set_cookie_lines() {
        let headers: Headers = [("Set-Cookie", "sessionid=abc; Path=/; HttpOnly\nmid=Z1; Secure")]
            .into_iter()
            .collect();
        let fragments = CredentialExtractor::default().extract_set_cookies(&headers);
        let paths: Vec<&str> = fragments.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["set-cookie.sessionid", "set-cookie.mid"]);
    }

    #[test]
    fn test_json_body_walk_only_keeps_strings() {
        let body = Body::from_text(
            json!({
                "id": 1,
                "data": {"accessToken": LONG, "session_count": 4},
                "apiKey": "k1"
            })
            .to_string(),
        );
        let fragments =
            CredentialExtractor::default().extract_body(&body, CredentialSource::Response);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].path, "data.accessToken");
        assert_eq!(fragments[0].redacted_value, "abcdefghij...qrstuvwxyz");
        assert_eq!(fragments[1].path, "apiKey");
    }

    #[test]
    fn test_form_body_is_scanned() {
        let body = Body::from_text(format!("username=bob&fb_dtsg={}&jazoest=2", LONG));
        let fragments = CredentialExtractor::default().extract_body(&body, CredentialSource::Payload);
        assert!(fragments.is_empty());

        let body = Body::from_text(format!("username=bob&csrf_token={}", LONG));
        let fragments = CredentialExtractor::default().extract_body(&body, CredentialSource::Payload);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].path, "csrf_token");
    }

    #[test]
    fn test_extract_dedupes_by_source_and_path() {
        let headers: Headers = [("x-api-key", "one")].into_iter().collect();
        let body = Body::from_text(r#"{"token":"a","nested":{"token":"b"}}"#);
        let fragments = CredentialExtractor::default().extract(&headers, Some(&body), Some(&body));
        assert_eq!(fragments.len(), 5);
        let sources: Vec<CredentialSource> = fragments.iter().map(|f| f.source).collect();
        assert_eq!(
            sources,
            vec![
                CredentialSource::Header,
                CredentialSource::Payload,
                CredentialSource::Payload,
                CredentialSource::Response,
                CredentialSource::Response,
            ]
        );
    }

    #[test]
    fn test_sanitize_body_redacts_in_place() {
        let body = Body::from_text(json!({"id": 123, "token": LONG}).to_string());
        let sample = CredentialExtractor::default().sanitize_body(&body, 1024);
        assert_eq!(sample, json!({"id": 123, "token": "abcdefghij...qrstuvwxyz"}));
    }

    #[test]
    fn test_sanitize_body_redacts_every_string_under_a_credential_key() {
        let body = Body::from_text(
            json!({
                "tokens": [LONG, {"inner": LONG}],
                "auth": {"user": "bob", "session": LONG},
                "name": LONG
            })
            .to_string(),
        );
        let sample = CredentialExtractor::default().sanitize_body(&body, 4096);
        assert_eq!(sample["tokens"][0], "abcdefghij...qrstuvwxyz");
        assert_eq!(sample["tokens"][1]["inner"], "abcdefghij...qrstuvwxyz");
        assert_eq!(sample["auth"]["user"], "bob");
        assert_eq!(sample["auth"]["session"], "abcdefghij...qrstuvwxyz");
        // not a credential key
        assert_eq!(sample["name"], LONG);
    }

    #[test]
    fn test_sanitize_body_cuts_nesting_past_the_walk_depth() {
        let mut tree = json!({"token": LONG});
        for _ in 0..3 {
            tree = json!({"a": tree});
        }
        let body = Body::from_text(tree.to_string());
        let sample = CredentialExtractor::new(20, 10, 2).sanitize_body(&body, 4096);
        assert_eq!(sample, json!({"a": {"a": {"a": DEPTH_MARKER}}}));
        assert!(!sample.to_string().contains(LONG));
    }

    #[test]
    fn test_sanitize_body_bounds_size() {
        let extractor = CredentialExtractor::default();
        let raw = Body::from_text("x".repeat(100));
        let sample = extractor.sanitize_body(&raw, 10);
        assert_eq!(sample, Value::String("xxxxxxxxxx...[truncated 90 bytes]".to_string()));

        let big_json = Body::from_text(json!({"blob": "y".repeat(100)}).to_string());
        let sample = extractor.sanitize_body(&big_json, 10);
        assert!(sample.as_str().unwrap().contains("bytes omitted"));
    }

    #[test]
    fn test_sanitize_url_redacts_query_credentials() {
        let url = Url::parse(&format!("https://x.com/a?access_token={}&page=2", LONG)).unwrap();
        let sanitized = CredentialExtractor::default().sanitize_url(&url);
        assert!(!sanitized.contains(LONG));
        assert!(sanitized.contains("page=2"));
        assert!(sanitized.contains("access_token=abcdefghij...qrstuvwxyz"));
    }
}
