//! Reassembles out-of-order lifecycle events into finalized exchanges.
//!
//! Events are applied one at a time. Every merge is idempotent and moves an
//! exchange's state forward only, so duplicate or reordered enrichment events
//! converge on the same exchange. An exchange is finalized when its body
//! arrives, when it fails, when it sits idle past the configured window, or
//! when the session drains; it is then dropped from in-flight tracking.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use url::Url;

use crate::config::CaptureConfig;
use crate::credentials::CredentialExtractor;
use crate::filter::{AcceptAll, TrafficFilter};
use crate::metrics::{self, MetricName};
use crate::templater::UrlTemplater;
use crate::types::{
    Body, Exchange, ExchangeId, ExchangeState, FinalizedExchange, LifecycleEvent, Phase,
};

/// Method recorded for exchanges whose request-start was never seen.
pub const UNKNOWN_METHOD: &str = "UNKNOWN";

pub struct Correlator {
    in_flight: HashMap<ExchangeId, Exchange>,
    /// Ids whose traffic the filter rejected, with the time last seen.
    ignored: HashMap<ExchangeId, DateTime<Utc>>,
    templater: UrlTemplater,
    extractor: CredentialExtractor,
    filter: Box<dyn TrafficFilter>,
    idle_window: Duration,
    max_sample_bytes: usize,
}

impl Correlator {
    pub fn new(config: &CaptureConfig, filter: Box<dyn TrafficFilter>) -> Self {
        Self {
            in_flight: HashMap::new(),
            ignored: HashMap::new(),
            templater: UrlTemplater::new(),
            extractor: CredentialExtractor::from_config(config),
            filter,
            idle_window: config.idle_window(),
            max_sample_bytes: config.max_sample_bytes,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(&CaptureConfig::default(), Box::new(AcceptAll))
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn get(&self, id: &ExchangeId) -> Option<&Exchange> {
        self.in_flight.get(id)
    }

    /// Apply one event. Returns the exchanges it caused to finalize.
    pub fn ingest(&mut self, event: LifecycleEvent) -> Vec<FinalizedExchange> {
        metrics::increment(MetricName::EventsIngested);
        let mut finalized = Vec::new();

        let event_url = match event.fields.url.as_deref().map(Url::parse).transpose() {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    exchange_id = %event.exchange_id,
                    phase = %event.phase,
                    "dropping event with unparseable URL: {}",
                    e
                );
                metrics::increment(MetricName::EventsDropped);
                if event.phase == Phase::RequestStart {
                    return finalized;
                }
                None
            }
        };

        if event.phase == Phase::RequestStart {
            if event_url.is_none() {
                warn!(exchange_id = %event.exchange_id, "dropping request-start without URL");
                metrics::increment(MetricName::EventsDropped);
                return finalized;
            }
            self.ignored.remove(&event.exchange_id);
            // A second start for a started id is a new lifecycle reusing the id
            let reused = self
                .in_flight
                .get(&event.exchange_id)
                .map_or(false, |existing| existing.started);
            if reused {
                if let Some(previous) = self.in_flight.remove(&event.exchange_id) {
                    debug!(exchange_id = %event.exchange_id, "exchange id reused; finalizing previous lifecycle");
                    finalized.extend(self.finalize(previous, ExchangeState::Abandoned));
                }
            }
        } else if self.ignored.contains_key(&event.exchange_id) {
            if event.phase.is_terminal() {
                self.ignored.remove(&event.exchange_id);
            } else {
                self.ignored.insert(event.exchange_id.clone(), event.timestamp);
            }
            return finalized;
        }

        // Only the URL that identifies the exchange is filtered; enrichment
        // URLs of an already-addressed exchange are ignored by the merge anyway
        let url_is_identity = event.phase == Phase::RequestStart
            || self
                .in_flight
                .get(&event.exchange_id)
                .map_or(true, |existing| existing.url.is_none());
        if let Some(url) = event_url.as_ref().filter(|_| url_is_identity) {
            if !self.filter.accept(url) {
                debug!(exchange_id = %event.exchange_id, url = %url, "filtered out");
                metrics::increment(MetricName::ExchangesFiltered);
                self.in_flight.remove(&event.exchange_id);
                if !event.phase.is_terminal() {
                    self.ignored.insert(event.exchange_id.clone(), event.timestamp);
                }
                return finalized;
            }
        }

        let exchange = self
            .in_flight
            .entry(event.exchange_id.clone())
            .or_insert_with(|| {
                let mut fresh = Exchange::new(event.exchange_id.clone(), event.timestamp);
                if event.phase != Phase::RequestStart {
                    warn!(
                        exchange_id = %event.exchange_id,
                        phase = %event.phase,
                        "enrichment for unknown exchange; synthesizing partial exchange"
                    );
                    metrics::increment(MetricName::OrphanEventsSynthesized);
                    fresh.synthetic = true;
                }
                fresh
            });

        merge_event(exchange, &event, event_url);
        debug!(
            exchange_id = %event.exchange_id,
            phase = %event.phase,
            state = ?exchange.state,
            "merged lifecycle event"
        );

        if event.phase.is_terminal() {
            if let Some(done) = self.in_flight.remove(&event.exchange_id) {
                let state = if event.phase == Phase::BodyAvailable {
                    ExchangeState::Finalized
                } else {
                    ExchangeState::Abandoned
                };
                finalized.extend(self.finalize(done, state));
            }
        }

        finalized
    }

    /// Force-finalize every exchange idle for at least the idle window as of `now`.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<FinalizedExchange> {
        let window = self.idle_window;
        self.ignored.retain(|_, seen| now - *seen < window);

        let mut stale: Vec<ExchangeId> = self
            .in_flight
            .iter()
            .filter(|(_, exchange)| now - exchange.last_updated_at >= window)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();

        let mut finalized = Vec::new();
        for id in stale {
            if let Some(exchange) = self.in_flight.remove(&id) {
                debug!(exchange_id = %id, "exchange idle past window; abandoning");
                finalized.extend(self.finalize(exchange, ExchangeState::Abandoned));
            }
        }
        finalized
    }

    /// Force-finalize everything still in flight, oldest first.
    pub fn drain(&mut self) -> Vec<FinalizedExchange> {
        let mut remaining: Vec<Exchange> = self.in_flight.drain().map(|(_, e)| e).collect();
        remaining.sort_by(|a, b| {
            a.first_seen_at
                .cmp(&b.first_seen_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.ignored.clear();

        remaining
            .into_iter()
            .filter_map(|exchange| self.finalize(exchange, ExchangeState::Abandoned))
            .collect()
    }

    fn finalize(&self, mut exchange: Exchange, state: ExchangeState) -> Option<FinalizedExchange> {
        exchange.state = state;
        let partial = state == ExchangeState::Abandoned || exchange.response_body.is_none();

        let Some(url) = exchange.url.clone() else {
            warn!(
                exchange_id = %exchange.id,
                "exchange finalized without a URL; no catalog key can be computed"
            );
            metrics::increment(MetricName::ExchangesUncataloged);
            return None;
        };

        let method = exchange
            .method
            .clone()
            .unwrap_or_else(|| UNKNOWN_METHOD.to_string());
        let key = match self.templater.template_url(&method, &url) {
            Ok(key) => key,
            Err(e) => {
                warn!(exchange_id = %exchange.id, "cannot template URL: {}", e);
                metrics::increment(MetricName::ExchangesUncataloged);
                return None;
            }
        };

        let mut credentials = self.extractor.extract(
            &exchange.effective_request_headers(),
            exchange.request_body.as_ref(),
            exchange.response_body.as_ref(),
        );
        credentials.extend(
            self.extractor
                .extract_set_cookies(&exchange.effective_response_headers()),
        );
        metrics::increment_by(MetricName::CredentialsExtracted, credentials.len() as u64);

        let request_sample = exchange
            .request_body
            .as_ref()
            .map(|b| self.extractor.sanitize_body(b, self.max_sample_bytes));
        let response_sample = exchange
            .response_body
            .as_ref()
            .map(|b| self.extractor.sanitize_body(b, self.max_sample_bytes));
        let example_url = self.extractor.sanitize_url(&url);

        if state == ExchangeState::Abandoned {
            metrics::increment(MetricName::ExchangesAbandoned);
        } else {
            metrics::increment(MetricName::ExchangesFinalized);
        }

        Some(FinalizedExchange {
            exchange,
            key,
            example_url,
            request_sample,
            response_sample,
            credentials,
            partial,
        })
    }
}

/// Merge an event's fields into the exchange. Fields are only ever filled in,
/// never cleared, and the state only moves forward.
fn merge_event(exchange: &mut Exchange, event: &LifecycleEvent, url: Option<Url>) {
    let fields = &event.fields;

    if event.timestamp < exchange.first_seen_at {
        exchange.first_seen_at = event.timestamp;
    }
    if event.timestamp > exchange.last_updated_at {
        exchange.last_updated_at = event.timestamp;
    }

    match event.phase {
        Phase::RequestStart => {
            exchange.started = true;
            exchange.synthetic = false;
            if let Some(url) = url {
                exchange.url = Some(url);
            }
            if let Some(method) = &fields.method {
                exchange.method = Some(method.to_ascii_uppercase());
            }
            if let Some(headers) = &fields.headers {
                exchange.request_headers.merge(headers);
            }
            if let Some(post_data) = &fields.post_data {
                exchange.request_body = Some(Body::from_text(post_data.clone()));
            }
        }
        Phase::RequestHeadersExtra => {
            if let Some(headers) = &fields.headers {
                exchange.request_headers_extra.merge(headers);
            }
            fill_url(exchange, url);
        }
        Phase::ResponseReceived => {
            if let Some(status) = fields.status {
                exchange.status = Some(status);
            }
            if let Some(text) = &fields.status_text {
                exchange.status_text = Some(text.clone());
            }
            if let Some(mime) = &fields.mime_type {
                exchange.mime_type = Some(mime.clone());
            }
            if let Some(headers) = &fields.headers {
                exchange.response_headers.merge(headers);
            }
            fill_url(exchange, url);
            advance(exchange, ExchangeState::ResponseReceived);
        }
        Phase::ResponseHeadersExtra => {
            if let Some(status) = fields.status {
                exchange.status_extra = Some(status);
            }
            // response-received owns the status text; this only fills a gap
            if exchange.status_text.is_none() {
                exchange.status_text = fields.status_text.clone();
            }
            if let Some(headers) = &fields.headers {
                exchange.response_headers_extra.merge(headers);
            }
            fill_url(exchange, url);
        }
        Phase::BodyAvailable => {
            if let Some(body) = &fields.body {
                exchange.response_body = Some(Body::from_text(body.clone()));
            }
            if let Some(mime) = &fields.mime_type {
                exchange.mime_type = Some(mime.clone());
            }
            fill_url(exchange, url);
            advance(exchange, ExchangeState::BodyAvailable);
        }
        Phase::LoadingFailed => {
            if let Some(error) = &fields.error_text {
                exchange.error_text = Some(error.clone());
            }
            fill_url(exchange, url);
        }
    }

    // Synthetic exchanges learn their method from whatever carries one
    if exchange.method.is_none() {
        if let Some(method) = &fields.method {
            exchange.method = Some(method.to_ascii_uppercase());
        }
    }
}

/// Enrichment URLs never override the one from request-start.
fn fill_url(exchange: &mut Exchange, url: Option<Url>) {
    if exchange.url.is_none() {
        exchange.url = url;
    }
}

fn advance(exchange: &mut Exchange, state: ExchangeState) {
    if state > exchange.state {
        exchange.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CredentialSource, EventFields, Headers};
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn start(id: &str, method: &str, url: &str, t: i64) -> LifecycleEvent {
        LifecycleEvent::new(
            id,
            Phase::RequestStart,
            at(t),
            EventFields {
                method: Some(method.to_string()),
                url: Some(url.to_string()),
                ..Default::default()
            },
        )
    }

    fn response(id: &str, status: u16, t: i64) -> LifecycleEvent {
        LifecycleEvent::new(
            id,
            Phase::ResponseReceived,
            at(t),
            EventFields {
                status: Some(status),
                ..Default::default()
            },
        )
    }

    fn body(id: &str, body: &str, t: i64) -> LifecycleEvent {
        LifecycleEvent::new(
            id,
            Phase::BodyAvailable,
            at(t),
            EventFields {
                body: Some(body.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_full_lifecycle_finalizes_on_body() {
        let mut c = Correlator::with_defaults();
        assert!(c.ingest(start("1", "get", "https://x.com/api/users/123", 0)).is_empty());
        assert!(c.ingest(response("1", 200, 1)).is_empty());
        let done = c.ingest(body("1", r#"{"id":123,"token":"abcdefghijklmnopqrstuvwxyz"}"#, 2));

        assert_eq!(done.len(), 1);
        let f = &done[0];
        assert_eq!(f.key.to_string(), "GET https://x.com/api/users/{id}");
        assert_eq!(f.exchange.state, ExchangeState::Finalized);
        assert_eq!(f.exchange.status, Some(200));
        assert!(!f.partial);
        assert_eq!(
            f.response_sample,
            Some(json!({"id": 123, "token": "abcdefghij...qrstuvwxyz"}))
        );
        assert_eq!(f.credentials.len(), 1);
        assert_eq!(f.credentials[0].source, CredentialSource::Response);
        assert_eq!(f.credentials[0].path, "token");
        assert_eq!(c.in_flight_len(), 0);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut c = Correlator::with_defaults();
        c.ingest(start("1", "GET", "https://x.com/a", 0));
        let extra = LifecycleEvent::new(
            "1",
            Phase::RequestHeadersExtra,
            at(1),
            EventFields {
                headers: Some([("Cookie", "sid=1")].into_iter().collect::<Headers>()),
                ..Default::default()
            },
        );
        c.ingest(extra.clone());
        let once = c.get(&ExchangeId::new("1")).cloned().unwrap();
        c.ingest(extra);
        let twice = c.get(&ExchangeId::new("1")).cloned().unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_enrichment_order_does_not_matter() {
        let headers_extra = LifecycleEvent::new(
            "1",
            Phase::ResponseHeadersExtra,
            at(1),
            EventFields {
                status: Some(200),
                headers: Some([("Set-Cookie", "a=b")].into_iter().collect::<Headers>()),
                ..Default::default()
            },
        );

        let mut first = Correlator::with_defaults();
        first.ingest(start("1", "GET", "https://x.com/a", 0));
        first.ingest(headers_extra.clone());
        first.ingest(response("1", 200, 1));

        let mut second = Correlator::with_defaults();
        second.ingest(start("1", "GET", "https://x.com/a", 0));
        second.ingest(response("1", 200, 1));
        second.ingest(headers_extra);

        let id = ExchangeId::new("1");
        assert_eq!(first.get(&id), second.get(&id));
        assert_eq!(first.get(&id).unwrap().state, ExchangeState::ResponseReceived);
    }

    #[test]
    fn test_conflicting_statuses_resolve_the_same_in_any_order() {
        let wire = LifecycleEvent::new(
            "1",
            Phase::ResponseHeadersExtra,
            at(1),
            EventFields {
                status: Some(304),
                ..Default::default()
            },
        );
        let cached = LifecycleEvent::new(
            "1",
            Phase::ResponseReceived,
            at(1),
            EventFields {
                status: Some(200),
                status_text: Some("OK".to_string()),
                ..Default::default()
            },
        );

        let mut first = Correlator::with_defaults();
        first.ingest(start("1", "GET", "https://x.com/a", 0));
        first.ingest(cached.clone());
        first.ingest(wire.clone());

        let mut second = Correlator::with_defaults();
        second.ingest(start("1", "GET", "https://x.com/a", 0));
        second.ingest(wire);
        second.ingest(cached);

        let id = ExchangeId::new("1");
        let (a, b) = (first.get(&id).unwrap(), second.get(&id).unwrap());
        assert_eq!(a, b);
        assert_eq!(a.effective_status(), Some(304));
        assert_eq!(a.status_text.as_deref(), Some("OK"));

        let done = first.ingest(body("1", "{}", 2));
        assert_eq!(done[0].exchange.effective_status(), Some(304));
    }

    #[test]
    fn test_orphan_enrichment_is_synthesized() {
        let mut c = Correlator::with_defaults();
        let orphan = LifecycleEvent::new(
            "9",
            Phase::ResponseReceived,
            at(0),
            EventFields {
                url: Some("https://x.com/api/items/5".to_string()),
                status: Some(404),
                ..Default::default()
            },
        );
        assert!(c.ingest(orphan).is_empty());
        let exchange = c.get(&ExchangeId::new("9")).unwrap();
        assert!(exchange.synthetic);
        assert_eq!(exchange.status, Some(404));

        let done = c.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key.method, UNKNOWN_METHOD);
        assert!(done[0].partial);
    }

    #[test]
    fn test_late_start_upgrades_synthetic_exchange() {
        let mut c = Correlator::with_defaults();
        c.ingest(response("2", 201, 1));
        c.ingest(start("2", "POST", "https://x.com/api/items", 0));
        let exchange = c.get(&ExchangeId::new("2")).unwrap();
        assert!(!exchange.synthetic);
        assert_eq!(exchange.method.as_deref(), Some("POST"));
        assert_eq!(exchange.status, Some(201));
        assert_eq!(exchange.first_seen_at, at(0));
    }

    #[test]
    fn test_unparseable_start_is_dropped() {
        let mut c = Correlator::with_defaults();
        assert!(c.ingest(start("1", "GET", "::not a url::", 0)).is_empty());
        assert_eq!(c.in_flight_len(), 0);
    }

    #[test]
    fn test_sweep_abandons_idle_exchanges() {
        let mut c = Correlator::with_defaults();
        c.ingest(start("1", "GET", "https://x.com/a/1", 0));
        c.ingest(start("2", "GET", "https://x.com/b/2", 10));
        assert!(c.sweep(at(14)).is_empty());

        let done = c.sweep(at(15));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].exchange.id.as_str(), "1");
        assert_eq!(done[0].exchange.state, ExchangeState::Abandoned);
        assert!(done[0].partial);
        assert!(done[0].response_sample.is_none());
        assert_eq!(c.in_flight_len(), 1);
    }

    #[test]
    fn test_filtered_exchange_swallows_its_events() {
        let config = CaptureConfig::default();
        let mut c = Correlator::new(&config, Box::new(|u: &Url| u.host_str() == Some("x.com")));
        assert!(c.ingest(start("1", "GET", "https://cdn.other.net/a.json", 0)).is_empty());
        assert!(c.ingest(response("1", 200, 1)).is_empty());
        assert!(c.ingest(body("1", "{}", 2)).is_empty());
        assert_eq!(c.in_flight_len(), 0);
        assert!(c.drain().is_empty());
    }

    #[test]
    fn test_reused_id_finalizes_previous_lifecycle() {
        let mut c = Correlator::with_defaults();
        c.ingest(start("1", "GET", "https://x.com/old", 0));
        c.ingest(response("1", 302, 1));
        let done = c.ingest(start("1", "GET", "https://x.com/new", 2));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].key.template, "https://x.com/old");
        assert_eq!(done[0].exchange.status, Some(302));
        let current = c.get(&ExchangeId::new("1")).unwrap();
        assert_eq!(current.url.as_ref().map(|u| u.path()), Some("/new"));
        assert_eq!(current.status, None);
    }

    #[test]
    fn test_loading_failed_finalizes_as_partial() {
        let mut c = Correlator::with_defaults();
        c.ingest(start("1", "GET", "https://x.com/a", 0));
        let failed = LifecycleEvent::new(
            "1",
            Phase::LoadingFailed,
            at(1),
            EventFields {
                error_text: Some("net::ERR_ABORTED".to_string()),
                ..Default::default()
            },
        );
        let done = c.ingest(failed);
        assert_eq!(done.len(), 1);
        assert!(done[0].partial);
        assert_eq!(done[0].exchange.error_text.as_deref(), Some("net::ERR_ABORTED"));
    }

    #[test]
    fn test_non_json_body_is_kept_as_text() {
        let mut c = Correlator::with_defaults();
        c.ingest(start("1", "GET", "https://x.com/page", 0));
        let done = c.ingest(body("1", "<html>hello</html>", 1));
        assert_eq!(done[0].response_sample, Some(json!("<html>hello</html>")));
        assert!(!done[0].partial);
    }

    #[test]
    fn test_body_without_url_is_not_cataloged() {
        let mut c = Correlator::with_defaults();
        assert!(c.ingest(body("404", "{}", 0)).is_empty());
        assert_eq!(c.in_flight_len(), 0);
    }
}
