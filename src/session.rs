//! A capture session owns every piece of mutable capture state: the in-flight
//! exchange table, the catalog and the classifier. It starts empty, is fed
//! events one at a time, and on teardown force-finalizes whatever is still in
//! flight so that a cancelled session still yields a usable catalog.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::{Instant, Interval};
use tracing::{info, warn};
use url::Url;

use crate::catalog::EndpointCatalog;
use crate::config::CaptureConfig;
use crate::correlator::Correlator;
use crate::error::{CaptureError, Result};
use crate::filter::{TargetFilter, TrafficFilter};
use crate::source::EventSource;
use crate::taxonomy::Classifier;
use crate::templater::UrlTemplater;
use crate::types::{CanonicalKey, FinalizedExchange, LifecycleEvent};

/// Limits on a `run`; all optional.
#[derive(Debug, Clone, Default)]
pub struct SessionBudget {
    pub max_events: Option<u64>,
    pub max_duration: Option<Duration>,
    /// Wall-clock idle sweep for live sources. Replays rely on event time instead.
    pub sweep_interval: Option<Duration>,
}

impl SessionBudget {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_events: config.budget.max_events,
            max_duration: config.budget.max_duration_secs.map(Duration::from_secs),
            sweep_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    SourceExhausted,
    EventBudget,
    DurationBudget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub events_ingested: u64,
    pub exchanges_recorded: u64,
    pub partial_exchanges: u64,
    pub endpoints: usize,
    pub stop_reason: StopReason,
}

pub struct CaptureSession {
    correlator: Correlator,
    catalog: Arc<EndpointCatalog>,
    classifier: Classifier,
    templater: UrlTemplater,
    events_ingested: u64,
    exchanges_recorded: u64,
    partial_exchanges: u64,
}

impl CaptureSession {
    pub fn new(config: &CaptureConfig, filter: Box<dyn TrafficFilter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            correlator: Correlator::new(config, filter),
            catalog: Arc::new(EndpointCatalog::from_config(config)),
            classifier: Classifier::from_config(&config.taxonomy)?,
            templater: UrlTemplater::new(),
            events_ingested: 0,
            exchanges_recorded: 0,
            partial_exchanges: 0,
        })
    }

    /// Session filtered by the config's target hosts and ignore rules.
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        let filter = TargetFilter::from_config(config)?;
        Self::new(config, Box::new(filter))
    }

    /// Shared handle for readers while the session is still running.
    pub fn catalog(&self) -> Arc<EndpointCatalog> {
        Arc::clone(&self.catalog)
    }

    pub fn in_flight(&self) -> usize {
        self.correlator.in_flight_len()
    }

    pub fn events_ingested(&self) -> u64 {
        self.events_ingested
    }

    /// Feed one event. Never fails; bad events are logged and dropped.
    pub fn ingest(&mut self, event: LifecycleEvent) {
        self.events_ingested += 1;
        let now = event.timestamp;
        let mut finalized = self.correlator.ingest(event);
        finalized.extend(self.correlator.sweep(now));
        self.record_all(finalized);
    }

    /// Abandon exchanges idle past the window as of `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        let finalized = self.correlator.sweep(now);
        self.record_all(finalized);
    }

    /// Drain everything in flight and hand back the catalog.
    pub fn finish(mut self) -> Arc<EndpointCatalog> {
        self.drain();
        self.catalog
    }

    /// Pull events from `source` until it ends or the budget runs out, then drain.
    pub async fn run<S>(
        mut self,
        source: &mut S,
        budget: SessionBudget,
    ) -> (Arc<EndpointCatalog>, SessionSummary)
    where
        S: EventSource + ?Sized,
    {
        let deadline = budget.max_duration.map(|d| Instant::now() + d);
        let mut sweeper = budget.sweep_interval.map(tokio::time::interval);

        let stop_reason = loop {
            if budget
                .max_events
                .map_or(false, |max| self.events_ingested >= max)
            {
                break StopReason::EventBudget;
            }
            tokio::select! {
                next = source.next_event() => match next {
                    Some(event) => self.ingest(event),
                    None => break StopReason::SourceExhausted,
                },
                _ = wait_until(deadline) => break StopReason::DurationBudget,
                _ = next_tick(&mut sweeper) => self.tick(Utc::now()),
            }
        };

        self.drain();
        let summary = SessionSummary {
            events_ingested: self.events_ingested,
            exchanges_recorded: self.exchanges_recorded,
            partial_exchanges: self.partial_exchanges,
            endpoints: self.catalog.len(),
            stop_reason,
        };
        info!(
            events = summary.events_ingested,
            endpoints = summary.endpoints,
            partial = summary.partial_exchanges,
            reason = ?summary.stop_reason,
            "capture session finished"
        );
        (self.catalog, summary)
    }

    /// Canonical key for an arbitrary URL.
    pub fn template_url(&self, method: &str, url: &str) -> Result<CanonicalKey> {
        self.templater.template(method, url)
    }

    /// Category the session's taxonomy assigns to an arbitrary URL.
    pub fn classify_url(&self, url: &str) -> Result<String> {
        classify_with(&self.classifier, &self.templater, url)
    }

    fn drain(&mut self) {
        let remaining = self.correlator.in_flight_len();
        if remaining > 0 {
            warn!(remaining, "force-finalizing in-flight exchanges at session end");
        }
        let finalized = self.correlator.drain();
        self.record_all(finalized);
    }

    fn record_all(&mut self, finalized: Vec<FinalizedExchange>) {
        for exchange in finalized {
            let category = match &exchange.exchange.url {
                Some(url) => self.classifier.classify(
                    url.host_str().unwrap_or_default(),
                    &self.templater.template_path(url.path()),
                ),
                None => crate::constants::DEFAULT_CATEGORY.to_string(),
            };
            self.catalog.record(&exchange, &category);
            self.exchanges_recorded += 1;
            if exchange.partial {
                self.partial_exchanges += 1;
            }
        }
    }
}

/// Classify a URL string against a rule table, using its templated path.
pub fn classify_with(classifier: &Classifier, templater: &UrlTemplater, url: &str) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| CaptureError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    let host = parsed
        .host_str()
        .ok_or_else(|| CaptureError::MissingField(format!("host in {}", url)))?;
    Ok(classifier.classify(host, &templater.template_path(parsed.path())))
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
