//! Capture metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the binary installs a recorder; without one
//! every call below is a no-op.

use std::fmt;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    EventsIngested,
    EventsDropped,
    OrphanEventsSynthesized,
    ExchangesFinalized,
    ExchangesAbandoned,
    ExchangesFiltered,
    ExchangesUncataloged,
    EndpointsCreated,
    CredentialsExtracted,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::EventsIngested => "endpoint_mapper_events_ingested_total",
            MetricName::EventsDropped => "endpoint_mapper_events_dropped_total",
            MetricName::OrphanEventsSynthesized => "endpoint_mapper_orphan_events_synthesized_total",
            MetricName::ExchangesFinalized => "endpoint_mapper_exchanges_finalized_total",
            MetricName::ExchangesAbandoned => "endpoint_mapper_exchanges_abandoned_total",
            MetricName::ExchangesFiltered => "endpoint_mapper_exchanges_filtered_total",
            MetricName::ExchangesUncataloged => "endpoint_mapper_exchanges_uncataloged_total",
            MetricName::EndpointsCreated => "endpoint_mapper_endpoints_created_total",
            MetricName::CredentialsExtracted => "endpoint_mapper_credentials_extracted_total",
        }
    }

    pub fn all() -> impl Iterator<Item = MetricName> {
        [
            MetricName::EventsIngested,
            MetricName::EventsDropped,
            MetricName::OrphanEventsSynthesized,
            MetricName::ExchangesFinalized,
            MetricName::ExchangesAbandoned,
            MetricName::ExchangesFiltered,
            MetricName::ExchangesUncataloged,
            MetricName::EndpointsCreated,
            MetricName::CredentialsExtracted,
        ]
        .into_iter()
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

pub fn increment(name: MetricName) {
    ::metrics::counter!(name.as_str()).increment(1);
}

pub fn increment_by(name: MetricName, value: u64) {
    ::metrics::counter!(name.as_str()).increment(value);
}

/// Install the Prometheus exporter on `0.0.0.0:port`.
pub fn init_metrics(port: u16) {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(addr);
    match builder.install() {
        Ok(()) => {
            tracing::info!("Prometheus exporter listening on http://{}/metrics", addr);
        }
        Err(e) => {
            tracing::warn!("Prometheus exporter install failed: {}", e);
        }
    }
}
