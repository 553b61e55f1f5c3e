use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::constants::{DEFAULT_MAX_EXAMPLES, DEFAULT_MAX_SAMPLES};
use crate::error::Result;
use crate::metrics::{self, MetricName};
use crate::types::{CanonicalKey, CredentialFragment, FinalizedExchange};

/// Aggregate of every exchange that mapped to one canonical key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointRecord {
    pub method: String,
    pub template: String,
    /// Assigned on first insert and never recomputed.
    pub category: String,
    pub examples: Vec<String>,
    pub request_samples: Vec<Value>,
    pub response_samples: Vec<Value>,
    pub credentials: Vec<CredentialFragment>,
    pub status_codes: BTreeSet<u16>,
    pub hit_count: u64,
    /// Exchanges that were finalized without a body.
    pub partial_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl EndpointRecord {
    fn new(key: &CanonicalKey, category: &str, seen: DateTime<Utc>) -> Self {
        Self {
            method: key.method.clone(),
            template: key.template.clone(),
            category: category.to_string(),
            examples: Vec::new(),
            request_samples: Vec::new(),
            response_samples: Vec::new(),
            credentials: Vec::new(),
            status_codes: BTreeSet::new(),
            hit_count: 0,
            partial_count: 0,
            first_seen: seen,
            last_seen: seen,
        }
    }

    /// Every observation of this endpoint lacked a complete response.
    pub fn is_degraded(&self) -> bool {
        self.hit_count > 0 && self.partial_count == self.hit_count
    }

    fn merge_credential(&mut self, fragment: &CredentialFragment) {
        match self
            .credentials
            .iter_mut()
            .find(|existing| existing.identity() == fragment.identity())
        {
            Some(existing) => existing.redacted_value = fragment.redacted_value.clone(),
            None => self.credentials.push(fragment.clone()),
        }
    }
}

/// Deduplicated endpoint store. Safe to share between workers: one mutex
/// serializes the read-modify-write of every record.
#[derive(Debug)]
pub struct EndpointCatalog {
    records: Mutex<HashMap<CanonicalKey, EndpointRecord>>,
    max_examples: usize,
    max_samples: usize,
}

impl Default for EndpointCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXAMPLES, DEFAULT_MAX_SAMPLES)
    }
}

impl EndpointCatalog {
    pub fn new(max_examples: usize, max_samples: usize) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_examples,
            max_samples,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.max_examples, config.max_samples)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CanonicalKey, EndpointRecord>> {
        // A poisoned map is still structurally valid; keep serving it
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fold one finalized exchange into its endpoint. `category` is only used
    /// when the key is seen for the first time. Returns true if a record was created.
    pub fn record(&self, finalized: &FinalizedExchange, category: &str) -> bool {
        let seen = finalized.exchange.first_seen_at;
        let mut records = self.lock();

        let created = !records.contains_key(&finalized.key);
        let record = records
            .entry(finalized.key.clone())
            .or_insert_with(|| EndpointRecord::new(&finalized.key, category, seen));

        if created {
            info!(
                endpoint = %finalized.key,
                category = %record.category,
                "new endpoint cataloged"
            );
            metrics::increment(MetricName::EndpointsCreated);
        }

        record.hit_count += 1;
        if finalized.partial {
            record.partial_count += 1;
        }
        if seen < record.first_seen {
            record.first_seen = seen;
        }
        let last = finalized.exchange.last_updated_at;
        if last > record.last_seen {
            record.last_seen = last;
        }
        if let Some(status) = finalized.exchange.effective_status() {
            record.status_codes.insert(status);
        }

        if record.examples.len() < self.max_examples
            && !record.examples.contains(&finalized.example_url)
        {
            record.examples.push(finalized.example_url.clone());
        }

        // Oldest samples are retained; later ones are dropped once full
        if let Some(sample) = &finalized.request_sample {
            push_sample(&mut record.request_samples, sample, self.max_samples);
        }
        if let Some(sample) = &finalized.response_sample {
            push_sample(&mut record.response_samples, sample, self.max_samples);
        }

        for fragment in &finalized.credentials {
            record.merge_credential(fragment);
        }

        debug!(
            endpoint = %finalized.key,
            hits = record.hit_count,
            examples = record.examples.len(),
            "endpoint updated"
        );
        created
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<EndpointRecord> {
        self.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// All records, sorted by template then method.
    pub fn list(&self) -> Vec<EndpointRecord> {
        let mut records: Vec<EndpointRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| {
            a.template
                .cmp(&b.template)
                .then_with(|| a.method.cmp(&b.method))
        });
        records
    }

    /// Number of endpoints per category.
    pub fn category_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.lock().values() {
            *counts.entry(record.category.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.list())?)
    }
}

fn push_sample(samples: &mut Vec<Value>, sample: &Value, cap: usize) {
    if samples.len() < cap && !samples.contains(sample) {
        samples.push(sample.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CredentialSource, Exchange, ExchangeId};
    use chrono::TimeZone;
    use serde_json::json;

    fn finalized(url: &str, template: &str, secs: i64) -> FinalizedExchange {
        let at = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
        let mut exchange = Exchange::new(ExchangeId::new(secs.to_string()), at);
        exchange.status = Some(200);
        FinalizedExchange {
            exchange,
            key: CanonicalKey::new("GET", template),
            example_url: url.to_string(),
            request_sample: None,
            response_sample: Some(json!({"n": secs})),
            credentials: Vec::new(),
            partial: false,
        }
    }

    #[test]
    fn test_first_category_wins() {
        let catalog = EndpointCatalog::default();
        let t = "https://x.com/api/users/{id}";
        assert!(catalog.record(&finalized("https://x.com/api/users/1", t, 0), "user"));
        assert!(!catalog.record(&finalized("https://x.com/api/users/2", t, 1), "other"));

        let record = catalog.get(&CanonicalKey::new("GET", t)).unwrap();
        assert_eq!(record.category, "user");
        assert_eq!(record.hit_count, 2);
        assert_eq!(record.examples.len(), 2);
    }

    #[test]
    fn test_examples_and_samples_are_bounded() {
        let catalog = EndpointCatalog::new(3, 2);
        let t = "https://x.com/api/users/{id}";
        for i in 0..10 {
            catalog.record(&finalized(&format!("https://x.com/api/users/{}", i), t, i), "user");
        }
        let record = catalog.get(&CanonicalKey::new("GET", t)).unwrap();
        assert_eq!(record.examples.len(), 3);
        assert_eq!(record.examples[0], "https://x.com/api/users/0");
        assert_eq!(record.response_samples, vec![json!({"n": 0}), json!({"n": 1})]);
        assert_eq!(record.hit_count, 10);
    }

    #[test]
    fn test_duplicate_examples_are_not_repeated() {
        let catalog = EndpointCatalog::default();
        let t = "https://x.com/a";
        catalog.record(&finalized("https://x.com/a", t, 0), "other");
        catalog.record(&finalized("https://x.com/a", t, 0), "other");
        let record = catalog.get(&CanonicalKey::new("GET", t)).unwrap();
        assert_eq!(record.examples.len(), 1);
        assert_eq!(record.response_samples.len(), 1);
    }

    #[test]
    fn test_credentials_keep_latest_value_per_path() {
        let catalog = EndpointCatalog::default();
        let t = "https://x.com/a";
        let mut first = finalized("https://x.com/a", t, 0);
        first.credentials = vec![CredentialFragment {
            source: CredentialSource::Header,
            path: "authorization".to_string(),
            redacted_value: "old".to_string(),
        }];
        let mut second = finalized("https://x.com/a", t, 1);
        second.credentials = vec![
            CredentialFragment {
                source: CredentialSource::Header,
                path: "authorization".to_string(),
                redacted_value: "new".to_string(),
            },
            CredentialFragment {
                source: CredentialSource::Response,
                path: "authorization".to_string(),
                redacted_value: "body".to_string(),
            },
        ];
        catalog.record(&first, "other");
        catalog.record(&second, "other");

        let record = catalog.get(&CanonicalKey::new("GET", t)).unwrap();
        assert_eq!(record.credentials.len(), 2);
        assert_eq!(record.credentials[0].redacted_value, "new");
    }

    #[test]
    fn test_partial_exchanges_mark_degraded() {
        let catalog = EndpointCatalog::default();
        let t = "https://x.com/slow";
        let mut partial = finalized("https://x.com/slow", t, 0);
        partial.partial = true;
        partial.response_sample = None;
        catalog.record(&partial, "other");
        let record = catalog.get(&CanonicalKey::new("GET", t)).unwrap();
        assert!(record.is_degraded());
        assert!(record.response_samples.is_empty());

        catalog.record(&finalized("https://x.com/slow", t, 5), "other");
        assert!(!catalog.get(&CanonicalKey::new("GET", t)).unwrap().is_degraded());
    }

    #[test]
    fn test_category_counts_and_listing() {
        let catalog = EndpointCatalog::default();
        catalog.record(&finalized("https://x.com/b", "https://x.com/b", 0), "feed");
        catalog.record(&finalized("https://x.com/a", "https://x.com/a", 0), "feed");
        catalog.record(&finalized("https://x.com/c", "https://x.com/c", 0), "user");

        let counts = catalog.category_counts();
        assert_eq!(counts.get("feed"), Some(&2));
        assert_eq!(counts.get("user"), Some(&1));

        let templates: Vec<String> = catalog.list().into_iter().map(|r| r.template).collect();
        assert_eq!(templates, vec!["https://x.com/a", "https://x.com/b", "https://x.com/c"]);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let catalog = EndpointCatalog::default();
        catalog.record(&finalized("https://x.com/a", "https://x.com/a", 0), "other");
        let json: Value = serde_json::from_str(&catalog.to_json().unwrap()).unwrap();
        let first = &json[0];
        assert_eq!(first["method"], "GET");
        assert!(first["requestSamples"].is_array());
        assert!(first["responseSamples"].is_array());
        assert_eq!(first["statusCodes"], json!([200]));
    }
}
