use regex::Regex;
use url::Url;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};

/// Decides whether traffic to a URL belongs in the catalog.
pub trait TrafficFilter: Send + Sync {
    fn accept(&self, url: &Url) -> bool;
}

impl<F> TrafficFilter for F
where
    F: Fn(&Url) -> bool + Send + Sync,
{
    fn accept(&self, url: &Url) -> bool {
        self(url)
    }
}

/// Accepts every URL
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TrafficFilter for AcceptAll {
    fn accept(&self, _url: &Url) -> bool {
        true
    }
}

/// Keeps traffic for the audited hosts and drops static assets
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    target_hosts: Vec<String>,
    ignore_extensions: Vec<String>,
    ignore_patterns: Vec<Regex>,
}

impl TargetFilter {
    pub fn new(target_hosts: Vec<String>, ignore_extensions: Vec<String>) -> Self {
        Self {
            target_hosts: target_hosts
                .into_iter()
                .map(|h| h.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            ignore_extensions: ignore_extensions
                .into_iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            ignore_patterns: Vec::new(),
        }
    }

    pub fn with_ignore_patterns(mut self, patterns: &[String]) -> Result<Self> {
        for pattern in patterns {
            let re = Regex::new(pattern).map_err(|e| CaptureError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            self.ignore_patterns.push(re);
        }
        Ok(self)
    }

    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        Self::new(config.target_hosts.clone(), config.ignore_extensions.clone())
            .with_ignore_patterns(&config.ignore_patterns)
    }

    fn host_in_scope(&self, host: &str) -> bool {
        if self.target_hosts.is_empty() {
            return true;
        }
        self.target_hosts
            .iter()
            .any(|target| host == target || host.ends_with(&format!(".{}", target)))
    }

    fn is_static_asset(&self, path: &str) -> bool {
        let path = path.to_ascii_lowercase();
        self.ignore_extensions.iter().any(|ext| path.ends_with(ext.as_str()))
    }
}

impl TrafficFilter for TargetFilter {
    fn accept(&self, url: &Url) -> bool {
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if !self.host_in_scope(&host.to_ascii_lowercase()) {
            return false;
        }
        if self.is_static_asset(url.path()) {
            return false;
        }
        !self.ignore_patterns.iter().any(|re| re.is_match(url.as_str()))
    }
}
