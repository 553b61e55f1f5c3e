use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::constants::{
    DEFAULT_IDLE_WINDOW_MS, DEFAULT_IGNORE_EXTENSIONS, DEFAULT_MAX_EXAMPLES, DEFAULT_MAX_SAMPLES,
    DEFAULT_MAX_WALK_DEPTH, DEFAULT_REDACTION_AFFIX, DEFAULT_REDACTION_THRESHOLD,
};
use crate::error::{CaptureError, Result};
use crate::taxonomy::{default_rules, TaxonomyRuleConfig};

/// Default body size kept per sample before truncation.
const DEFAULT_MAX_SAMPLE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub idle_window_ms: u64,
    pub max_examples: usize,
    pub max_samples: usize,
    pub max_sample_bytes: usize,
    pub redaction_threshold: usize,
    pub redaction_affix: usize,
    pub max_walk_depth: usize,
    /// Hosts under audit; empty accepts every host.
    pub target_hosts: Vec<String>,
    pub ignore_extensions: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub taxonomy: Vec<TaxonomyRuleConfig>,
    pub budget: BudgetConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_events: Option<u64>,
    pub max_duration_secs: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            idle_window_ms: DEFAULT_IDLE_WINDOW_MS,
            max_examples: DEFAULT_MAX_EXAMPLES,
            max_samples: DEFAULT_MAX_SAMPLES,
            max_sample_bytes: DEFAULT_MAX_SAMPLE_BYTES,
            redaction_threshold: DEFAULT_REDACTION_THRESHOLD,
            redaction_affix: DEFAULT_REDACTION_AFFIX,
            max_walk_depth: DEFAULT_MAX_WALK_DEPTH,
            target_hosts: Vec::new(),
            ignore_extensions: DEFAULT_IGNORE_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignore_patterns: Vec::new(),
            taxonomy: default_rules(),
            budget: BudgetConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            CaptureError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CaptureConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_examples == 0 {
            return Err(CaptureError::Config("max_examples must be at least 1".to_string()));
        }
        if self.max_samples == 0 {
            return Err(CaptureError::Config("max_samples must be at least 1".to_string()));
        }
        if self.idle_window_ms == 0 {
            return Err(CaptureError::Config("idle_window_ms must be positive".to_string()));
        }
        for pattern in &self.ignore_patterns {
            regex::Regex::new(pattern).map_err(|e| CaptureError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }
        crate::taxonomy::Classifier::from_config(&self.taxonomy)?;
        Ok(())
    }

    pub fn idle_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.idle_window_ms as i64)
    }
}
