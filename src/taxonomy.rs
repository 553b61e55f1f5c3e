use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_CATEGORY;
use crate::error::{CaptureError, Result};

/// Serializable form of a taxonomy rule, as written in the config file.
/// Every condition that is present must hold for the rule to match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaxonomyRuleConfig {
    pub category: String,
    #[serde(default)]
    pub host_contains: Option<String>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub path_contains: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
}

/// Predicate over `(host, path)`
#[derive(Debug, Clone, Default)]
pub struct Matcher {
    host_contains: Option<String>,
    path_prefix: Option<String>,
    path_contains: Option<String>,
    path_regex: Option<Regex>,
}

impl Matcher {
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let lowered = path.to_ascii_lowercase();
        self.host_contains.as_deref().map_or(true, |h| host.contains(h))
            && self.path_prefix.as_deref().map_or(true, |p| lowered.starts_with(p))
            && self.path_contains.as_deref().map_or(true, |p| lowered.contains(p))
            && self.path_regex.as_ref().map_or(true, |re| re.is_match(path))
    }
}

#[derive(Debug, Clone)]
pub struct TaxonomyRule {
    pub matcher: Matcher,
    pub category: String,
}

impl TaxonomyRule {
    pub fn compile(config: &TaxonomyRuleConfig) -> Result<Self> {
        if config.category.trim().is_empty() {
            return Err(CaptureError::Config(
                "taxonomy rule has an empty category".to_string(),
            ));
        }
        let path_regex = config
            .path_regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| CaptureError::InvalidPattern {
                    pattern: pattern.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            matcher: Matcher {
                host_contains: config.host_contains.as_ref().map(|s| s.to_ascii_lowercase()),
                path_prefix: config.path_prefix.as_ref().map(|s| s.to_ascii_lowercase()),
                path_contains: config.path_contains.as_ref().map(|s| s.to_ascii_lowercase()),
                path_regex,
            },
            category: config.category.clone(),
        })
    }
}

fn rule(category: &str, path_regex: &str) -> TaxonomyRuleConfig {
    TaxonomyRuleConfig {
        category: category.to_string(),
        path_regex: Some(path_regex.to_string()),
        ..Default::default()
    }
}

/// Built-in rule table, used when the config does not supply one
pub fn default_rules() -> Vec<TaxonomyRuleConfig> {
    vec![
        rule("graphql", r"(?i)graphql"),
        rule(
            "auth",
            r"(?i)/(auth|login|logout|oauth2?|signin|signup|session|token|sso|two_factor|password)(/|$|_|-)",
        ),
        rule(
            "telemetry",
            r"(?i)/(analytics|telemetry|logging|log_event|collect|track|beacon|metrics|events?_batch)(/|$)",
        ),
        rule("search", r"(?i)/(search|typeahead|autocomplete|query)(/|$)"),
        rule("messaging", r"(?i)/(direct|direct_v2|inbox|messages?|threads?|chat)(/|$)"),
        rule("feed", r"(?i)/(feed|timeline|home|stream|discover|explore)(/|$)"),
        rule(
            "media",
            r"(?i)/(media|medias|images?|videos?|photos?|upload|reels?|stories|clips)(/|$)",
        ),
        rule(
            "user",
            r"(?i)/(users?|profiles?|accounts?|friendships?|followers|following|me)(/|$)",
        ),
        rule("commerce", r"(?i)/(cart|checkout|orders?|payments?|billing|shop)(/|$)"),
        rule("settings", r"(?i)/(settings|preferences|config)(/|$)"),
        TaxonomyRuleConfig {
            category: "api".to_string(),
            path_prefix: Some("/api".to_string()),
            ..Default::default()
        },
    ]
}

/// Ordered first-match classifier over `(host, path)`
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<TaxonomyRule>,
}

impl Classifier {
    pub fn new(rules: Vec<TaxonomyRule>) -> Self {
        Self { rules }
    }

    pub fn from_config(rules: &[TaxonomyRuleConfig]) -> Result<Self> {
        let compiled = rules
            .iter()
            .map(TaxonomyRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(compiled))
    }

    pub fn with_default_rules() -> Self {
        // The built-in table is static and always compiles
        Self::from_config(&default_rules()).unwrap_or_else(|_| Self::new(Vec::new()))
    }

    pub fn classify(&self, host: &str, path: &str) -> String {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(host, path))
            .map(|rule| rule.category.clone())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}
