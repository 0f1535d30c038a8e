//! Rate-limit rules loaded from a YAML or JSON policy file.
//!
//! ```yaml
//! rate_limits:
//!   default: { max_calls: 120, window_seconds: 60 }
//!   tools:
//!     execute_transfer: { max_calls: 5, window_seconds: 60 }
//! ```

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

const RULE_DEFAULT_MAX_CALLS: i64 = 60;
const RULE_DEFAULT_WINDOW_SECONDS: u64 = 60;

/// At most `max_calls` per agent in any trailing `window_seconds`.
/// Zero or negative `max_calls` disables the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(default = "default_max_calls")]
    pub max_calls: i64,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_max_calls() -> i64 {
    RULE_DEFAULT_MAX_CALLS
}

fn default_window_seconds() -> u64 {
    RULE_DEFAULT_WINDOW_SECONDS
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            max_calls: RULE_DEFAULT_MAX_CALLS,
            window_seconds: RULE_DEFAULT_WINDOW_SECONDS,
        }
    }
}

impl RateLimitRule {
    pub fn is_unlimited(&self) -> bool {
        self.max_calls <= 0
    }

    /// Oldest event time that still counts against the rule at `now`.
    /// Windows reaching past the epoch count every recorded event.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.window_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|window| now.checked_sub_signed(window))
            .filter(|start| *start > DateTime::UNIX_EPOCH)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyConfig {
    pub default_rate_limit: RateLimitRule,
    pub tool_overrides: BTreeMap<String, RateLimitRule>,
}

/// Used when no policy file exists
impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_rate_limit: RateLimitRule {
                max_calls: 120,
                window_seconds: 60,
            },
            tool_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rate_limits: Option<RateLimitsSection>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitsSection {
    #[serde(default)]
    default: Option<RateLimitRule>,
    #[serde(default)]
    tools: Option<BTreeMap<String, RateLimitRule>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFormat {
    Yaml,
    Json,
}

impl PolicyFormat {
    /// `.json` is JSON, everything else is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => PolicyFormat::Json,
            _ => PolicyFormat::Yaml,
        }
    }
}

impl PolicyConfig {
    pub fn parse(contents: &str, format: PolicyFormat) -> Result<Self> {
        let file: PolicyFile = match format {
            PolicyFormat::Json => serde_json::from_str(contents)?,
            PolicyFormat::Yaml => {
                if contents.trim().is_empty() {
                    PolicyFile::default()
                } else {
                    serde_yaml::from_str(contents)
                        .map_err(|e| Error::Config(format!("invalid policy YAML: {}", e)))?
                }
            }
        };

        let section = file.rate_limits.unwrap_or_default();
        let mut tool_overrides = BTreeMap::new();
        for (tool, rule) in section.tools.unwrap_or_default() {
            if !is_valid_tool_name(&tool) {
                warn!(tool = %tool, "Invalid tool name in policy file; skipping rule");
                continue;
            }
            tool_overrides.insert(tool, rule);
        }

        Ok(Self {
            default_rate_limit: section.default.unwrap_or_default(),
            tool_overrides,
        })
    }

    /// Load from `path`. A missing file yields the built-in default.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No policy file, using default rate limit");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot read policy file {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        Self::parse(&contents, PolicyFormat::from_path(path))
    }

    pub fn rule_for(&self, tool_name: &str) -> RateLimitRule {
        self.tool_overrides
            .get(tool_name)
            .copied()
            .unwrap_or(self.default_rate_limit)
    }
}

pub(crate) fn is_valid_tool_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    name.bytes()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == b'_')
}
