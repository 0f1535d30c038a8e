//! RPC endpoint configuration
//!
//! Endpoints are collected from several sources and tried in this order:
//! 1. `WEB3_RPC_URL` - explicit endpoint, highest priority
//! 2. `ALCHEMY_HTTP_URL` - full Alchemy URL
//! 3. `ALCHEMY_API_KEY` (+ `ALCHEMY_NETWORK`, default `sepolia`) - builds the Alchemy URL
//! 4. `WEB3_RPC_FALLBACK_URLS` - comma separated alternates
//! 5. Public Sepolia RPC - for testing only
//!
//! # Examples
//!
//! ```bash
//! export WEB3_RPC_URL="https://eth-sepolia.g.alchemy.com/v2/YOUR_KEY"
//! export WEB3_RPC_FALLBACK_URLS="https://rpc.sepolia.org,https://sepolia.drpc.org"
//! export RPC_RETRY_ATTEMPTS=3
//! ```

use crate::rpc::RetryPolicy;
use std::time::Duration;

/// Environment variable names
mod env_vars {
    pub const WEB3_RPC_URL: &str = "WEB3_RPC_URL";
    pub const ALCHEMY_HTTP_URL: &str = "ALCHEMY_HTTP_URL";
    pub const ALCHEMY_API_KEY: &str = "ALCHEMY_API_KEY";
    pub const ALCHEMY_NETWORK: &str = "ALCHEMY_NETWORK";
    pub const WEB3_RPC_FALLBACK_URLS: &str = "WEB3_RPC_FALLBACK_URLS";

    pub const RPC_RETRY_ATTEMPTS: &str = "RPC_RETRY_ATTEMPTS";
    pub const RPC_BACKOFF_BASE_MS: &str = "RPC_BACKOFF_BASE_MS";
    pub const RPC_BACKOFF_MAX_MS: &str = "RPC_BACKOFF_MAX_MS";
    pub const RECEIPT_TIMEOUT_SECONDS: &str = "RECEIPT_TIMEOUT_SECONDS";
}

/// Public RPC endpoint (rate limited, for testing only)
pub const PUBLIC_SEPOLIA_RPC: &str = "https://ethereum-sepolia.publicnode.com";

const DEFAULT_ALCHEMY_NETWORK: &str = "sepolia";
const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 120;

/// Ordered, deduplicated endpoint list plus retry tuning
#[derive(Debug, Clone)]
pub struct RpcConfig {
    urls: Vec<String>,
    pub retry: RetryPolicy,
    pub receipt_timeout: Duration,
}

impl RpcConfig {
    /// Create RPC config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut candidates = Vec::new();

        if let Some(url) = var(env_vars::WEB3_RPC_URL) {
            tracing::debug!("Using WEB3_RPC_URL");
            candidates.push(url);
        }
        if let Some(url) = var(env_vars::ALCHEMY_HTTP_URL) {
            tracing::debug!("Using ALCHEMY_HTTP_URL");
            candidates.push(url);
        }
        if let Some(key) = var(env_vars::ALCHEMY_API_KEY) {
            let network = var(env_vars::ALCHEMY_NETWORK)
                .unwrap_or_else(|| DEFAULT_ALCHEMY_NETWORK.to_string());
            tracing::debug!(network = %network, "Building RPC URL from ALCHEMY_API_KEY");
            candidates.push(format!("https://eth-{}.g.alchemy.com/v2/{}", network, key));
        }
        if let Some(list) = var(env_vars::WEB3_RPC_FALLBACK_URLS) {
            candidates.extend(list.split(',').map(str::to_string));
        }
        if candidates.is_empty() {
            tracing::warn!("No RPC configured, using public Sepolia RPC (rate limited)");
        }
        candidates.push(PUBLIC_SEPOLIA_RPC.to_string());

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            attempts: parse_or(var(env_vars::RPC_RETRY_ATTEMPTS), defaults.attempts).max(1),
            base_delay: var(env_vars::RPC_BACKOFF_BASE_MS)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: var(env_vars::RPC_BACKOFF_MAX_MS)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        };
        let receipt_timeout = Duration::from_secs(parse_or(
            var(env_vars::RECEIPT_TIMEOUT_SECONDS),
            DEFAULT_RECEIPT_TIMEOUT_SECS,
        ));

        Self {
            urls: dedupe(candidates),
            retry,
            receipt_timeout,
        }
    }

    /// Create with explicit RPC URLs
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: dedupe(urls.into_iter().map(Into::into)),
            retry: RetryPolicy::default(),
            receipt_timeout: Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
        }
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// The endpoint tried first
    pub fn primary(&self) -> Option<&str> {
        self.urls.first().map(|s| s.as_str())
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Drop blanks and repeats, keeping first-seen order.
fn dedupe<I: IntoIterator<Item = String>>(urls: I) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for url in urls {
        let url = url.trim().trim_end_matches('/').to_string();
        if !url.is_empty() && !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_public_rpc_fallback_when_nothing_configured() {
        let config = RpcConfig::from_lookup(lookup(&[]));
        assert_eq!(config.urls(), &[PUBLIC_SEPOLIA_RPC.to_string()]);
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.receipt_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_priority_order_and_dedupe() {
        let config = RpcConfig::from_lookup(lookup(&[
            ("WEB3_RPC_URL", "https://primary.rpc/"),
            ("ALCHEMY_API_KEY", "abc"),
            (
                "WEB3_RPC_FALLBACK_URLS",
                "https://backup.rpc, https://primary.rpc,,https://ethereum-sepolia.publicnode.com",
            ),
        ]));

        assert_eq!(
            config.urls(),
            &[
                "https://primary.rpc".to_string(),
                "https://eth-sepolia.g.alchemy.com/v2/abc".to_string(),
                "https://backup.rpc".to_string(),
                PUBLIC_SEPOLIA_RPC.to_string(),
            ]
        );
        assert_eq!(config.primary(), Some("https://primary.rpc"));
    }

    #[test]
    fn test_alchemy_network_override() {
        let config = RpcConfig::from_lookup(lookup(&[
            ("ALCHEMY_API_KEY", "k"),
            ("ALCHEMY_NETWORK", "mainnet"),
        ]));
        assert_eq!(config.primary(), Some("https://eth-mainnet.g.alchemy.com/v2/k"));
    }

    #[test]
    fn test_retry_tuning_from_env() {
        let config = RpcConfig::from_lookup(lookup(&[
            ("RPC_RETRY_ATTEMPTS", "0"),
            ("RPC_BACKOFF_BASE_MS", "10"),
            ("RPC_BACKOFF_MAX_MS", "not-a-number"),
            ("RECEIPT_TIMEOUT_SECONDS", "30"),
        ]));
        assert_eq!(config.retry.attempts, 1);
        assert_eq!(config.retry.base_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_delay, Duration::from_secs(2));
        assert_eq!(config.receipt_timeout, Duration::from_secs(30));
    }
}
