//! Per-tool rate limiting and audit logging
//!
//! Every externally invokable operation runs through
//! [`PolicyEngine::run_with_policy`]: the call is checked against the rate
//! rule for its tool, executed, and recorded as an audit event whether it
//! succeeds or fails.

mod config;

pub use config::{PolicyConfig, PolicyFormat, RateLimitRule};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{EventRecord, EventStatus, NewEvent, Store, TenantId, ToolUsage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Response snapshots longer than this are cut
const MAX_RESPONSE_CHARS: usize = 1000;

pub const REDACTED: &str = "[REDACTED]";

type WindowKey = (TenantId, String, String);
type InFlight = Arc<StdMutex<HashMap<WindowKey, u64>>>;

/// Reservation against a rate window, held until the call is audited
#[derive(Debug)]
pub struct Permit {
    slot: Option<(InFlight, WindowKey)>,
}

impl Permit {
    fn unmetered() -> Self {
        Self { slot: None }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some((in_flight, key)) = self.slot.take() {
            let mut in_flight = in_flight.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(count) = in_flight.get_mut(&key) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    in_flight.remove(&key);
                }
            }
        }
    }
}

/// One audited invocation
#[derive(Debug, Clone)]
pub struct ToolCall<'a> {
    pub tenant: &'a TenantId,
    pub tool: &'static str,
    pub agent_id: Option<&'a str>,
    /// Request snapshot with secrets already removed
    pub request: Value,
    /// Store a placeholder instead of the response
    pub redact_response: bool,
}

impl<'a> ToolCall<'a> {
    pub fn new(tenant: &'a TenantId, tool: &'static str, agent_id: Option<&'a str>) -> Self {
        Self {
            tenant,
            tool,
            agent_id,
            request: Value::Null,
            redact_response: false,
        }
    }

    /// Attach the request, masking the named fields at any depth.
    pub fn request(mut self, mut request: Value, secret_fields: &[&str]) -> Self {
        redact(&mut request, secret_fields);
        self.request = request;
        self
    }

    pub fn redact_response(mut self) -> Self {
        self.redact_response = true;
        self
    }
}

/// Replace values of `fields` with a placeholder, recursively.
pub fn redact(value: &mut Value, fields: &[&str]) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if fields.contains(&key.as_str()) {
                    if !inner.is_null() {
                        *inner = Value::String(REDACTED.to_string());
                    }
                } else {
                    redact(inner, fields);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|item| redact(item, fields)),
        _ => {}
    }
}

fn truncate_response(response: Value) -> Value {
    let rendered = match &response {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if rendered.chars().count() <= MAX_RESPONSE_CHARS {
        return response;
    }
    let head: String = rendered.chars().take(MAX_RESPONSE_CHARS).collect();
    Value::String(format!("{}... [truncated]", head))
}

pub struct PolicyEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    config: RwLock<Arc<PolicyConfig>>,
    /// Serializes check-then-reserve
    gate: Mutex<()>,
    in_flight: InFlight,
    source: Option<PathBuf>,
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub fn new(store: Store, config: PolicyConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            config: RwLock::new(Arc::new(config)),
            gate: Mutex::new(()),
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            source: None,
        }
    }

    /// Load rules from `path` and remember it for [`reload`](Self::reload).
    pub async fn from_file(store: Store, path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self> {
        let config = PolicyConfig::load(&path).await?;
        let mut engine = Self::new(store, config, clock);
        engine.source = Some(path);
        Ok(engine)
    }

    pub async fn config(&self) -> Arc<PolicyConfig> {
        self.config.read().await.clone()
    }

    /// Swap in a new rule set as a unit.
    pub async fn replace_config(&self, config: PolicyConfig) {
        *self.config.write().await = Arc::new(config);
    }

    /// Re-read the policy file.
    pub async fn reload(&self) -> Result<Arc<PolicyConfig>> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| Error::Config("policy engine has no source file".to_string()))?;
        let config = Arc::new(PolicyConfig::load(path).await?);
        *self.config.write().await = config.clone();
        tracing::info!(
            path = %path.display(),
            overrides = config.tool_overrides.len(),
            "Policy reloaded"
        );
        Ok(config)
    }

    /// Check the rate rule for (`tool`, `agent_id`) and reserve a slot in its
    /// window. Calls without an agent are not metered.
    pub async fn enforce(
        &self,
        tenant: &TenantId,
        tool: &str,
        agent_id: Option<&str>,
    ) -> Result<Permit> {
        let Some(agent_id) = agent_id else {
            return Ok(Permit::unmetered());
        };
        let rule = self.config().await.rule_for(tool);
        if rule.is_unlimited() {
            return Ok(Permit::unmetered());
        }

        let _gate = self.gate.lock().await;
        let cutoff = rule.window_start(self.clock.now());
        let recorded = self
            .store
            .count_events_since(tenant, tool, agent_id, cutoff)
            .await?;

        let key = (tenant.clone(), tool.to_string(), agent_id.to_string());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        let pending = in_flight.get(&key).copied().unwrap_or(0);
        if recorded + pending >= rule.max_calls as u64 {
            tracing::warn!(
                tenant = %tenant,
                tool,
                agent_id,
                max_calls = rule.max_calls,
                window_seconds = rule.window_seconds,
                "Rate limit exceeded"
            );
            return Err(Error::RateLimit {
                tool: tool.to_string(),
                agent_id: agent_id.to_string(),
            });
        }
        *in_flight.entry(key.clone()).or_insert(0) += 1;
        Ok(Permit {
            slot: Some((self.in_flight.clone(), key)),
        })
    }

    /// Append an audit event.
    pub async fn record(&self, tenant: &TenantId, event: &NewEvent) -> Result<i64> {
        self.store.record_event(tenant, event, self.clock.now()).await
    }

    /// Enforce, run `operation`, and audit the outcome.
    ///
    /// A rate-limited call is rejected before `operation` runs and leaves no
    /// audit event. Failing to write the audit event is logged, the
    /// operation's own result is still returned.
    pub async fn run_with_policy<T, F, Fut>(&self, call: ToolCall<'_>, operation: F) -> Result<T>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.enforce(call.tenant, call.tool, call.agent_id).await?;
        let request = (!call.request.is_null()).then_some(call.request);

        let result = operation().await;
        let event = match &result {
            Ok(value) => {
                let response = if call.redact_response {
                    Value::String(REDACTED.to_string())
                } else {
                    serde_json::to_value(value)
                        .map(truncate_response)
                        .unwrap_or(Value::Null)
                };
                NewEvent {
                    tool_name: call.tool.to_string(),
                    agent_id: call.agent_id.map(str::to_string),
                    status: EventStatus::Ok,
                    request_payload: request,
                    response_payload: Some(response),
                    error_message: None,
                }
            }
            Err(e) => {
                tracing::debug!(tool = call.tool, kind = e.kind(), error = %e, "Tool call failed");
                NewEvent {
                    tool_name: call.tool.to_string(),
                    agent_id: call.agent_id.map(str::to_string),
                    status: EventStatus::Error,
                    request_payload: request,
                    response_payload: None,
                    error_message: Some(e.to_string()),
                }
            }
        };
        let audit = self.record(call.tenant, &event).await;
        drop(permit);

        if let Err(e) = audit {
            tracing::error!(tool = call.tool, error = %e, "Failed to write audit event");
        }
        result
    }

    /// Newest events first
    pub async fn recent_events(&self, tenant: &TenantId, limit: u32) -> Result<Vec<EventRecord>> {
        self.store.recent_events(tenant, limit).await
    }

    pub async fn usage_summary(&self, tenant: &TenantId, since: DateTime<Utc>) -> Result<Vec<ToolUsage>> {
        self.store.usage_summary(tenant, since).await
    }

    /// Poll the policy file's modification time and reload on change, until
    /// `shutdown` flips to `true`. A file that fails to parse keeps the
    /// previous rules in force.
    pub fn spawn_reloader(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let path = self.source.clone()?;
        Some(tokio::spawn(async move {
            let mut last_seen = modified_at(&path).await;
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let current = modified_at(&path).await;
                        if current == last_seen {
                            continue;
                        }
                        last_seen = current;
                        if let Err(e) = self.reload().await {
                            tracing::warn!(path = %path.display(), error = %e, "Policy reload failed, keeping previous rules");
                        }
                    }
                }
            }
        }))
    }
}

async fn modified_at(path: &std::path::Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::test_support::ManualClock;
    use chrono::TimeZone;

    fn one_per_minute() -> PolicyConfig {
        let mut config = PolicyConfig::default();
        config.tool_overrides.insert(
            "execute_transfer".to_string(),
            RateLimitRule {
                max_calls: 1,
                window_seconds: 60,
            },
        );
        config
    }

    async fn engine(config: PolicyConfig) -> (PolicyEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let store = Store::in_memory().await.unwrap();
        (PolicyEngine::new(store, config, clock.clone()), clock)
    }

    async fn ok_call(engine: &PolicyEngine, tenant: &TenantId, agent: Option<&str>) -> Result<u32> {
        engine
            .run_with_policy(ToolCall::new(tenant, "execute_transfer", agent), || async { Ok(7u32) })
            .await
    }

    #[tokio::test]
    async fn limit_is_per_agent_and_window() {
        let (engine, clock) = engine(one_per_minute()).await;
        let tenant = TenantId::from("t");

        assert_eq!(ok_call(&engine, &tenant, Some("agent-a")).await.unwrap(), 7);
        let err = ok_call(&engine, &tenant, Some("agent-a")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimit { .. }));
        assert!(ok_call(&engine, &tenant, Some("agent-b")).await.is_ok());

        // rejected attempts leave no trace
        assert_eq!(engine.recent_events(&tenant, 10).await.unwrap().len(), 2);

        clock.advance(chrono::Duration::seconds(61));
        assert!(ok_call(&engine, &tenant, Some("agent-a")).await.is_ok());
    }

    #[tokio::test]
    async fn unbounded_window_counts_all_history() {
        let mut config = PolicyConfig::default();
        config.tool_overrides.insert(
            "execute_transfer".to_string(),
            RateLimitRule {
                max_calls: 1,
                window_seconds: u64::MAX,
            },
        );
        let (engine, clock) = engine(config).await;
        let tenant = TenantId::from("t");

        assert!(ok_call(&engine, &tenant, Some("a")).await.is_ok());
        clock.advance(chrono::Duration::days(3650));
        let err = ok_call(&engine, &tenant, Some("a")).await.unwrap_err();
        assert!(matches!(err, Error::RateLimit { .. }));
    }

    #[tokio::test]
    async fn replaced_rules_apply_to_the_next_call() {
        let (engine, _clock) = engine(PolicyConfig::default()).await;
        let tenant = TenantId::from("t");

        assert!(ok_call(&engine, &tenant, Some("a")).await.is_ok());
        engine.replace_config(one_per_minute()).await;
        assert!(ok_call(&engine, &tenant, Some("a")).await.is_err());
    }

    #[tokio::test]
    async fn anonymous_and_unlimited_calls_pass() {
        let mut config = one_per_minute();
        config.default_rate_limit.max_calls = 0;
        let (engine, _clock) = engine(config).await;
        let tenant = TenantId::from("t");

        for _ in 0..3 {
            assert!(ok_call(&engine, &tenant, None).await.is_ok());
            assert!(engine
                .run_with_policy(ToolCall::new(&tenant, "query_balance", Some("a")), || async {
                    Ok(())
                })
                .await
                .is_ok());
        }
    }

    #[tokio::test]
    async fn failures_are_audited_and_returned() {
        let (engine, _clock) = engine(PolicyConfig::default()).await;
        let tenant = TenantId::from("t");

        let call = ToolCall::new(&tenant, "export_wallet_keystore", Some("a")).request(
            serde_json::json!({ "agent_id": "a", "passphrase": "hunter2" }),
            &["passphrase"],
        );
        let err = engine
            .run_with_policy(call, || async {
                Err::<(), _>(Error::not_found("wallet", "a"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        let events = engine.recent_events(&tenant, 1).await.unwrap();
        assert_eq!(events[0].status, "error");
        assert_eq!(events[0].error_message.as_deref(), Some("wallet not found: a"));
        let request = events[0].request_payload.clone().unwrap();
        assert_eq!(request["passphrase"], REDACTED);
        assert_eq!(request["agent_id"], "a");
    }

    #[tokio::test]
    async fn responses_are_redacted_or_truncated() {
        let (engine, _clock) = engine(PolicyConfig::default()).await;
        let tenant = TenantId::from("t");

        engine
            .run_with_policy(
                ToolCall::new(&tenant, "export_wallet_private_key", Some("a")).redact_response(),
                || async { Ok("0xdeadbeef".to_string()) },
            )
            .await
            .unwrap();
        engine
            .run_with_policy(ToolCall::new(&tenant, "list_wallets", None), || async {
                Ok("x".repeat(5000))
            })
            .await
            .unwrap();

        let events = engine.recent_events(&tenant, 2).await.unwrap();
        let long = events[0].response_payload.clone().unwrap();
        assert!(long.as_str().unwrap().ends_with("... [truncated]"));
        assert!(long.as_str().unwrap().len() < 1100);
        assert_eq!(events[1].response_payload, Some(Value::String(REDACTED.to_string())));

        let usage = engine
            .usage_summary(&tenant, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(usage.len(), 2);
    }

    #[tokio::test]
    async fn concurrent_calls_cannot_both_pass_the_last_slot() {
        let store = Store::in_memory().await.unwrap();
        let engine = Arc::new(PolicyEngine::new(store, one_per_minute(), Arc::new(SystemClock)));
        let tenant = TenantId::from("t");

        let calls = (0..4).map(|_| {
            let engine = engine.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                engine
                    .run_with_policy(
                        ToolCall::new(&tenant, "execute_transfer", Some("a")),
                        || async {
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(())
                        },
                    )
                    .await
            })
        });
        let passed = futures::future::join_all(calls)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().is_ok())
            .count();
        assert_eq!(passed, 1);
    }

    #[tokio::test]
    async fn reload_swaps_rules_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.yml");
        std::fs::write(&path, "rate_limits:\n  default:\n    max_calls: 5\n").unwrap();

        let store = Store::in_memory().await.unwrap();
        let engine = PolicyEngine::from_file(store, path.clone(), Arc::new(SystemClock))
            .await
            .unwrap();
        assert_eq!(engine.config().await.default_rate_limit.max_calls, 5);

        std::fs::write(&path, "rate_limits:\n  default:\n    max_calls: 9\n").unwrap();
        let reloaded = engine.reload().await.unwrap();
        assert_eq!(reloaded.default_rate_limit.max_calls, 9);
        assert_eq!(engine.config().await.rule_for("anything").max_calls, 9);

        std::fs::write(&path, "rate_limits: [").unwrap();
        assert!(engine.reload().await.is_err());
        assert_eq!(engine.config().await.default_rate_limit.max_calls, 9);
    }

    #[test]
    fn redaction_reaches_nested_fields() {
        let mut value = serde_json::json!({
            "source": { "private_key": "0xabc", "kind": "hex" },
            "items": [{ "password": "p" }],
            "mnemonic": null
        });
        redact(&mut value, &["private_key", "password", "mnemonic"]);
        assert_eq!(value["source"]["private_key"], REDACTED);
        assert_eq!(value["source"]["kind"], "hex");
        assert_eq!(value["items"][0]["password"], REDACTED);
        assert!(value["mnemonic"].is_null());
    }
}
