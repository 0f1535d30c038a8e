use super::{format_ts, parse_ts, Store, TenantId};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Ok => "ok",
            EventStatus::Error => "error",
        }
    }
}

/// Audit event about to be appended
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub tool_name: String,
    pub agent_id: Option<String>,
    pub status: EventStatus,
    /// Already redacted
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub tenant_id: TenantId,
    pub occurred_at: DateTime<Utc>,
    pub tool_name: String,
    pub agent_id: Option<String>,
    pub status: String,
    pub request_payload: Option<serde_json::Value>,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
}

/// Per-tool call counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUsage {
    pub tool_name: String,
    pub ok: u64,
    pub error: u64,
}

fn opt_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord> {
    let occurred_at: String = row.try_get("occurred_at")?;
    Ok(EventRecord {
        id: row.try_get("id")?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        occurred_at: parse_ts(&occurred_at)?,
        tool_name: row.try_get("tool_name")?,
        agent_id: row.try_get("agent_id")?,
        status: row.try_get("status")?,
        request_payload: opt_json(row.try_get("request_payload")?)?,
        response_payload: opt_json(row.try_get("response_payload")?)?,
        error_message: row.try_get("error_message")?,
    })
}

impl Store {
    pub async fn record_event(
        &self,
        tenant: &TenantId,
        event: &NewEvent,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let request = event
            .request_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let response = event
            .response_payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO events (tenant_id, occurred_at, tool_name, agent_id, status,
                                request_payload, response_payload, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(tenant.as_str())
        .bind(format_ts(&now))
        .bind(&event.tool_name)
        .bind(&event.agent_id)
        .bind(event.status.as_str())
        .bind(request)
        .bind(response)
        .bind(&event.error_message)
        .fetch_one(self.pool())
        .await?;
        Ok(id)
    }

    /// Events for (tool, agent) at or after `cutoff`, whatever their status.
    pub async fn count_events_since(
        &self,
        tenant: &TenantId,
        tool_name: &str,
        agent_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(1) FROM events
            WHERE tenant_id = ? AND tool_name = ? AND agent_id = ? AND occurred_at >= ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(tool_name)
        .bind(agent_id)
        .bind(format_ts(&cutoff))
        .fetch_one(self.pool())
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Newest first
    pub async fn recent_events(&self, tenant: &TenantId, limit: u32) -> Result<Vec<EventRecord>> {
        sqlx::query(
            r#"
            SELECT id, tenant_id, occurred_at, tool_name, agent_id, status,
                   request_payload, response_payload, error_message
            FROM events
            WHERE tenant_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(tenant.as_str())
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?
        .iter()
        .map(event_from_row)
        .collect()
    }

    pub async fn usage_summary(
        &self,
        tenant: &TenantId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ToolUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT tool_name,
                   SUM(CASE WHEN status = 'ok' THEN 1 ELSE 0 END) AS ok_count,
                   SUM(CASE WHEN status = 'ok' THEN 0 ELSE 1 END) AS error_count
            FROM events
            WHERE tenant_id = ? AND occurred_at >= ?
            GROUP BY tool_name
            ORDER BY tool_name
            "#,
        )
        .bind(tenant.as_str())
        .bind(format_ts(&since))
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let ok: i64 = row.try_get("ok_count")?;
                let error: i64 = row.try_get("error_count")?;
                Ok(ToolUsage {
                    tool_name: row.try_get("tool_name")?,
                    ok: ok.max(0) as u64,
                    error: error.max(0) as u64,
                })
            })
            .collect()
    }
}
