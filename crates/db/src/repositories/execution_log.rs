use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_core::audit::{AuditError, AuditSink, ExecutionRecord};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row};

use super::RepositoryError;
use crate::DbPool;

/// Append-only log of tool executions, one row per call.
pub struct SqlExecutionLogRepository {
    pool: DbPool,
}

impl SqlExecutionLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &ExecutionRecord) -> Result<(), RepositoryError> {
        let parameters_json = serde_json::to_string(&record.parameters)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let result_json = serde_json::to_string(&record.result)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO tool_execution_log (
                id, request_id, channel_id, thread_id, user_id, tool_name,
                parameters_json, result_json, success, duration_ms, from_cache, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.record_id)
        .bind(&record.request_id)
        .bind(&record.channel_id)
        .bind(&record.thread_id)
        .bind(&record.user_id)
        .bind(&record.tool_name)
        .bind(parameters_json)
        .bind(result_json)
        .bind(record.success)
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .bind(record.from_cache)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records for one request, in execution order.
    pub async fn list_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<ExecutionRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, request_id, channel_id, thread_id, user_id, tool_name,
                   parameters_json, result_json, success, duration_ms, from_cache, recorded_at
            FROM tool_execution_log
            WHERE request_id = ?
            ORDER BY recorded_at ASC, rowid ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    pub async fn count_for_tool(&self, tool_name: &str) -> Result<i64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM tool_execution_log WHERE tool_name = ?")
            .bind(tool_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }
}

#[async_trait]
impl AuditSink for SqlExecutionLogRepository {
    async fn append(&self, record: ExecutionRecord) -> Result<(), AuditError> {
        Ok(self.insert(&record).await?)
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ExecutionRecord, RepositoryError> {
    let parameters_json: String = row.try_get("parameters_json")?;
    let result_json: String = row.try_get("result_json")?;
    let duration_ms: i64 = row.try_get("duration_ms")?;
    let recorded_at: DateTime<Utc> = row.try_get("recorded_at")?;

    Ok(ExecutionRecord {
        record_id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        channel_id: row.try_get("channel_id")?,
        thread_id: row.try_get("thread_id")?,
        user_id: row.try_get("user_id")?,
        tool_name: row.try_get("tool_name")?,
        parameters: parse_json(&parameters_json)?,
        result: parse_json(&result_json)?,
        success: row.try_get("success")?,
        duration_ms: u64::try_from(duration_ms)
            .map_err(|_| RepositoryError::Decode(format!("negative duration {duration_ms}")))?,
        from_cache: row.try_get("from_cache")?,
        recorded_at,
    })
}

fn parse_json(raw: &str) -> Result<Value, RepositoryError> {
    serde_json::from_str(raw).map_err(|error| RepositoryError::Decode(error.to_string()))
}

#[cfg(test)]
mod tests {
    use helmsman_core::audit::{AuditContext, AuditSink, ExecutionRecord};
    use serde_json::json;

    use super::SqlExecutionLogRepository;
    use crate::connect_with_settings;
    use crate::migrations::run_pending;

    #[tokio::test]
    async fn appended_records_round_trip_through_the_log() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        let log = SqlExecutionLogRepository::new(pool);

        let context = AuditContext::new("req-1", "C1", "T1", "U1");
        let first = ExecutionRecord::new(
            &context,
            "ci__status",
            json!({"branch": "main"}),
            json!({"success": true, "data": {"state": "green"}}),
            true,
        )
        .with_duration_ms(42);
        let second = ExecutionRecord::new(
            &context,
            "jira__issue_lookup",
            json!({"key": "PROJ-9"}),
            json!({"success": false, "error": "not found"}),
            false,
        )
        .with_from_cache(true);

        log.append(first.clone()).await.expect("append first");
        log.append(second.clone()).await.expect("append second");
        log.append(ExecutionRecord::new(
            &AuditContext::new("req-2", "C1", "T2", "U2"),
            "ci__status",
            json!({}),
            json!(null),
            true,
        ))
        .await
        .expect("append other request");

        let stored = log.list_for_request("req-1").await.expect("list");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].record_id, first.record_id);
        assert_eq!(stored[0].parameters, json!({"branch": "main"}));
        assert_eq!(stored[0].duration_ms, 42);
        assert!(stored[0].success);
        assert_eq!(stored[1].tool_name, "jira__issue_lookup");
        assert!(!stored[1].success);
        assert!(stored[1].from_cache);

        assert_eq!(log.count_for_tool("ci__status").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn duplicate_record_ids_surface_as_sink_errors() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        let log = SqlExecutionLogRepository::new(pool);

        let record = ExecutionRecord::new(
            &AuditContext::new("req-1", "C1", "T1", "U1"),
            "ci__status",
            json!({}),
            json!({}),
            true,
        );
        log.append(record.clone()).await.expect("first append");
        assert!(log.append(record).await.is_err());
    }
}
