use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Where a tool execution came from: the conversation that triggered it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditContext {
    pub request_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub user_id: String,
}

impl AuditContext {
    pub fn new(
        request_id: impl Into<String>,
        channel_id: impl Into<String>,
        thread_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            channel_id: channel_id.into(),
            thread_id: thread_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// One append-only record per tool call, cache hits included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub record_id: String,
    pub request_id: String,
    pub channel_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
    pub from_cache: bool,
    pub recorded_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(
        context: &AuditContext,
        tool_name: impl Into<String>,
        parameters: Value,
        result: Value,
        success: bool,
    ) -> Self {
        Self {
            record_id: Uuid::new_v4().to_string(),
            request_id: context.request_id.clone(),
            channel_id: context.channel_id.clone(),
            thread_id: context.thread_id.clone(),
            user_id: context.user_id.clone(),
            tool_name: tool_name.into(),
            parameters,
            result,
            success,
            duration_ms: 0,
            from_cache: false,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink failure: {0}")]
    Sink(String),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: ExecutionRecord) -> Result<(), AuditError>;
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl InMemoryAuditSink {
    pub fn records(&self) -> Vec<ExecutionRecord> {
        match self.records.lock() {
            Ok(records) => records.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, record: ExecutionRecord) -> Result<(), AuditError> {
        match self.records.lock() {
            Ok(mut records) => records.push(record),
            Err(poisoned) => poisoned.into_inner().push(record),
        }
        Ok(())
    }
}
