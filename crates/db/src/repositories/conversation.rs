use async_trait::async_trait;
use chrono::{DateTime, Utc};
use helmsman_core::memory::{ChatMessage, ConversationMemory, MemoryError, MessageRole};
use sqlx::Row;

use super::RepositoryError;
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn recent(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT role, content, created_at
            FROM conversation_message
            WHERE channel_id = ? AND thread_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(channel_id)
        .bind(thread_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .iter()
            .map(|row| {
                let role: String = row.try_get("role")?;
                let role = MessageRole::parse(&role)
                    .ok_or_else(|| RepositoryError::Decode(format!("unknown role `{role}`")))?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(ChatMessage { role, content: row.try_get("content")?, created_at })
            })
            .collect::<Result<Vec<_>, RepositoryError>>()?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn insert(
        &self,
        channel_id: &str,
        thread_id: &str,
        message: &ChatMessage,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO conversation_message (channel_id, thread_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(channel_id)
        .bind(thread_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationMemory for SqlConversationRepository {
    async fn get_history(
        &self,
        channel_id: &str,
        thread_id: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, MemoryError> {
        Ok(self.recent(channel_id, thread_id, limit).await?)
    }

    async fn append_message(
        &self,
        channel_id: &str,
        thread_id: &str,
        message: ChatMessage,
    ) -> Result<(), MemoryError> {
        Ok(self.insert(channel_id, thread_id, &message).await?)
    }
}

#[cfg(test)]
mod tests {
    use helmsman_core::memory::{ChatMessage, ConversationMemory, MessageRole};

    use super::SqlConversationRepository;
    use crate::connect_with_settings;
    use crate::migrations::run_pending;

    #[tokio::test]
    async fn history_is_thread_scoped_bounded_and_oldest_first() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        run_pending(&pool).await.expect("migrate");
        let memory = SqlConversationRepository::new(pool);

        for index in 0..4 {
            memory
                .append_message("C1", "T1", ChatMessage::user(format!("question {index}")))
                .await
                .expect("append user");
            memory
                .append_message("C1", "T1", ChatMessage::assistant(format!("answer {index}")))
                .await
                .expect("append assistant");
        }
        memory.append_message("C1", "T2", ChatMessage::user("elsewhere")).await.expect("append");

        let history = memory.get_history("C1", "T1", 3).await.expect("history");
        let contents = history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["answer 2", "question 3", "answer 3"]);
        assert_eq!(history[1].role, MessageRole::User);

        assert_eq!(memory.get_history("C1", "T2", 10).await.expect("history").len(), 1);
        assert!(memory.get_history("C2", "T1", 10).await.expect("history").is_empty());
    }
}
