//! Persistent session directory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::ChatError;
use crate::llm::{Message, MessageRole};

/// Name given to the session created on an empty store.
pub const DEFAULT_SESSION_NAME: &str = "Default session";

/// Session metadata as listed to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

/// Maps session ids to their stored message logs.
#[async_trait]
pub trait SessionDirectory: Send + Sync + std::fmt::Debug {
    /// All sessions, most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ChatError>;

    async fn create_session(&self, name: &str) -> Result<i64, ChatError>;

    async fn rename_session(&self, id: i64, name: &str) -> Result<(), ChatError>;

    /// Delete a session and its messages. The last session is never deleted.
    async fn delete_session(&self, id: i64) -> Result<(), ChatError>;

    async fn session_exists(&self, id: i64) -> Result<bool, ChatError>;

    /// Stored messages in chronological order.
    async fn get_messages(&self, id: i64) -> Result<Vec<Message>, ChatError>;

    /// Store a whole turn atomically and bump the session's `updated_at`.
    async fn append_messages(&self, id: i64, messages: &[Message]) -> Result<(), ChatError>;

    async fn clear_messages(&self, id: i64) -> Result<(), ChatError>;

    /// Most recently updated session, creating a default one on an empty store.
    async fn ensure_default(&self) -> Result<i64, ChatError>;
}

/// SQLite-backed [`SessionDirectory`].
#[derive(Debug, Clone)]
pub struct SqliteSessionDirectory {
    pool: SqlitePool,
}

impl SqliteSessionDirectory {
    /// Open (or create) the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, ChatError> {
        // Every connection to an in-memory database sees its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!(database_url = %database_url, "Session store ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionDirectory for SqliteSessionDirectory {
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, ChatError> {
        let rows = sqlx::query(
            r"
            SELECT s.id, s.name, s.created_at, s.updated_at,
                   (SELECT COUNT(*) FROM conversations c WHERE c.session_id = s.id) AS message_count
            FROM sessions s
            ORDER BY s.updated_at DESC, s.id DESC
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SessionInfo, ChatError> {
                Ok(SessionInfo {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                    message_count: row.try_get("message_count")?,
                })
            })
            .collect()
    }

    async fn create_session(&self, name: &str) -> Result<i64, ChatError> {
        let now = Utc::now();
        let result =
            sqlx::query("INSERT INTO sessions (name, created_at, updated_at) VALUES (?, ?, ?)")
                .bind(name)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;

        let id = result.last_insert_rowid();
        tracing::info!(session_id = id, name = %name, "Created session");
        Ok(id)
    }

    async fn rename_session(&self, id: i64, name: &str) -> Result<(), ChatError> {
        let result = sqlx::query("UPDATE sessions SET name = ?, updated_at = ? WHERE id = ?")
            .bind(name)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ChatError::SessionNotFound(id));
        }
        Ok(())
    }

    async fn delete_session(&self, id: i64) -> Result<(), ChatError> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !exists {
            return Err(ChatError::SessionNotFound(id));
        }

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sessions")
            .fetch_one(&mut *tx)
            .await?
            .try_get("n")?;
        if count <= 1 {
            return Err(ChatError::SessionDeleteRefused);
        }

        sqlx::query("DELETE FROM conversations WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::info!(session_id = id, "Deleted session");
        Ok(())
    }

    async fn session_exists(&self, id: i64) -> Result<bool, ChatError> {
        Ok(sqlx::query("SELECT 1 FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some())
    }

    async fn get_messages(&self, id: i64) -> Result<Vec<Message>, ChatError> {
        if !self.session_exists(id).await? {
            return Err(ChatError::SessionNotFound(id));
        }

        let rows = sqlx::query(
            "SELECT role, content FROM conversations WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Message, ChatError> {
                let role: String = row.try_get("role")?;
                Ok(Message::new(role.parse::<MessageRole>()?, row.try_get::<String, _>("content")?))
            })
            .collect()
    }

    async fn append_messages(&self, id: i64, messages: &[Message]) -> Result<(), ChatError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE sessions SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(ChatError::SessionNotFound(id));
        }

        for message in messages {
            sqlx::query(
                "INSERT INTO conversations (session_id, role, content, timestamp) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(session_id = id, count = messages.len(), "Persisted messages");
        Ok(())
    }

    async fn clear_messages(&self, id: i64) -> Result<(), ChatError> {
        if !self.session_exists(id).await? {
            return Err(ChatError::SessionNotFound(id));
        }
        sqlx::query("DELETE FROM conversations WHERE session_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ensure_default(&self) -> Result<i64, ChatError> {
        let latest = sqlx::query("SELECT id FROM sessions ORDER BY updated_at DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match latest {
            Some(row) => Ok(row.try_get("id")?),
            None => self.create_session(DEFAULT_SESSION_NAME).await,
        }
    }
}
