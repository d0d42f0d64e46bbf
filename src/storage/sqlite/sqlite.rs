#[cfg(test)]
#[path = "sqlite_test.rs"]
mod tests;

use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OpenFlags, Row, Transaction, named_params, params};

use crate::{
    error::{BudgetError, Result},
    models::{Conversation, Message, Metadata, Role},
    storage::Storage,
};

use super::migration::MIGRATION;

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, token_count, metadata, created_at";

pub struct Sqlite {
    conn: Connection,
}

enum Replace {
    Replaced,
    MissingConversation,
    MissingMessage(String),
    /// The deadline passed before commit; nothing was written.
    Expired,
}

impl Sqlite {
    pub async fn new(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(path) => Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
            )
            .await
            .map_err(|err| {
                BudgetError::StoreUnavailable(format!("opening database path {}: {}", path, err))
            })?,
            None => Connection::open_in_memory().await.map_err(|err| {
                BudgetError::StoreUnavailable(format!("opening in-memory database: {}", err))
            })?,
        };

        let ret = Self { conn };
        ret.run_migration().await?;
        Ok(ret)
    }

    async fn run_migration(&self) -> Result<()> {
        self.conn
            .call(|conn| Ok(conn.execute_batch(MIGRATION)?))
            .await
            .map_err(|err| BudgetError::StoreUnavailable(format!("executing migration: {}", err)))?;
        Ok(())
    }
}

#[async_trait]
impl Storage for Sqlite {
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        let conversation = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, token_usage, created_at, updated_at FROM conversations WHERE id = ?",
                )?;
                let mut rows = stmt.query(params![id])?;
                let conversation = match rows.next()? {
                    Some(row) => Some(read_conversation(row)?),
                    None => None,
                };
                Ok(conversation)
            })
            .await?;
        Ok(conversation)
    }

    async fn get_conversations(&self) -> Result<Vec<Conversation>> {
        let conversations = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, token_usage, created_at, updated_at FROM conversations ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut conversations = vec![];
                while let Some(row) = rows.next()? {
                    conversations.push(read_conversation(row)?);
                }
                Ok(conversations)
            })
            .await?;
        Ok(conversations)
    }

    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"INSERT INTO conversations (id, title, token_usage, created_at, updated_at)
                VALUES (:id, :title, 0, :created_at, :updated_at)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    updated_at = excluded.updated_at
                "#,
                    named_params! {
                        ":id": conversation.id(),
                        ":title": conversation.title(),
                        ":created_at": conversation.created_at().timestamp_millis(),
                        ":updated_at": conversation.updated_at().timestamp_millis(),
                    },
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM conversations WHERE id = ?", params![id])?;
                Ok(tx.commit()?)
            })
            .await?;
        Ok(())
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        let messages = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at, seq",
                    MESSAGE_COLUMNS
                ))?;
                let mut rows = stmt.query(params![conversation_id])?;
                let mut messages = vec![];
                while let Some(row) = rows.next()? {
                    messages.push(read_message(row)?);
                }
                Ok(messages)
            })
            .await?;
        Ok(messages)
    }

    async fn add_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let id = conversation_id.to_string();
        let messages = messages.to_vec();
        let added = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !conversation_exists(&tx, &id)? {
                    return Ok(false);
                }

                let mut tokens = 0i64;
                for message in &messages {
                    insert_message(&tx, &id, message)?;
                    tokens += message.token_count() as i64;
                }
                adjust_token_usage(&tx, &id, tokens)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        if !added {
            return Err(BudgetError::InvalidConversation(conversation_id.to_string()));
        }
        Ok(())
    }

    async fn delete_messages(&self, conversation_id: &str, ids: &[String]) -> Result<usize> {
        let id = conversation_id.to_string();
        let ids = ids.to_vec();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                if !conversation_exists(&tx, &id)? {
                    return Ok(None);
                }

                let mut deleted = 0usize;
                let mut tokens = 0i64;
                for message_id in &ids {
                    if let Some(count) = remove_message(&tx, &id, message_id)? {
                        deleted += 1;
                        tokens += count;
                    }
                }
                adjust_token_usage(&tx, &id, -tokens)?;
                tx.commit()?;
                Ok(Some(deleted))
            })
            .await?;

        deleted.ok_or_else(|| BudgetError::InvalidConversation(conversation_id.to_string()))
    }

    async fn replace_with_summary(
        &self,
        conversation_id: &str,
        summary: Message,
        ids: &[String],
        deadline: Option<Instant>,
    ) -> Result<()> {
        let id = conversation_id.to_string();
        let ids = ids.to_vec();
        let outcome = self
            .conn
            .call(move |conn| {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Ok(Replace::Expired);
                }

                let tx = conn.transaction()?;
                if !conversation_exists(&tx, &id)? {
                    return Ok(Replace::MissingConversation);
                }

                insert_message(&tx, &id, &summary)?;

                let mut removed = 0i64;
                for message_id in &ids {
                    match remove_message(&tx, &id, message_id)? {
                        Some(count) => removed += count,
                        // Dropping the transaction rolls back the insert.
                        None => return Ok(Replace::MissingMessage(message_id.clone())),
                    }
                }

                adjust_token_usage(&tx, &id, summary.token_count() as i64 - removed)?;
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Ok(Replace::Expired);
                }
                tx.commit()?;
                Ok(Replace::Replaced)
            })
            .await?;

        match outcome {
            Replace::Replaced => Ok(()),
            Replace::MissingConversation => Err(BudgetError::InvalidConversation(
                conversation_id.to_string(),
            )),
            Replace::MissingMessage(message_id) => Err(BudgetError::Conflict {
                conversation_id: conversation_id.to_string(),
                message_id,
            }),
            Replace::Expired => Err(BudgetError::StoreUnavailable(format!(
                "compressing conversation {} missed its deadline, rolled back",
                conversation_id
            ))),
        }
    }

    async fn recalculate_token_usage(&self, conversation_id: &str) -> Result<usize> {
        let id = conversation_id.to_string();
        let usage = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    r#"UPDATE conversations SET token_usage = (
                    SELECT COALESCE(SUM(token_count), 0) FROM messages WHERE conversation_id = :id
                ) WHERE id = :id"#,
                    named_params! { ":id": id },
                )?;
                if updated == 0 {
                    return Ok(None);
                }

                let usage: i64 = tx.query_row(
                    "SELECT token_usage FROM conversations WHERE id = ?",
                    params![id],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(Some(usage))
            })
            .await?;

        match usage {
            Some(usage) => Ok(usage.max(0) as usize),
            None => Err(BudgetError::InvalidConversation(
                conversation_id.to_string(),
            )),
        }
    }
}

fn other(
    err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(err.into())
}

fn timestamp(millis: i64) -> tokio_rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| other(eyre::eyre!("invalid timestamp {}", millis)))
}

fn read_conversation(row: &Row<'_>) -> tokio_rusqlite::Result<Conversation> {
    let id: String = row.get(0)?;
    let title: String = row.get(1)?;
    let token_usage: i64 = row.get(2)?;
    let created_at: i64 = row.get(3)?;
    let updated_at: i64 = row.get(4)?;

    Ok(Conversation::default()
        .with_id(id)
        .with_title(title)
        .with_token_usage(token_usage.max(0) as usize)
        .with_created_at(timestamp(created_at)?)
        .with_updated_at(timestamp(updated_at)?))
}

fn read_message(row: &Row<'_>) -> tokio_rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let content: String = row.get(3)?;
    let token_count: i64 = row.get(4)?;
    let metadata: Option<String> = row.get(5)?;
    let created_at: i64 = row.get(6)?;

    let role = Role::from_str(&role).map_err(other)?;
    let token_count = usize::try_from(token_count)
        .map_err(|_| other(eyre::eyre!("negative token count for message {}", id)))?;

    let mut message = Message::new(role, content)
        .with_id(id)
        .with_conversation_id(conversation_id)
        .with_token_count(token_count)
        .with_created_at(timestamp(created_at)?);

    if let Some(raw) = metadata.filter(|raw| !raw.is_empty()) {
        let metadata: Metadata = serde_json::from_str(&raw).map_err(other)?;
        message = message.with_metadata(metadata);
    }
    Ok(message)
}

fn conversation_exists(tx: &Transaction<'_>, id: &str) -> tokio_rusqlite::Result<bool> {
    let mut stmt = tx.prepare("SELECT 1 FROM conversations WHERE id = ?")?;
    let exists = stmt.exists(params![id])?;
    Ok(exists)
}

fn insert_message(
    tx: &Transaction<'_>,
    conversation_id: &str,
    message: &Message,
) -> tokio_rusqlite::Result<()> {
    let metadata = message
        .metadata()
        .map(serde_json::to_string)
        .transpose()
        .map_err(other)?;

    tx.execute(
        &format!(
            "INSERT INTO messages ({}) VALUES (:id, :conversation_id, :role, :content, :token_count, :metadata, :created_at)",
            MESSAGE_COLUMNS
        ),
        named_params! {
            ":id": message.id(),
            ":conversation_id": conversation_id,
            ":role": message.role().as_str(),
            ":content": message.content(),
            ":token_count": message.token_count() as i64,
            ":metadata": metadata,
            ":created_at": message.created_at().timestamp_millis(),
        },
    )?;
    Ok(())
}

/// Deletes one message and returns its token count, or `None` when it is
/// not part of the conversation.
fn remove_message(
    tx: &Transaction<'_>,
    conversation_id: &str,
    message_id: &str,
) -> tokio_rusqlite::Result<Option<i64>> {
    let tokens: Option<i64> = {
        let mut stmt =
            tx.prepare("SELECT token_count FROM messages WHERE id = ? AND conversation_id = ?")?;
        let mut rows = stmt.query(params![message_id, conversation_id])?;
        match rows.next()? {
            Some(row) => Some(row.get(0)?),
            None => None,
        }
    };

    if tokens.is_some() {
        tx.execute(
            "DELETE FROM messages WHERE id = ? AND conversation_id = ?",
            params![message_id, conversation_id],
        )?;
    }
    Ok(tokens)
}

fn adjust_token_usage(
    tx: &Transaction<'_>,
    conversation_id: &str,
    delta: i64,
) -> tokio_rusqlite::Result<()> {
    tx.execute(
        r#"UPDATE conversations
        SET token_usage = MAX(token_usage + :delta, 0), updated_at = :updated_at
        WHERE id = :id"#,
        named_params! {
            ":delta": delta,
            ":updated_at": chrono::Utc::now().timestamp_millis(),
            ":id": conversation_id,
        },
    )?;
    Ok(())
}
