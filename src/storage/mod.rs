pub mod sqlite;

use std::sync::Arc;
use std::time::Instant;

use crate::{
    config::StorageConfig,
    error::Result,
    models::{Conversation, Message},
};
use async_trait::async_trait;
use sqlite::Sqlite;

#[cfg(test)]
use mockall::automock;

/// Persistence for conversations and their message logs.
///
/// Every write keeps the conversation's token usage in step with its live
/// messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Storage {
    /// Conversation row only; messages are not loaded.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    async fn get_conversations(&self) -> Result<Vec<Conversation>>;
    async fn upsert_conversation(&self, conversation: Conversation) -> Result<()>;
    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Messages in chronological order.
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;
    async fn add_messages(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;
    /// Returns how many of `ids` were deleted.
    async fn delete_messages(&self, conversation_id: &str, ids: &[String]) -> Result<usize>;

    /// Inserts `summary` and deletes `ids` in one transaction. Fails with
    /// `Conflict` and writes nothing if any of `ids` is already gone.
    ///
    /// The transaction is rolled back instead of committed once `deadline`
    /// has passed, and the call fails with `StoreUnavailable`. Callers must
    /// not abandon the returned future to enforce a timeout: the write may
    /// already be running on the store side.
    async fn replace_with_summary(
        &self,
        conversation_id: &str,
        summary: Message,
        ids: &[String],
        deadline: Option<Instant>,
    ) -> Result<()>;

    /// Recomputes token usage from the live messages and returns it.
    async fn recalculate_token_usage(&self, conversation_id: &str) -> Result<usize>;
}

pub type ArcStorage = Arc<dyn Storage + Send + Sync>;

pub async fn new_storage(config: &StorageConfig) -> Result<ArcStorage> {
    let storage = match config {
        StorageConfig::Sqlite(sqlite_config) => {
            Arc::new(Sqlite::new(sqlite_config.path.as_deref()).await?)
        }
    };
    Ok(storage)
}
