#[cfg(test)]
#[path = "optimizer_test.rs"]
mod tests;

use std::future::Future;
use std::time::Instant;

use crate::config::BudgetConfig;
use crate::context::{ConversationLocks, summary};
use crate::error::{BudgetError, Result};
use crate::models::{Conversation, Message, PromptMessage, Role};
use crate::storage::ArcStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Usage is within the budget.
    WithinBudget,
    /// Nothing is older than the retention window.
    NothingAged,
    /// The aged messages hold no user or assistant content.
    EmptySummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionOutcome {
    Skipped(SkipReason),
    Compressed { summary: Message, removed: usize },
}

impl CompressionOutcome {
    pub fn is_compressed(&self) -> bool {
        matches!(self, CompressionOutcome::Compressed { .. })
    }
}

/// Bounds what a conversation sends to the model and reclaims budget by
/// summarizing aged history.
pub struct Optimizer {
    config: BudgetConfig,
    storage: ArcStorage,
    locks: ConversationLocks,
}

impl Optimizer {
    pub fn new(storage: ArcStorage) -> Self {
        Self::with_config(storage, BudgetConfig::default())
    }

    pub fn with_config(storage: ArcStorage, config: BudgetConfig) -> Self {
        Self {
            config,
            storage,
            locks: ConversationLocks::new(),
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn storage(&self) -> &ArcStorage {
        &self.storage
    }

    /// Messages to send with the next turn, oldest first.
    pub async fn select_context(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.conversation(conversation_id).await?;
        let messages = self
            .bounded(self.storage.get_messages(conversation_id))
            .await?;

        let selected = self.select_from(&messages);
        log::debug!(
            "Selected {}/{} messages ({} tokens) for conversation {}",
            selected.len(),
            messages.len(),
            selected.iter().map(Message::token_count).sum::<usize>(),
            conversation_id
        );
        Ok(selected)
    }

    /// Same as [`Optimizer::select_context`] projected to role/content pairs.
    pub async fn prompt_context(&self, conversation_id: &str) -> Result<Vec<PromptMessage>> {
        let messages = self.select_context(conversation_id).await?;
        Ok(messages.iter().map(PromptMessage::from).collect())
    }

    /// Runs the selection over `messages` given in chronological order.
    pub fn select_from(&self, messages: &[Message]) -> Vec<Message> {
        select_within_budget(
            messages,
            self.config.priority_message_count,
            self.config.max_conversation_tokens,
        )
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.conversation(conversation_id).await
    }

    /// Every stored conversation, most recently updated first.
    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        self.bounded(self.storage.get_conversations()).await
    }

    /// Stores a new empty conversation.
    pub async fn create_conversation(&self, title: Option<&str>) -> Result<Conversation> {
        let mut conversation = Conversation::new();
        if let Some(title) = title {
            conversation.set_title(title);
        }
        self.bounded(self.storage.upsert_conversation(conversation.clone()))
            .await?;
        Ok(conversation)
    }

    /// Rebuilds the stored token usage from the live messages.
    pub async fn recalculate_token_usage(&self, conversation_id: &str) -> Result<usize> {
        self.bounded(self.storage.recalculate_token_usage(conversation_id))
            .await
    }

    pub async fn should_compress_history(&self, conversation_id: &str) -> Result<bool> {
        let conversation = self.conversation(conversation_id).await?;
        Ok(conversation.token_usage() > self.config.max_conversation_tokens)
    }

    /// Replaces every message older than the retention window with one
    /// summary message. Calls for the same conversation run one at a time.
    pub async fn compress_old_messages(
        &self,
        conversation_id: &str,
    ) -> Result<CompressionOutcome> {
        let _guard = self.locks.acquire(conversation_id).await;
        self.compress_before(conversation_id, self.cutoff()).await
    }

    /// Compresses only when usage exceeds the budget. The check and the
    /// compression happen under the same lock.
    pub async fn compress_if_needed(
        &self,
        conversation_id: &str,
    ) -> Result<CompressionOutcome> {
        let _guard = self.locks.acquire(conversation_id).await;
        if !self.should_compress_history(conversation_id).await? {
            return Ok(CompressionOutcome::Skipped(SkipReason::WithinBudget));
        }
        self.compress_before(conversation_id, self.cutoff()).await
    }

    /// Records a new turn. The token count is estimated once here and never
    /// recomputed.
    pub async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<Message> {
        let message = Message::new(role, content).with_conversation_id(conversation_id);
        self.bounded(
            self.storage
                .add_messages(conversation_id, std::slice::from_ref(&message)),
        )
        .await?;
        Ok(message)
    }

    async fn compress_before(
        &self,
        conversation_id: &str,
        cutoff: chrono::DateTime<chrono::Utc>,
    ) -> Result<CompressionOutcome> {
        self.conversation(conversation_id).await?;
        let messages = self
            .bounded(self.storage.get_messages(conversation_id))
            .await?;

        // Aged summaries are folded into the new one like any other message.
        let aged = messages
            .into_iter()
            .filter(|msg| msg.created_at() < cutoff)
            .collect::<Vec<_>>();

        let Some(newest_aged) = aged.last() else {
            log::debug!("No aged messages in conversation {}", conversation_id);
            return Ok(CompressionOutcome::Skipped(SkipReason::NothingAged));
        };

        let body = summary::summarize(&aged, self.config.summary_max_chars);
        if body.is_empty() {
            log::debug!(
                "Aged messages of conversation {} have nothing to summarize",
                conversation_id
            );
            return Ok(CompressionOutcome::Skipped(SkipReason::EmptySummary));
        }

        // Sorts before every message that is kept.
        let summary = summary::summary_message(
            conversation_id,
            &body,
            aged.len(),
            newest_aged.created_at(),
        );
        let ids = aged
            .iter()
            .map(|msg| msg.id().to_string())
            .collect::<Vec<_>>();

        // Not bounded from outside: a dropped future does not stop a write
        // already handed to the store. The store rolls back past the deadline.
        let deadline = Instant::now().checked_add(self.config.store_timeout());
        self.storage
            .replace_with_summary(conversation_id, summary.clone(), &ids, deadline)
            .await?;

        log::info!(
            "Compressed {} messages of conversation {} into summary {}",
            ids.len(),
            conversation_id,
            summary.id()
        );
        Ok(CompressionOutcome::Compressed {
            summary,
            removed: ids.len(),
        })
    }

    /// Messages created before this instant are aged. A retention too large
    /// to subtract from now ages nothing.
    fn cutoff(&self) -> chrono::DateTime<chrono::Utc> {
        self.config
            .retention()
            .and_then(|retention| chrono::Utc::now().checked_sub_signed(retention))
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.bounded(self.storage.get_conversation(conversation_id))
            .await?
            .ok_or_else(|| BudgetError::InvalidConversation(conversation_id.to_string()))
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.config.store_timeout();
        match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(BudgetError::StoreUnavailable(format!(
                "store call timed out after {:?}",
                timeout
            ))),
        }
    }
}

/// Keeps the newest `priority` messages whatever they cost, then walks older
/// messages newest to oldest while they fit under `max_tokens`. The walk
/// stops at the first message that does not fit. `messages` must be in
/// chronological order; so is the result.
pub fn select_within_budget(
    messages: &[Message],
    priority: usize,
    max_tokens: usize,
) -> Vec<Message> {
    if messages.is_empty() {
        return vec![];
    }

    let start = messages.len() - priority.min(messages.len());
    let (candidates, priority_set) = messages.split_at(start);

    let mut total = priority_set
        .iter()
        .map(Message::token_count)
        .fold(0usize, usize::saturating_add);

    let mut start = start;
    for msg in candidates.iter().rev() {
        let next = total.saturating_add(msg.token_count());
        if next > max_tokens {
            break;
        }
        total = next;
        start -= 1;
    }

    messages[start..].to_vec()
}
