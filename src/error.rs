use thiserror::Error;

pub type Result<T> = std::result::Result<T, BudgetError>;

#[derive(Debug, Error)]
pub enum BudgetError {
    /// The message store could not be read or written, or a call to it
    /// timed out. Nothing was mutated.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("conversation {0} does not exist")]
    InvalidConversation(String),

    /// A compression lost the race for its aged messages. The transaction
    /// was rolled back.
    #[error("conflicting compression on conversation {conversation_id}: message {message_id} is gone")]
    Conflict {
        conversation_id: String,
        message_id: String,
    },
}

impl BudgetError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::Conflict { .. })
    }
}

impl From<tokio_rusqlite::Error> for BudgetError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
