#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

use std::{collections::BTreeMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::context::estimate_tokens;

pub const METADATA_TYPE: &str = "type";
pub const METADATA_TYPE_SUMMARY: &str = "summary";
pub const METADATA_ORIGINAL_COUNT: &str = "originalMessageCount";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Synthetic messages, e.g. history summaries.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(eyre::eyre!("unknown role: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single turn of a conversation. The token count is fixed when the
/// message is built; a message whose content changes is a new message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    id: String,
    conversation_id: String,
    role: Role,
    content: String,
    token_count: usize,
    created_at: chrono::DateTime<chrono::Utc>,
    metadata: Option<Metadata>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: String::new(),
            role,
            token_count: estimate_tokens(&content),
            content,
            created_at: chrono::Utc::now(),
            metadata: None,
        }
    }

    pub fn new_user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn new_assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn new_system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn with_created_at(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.created_at = timestamp;
        self
    }

    /// Overrides the estimated token count, e.g. with the usage reported by
    /// the model or a value read back from the store.
    pub fn with_token_count(mut self, token_count: usize) -> Self {
        self.token_count = token_count;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn metadata_value(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }

    /// Whether this message stands in for compressed history.
    pub fn is_summary(&self) -> bool {
        self.metadata_value(METADATA_TYPE)
            .and_then(MetadataValue::as_str)
            .is_some_and(|kind| kind == METADATA_TYPE_SUMMARY)
    }

    /// Number of messages a summary replaced.
    pub fn original_message_count(&self) -> Option<usize> {
        self.metadata_value(METADATA_ORIGINAL_COUNT)
            .and_then(MetadataValue::as_i64)
            .and_then(|count| usize::try_from(count).ok())
    }
}

/// The role/content pair handed to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl From<&Message> for PromptMessage {
    fn from(value: &Message) -> Self {
        Self {
            role: value.role,
            content: value.content.clone(),
        }
    }
}
