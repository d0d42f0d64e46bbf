#[cfg(test)]
#[path = "summary_test.rs"]
mod tests;

use crate::config::constants::SUMMARY_SAMPLE_SIZE;
use crate::context::estimate_tokens;
use crate::models::{
    Message, Metadata, Role,
    message::{METADATA_ORIGINAL_COUNT, METADATA_TYPE, METADATA_TYPE_SUMMARY},
};

pub const SUMMARY_PREFIX: &str = "Previous conversation summary: ";

const USER_PREFIX: &str = "User discussed: ";
const ASSISTANT_PREFIX: &str = ". Assistant provided information about: ";
const ELLIPSIS: &str = "...";

/// Builds the summary body for `aged` (oldest first) from the first few
/// user and assistant messages. The body is cut to `max_chars` characters
/// and always ends with an ellipsis. Returns an empty string when there is
/// nothing to summarize, e.g. only system messages.
pub fn summarize(aged: &[Message], max_chars: usize) -> String {
    let user = sample(aged, Role::User);
    let assistant = sample(aged, Role::Assistant);

    let mut body = String::new();
    if !user.is_empty() {
        body.push_str(USER_PREFIX);
        body.push_str(&user.join("; "));
    }
    if !assistant.is_empty() {
        body.push_str(ASSISTANT_PREFIX);
        body.push_str(&assistant.join("; "));
    }

    if body.is_empty() {
        return body;
    }

    let mut body: String = body.chars().take(max_chars).collect();
    body.push_str(ELLIPSIS);
    body
}

/// The system message that replaces `original_count` aged messages.
///
/// Only the body is counted toward the token estimate, the fixed prefix is
/// not.
pub fn summary_message(
    conversation_id: &str,
    body: &str,
    original_count: usize,
    created_at: chrono::DateTime<chrono::Utc>,
) -> Message {
    let mut metadata = Metadata::new();
    metadata.insert(METADATA_TYPE.to_string(), METADATA_TYPE_SUMMARY.into());
    metadata.insert(
        METADATA_ORIGINAL_COUNT.to_string(),
        (original_count as i64).into(),
    );

    Message::new(Role::System, format!("{}{}", SUMMARY_PREFIX, body))
        .with_conversation_id(conversation_id)
        .with_token_count(estimate_tokens(body))
        .with_created_at(created_at)
        .with_metadata(metadata)
}

fn sample(messages: &[Message], role: Role) -> Vec<&str> {
    messages
        .iter()
        .filter(|msg| msg.role() == role)
        .take(SUMMARY_SAMPLE_SIZE)
        .map(|msg| msg.content())
        .collect()
}
