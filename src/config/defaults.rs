use super::constants::*;

pub(crate) fn max_conversation_tokens() -> usize {
    MAX_CONVERSATION_TOKENS
}

pub(crate) fn priority_message_count() -> usize {
    PRIORITY_MESSAGE_COUNT
}

pub(crate) fn retention_days() -> i64 {
    RETENTION_DAYS
}

pub(crate) fn summary_max_chars() -> usize {
    SUMMARY_MAX_CHARS
}

pub(crate) fn store_timeout_secs() -> u64 {
    STORE_TIMEOUT_SECS
}

pub(crate) fn compaction_interval_secs() -> u64 {
    COMPACTION_INTERVAL_SECS
}

pub(crate) fn log_level() -> Option<String> {
    Some("info".to_string())
}

pub(crate) fn log_file_path() -> String {
    LOG_FILE_PATH.to_string()
}
