/// Token ceiling for the history sent with a single request
pub const MAX_CONVERSATION_TOKENS: usize = 6000;

/// Newest messages always included in the context, whatever they cost
pub const PRIORITY_MESSAGE_COUNT: usize = 5;

/// Messages older than this are summarized by compression
pub const RETENTION_DAYS: i64 = 7;
pub const MAX_RETENTION_DAYS: i64 = 365 * 100;

/// Summary body length in characters, before the trailing ellipsis
pub const SUMMARY_MAX_CHARS: usize = 500;

/// Messages per role quoted in a summary
pub const SUMMARY_SAMPLE_SIZE: usize = 3;

pub const STORE_TIMEOUT_SECS: u64 = 10;
pub const MIN_STORE_TIMEOUT_SECS: u64 = 1;

pub const COMPACTION_INTERVAL_SECS: u64 = 60 * 60; // hourly

pub const LOG_FILE_PATH: &str = "/tmp/convo-budget.log";

pub const ENV_MAX_TOKENS: &str = "CONVO_BUDGET_MAX_TOKENS";
pub const ENV_PRIORITY_MESSAGES: &str = "CONVO_BUDGET_PRIORITY_MESSAGES";
pub const ENV_RETENTION_DAYS: &str = "CONVO_BUDGET_RETENTION_DAYS";
pub const ENV_STORE_TIMEOUT_SECS: &str = "CONVO_BUDGET_STORE_TIMEOUT_SECS";
pub const ENV_DB_PATH: &str = "CONVO_BUDGET_DB_PATH";
