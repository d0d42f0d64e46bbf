use std::time::Duration;

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::config::constants::{
    COMPACTION_INTERVAL_SECS, MAX_CONVERSATION_TOKENS, MAX_RETENTION_DAYS, MIN_STORE_TIMEOUT_SECS,
    PRIORITY_MESSAGE_COUNT, RETENTION_DAYS, STORE_TIMEOUT_SECS, SUMMARY_MAX_CHARS,
};

#[allow(unused_imports)]
use super::CONFIG;

use super::defaults::*;

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Configuration {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub budget: BudgetConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct GeneralConfig {
    #[serde(default)]
    pub verbose: bool,
}

/// Limits applied by the optimizer. Passed to it at construction so each
/// deployment can tune them.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct BudgetConfig {
    #[serde(default = "max_conversation_tokens")]
    pub max_conversation_tokens: usize,

    #[serde(default = "priority_message_count")]
    pub priority_message_count: usize,

    #[serde(default = "retention_days")]
    pub retention_days: i64,

    #[serde(default = "summary_max_chars")]
    pub summary_max_chars: usize,

    #[serde(default = "store_timeout_secs")]
    pub store_timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct CompactionConfig {
    #[serde(default = "compaction_interval_secs")]
    pub interval_secs: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default = "log_level")]
    pub level: Option<String>,

    #[serde(default)]
    pub filters: Option<Vec<LogFilter>>,

    /// Log to stderr when unset.
    #[serde(default)]
    pub file: Option<LogFile>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFilter {
    #[serde(default)]
    pub module: Option<String>,

    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogFile {
    #[serde(default = "log_file_path")]
    pub path: String,

    #[serde(default)]
    pub append: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub enum StorageConfig {
    #[serde(rename = "sqlite")]
    Sqlite(SqliteStorage),
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SqliteStorage {
    /// In-memory database when unset.
    pub path: Option<String>,
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()
    }

    #[cfg(not(test))]
    pub fn instance() -> &'static Configuration {
        CONFIG.get().expect("Config not initialized")
    }

    #[cfg(not(test))]
    pub fn init(config: Configuration) -> Result<()> {
        CONFIG
            .set(config)
            .map_err(|_| eyre::eyre!("Config already initialized"))?;
        Ok(())
    }

    #[cfg(test)]
    pub fn instance() -> &'static Configuration {
        use super::TEST_CONFIG;
        TEST_CONFIG.with(|config| *config.borrow())
    }

    #[cfg(test)]
    pub fn init(config: Configuration) -> Result<()> {
        use super::TEST_CONFIG;
        TEST_CONFIG.with(|test_config| {
            *test_config.borrow_mut() = Box::leak(Box::new(config));
        });
        Ok(())
    }
}

impl BudgetConfig {
    /// `None` when `retention_days` is out of range for a duration.
    /// Negative values count as zero.
    pub fn retention(&self) -> Option<chrono::TimeDelta> {
        chrono::TimeDelta::try_days(self.retention_days.max(0))
    }

    pub fn validate(&self) -> Result<()> {
        if !(0..=MAX_RETENTION_DAYS).contains(&self.retention_days) {
            eyre::bail!(
                "budget.retention_days must be between 0 and {}, got {}",
                MAX_RETENTION_DAYS,
                self.retention_days
            );
        }
        if self.store_timeout_secs < MIN_STORE_TIMEOUT_SECS {
            eyre::bail!(
                "budget.store_timeout_secs must be at least {}, got {}",
                MIN_STORE_TIMEOUT_SECS,
                self.store_timeout_secs
            );
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn with_max_conversation_tokens(mut self, tokens: usize) -> Self {
        self.max_conversation_tokens = tokens;
        self
    }

    pub fn with_priority_message_count(mut self, count: usize) -> Self {
        self.priority_message_count = count;
        self
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_store_timeout_secs(mut self, secs: u64) -> Self {
        self.store_timeout_secs = secs;
        self
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl StorageConfig {
    pub fn sqlite_path(&self) -> Option<&str> {
        match self {
            StorageConfig::Sqlite(sqlite) => sqlite.path.as_deref(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_conversation_tokens: MAX_CONVERSATION_TOKENS,
            priority_message_count: PRIORITY_MESSAGE_COUNT,
            retention_days: RETENTION_DAYS,
            summary_max_chars: SUMMARY_MAX_CHARS,
            store_timeout_secs: STORE_TIMEOUT_SECS,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_secs: COMPACTION_INTERVAL_SECS,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: log_level(),
            file: None,
            filters: None,
        }
    }
}

impl Default for LogFile {
    fn default() -> Self {
        Self {
            path: log_file_path(),
            append: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite(SqliteStorage::default())
    }
}
