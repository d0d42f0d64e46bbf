#[cfg(test)]
#[path = "cli_test.rs"]
mod tests;

use clap::{CommandFactory, Parser, Subcommand};
use eyre::{Context, Result};

use crate::config::{
    self, Configuration, apply_env_overrides, load_configuration, lookup_config_path,
};

#[derive(Debug, Parser)]
#[command(
    version,
    about,
    long_about = r#"Keep LLM conversation history within a token budget

Default configuration file location looks up in the following order:
    * $XDG_CONFIG_HOME/convo-budget/config.toml
    * $HOME/.config/convo-budget/config.toml
    * $HOME/.convo-budget.toml

Budget and storage settings can be overridden with the CONVO_BUDGET_MAX_TOKENS,
CONVO_BUDGET_PRIORITY_MESSAGES, CONVO_BUDGET_RETENTION_DAYS,
CONVO_BUDGET_STORE_TIMEOUT_SECS and CONVO_BUDGET_DB_PATH environment variables.
"#,
    disable_version_flag = true
)]
pub struct Command {
    /// Configuration file path
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Show the version
    #[arg(short, long)]
    version: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Action {
    /// Print the messages that would be sent with the next turn
    Context {
        conversation_id: String,

        /// Print role/content pairs as JSON
        #[arg(long)]
        json: bool,
    },

    /// Estimate the token count of TEXT, or of stdin when TEXT is omitted
    Estimate { text: Option<String> },

    /// Show token usage against the budget
    Status {
        /// Only this conversation
        conversation_id: Option<String>,
    },

    /// Create an empty conversation and print its id
    New {
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Record a message in a conversation
    Append {
        conversation_id: String,

        /// user, assistant or system
        #[arg(short, long, default_value = "user")]
        role: String,

        content: String,
    },

    /// Summarize aged messages of one conversation
    Compress {
        conversation_id: String,

        /// Compress even when usage is within the budget
        #[arg(short, long)]
        force: bool,
    },

    /// Summarize aged messages of every conversation over its budget
    CompressAll {
        /// Compress even when usage is within the budget
        #[arg(short, long)]
        force: bool,
    },

    /// Run compaction periodically until interrupted
    Watch {
        /// Seconds between passes; defaults to compaction.interval_secs
        #[arg(short, long, value_name = "SECS")]
        interval: Option<u64>,
    },

    /// Recompute stored token usage from the live messages
    Recalculate { conversation_id: String },
}

impl Command {
    pub fn new() -> Command {
        Self::parse()
    }

    pub fn get_config(&self) -> Result<Configuration> {
        let config_path = self
            .config
            .clone()
            .unwrap_or_else(|| lookup_config_path().unwrap_or_default());

        let mut config = if config_path.is_empty() {
            // No config path is specified just use the default config
            Configuration::default()
        } else {
            load_configuration(config_path.as_str()).wrap_err("loading configuration")?
        };

        apply_env_overrides(&mut config).wrap_err("applying environment overrides")?;
        Ok(config)
    }

    pub fn action(&self) -> Option<&Action> {
        self.action.as_ref()
    }

    pub fn version(&self) -> bool {
        self.version
    }

    pub fn print_version(&self) {
        println!("{}", config::version())
    }

    pub fn print_help() -> Result<()> {
        Self::command().print_help()?;
        Ok(())
    }
}
