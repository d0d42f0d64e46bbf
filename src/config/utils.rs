#[cfg(test)]
#[path = "utils_test.rs"]
mod tests;

use chrono::Local;
use eyre::{Context, Result};
use log::LevelFilter;
use regex::Regex;
use std::{io::Write, str::FromStr};

use super::constants::{
    ENV_DB_PATH, ENV_MAX_TOKENS, ENV_PRIORITY_MESSAGES, ENV_RETENTION_DAYS,
    ENV_STORE_TIMEOUT_SECS,
};
use super::{Configuration, LogConfig, SqliteStorage, StorageConfig};

pub fn load_configuration(config_path: &str) -> Result<Configuration> {
    let config =
        std::fs::read_to_string(config_path).wrap_err(format!("reading {}", config_path))?;
    let config: Configuration = toml::from_str(&config).wrap_err("parsing configuration")?;
    config
        .validate()
        .wrap_err(format!("validating {}", config_path))?;
    Ok(config)
}

/// Overrides budget and storage settings from `CONVO_BUDGET_*` environment
/// variables. Unset variables leave the loaded value in place.
pub fn apply_env_overrides(config: &mut Configuration) -> Result<()> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(
    config: &mut Configuration,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(value) = lookup(ENV_MAX_TOKENS) {
        config.budget.max_conversation_tokens = parse_env(ENV_MAX_TOKENS, &value)?;
    }

    if let Some(value) = lookup(ENV_PRIORITY_MESSAGES) {
        config.budget.priority_message_count = parse_env(ENV_PRIORITY_MESSAGES, &value)?;
    }

    if let Some(value) = lookup(ENV_RETENTION_DAYS) {
        config.budget.retention_days = parse_env(ENV_RETENTION_DAYS, &value)?;
    }

    if let Some(value) = lookup(ENV_STORE_TIMEOUT_SECS) {
        config.budget.store_timeout_secs = parse_env(ENV_STORE_TIMEOUT_SECS, &value)?;
    }

    if let Some(value) = lookup(ENV_DB_PATH) {
        let path = if value.is_empty() { None } else { Some(value) };
        config.storage = StorageConfig::Sqlite(SqliteStorage { path });
    }
    config.validate()
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse::<T>()
        .wrap_err(format!("parsing {}={}", key, value))
}

pub fn init_logger(config: &LogConfig) -> Result<()> {
    let target: Box<dyn std::io::Write + Send + 'static> = match &config.file {
        Some(file) => {
            let path = resolve_path(&file.path)
                .wrap_err(format!("resolving log file path {}", file.path))?;
            init_log_dir(&path)?;
            Box::new(
                std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(file.append)
                    .truncate(!file.append)
                    .open(&path)
                    .wrap_err(format!("opening log file {}", path))?,
            )
        }
        None => Box::new(std::io::stderr()),
    };

    let raw_level = config.level.as_deref().unwrap_or("info");
    let log_level = LevelFilter::from_str(raw_level)?;

    let mut builder = env_logger::Builder::new();

    for filter in config.filters.as_deref().unwrap_or_default() {
        let module_level = LevelFilter::from_str(filter.level.as_deref().unwrap_or(raw_level))
            .unwrap_or(log_level);
        builder.filter(filter.module.as_deref(), module_level);
    }

    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}/{}:{} {} [{}] - {}",
                record.module_path().unwrap_or("unknown"),
                basename(record.file().unwrap_or("unknown")),
                record.line().unwrap_or(0),
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(target))
        .filter(None, log_level)
        .try_init()?;
    Ok(())
}

pub fn basename(path: &str) -> String {
    path.split('/').last().unwrap_or(path).to_string()
}

/// resolve_path resolves the input path to an absolute path. If the
/// input path contains environment variables, it will expand them to their
/// values.
pub fn resolve_path(path: &str) -> Result<String> {
    let re = Regex::new(r"\$\{?([A-Za-z_]+)\}?").wrap_err("compiling regex")?;

    let mut ret = String::new();
    let mut last_pos = 0;

    for cap in re.captures_iter(path) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        ret.push_str(&path[last_pos..full_match.start()]);
        let var_name = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
        let var_value = std::env::var(var_name).unwrap_or_default();
        ret.push_str(&var_value);
        last_pos = full_match.end();
    }
    ret.push_str(&path[last_pos..]);

    let path = std::path::absolute(ret.as_str()).wrap_err(format!("resolving path {}", ret))?;
    Ok(path.to_string_lossy().to_string())
}

/// lookup_config_path trys to look up the config path at:
/// * $XDG_CONFIG_HOME/convo-budget/config.toml
/// * $HOME/.config/convo-budget/config.toml
/// * $HOME/.convo-budget.toml
pub fn lookup_config_path() -> Option<String> {
    let paths = &[
        format!(
            "{}/convo-budget/config.toml",
            env_or_current("XDG_CONFIG_HOME")
        ),
        format!("{}/.config/convo-budget/config.toml", env_or_current("HOME")),
        format!("{}/.convo-budget.toml", env_or_current("HOME")),
    ];

    for path in paths {
        if std::path::Path::new(path).exists() {
            return Some(path.to_string());
        }
    }
    None
}

fn env_or_current(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| ".".to_string())
}

fn init_log_dir(path: &str) -> Result<()> {
    let dir = std::path::Path::new(path)
        .parent()
        .unwrap_or(std::path::Path::new("."));
    std::fs::create_dir_all(dir).wrap_err(format!("creating directory {}", dir.display()))?;
    Ok(())
}
