use crate::config::constants::{
    COMPACTION_INTERVAL_SECS, MAX_CONVERSATION_TOKENS, PRIORITY_MESSAGE_COUNT, RETENTION_DAYS,
    STORE_TIMEOUT_SECS, SUMMARY_MAX_CHARS,
};

use super::*;
use crate::config::BudgetConfig;

#[test]
fn test_load_configuration() {
    let config = load_configuration("./testdata/config.toml").expect("failed to load config");

    assert_eq!(config.general.verbose, true);

    let log = &config.log;
    assert_eq!(log.level.as_deref(), Some("debug"));
    let log_filters = log.filters.as_deref().unwrap_or_default();
    assert_eq!(log_filters.len(), 1);
    assert_eq!(log_filters[0].module.as_deref(), Some("convo_budget::storage"));
    assert_eq!(log_filters[0].level.as_deref(), Some("trace"));

    let log_file = log.file.as_ref().expect("log file is configured");
    assert_eq!(log_file.path, "/var/log/convo-budget.log");
    assert_eq!(log_file.append, true);

    let budget = &config.budget;
    assert_eq!(budget.max_conversation_tokens, 8000);
    assert_eq!(budget.priority_message_count, 8);
    assert_eq!(budget.retention_days, 14);
    assert_eq!(budget.summary_max_chars, 300);
    assert_eq!(budget.store_timeout_secs, 5);
    assert_eq!(budget.retention(), Some(chrono::Duration::days(14)));

    assert_eq!(config.compaction.interval_secs, 900);

    match &config.storage {
        StorageConfig::Sqlite(sqlite) => {
            assert_eq!(
                sqlite.path.as_deref(),
                Some("/var/lib/convo-budget/messages.db")
            );
        }
    }
}

#[test]
fn test_load_configuration_with_some_default_fields() {
    let config =
        load_configuration("./testdata/config_with_default.toml").expect("failed to load config");

    assert_eq!(config.general.verbose, false);
    assert_eq!(config.log.level.as_deref(), Some("info"));
    assert!(config.log.file.is_none());

    let budget = &config.budget;
    assert_eq!(budget.max_conversation_tokens, 4000);
    assert_eq!(budget.priority_message_count, PRIORITY_MESSAGE_COUNT);
    assert_eq!(budget.retention_days, RETENTION_DAYS);
    assert_eq!(budget.summary_max_chars, SUMMARY_MAX_CHARS);
    assert_eq!(budget.store_timeout_secs, STORE_TIMEOUT_SECS);
    assert_eq!(config.compaction.interval_secs, COMPACTION_INTERVAL_SECS);
    assert_eq!(config.storage.sqlite_path(), None);
}

#[test]
fn test_default_budget() {
    let budget = Configuration::default().budget;
    assert_eq!(budget.max_conversation_tokens, MAX_CONVERSATION_TOKENS);
    assert_eq!(budget.max_conversation_tokens, 6000);
    assert_eq!(budget.priority_message_count, 5);
    assert_eq!(budget.retention_days, 7);
}

#[test]
fn test_apply_overrides() {
    let mut config = Configuration::default();
    let env = |key: &str| match key {
        "CONVO_BUDGET_MAX_TOKENS" => Some("12000".to_string()),
        "CONVO_BUDGET_PRIORITY_MESSAGES" => Some(" 3 ".to_string()),
        "CONVO_BUDGET_DB_PATH" => Some("/tmp/messages.db".to_string()),
        _ => None,
    };

    apply_overrides(&mut config, env).expect("failed to apply overrides");
    assert_eq!(config.budget.max_conversation_tokens, 12000);
    assert_eq!(config.budget.priority_message_count, 3);
    assert_eq!(config.budget.retention_days, RETENTION_DAYS);
    assert_eq!(config.storage.sqlite_path(), Some("/tmp/messages.db"));
}

#[test]
fn test_apply_overrides_invalid_value() {
    let mut config = Configuration::default();
    let env = |key: &str| match key {
        "CONVO_BUDGET_RETENTION_DAYS" => Some("a week".to_string()),
        _ => None,
    };

    let err = apply_overrides(&mut config, env).unwrap_err();
    assert!(format!("{err:#}").contains("CONVO_BUDGET_RETENTION_DAYS"));
    assert_eq!(config.budget.retention_days, RETENTION_DAYS);
}

#[test]
fn test_apply_overrides_out_of_range() {
    let cases = [
        ("CONVO_BUDGET_RETENTION_DAYS", "-1"),
        ("CONVO_BUDGET_RETENTION_DAYS", "9223372036854775807"),
        ("CONVO_BUDGET_RETENTION_DAYS", "36501"),
        ("CONVO_BUDGET_STORE_TIMEOUT_SECS", "0"),
    ];

    for (name, value) in cases {
        let mut config = Configuration::default();
        let env = |key: &str| (key == name).then(|| value.to_string());

        let err = apply_overrides(&mut config, env).unwrap_err();
        let field = if name == "CONVO_BUDGET_RETENTION_DAYS" {
            "retention_days"
        } else {
            "store_timeout_secs"
        };
        assert!(format!("{err:#}").contains(field), "{}={}", name, value);
    }
}

#[test]
fn test_apply_overrides_range_bounds() {
    let mut config = Configuration::default();
    let env = |key: &str| match key {
        "CONVO_BUDGET_RETENTION_DAYS" => Some("0".to_string()),
        "CONVO_BUDGET_STORE_TIMEOUT_SECS" => Some("1".to_string()),
        _ => None,
    };

    apply_overrides(&mut config, env).expect("bounds are valid");
    assert_eq!(config.budget.retention(), Some(chrono::Duration::zero()));
    assert_eq!(config.budget.store_timeout_secs, 1);
}

#[test]
fn test_load_configuration_rejects_zero_timeout() {
    let err = load_configuration("./testdata/config_zero_timeout.toml").unwrap_err();
    assert!(format!("{err:#}").contains("store_timeout_secs"));
}

#[test]
fn test_retention_never_panics() {
    let budget = BudgetConfig::default().with_retention_days(i64::MAX);
    assert_eq!(budget.retention(), None);
    assert!(budget.validate().is_err());

    let budget = BudgetConfig::default().with_retention_days(-3);
    assert_eq!(budget.retention(), Some(chrono::Duration::zero()));
}

#[test]
fn test_resolve_path() {
    let dir = "/tmp/convo-budget-test";
    let user_path = "user_path";
    unsafe {
        std::env::set_var("CONVO_BUDGET_TEST_DIR", dir);
        std::env::set_var("CONVO_BUDGET_TEST_USER", user_path);
    }
    let ret = resolve_path("$CONVO_BUDGET_TEST_DIR/${CONVO_BUDGET_TEST_USER}/messages.db")
        .expect("failed to resolve path");
    assert_eq!(ret, format!("{dir}/{user_path}/messages.db"));
}

#[test]
fn test_basename() {
    assert_eq!(basename("src/context/optimizer.rs"), "optimizer.rs");
    assert_eq!(basename("main.rs"), "main.rs");
}
