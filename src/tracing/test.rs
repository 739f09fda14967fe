use serde_json::json;

use super::*;

#[test]
fn deserialize_logger_config() {
    let config: LoggerConfig = serde_json::from_value(json!({
        "log_level": "debug",
        "color": false,
    }))
    .unwrap();

    let expected = LoggerConfig {
        log_level: Some("debug".into()),
        color: Some(config::Color::Disable),
        with_target: true,
    };
    assert_eq!(config, expected);

    let config: LoggerConfig = serde_json::from_value(json!({ "color": "auto" })).unwrap();
    assert_eq!(config.color, Some(config::Color::Auto));
}

#[test]
fn top_level_log_level_is_a_fallback() {
    let mut config = LoggerConfig::default();
    config.with_top_level_directive(Some("warn".into()));
    assert_eq!(config.log_level.as_deref(), Some("warn"));

    let mut config = LoggerConfig {
        log_level: Some("debug".into()),
        ..LoggerConfig::default()
    };
    config.with_top_level_directive(Some("warn".into()));
    assert_eq!(config.log_level.as_deref(), Some("debug"));
}

#[test]
fn default_filters_cap_noisy_targets() {
    let defaults = "INFO,mongodb=WARN,trust_dns_resolver=WARN,trust_dns_proto=WARN";
    assert_eq!(directives(""), defaults);
    assert_eq!(
        directives("debug"),
        "mongodb=WARN,hyper=INFO,reqwest=INFO,rustls=INFO,trust_dns_resolver=WARN,\
         trust_dns_proto=WARN,debug"
    );
    assert_eq!(directives("error"), "error");
    assert_eq!(
        directives("migration=trace"),
        format!("{defaults},migration=trace")
    );
}
