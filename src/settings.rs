use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat, Source};
use migration::config::{MetadataStrategy, MirrorConfig, RunConfig};
use migration::namespace::NamespaceFilter;
use migration::operations::MigrationResult;
use serde::Deserialize;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

use crate::tracing;

const DEFAULT_CONFIG: &str = include_str!("../config/config.yaml");

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct ClusterConfig {
    /// Connection string of a router of the cluster.
    #[validate(length(min = 1))]
    pub uri: String,
}

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct Settings {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub logger: tracing::LoggerConfig,
    #[validate]
    pub source: ClusterConfig,
    #[validate]
    pub destination: ClusterConfig,
    #[serde(default)]
    pub filter: Vec<String>,
    #[serde(default)]
    pub shard_map: Vec<String>,
    #[serde(default)]
    pub non_privileged: bool,
    #[serde(default)]
    #[validate]
    pub mirror: MirrorConfig,
    #[serde(default = "default_cleanup_orphans_sleep_ms")]
    pub cleanup_orphans_sleep_ms: u64,
    /// Problems met while loading the configuration. The logger is not ready at that point, so
    /// they are kept here and logged later.
    #[serde(default, skip)]
    pub load_errors: Vec<LogMsg>,
}

impl Settings {
    pub fn new(custom_config_path: Option<String>) -> Result<Self, ConfigError> {
        let mut load_errors = vec![];
        let config_exists = |path| File::with_name(path).collect().is_ok();

        if let Some(ref path) = custom_config_path {
            if !config_exists(path) {
                load_errors.push(LogMsg::Error(format!(
                    "Config file via --config-path is not found: {path}"
                )));
            }
        }

        let env = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_path_env = format!("config/{env}");

        load_errors.extend(
            ["config/config", &config_path_env]
                .into_iter()
                .filter(|path| !config_exists(path))
                .map(|path| LogMsg::Warn(format!("Config file not found: {path}"))),
        );

        let mut config = Config::builder()
            // Start with compile-time base config
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Yaml))
            .add_source(File::with_name("config/config").required(false))
            // Uses RUN_MODE, defaults to 'development'
            .add_source(File::with_name(&config_path_env).required(false))
            // Local config, not tracked in git
            .add_source(File::with_name("config/local").required(false));

        if let Some(path) = custom_config_path {
            config = config.add_source(File::with_name(&path).required(false));
        }

        // E.g.: `SHARD_SYNC__SOURCE__URI=mongodb://host:27017 ./shard-sync` sets `source.uri`
        config = config.add_source(
            Environment::with_prefix("SHARD_SYNC")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("filter")
                .with_list_parse_key("shard_map"),
        );

        let mut settings: Settings = config.build()?.try_deserialize()?;
        settings.load_errors.extend(load_errors);
        Ok(settings)
    }

    pub fn validate_and_warn(&self) {
        self.load_errors.iter().for_each(LogMsg::log);

        if let Err(ref errs) = self.validate() {
            warn_validation_errors("Settings configuration file", errs);
        }
    }

    /// The immutable parameters of a run.
    pub fn run_config(&self) -> MigrationResult<RunConfig> {
        Ok(RunConfig::new(
            NamespaceFilter::from_entries(&self.filter)?,
            MetadataStrategy::from_non_privileged(self.non_privileged),
            self.mirror.clone(),
        ))
    }

    pub fn cleanup_orphans_sleep(&self) -> Duration {
        Duration::from_millis(self.cleanup_orphans_sleep_ms)
    }
}

#[derive(Clone, Debug)]
pub enum LogMsg {
    Warn(String),
    Error(String),
}

impl LogMsg {
    fn log(&self) {
        match self {
            Self::Warn(msg) => log::warn!("{msg}"),
            Self::Error(msg) => log::error!("{msg}"),
        }
    }
}

/// Warn about validation errors in the log, one line per field.
fn warn_validation_errors(description: &str, errs: &ValidationErrors) {
    log::warn!("{description} has validation errors:");
    describe_errors("", errs)
        .into_iter()
        .for_each(|(key, msg)| log::warn!("- {key}: {msg}"));
}

/// Flatten nested validation errors into `(dotted.field, message)` pairs.
fn describe_errors(prefix: &str, errs: &ValidationErrors) -> Vec<(String, String)> {
    let mut described = Vec::new();
    for (field, kind) in errs.errors() {
        let name = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{prefix}.{field}")
        };
        match kind {
            ValidationErrorsKind::Field(errors) => {
                described.extend(errors.iter().map(|err| (name.clone(), err.to_string())));
            }
            ValidationErrorsKind::Struct(errors) => {
                described.extend(describe_errors(&name, errors));
            }
            ValidationErrorsKind::List(errors) => {
                for (index, errors) in errors {
                    described.extend(describe_errors(&format!("{name}[{index}]"), errors));
                }
            }
        }
    }
    described.sort();
    described
}

const fn default_cleanup_orphans_sleep_ms() -> u64 {
    100
}
