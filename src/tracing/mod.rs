pub mod config;
pub mod default;

#[cfg(test)]
mod test;

use std::fmt::Write as _;
use std::str::FromStr as _;

use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

pub use self::config::LoggerConfig;

const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;

const DEFAULT_FILTERS: &[(&str, log::LevelFilter)] = &[
    ("mongodb", log::LevelFilter::Warn),
    ("hyper", log::LevelFilter::Info),
    ("reqwest", log::LevelFilter::Info),
    ("rustls", log::LevelFilter::Info),
    ("trust_dns_resolver", log::LevelFilter::Warn),
    ("trust_dns_proto", log::LevelFilter::Warn),
];

pub fn setup(config: &LoggerConfig) -> anyhow::Result<()> {
    let reg = tracing_subscriber::registry().with(default::new_logger(config));

    tracing::subscriber::set_global_default(reg)?;
    tracing_log::LogTracer::init()?;

    Ok(())
}

fn filter(user_filters: &str) -> filter::EnvFilter {
    filter::EnvFilter::builder()
        .with_regex(false)
        .parse_lossy(directives(user_filters))
}

/// Default level and per-target caps, followed by the user's directives.
///
/// A target cap is only added when the user's level would let the target log more.
fn directives(user_filters: &str) -> String {
    let mut filter = String::new();

    let user_log_level = user_filters
        .rsplit(',')
        .find_map(|dir| log::LevelFilter::from_str(dir).ok());

    if user_log_level.is_none() {
        write!(&mut filter, "{DEFAULT_LOG_LEVEL}").unwrap(); // Writing into `String` never fails
    }

    for &(target, log_level) in DEFAULT_FILTERS {
        if user_log_level.unwrap_or(DEFAULT_LOG_LEVEL) > log_level {
            let comma = if filter.is_empty() { "" } else { "," };
            write!(&mut filter, "{comma}{target}={log_level}").unwrap(); // Writing into `String` never fails
        }
    }

    if !user_filters.is_empty() {
        let comma = if filter.is_empty() { "" } else { "," };
        write!(&mut filter, "{comma}{user_filters}").unwrap(); // Writing into `String` never fails
    }

    filter
}
