use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

use crate::namespace::NamespaceFilter;

pub const DEFAULT_MIRROR_START_PORT: u16 = 9001;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// How metadata is written to the destination. Resolved once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataStrategy {
    /// Write config records directly. Requires write access to the config database.
    #[default]
    Privileged,
    /// Drive the destination through administrative commands only.
    Unprivileged,
}

impl MetadataStrategy {
    pub fn from_non_privileged(non_privileged: bool) -> Self {
        if non_privileged {
            Self::Unprivileged
        } else {
            Self::Privileged
        }
    }

    pub fn is_privileged(self) -> bool {
        self == Self::Privileged
    }
}

/// Options of the external mirror processes.
#[derive(Debug, Deserialize, Validate, Clone)]
pub struct MirrorConfig {
    /// Path to the `mongomirror` executable.
    #[serde(default = "default_mirror_binary")]
    pub binary: PathBuf,
    /// First HTTP status port, each task takes the next one.
    #[serde(default = "default_start_port")]
    #[validate(range(min = 1))]
    pub start_port: u16,
    /// Pause between two process launches.
    #[serde(default)]
    pub launch_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,
    #[serde(default = "default_status_timeout_ms")]
    #[validate(range(min = 1))]
    pub status_timeout_ms: u64,
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Reuse the bookmark files of an earlier run by giving the same prefix.
    #[serde(default)]
    pub bookmark_prefix: Option<String>,
    #[serde(default)]
    #[validate(range(min = 1))]
    pub num_parallel_collections: Option<u32>,
    #[serde(default)]
    pub write_concern: Option<String>,
    #[serde(default)]
    pub compressors: Option<String>,
    #[serde(default)]
    pub tail_only: bool,
    #[serde(default)]
    pub preserve_uuids: bool,
    #[serde(default)]
    pub oplog_base_path: Option<PathBuf>,
    /// Accept TLS certificates whose host name does not match.
    #[serde(default)]
    pub ssl_allow_invalid_hostnames: bool,
    #[serde(default)]
    pub ssl_allow_invalid_certificates: bool,
}

impl MirrorConfig {
    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            binary: default_mirror_binary(),
            start_port: default_start_port(),
            launch_delay_ms: 0,
            poll_interval_ms: default_poll_interval_ms(),
            status_timeout_ms: default_status_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            bookmark_prefix: None,
            num_parallel_collections: None,
            write_concern: None,
            compressors: None,
            tail_only: false,
            preserve_uuids: false,
            oplog_base_path: None,
            ssl_allow_invalid_hostnames: false,
            ssl_allow_invalid_certificates: false,
        }
    }
}

/// Everything a run is parameterised with. Built once, never mutated.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    pub filter: NamespaceFilter,
    pub strategy: MetadataStrategy,
    pub mirror: MirrorConfig,
}

impl RunConfig {
    pub fn new(filter: NamespaceFilter, strategy: MetadataStrategy, mirror: MirrorConfig) -> Self {
        Self {
            filter,
            strategy,
            mirror,
        }
    }
}

fn default_mirror_binary() -> PathBuf {
    PathBuf::from("mongomirror")
}

const fn default_start_port() -> u16 {
    DEFAULT_MIRROR_START_PORT
}

const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

const fn default_status_timeout_ms() -> u64 {
    DEFAULT_STATUS_TIMEOUT.as_millis() as u64
}

const fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_defaults() {
        let config: MirrorConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(config.start_port, 9001);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());

        let config: MirrorConfig =
            serde_json::from_value(serde_json::json!({ "poll_interval_ms": 0 })).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn strategy_from_flag() {
        assert!(MetadataStrategy::from_non_privileged(false).is_privileged());
        assert_eq!(
            MetadataStrategy::from_non_privileged(true),
            MetadataStrategy::Unprivileged
        );
    }
}
