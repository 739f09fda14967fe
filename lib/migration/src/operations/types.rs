use std::backtrace::Backtrace;
use std::io;

use thiserror::Error;

use crate::shard_map::ShardId;

pub type MigrationResult<T> = Result<T, MigrationError>;

/// Error code returned by `enableSharding` when the database is already partitioned.
pub const ALREADY_INITIALIZED_CODE: i32 = 23;

/// Error code returned by `shardCollection` when the namespace is already sharded.
pub const ALREADY_SHARDED_CODE: i32 = 20;

/// Failure reported by the cluster for a single administrative command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("command failed with code {code}: {message}")]
pub struct CommandError {
    pub code: i32,
    pub message: String,
}

impl CommandError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// `enableSharding` on a database which is already partitioned.
    pub fn is_sharding_already_enabled(&self) -> bool {
        self.code == ALREADY_INITIALIZED_CODE && self.message.contains("sharding already enabled")
    }

    /// `shardCollection` on a namespace which is already sharded.
    pub fn is_already_sharded(&self) -> bool {
        self.code == ALREADY_SHARDED_CODE
    }
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Wrong input: {description}")]
    BadInput { description: String },
    #[error("No destination shard mapping found for source shard: {shard}")]
    UnmappedShard { shard: ShardId },
    #[error("Duplicate shard mapping for source shard: {shard}")]
    DuplicateShardMapping { shard: ShardId },
    #[error("No mapped primary shard for database {database} (source primary {primary})")]
    MissingMappedPrimary { database: String, primary: ShardId },
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("Command `{command}` failed: {error}")]
    Command {
        command: String,
        #[source]
        error: CommandError,
    },
    #[error("Service internal error: {error}")]
    ServiceError {
        error: String,
        backtrace: Option<String>,
    },
    #[error("Failed to run mirror for shard {shard}: {error}")]
    Process {
        shard: ShardId,
        #[source]
        error: io::Error,
    },
    #[error("Operation Cancelled: {description}")]
    Cancelled { description: String },
}

impl MigrationError {
    pub fn service_error(error: impl Into<String>) -> MigrationError {
        MigrationError::ServiceError {
            error: error.into(),
            backtrace: Some(Backtrace::force_capture().to_string()),
        }
    }

    pub fn bad_input(description: impl Into<String>) -> MigrationError {
        MigrationError::BadInput {
            description: description.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> MigrationError {
        MigrationError::NotFound { what: what.into() }
    }

    pub fn command(command: impl Into<String>, error: CommandError) -> MigrationError {
        MigrationError::Command {
            command: command.into(),
            error,
        }
    }

    /// The command error carried by this error, if it came from an administrative command.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            MigrationError::Command { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Configuration errors abort the run before anything is written.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            MigrationError::BadInput { .. }
                | MigrationError::UnmappedShard { .. }
                | MigrationError::DuplicateShardMapping { .. }
                | MigrationError::MissingMappedPrimary { .. }
        )
    }
}

impl From<bson::de::Error> for MigrationError {
    fn from(error: bson::de::Error) -> MigrationError {
        MigrationError::service_error(format!("Failed to decode document: {error}"))
    }
}

impl From<bson::document::ValueAccessError> for MigrationError {
    fn from(error: bson::document::ValueAccessError) -> MigrationError {
        MigrationError::service_error(format!("Malformed metadata document: {error}"))
    }
}

impl From<bson::raw::Error> for MigrationError {
    fn from(error: bson::raw::Error) -> MigrationError {
        MigrationError::service_error(format!("Failed to encode raw document: {error}"))
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(error: serde_json::Error) -> MigrationError {
        MigrationError::service_error(format!("Failed to decode status: {error}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_idempotence_guards() {
        let enabled = CommandError::new(23, "sharding already enabled for database db1");
        assert!(enabled.is_sharding_already_enabled());
        assert!(!enabled.is_already_sharded());

        let other = CommandError::new(23, "something else");
        assert!(!other.is_sharding_already_enabled());

        let sharded = CommandError::new(20, "already sharded");
        assert!(sharded.is_already_sharded());
    }

    #[test]
    fn configuration_errors() {
        let err = MigrationError::UnmappedShard {
            shard: "shA".to_string(),
        };
        assert!(err.is_configuration_error());
        assert_eq!(
            err.to_string(),
            "No destination shard mapping found for source shard: shA"
        );

        let err = MigrationError::command("split", CommandError::new(1, "boom"));
        assert!(!err.is_configuration_error());
        assert_eq!(err.command_error().map(|e| e.code), Some(1));
    }
}
