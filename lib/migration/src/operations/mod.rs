pub mod admin;
pub mod bounds;
pub mod types;

pub use admin::AdminCommand;
pub use types::{CommandError, MigrationError, MigrationResult};
