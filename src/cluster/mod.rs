//! Cluster access over the MongoDB driver.

mod client;
mod orphans;

pub use self::client::MongoCluster;
