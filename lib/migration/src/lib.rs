pub mod balancer;
pub mod cluster;
pub mod config;
pub mod counts;
pub mod metadata;
pub mod migration;
pub mod mirror;
pub mod namespace;
pub mod operations;
pub mod reconcile;
pub mod shard_map;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod uuids;
