//! Replication of cluster metadata from the source to the destination cluster.
//!
//! The steps have to run in order: databases must be enabled for sharding before collections
//! are sharded, collections must be sharded before chunks and zone ranges can be created.

mod chunks;
mod collections;
mod sharding;
mod zones;

pub use self::chunks::{ChunkStats, ChunkStrategy};
pub use self::collections::{CollectionDiff, CollectionSpec, CollectionStats, ShardOutcome};
pub use self::sharding::ShardingStats;
pub use self::zones::ZoneStats;
use crate::cluster::ClusterClient;
use crate::config::RunConfig;
use crate::operations::MigrationResult;
use crate::shard_map::ShardMap;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationReport {
    pub sharding: ShardingStats,
    pub collections: CollectionStats,
    pub chunks: ChunkStats,
    pub zones: ZoneStats,
}

impl ReplicationReport {
    /// Number of items which failed and need manual attention.
    pub fn failures(&self) -> usize {
        self.sharding.move_primary_failures
            + self.collections.failures
            + self.chunks.failures
            + self.zones.failures
    }
}

pub struct MetadataReplicator<'a> {
    config: &'a RunConfig,
    shard_map: &'a ShardMap,
    source: &'a dyn ClusterClient,
    destination: &'a dyn ClusterClient,
}

impl<'a> MetadataReplicator<'a> {
    pub fn new(
        config: &'a RunConfig,
        shard_map: &'a ShardMap,
        source: &'a dyn ClusterClient,
        destination: &'a dyn ClusterClient,
    ) -> Self {
        Self {
            config,
            shard_map,
            source,
            destination,
        }
    }

    /// Run every replication step, then make routers reload the new topology.
    pub async fn replicate(&self) -> MigrationResult<ReplicationReport> {
        let sharding = self.enable_destination_sharding().await?;
        let collections = self.shard_destination_collections().await?;
        let chunks = self.replicate_chunks().await?;
        let zones = self.replicate_zones().await?;
        self.flush_router_config().await?;

        let report = ReplicationReport {
            sharding,
            collections,
            chunks,
            zones,
        };
        log::info!("Metadata replication complete: {report:?}");
        Ok(report)
    }

    pub async fn flush_router_config(&self) -> MigrationResult<()> {
        log::debug!("flushRouterConfig on {}", self.destination.name());
        self.destination.flush_router_config().await
    }
}
