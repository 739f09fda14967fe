//! Entry point tying the engine together: one method per run mode.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::balancer::{disable_source_autosplit, stop_balancers};
use crate::cluster::{ClusterClient, OrphanCleaner};
use crate::config::RunConfig;
use crate::counts::{compare_collection_counts, CountReport};
use crate::metadata::{
    CollectionDiff, CollectionStats, MetadataReplicator, ReplicationReport, ShardingStats,
};
use crate::mirror::{
    plan_replica_set_tasks, plan_tasks, MirrorOrchestrator, MirrorRunner, MirrorTask,
};
use crate::operations::MigrationResult;
use crate::reconcile::{ChunkDiff, ChunkReconciler, ReconcileReport};
use crate::shard_map::ShardMap;
use crate::uuids::{compare_collection_uuids, UuidReport};

/// Pause before document counts which differ are read again.
pub const COUNT_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterSide {
    Source,
    Destination,
}

impl fmt::Display for ClusterSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSide::Source => f.write_str("source"),
            ClusterSide::Destination => f.write_str("destination"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub replication: ReplicationReport,
    pub reconcile: ReconcileReport,
}

pub struct Migration<'a> {
    config: RunConfig,
    shard_map: ShardMap,
    source: &'a dyn ClusterClient,
    destination: &'a dyn ClusterClient,
}

impl<'a> Migration<'a> {
    pub fn new(
        config: RunConfig,
        shard_map: ShardMap,
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

    /// Build the shard map from the configured entries and both shard lists.
    pub async fn connect<S: AsRef<str>>(
        config: RunConfig,
        shard_map_entries: &[S],
        source: &'a dyn ClusterClient,
        destination: &'a dyn ClusterClient,
    ) -> MigrationResult<Self> {
        let source_shards = source.list_shards().await?;
        let destination_shards = destination.list_shards().await?;
        let shard_map = ShardMap::build(shard_map_entries, &source_shards, &destination_shards)?;
        Ok(Self::new(config, shard_map, source, destination))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn shard_map(&self) -> &ShardMap {
        &self.shard_map
    }

    fn replicator(&self) -> MetadataReplicator<'_> {
        MetadataReplicator::new(&self.config, &self.shard_map, self.source, self.destination)
    }

    fn reconciler(&self) -> ChunkReconciler<'_> {
        ChunkReconciler::new(&self.config, &self.shard_map, self.source, self.destination)
    }

    fn cluster(&self, side: ClusterSide) -> &'a dyn ClusterClient {
        match side {
            ClusterSide::Source => self.source,
            ClusterSide::Destination => self.destination,
        }
    }

    pub async fn stop_balancers(&self) -> MigrationResult<()> {
        stop_balancers(self.source, self.destination).await
    }

    pub async fn enable_destination_sharding(&self) -> MigrationResult<ShardingStats> {
        self.replicator().enable_destination_sharding().await
    }

    pub async fn shard_collections(&self) -> MigrationResult<CollectionStats> {
        self.replicator().shard_destination_collections().await
    }

    /// Full metadata migration: stop balancers, replicate all metadata, then move every chunk
    /// which is not on the image of its source owner.
    pub async fn migrate_metadata(&self) -> MigrationResult<MigrationReport> {
        log::info!("Starting metadata sync/migration");
        self.stop_balancers().await?;
        let replication = self.replicator().replicate().await?;
        let reconcile = self.reconciler().compare_and_move_chunks(true).await?;

        let report = MigrationReport {
            replication,
            reconcile,
        };
        if report.replication.failures() > 0 || !report.reconcile.is_consistent() {
            log::warn!("Metadata migration finished with errors, see the log above: {report:?}");
        } else {
            log::info!("Metadata migration complete");
        }
        Ok(report)
    }

    pub async fn compare_chunks(&self) -> MigrationResult<ReconcileReport> {
        self.reconciler().compare_chunks().await
    }

    pub async fn diff_chunks(&self, database: &str) -> MigrationResult<ChunkDiff> {
        self.reconciler().diff_chunks(database).await
    }

    pub async fn diff_sharded_collections(&self, sync: bool) -> MigrationResult<CollectionDiff> {
        self.replicator().diff_sharded_collections(sync).await
    }

    pub async fn compare_counts(&self, retry_delay: Duration) -> MigrationResult<CountReport> {
        compare_collection_counts(&self.config, self.source, self.destination, retry_delay).await
    }

    pub async fn flush_router_config(&self) -> MigrationResult<()> {
        self.replicator().flush_router_config().await
    }

    pub async fn drop_destination_databases(&self) -> MigrationResult<Vec<String>> {
        self.replicator().drop_destination_databases().await
    }

    /// Like [`Self::drop_destination_databases`], also removing the routing metadata the drops
    /// leave behind.
    pub async fn drop_destination_databases_and_config_metadata(
        &self,
    ) -> MigrationResult<Vec<String>> {
        self.replicator()
            .drop_destination_databases_and_config_metadata()
            .await
    }

    pub async fn disable_source_autosplit(&self) -> MigrationResult<()> {
        disable_source_autosplit(self.source).await
    }

    pub async fn compare_collection_uuids(&self, side: ClusterSide) -> MigrationResult<UuidReport> {
        compare_collection_uuids(&self.config, self.cluster(side)).await
    }

    /// Start one mirror per source shard and supervise them until `cancel` is triggered.
    pub async fn mirror(
        &self,
        runner: Box<dyn MirrorRunner>,
        cancel: CancellationToken,
    ) -> MigrationResult<()> {
        let tasks = plan_tasks(
            &self.config,
            &self.shard_map,
            self.source,
            self.destination,
            chrono::Local::now(),
        )
        .await?;
        self.run_mirrors(tasks, runner, cancel).await
    }

    /// Mirror every source shard into the single replica set behind the destination
    /// connection. No shard map is involved.
    pub async fn mirror_to_replica_set(
        &self,
        runner: Box<dyn MirrorRunner>,
        cancel: CancellationToken,
    ) -> MigrationResult<()> {
        let tasks = plan_replica_set_tasks(
            &self.config,
            self.source,
            self.destination,
            chrono::Local::now(),
        )
        .await?;
        self.run_mirrors(tasks, runner, cancel).await
    }

    async fn run_mirrors(
        &self,
        tasks: Vec<MirrorTask>,
        runner: Box<dyn MirrorRunner>,
        cancel: CancellationToken,
    ) -> MigrationResult<()> {
        let mut orchestrator = MirrorOrchestrator::new(self.config.mirror.clone(), runner);
        if let Err(err) = orchestrator.launch(tasks, &cancel).await {
            log::error!("Failed to launch mirrors: {err}");
            orchestrator.shutdown().await;
            return Err(err);
        }
        orchestrator.supervise(cancel).await
    }

    /// Remove orphaned documents of every in-scope sharded collection on one side.
    pub async fn cleanup_orphans(
        &self,
        side: ClusterSide,
        cleaner: &dyn OrphanCleaner,
        pause: Duration,
    ) -> MigrationResult<usize> {
        let collections: Vec<_> = self
            .cluster(side)
            .sharded_collections()
            .await?
            .into_iter()
            .filter(|collection| {
                self.config.filter.included(&collection.namespace)
                    && !collection.namespace.is_config()
            })
            .collect();

        log::info!(
            "Cleaning up orphans of {} collections on {side}",
            collections.len()
        );
        cleaner.cleanup_orphans(&collections, pause).await?;
        Ok(collections.len())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bson::doc;
    use parking_lot::Mutex;

    use super::*;
    use crate::cluster::CollectionMetadata;
    use crate::namespace::{Namespace, NamespaceFilter};
    use crate::testing::two_shard_clusters;

    #[derive(Default)]
    struct RecordingCleaner {
        cleaned: Mutex<Vec<Namespace>>,
    }

    #[async_trait]
    impl OrphanCleaner for RecordingCleaner {
        async fn cleanup_orphans(
            &self,
            collections: &[CollectionMetadata],
            _pause: Duration,
        ) -> MigrationResult<()> {
            self.cleaned
                .lock()
                .extend(collections.iter().map(|c| c.namespace.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_shard_map_is_one_to_one() {
        let (source, destination) = two_shard_clusters();
        let entries: [&str; 0] = [];
        let migration = Migration::connect(RunConfig::default(), &entries, &source, &destination)
            .await
            .unwrap();
        assert_eq!(migration.shard_map().len(), 2);
        assert_eq!(migration.shard_map().get("src1"), Some(&"dst1".to_string()));
    }

    #[tokio::test]
    async fn cleanup_orphans_on_selected_side() {
        let (source, destination) = two_shard_clusters();
        for ns in [("db1", "a"), ("db2", "b"), ("config", "system.sessions")] {
            let ns = Namespace::new(ns.0, ns.1);
            destination.add_collection(CollectionMetadata::new(ns, doc! { "_id": 1 }, false));
        }
        source.add_collection(CollectionMetadata::new(
            Namespace::new("db1", "source_only"),
            doc! { "_id": 1 },
            false,
        ));

        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1"]).unwrap(),
            ..RunConfig::default()
        };
        let migration = Migration::new(config, ShardMap::default(), &source, &destination);
        let cleaner = RecordingCleaner::default();

        let count = migration
            .cleanup_orphans(ClusterSide::Destination, &cleaner, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(*cleaner.cleaned.lock(), vec![Namespace::new("db1", "a")]);
    }

    #[tokio::test]
    async fn collection_uuids_compared_on_selected_side() {
        let (source, destination) = two_shard_clusters();
        let ns = Namespace::new("db1", "a");
        source.set_collection_uuid("src0", &ns, Some("u1"));
        source.set_collection_uuid("src1", &ns, Some("u2"));
        destination.set_collection_uuid("dst0", &ns, Some("u1"));

        let migration =
            Migration::new(RunConfig::default(), ShardMap::default(), &source, &destination);
        let report = migration
            .compare_collection_uuids(ClusterSide::Source)
            .await
            .unwrap();
        assert!(!report.is_consistent());
        let report = migration
            .compare_collection_uuids(ClusterSide::Destination)
            .await
            .unwrap();
        assert!(report.is_consistent());

        migration.disable_source_autosplit().await.unwrap();
        assert!(!source.autosplit_enabled());
        assert!(destination.autosplit_enabled());
    }
}
