use super::MetadataReplicator;
use crate::cluster::DatabaseInfo;
use crate::namespace::CONFIG_DATABASE;
use crate::operations::{AdminCommand, MigrationError, MigrationResult};
use crate::shard_map::ShardId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ShardingStats {
    pub enabled: usize,
    pub already_enabled: usize,
    pub created: usize,
    pub primaries_moved: usize,
    pub move_primary_failures: usize,
    /// Databases missing on their source primary shard.
    pub skipped: usize,
}

impl MetadataReplicator<'_> {
    /// Enable sharding for every in-scope source database on the destination, and place each
    /// destination database on the image of its source primary shard.
    pub async fn enable_destination_sharding(&self) -> MigrationResult<ShardingStats> {
        log::debug!("enableDestinationSharding()");

        // Resolve every mapped primary up front, an unmapped one aborts before any write.
        let mut plan: Vec<(DatabaseInfo, ShardId)> = Vec::new();
        for database in self.source.list_databases().await? {
            if database.is_reserved() {
                continue;
            }
            if !self.config.filter.database_included(&database.name) {
                log::debug!(
                    "Database {} filtered, not sharding on destination",
                    database.name
                );
                continue;
            }
            let mapped_primary = self
                .shard_map
                .get(&database.primary)
                .cloned()
                .ok_or_else(|| MigrationError::MissingMappedPrimary {
                    database: database.name.clone(),
                    primary: database.primary.clone(),
                })?;
            log::debug!(
                "database: {}, primary: {}, mappedPrimary: {mapped_primary}",
                database.name,
                database.primary
            );
            plan.push((database, mapped_primary));
        }

        let mut stats = ShardingStats::default();
        for (database, mapped_primary) in plan {
            self.enable_database_sharding(&database, &mapped_primary, &mut stats)
                .await?;
        }

        log::debug!("enableDestinationSharding() complete: {stats:?}");
        Ok(stats)
    }

    async fn enable_database_sharding(
        &self,
        database: &DatabaseInfo,
        mapped_primary: &str,
        stats: &mut ShardingStats,
    ) -> MigrationResult<()> {
        let name = &database.name;

        if database.partitioned {
            log::debug!("enableSharding: {name}");
            let command = AdminCommand::EnableSharding {
                database: name.clone(),
            };
            match self.destination.run_admin_command(&command).await {
                Ok(_) => stats.enabled += 1,
                Err(err)
                    if err
                        .command_error()
                        .is_some_and(|err| err.is_sharding_already_enabled()) =>
                {
                    log::debug!("Sharding already enabled: {name}");
                    stats.already_enabled += 1;
                }
                Err(err) => return Err(err),
            }
        }

        let source_databases = self.source.shard_database_names(&database.primary).await?;
        if !source_databases.iter().any(|db| db == name) {
            log::warn!(
                "Database: {name} does not exist on source shard {}, skipping",
                database.primary
            );
            stats.skipped += 1;
            return Ok(());
        }

        let destination_database = match self.destination.database(name).await? {
            Some(existing) => existing,
            None => {
                self.destination.create_database(name).await?;
                stats.created += 1;
                self.destination.database(name).await?.ok_or_else(|| {
                    MigrationError::not_found(format!("Destination database {name}"))
                })?
            }
        };

        if destination_database.primary == mapped_primary {
            log::debug!("Primary shard already matches for database: {name}");
            return Ok(());
        }

        log::debug!(
            "movePrimary for database: {name} from {} to {mapped_primary}",
            destination_database.primary
        );
        let command = AdminCommand::MovePrimary {
            database: name.clone(),
            to: mapped_primary.to_string(),
        };
        match self.destination.run_admin_command(&command).await {
            Ok(_) => stats.primaries_moved += 1,
            Err(err) => {
                log::warn!("movePrimary for database: {name} to {mapped_primary} failed: {err}");
                stats.move_primary_failures += 1;
            }
        }
        Ok(())
    }

    /// Source databases which may be dropped on the destination: only whole databases, a
    /// listed namespace never puts its database in scope.
    async fn databases_to_drop(&self) -> MigrationResult<Vec<String>> {
        let mut names = Vec::new();
        for database in self.source.list_databases().await? {
            if database.is_reserved() || database.name == CONFIG_DATABASE {
                continue;
            }
            if !self.config.filter.whole_database_included(&database.name) {
                log::debug!(
                    "Database {} filtered, not dropping on destination",
                    database.name
                );
                continue;
            }
            names.push(database.name);
        }
        Ok(names)
    }

    /// Drop every in-scope source database on the destination. Returns the dropped names.
    pub async fn drop_destination_databases(&self) -> MigrationResult<Vec<String>> {
        let mut dropped = Vec::new();
        for name in self.databases_to_drop().await? {
            if self.destination.database(&name).await?.is_none() {
                continue;
            }
            log::info!("Dropping destination database {name}");
            self.destination.drop_database(&name).await?;
            dropped.push(name);
        }
        Ok(dropped)
    }

    /// Like [`Self::drop_destination_databases`], then remove whatever routing metadata of those
    /// databases is left on the config servers and in the shard caches.
    ///
    /// Databases already gone on the destination are purged as well.
    pub async fn drop_destination_databases_and_config_metadata(
        &self,
    ) -> MigrationResult<Vec<String>> {
        log::debug!("dropDestinationDatabasesAndConfigMetadata()");
        let names = self.databases_to_drop().await?;
        for name in &names {
            if self.destination.database(name).await?.is_some() {
                log::info!("Dropping destination database {name}");
                self.destination.drop_database(name).await?;
            }
            self.destination.purge_config_metadata(name).await?;
        }
        log::debug!("dropDestinationDatabasesAndConfigMetadata() complete");
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use bson::{doc, Bson};

    use super::*;
    use crate::cluster::ZoneRange;
    use crate::config::RunConfig;
    use crate::namespace::{Namespace, NamespaceFilter};
    use crate::operations::CommandError;
    use crate::shard_map::ShardMap;
    use crate::testing::two_shard_clusters;

    #[tokio::test]
    async fn creates_database_on_mapped_primary() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src1");
        source.add_database_on_shard("src1", "db1");

        let shard_map = ShardMap::from_entries(&["src0|dst0", "src1|dst1"]).unwrap();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let stats = replicator.enable_destination_sharding().await.unwrap();
        assert_eq!(stats.enabled, 1);
        let db = destination.database_info("db1").unwrap();
        assert_eq!(db.primary, "dst1");
        assert!(db.partitioned);

        // A second run finds everything in place
        let stats = replicator.enable_destination_sharding().await.unwrap();
        assert_eq!(stats.enabled, 0);
        assert_eq!(stats.already_enabled, 1);
        assert_eq!(stats.primaries_moved, 0);
        assert_eq!(stats.created, 0);
    }

    #[tokio::test]
    async fn unmapped_primary_aborts_before_writes() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src0");
        source.add_database("db2", "src1");

        let shard_map = ShardMap::from_entries(&["src0|dst0"]).unwrap();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let err = replicator.enable_destination_sharding().await.unwrap_err();
        assert!(matches!(err, MigrationError::MissingMappedPrimary { .. }));
        assert_eq!(destination.admin_commands().len(), 0);
    }

    #[tokio::test]
    async fn filtered_and_reserved_databases_are_ignored() {
        let (source, destination) = two_shard_clusters();
        source.add_database("admin", "src0");
        source.add_database("db1", "src0");
        source.add_database("db2", "src0");
        source.add_database_on_shard("src0", "db1");

        let shard_map = ShardMap::from_entries(&["src0|dst0", "src1|dst1"]).unwrap();
        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1.coll"]).unwrap(),
            ..RunConfig::default()
        };
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        replicator.enable_destination_sharding().await.unwrap();
        assert!(destination.database_info("db1").is_some());
        assert!(destination.database_info("db2").is_none());
        assert!(destination.database_info("admin").is_none());
    }

    #[tokio::test]
    async fn enable_sharding_error_is_fatal() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src0");
        destination.fail_command("enableSharding", CommandError::new(13, "not authorized"));

        let shard_map = ShardMap::from_entries(&["src0|dst0"]).unwrap();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let err = replicator.enable_destination_sharding().await.unwrap_err();
        assert_eq!(err.command_error().map(|err| err.code), Some(13));
    }

    #[tokio::test]
    async fn move_primary_failure_is_not_fatal() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src1");
        source.add_database_on_shard("src1", "db1");
        destination.fail_command("movePrimary", CommandError::new(1, "boom"));

        let shard_map = ShardMap::from_entries(&["src0|dst0", "src1|dst1"]).unwrap();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let stats = replicator.enable_destination_sharding().await.unwrap();
        assert_eq!(stats.move_primary_failures, 1);
        assert_eq!(destination.database_info("db1").unwrap().primary, "dst0");
    }

    #[tokio::test]
    async fn drops_only_in_scope_databases() {
        let (source, destination) = two_shard_clusters();
        for name in ["db1", "db2", "admin"] {
            source.add_database(name, "src0");
            destination.add_database(name, "dst0");
        }
        source.add_database("db3", "src0");

        let shard_map = ShardMap::default();
        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1", "db3"]).unwrap(),
            ..RunConfig::default()
        };
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let dropped = replicator.drop_destination_databases().await.unwrap();
        assert_eq!(dropped, vec!["db1".to_string()]);
        assert!(destination.database_info("db1").is_none());
        assert!(destination.database_info("db2").is_some());
        assert!(destination.database_info("admin").is_some());
    }

    #[tokio::test]
    async fn namespace_filter_drops_no_database() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src0");
        destination.add_database("db1", "dst0");
        let other = Namespace::new("db1", "other");
        destination.add_sharded_collection(&other, doc! { "_id": 1 }, "dst0");

        let shard_map = ShardMap::default();
        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1.coll"]).unwrap(),
            ..RunConfig::default()
        };
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let dropped = replicator.drop_destination_databases().await.unwrap();
        assert!(dropped.is_empty());
        let dropped = replicator
            .drop_destination_databases_and_config_metadata()
            .await
            .unwrap();
        assert!(dropped.is_empty());
        assert!(destination.database_info("db1").is_some());
        assert!(destination.collection_metadata(&other).is_some());
        assert_eq!(destination.write_count(), 0);
    }

    #[tokio::test]
    async fn config_metadata_is_purged_with_databases() {
        let (source, destination) = two_shard_clusters();
        let ns = Namespace::new("db1", "coll");
        source.add_database("db1", "src0");
        destination.add_database("db1", "dst0");
        destination.add_sharded_collection(&ns, doc! { "_id": 1 }, "dst0");
        destination.add_zone_range(ZoneRange {
            namespace: ns.clone(),
            min: doc! { "_id": Bson::MinKey },
            max: doc! { "_id": Bson::MaxKey },
            zone: "east".to_string(),
        });

        let shard_map = ShardMap::default();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        // A plain drop leaves the zone ranges behind
        replicator.drop_destination_databases().await.unwrap();
        assert!(destination.database_info("db1").is_none());
        assert_eq!(destination.zone_range_list().len(), 1);

        let purged = replicator
            .drop_destination_databases_and_config_metadata()
            .await
            .unwrap();
        assert_eq!(purged, vec!["db1".to_string()]);
        assert!(destination.zone_range_list().is_empty());
        assert!(destination.chunk_list().is_empty());
        assert_eq!(destination.purged_databases(), vec!["db1".to_string()]);
    }
}
