use super::MetadataReplicator;
use crate::operations::{AdminCommand, MigrationResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    /// Zones assigned to destination shards.
    pub shard_zones: usize,
    pub ranges: usize,
    pub failures: usize,
}

impl ZoneStats {
    fn merge(self, other: ZoneStats) -> ZoneStats {
        ZoneStats {
            shard_zones: self.shard_zones + other.shard_zones,
            ranges: self.ranges + other.ranges,
            failures: self.failures + other.failures,
        }
    }
}

impl MetadataReplicator<'_> {
    /// Assign the zones of every source shard to its mapped destination shard, then replicate
    /// the zone key ranges of in-scope collections.
    ///
    /// The two steps write disjoint config collections (`shards` and `tags`), either may run
    /// first.
    pub async fn replicate_zones(&self) -> MigrationResult<ZoneStats> {
        log::debug!("createDestZones started");
        let stats = self
            .replicate_shard_zones()
            .await?
            .merge(self.replicate_zone_ranges().await?);
        log::debug!("createDestZones complete: {stats:?}");
        Ok(stats)
    }

    pub async fn replicate_shard_zones(&self) -> MigrationResult<ZoneStats> {
        let mut stats = ZoneStats::default();
        for shard in self.source.list_shards().await? {
            if shard.tags.is_empty() {
                continue;
            }
            let mapped_shard = self.shard_map.resolve(&shard.id)?;
            for zone in &shard.tags {
                let command = AdminCommand::AddShardToZone {
                    shard: mapped_shard.clone(),
                    zone: zone.clone(),
                };
                match self.destination.run_admin_command(&command).await {
                    Ok(_) => stats.shard_zones += 1,
                    Err(err) => {
                        log::error!("addShardToZone {mapped_shard} zone {zone} failed: {err}");
                        stats.failures += 1;
                    }
                }
            }
        }
        Ok(stats)
    }

    pub async fn replicate_zone_ranges(&self) -> MigrationResult<ZoneStats> {
        let mut stats = ZoneStats::default();
        for range in self.source.zone_ranges().await? {
            if !self.config.filter.included(&range.namespace) || range.namespace.is_config() {
                continue;
            }
            let command = AdminCommand::UpdateZoneKeyRange {
                namespace: range.namespace.clone(),
                min: range.min.clone(),
                max: range.max.clone(),
                zone: range.zone.clone(),
            };
            match self.destination.run_admin_command(&command).await {
                Ok(_) => stats.ranges += 1,
                Err(err) => {
                    log::error!(
                        "updateZoneKeyRange {} [{}, {}) zone {} failed: {err}",
                        range.namespace,
                        range.min,
                        range.max,
                        range.zone
                    );
                    stats.failures += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use bson::{doc, Bson};

    use super::*;
    use crate::cluster::{CollectionMetadata, ZoneRange};
    use crate::config::RunConfig;
    use crate::namespace::{Namespace, NamespaceFilter};
    use crate::operations::CommandError;
    use crate::shard_map::ShardMap;
    use crate::testing::two_shard_clusters;

    fn zone_range(ns: &Namespace, min: Bson, max: Bson, zone: &str) -> ZoneRange {
        ZoneRange {
            namespace: ns.clone(),
            min: doc! { "_id": min },
            max: doc! { "_id": max },
            zone: zone.to_string(),
        }
    }

    #[tokio::test]
    async fn zones_follow_shard_map() {
        let (source, destination) = two_shard_clusters();
        let ns = Namespace::new("db1", "coll");
        source.set_shard_tags("src0", &["east"]);
        source.set_shard_tags("src1", &["west", "backup"]);
        source.add_zone_range(zone_range(&ns, Bson::MinKey, Bson::Int32(0), "east"));
        source.add_zone_range(zone_range(&ns, Bson::Int32(0), Bson::MaxKey, "west"));
        source.add_zone_range(zone_range(
            &Namespace::new("db2", "other"),
            Bson::MinKey,
            Bson::MaxKey,
            "east",
        ));
        destination.add_collection(CollectionMetadata::new(ns.clone(), doc! { "_id": 1 }, false));

        let shard_map = ShardMap::from_entries(&["src0|dst1", "src1|dst0"]).unwrap();
        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1.coll"]).unwrap(),
            ..RunConfig::default()
        };
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let stats = replicator.replicate_zones().await.unwrap();
        assert_eq!(
            stats,
            ZoneStats {
                shard_zones: 3,
                ranges: 2,
                failures: 0,
            }
        );
        assert_eq!(destination.shard_tags("dst1"), vec!["east".to_string()]);
        assert_eq!(
            destination.shard_tags("dst0"),
            vec!["west".to_string(), "backup".to_string()]
        );

        let ranges = destination.zone_range_list();
        assert_eq!(ranges.len(), 2);
        assert!(ranges.iter().all(|range| range.namespace == ns));
    }

    #[tokio::test]
    async fn ranges_before_shard_zones_give_same_result() {
        let (source, tags_first) = two_shard_clusters();
        let (_, ranges_first) = two_shard_clusters();
        let ns = Namespace::new("db1", "coll");
        source.set_shard_tags("src0", &["east"]);
        source.set_shard_tags("src1", &["west"]);
        source.add_zone_range(zone_range(&ns, Bson::MinKey, Bson::Int32(0), "east"));
        source.add_zone_range(zone_range(&ns, Bson::Int32(0), Bson::MaxKey, "west"));

        let shard_map = ShardMap::from_entries(&["src0|dst1", "src1|dst0"]).unwrap();
        let config = RunConfig::default();

        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &tags_first);
        let shard_zones = replicator.replicate_shard_zones().await.unwrap();
        let ranges = replicator.replicate_zone_ranges().await.unwrap();
        let forward = shard_zones.merge(ranges);

        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &ranges_first);
        let ranges = replicator.replicate_zone_ranges().await.unwrap();
        let shard_zones = replicator.replicate_shard_zones().await.unwrap();
        let backward = ranges.merge(shard_zones);

        assert_eq!(forward, backward);
        assert_eq!(forward.failures, 0);
        for shard in ["dst0", "dst1"] {
            assert_eq!(tags_first.shard_tags(shard), ranges_first.shard_tags(shard));
        }
        assert_eq!(tags_first.shard_tags("dst1"), vec!["east".to_string()]);
        assert_eq!(tags_first.zone_range_list(), ranges_first.zone_range_list());
        assert_eq!(ranges_first.zone_range_list().len(), 2);
    }

    #[tokio::test]
    async fn range_failures_are_counted() {
        let (source, destination) = two_shard_clusters();
        let ns = Namespace::new("db1", "coll");
        source.set_shard_tags("src0", &["east"]);
        source.add_zone_range(zone_range(&ns, Bson::MinKey, Bson::MaxKey, "east"));
        destination.fail_command(
            "updateZoneKeyRange",
            CommandError::new(20, "ns is not sharded"),
        );

        let shard_map = ShardMap::from_entries(&["src0|dst0", "src1|dst1"]).unwrap();
        let config = RunConfig::default();
        let replicator = MetadataReplicator::new(&config, &shard_map, &source, &destination);

        let stats = replicator.replicate_zones().await.unwrap();
        assert_eq!(stats.shard_zones, 1);
        assert_eq!(stats.ranges, 0);
        assert_eq!(stats.failures, 1);
    }
}
