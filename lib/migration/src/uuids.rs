//! Consistency of collection UUIDs across the shards of one cluster.
//!
//! Every shard holding data of a collection must know it under the same UUID. Copies made
//! without `preserveUUIDs` or collections recreated on a single shard break this, and
//! chunk migrations between shards which disagree fail.

use std::collections::BTreeMap;

use crate::cluster::ClusterClient;
use crate::config::RunConfig;
use crate::namespace::{Namespace, CONFIG_DATABASE};
use crate::operations::MigrationResult;
use crate::shard_map::ShardId;

const SKIPPED_DATABASES: [&str; 3] = ["admin", CONFIG_DATABASE, "local"];

/// Suffix of temporary collections left behind by interrupted initial syncs.
const TEMPORARY_COLLECTION_SUFFIX: &str = ".create";

/// For every namespace, the shards holding it grouped by UUID.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UuidReport {
    pub collections: BTreeMap<Namespace, BTreeMap<Option<String>, Vec<ShardId>>>,
}

impl UuidReport {
    /// Namespaces known under more than one UUID.
    pub fn inconsistent(&self) -> impl Iterator<Item = &Namespace> {
        self.collections
            .iter()
            .filter(|(_, uuids)| uuids.len() > 1)
            .map(|(namespace, _)| namespace)
    }

    pub fn is_consistent(&self) -> bool {
        self.inconsistent().next().is_none()
    }
}

/// Read the collection UUIDs of every shard of `cluster` and group them per namespace.
pub async fn compare_collection_uuids(
    config: &RunConfig,
    cluster: &dyn ClusterClient,
) -> MigrationResult<UuidReport> {
    log::debug!("Starting compareCollectionUuids on {}", cluster.name());
    let mut report = UuidReport::default();

    for shard in cluster.list_shards().await? {
        for entry in cluster.shard_collection_uuids(&shard.id).await? {
            let namespace = entry.namespace;
            if SKIPPED_DATABASES.contains(&namespace.database())
                || namespace.collection().ends_with(TEMPORARY_COLLECTION_SUFFIX)
                || !config.filter.included(&namespace)
            {
                continue;
            }
            report
                .collections
                .entry(namespace)
                .or_default()
                .entry(entry.uuid)
                .or_default()
                .push(shard.id.clone());
        }
    }

    for (namespace, uuids) in &report.collections {
        log::debug!("{namespace} ==> {uuids:?}");
        if uuids.len() > 1 {
            log::warn!("{namespace} has {} different UUIDs across shards: {uuids:?}", uuids.len());
        }
    }
    log::info!(
        "Compared UUIDs of {} collections on {}, {} inconsistent",
        report.collections.len(),
        cluster.name(),
        report.inconsistent().count()
    );
    Ok(report)
}
