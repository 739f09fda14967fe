use std::collections::BTreeMap;

use bson::{doc, Bson, Document};

use super::MetadataReplicator;
use crate::cluster::CollectionMetadata;
use crate::config::MetadataStrategy;
use crate::namespace::Namespace;
use crate::operations::bounds::to_raw_document;
use crate::operations::{AdminCommand, MigrationResult};

/// Shard key configuration of one collection, as replicated to the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub namespace: Namespace,
    pub key: Document,
    pub unique: bool,
    pub collation: Option<Document>,
}

impl From<&CollectionMetadata> for CollectionSpec {
    fn from(metadata: &CollectionMetadata) -> Self {
        Self {
            namespace: metadata.namespace.clone(),
            key: metadata.key.clone(),
            unique: metadata.unique,
            collation: metadata.default_collation.clone(),
        }
    }
}

impl CollectionSpec {
    /// Hashed shard keys have `"hashed"` as the value of their first field.
    pub fn is_hashed(&self) -> bool {
        matches!(self.key.values().next(), Some(Bson::String(kind)) if kind == "hashed")
    }

    /// `shardCollection` command using the source collection as a template.
    pub fn shard_command(&self) -> AdminCommand {
        AdminCommand::ShardCollection {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            unique: self.unique,
            collation: self.collation.as_ref().map(|_| doc! { "locale": "simple" }),
            num_initial_chunks: self.is_hashed().then_some(1),
        }
    }

    /// Collection metadata record for the destination config database.
    ///
    /// Fields of `template` other than the shard key configuration are kept as they are.
    pub fn record(&self, template: &Document) -> Document {
        let mut record = template.clone();
        record.insert("_id", self.namespace.to_string());
        record.insert("key", self.key.clone());
        record.insert("unique", self.unique);
        match &self.collation {
            Some(collation) => {
                record.insert("defaultCollation", collation.clone());
            }
            None => {
                record.remove("defaultCollation");
            }
        }
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardOutcome {
    Sharded,
    AlreadySharded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub replicated: usize,
    pub already_sharded: usize,
    pub failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionDiff {
    pub matched: usize,
    pub mismatched: usize,
    pub missing: usize,
    pub sharded: usize,
}

impl MetadataReplicator<'_> {
    /// Source collections which are in scope for this run.
    async fn source_collections(&self) -> MigrationResult<Vec<CollectionMetadata>> {
        let collections = self
            .source
            .sharded_collections()
            .await?
            .into_iter()
            .filter(|collection| {
                let included = self.config.filter.included(&collection.namespace);
                if !included {
                    log::debug!(
                        "Namespace {} filtered, not sharding on destination",
                        collection.namespace
                    );
                }
                included && !collection.namespace.is_config()
            })
            .collect();
        Ok(collections)
    }

    /// Replicate the sharding configuration of every in-scope source collection.
    pub async fn shard_destination_collections(&self) -> MigrationResult<CollectionStats> {
        let mut stats = CollectionStats::default();

        match self.config.strategy {
            MetadataStrategy::Privileged => {
                log::debug!("shardDestinationCollections(), privileged mode");
                for collection in self.source_collections().await? {
                    let spec = CollectionSpec::from(&collection);
                    let record = to_raw_document(&spec.record(&collection.record))?;
                    match self
                        .destination
                        .upsert_collection_record(&spec.namespace, record)
                        .await
                    {
                        Ok(()) => stats.replicated += 1,
                        Err(err) => {
                            log::error!(
                                "Failed to write collection metadata for {}: {err}",
                                spec.namespace
                            );
                            stats.failures += 1;
                        }
                    }
                }
            }
            MetadataStrategy::Unprivileged => {
                log::debug!("shardDestinationCollections(), non-privileged mode");
                for collection in self.source_collections().await? {
                    let spec = CollectionSpec::from(&collection);
                    match self.shard_collection(&spec).await {
                        Ok(ShardOutcome::Sharded) => stats.replicated += 1,
                        Ok(ShardOutcome::AlreadySharded) => stats.already_sharded += 1,
                        Err(err) => {
                            log::error!("Failed to shard collection {}: {err}", spec.namespace);
                            stats.failures += 1;
                            continue;
                        }
                    }

                    if collection.no_balance {
                        log::warn!(
                            "Balancing is disabled for {}, this can not be replicated in non-privileged mode",
                            spec.namespace
                        );
                    }
                }
            }
        }

        log::debug!("shardDestinationCollections() complete: {stats:?}");
        Ok(stats)
    }

    /// Shard one collection on the destination through the `shardCollection` command.
    pub async fn shard_collection(&self, spec: &CollectionSpec) -> MigrationResult<ShardOutcome> {
        match self.destination.run_admin_command(&spec.shard_command()).await {
            Ok(_) => Ok(ShardOutcome::Sharded),
            Err(err) if err.command_error().is_some_and(|err| err.is_already_sharded()) => {
                log::debug!("Sharding already enabled for {}", spec.namespace);
                Ok(ShardOutcome::AlreadySharded)
            }
            Err(err) => Err(err),
        }
    }

    /// Compare the sharded collections of both clusters. With `sync`, shard the collections
    /// which are missing on the destination.
    pub async fn diff_sharded_collections(&self, sync: bool) -> MigrationResult<CollectionDiff> {
        log::debug!("diffShardedCollections()");

        let destination: BTreeMap<Namespace, CollectionMetadata> = self
            .destination
            .sharded_collections()
            .await?
            .into_iter()
            .map(|collection| (collection.namespace.clone(), collection))
            .collect();

        let mut diff = CollectionDiff::default();
        for collection in self.source.sharded_collections().await? {
            if !self.config.filter.included(&collection.namespace) {
                continue;
            }

            match destination.get(&collection.namespace) {
                None => {
                    log::debug!(
                        "Destination collection not found: {} sourceKey: {}",
                        collection.namespace,
                        collection.key
                    );
                    diff.missing += 1;
                    if sync {
                        let spec = CollectionSpec::from(&collection);
                        match self.shard_collection(&spec).await {
                            Ok(_) => {
                                log::debug!("Sharded: {}", spec.namespace);
                                diff.sharded += 1;
                            }
                            Err(err) => log::error!("Error sharding {}: {err}", spec.namespace),
                        }
                    }
                }
                Some(dest) if dest.key == collection.key => {
                    log::debug!("Shard key match for {}", collection.namespace);
                    diff.matched += 1;
                }
                Some(dest) => {
                    log::warn!(
                        "Shard key MISMATCH for {} sourceKey: {} destKey: {}",
                        collection.namespace,
                        collection.key,
                        dest.key
                    );
                    diff.mismatched += 1;
                }
            }
        }

        log::info!("diffShardedCollections complete: {diff:?}");
        Ok(diff)
    }
}
