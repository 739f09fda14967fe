use std::time::Duration;

use bson::{doc, Bson};
use migration::cluster::{Chunk, CollectionMetadata};
use migration::config::{MetadataStrategy, RunConfig};
use migration::migration::Migration;
use migration::namespace::{Namespace, NamespaceFilter};
use migration::operations::MigrationError;
use migration::shard_map::ShardMap;
use migration::testing::{legacy_chunk_id, two_shard_clusters, InMemoryCluster};

use crate::common::{collection_namespace, init_logger, source_with_split_collection};

mod common;

const NO_SHARD_MAP: [&str; 0] = [];

fn assert_chunks_on_mapped_shards(
    source: &InMemoryCluster,
    destination: &InMemoryCluster,
    shard_map: &ShardMap,
) {
    let chunks = destination.chunk_list();
    assert_eq!(chunks.len(), 4);
    for chunk in chunks {
        let source_chunk = source.chunk(&chunk.id).unwrap();
        assert_eq!(source_chunk.min, chunk.min);
        assert_eq!(source_chunk.max, chunk.max);
        assert_eq!(&chunk.shard, shard_map.resolve(&source_chunk.shard).unwrap());
    }
}

#[tokio::test]
async fn test_privileged_migration() {
    init_logger();
    let (source, destination) = source_with_split_collection();

    let migration = Migration::connect(RunConfig::default(), &NO_SHARD_MAP, &source, &destination)
        .await
        .unwrap();
    let report = migration.migrate_metadata().await.unwrap();

    assert_eq!(report.replication.failures(), 0);
    assert_eq!(report.replication.sharding.enabled, 1);
    assert_eq!(report.replication.sharding.primaries_moved, 1);
    assert_eq!(report.replication.collections.replicated, 1);
    assert_eq!(report.replication.chunks.created, 4);
    assert_eq!(report.reconcile.total, 4);
    assert_eq!(report.reconcile.matched, 4);
    assert_eq!(report.reconcile.moved, 0);
    assert!(report.reconcile.is_consistent());

    assert_eq!(destination.database_info("db1").unwrap().primary, "dst1");
    let collection = destination
        .collection_metadata(&collection_namespace())
        .unwrap();
    assert_eq!(collection.key, doc! { "_id": 1 });
    assert_chunks_on_mapped_shards(&source, &destination, migration.shard_map());

    assert!(!source.balancer_enabled());
    assert!(!destination.balancer_enabled());
    assert_eq!(destination.flush_count(), 1);

    let compare = migration.compare_chunks().await.unwrap();
    assert_eq!(compare.matched, 4);
    assert_eq!(compare.mismatched, 0);
    assert_eq!(compare.missing, 0);
}

#[tokio::test]
async fn test_unprivileged_migration_is_idempotent() {
    init_logger();
    let (source, destination) = source_with_split_collection();
    let config = RunConfig {
        strategy: MetadataStrategy::Unprivileged,
        ..RunConfig::default()
    };

    let migration = Migration::connect(config, &NO_SHARD_MAP, &source, &destination)
        .await
        .unwrap();
    let report = migration.migrate_metadata().await.unwrap();

    // The initial chunk is created on the database primary, splits keep the owner and the
    // chunks of the other shard are moved afterwards.
    assert_eq!(report.replication.failures(), 0);
    assert_eq!(report.replication.collections.replicated, 1);
    assert_eq!(report.replication.chunks.created, 3);
    assert_eq!(report.replication.chunks.existing, 1);
    assert_eq!(report.reconcile.matched, 4);
    assert_eq!(report.reconcile.moved, 2);
    assert!(report.reconcile.is_consistent());
    assert_eq!(destination.write_count(), 0);
    assert_chunks_on_mapped_shards(&source, &destination, migration.shard_map());

    let commands = destination.admin_commands().len();
    let report = migration.migrate_metadata().await.unwrap();
    assert_eq!(report.replication.sharding.already_enabled, 1);
    assert_eq!(report.replication.collections.already_sharded, 1);
    assert_eq!(report.replication.chunks.created, 0);
    assert_eq!(report.replication.chunks.existing, 4);
    assert_eq!(report.reconcile.moved, 0);
    // Only the enableSharding and shardCollection attempts are repeated.
    assert_eq!(destination.admin_commands().len(), commands + 2);
    assert_chunks_on_mapped_shards(&source, &destination, migration.shard_map());
}

#[tokio::test]
async fn test_explicit_shard_map() {
    init_logger();
    let (source, destination) = source_with_split_collection();

    let migration = Migration::connect(
        RunConfig::default(),
        &["src0|dst1", "src1|dst0"],
        &source,
        &destination,
    )
    .await
    .unwrap();
    migration.migrate_metadata().await.unwrap();

    assert_eq!(destination.database_info("db1").unwrap().primary, "dst0");
    assert_chunks_on_mapped_shards(&source, &destination, migration.shard_map());
}

#[tokio::test]
async fn test_unmapped_primary_aborts_before_writes() {
    let (source, destination) = source_with_split_collection();

    let migration = Migration::connect(RunConfig::default(), &["src0|dst0"], &source, &destination)
        .await
        .unwrap();
    let err = migration.migrate_metadata().await.unwrap_err();
    assert!(
        matches!(&err, MigrationError::MissingMappedPrimary { primary, .. } if primary == "src1"),
        "{err}"
    );
    assert!(err.is_configuration_error());
    assert!(destination.admin_commands().is_empty());
    assert_eq!(destination.write_count(), 0);
}

#[tokio::test]
async fn test_filtered_migration_skips_other_databases() {
    init_logger();
    let (source, destination) = source_with_split_collection();
    source.add_database("db2", "src0");
    source.add_database_on_shard("src0", "db2");
    source.add_sharded_collection(&Namespace::new("db2", "other"), doc! { "k": 1 }, "src0");

    let config = RunConfig {
        filter: NamespaceFilter::from_entries(&["db1.coll"]).unwrap(),
        ..RunConfig::default()
    };
    let migration = Migration::connect(config, &NO_SHARD_MAP, &source, &destination)
        .await
        .unwrap();
    let report = migration.migrate_metadata().await.unwrap();

    assert_eq!(report.reconcile.total, 4);
    assert!(destination.database_info("db2").is_none());
    assert_eq!(destination.sharded_collection_count(), 1);
}

#[tokio::test]
async fn test_counts_after_migration() {
    let (source, destination) = source_with_split_collection();
    let ns = collection_namespace();
    source.set_document_count(&ns, 100);
    destination.set_document_count(&ns, 100);

    let migration = Migration::connect(RunConfig::default(), &NO_SHARD_MAP, &source, &destination)
        .await
        .unwrap();
    let report = migration.compare_counts(Duration::ZERO).await.unwrap();
    assert_eq!(report.matched, 1);
    assert!(report.mismatched.is_empty());

    destination.set_document_count(&ns, 99);
    let report = migration.compare_counts(Duration::ZERO).await.unwrap();
    assert_eq!(report.mismatched.len(), 1);
    assert_eq!(report.mismatched[0].destination, 99);
}

#[tokio::test]
async fn test_dotted_shard_key_replicates_privileged() {
    init_logger();
    let (source, destination) = two_shard_clusters();
    let ns = Namespace::new("db1", "nested");
    let key = doc! { "_id.x": 1 };

    source.add_database("db1", "src0");
    source.add_database_on_shard("src0", "db1");
    source.add_collection(CollectionMetadata::new(ns.clone(), key.clone(), false));
    let bounds = [
        doc! { "_id.x": Bson::MinKey },
        doc! { "_id.x": 0 },
        doc! { "_id.x": Bson::MaxKey },
    ];
    for (i, window) in bounds.windows(2).enumerate() {
        source.add_chunk(Chunk::new(
            legacy_chunk_id(&ns, &window[0]),
            ns.clone(),
            window[0].clone(),
            window[1].clone(),
            format!("src{i}"),
        ));
    }

    let migration = Migration::connect(RunConfig::default(), &NO_SHARD_MAP, &source, &destination)
        .await
        .unwrap();
    let report = migration.migrate_metadata().await.unwrap();

    assert_eq!(report.replication.failures(), 0);
    assert_eq!(report.replication.collections.replicated, 1);
    assert_eq!(report.replication.chunks.created, 2);
    assert!(report.reconcile.is_consistent());
    assert_eq!(destination.collection_metadata(&ns).unwrap().key, key);
    for chunk in destination.chunk_list() {
        assert_eq!(chunk.min, source.chunk(&chunk.id).unwrap().min);
    }

    // The same records are refused by a structured write.
    let collection = source.collection_metadata(&ns).unwrap();
    let err = destination
        .upsert_collection_document(&ns, &collection.record)
        .unwrap_err();
    assert!(err.to_string().contains("must not contain '.'"), "{err}");
    let chunk = source.chunk_list().remove(0);
    assert!(destination.insert_chunk_document(&chunk.record).is_err());
}
