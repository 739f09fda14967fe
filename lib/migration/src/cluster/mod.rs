//! The view of a sharded cluster the migration engine works against.
//!
//! [`ClusterClient`] is implemented by the driver adapter of the binary and by the in-memory
//! cluster used in tests. Reads mirror the config server collections (`config.shards`,
//! `config.databases`, `config.collections`, `config.chunks`, `config.tags`).

mod model;

use std::time::Duration;

use async_trait::async_trait;
use bson::{Document, RawDocumentBuf};
use futures::stream::BoxStream;
use semver::Version;

pub use self::model::*;
use crate::namespace::Namespace;
use crate::operations::{AdminCommand, MigrationResult};

/// Selection of chunk records. Results are always sorted by `(ns, min)`.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkQuery {
    All,
    /// Chunks of every collection in `database`.
    Database(String),
    /// Chunk with exactly this identity.
    Identity {
        id: String,
        min: Document,
        max: Document,
    },
    Id(String),
}

impl ChunkQuery {
    pub fn matches(&self, chunk: &Chunk) -> bool {
        match self {
            ChunkQuery::All => true,
            ChunkQuery::Database(database) => chunk.namespace.database() == database,
            ChunkQuery::Identity { id, min, max } => {
                &chunk.id == id && &chunk.min == min && &chunk.max == max
            }
            ChunkQuery::Id(id) => &chunk.id == id,
        }
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Short label used in logs, e.g. `source` or `dest`.
    fn name(&self) -> &str;

    /// Connection material forwarded to mirror processes.
    fn connection(&self) -> &ConnectionInfo;

    /// Shards in their natural listing order.
    async fn list_shards(&self) -> MigrationResult<Vec<Shard>>;

    async fn list_databases(&self) -> MigrationResult<Vec<DatabaseInfo>>;

    async fn database(&self, name: &str) -> MigrationResult<Option<DatabaseInfo>>;

    /// Database names physically present on one shard.
    async fn shard_database_names(&self, shard: &str) -> MigrationResult<Vec<String>>;

    async fn create_database(&self, name: &str) -> MigrationResult<()>;

    async fn drop_database(&self, name: &str) -> MigrationResult<()>;

    /// Remove routing metadata of `database` left behind by a drop: config server records and
    /// the routing caches of every shard.
    async fn purge_config_metadata(&self, database: &str) -> MigrationResult<()>;

    /// UUIDs of every collection stored on one shard, read from the shard directly.
    async fn shard_collection_uuids(&self, shard: &str) -> MigrationResult<Vec<CollectionUuid>>;

    /// Sharded collections, excluding dropped ones.
    async fn sharded_collections(&self) -> MigrationResult<Vec<CollectionMetadata>>;

    async fn list_collection_names(&self, database: &str) -> MigrationResult<Vec<String>>;

    async fn count_documents(&self, namespace: &Namespace) -> MigrationResult<u64>;

    async fn chunks(
        &self,
        query: &ChunkQuery,
    ) -> MigrationResult<BoxStream<'_, MigrationResult<Chunk>>>;

    async fn count_chunks(&self, query: &ChunkQuery) -> MigrationResult<u64>;

    /// Zone ranges sorted by `(ns, min)`.
    async fn zone_ranges(&self) -> MigrationResult<Vec<ZoneRange>>;

    /// Replace (or insert) the collection metadata record of `namespace`.
    ///
    /// The record is passed as raw bytes and must be written without field name validation.
    async fn upsert_collection_record(
        &self,
        namespace: &Namespace,
        record: RawDocumentBuf,
    ) -> MigrationResult<()>;

    /// Insert a chunk record, written without field name validation.
    async fn insert_chunk_record(&self, record: RawDocumentBuf) -> MigrationResult<()>;

    async fn run_admin_command(&self, command: &AdminCommand) -> MigrationResult<Document>;

    async fn flush_router_config(&self) -> MigrationResult<()>;

    async fn stop_balancer(&self) -> MigrationResult<()>;

    /// Turn off automatic chunk splitting cluster wide.
    async fn disable_autosplit(&self) -> MigrationResult<()>;

    async fn cluster_version(&self) -> MigrationResult<Version>;
}

/// Orphaned document sweep, run by the owner of per-shard connections.
#[async_trait]
pub trait OrphanCleaner: Send + Sync {
    /// Remove orphaned documents of `collections` on every shard, pausing `pause` between
    /// command batches.
    async fn cleanup_orphans(
        &self,
        collections: &[CollectionMetadata],
        pause: Duration,
    ) -> MigrationResult<()>;
}
