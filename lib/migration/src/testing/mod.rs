//! In-memory sharded cluster for tests.
//!
//! [`InMemoryCluster`] keeps the config metadata of one cluster and interprets administrative
//! commands the way a router would, closely enough to drive the whole engine end to end.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use bson::{doc, Bson, Document, RawDocumentBuf};
use futures::stream::{self, BoxStream, StreamExt as _};
use parking_lot::Mutex;
use semver::Version;

use crate::cluster::{
    Chunk, ChunkQuery, ClusterClient, CollectionMetadata, CollectionUuid, ConnectionInfo,
    DatabaseInfo, Shard, ZoneRange,
};
use crate::namespace::Namespace;
use crate::operations::bounds::{compare_bounds, validate_field_names};
use crate::operations::{AdminCommand, CommandError, MigrationError, MigrationResult};
use crate::shard_map::ShardId;

const BAD_VALUE_CODE: i32 = 2;
const NAMESPACE_NOT_FOUND_CODE: i32 = 26;
const SHARD_NOT_FOUND_CODE: i32 = 70;
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Chunk id in the legacy `{ns}-{field}_{value}` format.
pub fn legacy_chunk_id(namespace: &Namespace, min: &Document) -> String {
    let key: String = min
        .iter()
        .map(|(field, value)| {
            let value = match value {
                Bson::MinKey => "MinKey".to_string(),
                Bson::MaxKey => "MaxKey".to_string(),
                Bson::String(value) => value.clone(),
                other => other.to_string(),
            };
            format!("{field}_{value}")
        })
        .collect();
    format!("{namespace}-{key}")
}

fn key_bound(key: &Document, bound: Bson) -> Document {
    key.keys()
        .map(|field| (field.clone(), bound.clone()))
        .collect()
}

fn chunk_order(a: &Chunk, b: &Chunk) -> Ordering {
    a.namespace
        .cmp(&b.namespace)
        .then_with(|| compare_bounds(&a.min, &b.min))
}

#[derive(Default)]
struct ClusterState {
    shards: Vec<Shard>,
    databases: BTreeMap<String, DatabaseInfo>,
    shard_databases: HashMap<ShardId, BTreeSet<String>>,
    collections: BTreeMap<Namespace, CollectionMetadata>,
    chunks: Vec<Chunk>,
    zone_ranges: Vec<ZoneRange>,
    document_counts: BTreeMap<Namespace, u64>,
    balancer_enabled: bool,
    autosplit_enabled: bool,
    balancer_stop_failure: Option<CommandError>,
    chunk_lookup_failure: Option<CommandError>,
    collection_uuids: HashMap<ShardId, Vec<CollectionUuid>>,
    purged: Vec<String>,
    command_failures: HashMap<String, CommandError>,
    targeted_failures: HashMap<(String, String), CommandError>,
    admin_commands: Vec<AdminCommand>,
    writes: usize,
    flushes: usize,
}

impl ClusterState {
    fn first_shard(&self) -> Result<ShardId, CommandError> {
        self.shards
            .first()
            .map(|shard| shard.id.clone())
            .ok_or_else(|| CommandError::new(SHARD_NOT_FOUND_CODE, "no shards in cluster"))
    }

    fn shard_mut(&mut self, id: &str) -> Result<&mut Shard, CommandError> {
        self.shards
            .iter_mut()
            .find(|shard| shard.id == id)
            .ok_or_else(|| {
                CommandError::new(SHARD_NOT_FOUND_CODE, format!("shard {id} not found"))
            })
    }

    fn ensure_database(&mut self, name: &str, partitioned: bool) -> Result<(), CommandError> {
        if !self.databases.contains_key(name) {
            let primary = self.first_shard()?;
            self.databases.insert(
                name.to_string(),
                DatabaseInfo {
                    name: name.to_string(),
                    primary,
                    partitioned,
                },
            );
        }
        Ok(())
    }

    fn sort_chunks(&mut self) {
        self.chunks.sort_by(chunk_order);
    }

    fn store_collection_record(
        &mut self,
        namespace: &Namespace,
        record: &Document,
    ) -> MigrationResult<()> {
        let collection = CollectionMetadata::from_document(record)?;
        if &collection.namespace != namespace {
            return Err(MigrationError::bad_input(format!(
                "record of {} written as {namespace}",
                collection.namespace
            )));
        }
        self.collections.insert(namespace.clone(), collection);
        self.writes += 1;
        Ok(())
    }

    fn store_chunk_record(&mut self, record: &Document) -> MigrationResult<()> {
        let chunk = Chunk::from_document(record)?;
        if self.chunks.iter().any(|existing| existing.id == chunk.id) {
            return Err(MigrationError::command(
                "insert",
                CommandError::new(DUPLICATE_KEY_CODE, format!("duplicate chunk {}", chunk.id)),
            ));
        }
        self.chunks.push(chunk);
        self.sort_chunks();
        self.writes += 1;
        Ok(())
    }

    fn failure_for(&self, command: &AdminCommand) -> Option<CommandError> {
        let name = command.name().to_string();
        if let Some(err) = self.command_failures.get(&name) {
            return Some(err.clone());
        }
        let target = command
            .to_document()
            .iter()
            .next()
            .and_then(|(_, value)| value.as_str().map(ToString::to_string))?;
        self.targeted_failures.get(&(name, target)).cloned()
    }

    fn apply(&mut self, command: &AdminCommand) -> Result<(), CommandError> {
        match command {
            AdminCommand::EnableSharding { database } => {
                match self.databases.get(database).map(|info| info.partitioned) {
                    Some(true) => Err(CommandError::new(
                        23,
                        format!("sharding already enabled for database {database}"),
                    )),
                    Some(false) => {
                        if let Some(info) = self.databases.get_mut(database) {
                            info.partitioned = true;
                        }
                        Ok(())
                    }
                    None => self.ensure_database(database, true),
                }
            }
            AdminCommand::MovePrimary { database, to } => {
                self.shard_mut(to)?;
                let info = self.databases.get_mut(database).ok_or_else(|| {
                    CommandError::new(NAMESPACE_NOT_FOUND_CODE, format!("{database} not found"))
                })?;
                info.primary = to.clone();
                Ok(())
            }
            AdminCommand::ShardCollection {
                namespace,
                key,
                unique,
                collation,
                ..
            } => {
                if self
                    .collections
                    .get(namespace)
                    .is_some_and(|collection| !collection.dropped)
                {
                    return Err(CommandError::new(
                        20,
                        format!("sharding already enabled for collection {namespace}"),
                    ));
                }
                self.ensure_database(namespace.database(), true)?;
                let primary = self
                    .databases
                    .get(namespace.database())
                    .map(|info| info.primary.clone())
                    .ok_or_else(|| {
                        CommandError::new(NAMESPACE_NOT_FOUND_CODE, namespace.database())
                    })?;

                let mut metadata = CollectionMetadata::new(namespace.clone(), key.clone(), *unique);
                metadata.default_collation = collation.clone();
                self.collections.insert(namespace.clone(), metadata);

                let min = key_bound(key, Bson::MinKey);
                self.chunks.push(Chunk::new(
                    legacy_chunk_id(namespace, &min),
                    namespace.clone(),
                    min,
                    key_bound(key, Bson::MaxKey),
                    primary,
                ));
                self.sort_chunks();
                Ok(())
            }
            AdminCommand::Split { namespace, middle } => {
                let index = self
                    .chunks
                    .iter()
                    .position(|chunk| {
                        &chunk.namespace == namespace
                            && compare_bounds(&chunk.min, middle) == Ordering::Less
                            && compare_bounds(middle, &chunk.max) == Ordering::Less
                    })
                    .ok_or_else(|| {
                        CommandError::new(
                            BAD_VALUE_CODE,
                            format!("cannot split {namespace} on chunk boundary {middle}"),
                        )
                    })?;

                let original = self.chunks[index].clone();
                self.chunks[index] = Chunk::new(
                    original.id.as_str(),
                    namespace.clone(),
                    original.min.clone(),
                    middle.clone(),
                    original.shard.as_str(),
                );
                self.chunks.push(Chunk::new(
                    legacy_chunk_id(namespace, middle),
                    namespace.clone(),
                    middle.clone(),
                    original.max,
                    original.shard,
                ));
                self.sort_chunks();
                Ok(())
            }
            AdminCommand::MoveChunk {
                namespace,
                min,
                max,
                to,
            } => {
                self.shard_mut(to)?;
                let chunk = self
                    .chunks
                    .iter_mut()
                    .find(|chunk| {
                        &chunk.namespace == namespace && &chunk.min == min && &chunk.max == max
                    })
                    .ok_or_else(|| {
                        let message = format!("no chunk of {namespace} at {min}");
                        CommandError::new(BAD_VALUE_CODE, message)
                    })?;
                chunk.record = chunk.record_on(to);
                chunk.shard = to.clone();
                Ok(())
            }
            AdminCommand::AddShardToZone { shard, zone } => {
                let shard = self.shard_mut(shard)?;
                if !shard.tags.contains(zone) {
                    shard.tags.push(zone.clone());
                }
                Ok(())
            }
            AdminCommand::UpdateZoneKeyRange {
                namespace,
                min,
                max,
                zone,
            } => {
                self.zone_ranges
                    .retain(|range| !(&range.namespace == namespace && &range.min == min));
                self.zone_ranges.push(ZoneRange {
                    namespace: namespace.clone(),
                    min: min.clone(),
                    max: max.clone(),
                    zone: zone.clone(),
                });
                Ok(())
            }
            AdminCommand::CleanupOrphaned { .. } => Ok(()),
        }
    }
}

/// A sharded cluster held in memory.
pub struct InMemoryCluster {
    name: String,
    connection: ConnectionInfo,
    version: Version,
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_shards(name, Vec::new())
    }

    pub fn with_shards(name: impl Into<String>, shards: Vec<Shard>) -> Self {
        let name = name.into();
        Self {
            connection: ConnectionInfo {
                hosts: vec![format!("{name}-mongos:27017")],
                replica_set: None,
                credentials: None,
                tls: false,
            },
            version: Version::new(4, 0, 0),
            state: Mutex::new(ClusterState {
                shards,
                balancer_enabled: true,
                autosplit_enabled: true,
                ..ClusterState::default()
            }),
            name,
        }
    }

    pub fn set_connection(&mut self, connection: ConnectionInfo) {
        self.connection = connection;
    }

    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    pub fn shard_host(&self, shard: &str) -> String {
        self.state
            .lock()
            .shards
            .iter()
            .find(|candidate| candidate.id == shard)
            .map(|candidate| candidate.host.clone())
            .unwrap_or_default()
    }

    pub fn set_shard_tags(&self, shard: &str, tags: &[&str]) {
        let mut state = self.state.lock();
        if let Some(shard) = state.shards.iter_mut().find(|candidate| candidate.id == shard) {
            shard.tags = tags.iter().map(ToString::to_string).collect();
        }
    }

    pub fn shard_tags(&self, shard: &str) -> Vec<String> {
        self.state
            .lock()
            .shards
            .iter()
            .find(|candidate| candidate.id == shard)
            .map(|candidate| candidate.tags.clone())
            .unwrap_or_default()
    }

    /// Register a partitioned database with the given primary shard.
    pub fn add_database(&self, name: &str, primary: &str) {
        self.state.lock().databases.insert(
            name.to_string(),
            DatabaseInfo {
                name: name.to_string(),
                primary: primary.to_string(),
                partitioned: true,
            },
        );
    }

    /// Make `database` physically present on `shard`.
    pub fn add_database_on_shard(&self, shard: &str, database: &str) {
        self.state
            .lock()
            .shard_databases
            .entry(shard.to_string())
            .or_default()
            .insert(database.to_string());
    }

    pub fn database_info(&self, name: &str) -> Option<DatabaseInfo> {
        self.state.lock().databases.get(name).cloned()
    }

    pub fn add_collection(&self, collection: CollectionMetadata) {
        self.state
            .lock()
            .collections
            .insert(collection.namespace.clone(), collection);
    }

    /// Shard `namespace` on `key` with a single chunk owned by `shard`.
    pub fn add_sharded_collection(&self, namespace: &Namespace, key: Document, shard: &str) {
        let min = key_bound(&key, Bson::MinKey);
        let max = key_bound(&key, Bson::MaxKey);
        self.add_chunk(Chunk::new(
            legacy_chunk_id(namespace, &min),
            namespace.clone(),
            min,
            max,
            shard,
        ));
        self.add_collection(CollectionMetadata::new(namespace.clone(), key, false));
    }

    pub fn collection_metadata(&self, namespace: &Namespace) -> Option<CollectionMetadata> {
        self.state.lock().collections.get(namespace).cloned()
    }

    pub fn sharded_collection_count(&self) -> usize {
        self.state.lock().collections.len()
    }

    pub fn add_chunk(&self, chunk: Chunk) {
        let mut state = self.state.lock();
        state.chunks.push(chunk);
        state.sort_chunks();
    }

    pub fn chunk(&self, id: &str) -> Option<Chunk> {
        self.state
            .lock()
            .chunks
            .iter()
            .find(|chunk| chunk.id == id)
            .cloned()
    }

    /// Every chunk, sorted by `(ns, min)`.
    pub fn chunk_list(&self) -> Vec<Chunk> {
        self.state.lock().chunks.clone()
    }

    pub fn add_zone_range(&self, range: ZoneRange) {
        self.state.lock().zone_ranges.push(range);
    }

    pub fn zone_range_list(&self) -> Vec<ZoneRange> {
        self.state.lock().zone_ranges.clone()
    }

    pub fn set_document_count(&self, namespace: &Namespace, count: u64) {
        self.state
            .lock()
            .document_counts
            .insert(namespace.clone(), count);
    }

    pub fn balancer_enabled(&self) -> bool {
        self.state.lock().balancer_enabled
    }

    pub fn autosplit_enabled(&self) -> bool {
        self.state.lock().autosplit_enabled
    }

    /// Record the UUID `namespace` has on `shard`.
    pub fn set_collection_uuid(&self, shard: &str, namespace: &Namespace, uuid: Option<&str>) {
        self.state
            .lock()
            .collection_uuids
            .entry(shard.to_string())
            .or_default()
            .push(CollectionUuid {
                namespace: namespace.clone(),
                uuid: uuid.map(ToString::to_string),
            });
    }

    /// Databases whose config metadata was purged, in order.
    pub fn purged_databases(&self) -> Vec<String> {
        self.state.lock().purged.clone()
    }

    /// Insert a chunk record through a structured write, which validates field names the way
    /// the server does for ordinary documents.
    pub fn insert_chunk_document(&self, record: &Document) -> MigrationResult<()> {
        validate_field_names(record)?;
        self.state.lock().store_chunk_record(record)
    }

    /// Structured counterpart of `upsert_collection_record`, validating field names.
    pub fn upsert_collection_document(
        &self,
        namespace: &Namespace,
        record: &Document,
    ) -> MigrationResult<()> {
        validate_field_names(record)?;
        self.state.lock().store_collection_record(namespace, record)
    }

    pub fn fail_balancer_stop(&self, error: CommandError) {
        self.state.lock().balancer_stop_failure = Some(error);
    }

    /// Chunk counts by id fail with `error`, other chunk reads keep working.
    pub fn fail_chunk_lookups(&self, error: CommandError) {
        self.state.lock().chunk_lookup_failure = Some(error);
    }

    /// Every following command named `command` fails with `error`.
    pub fn fail_command(&self, command: &str, error: CommandError) {
        self.state
            .lock()
            .command_failures
            .insert(command.to_string(), error);
    }

    /// Commands named `command` whose first argument is `target` fail with `error`.
    pub fn fail_command_for(&self, command: &str, target: &str, error: CommandError) {
        self.state
            .lock()
            .targeted_failures
            .insert((command.to_string(), target.to_string()), error);
    }

    /// Every administrative command received, including failed ones.
    pub fn admin_commands(&self) -> Vec<AdminCommand> {
        self.state.lock().admin_commands.clone()
    }

    /// Number of direct metadata writes (records, databases).
    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }
}

/// Source cluster with shards `src0`, `src1` and destination cluster with `dst0`, `dst1`.
pub fn two_shard_clusters() -> (InMemoryCluster, InMemoryCluster) {
    let shards = |prefix: &str| -> Vec<Shard> {
        (0..2)
            .map(|i| {
                let id = format!("{prefix}{i}");
                let host = format!("{id}/{id}-a:27018");
                Shard::new(id, host)
            })
            .collect()
    };
    (
        InMemoryCluster::with_shards("source", shards("src")),
        InMemoryCluster::with_shards("dest", shards("dst")),
    )
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    async fn list_shards(&self) -> MigrationResult<Vec<Shard>> {
        Ok(self.state.lock().shards.clone())
    }

    async fn list_databases(&self) -> MigrationResult<Vec<DatabaseInfo>> {
        Ok(self.state.lock().databases.values().cloned().collect())
    }

    async fn database(&self, name: &str) -> MigrationResult<Option<DatabaseInfo>> {
        Ok(self.database_info(name))
    }

    async fn shard_database_names(&self, shard: &str) -> MigrationResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .shard_databases
            .get(shard)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_database(&self, name: &str) -> MigrationResult<()> {
        let mut state = self.state.lock();
        state
            .ensure_database(name, false)
            .map_err(|err| MigrationError::command("create", err))?;
        state.writes += 1;
        Ok(())
    }

    /// Zone ranges survive a drop, as they do on a real cluster.
    async fn drop_database(&self, name: &str) -> MigrationResult<()> {
        let mut state = self.state.lock();
        state.databases.remove(name);
        state.collections.retain(|ns, _| ns.database() != name);
        state.chunks.retain(|chunk| chunk.namespace.database() != name);
        state.writes += 1;
        Ok(())
    }

    async fn purge_config_metadata(&self, database: &str) -> MigrationResult<()> {
        let mut state = self.state.lock();
        state.databases.remove(database);
        state.collections.retain(|ns, _| ns.database() != database);
        state.chunks.retain(|chunk| chunk.namespace.database() != database);
        state
            .zone_ranges
            .retain(|range| range.namespace.database() != database);
        for uuids in state.collection_uuids.values_mut() {
            uuids.retain(|entry| entry.namespace.database() != database);
        }
        state.purged.push(database.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn shard_collection_uuids(&self, shard: &str) -> MigrationResult<Vec<CollectionUuid>> {
        let state = self.state.lock();
        if !state.shards.iter().any(|candidate| candidate.id == shard) {
            return Err(MigrationError::not_found(format!("Shard {shard}")));
        }
        Ok(state
            .collection_uuids
            .get(shard)
            .cloned()
            .unwrap_or_default())
    }

    async fn sharded_collections(&self) -> MigrationResult<Vec<CollectionMetadata>> {
        Ok(self
            .state
            .lock()
            .collections
            .values()
            .filter(|collection| !collection.dropped)
            .cloned()
            .collect())
    }

    async fn list_collection_names(&self, database: &str) -> MigrationResult<Vec<String>> {
        let state = self.state.lock();
        let names: BTreeSet<String> = state
            .document_counts
            .keys()
            .chain(state.collections.keys())
            .filter(|ns| ns.database() == database)
            .map(|ns| ns.collection().to_string())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn count_documents(&self, namespace: &Namespace) -> MigrationResult<u64> {
        Ok(self
            .state
            .lock()
            .document_counts
            .get(namespace)
            .copied()
            .unwrap_or(0))
    }

    async fn chunks(
        &self,
        query: &ChunkQuery,
    ) -> MigrationResult<BoxStream<'_, MigrationResult<Chunk>>> {
        let chunks: Vec<Chunk> = self
            .state
            .lock()
            .chunks
            .iter()
            .filter(|chunk| query.matches(chunk))
            .cloned()
            .collect();
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    async fn count_chunks(&self, query: &ChunkQuery) -> MigrationResult<u64> {
        let state = self.state.lock();
        if let (ChunkQuery::Id(_), Some(err)) = (query, &state.chunk_lookup_failure) {
            return Err(MigrationError::command("count", err.clone()));
        }
        let count = state
            .chunks
            .iter()
            .filter(|chunk| query.matches(chunk))
            .count();
        Ok(count as u64)
    }

    async fn zone_ranges(&self) -> MigrationResult<Vec<ZoneRange>> {
        let mut ranges = self.zone_range_list();
        ranges.sort_by(|a, b| {
            a.namespace
                .cmp(&b.namespace)
                .then_with(|| compare_bounds(&a.min, &b.min))
        });
        Ok(ranges)
    }

    async fn upsert_collection_record(
        &self,
        namespace: &Namespace,
        record: RawDocumentBuf,
    ) -> MigrationResult<()> {
        let record: Document = bson::from_slice(record.as_bytes())?;
        self.state.lock().store_collection_record(namespace, &record)
    }

    async fn insert_chunk_record(&self, record: RawDocumentBuf) -> MigrationResult<()> {
        let record: Document = bson::from_slice(record.as_bytes())?;
        self.state.lock().store_chunk_record(&record)
    }

    async fn run_admin_command(&self, command: &AdminCommand) -> MigrationResult<Document> {
        let mut state = self.state.lock();
        state.admin_commands.push(command.clone());
        if let Some(err) = state.failure_for(command) {
            return Err(MigrationError::command(command.name(), err));
        }
        state
            .apply(command)
            .map_err(|err| MigrationError::command(command.name(), err))?;
        Ok(doc! { "ok": 1 })
    }

    async fn flush_router_config(&self) -> MigrationResult<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    async fn stop_balancer(&self) -> MigrationResult<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.balancer_stop_failure.clone() {
            return Err(MigrationError::command("balancerStop", err));
        }
        state.balancer_enabled = false;
        Ok(())
    }

    async fn disable_autosplit(&self) -> MigrationResult<()> {
        let mut state = self.state.lock();
        state.autosplit_enabled = false;
        state.writes += 1;
        Ok(())
    }

    async fn cluster_version(&self) -> MigrationResult<Version> {
        Ok(self.version.clone())
    }
}
