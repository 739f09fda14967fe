use std::collections::HashMap;

use async_trait::async_trait;
use bson::oid::ObjectId;
use bson::{doc, Bson, Document, RawDocumentBuf};
use futures::stream::{BoxStream, StreamExt as _, TryStreamExt as _};
use migration::cluster::{
    Chunk, ChunkQuery, ClusterClient, CollectionMetadata, CollectionUuid, ConnectionInfo,
    Credentials, DatabaseInfo, Shard, ZoneRange,
};
use migration::namespace::{Namespace, CONFIG_DATABASE};
use migration::operations::{AdminCommand, CommandError, MigrationError, MigrationResult};
use migration::shard_map::ShardId;
use mongodb::error::{Error as DriverError, ErrorKind, WriteFailure};
use mongodb::options::{
    ClientOptions, FindOptions, ReplaceOptions, ServerAddress, Tls, UpdateOptions,
};
use mongodb::results::CollectionType;
use mongodb::{Client, Collection, Database};
use parking_lot::Mutex;
use semver::Version;

const ADMIN_DATABASE: &str = "admin";

/// Collection created and dropped again to materialize a database.
const PLACEHOLDER_COLLECTION: &str = "shard_sync_placeholder";

/// Convert a driver error, keeping server side command failures as [`CommandError`].
pub fn driver_error(command: &str, err: DriverError) -> MigrationError {
    match err.kind.as_ref() {
        ErrorKind::Command(error) => {
            MigrationError::command(command, CommandError::new(error.code, error.message.clone()))
        }
        ErrorKind::Write(WriteFailure::WriteError(error)) => {
            MigrationError::command(command, CommandError::new(error.code, error.message.clone()))
        }
        _ => MigrationError::service_error(format!("{command} failed: {err}")),
    }
}

/// `_id` selector matching a chunk id which may be stored as a string or an `ObjectId`.
fn chunk_id_filter(id: &str) -> Bson {
    match ObjectId::parse_str(id) {
        Ok(oid) => Bson::Document(doc! { "$in": [id, oid] }),
        Err(_) => Bson::String(id.to_string()),
    }
}

fn escape_regex(literal: &str) -> String {
    let mut escaped = String::with_capacity(literal.len());
    for c in literal.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '-' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Regex matching every namespace of `database`.
fn database_namespaces(database: &str) -> Document {
    doc! { "$regex": format!("^{}\\.", escape_regex(database)) }
}

fn chunk_filter(query: &ChunkQuery) -> Document {
    match query {
        ChunkQuery::All => Document::new(),
        ChunkQuery::Database(database) => doc! { "ns": database_namespaces(database) },
        ChunkQuery::Identity { id, min, max } => doc! {
            "_id": chunk_id_filter(id),
            "min": min.clone(),
            "max": max.clone(),
        },
        ChunkQuery::Id(id) => doc! { "_id": chunk_id_filter(id) },
    }
}

/// Leading `major.minor.patch` of a server version string such as `4.0.28-ent`.
fn parse_server_version(version: &str) -> MigrationResult<Version> {
    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .take(3)
        .map(str::parse::<u64>);
    let mut next = || parts.next().and_then(Result::ok).unwrap_or(0);
    let parsed = Version::new(next(), next(), next());
    if parsed == Version::new(0, 0, 0) {
        return Err(MigrationError::service_error(format!(
            "Unrecognized server version {version}"
        )));
    }
    Ok(parsed)
}

/// Split a shard host string `rs/host1:port,host2:port` into replica set name and seed list.
fn parse_shard_host(host: &str) -> MigrationResult<(Option<String>, Vec<ServerAddress>)> {
    let (replica_set, hosts) = match host.split_once('/') {
        Some((replica_set, hosts)) => (Some(replica_set.to_string()), hosts),
        None => (None, host),
    };
    let hosts = hosts
        .split(',')
        .map(ServerAddress::parse)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| MigrationError::bad_input(format!("Invalid shard host {host}: {err}")))?;
    Ok((replica_set, hosts))
}

/// A sharded cluster reached through one of its routers.
pub struct MongoCluster {
    name: String,
    client: Client,
    options: ClientOptions,
    connection: ConnectionInfo,
    /// Direct connections to the shard replica sets, opened on first use.
    shard_clients: Mutex<HashMap<ShardId, Client>>,
}

impl MongoCluster {
    pub async fn connect(name: impl Into<String>, uri: &str) -> MigrationResult<Self> {
        let name = name.into();
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|err| driver_error("connect", err))?;

        let credentials = options.credential.as_ref().and_then(|credential| {
            Some(Credentials {
                username: credential.username.clone()?,
                password: credential.password.clone().unwrap_or_default(),
                auth_source: credential.source.clone(),
            })
        });
        let connection = ConnectionInfo {
            hosts: options.hosts.iter().map(ToString::to_string).collect(),
            credentials,
            tls: matches!(options.tls, Some(Tls::Enabled(_))),
            replica_set: options.repl_set_name.clone(),
        };

        let client =
            Client::with_options(options.clone()).map_err(|err| driver_error("connect", err))?;
        log::info!("Connected to {name} cluster at {}", connection.hosts.join(","));

        Ok(Self {
            name,
            client,
            options,
            connection,
            shard_clients: Mutex::new(HashMap::new()),
        })
    }

    fn config_database(&self) -> Database {
        self.client.database(CONFIG_DATABASE)
    }

    fn config_collection(&self, name: &str) -> Collection<Document> {
        self.config_database().collection(name)
    }

    async fn find_all(
        &self,
        collection: &str,
        filter: Document,
        options: Option<FindOptions>,
    ) -> MigrationResult<Vec<Document>> {
        let operation = format!("find {CONFIG_DATABASE}.{collection}");
        self.config_collection(collection)
            .find(filter, options)
            .await
            .map_err(|err| driver_error(&operation, err))?
            .try_collect()
            .await
            .map_err(|err| driver_error(&operation, err))
    }

    async fn delete_config_records(
        &self,
        collection: &str,
        filter: Document,
    ) -> MigrationResult<u64> {
        let operation = format!("delete {CONFIG_DATABASE}.{collection}");
        let result = self
            .config_collection(collection)
            .delete_many(filter, None)
            .await
            .map_err(|err| driver_error(&operation, err))?;
        Ok(result.deleted_count)
    }

    /// Drop the routing cache entries a shard keeps for `database`.
    async fn purge_shard_cache(&self, shard: &str, database: &str) -> MigrationResult<()> {
        let config = self.shard_client(shard).await?.database(CONFIG_DATABASE);
        config
            .collection::<Document>("cache.databases")
            .delete_many(doc! { "_id": database }, None)
            .await
            .map_err(|err| driver_error("delete config.cache.databases", err))?;
        config
            .collection::<Document>("cache.collections")
            .delete_many(doc! { "_id": database_namespaces(database) }, None)
            .await
            .map_err(|err| driver_error("delete config.cache.collections", err))?;

        let chunk_caches = config
            .list_collection_names(doc! {
                "name": { "$regex": format!("^cache\\.chunks\\.{}\\.", escape_regex(database)) },
            })
            .await
            .map_err(|err| driver_error("listCollections", err))?;
        for name in chunk_caches {
            config
                .collection::<Document>(&name)
                .drop(None)
                .await
                .map_err(|err| driver_error("drop", err))?;
            log::debug!("{} - dropped {CONFIG_DATABASE}.{name} on {shard}", self.name);
        }
        Ok(())
    }

    async fn run_admin(&self, command: &str, document: Document) -> MigrationResult<Document> {
        self.client
            .database(ADMIN_DATABASE)
            .run_command(document, None)
            .await
            .map_err(|err| driver_error(command, err))
    }

    /// Direct connection to the replica set of `shard`.
    pub async fn shard_client(&self, shard: &str) -> MigrationResult<Client> {
        if let Some(client) = self.shard_clients.lock().get(shard) {
            return Ok(client.clone());
        }

        let host = self
            .list_shards()
            .await?
            .into_iter()
            .find(|candidate| candidate.id == shard)
            .map(|candidate| candidate.host)
            .ok_or_else(|| MigrationError::not_found(format!("Shard {shard}")))?;
        let (replica_set, hosts) = parse_shard_host(&host)?;

        let mut options = self.options.clone();
        options.hosts = hosts;
        options.repl_set_name = replica_set;
        options.direct_connection = None;
        let client = Client::with_options(options)
            .map_err(|err| driver_error(&format!("connect to shard {shard}"), err))?;
        log::debug!("{} - connected to shard {shard} at {host}", self.name);

        self.shard_clients
            .lock()
            .insert(shard.to_string(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl ClusterClient for MongoCluster {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    async fn list_shards(&self) -> MigrationResult<Vec<Shard>> {
        self.find_all("shards", Document::new(), None)
            .await?
            .iter()
            .map(Shard::from_document)
            .collect()
    }

    async fn list_databases(&self) -> MigrationResult<Vec<DatabaseInfo>> {
        self.find_all("databases", Document::new(), None)
            .await?
            .iter()
            .map(DatabaseInfo::from_document)
            .collect()
    }

    async fn database(&self, name: &str) -> MigrationResult<Option<DatabaseInfo>> {
        self.config_collection("databases")
            .find_one(doc! { "_id": name }, None)
            .await
            .map_err(|err| driver_error("find config.databases", err))?
            .as_ref()
            .map(DatabaseInfo::from_document)
            .transpose()
    }

    async fn shard_database_names(&self, shard: &str) -> MigrationResult<Vec<String>> {
        self.shard_client(shard)
            .await?
            .list_database_names(None, None)
            .await
            .map_err(|err| driver_error("listDatabases", err))
    }

    async fn create_database(&self, name: &str) -> MigrationResult<()> {
        let database = self.client.database(name);
        database
            .create_collection(PLACEHOLDER_COLLECTION, None)
            .await
            .map_err(|err| driver_error("create", err))?;
        database
            .collection::<Document>(PLACEHOLDER_COLLECTION)
            .drop(None)
            .await
            .map_err(|err| driver_error("drop", err))
    }

    async fn drop_database(&self, name: &str) -> MigrationResult<()> {
        self.client
            .database(name)
            .drop(None)
            .await
            .map_err(|err| driver_error("dropDatabase", err))
    }

    async fn purge_config_metadata(&self, database: &str) -> MigrationResult<()> {
        let namespaces = database_namespaces(database);
        let collections = self
            .delete_config_records("collections", doc! { "_id": namespaces.clone() })
            .await?;
        let chunks = self
            .delete_config_records("chunks", doc! { "ns": namespaces.clone() })
            .await?;
        let ranges = self
            .delete_config_records("tags", doc! { "ns": namespaces })
            .await?;
        self.delete_config_records("databases", doc! { "_id": database })
            .await?;
        log::debug!(
            "{} - purged {database}: {collections} collections, {chunks} chunks, \
             {ranges} zone ranges",
            self.name,
        );

        for shard in self.list_shards().await? {
            self.purge_shard_cache(&shard.id, database).await?;
        }
        Ok(())
    }

    async fn shard_collection_uuids(&self, shard: &str) -> MigrationResult<Vec<CollectionUuid>> {
        let client = self.shard_client(shard).await?;
        let databases = client
            .list_database_names(None, None)
            .await
            .map_err(|err| driver_error("listDatabases", err))?;

        let mut uuids = Vec::new();
        for database in databases {
            let collections: Vec<_> = client
                .database(&database)
                .list_collections(None, None)
                .await
                .map_err(|err| driver_error("listCollections", err))?
                .try_collect()
                .await
                .map_err(|err| driver_error("listCollections", err))?;
            uuids.extend(
                collections
                    .into_iter()
                    .filter(|collection| collection.collection_type == CollectionType::Collection)
                    .map(|collection| CollectionUuid {
                        namespace: Namespace::new(database.as_str(), collection.name),
                        uuid: collection
                            .info
                            .uuid
                            .and_then(|binary| binary.to_uuid().ok())
                            .map(|uuid| uuid.to_string()),
                    }),
            );
        }
        Ok(uuids)
    }

    async fn sharded_collections(&self) -> MigrationResult<Vec<CollectionMetadata>> {
        self.find_all("collections", doc! { "dropped": { "$ne": true } }, None)
            .await?
            .iter()
            .map(CollectionMetadata::from_document)
            .collect()
    }

    async fn list_collection_names(&self, database: &str) -> MigrationResult<Vec<String>> {
        self.client
            .database(database)
            .list_collection_names(None)
            .await
            .map_err(|err| driver_error("listCollections", err))
    }

    async fn count_documents(&self, namespace: &Namespace) -> MigrationResult<u64> {
        self.client
            .database(namespace.database())
            .collection::<Document>(namespace.collection())
            .count_documents(Document::new(), None)
            .await
            .map_err(|err| driver_error("count", err))
    }

    async fn chunks(
        &self,
        query: &ChunkQuery,
    ) -> MigrationResult<BoxStream<'_, MigrationResult<Chunk>>> {
        let options = FindOptions::builder()
            .sort(doc! { "ns": 1, "min": 1 })
            .build();
        let cursor = self
            .config_collection("chunks")
            .find(chunk_filter(query), options)
            .await
            .map_err(|err| driver_error("find config.chunks", err))?;

        Ok(cursor
            .map(|document| {
                let document = document.map_err(|err| driver_error("find config.chunks", err))?;
                Chunk::from_document(&document)
            })
            .boxed())
    }

    async fn count_chunks(&self, query: &ChunkQuery) -> MigrationResult<u64> {
        self.config_collection("chunks")
            .count_documents(chunk_filter(query), None)
            .await
            .map_err(|err| driver_error("count config.chunks", err))
    }

    async fn zone_ranges(&self) -> MigrationResult<Vec<ZoneRange>> {
        let options = FindOptions::builder()
            .sort(doc! { "ns": 1, "min": 1 })
            .build();
        self.find_all("tags", Document::new(), Some(options))
            .await?
            .iter()
            .map(ZoneRange::from_document)
            .collect()
    }

    async fn upsert_collection_record(
        &self,
        namespace: &Namespace,
        record: RawDocumentBuf,
    ) -> MigrationResult<()> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.config_database()
            .collection::<RawDocumentBuf>("collections")
            .replace_one(doc! { "_id": namespace.to_string() }, record, options)
            .await
            .map_err(|err| driver_error("update config.collections", err))?;
        Ok(())
    }

    async fn insert_chunk_record(&self, record: RawDocumentBuf) -> MigrationResult<()> {
        self.config_database()
            .collection::<RawDocumentBuf>("chunks")
            .insert_one(record, None)
            .await
            .map_err(|err| driver_error("insert config.chunks", err))?;
        Ok(())
    }

    async fn run_admin_command(&self, command: &AdminCommand) -> MigrationResult<Document> {
        self.run_admin(command.name(), command.to_document()).await
    }

    async fn flush_router_config(&self) -> MigrationResult<()> {
        self.run_admin("flushRouterConfig", doc! { "flushRouterConfig": 1 })
            .await?;
        Ok(())
    }

    async fn stop_balancer(&self) -> MigrationResult<()> {
        log::debug!("{} - stopping balancer", self.name);
        self.run_admin("balancerStop", doc! { "balancerStop": 1 })
            .await?;
        Ok(())
    }

    async fn disable_autosplit(&self) -> MigrationResult<()> {
        log::debug!("{} - disabling autosplit", self.name);
        let options = UpdateOptions::builder().upsert(true).build();
        self.config_collection("settings")
            .update_one(
                doc! { "_id": "autosplit" },
                doc! { "$set": { "enabled": false } },
                options,
            )
            .await
            .map_err(|err| driver_error("update config.settings", err))?;
        Ok(())
    }

    async fn cluster_version(&self) -> MigrationResult<Version> {
        let info = self.run_admin("buildInfo", doc! { "buildInfo": 1 }).await?;
        parse_server_version(info.get_str("version")?)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("4.0.28", Version::new(4, 0, 28))]
    #[case("3.6.23-ent", Version::new(3, 6, 23))]
    #[case("5.0", Version::new(5, 0, 0))]
    fn server_versions(#[case] version: &str, #[case] expected: Version) {
        assert_eq!(parse_server_version(version).unwrap(), expected);
    }

    #[test]
    fn garbage_version_is_rejected() {
        assert!(parse_server_version("unknown").is_err());
    }

    #[test]
    fn shard_host_with_replica_set() {
        let (replica_set, hosts) = parse_shard_host("rs0/a:27018,b:27019").unwrap();
        assert_eq!(replica_set.as_deref(), Some("rs0"));
        let hosts: Vec<_> = hosts.iter().map(ToString::to_string).collect();
        assert_eq!(hosts, vec!["a:27018", "b:27019"]);

        let (replica_set, hosts) = parse_shard_host("standalone:27018").unwrap();
        assert_eq!(replica_set, None);
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn chunk_filters() {
        assert_eq!(chunk_filter(&ChunkQuery::All), Document::new());
        assert_eq!(
            chunk_filter(&ChunkQuery::Database("my-db.x".to_string())),
            doc! { "ns": { "$regex": "^my-db\\.x\\." } }
        );

        let oid = ObjectId::new();
        let filter = chunk_filter(&ChunkQuery::Id(oid.to_hex()));
        assert_eq!(filter, doc! { "_id": { "$in": [oid.to_hex(), oid] } });

        let filter = chunk_filter(&ChunkQuery::Id("db1.coll-_id_MinKey".to_string()));
        assert_eq!(filter, doc! { "_id": "db1.coll-_id_MinKey" });
    }
}
