use bson::{Bson, Document};

use crate::namespace::Namespace;
use crate::operations::{MigrationError, MigrationResult};
use crate::shard_map::ShardId;

fn get_id_string(doc: &Document) -> MigrationResult<String> {
    match doc.get("_id") {
        Some(Bson::String(id)) => Ok(id.clone()),
        Some(Bson::ObjectId(id)) => Ok(id.to_hex()),
        Some(other) => Ok(other.to_string()),
        None => Err(MigrationError::service_error(format!(
            "metadata document without _id: {doc}"
        ))),
    }
}

fn get_bool_or(doc: &Document, key: &str, default: bool) -> bool {
    doc.get_bool(key).unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: ShardId,
    /// Connection string of the shard replica set, `rs/host:port,...`.
    pub host: String,
    pub tags: Vec<String>,
}

impl Shard {
    pub fn new(id: impl Into<ShardId>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            tags: Vec::new(),
        }
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_document(doc: &Document) -> MigrationResult<Self> {
        let tags = match doc.get_array("tags") {
            Ok(tags) => tags
                .iter()
                .filter_map(|tag| tag.as_str().map(ToString::to_string))
                .collect(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            id: get_id_string(doc)?,
            host: doc.get_str("host")?.to_string(),
            tags,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub name: String,
    pub primary: ShardId,
    pub partitioned: bool,
}

impl DatabaseInfo {
    pub fn from_document(doc: &Document) -> MigrationResult<Self> {
        Ok(Self {
            name: get_id_string(doc)?,
            primary: doc.get_str("primary")?.to_string(),
            partitioned: get_bool_or(doc, "partitioned", true),
        })
    }

    /// Databases which are never enabled for sharding on the destination.
    pub fn is_reserved(&self) -> bool {
        self.name == "admin" || self.name == "system" || self.name.contains('$')
    }
}

/// Sharding configuration of one collection, as stored in `config.collections`.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMetadata {
    pub namespace: Namespace,
    pub key: Document,
    pub unique: bool,
    pub default_collation: Option<Document>,
    pub no_balance: bool,
    pub dropped: bool,
    /// The full record, including fields not modelled above.
    pub record: Document,
}

impl CollectionMetadata {
    pub fn from_document(doc: &Document) -> MigrationResult<Self> {
        let namespace = get_id_string(doc)?.parse()?;
        let default_collation = doc
            .get_document("defaultCollation")
            .ok()
            .filter(|collation| !collation.is_empty())
            .cloned();
        Ok(Self {
            namespace,
            key: doc.get_document("key")?.clone(),
            unique: get_bool_or(doc, "unique", false),
            default_collation,
            no_balance: get_bool_or(doc, "noBalance", false),
            dropped: get_bool_or(doc, "dropped", false),
            record: doc.clone(),
        })
    }

    pub fn new(namespace: Namespace, key: Document, unique: bool) -> Self {
        let record = bson::doc! {
            "_id": namespace.to_string(),
            "key": key.clone(),
            "unique": unique,
        };
        Self {
            namespace,
            key,
            unique,
            default_collation: None,
            no_balance: false,
            dropped: false,
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub namespace: Namespace,
    pub min: Document,
    pub max: Document,
    pub shard: ShardId,
    /// The full record, including version fields not modelled above.
    pub record: Document,
}

impl Chunk {
    pub fn new(
        id: impl Into<String>,
        namespace: Namespace,
        min: Document,
        max: Document,
        shard: impl Into<ShardId>,
    ) -> Self {
        let id = id.into();
        let shard = shard.into();
        let record = bson::doc! {
            "_id": id.as_str(),
            "ns": namespace.to_string(),
            "min": min.clone(),
            "max": max.clone(),
            "shard": shard.as_str(),
        };
        Self {
            id,
            namespace,
            min,
            max,
            shard,
            record,
        }
    }

    pub fn from_document(doc: &Document) -> MigrationResult<Self> {
        Ok(Self {
            id: get_id_string(doc)?,
            namespace: doc.get_str("ns")?.parse()?,
            min: doc.get_document("min")?.clone(),
            max: doc.get_document("max")?.clone(),
            shard: doc.get_str("shard")?.to_string(),
            record: doc.clone(),
        })
    }

    /// The record of this chunk owned by `shard` instead.
    pub fn record_on(&self, shard: &str) -> Document {
        let mut record = self.record.clone();
        record.insert("shard", shard);
        record
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneRange {
    pub namespace: Namespace,
    pub min: Document,
    pub max: Document,
    pub zone: String,
}

impl ZoneRange {
    pub fn from_document(doc: &Document) -> MigrationResult<Self> {
        Ok(Self {
            namespace: doc.get_str("ns")?.parse()?,
            min: doc.get_document("min")?.clone(),
            max: doc.get_document("max")?.clone(),
            zone: doc.get_str("tag")?.to_string(),
        })
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_source: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("auth_source", &self.auth_source)
            .finish()
    }
}

/// How a cluster was connected to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub hosts: Vec<String>,
    /// Set when connected to a replica set rather than a router.
    pub replica_set: Option<String>,
    pub credentials: Option<Credentials>,
    pub tls: bool,
}

impl ConnectionInfo {
    /// Seed list in the `rs/host1,host2` form mirror processes expect.
    pub fn host_string(&self) -> String {
        let hosts = self.hosts.join(",");
        match &self.replica_set {
            Some(replica_set) => format!("{replica_set}/{hosts}"),
            None => hosts,
        }
    }
}

/// UUID of one collection on one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionUuid {
    pub namespace: Namespace,
    /// `None` for collections created before UUIDs existed.
    pub uuid: Option<String>,
}

#[cfg(test)]
mod tests {
    use bson::{doc, oid::ObjectId};

    use super::*;

    #[test]
    fn parse_chunk_record() {
        let oid = ObjectId::new();
        let record = doc! {
            "_id": oid,
            "ns": "db1.coll",
            "min": { "_id": Bson::MinKey },
            "max": { "_id": 0 },
            "shard": "shard0",
            "lastmod": Bson::Timestamp(bson::Timestamp { time: 1, increment: 0 }),
        };
        let chunk = Chunk::from_document(&record).unwrap();
        assert_eq!(chunk.id, oid.to_hex());
        assert_eq!(chunk.namespace, Namespace::new("db1", "coll"));
        assert_eq!(chunk.shard, "shard0");

        let moved = chunk.record_on("shard9");
        assert_eq!(moved.get_str("shard").unwrap(), "shard9");
        assert!(moved.contains_key("lastmod"));
    }

    #[test]
    fn parse_collection_record() {
        let record = doc! {
            "_id": "db1.coll",
            "key": { "_id.x": 1 },
            "unique": true,
            "defaultCollation": {},
            "noBalance": true,
        };
        let collection = CollectionMetadata::from_document(&record).unwrap();
        assert!(collection.unique);
        assert!(collection.no_balance);
        assert!(!collection.dropped);
        assert_eq!(collection.default_collation, None);
    }

    #[test]
    fn parse_shard_and_database() {
        let shard = Shard::from_document(&doc! {
            "_id": "shard0",
            "host": "rs0/host1:27017,host2:27017",
            "tags": ["east"],
        })
        .unwrap();
        assert_eq!(shard.tags, vec!["east".to_string()]);

        let database = DatabaseInfo::from_document(&doc! { "_id": "db1", "primary": "shard0" })
            .unwrap();
        assert!(database.partitioned);
        assert!(!database.is_reserved());
    }

    #[test]
    fn host_string_of_replica_set() {
        let mut connection = ConnectionInfo {
            hosts: vec!["a:27017".to_string(), "b:27017".to_string()],
            ..ConnectionInfo::default()
        };
        assert_eq!(connection.host_string(), "a:27017,b:27017");
        connection.replica_set = Some("rs0".to_string());
        assert_eq!(connection.host_string(), "rs0/a:27017,b:27017");
    }
}
