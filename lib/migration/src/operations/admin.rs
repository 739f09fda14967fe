use bson::{doc, Bson, Document};

use crate::namespace::Namespace;
use crate::shard_map::ShardId;

/// Administrative commands issued against a cluster router.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    EnableSharding {
        database: String,
    },
    MovePrimary {
        database: String,
        to: ShardId,
    },
    ShardCollection {
        namespace: Namespace,
        key: Document,
        unique: bool,
        collation: Option<Document>,
        num_initial_chunks: Option<i32>,
    },
    Split {
        namespace: Namespace,
        middle: Document,
    },
    MoveChunk {
        namespace: Namespace,
        min: Document,
        max: Document,
        to: ShardId,
    },
    AddShardToZone {
        shard: ShardId,
        zone: String,
    },
    UpdateZoneKeyRange {
        namespace: Namespace,
        min: Document,
        max: Document,
        zone: String,
    },
    CleanupOrphaned {
        namespace: Namespace,
        starting_from_key: Option<Document>,
    },
}

impl AdminCommand {
    /// Command name as understood by the server.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::EnableSharding { .. } => "enableSharding",
            AdminCommand::MovePrimary { .. } => "movePrimary",
            AdminCommand::ShardCollection { .. } => "shardCollection",
            AdminCommand::Split { .. } => "split",
            AdminCommand::MoveChunk { .. } => "moveChunk",
            AdminCommand::AddShardToZone { .. } => "addShardToZone",
            AdminCommand::UpdateZoneKeyRange { .. } => "updateZoneKeyRange",
            AdminCommand::CleanupOrphaned { .. } => "cleanupOrphaned",
        }
    }

    pub fn to_document(&self) -> Document {
        match self {
            AdminCommand::EnableSharding { database } => {
                doc! { "enableSharding": database.as_str() }
            }
            AdminCommand::MovePrimary { database, to } => {
                doc! { "movePrimary": database.as_str(), "to": to.as_str() }
            }
            AdminCommand::ShardCollection {
                namespace,
                key,
                unique,
                collation,
                num_initial_chunks,
            } => {
                let mut command = doc! {
                    "shardCollection": namespace.to_string(),
                    "key": key.clone(),
                    "unique": *unique,
                };
                if let Some(num_initial_chunks) = num_initial_chunks {
                    command.insert("numInitialChunks", *num_initial_chunks);
                }
                if let Some(collation) = collation {
                    command.insert("collation", collation.clone());
                }
                command
            }
            AdminCommand::Split { namespace, middle } => doc! {
                "split": namespace.to_string(),
                "middle": middle.clone(),
            },
            AdminCommand::MoveChunk {
                namespace,
                min,
                max,
                to,
            } => doc! {
                "moveChunk": namespace.to_string(),
                "bounds": [Bson::Document(min.clone()), Bson::Document(max.clone())],
                "to": to.as_str(),
            },
            AdminCommand::AddShardToZone { shard, zone } => doc! {
                "addShardToZone": shard.as_str(),
                "zone": zone.as_str(),
            },
            AdminCommand::UpdateZoneKeyRange {
                namespace,
                min,
                max,
                zone,
            } => doc! {
                "updateZoneKeyRange": namespace.to_string(),
                "min": min.clone(),
                "max": max.clone(),
                "zone": zone.as_str(),
            },
            AdminCommand::CleanupOrphaned {
                namespace,
                starting_from_key,
            } => {
                let mut command = doc! { "cleanupOrphaned": namespace.to_string() };
                if let Some(key) = starting_from_key {
                    command.insert("startingFromKey", key.clone());
                }
                command
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_chunk_document() {
        let command = AdminCommand::MoveChunk {
            namespace: Namespace::new("db1", "coll"),
            min: doc! { "_id": 0 },
            max: doc! { "_id": 10 },
            to: "shard1".to_string(),
        };
        assert_eq!(command.name(), "moveChunk");
        assert_eq!(
            command.to_document(),
            doc! {
                "moveChunk": "db1.coll",
                "bounds": [{ "_id": 0 }, { "_id": 10 }],
                "to": "shard1",
            }
        );
    }

    #[test]
    fn shard_collection_options() {
        let command = AdminCommand::ShardCollection {
            namespace: Namespace::new("db1", "coll"),
            key: doc! { "_id": "hashed" },
            unique: false,
            collation: Some(doc! { "locale": "simple" }),
            num_initial_chunks: Some(1),
        };
        let document = command.to_document();
        assert_eq!(document.get_str("shardCollection").unwrap(), "db1.coll");
        assert_eq!(document.get_i32("numInitialChunks").unwrap(), 1);
        assert_eq!(
            document.get_document("collation").unwrap(),
            &doc! { "locale": "simple" }
        );
    }
}
