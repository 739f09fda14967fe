use std::time::Duration;

use async_trait::async_trait;
use bson::Document;
use migration::cluster::{ClusterClient, CollectionMetadata, OrphanCleaner};
use migration::operations::{AdminCommand, MigrationResult};

use super::client::{driver_error, MongoCluster};

#[async_trait]
impl OrphanCleaner for MongoCluster {
    /// Run `cleanupOrphaned` against the primary of every shard, one key range per command.
    ///
    /// A failing collection is logged and the sweep moves on to the next one.
    async fn cleanup_orphans(
        &self,
        collections: &[CollectionMetadata],
        pause: Duration,
    ) -> MigrationResult<()> {
        for shard in self.list_shards().await? {
            let admin = self.shard_client(&shard.id).await?.database("admin");

            for collection in collections {
                let namespace = &collection.namespace;
                let mut starting_from_key: Option<Document> = None;
                let mut commands = 0usize;

                loop {
                    let command = AdminCommand::CleanupOrphaned {
                        namespace: namespace.clone(),
                        starting_from_key: starting_from_key.take(),
                    };
                    let response = match admin.run_command(command.to_document(), None).await {
                        Ok(response) => response,
                        Err(err) => {
                            let err = driver_error(command.name(), err);
                            log::error!("{} - cleanupOrphaned {namespace} failed: {err}", shard.id);
                            break;
                        }
                    };
                    commands += 1;

                    match response.get_document("stoppedAtKey") {
                        Ok(key) => starting_from_key = Some(key.clone()),
                        Err(_) => break,
                    }
                    if !pause.is_zero() {
                        tokio::time::sleep(pause).await;
                    }
                }

                log::info!(
                    "{} - cleanupOrphaned {namespace} done after {commands} commands",
                    shard.id
                );
            }
        }
        Ok(())
    }
}
