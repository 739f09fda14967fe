mod cluster;
mod settings;
mod tracing;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use migration::migration::{ClusterSide, Migration, COUNT_RETRY_DELAY};
use migration::mirror::ProcessMirrorRunner;
use migration::shard_map::ShardMap;
use tokio_util::sync::CancellationToken;

use crate::cluster::MongoCluster;
use crate::settings::Settings;

/// Replicate the sharding metadata of one cluster onto another and keep the data in sync with
/// one `mongomirror` per source shard.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to an additional config file
    #[arg(long, value_name = "PATH")]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the source to destination shard mapping
    MapShards,
    /// Stop the balancer on both clusters
    StopBalancers,
    /// Enable sharding and place database primaries on the destination
    EnableDestinationSharding,
    /// Full metadata migration: databases, collections, chunks, zones, then chunk placement
    MigrateMetadata,
    /// Shard the in-scope collections on the destination
    ShardCollections,
    /// Compare chunk placement without changing anything
    CompareChunks,
    /// Compare the chunks of a single database
    DiffChunks { database: String },
    /// Compare sharded collections, optionally sharding the missing ones
    DiffShardedCollections {
        #[arg(long)]
        sync: bool,
    },
    /// Compare document counts of every in-scope collection
    CompareCounts,
    /// Make the destination routers reload their routing tables
    FlushRouterConfig,
    /// Drop the in-scope databases on the destination
    DropDestinationDatabases,
    /// Drop the in-scope databases on the destination and purge their routing metadata
    DropDestinationDatabasesAndConfigMetadata,
    /// Check that the shards of the destination, or the source with `--source`, agree on
    /// collection UUIDs
    CompareCollectionUuids {
        #[arg(long)]
        source: bool,
    },
    /// Turn off automatic chunk splitting on the source
    DisableSourceAutosplit,
    /// Run one mongomirror per source shard until interrupted
    Mirror,
    /// Mirror every source shard into the replica set behind the destination URI
    MirrorToReplicaSet,
    /// Remove orphaned documents on the source, or on the destination with `--dest`
    CleanupOrphans {
        #[arg(long)]
        dest: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = Settings::new(args.config_path).context("Can't read config")?;
    let mut logger_config = settings.logger.clone();
    logger_config.with_top_level_directive(settings.log_level.clone());
    tracing::setup(&logger_config)?;
    settings.validate_and_warn();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("shard-sync")
        .build()
        .context("Can't create runtime")?;

    runtime.block_on(run(settings, args.command))
}

async fn run(settings: Settings, command: Command) -> anyhow::Result<()> {
    let run_config = settings.run_config()?;

    let source = MongoCluster::connect("source", &settings.source.uri)
        .await
        .context("Can't connect to source cluster")?;
    let destination = MongoCluster::connect("dest", &settings.destination.uri)
        .await
        .context("Can't connect to destination cluster")?;

    // A replica set destination has no shards to map onto.
    let migration = if matches!(command, Command::MirrorToReplicaSet) {
        Migration::new(run_config, ShardMap::default(), &source, &destination)
    } else {
        Migration::connect(run_config, &settings.shard_map, &source, &destination)
            .await
            .context("Can't build shard mapping")?
    };

    match command {
        Command::MapShards => {
            log::info!("Shard mapping:\n{}", migration.shard_map());
        }
        Command::StopBalancers => migration.stop_balancers().await?,
        Command::EnableDestinationSharding => {
            let stats = migration.enable_destination_sharding().await?;
            log::info!("Enable sharding complete: {stats:?}");
        }
        Command::MigrateMetadata => {
            let report = migration.migrate_metadata().await?;
            if report.replication.failures() > 0 || !report.reconcile.is_consistent() {
                anyhow::bail!("Metadata migration incomplete: {report:?}");
            }
        }
        Command::ShardCollections => {
            let stats = migration.shard_collections().await?;
            log::info!("Shard collections complete: {stats:?}");
        }
        Command::CompareChunks => {
            let report = migration.compare_chunks().await?;
            if !report.is_consistent() {
                anyhow::bail!("Chunks differ: {report:?}");
            }
        }
        Command::DiffChunks { database } => {
            let diff = migration.diff_chunks(&database).await?;
            log::info!(
                "{database}: {} chunks match, {} on wrong shard, {} missing on destination, \
                 {} unknown to source",
                diff.matched,
                diff.wrong_shard.len(),
                diff.missing.len(),
                diff.unknown.len()
            );
        }
        Command::DiffShardedCollections { sync } => {
            let diff = migration.diff_sharded_collections(sync).await?;
            log::info!("Sharded collections: {diff:?}");
        }
        Command::CompareCounts => {
            let report = migration.compare_counts(COUNT_RETRY_DELAY).await?;
            for mismatch in &report.mismatched {
                log::warn!(
                    "{} - source: {}, destination: {}",
                    mismatch.namespace,
                    mismatch.source,
                    mismatch.destination
                );
            }
        }
        Command::FlushRouterConfig => migration.flush_router_config().await?,
        Command::DropDestinationDatabases => {
            let dropped = migration.drop_destination_databases().await?;
            log::info!("Dropped {} destination databases", dropped.len());
        }
        Command::DropDestinationDatabasesAndConfigMetadata => {
            let dropped = migration
                .drop_destination_databases_and_config_metadata()
                .await?;
            log::info!(
                "Dropped {} destination databases with their config metadata",
                dropped.len()
            );
        }
        Command::CompareCollectionUuids { source } => {
            let side = if source {
                ClusterSide::Source
            } else {
                ClusterSide::Destination
            };
            let report = migration.compare_collection_uuids(side).await?;
            if !report.is_consistent() {
                anyhow::bail!("Collection UUIDs differ between shards of the {side} cluster");
            }
            log::info!("Collection UUIDs consistent on {side}");
        }
        Command::DisableSourceAutosplit => migration.disable_source_autosplit().await?,
        Command::Mirror => {
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

            let runner = ProcessMirrorRunner::new(migration.config().mirror.binary.clone());
            migration.mirror(Box::new(runner), cancel).await?;
        }
        Command::MirrorToReplicaSet => {
            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

            let runner = ProcessMirrorRunner::new(migration.config().mirror.binary.clone());
            migration
                .mirror_to_replica_set(Box::new(runner), cancel)
                .await?;
        }
        Command::CleanupOrphans { dest } => {
            let (side, cleaner) = if dest {
                (ClusterSide::Destination, &destination)
            } else {
                (ClusterSide::Source, &source)
            };
            migration
                .cleanup_orphans(side, cleaner, settings.cleanup_orphans_sleep())
                .await?;
        }
    }

    Ok(())
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Interrupted, stopping");
            cancel.cancel();
        }
        Err(err) => log::error!("Can't listen for Ctrl-C: {err}"),
    }
}
