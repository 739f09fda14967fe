use futures::TryStreamExt as _;

use super::MetadataReplicator;
use crate::cluster::{Chunk, ChunkQuery};
use crate::config::MetadataStrategy;
use crate::namespace::Namespace;
use crate::operations::bounds::{is_max_key_bound, to_raw_document};
use crate::operations::{AdminCommand, MigrationResult};

/// How chunks are created on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Insert chunk records into the destination config database.
    Insert,
    /// Split destination chunks at every source chunk boundary.
    ///
    /// Works without config database access but is much slower, each split takes the
    /// collection's distributed lock.
    SplitCommand,
}

impl From<MetadataStrategy> for ChunkStrategy {
    fn from(strategy: MetadataStrategy) -> Self {
        match strategy {
            MetadataStrategy::Privileged => ChunkStrategy::Insert,
            MetadataStrategy::Unprivileged => ChunkStrategy::SplitCommand,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChunkStats {
    pub created: usize,
    /// Chunks which already existed on the destination.
    pub existing: usize,
    /// Chunks ending at `MaxKey`, which can not be split at.
    pub unsplittable: usize,
    pub failures: usize,
}

/// Per-namespace progress logging.
struct NamespaceProgress {
    last: Option<Namespace>,
    count: usize,
}

impl NamespaceProgress {
    fn new() -> Self {
        Self {
            last: None,
            count: 0,
        }
    }

    fn observe(&mut self, namespace: &Namespace) {
        if self.last.as_ref() != Some(namespace) {
            self.finish();
            self.last = Some(namespace.clone());
        }
    }

    fn created(&mut self) {
        self.count += 1;
    }

    fn finish(&mut self) {
        if let Some(last) = self.last.take() {
            log::debug!("{last} - created {} chunks", self.count);
        }
        self.count = 0;
    }
}

impl MetadataReplicator<'_> {
    fn chunk_in_scope(&self, chunk: &Chunk) -> bool {
        self.config.filter.included(&chunk.namespace) && !chunk.namespace.is_config()
    }

    /// Whether a chunk with the same `(id, min, max)` is already on the destination.
    async fn chunk_exists(&self, chunk: &Chunk) -> MigrationResult<bool> {
        let query = ChunkQuery::Identity {
            id: chunk.id.clone(),
            min: chunk.min.clone(),
            max: chunk.max.clone(),
        };
        Ok(self.destination.count_chunks(&query).await? > 0)
    }

    pub async fn replicate_chunks(&self) -> MigrationResult<ChunkStats> {
        match ChunkStrategy::from(self.config.strategy) {
            ChunkStrategy::Insert => self.create_chunks_using_insert().await,
            ChunkStrategy::SplitCommand => self.create_chunks_using_split().await,
        }
    }

    async fn create_chunks_using_insert(&self) -> MigrationResult<ChunkStats> {
        log::debug!("createDestChunksUsingInsert started");

        let mut stats = ChunkStats::default();
        let mut progress = NamespaceProgress::new();
        let mut chunks = self.source.chunks(&ChunkQuery::All).await?;

        while let Some(chunk) = chunks.try_next().await? {
            if !self.chunk_in_scope(&chunk) {
                continue;
            }
            let mapped_shard = self.shard_map.resolve(&chunk.shard)?;
            progress.observe(&chunk.namespace);

            if self.chunk_exists(&chunk).await? {
                log::trace!("Chunk {} already exists on destination", chunk.id);
                stats.existing += 1;
                continue;
            }

            let record = to_raw_document(&chunk.record_on(mapped_shard))?;
            match self.destination.insert_chunk_record(record).await {
                Ok(()) => {
                    stats.created += 1;
                    progress.created();
                }
                Err(err) => {
                    log::error!("Failed to insert chunk for namespace {}: {err}", chunk.namespace);
                    stats.failures += 1;
                }
            }
        }
        progress.finish();

        log::debug!("createDestChunksUsingInsert complete: {stats:?}");
        Ok(stats)
    }

    async fn create_chunks_using_split(&self) -> MigrationResult<ChunkStats> {
        log::debug!("createDestChunksUsingSplitCommand started");

        let mut stats = ChunkStats::default();
        let mut progress = NamespaceProgress::new();
        let mut chunks = self.source.chunks(&ChunkQuery::All).await?;

        while let Some(chunk) = chunks.try_next().await? {
            if !self.chunk_in_scope(&chunk) {
                continue;
            }
            progress.observe(&chunk.namespace);

            if self.chunk_exists(&chunk).await? {
                log::debug!(
                    "Chunk already exists on destination, skipping: _id: {}, min: {}, max: {}",
                    chunk.id,
                    chunk.min,
                    chunk.max
                );
                stats.existing += 1;
                continue;
            }

            if is_max_key_bound(&chunk.max) {
                stats.unsplittable += 1;
                continue;
            }

            let command = AdminCommand::Split {
                namespace: chunk.namespace.clone(),
                middle: chunk.max.clone(),
            };
            if let Err(err) = self.destination.run_admin_command(&command).await {
                log::error!("command error for namespace {}: {err}", chunk.namespace);
                stats.failures += 1;
                continue;
            }

            stats.created += 1;
            progress.created();

            match self
                .destination
                .count_chunks(&ChunkQuery::Id(chunk.id.clone()))
                .await
            {
                Ok(0) => log::debug!(
                    "Split of {} at {} did not produce chunk {}",
                    chunk.namespace,
                    chunk.max,
                    chunk.id
                ),
                Ok(_) => {}
                Err(err) => log::warn!(
                    "Could not verify chunk {} of {} after split: {err}",
                    chunk.id,
                    chunk.namespace
                ),
            }
        }
        progress.finish();

        log::debug!("createDestChunksUsingSplitCommand complete: {stats:?}");
        Ok(stats)
    }
}
