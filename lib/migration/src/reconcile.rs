//! Comparison of chunk placement between the source and the destination cluster.

use std::collections::{HashMap, HashSet};

use futures::TryStreamExt as _;

use crate::cluster::{ChunkQuery, ClusterClient};
use crate::config::RunConfig;
use crate::namespace::Namespace;
use crate::operations::{AdminCommand, MigrationResult};
use crate::shard_map::{ShardId, ShardMap};

/// Counters of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Source chunks in scope.
    pub total: usize,
    /// Chunks found on the destination and compared.
    pub matched: usize,
    /// Chunks on a different shard than the image of their source owner, without moving.
    pub mismatched: usize,
    /// Move commands issued, failed ones included.
    pub moved: usize,
    /// Moves counted in `moved` which the destination rejected.
    pub move_failures: usize,
    /// Source chunks with no destination chunk of the same id.
    pub missing: usize,
}

impl ReconcileReport {
    /// Whether every in-scope chunk exists on the destination on its mapped shard.
    pub fn is_consistent(&self) -> bool {
        self.missing == 0 && self.mismatched == 0 && self.move_failures == 0
    }
}

/// Result of comparing the chunks of a single database.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChunkDiff {
    pub matched: usize,
    /// Chunk ids owned by a different shard than the mapped source owner.
    pub wrong_shard: Vec<String>,
    /// Source chunk ids absent on the destination.
    pub missing: Vec<String>,
    /// Destination chunk ids unknown to the source.
    pub unknown: Vec<String>,
}

/// Per-namespace processed counter, logged at namespace boundaries.
struct NamespaceCounter {
    current: Option<Namespace>,
    processed: usize,
}

impl NamespaceCounter {
    fn advance(&mut self, namespace: &Namespace, report: &ReconcileReport) {
        if self.current.as_ref() != Some(namespace) {
            self.log(report);
            self.current = Some(namespace.clone());
            self.processed = 0;
        }
        self.processed += 1;
    }

    fn log(&self, report: &ReconcileReport) {
        if let Some(namespace) = &self.current {
            log::info!(
                "{namespace} - chunks processed: {}, moved: {}, mismatched: {}, missing: {}",
                self.processed,
                report.moved,
                report.mismatched,
                report.missing
            );
        }
    }
}

pub struct ChunkReconciler<'a> {
    config: &'a RunConfig,
    shard_map: &'a ShardMap,
    source: &'a dyn ClusterClient,
    destination: &'a dyn ClusterClient,
}

impl<'a> ChunkReconciler<'a> {
    pub fn new(
        config: &'a RunConfig,
        shard_map: &'a ShardMap,
        source: &'a dyn ClusterClient,
        destination: &'a dyn ClusterClient,
    ) -> Self {
        Self {
            config,
            shard_map,
            source,
            destination,
        }
    }

    async fn destination_owners(
        &self,
        query: &ChunkQuery,
    ) -> MigrationResult<HashMap<String, ShardId>> {
        self.destination
            .chunks(query)
            .await?
            .map_ok(|chunk| (chunk.id, chunk.shard))
            .try_collect()
            .await
    }

    /// Read-only comparison of chunk placement.
    pub async fn compare_chunks(&self) -> MigrationResult<ReconcileReport> {
        self.compare_and_move_chunks(false).await
    }

    /// Compare the owner of every in-scope source chunk with the owner of the destination chunk
    /// of the same id. With `do_move`, chunks on the wrong shard are moved to the mapped shard.
    ///
    /// Individual move failures are logged and counted, they do not abort the scan. Callers which
    /// need a hard failure have to inspect the returned counters.
    pub async fn compare_and_move_chunks(&self, do_move: bool) -> MigrationResult<ReconcileReport> {
        log::debug!("compareAndMoveChunks started, doMove: {do_move}");

        let owners = self.destination_owners(&ChunkQuery::All).await?;
        log::debug!("Loaded {} destination chunks", owners.len());

        let mut report = ReconcileReport::default();
        let mut counter = NamespaceCounter {
            current: None,
            processed: 0,
        };
        let mut chunks = self.source.chunks(&ChunkQuery::All).await?;

        while let Some(chunk) = chunks.try_next().await? {
            if !self.config.filter.included(&chunk.namespace) || chunk.namespace.is_config() {
                continue;
            }
            let mapped_shard = self.shard_map.resolve(&chunk.shard)?;
            counter.advance(&chunk.namespace, &report);
            report.total += 1;

            let Some(owner) = owners.get(&chunk.id) else {
                log::error!(
                    "Chunk {} of {} [{}, {}) not found on destination",
                    chunk.id,
                    chunk.namespace,
                    chunk.min,
                    chunk.max
                );
                report.missing += 1;
                continue;
            };
            report.matched += 1;

            if owner == mapped_shard {
                continue;
            }

            if do_move {
                let command = AdminCommand::MoveChunk {
                    namespace: chunk.namespace.clone(),
                    min: chunk.min.clone(),
                    max: chunk.max.clone(),
                    to: mapped_shard.clone(),
                };
                report.moved += 1;
                if let Err(err) = self.destination.run_admin_command(&command).await {
                    log::warn!(
                        "moveChunk of {} [{}, {}) from {owner} to {mapped_shard} failed: {err}",
                        chunk.namespace,
                        chunk.min,
                        chunk.max
                    );
                    report.move_failures += 1;
                }
            } else {
                log::debug!(
                    "Chunk {} of {} is on {owner}, expected {mapped_shard}",
                    chunk.id,
                    chunk.namespace
                );
                report.mismatched += 1;
            }
        }
        counter.log(&report);

        log::info!(
            "compareAndMoveChunks complete, matched: {}, mismatched: {}, moved: {}, missing: {}, \
             total: {}",
            report.matched,
            report.mismatched,
            report.moved,
            report.missing,
            report.total
        );
        if report.move_failures > 0 {
            log::warn!("{} chunk moves failed", report.move_failures);
        }
        Ok(report)
    }

    /// Compare the chunks of one database in both directions.
    pub async fn diff_chunks(&self, database: &str) -> MigrationResult<ChunkDiff> {
        log::debug!("diffChunks({database})");

        let query = ChunkQuery::Database(database.to_string());
        let owners = self.destination_owners(&query).await?;

        let mut diff = ChunkDiff::default();
        let mut seen = HashSet::new();
        let mut chunks = self.source.chunks(&query).await?;

        while let Some(chunk) = chunks.try_next().await? {
            if !self.config.filter.included(&chunk.namespace) {
                continue;
            }
            let mapped_shard = self.shard_map.resolve(&chunk.shard)?;
            seen.insert(chunk.id.clone());

            match owners.get(&chunk.id) {
                None => {
                    log::warn!("Chunk {} of {} missing on destination", chunk.id, chunk.namespace);
                    diff.missing.push(chunk.id);
                }
                Some(owner) if owner == mapped_shard => diff.matched += 1,
                Some(owner) => {
                    log::warn!(
                        "Chunk {} of {} is on {owner}, expected {mapped_shard}",
                        chunk.id,
                        chunk.namespace
                    );
                    diff.wrong_shard.push(chunk.id);
                }
            }
        }

        let mut unknown: Vec<String> = owners
            .into_keys()
            .filter(|id| !seen.contains(id))
            .collect();
        unknown.sort();
        for id in &unknown {
            log::warn!("Destination chunk {id} does not exist on source");
        }
        diff.unknown = unknown;

        log::info!(
            "diffChunks({database}) complete, matched: {}, wrong shard: {}, missing: {}, unknown: {}",
            diff.matched,
            diff.wrong_shard.len(),
            diff.missing.len(),
            diff.unknown.len()
        );
        Ok(diff)
    }
}
