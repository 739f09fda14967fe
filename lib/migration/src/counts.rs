use std::time::Duration;

use crate::cluster::ClusterClient;
use crate::config::RunConfig;
use crate::namespace::{Namespace, CONFIG_DATABASE};
use crate::operations::MigrationResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountMismatch {
    pub namespace: Namespace,
    pub source: u64,
    pub destination: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CountReport {
    pub matched: usize,
    pub mismatched: Vec<CountMismatch>,
}

fn is_system_collection(name: &str) -> bool {
    name.starts_with("system.")
}

/// Compare document counts of every in-scope collection on both clusters.
///
/// Counts differing on the first attempt are read again once after `retry_delay`, a mirror may
/// still be catching up.
pub async fn compare_collection_counts(
    config: &RunConfig,
    source: &dyn ClusterClient,
    destination: &dyn ClusterClient,
    retry_delay: Duration,
) -> MigrationResult<CountReport> {
    log::debug!("compareCollectionCounts started");
    let mut report = CountReport::default();

    for database in source.list_databases().await? {
        if database.is_reserved()
            || database.name == CONFIG_DATABASE
            || !config.filter.database_included(&database.name)
        {
            continue;
        }

        for collection in source.list_collection_names(&database.name).await? {
            if is_system_collection(&collection) {
                continue;
            }
            let namespace = Namespace::new(database.name.as_str(), collection);
            if !config.filter.included(&namespace) {
                continue;
            }

            let mut source_count = source.count_documents(&namespace).await?;
            let mut destination_count = destination.count_documents(&namespace).await?;
            if source_count != destination_count {
                tokio::time::sleep(retry_delay).await;
                source_count = source.count_documents(&namespace).await?;
                destination_count = destination.count_documents(&namespace).await?;
            }

            if source_count == destination_count {
                log::debug!("{namespace} - count matches: {source_count}");
                report.matched += 1;
            } else {
                log::warn!(
                    "{namespace} - count MISMATCH, source: {source_count}, dest: {destination_count}"
                );
                report.mismatched.push(CountMismatch {
                    namespace,
                    source: source_count,
                    destination: destination_count,
                });
            }
        }
    }

    log::info!(
        "compareCollectionCounts complete, matches: {}, mismatches: {}",
        report.matched,
        report.mismatched.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::NamespaceFilter;
    use crate::testing::two_shard_clusters;

    #[tokio::test]
    async fn counts_are_compared_per_collection() {
        let (source, destination) = two_shard_clusters();
        source.add_database("db1", "src0");
        source.add_database("db2", "src0");
        source.add_database("admin", "src0");

        let same = Namespace::new("db1", "same");
        let behind = Namespace::new("db1", "behind");
        source.set_document_count(&same, 10);
        destination.set_document_count(&same, 10);
        source.set_document_count(&behind, 5);
        destination.set_document_count(&behind, 3);
        source.set_document_count(&Namespace::new("db1", "system.views"), 1);
        source.set_document_count(&Namespace::new("db2", "filtered"), 1);
        source.set_document_count(&Namespace::new("admin", "system.users"), 1);

        let config = RunConfig {
            filter: NamespaceFilter::from_entries(&["db1"]).unwrap(),
            ..RunConfig::default()
        };
        let report = compare_collection_counts(&config, &source, &destination, Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(
            report.mismatched,
            vec![CountMismatch {
                namespace: behind,
                source: 5,
                destination: 3,
            }]
        );
    }
}
