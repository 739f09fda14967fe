use crate::cluster::ClusterClient;
use crate::operations::MigrationResult;

/// Stop chunk balancing on both clusters before any metadata is written.
///
/// Failing to stop the source balancer is tolerated, the operator may not control the source
/// cluster fully. The destination balancer must be stopped.
pub async fn stop_balancers(
    source: &dyn ClusterClient,
    destination: &dyn ClusterClient,
) -> MigrationResult<()> {
    log::debug!("stopBalancers started");

    if let Err(err) = source.stop_balancer().await {
        log::error!(
            "Could not stop balancer on {} cluster: {err}",
            source.name()
        );
    }

    destination.stop_balancer().await?;

    log::debug!("stopBalancers complete");
    Ok(())
}

/// Keep the source from splitting chunks while its metadata is being copied.
pub async fn disable_source_autosplit(source: &dyn ClusterClient) -> MigrationResult<()> {
    log::info!("Disabling autosplit on {} cluster", source.name());
    source.disable_autosplit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{CommandError, MigrationError};
    use crate::testing::InMemoryCluster;

    #[tokio::test]
    async fn source_failure_is_tolerated() {
        let source = InMemoryCluster::new("source");
        let destination = InMemoryCluster::new("dest");
        source.fail_balancer_stop(CommandError::new(13, "not authorized"));

        stop_balancers(&source, &destination).await.unwrap();
        assert!(source.balancer_enabled());
        assert!(!destination.balancer_enabled());
    }

    #[tokio::test]
    async fn destination_failure_is_fatal() {
        let source = InMemoryCluster::new("source");
        let destination = InMemoryCluster::new("dest");
        destination.fail_balancer_stop(CommandError::new(13, "not authorized"));

        let err = stop_balancers(&source, &destination).await.unwrap_err();
        assert!(matches!(err, MigrationError::Command { .. }));
        assert!(!source.balancer_enabled());
    }

    #[tokio::test]
    async fn autosplit_is_disabled_on_source_only() {
        let source = InMemoryCluster::new("source");
        let destination = InMemoryCluster::new("dest");

        disable_source_autosplit(&source).await.unwrap();
        assert!(!source.autosplit_enabled());
        assert!(destination.autosplit_enabled());
    }
}
