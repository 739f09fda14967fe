use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone};
use semver::Version;

use super::status::MirrorProgress;
use crate::cluster::{ClusterClient, ConnectionInfo, Credentials, Shard};
use crate::config::RunConfig;
use crate::namespace::Namespace;
use crate::operations::{MigrationError, MigrationResult};
use crate::shard_map::{ShardId, ShardMap};

/// Bookmark prefix used when none is configured.
pub const BOOKMARK_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M_%S";

/// First destination version which can preserve collection UUIDs.
const PRESERVE_UUIDS_MIN_VERSION: Version = Version::new(3, 6, 0);

/// One side of a mirror process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Replica set connection string of one shard, `rs/host:port,...`.
    pub host: String,
    pub credentials: Option<Credentials>,
    pub tls: bool,
}

impl Endpoint {
    fn for_shard(shard: &Shard, connection: &ConnectionInfo) -> Self {
        Self {
            host: shard.host.clone(),
            credentials: connection.credentials.clone(),
            tls: connection.tls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorState {
    Created,
    Running,
    InitialSync,
    OplogSync,
    /// The process reported an error. It keeps running until the operator intervenes.
    Error,
    Terminated,
}

impl MirrorState {
    /// State after a status poll reported `progress`.
    pub fn advance(self, progress: &MirrorProgress) -> Self {
        if self == MirrorState::Terminated {
            return self;
        }
        match progress {
            MirrorProgress::Error(_) => MirrorState::Error,
            MirrorProgress::CopyingIndexes | MirrorProgress::CopyingDocuments { .. } => {
                MirrorState::InitialSync
            }
            MirrorProgress::OplogSync { .. } => MirrorState::OplogSync,
            MirrorProgress::Unknown { .. } => self,
        }
    }
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            MirrorState::Created => "created",
            MirrorState::Running => "running",
            MirrorState::InitialSync => "initial sync",
            MirrorState::OplogSync => "oplog sync",
            MirrorState::Error => "error",
            MirrorState::Terminated => "terminated",
        };
        f.write_str(state)
    }
}

/// Everything one mirror process of one source shard is started with.
#[derive(Debug, Clone)]
pub struct MirrorTask {
    pub shard_id: ShardId,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub include_namespaces: Vec<Namespace>,
    pub include_databases: Vec<String>,
    pub bookmark_file: String,
    pub http_status_port: u16,
    pub num_parallel_collections: Option<u32>,
    pub write_concern: Option<String>,
    pub compressors: Option<String>,
    pub tail_only: bool,
    pub preserve_uuids: bool,
    pub oplog_path: Option<PathBuf>,
    pub ssl_allow_invalid_hostnames: bool,
    pub ssl_allow_invalid_certificates: bool,
    pub state: MirrorState,
}

impl MirrorTask {
    pub fn bookmark_file_name(prefix: &str, shard_id: &str) -> String {
        format!("{prefix}_{shard_id}.timestamp")
    }

    /// Command line arguments of the mirror process.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec!["--host".to_string(), self.source.host.clone()];
        if let Some(credentials) = &self.source.credentials {
            push_credentials(&mut args, SOURCE_CREDENTIAL_FLAGS, credentials);
        }
        if self.source.tls {
            args.push("--ssl".to_string());
        }
        if self.ssl_allow_invalid_hostnames {
            args.push("--sslAllowInvalidHostnames".to_string());
        }
        if self.ssl_allow_invalid_certificates {
            args.push("--sslAllowInvalidCertificates".to_string());
        }

        args.push("--destination".to_string());
        args.push(self.destination.host.clone());
        if let Some(credentials) = &self.destination.credentials {
            push_credentials(&mut args, DESTINATION_CREDENTIAL_FLAGS, credentials);
        }
        if !self.destination.tls {
            args.push("--destinationNoSSL".to_string());
        }

        for namespace in &self.include_namespaces {
            args.push("--includeNamespace".to_string());
            args.push(namespace.to_string());
        }
        for database in &self.include_databases {
            args.push("--includeDB".to_string());
            args.push(database.clone());
        }

        args.push("--bookmarkFile".to_string());
        args.push(self.bookmark_file.clone());
        args.push("--httpStatusPort".to_string());
        args.push(self.http_status_port.to_string());

        if let Some(num) = self.num_parallel_collections {
            args.push("--numParallelCollections".to_string());
            args.push(num.to_string());
        }
        if let Some(write_concern) = &self.write_concern {
            args.push("--writeConcern".to_string());
            args.push(write_concern.clone());
        }
        if let Some(compressors) = &self.compressors {
            args.push("--compressors".to_string());
            args.push(compressors.clone());
        }
        if self.preserve_uuids {
            args.push("--preserveUUIDs".to_string());
        }
        if self.tail_only {
            args.push("--tailOnly".to_string());
        }
        if let Some(oplog_path) = &self.oplog_path {
            args.push("--oplogPath".to_string());
            args.push(oplog_path.display().to_string());
        }
        args
    }
}

const SOURCE_CREDENTIAL_FLAGS: [&str; 3] =
    ["--username", "--password", "--authenticationDatabase"];
const DESTINATION_CREDENTIAL_FLAGS: [&str; 3] = [
    "--destinationUsername",
    "--destinationPassword",
    "--destinationAuthenticationDatabase",
];

fn push_credentials(args: &mut Vec<String>, flags: [&str; 3], credentials: &Credentials) {
    let [username, password, auth_source] = flags;
    args.push(username.to_string());
    args.push(credentials.username.clone());
    args.push(password.to_string());
    args.push(credentials.password.clone());
    if let Some(source) = &credentials.auth_source {
        args.push(auth_source.to_string());
        args.push(source.clone());
    }
}

/// Settings shared by every task of one run.
struct TaskTemplate<'a> {
    config: &'a RunConfig,
    prefix: String,
    preserve_uuids: bool,
    include_namespaces: Vec<Namespace>,
    include_databases: Vec<String>,
}

impl<'a> TaskTemplate<'a> {
    async fn new<Tz>(
        config: &'a RunConfig,
        destination: &dyn ClusterClient,
        started_at: DateTime<Tz>,
    ) -> MigrationResult<TaskTemplate<'a>>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let mirror = &config.mirror;
        let prefix = match &mirror.bookmark_prefix {
            Some(prefix) => prefix.clone(),
            None => started_at.format(BOOKMARK_TIMESTAMP_FORMAT).to_string(),
        };

        let destination_version = destination.cluster_version().await?;
        let preserve_uuids = mirror.preserve_uuids
            || (destination_version >= PRESERVE_UUIDS_MIN_VERSION
                && config.strategy.is_privileged());
        if preserve_uuids {
            log::debug!("Destination version {destination_version}, preserving UUIDs");
        }

        Ok(Self {
            config,
            prefix,
            preserve_uuids,
            include_namespaces: config.filter.include_namespaces().iter().cloned().collect(),
            include_databases: config.filter.include_databases().iter().cloned().collect(),
        })
    }

    fn task(
        &self,
        index: usize,
        shard: Shard,
        source: Endpoint,
        destination: Endpoint,
    ) -> MigrationResult<MirrorTask> {
        let mirror = &self.config.mirror;
        let http_status_port = u16::try_from(index)
            .ok()
            .and_then(|offset| mirror.start_port.checked_add(offset))
            .ok_or_else(|| {
                MigrationError::bad_input(format!(
                    "Not enough status ports above {} for {} shards",
                    mirror.start_port,
                    index + 1
                ))
            })?;

        Ok(MirrorTask {
            bookmark_file: MirrorTask::bookmark_file_name(&self.prefix, &shard.id),
            source,
            destination,
            include_namespaces: self.include_namespaces.clone(),
            include_databases: self.include_databases.clone(),
            http_status_port,
            num_parallel_collections: mirror.num_parallel_collections,
            write_concern: mirror.write_concern.clone(),
            compressors: mirror.compressors.clone(),
            tail_only: mirror.tail_only,
            preserve_uuids: self.preserve_uuids,
            oplog_path: mirror
                .oplog_base_path
                .as_ref()
                .map(|base| base.join(&shard.id)),
            ssl_allow_invalid_hostnames: mirror.ssl_allow_invalid_hostnames,
            ssl_allow_invalid_certificates: mirror.ssl_allow_invalid_certificates,
            state: MirrorState::Created,
            shard_id: shard.id,
        })
    }
}

/// Derive one mirror task per source shard, in shard listing order.
pub async fn plan_tasks<Tz>(
    config: &RunConfig,
    shard_map: &ShardMap,
    source: &dyn ClusterClient,
    destination: &dyn ClusterClient,
    started_at: DateTime<Tz>,
) -> MigrationResult<Vec<MirrorTask>>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let template = TaskTemplate::new(config, destination, started_at).await?;
    let destination_shards = destination.list_shards().await?;

    let mut tasks = Vec::new();
    for (index, shard) in source.list_shards().await?.into_iter().enumerate() {
        let mapped = shard_map.resolve(&shard.id)?;
        let destination_shard = destination_shards
            .iter()
            .find(|candidate| &candidate.id == mapped)
            .ok_or_else(|| MigrationError::not_found(format!("Destination shard {mapped}")))?;
        log::debug!("Creating mirror task for {} ==> {}", shard.id, destination_shard.id);

        let source_endpoint = Endpoint::for_shard(&shard, source.connection());
        let destination_endpoint =
            Endpoint::for_shard(destination_shard, destination.connection());
        tasks.push(template.task(index, shard, source_endpoint, destination_endpoint)?);
    }
    Ok(tasks)
}

/// Derive one mirror task per source shard, all writing into the single replica set
/// `destination` is connected to. No shard mapping is involved.
pub async fn plan_replica_set_tasks<Tz>(
    config: &RunConfig,
    source: &dyn ClusterClient,
    destination: &dyn ClusterClient,
    started_at: DateTime<Tz>,
) -> MigrationResult<Vec<MirrorTask>>
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let template = TaskTemplate::new(config, destination, started_at).await?;
    let connection = destination.connection();
    if connection.replica_set.is_none() {
        log::warn!(
            "{} is not connected as a replica set, mirrors will use seed list {}",
            destination.name(),
            connection.host_string()
        );
    }
    let destination_endpoint = Endpoint {
        host: connection.host_string(),
        credentials: connection.credentials.clone(),
        tls: connection.tls,
    };

    let mut tasks = Vec::new();
    for (index, shard) in source.list_shards().await?.into_iter().enumerate() {
        log::debug!(
            "Creating mirror task for {} ==> {}",
            shard.id,
            destination_endpoint.host
        );
        let source_endpoint = Endpoint::for_shard(&shard, source.connection());
        tasks.push(template.task(index, shard, source_endpoint, destination_endpoint.clone())?);
    }
    Ok(tasks)
}
