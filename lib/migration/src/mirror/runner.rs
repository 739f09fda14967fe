use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use super::status::MirrorStatus;
use super::task::MirrorTask;
use crate::operations::{MigrationError, MigrationResult};
use crate::shard_map::ShardId;

/// Starts mirror processes.
#[async_trait]
pub trait MirrorRunner: Send + Sync {
    async fn start(&self, task: &MirrorTask) -> MigrationResult<Box<dyn MirrorHandle>>;
}

/// What became of a process asked to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Exited,
    /// Still alive when the shutdown timeout passed. It is left running, never killed.
    StillRunning,
}

/// A started mirror process, exclusively owned by its task.
#[async_trait]
pub trait MirrorHandle: Send + Sync {
    /// Query the current status. Errors mean no status is available right now.
    async fn status(&self) -> MigrationResult<MirrorStatus>;

    /// Ask the process to exit and wait up to `timeout` for it.
    async fn shutdown(&mut self, timeout: Duration) -> MigrationResult<ShutdownOutcome>;
}

/// Runs the `mongomirror` binary and polls its HTTP status endpoint.
pub struct ProcessMirrorRunner {
    binary: PathBuf,
    client: reqwest::Client,
}

impl ProcessMirrorRunner {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl MirrorRunner for ProcessMirrorRunner {
    async fn start(&self, task: &MirrorTask) -> MigrationResult<Box<dyn MirrorHandle>> {
        log::info!(
            "Starting {} for shard {}, status port {}",
            self.binary.display(),
            task.shard_id,
            task.http_status_port
        );

        let child = Command::new(&self.binary)
            .args(task.command_args())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|error| MigrationError::Process {
                shard: task.shard_id.clone(),
                error,
            })?;

        Ok(Box::new(ProcessMirrorHandle {
            shard_id: task.shard_id.clone(),
            status_url: format!("http://localhost:{}", task.http_status_port),
            client: self.client.clone(),
            child,
        }))
    }
}

struct ProcessMirrorHandle {
    shard_id: ShardId,
    status_url: String,
    client: reqwest::Client,
    child: Child,
}

impl ProcessMirrorHandle {
    #[cfg(unix)]
    fn terminate(&mut self) -> MigrationResult<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Already reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| MigrationError::service_error(format!("Invalid process id {pid}")))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(|err| {
            MigrationError::service_error(format!(
                "Failed to signal mirror of shard {}: {err}",
                self.shard_id
            ))
        })
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> MigrationResult<()> {
        self.child.start_kill().map_err(|error| MigrationError::Process {
            shard: self.shard_id.clone(),
            error,
        })
    }
}

#[async_trait]
impl MirrorHandle for ProcessMirrorHandle {
    async fn status(&self) -> MigrationResult<MirrorStatus> {
        let response = self
            .client
            .get(&self.status_url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| {
                MigrationError::service_error(format!("Status of shard {}: {err}", self.shard_id))
            })?;
        response.json().await.map_err(|err| {
            MigrationError::service_error(format!(
                "Malformed status of shard {}: {err}",
                self.shard_id
            ))
        })
    }

    async fn shutdown(&mut self, timeout: Duration) -> MigrationResult<ShutdownOutcome> {
        if let Some(status) = self.child.try_wait().map_err(|error| MigrationError::Process {
            shard: self.shard_id.clone(),
            error,
        })? {
            log::info!("Mirror of shard {} already exited: {status}", self.shard_id);
            return Ok(ShutdownOutcome::Exited);
        }

        self.terminate()?;
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("Mirror of shard {} exited: {status}", self.shard_id);
                Ok(ShutdownOutcome::Exited)
            }
            Ok(Err(error)) => Err(MigrationError::Process {
                shard: self.shard_id.clone(),
                error,
            }),
            Err(_) => {
                log::warn!(
                    "Mirror of shard {} still running after {timeout:?}, leaving it",
                    self.shard_id
                );
                Ok(ShutdownOutcome::StillRunning)
            }
        }
    }
}
