use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use super::runner::{MirrorHandle, MirrorRunner, ShutdownOutcome};
use super::status::{MirrorProgress, PrettyLag};
use super::task::{MirrorState, MirrorTask};
use crate::config::MirrorConfig;
use crate::operations::MigrationResult;
use crate::shard_map::ShardId;

struct SupervisedTask {
    task: MirrorTask,
    handle: Box<dyn MirrorHandle>,
}

/// Outcome of polling one task during a tick. `None` when no status could be read in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub shard_id: ShardId,
    pub state: MirrorState,
    pub progress: Option<MirrorProgress>,
}

/// Launches one mirror process per source shard and supervises them until cancelled.
pub struct MirrorOrchestrator {
    config: MirrorConfig,
    runner: Box<dyn MirrorRunner>,
    tasks: Vec<SupervisedTask>,
}

impl MirrorOrchestrator {
    pub fn new(config: MirrorConfig, runner: Box<dyn MirrorRunner>) -> Self {
        Self {
            config,
            runner,
            tasks: Vec::new(),
        }
    }

    pub fn tasks(&self) -> impl Iterator<Item = &MirrorTask> {
        self.tasks.iter().map(|supervised| &supervised.task)
    }

    /// Start the given tasks one after another, pausing the configured launch delay in between.
    ///
    /// Stops launching when `cancel` is triggered. A task which fails to start aborts the launch,
    /// already started tasks are kept and can be shut down.
    pub async fn launch(
        &mut self,
        tasks: Vec<MirrorTask>,
        cancel: &CancellationToken,
    ) -> MigrationResult<()> {
        let delay = self.config.launch_delay();
        let count = tasks.len();

        for (index, mut task) in tasks.into_iter().enumerate() {
            if cancel.is_cancelled() {
                log::info!("Launch cancelled, {} mirrors not started", count - index);
                break;
            }

            let handle = self.runner.start(&task).await?;
            task.state = MirrorState::Running;
            self.tasks.push(SupervisedTask { task, handle });

            if index + 1 < count && !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {},
                    _ = tokio::time::sleep(delay) => {},
                }
            }
        }
        Ok(())
    }

    /// Poll every task once. Polls run concurrently, each bounded by the status timeout.
    pub async fn tick(&mut self) -> Vec<TaskReport> {
        let timeout = self.config.status_timeout();
        let polls = self.tasks.iter().map(|supervised| async move {
            match tokio::time::timeout(timeout, supervised.handle.status()).await {
                Ok(Ok(status)) => Some(status.progress()),
                Ok(Err(err)) => {
                    log::debug!("{} - no status: {err}", supervised.task.shard_id);
                    None
                }
                Err(_) => {
                    let shard_id = &supervised.task.shard_id;
                    log::debug!("{shard_id} - status timed out after {timeout:?}");
                    None
                }
            }
        });
        let results = join_all(polls).await;

        self.tasks
            .iter_mut()
            .zip(results)
            .map(|(supervised, progress)| {
                let task = &mut supervised.task;
                if let Some(progress) = &progress {
                    task.state = task.state.advance(progress);
                    log_progress(&task.shard_id, progress);
                }
                TaskReport {
                    shard_id: task.shard_id.clone(),
                    state: task.state,
                    progress,
                }
            })
            .collect()
    }

    /// Poll on the configured interval until `cancel` is triggered, then shut every task down.
    ///
    /// There is no other exit: when to cut over is left to the operator.
    pub async fn supervise(&mut self, cancel: CancellationToken) -> MigrationResult<()> {
        let interval = self.config.poll_interval();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Stopping {} mirrors", self.tasks.len());
                    break;
                },
                _ = tokio::time::sleep(interval) => {},
            }
            self.tick().await;
        }
        self.shutdown().await;
        Ok(())
    }

    /// Signal every process to exit. Failures are logged, the remaining tasks are still stopped.
    ///
    /// Only tasks whose process exited are marked terminated.
    pub async fn shutdown(&mut self) {
        let timeout = self.config.shutdown_timeout();
        let stops = self.tasks.iter_mut().map(|supervised| async move {
            match supervised.handle.shutdown(timeout).await {
                Ok(ShutdownOutcome::Exited) => supervised.task.state = MirrorState::Terminated,
                Ok(ShutdownOutcome::StillRunning) => log::warn!(
                    "Mirror of {} did not exit, stop it manually",
                    supervised.task.shard_id
                ),
                Err(err) => {
                    log::error!("Failed to stop mirror of {}: {err}", supervised.task.shard_id)
                }
            }
        });
        join_all(stops).await;
    }
}

fn log_progress(shard_id: &str, progress: &MirrorProgress) {
    match progress {
        MirrorProgress::Error(message) => {
            log::error!("{shard_id} - mongomirror error {message}");
        }
        MirrorProgress::CopyingIndexes => {
            log::info!("{shard_id:<15} - {:<18} {:<22}", "initial sync", "copying indexes");
        }
        MirrorProgress::CopyingDocuments { percent } => {
            log::info!(
                "{shard_id:<15} - {:<18} {:<22} {percent:6.2}% complete",
                "initial sync",
                "copying documents"
            );
        }
        MirrorProgress::OplogSync { lag } => {
            log::info!(
                "{shard_id:<15} - {:<18} {:<22} {} lag from source",
                "oplog sync",
                "applying oplog",
                PrettyLag(*lag)
            );
        }
        MirrorProgress::Unknown { stage, phase } => {
            log::info!("{shard_id:<15} - {stage:<18} {phase:<22}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::mirror::status::MirrorStatus;
    use crate::mirror::task::Endpoint;
    use crate::operations::MigrationError;

    #[derive(Default)]
    struct Recorder {
        started: Vec<ShardId>,
        stopped: Vec<ShardId>,
    }

    /// Handles answer with a scripted status; `None` never answers.
    struct FakeRunner {
        recorder: Arc<Mutex<Recorder>>,
        statuses: Vec<(ShardId, Option<&'static str>)>,
    }

    struct FakeHandle {
        shard_id: ShardId,
        status: Option<MirrorStatus>,
        recorder: Arc<Mutex<Recorder>>,
    }

    #[async_trait]
    impl MirrorRunner for FakeRunner {
        async fn start(&self, task: &MirrorTask) -> MigrationResult<Box<dyn MirrorHandle>> {
            self.recorder.lock().started.push(task.shard_id.clone());
            let status = self
                .statuses
                .iter()
                .find(|(shard, _)| shard == &task.shard_id)
                .and_then(|(_, json)| *json)
                .map(|json| serde_json::from_str(json).unwrap());
            Ok(Box::new(FakeHandle {
                shard_id: task.shard_id.clone(),
                status,
                recorder: self.recorder.clone(),
            }))
        }
    }

    #[async_trait]
    impl MirrorHandle for FakeHandle {
        async fn status(&self) -> MigrationResult<MirrorStatus> {
            match &self.status {
                Some(status) => Ok(status.clone()),
                None => futures::future::pending().await,
            }
        }

        async fn shutdown(&mut self, _timeout: Duration) -> MigrationResult<ShutdownOutcome> {
            self.recorder.lock().stopped.push(self.shard_id.clone());
            match self.shard_id.as_str() {
                "broken" => Err(MigrationError::service_error("no such process")),
                "stubborn" => Ok(ShutdownOutcome::StillRunning),
                _ => Ok(ShutdownOutcome::Exited),
            }
        }
    }

    fn task(shard_id: &str, port: u16) -> MirrorTask {
        let endpoint = Endpoint {
            host: format!("{shard_id}/localhost:27017"),
            credentials: None,
            tls: false,
        };
        MirrorTask {
            shard_id: shard_id.to_string(),
            source: endpoint.clone(),
            destination: endpoint,
            include_namespaces: Vec::new(),
            include_databases: Vec::new(),
            bookmark_file: MirrorTask::bookmark_file_name("test", shard_id),
            http_status_port: port,
            num_parallel_collections: None,
            write_concern: None,
            compressors: None,
            tail_only: false,
            preserve_uuids: false,
            oplog_path: None,
            ssl_allow_invalid_hostnames: false,
            ssl_allow_invalid_certificates: false,
            state: MirrorState::Created,
        }
    }

    fn orchestrator(
        statuses: Vec<(ShardId, Option<&'static str>)>,
    ) -> (MirrorOrchestrator, Arc<Mutex<Recorder>>) {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let runner = FakeRunner {
            recorder: recorder.clone(),
            statuses,
        };
        let config = MirrorConfig {
            launch_delay_ms: 100,
            ..MirrorConfig::default()
        };
        (MirrorOrchestrator::new(config, Box::new(runner)), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn slow_status_does_not_block_others() {
        let (mut orchestrator, recorder) = orchestrator(vec![
            (
                "shard0".to_string(),
                Some(r#"{"stage":"oplog sync","phase":"applying oplog entries"}"#),
            ),
            ("shard1".to_string(), None),
            (
                "shard2".to_string(),
                Some(r#"{"stage":"initial sync","phase":"copying documents","errorMessage":"x"}"#),
            ),
        ]);
        let cancel = CancellationToken::new();
        orchestrator
            .launch(
                vec![task("shard0", 9001), task("shard1", 9002), task("shard2", 9003)],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(recorder.lock().started.len(), 3);
        assert!(orchestrator.tasks().all(|task| task.state == MirrorState::Running));

        let reports = orchestrator.tick().await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].state, MirrorState::OplogSync);
        assert_eq!(reports[1].progress, None);
        assert_eq!(reports[1].state, MirrorState::Running);
        assert_eq!(reports[2].state, MirrorState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn supervise_runs_until_cancelled() {
        let (mut orchestrator, recorder) = orchestrator(vec![(
            "shard0".to_string(),
            Some(r#"{"stage":"initial sync","phase":"copying indexes"}"#),
        )]);
        let cancel = CancellationToken::new();
        orchestrator
            .launch(
                vec![task("shard0", 9001), task("broken", 9002), task("stubborn", 9003)],
                &cancel,
            )
            .await
            .unwrap();

        let timer = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                cancel.cancel();
            }
        });
        orchestrator.supervise(cancel).await.unwrap();
        timer.await.unwrap();

        let recorder = recorder.lock();
        assert_eq!(recorder.stopped.len(), 3);
        let states: Vec<_> = orchestrator.tasks().map(|task| task.state).collect();
        assert_eq!(
            states,
            vec![
                MirrorState::Terminated,
                MirrorState::Running,
                MirrorState::Running
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_launch_starts_nothing() {
        let (mut orchestrator, recorder) = orchestrator(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        orchestrator
            .launch(vec![task("shard0", 9001)], &cancel)
            .await
            .unwrap();
        assert!(recorder.lock().started.is_empty());
        assert_eq!(orchestrator.tasks().count(), 0);
    }
}
