//! Supervision of external `mongomirror` processes, one per source shard.

mod orchestrator;
mod runner;
mod status;
mod task;

pub use self::orchestrator::{MirrorOrchestrator, TaskReport};
pub use self::runner::{MirrorHandle, MirrorRunner, ProcessMirrorRunner, ShutdownOutcome};
pub use self::status::{MirrorProgress, MirrorStatus, OplogTimestamp, PrettyLag, StatusDetails};
pub use self::task::{
    plan_replica_set_tasks, plan_tasks, Endpoint, MirrorState, MirrorTask,
    BOOKMARK_TIMESTAMP_FORMAT,
};
