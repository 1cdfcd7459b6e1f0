//! Run progress: the persisted snapshot and the tracker that keeps it current.
//!
//! One pretty-printed JSON file per run lives in the progress directory,
//! written atomically and signed with an HMAC keyed by the plan hash. A run
//! left FAILED, PAUSED or stale RUNNING can be resumed: completed queries are
//! skipped and the rest go back to PENDING.

mod snapshot;
mod tracker;

pub use snapshot::{
    list, new_migration_id, rate, snapshot_path, Counters, ErrorRecord, Performance, Phase,
    PhaseRecord, PhaseStatus, ProgressSnapshot, QueryRecord, QueryStatus, ResumeInfo, RunStatus,
    SNAPSHOT_VERSION, STALE_AFTER,
};
pub use tracker::ProgressTracker;
