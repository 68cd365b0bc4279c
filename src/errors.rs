//! Error surface of the selection engine.

use crate::types::JobId;

/// Scheduling and accounting errors.
///
/// `NoFit` is the ordinary "cannot place" answer of `job_test`; callers
/// are expected to retry later. The remaining variants report state drift
/// or unsupported requests. Drift is always repaired best-effort (clamp
/// and log) before the error is returned, so the state stays usable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("no nodes satisfy the request")]
    NoFit,

    #[error("job {0} has no resources allocated")]
    NoAllocation(JobId),

    #[error("state accounting drifted: {0}")]
    Invariant(&'static str),

    #[error("cannot merge jobs holding generic resources")]
    ExpandGres,

    #[error("attempt to merge a job with itself")]
    ExpandSelf,

    #[error("node {0} is not part of the job's allocation")]
    InvalidNode(usize),

    #[error("bad magic in per-node select info")]
    BadNodeInfo,
}
