//! Newtype wrappers and type aliases for domain concepts.
//!
//! Newtypes for identifiers (job ids) prevent silent type confusion; type
//! aliases for plain quantities (timestamps) keep signatures readable
//! without arithmetic-trait boilerplate.

use std::fmt;

/// Job identifier.
///
/// Zero is reserved as the tombstone value in the residency arrays
/// (see [`crate::residency::JobIdSet`]), so real job ids must be nonzero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Wall-clock time in seconds. Always passed in by the caller; the engine
/// never reads the clock itself.
pub type Timestamp = u64;

/// Scheduling decision mode for [`crate::LinearSelect::job_test`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Try to schedule the job on the current state.
    RunNow,
    /// Determine whether the job could ever run, ignoring current
    /// allocations and memory.
    TestOnly,
    /// Determine when and where the job can run by simulating running
    /// jobs terminating in end-time order.
    WillRun,
}

/// Which resource is the unit of consumable accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrType {
    /// Account CPUs only; memory requests are not enforced.
    Cpu,
    /// Account memory per node in addition to CPUs.
    Memory,
}

/// Flag bit in the raw per-node memory request: when set, the low bits are
/// megabytes per CPU rather than per node.
pub const MEM_PER_CPU: u64 = 0x8000_0000_0000_0000;

/// A job's memory request, decoded from the raw `pn_min_memory` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryRequest {
    /// No memory request.
    #[default]
    None,
    /// Megabytes per allocated node.
    PerNode(u64),
    /// Megabytes per CPU on each allocated node.
    PerCpu(u64),
}

impl MemoryRequest {
    /// Decode the raw request: zero means none, the [`MEM_PER_CPU`] high
    /// bit selects per-CPU semantics for the low bits.
    pub fn from_raw(raw: u64) -> Self {
        if raw == 0 {
            MemoryRequest::None
        } else if raw & MEM_PER_CPU != 0 {
            MemoryRequest::PerCpu(raw & !MEM_PER_CPU)
        } else {
            MemoryRequest::PerNode(raw)
        }
    }

    /// Megabytes this request claims on a node with `cpu_cnt` CPUs.
    pub fn on_node(&self, cpu_cnt: u32) -> u64 {
        match self {
            MemoryRequest::None => 0,
            MemoryRequest::PerNode(mb) => *mb,
            MemoryRequest::PerCpu(mb) => mb * cpu_cnt as u64,
        }
    }

    pub fn is_per_cpu(&self) -> bool {
        matches!(self, MemoryRequest::PerCpu(_))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, MemoryRequest::None)
    }
}

/// How a preempted job is taken off its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreemptMode {
    /// Job is not preemptible.
    #[default]
    Off,
    /// Job is suspended in place; it keeps memory and exclusivity.
    Suspend,
    /// Job is requeued; all of its resources are released.
    Requeue,
    /// Job is checkpointed and released.
    Checkpoint,
    /// Job is cancelled outright.
    Cancel,
}

impl PreemptMode {
    /// Whether preemption under this mode frees every resource the job
    /// holds (as opposed to a suspend, which keeps memory and
    /// exclusivity).
    pub fn removes_all(&self) -> bool {
        matches!(
            self,
            PreemptMode::Requeue | PreemptMode::Checkpoint | PreemptMode::Cancel
        )
    }
}

/// Share-count sentinel meaning "no limit" in the feasibility sweep.
pub const NO_SHARE_LIMIT: u32 = 0xfffe;

/// Bit on a partition's `max_share` forcing sharing on its jobs; masked
/// off when deriving a job's effective share level.
pub const SHARED_FORCE: u16 = 0x8000;

/// Growth increment of the sparse job-id residency arrays.
pub const JOB_ID_BLOCK: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_request_decode() {
        assert_eq!(MemoryRequest::from_raw(0), MemoryRequest::None);
        assert_eq!(MemoryRequest::from_raw(512), MemoryRequest::PerNode(512));
        assert_eq!(
            MemoryRequest::from_raw(MEM_PER_CPU | 128),
            MemoryRequest::PerCpu(128)
        );
    }

    #[test]
    fn test_memory_request_on_node() {
        assert_eq!(MemoryRequest::None.on_node(8), 0);
        assert_eq!(MemoryRequest::PerNode(512).on_node(8), 512);
        assert_eq!(MemoryRequest::PerCpu(128).on_node(8), 1024);
    }
}
