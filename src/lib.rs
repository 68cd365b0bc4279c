//! nodesel - best-fit linear node selection for batch workload managers.
//!
//! Given a job's resource request (node count bounds, CPU demand,
//! required/excluded node sets, memory, contiguity) and a candidate node
//! set, the engine decides which whole nodes to allocate so as to
//! minimize fragmentation: nodes live on a one-dimensional index and a
//! single tight run of consecutive nodes (or the fewest, tightest runs)
//! is preferred. With a switch table configured, selection instead
//! confines the job to the smallest satisfying switch subtree.
//!
//! # Architecture
//!
//! - **NodeMask**: bitset over the linear node index; every decision is
//!   mask arithmetic
//! - **CrState**: per-node accounting (memory, exclusivity, partition
//!   tenant counts, generic resources) plus job-id residency sets,
//!   rebuilt from the live job table and deep-clonable for hypothetical
//!   scheduling
//! - **Selectors**: the consecutive-run best fit, its topology-aware
//!   sibling, and the node-count-only reservation variant
//! - **LinearSelect**: the mutex-guarded entry points (three-mode
//!   `job_test`, lifecycle hooks, reservations, nodeinfo publication)
//!
//! # Usage
//!
//! ```rust
//! use nodesel::{Cluster, CrType, JobRecord, LinearSelect, NodeMask, SelectMode};
//! use nodesel::types::JobId;
//! use std::sync::Arc;
//!
//! let cluster = Cluster::builder().nodes(8, 4, 1024).build().unwrap();
//! let part = Arc::clone(&cluster.partitions[0]);
//! let engine = LinearSelect::new(cluster, CrType::Cpu);
//!
//! let mut job = JobRecord::new(JobId(100), part, 8);
//! job.details.min_cpus = 12;
//! let mut bitmap = NodeMask::all(8);
//! engine
//!     .job_test(&mut job, &mut bitmap, 3, 8, 3, SelectMode::RunNow, 0, &[], None)
//!     .unwrap();
//! assert_eq!(bitmap.weight(), 3);
//! ```

pub mod cluster;
pub mod engine;
pub mod errors;
pub mod gres;
pub mod lifecycle;
pub mod nodeinfo;
pub mod nodemask;
pub mod probe;
pub mod residency;
pub mod select;
pub mod state;
pub mod topo;
pub mod types;

pub use cluster::{
    AllocState, Cluster, ClusterBuilder, JobDetails, JobRecord, JobResources, JobState,
    NodeRecord, Partition, PowerState, Switch,
};
pub use engine::LinearSelect;
pub use errors::SelectError;
pub use gres::{GresNodeState, GresRequest};
pub use nodeinfo::{NodeInfo, NodeInfoData, NodeInfoKey, NODEINFO_MAGIC};
pub use nodemask::NodeMask;
pub use probe::HealthProbe;
pub use residency::JobIdSet;
pub use state::CrState;
pub use types::{CrType, JobId, MemoryRequest, PreemptMode, SelectMode, Timestamp};
