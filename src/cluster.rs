//! Cluster tables and job views consumed by the selection engine.
//!
//! These records mirror the workload manager's node, partition, switch,
//! and job tables. The engine treats them as read-only collaborators: all
//! mutable accounting lives in the state snapshot (`state.rs`), and the
//! only job fields the engine writes are the allocation results
//! (`node_mask`, `total_cpus`, `resources`, `start_time`,
//! `part_nodes_missing`).
//!
//! Partitions are referenced by `Arc` identity: two handles name the
//! same partition only when they point at the same table entry.

use std::sync::Arc;

use anyhow::bail;
use anyhow::Result;

use crate::gres::{GresNodeState, GresRequest};
use crate::nodemask::NodeMask;
use crate::types::{JobId, MemoryRequest, PreemptMode, Timestamp};

/// Power management status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    #[default]
    Up,
    /// Powered down to save energy.
    Saving,
    /// In transition back up; not yet usable.
    PoweringUp,
}

/// Allocation status of a node, as published by the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocState {
    #[default]
    Idle,
    Allocated,
    /// Still running job cleanup; counts as allocated for reporting.
    Completing,
}

/// One node of the cluster.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    /// CPUs detected on the node.
    pub cpus: u32,
    /// CPUs declared in the cluster configuration.
    pub config_cpus: u32,
    /// Memory detected on the node (MB).
    pub real_memory: u64,
    /// Memory declared in the cluster configuration (MB).
    pub config_real_memory: u64,
    /// Configured generic resources, with nothing allocated.
    pub gres: GresNodeState,
    pub alloc_state: AllocState,
    pub power: PowerState,
}

impl NodeRecord {
    pub fn new(name: &str, cpus: u32, real_memory: u64) -> Self {
        NodeRecord {
            name: name.to_string(),
            cpus,
            config_cpus: cpus,
            real_memory,
            config_real_memory: real_memory,
            gres: GresNodeState::default(),
            alloc_state: AllocState::default(),
            power: PowerState::default(),
        }
    }
}

/// One partition of the cluster. Jobs reference their partition by `Arc`
/// identity; two handles compare equal only when they are the same table
/// entry.
#[derive(Debug)]
pub struct Partition {
    pub name: String,
    /// How many jobs may co-reside on one of this partition's nodes. The
    /// high bit ([`crate::types::SHARED_FORCE`]) forces sharing and is
    /// masked off when deriving a job's effective share level.
    pub max_share: u16,
    pub node_mask: NodeMask,
}

/// One switch of the network topology. Leaf switches have level 0; higher
/// levels are closer to the root.
#[derive(Debug, Clone)]
pub struct Switch {
    pub name: String,
    pub level: u32,
    pub node_mask: NodeMask,
    /// Link speed, used for tie-break logging only.
    pub link_speed: u32,
}

/// The read-only cluster view: node, partition, and switch tables plus
/// the fast-schedule flag deciding whether configured or detected
/// CPU/memory figures drive scheduling.
#[derive(Debug)]
pub struct Cluster {
    pub nodes: Vec<NodeRecord>,
    pub partitions: Vec<Arc<Partition>>,
    pub switches: Vec<Switch>,
    pub fast_schedule: bool,
    /// When the node table last changed; drives the nodeinfo republish
    /// guard.
    pub last_node_update: Timestamp,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    pub fn node_cnt(&self) -> usize {
        self.nodes.len()
    }

    pub fn has_topology(&self) -> bool {
        !self.switches.is_empty()
    }

    /// CPUs to schedule on node `index`: configured when fast-schedule is
    /// on, detected otherwise.
    pub fn cpu_cnt(&self, index: usize) -> u32 {
        let node = &self.nodes[index];
        if self.fast_schedule {
            node.config_cpus
        } else {
            node.cpus
        }
    }

    /// Memory available on node `index` (MB), per the fast-schedule flag.
    pub fn real_memory(&self, index: usize) -> u64 {
        let node = &self.nodes[index];
        if self.fast_schedule {
            node.config_real_memory
        } else {
            node.real_memory
        }
    }

    /// CPUs a job could use on node `index`, after the job's task layout
    /// constraints are applied.
    pub fn avail_cpus(&self, details: &JobDetails, index: usize) -> u32 {
        let cpus = self.cpu_cnt(index);
        let per_task = details.cpus_per_task.max(1);
        let mut avail = cpus - (cpus % per_task);
        if details.ntasks_per_node > 0 {
            avail = avail.min(details.ntasks_per_node * per_task);
        }
        avail
    }

    /// Total CPUs on node `index`, per the fast-schedule flag.
    pub fn total_cpus(&self, index: usize) -> u32 {
        self.cpu_cnt(index)
    }

    /// Comma-separated node names for a mask.
    pub fn node_names(&self, mask: &NodeMask) -> String {
        mask.iter()
            .map(|i| self.nodes[i].name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Builder for a [`Cluster`]. When no partition is declared, a default
/// one named "batch" spanning every node is added with `max_share` 1.
#[derive(Default)]
pub struct ClusterBuilder {
    nodes: Vec<NodeRecord>,
    partitions: Vec<(String, u16, Option<Vec<usize>>)>,
    switches: Vec<(String, u32, Vec<usize>, u32)>,
    fast_schedule: bool,
}

impl ClusterBuilder {
    /// Add `cnt` identical nodes named `<prefix>0..`.
    pub fn nodes(mut self, cnt: usize, cpus: u32, real_memory: u64) -> Self {
        let base = self.nodes.len();
        for i in 0..cnt {
            self.nodes
                .push(NodeRecord::new(&format!("n{}", base + i), cpus, real_memory));
        }
        self
    }

    /// Add one node record.
    pub fn node(mut self, node: NodeRecord) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add a partition over the given node indices (`None` = all nodes).
    pub fn partition(mut self, name: &str, max_share: u16, nodes: Option<&[usize]>) -> Self {
        self.partitions
            .push((name.to_string(), max_share, nodes.map(|n| n.to_vec())));
        self
    }

    /// Add a switch at the given topology level over the given nodes.
    pub fn switch(mut self, name: &str, level: u32, nodes: &[usize], link_speed: u32) -> Self {
        self.switches
            .push((name.to_string(), level, nodes.to_vec(), link_speed));
        self
    }

    pub fn fast_schedule(mut self, on: bool) -> Self {
        self.fast_schedule = on;
        self
    }

    pub fn build(mut self) -> Result<Cluster> {
        let node_cnt = self.nodes.len();
        if node_cnt == 0 {
            bail!("cluster has no nodes");
        }
        if self.partitions.is_empty() {
            self.partitions.push(("batch".to_string(), 1, None));
        }
        let mut partitions = Vec::new();
        for (name, max_share, indices) in self.partitions {
            let node_mask = match indices {
                Some(list) => {
                    if let Some(&bad) = list.iter().find(|&&i| i >= node_cnt) {
                        bail!("partition {} references unknown node {}", name, bad);
                    }
                    NodeMask::from_indices(node_cnt, &list)
                }
                None => NodeMask::all(node_cnt),
            };
            partitions.push(Arc::new(Partition {
                name,
                max_share,
                node_mask,
            }));
        }
        let mut switches = Vec::new();
        for (name, level, list, link_speed) in self.switches {
            if let Some(&bad) = list.iter().find(|&&i| i >= node_cnt) {
                bail!("switch {} references unknown node {}", name, bad);
            }
            switches.push(Switch {
                name,
                level,
                node_mask: NodeMask::from_indices(node_cnt, &list),
                link_speed,
            });
        }
        Ok(Cluster {
            nodes: self.nodes,
            partitions,
            switches,
            fast_schedule: self.fast_schedule,
            last_node_update: 0,
        })
    }
}

/// Scheduling-relevant details of a job request.
#[derive(Debug, Clone)]
pub struct JobDetails {
    /// Minimum CPUs across the whole allocation.
    pub min_cpus: u32,
    /// Nodes that must be part of any allocation.
    pub req_node_mask: Option<NodeMask>,
    /// Nodes that must never be part of the allocation.
    pub exc_node_mask: Option<NodeMask>,
    /// Allocated nodes must be consecutive on the node index.
    pub contiguous: bool,
    /// 0 = the job wants its nodes exclusively; any other value defers to
    /// the partition's share limit.
    pub shared: u16,
    pub memory: MemoryRequest,
    pub cpus_per_task: u32,
    /// 0 = no per-node task limit.
    pub ntasks_per_node: u32,
    pub gres: GresRequest,
}

impl Default for JobDetails {
    fn default() -> Self {
        JobDetails {
            min_cpus: 1,
            req_node_mask: None,
            exc_node_mask: None,
            contiguous: false,
            shared: 0,
            memory: MemoryRequest::None,
            cpus_per_task: 1,
            ntasks_per_node: 0,
            gres: GresRequest::default(),
        }
    }
}

impl JobDetails {
    /// Whether the job claims its nodes exclusively.
    pub fn exclusive(&self) -> bool {
        self.shared == 0
    }
}

/// Lifecycle state of a job, as the job table reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Suspended,
    Complete,
}

/// A job record: the request details plus the allocation results the
/// engine maintains.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: JobId,
    pub part: Arc<Partition>,
    pub details: JobDetails,
    pub state: JobState,
    /// Scheduling priority; a suspended job with priority zero is parked
    /// rather than gang-scheduled and does not count as running.
    pub priority: u32,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    /// Nodes currently allocated (may lose bits as nodes go down).
    pub node_mask: NodeMask,
    pub total_cpus: u32,
    pub node_cnt: u32,
    pub resources: Option<JobResources>,
    /// Set when accounting found a node whose partition entry is missing;
    /// later releases stay quiet about it.
    pub part_nodes_missing: bool,
    pub preempt_mode: PreemptMode,
}

impl JobRecord {
    pub fn new(id: JobId, part: Arc<Partition>, cluster_node_cnt: usize) -> Self {
        JobRecord {
            id,
            part,
            details: JobDetails::default(),
            state: JobState::Pending,
            priority: 1,
            start_time: 0,
            end_time: 0,
            node_mask: NodeMask::new(cluster_node_cnt),
            total_cpus: 0,
            node_cnt: 0,
            resources: None,
            part_nodes_missing: false,
            preempt_mode: PreemptMode::Off,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_suspended(&self) -> bool {
        self.state == JobState::Suspended
    }

    /// Running or suspended: the job holds resources.
    pub fn is_active(&self) -> bool {
        self.is_running() || self.is_suspended()
    }

    /// Whether the job consumes run slots: running, or suspended but
    /// still gang-scheduled (nonzero priority).
    pub fn counts_as_running(&self) -> bool {
        self.is_running() || (self.is_suspended() && self.priority != 0)
    }
}

/// Compact allocation layout of a job: per-node CPU and memory claims,
/// indexed by the job's position among its allocated nodes, plus the
/// run-length compressed CPU array the RPC layer reports.
#[derive(Debug, Clone, Default)]
pub struct JobResources {
    pub node_mask: NodeMask,
    /// Comma-separated node names.
    pub nodes: String,
    pub cpus: Vec<u32>,
    pub cpus_used: Vec<u32>,
    pub memory_allocated: Vec<u64>,
    pub memory_used: Vec<u64>,
    pub cpu_array_value: Vec<u32>,
    pub cpu_array_reps: Vec<u32>,
    pub ncpus: u32,
    pub nhosts: u32,
}

impl JobResources {
    pub fn new(node_cnt: usize, cluster_node_cnt: usize) -> Self {
        JobResources {
            node_mask: NodeMask::new(cluster_node_cnt),
            nodes: String::new(),
            cpus: vec![0; node_cnt],
            cpus_used: vec![0; node_cnt],
            memory_allocated: vec![0; node_cnt],
            memory_used: vec![0; node_cnt],
            cpu_array_value: Vec::new(),
            cpu_array_reps: Vec::new(),
            ncpus: 0,
            nhosts: node_cnt as u32,
        }
    }

    /// Position of node `node_inx` among the allocation's nodes, or None
    /// if the node is not part of it.
    pub fn offset_of(&self, node_inx: usize) -> Option<usize> {
        if !self.node_mask.test(node_inx) {
            return None;
        }
        Some(self.node_mask.iter().take_while(|&i| i < node_inx).count())
    }

    /// Recompute the run-length compressed CPU array from the per-node
    /// CPU counts.
    pub fn rebuild_cpu_array(&mut self) {
        self.cpu_array_value.clear();
        self.cpu_array_reps.clear();
        for &cpus in &self.cpus {
            match self.cpu_array_value.last() {
                Some(&last) if last == cpus => {
                    *self.cpu_array_reps.last_mut().unwrap() += 1;
                }
                _ => {
                    self.cpu_array_value.push(cpus);
                    self.cpu_array_reps.push(1);
                }
            }
        }
    }
}
