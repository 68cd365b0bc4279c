//! The in-memory resource accounting snapshot.
//!
//! `CrState` holds, for every node, the memory claimed by resident jobs,
//! the exclusive-use count, per-partition tenant counters, and an owned
//! view of the node's generic-resource usage, plus the two job-id
//! residency sets. It is created lazily on first use, rebuilt from the
//! live running/suspended job set, and dropped whenever the node table
//! changes.
//!
//! Cloning a `CrState` yields a deep, independent copy sharing nothing
//! mutable with the original (partition handles are shared `Arc`
//! identities, which is the point: lookups are by partition identity).
//! The clone is what hypothetical scheduling (preemption retry, will-run
//! simulation) mutates.

use std::sync::Arc;

use log::{debug, error, info};

use crate::cluster::{Cluster, JobRecord, Partition};
use crate::gres;
use crate::gres::GresNodeState;
use crate::residency::JobIdSet;
use crate::types::CrType;

/// Tenant counters for one partition on one node.
#[derive(Debug, Clone)]
pub struct PartUsage {
    pub part: Arc<Partition>,
    pub run_job_cnt: u32,
    pub tot_job_cnt: u32,
}

/// Resources consumed on one node.
#[derive(Debug, Clone, Default)]
pub struct NodeUsage {
    /// Memory claimed by resident jobs (MB).
    pub alloc_memory: u64,
    /// Number of resident jobs that requested exclusive use. Nonzero
    /// means no other job may be placed here.
    pub exclusive_cnt: u32,
    /// One entry per partition whose node set includes this node. The
    /// list is tiny; lookups walk it comparing partition identity.
    pub parts: Vec<PartUsage>,
    /// Owned generic-resource view, or None when the node has no generic
    /// resources configured.
    pub gres: Option<GresNodeState>,
}

impl NodeUsage {
    /// The partition entry matching `part` by identity.
    pub fn part_usage_mut(&mut self, part: &Arc<Partition>) -> Option<&mut PartUsage> {
        self.parts.iter_mut().find(|p| Arc::ptr_eq(&p.part, part))
    }
}

/// Snapshot of consumed resources across the cluster.
#[derive(Debug, Clone, Default)]
pub struct CrState {
    pub nodes: Vec<NodeUsage>,
    /// Jobs currently consuming CPUs somewhere.
    pub run_job_ids: JobIdSet,
    /// Jobs currently holding any resources, suspended ones included.
    pub tot_job_ids: JobIdSet,
}

impl CrState {
    /// Rebuild the snapshot from the current cluster tables and the set
    /// of running/suspended jobs.
    pub fn rebuild(cluster: &Cluster, jobs: &[JobRecord], cr_type: CrType) -> CrState {
        let mut state = CrState {
            nodes: vec![NodeUsage::default(); cluster.node_cnt()],
            run_job_ids: JobIdSet::new(),
            tot_job_ids: JobIdSet::new(),
        };

        for part in &cluster.partitions {
            for i in part.node_mask.iter() {
                state.nodes[i].parts.push(PartUsage {
                    part: Arc::clone(part),
                    run_job_cnt: 0,
                    tot_job_cnt: 0,
                });
            }
        }

        for (i, node) in cluster.nodes.iter().enumerate() {
            if !node.gres.is_empty() {
                state.nodes[i].gres = Some(node.gres.clone());
            }
        }

        for job in jobs {
            if !job.is_active() {
                continue;
            }
            let resources = match &job.resources {
                Some(r) => r,
                None => {
                    error!("job {} lacks a job resources struct", job.id);
                    continue;
                }
            };
            if job.counts_as_running() {
                state.run_job_ids.add(job.id);
            }
            state.tot_job_ids.add(job.id);

            let exclusive = job.details.exclusive();
            // The resources mask rather than the job's node mask drives
            // the walk: downed nodes are cleared from the latter but
            // still accounted.
            for i in resources.node_mask.iter() {
                let cpu_cnt = cluster.cpu_cnt(i);
                if cr_type == CrType::Memory {
                    state.nodes[i].alloc_memory += job.details.memory.on_node(cpu_cnt);
                }
                if exclusive {
                    state.nodes[i].exclusive_cnt += 1;
                }
                if job.node_mask.test(i) {
                    if let Some(node_gres) = state.nodes[i].gres.as_mut() {
                        gres::job_alloc(&job.details.gres, node_gres, &cluster.nodes[i].name);
                    }
                }
                match state.nodes[i].part_usage_mut(&job.part) {
                    Some(usage) => {
                        if job.counts_as_running() {
                            usage.run_job_cnt += 1;
                        }
                        usage.tot_job_cnt += 1;
                    }
                    None => {
                        info!(
                            "rebuild: job {} could not find partition {} for node {}",
                            job.id, job.part.name, cluster.nodes[i].name
                        );
                    }
                }
            }
        }

        state.dump(cluster);
        state
    }

    /// Log the full snapshot at debug severity.
    pub fn dump(&self, cluster: &Cluster) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        for id in self.run_job_ids.iter() {
            debug!("Running job:{id}");
        }
        for id in self.tot_job_ids.iter() {
            debug!("Alloc job:{id}");
        }
        for (i, usage) in self.nodes.iter().enumerate() {
            debug!(
                "Node:{} exclusive_cnt:{} alloc_mem:{}",
                cluster.nodes[i].name, usage.exclusive_cnt, usage.alloc_memory
            );
            for part in &usage.parts {
                debug!(
                    "  Part:{} run:{} tot:{}",
                    part.part.name, part.run_job_cnt, part.tot_job_cnt
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{JobState, JobResources};
    use crate::nodemask::NodeMask;
    use crate::types::{JobId, MemoryRequest};

    fn running_job(cluster: &Cluster, id: u32, nodes: &[usize]) -> JobRecord {
        let mut job = JobRecord::new(JobId(id), Arc::clone(&cluster.partitions[0]), cluster.node_cnt());
        job.state = JobState::Running;
        job.node_mask = NodeMask::from_indices(cluster.node_cnt(), nodes);
        let mut res = JobResources::new(nodes.len(), cluster.node_cnt());
        res.node_mask = job.node_mask.clone();
        res.cpus = nodes.iter().map(|&i| cluster.cpu_cnt(i)).collect();
        job.resources = Some(res);
        job
    }

    #[test]
    fn test_rebuild_empty() {
        let cluster = Cluster::builder().nodes(4, 8, 1024).build().unwrap();
        let state = CrState::rebuild(&cluster, &[], CrType::Cpu);
        assert_eq!(state.nodes.len(), 4);
        assert_eq!(state.nodes[0].parts.len(), 1);
        assert_eq!(state.nodes[0].parts[0].tot_job_cnt, 0);
    }

    #[test]
    fn test_rebuild_counts_running_job() {
        let cluster = Cluster::builder().nodes(4, 8, 1024).build().unwrap();
        let mut job = running_job(&cluster, 7, &[1, 2]);
        job.details.memory = MemoryRequest::PerNode(256);
        let state = CrState::rebuild(&cluster, &[job], CrType::Memory);

        assert!(state.run_job_ids.contains(JobId(7)));
        assert!(state.tot_job_ids.contains(JobId(7)));
        assert_eq!(state.nodes[1].alloc_memory, 256);
        assert_eq!(state.nodes[1].exclusive_cnt, 1);
        assert_eq!(state.nodes[1].parts[0].run_job_cnt, 1);
        assert_eq!(state.nodes[0].parts[0].run_job_cnt, 0);
    }

    #[test]
    fn test_parked_suspended_job_not_running() {
        let cluster = Cluster::builder().nodes(2, 8, 1024).build().unwrap();
        let mut job = running_job(&cluster, 3, &[0]);
        job.state = JobState::Suspended;
        job.priority = 0;
        let state = CrState::rebuild(&cluster, &[job], CrType::Cpu);
        assert!(!state.run_job_ids.contains(JobId(3)));
        assert!(state.tot_job_ids.contains(JobId(3)));
        assert_eq!(state.nodes[0].parts[0].run_job_cnt, 0);
        assert_eq!(state.nodes[0].parts[0].tot_job_cnt, 1);
    }

    #[test]
    fn test_clone_is_independent() {
        let cluster = Cluster::builder().nodes(2, 8, 1024).build().unwrap();
        let job = running_job(&cluster, 5, &[0]);
        let state = CrState::rebuild(&cluster, &[job], CrType::Cpu);
        let mut copy = state.clone();
        copy.nodes[0].exclusive_cnt = 99;
        copy.run_job_ids.remove(JobId(5));
        assert_eq!(state.nodes[0].exclusive_cnt, 1);
        assert!(state.run_job_ids.contains(JobId(5)));
        // Partition handles stay shared identities.
        assert!(Arc::ptr_eq(
            &state.nodes[0].parts[0].part,
            &copy.nodes[0].parts[0].part
        ));
    }
}
