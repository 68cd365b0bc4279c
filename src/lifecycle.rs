//! Job lifecycle mutations against the accounting snapshot.
//!
//! Adding covers job begin (everything claimed) and resume (only the run
//! residency returns); removal covers finish (everything released) and
//! suspend (only the run residency leaves — a suspended job keeps its
//! memory, exclusivity, and total-count claims). Underflows are never
//! fatal: counters clamp to zero and the drift is logged, keeping the
//! state usable across restarts and node reconfigurations.

use log::{debug, error, info};

use crate::cluster::{Cluster, JobRecord, JobResources};
use crate::errors::SelectError;
use crate::gres;
use crate::nodemask::NodeMask;
use crate::state::CrState;
use crate::types::CrType;

/// Memory a job claims on node `index`, honoring the consumable-resource
/// type.
fn job_memory_on(cluster: &Cluster, cr_type: CrType, job: &JobRecord, index: usize) -> u64 {
    if cr_type != CrType::Memory {
        return 0;
    }
    job.details.memory.on_node(cluster.cpu_cnt(index))
}

/// Allocate resources to a job.
///
/// With `alloc_all` the job is beginning: memory, generic resources,
/// exclusivity, and both residency sets are claimed. Without it the job
/// is resuming from suspension and only the run-side claims return.
pub fn add_job(
    state: &mut CrState,
    cluster: &Cluster,
    cr_type: CrType,
    job: &mut JobRecord,
    alloc_all: bool,
    pre_err: &str,
) -> Result<(), SelectError> {
    let resources = match &job.resources {
        Some(r) => r.clone(),
        None => {
            error!("{}: job {} lacks a job resources struct", pre_err, job.id);
            return Err(SelectError::NoAllocation(job.id));
        }
    };

    let mut rc = Ok(());
    let exclusive = job.details.exclusive();
    state.run_job_ids.add(job.id);
    if alloc_all {
        state.tot_job_ids.add(job.id);
    }

    for i in resources.node_mask.iter() {
        if !job.node_mask.test(i) {
            continue;
        }
        let usage = &mut state.nodes[i];
        if alloc_all {
            usage.alloc_memory += job_memory_on(cluster, cr_type, job, i);
            if let Some(node_gres) = usage.gres.as_mut() {
                gres::job_alloc(&job.details.gres, node_gres, &cluster.nodes[i].name);
            }
            if exclusive {
                usage.exclusive_cnt += 1;
            }
        }
        match usage.part_usage_mut(&job.part) {
            Some(part_usage) => {
                part_usage.run_job_cnt += 1;
                if alloc_all {
                    part_usage.tot_job_cnt += 1;
                }
            }
            None => {
                info!(
                    "{}: job {} could not find partition {} for node {}",
                    pre_err, job.id, job.part.name, cluster.nodes[i].name
                );
                job.part_nodes_missing = true;
                rc = Err(SelectError::Invariant("partition entry missing"));
            }
        }
    }
    rc
}

/// Deallocate resources that were assigned to a job.
///
/// With `remove_all` the job is finishing and everything it held is
/// released. Without it the job is being suspended: only the run
/// residency entry and per-partition run counts are released.
pub fn remove_job(
    state: &mut CrState,
    cluster: &Cluster,
    cr_type: CrType,
    job: &mut JobRecord,
    remove_all: bool,
    pre_err: &str,
) -> Result<(), SelectError> {
    let held = if remove_all {
        state.tot_job_ids.remove(job.id)
    } else {
        state.tot_job_ids.contains(job.id)
    };
    if !held {
        info!("{}: job {} has no resources allocated", pre_err, job.id);
        return Err(SelectError::NoAllocation(job.id));
    }

    let resources = match &job.resources {
        Some(r) => r.clone(),
        None => {
            error!("{}: job {} lacks a job resources struct", pre_err, job.id);
            return Err(SelectError::NoAllocation(job.id));
        }
    };

    let is_job_running = state.run_job_ids.remove(job.id);
    let exclusive = job.details.exclusive();
    let mut rc = Ok(());

    for i in resources.node_mask.iter() {
        if !job.node_mask.test(i) {
            continue;
        }
        let node_name = &cluster.nodes[i].name;
        let usage = &mut state.nodes[i];

        if remove_all {
            let job_memory = job_memory_on(cluster, cr_type, job, i);
            if usage.alloc_memory >= job_memory {
                usage.alloc_memory -= job_memory;
            } else {
                // With fast-schedule off the allocation may have been
                // sized from a different CPU count than the one seen at
                // release.
                let node = &cluster.nodes[i];
                if cluster.fast_schedule || node.config_cpus == node.cpus {
                    error!("{}: memory underflow for node {}", pre_err, node_name);
                } else {
                    debug!("{}: memory underflow for node {}", pre_err, node_name);
                }
                usage.alloc_memory = 0;
            }

            if let Some(node_gres) = usage.gres.as_mut() {
                gres::job_dealloc(&job.details.gres, node_gres, node_name);
            }

            if exclusive {
                if usage.exclusive_cnt > 0 {
                    usage.exclusive_cnt -= 1;
                } else {
                    error!("{}: exclusive_cnt underflow for node {}", pre_err, node_name);
                    rc = Err(SelectError::Invariant("exclusive_cnt underflow"));
                }
            }
        }

        match usage.part_usage_mut(&job.part) {
            Some(part_usage) => {
                if !is_job_running {
                    // Cancelled job was already suspended.
                } else if part_usage.run_job_cnt > 0 {
                    part_usage.run_job_cnt -= 1;
                } else {
                    error!("{}: run_job_cnt underflow for node {}", pre_err, node_name);
                    rc = Err(SelectError::Invariant("run_job_cnt underflow"));
                }
                if remove_all {
                    if part_usage.tot_job_cnt > 0 {
                        part_usage.tot_job_cnt -= 1;
                    } else {
                        error!("{}: tot_job_cnt underflow for node {}", pre_err, node_name);
                        rc = Err(SelectError::Invariant("tot_job_cnt underflow"));
                    }
                    if part_usage.tot_job_cnt == 0 && part_usage.run_job_cnt != 0 {
                        part_usage.run_job_cnt = 0;
                        error!("{}: run_job_cnt out of sync for node {}", pre_err, node_name);
                        rc = Err(SelectError::Invariant("run_job_cnt out of sync"));
                    }
                }
            }
            None => {
                if job.part_nodes_missing {
                    // Already reported when the job was added.
                } else {
                    info!(
                        "{}: job {} and its partition {} no longer contain node {}",
                        pre_err, job.id, job.part.name, node_name
                    );
                }
                job.part_nodes_missing = true;
                rc = Err(SelectError::Invariant("partition entry missing"));
            }
        }
    }
    rc
}

/// Release the claims a job holds on one specific node (used when a node
/// is lost from a running allocation).
pub fn remove_one_node(
    state: &mut CrState,
    cluster: &Cluster,
    cr_type: CrType,
    job: &mut JobRecord,
    node_inx: usize,
    pre_err: &str,
) -> Result<(), SelectError> {
    if node_inx >= cluster.node_cnt() {
        error!("{}: node index {} out of range", pre_err, node_inx);
        return Err(SelectError::InvalidNode(node_inx));
    }
    if !state.tot_job_ids.contains(job.id) {
        info!("{}: job {} has no resources allocated", pre_err, job.id);
        return Err(SelectError::NoAllocation(job.id));
    }
    let node_name = cluster.nodes[node_inx].name.clone();

    let resources = match job.resources.as_mut() {
        Some(r) => r,
        None => {
            error!("{}: job {} lacks a job resources struct", pre_err, job.id);
            return Err(SelectError::NoAllocation(job.id));
        }
    };
    let node_offset = match resources.offset_of(node_inx) {
        Some(offset) => offset,
        None => {
            error!(
                "{}: job {} allocated node {} which has been removed from the configuration",
                pre_err, job.id, node_name
            );
            return Err(SelectError::InvalidNode(node_inx));
        }
    };
    if resources.cpus[node_offset] == 0 {
        error!(
            "{}: duplicate relinquish of node {} by job {}",
            pre_err, node_name, job.id
        );
        return Err(SelectError::Invariant("duplicate node relinquish"));
    }
    resources.cpus[node_offset] = 0;
    resources.rebuild_cpu_array();

    let is_job_running = state.run_job_ids.contains(job.id);
    let job_memory = job_memory_on(cluster, cr_type, job, node_inx);
    let mut rc = Ok(());
    let usage = &mut state.nodes[node_inx];

    if usage.alloc_memory >= job_memory {
        usage.alloc_memory -= job_memory;
    } else {
        usage.alloc_memory = 0;
        error!("{}: memory underflow for node {}", pre_err, node_name);
        rc = Err(SelectError::Invariant("memory underflow"));
    }

    if let Some(node_gres) = usage.gres.as_mut() {
        gres::job_dealloc(&job.details.gres, node_gres, &node_name);
    }

    if job.details.exclusive() {
        if usage.exclusive_cnt > 0 {
            usage.exclusive_cnt -= 1;
        } else {
            error!("{}: exclusive_cnt underflow for node {}", pre_err, node_name);
            rc = Err(SelectError::Invariant("exclusive_cnt underflow"));
        }
    }

    match usage.part_usage_mut(&job.part) {
        Some(part_usage) => {
            if !is_job_running {
                // Job already suspended; nothing running to release.
            } else if part_usage.run_job_cnt > 0 {
                part_usage.run_job_cnt -= 1;
            } else {
                error!("{}: run_job_cnt underflow for node {}", pre_err, node_name);
                rc = Err(SelectError::Invariant("run_job_cnt underflow"));
            }
            if part_usage.tot_job_cnt > 0 {
                part_usage.tot_job_cnt -= 1;
            } else {
                error!("{}: tot_job_cnt underflow for node {}", pre_err, node_name);
                rc = Err(SelectError::Invariant("tot_job_cnt underflow"));
            }
            if part_usage.tot_job_cnt == 0 && part_usage.run_job_cnt != 0 {
                part_usage.run_job_cnt = 0;
                error!("{}: run_job_cnt out of sync for node {}", pre_err, node_name);
                rc = Err(SelectError::Invariant("run_job_cnt out of sync"));
            }
        }
        None => {
            error!(
                "{}: could not find partition {} for node {}",
                pre_err, job.part.name, node_name
            );
            rc = Err(SelectError::Invariant("partition entry missing"));
        }
    }
    rc
}

/// Move every resource from one job to another, merging the per-node CPU
/// and memory allocations. The donor is left with no nodes.
pub fn expand(
    state: &mut CrState,
    cluster: &Cluster,
    cr_type: CrType,
    from_job: &mut JobRecord,
    to_job: &mut JobRecord,
) -> Result<(), SelectError> {
    if from_job.id == to_job.id {
        error!("attempt to merge job {} with itself", from_job.id);
        return Err(SelectError::ExpandSelf);
    }
    for job in [&*from_job, &*to_job] {
        if !state.tot_job_ids.contains(job.id) {
            info!("job {} has no resources allocated", job.id);
            return Err(SelectError::NoAllocation(job.id));
        }
    }
    if !from_job.details.gres.is_empty() || !to_job.details.gres.is_empty() {
        // Possible to support, but complex and fragile.
        info!("attempt to merge job {} holding generic resources", from_job.id);
        return Err(SelectError::ExpandGres);
    }
    if from_job.resources.is_none() || to_job.resources.is_none() {
        let missing = if from_job.resources.is_none() {
            from_job.id
        } else {
            to_job.id
        };
        error!("job {} lacks a job resources struct", missing);
        return Err(SelectError::NoAllocation(missing));
    }
    let from_res = from_job.resources.take().unwrap();
    let to_res = to_job.resources.take().unwrap();

    let from_mem_per_cpu = cr_type == CrType::Memory && from_job.details.memory.is_per_cpu();
    let union = from_res.node_mask.or(&to_res.node_mask);
    let node_cnt = union.weight();
    let mut new_res = JobResources::new(node_cnt, cluster.node_cnt());
    new_res.node_mask = union.clone();
    new_res.nodes = cluster.node_names(&union);
    new_res.ncpus = from_res.ncpus + to_res.ncpus;

    let mut from_res = from_res;
    let mut new_offset = 0usize;
    for i in union.iter() {
        let from_offset = from_res.offset_of(i);
        let to_offset = to_res.offset_of(i);
        let node_name = &cluster.nodes[i].name;

        if let Some(fo) = from_offset {
            // Merge the donor's claims and zero them in place; the donor
            // keeps a resources struct with no allocation.
            new_res.cpus[new_offset] += from_res.cpus[fo];
            from_res.cpus[fo] = 0;
            new_res.memory_allocated[new_offset] += from_res.memory_allocated[fo];
            from_res.memory_allocated[fo] = 0;
            if to_offset.is_some() && to_job.details.exclusive() {
                // Both jobs held the node; the merged job counts once.
                let usage = &mut state.nodes[i];
                if usage.exclusive_cnt > 0 {
                    usage.exclusive_cnt -= 1;
                } else {
                    error!("exclusive_cnt underflow for node {}", node_name);
                }
            }
        }
        if let Some(to) = to_offset {
            new_res.cpus[new_offset] += to_res.cpus[to];
            new_res.cpus_used[new_offset] += to_res.cpus_used[to];
            if from_offset.is_none() || from_mem_per_cpu {
                new_res.memory_allocated[new_offset] += to_res.memory_allocated[to];
            } else {
                // Memory was claimed per node by both jobs; the merged
                // job claims it once, so the node counter gives one back.
                let usage = &mut state.nodes[i];
                if usage.alloc_memory >= to_res.memory_allocated[to] {
                    usage.alloc_memory -= to_res.memory_allocated[to];
                } else {
                    usage.alloc_memory = 0;
                    error!("memory underflow for node {}", node_name);
                }
            }
            new_res.memory_used[new_offset] += to_res.memory_used[to];
        }
        new_offset += 1;
    }
    new_res.rebuild_cpu_array();

    from_res.node_mask.clear_all();
    from_res.nodes = String::new();
    from_res.ncpus = 0;
    from_res.nhosts = 0;

    to_job.total_cpus += from_job.total_cpus;
    to_job.details.min_cpus = to_job.total_cpus;
    from_job.total_cpus = 0;
    from_job.details.min_cpus = 0;

    to_job.node_cnt = node_cnt as u32;
    from_job.node_cnt = 0;
    to_job.node_mask |= &from_job.node_mask;
    from_job.node_mask.clear_all();

    to_job.resources = Some(new_res);
    from_job.resources = Some(from_res);
    Ok(())
}

/// Build the full resources layout for a job from the nodes allocated to
/// it and its memory request.
pub fn build_resources(cluster: &Cluster, cr_type: CrType, job: &mut JobRecord, mask: &NodeMask) {
    let node_cnt = mask.weight();
    let mut res = JobResources::new(node_cnt, cluster.node_cnt());
    res.node_mask = mask.clone();
    res.nodes = cluster.node_names(mask);
    res.ncpus = job.total_cpus;

    let mut total_cpus = 0;
    for (j, i) in mask.iter().enumerate() {
        let node_cpus = cluster.cpu_cnt(i);
        res.cpus[j] = node_cpus;
        total_cpus += node_cpus;
        if cr_type == CrType::Memory {
            res.memory_allocated[j] = job.details.memory.on_node(node_cpus);
        }
    }
    res.rebuild_cpu_array();
    if res.ncpus != total_cpus {
        error!(
            "build_resources: ncpus mismatch {} != {} for job {}",
            res.ncpus, total_cpus, job.id
        );
    }
    job.resources = Some(res);
}
