//! Node selection over the linear node index.
//!
//! The selection entry point narrows a candidate mask down to an
//! allocation that minimizes the number of consecutive-node runs used:
//! either a single tight run that fits the request, or the fewest and
//! tightest runs that add up to it. Feasibility against the accounting
//! snapshot (memory, exclusivity, share limits, generic resources) is a
//! separate pass ([`count_bitmap`]) so the orchestrator can sweep share
//! levels without re-running the placement.

use log::debug;

use crate::cluster::{Cluster, JobRecord};
use crate::errors::SelectError;
use crate::gres;
use crate::nodemask::NodeMask;
use crate::state::CrState;
use crate::topo;
use crate::types::{CrType, SelectMode};

/// Whether `avail_nodes` nodes can finish a request still missing
/// `rem_nodes`, given the preferred count biasing: when the scheduler
/// prefers more nodes than the minimum, the shortfall may be absorbed
/// down to the minimum.
pub(crate) fn enough_nodes(
    avail_nodes: i64,
    rem_nodes: i64,
    min_nodes: u32,
    req_nodes: u32,
) -> bool {
    let needed = if req_nodes > min_nodes {
        rem_nodes + min_nodes as i64 - req_nodes as i64
    } else {
        rem_nodes
    };
    avail_nodes >= needed
}

/// Filter a candidate mask against the accounting snapshot.
///
/// Sets in `output` every node of `input` that can take the job under
/// per-node caps of `run_cap` running and `tot_cap` total tenants; all
/// other bits of `output` are cleared. Returns the surviving node count.
///
/// In TEST_ONLY mode only total generic resources are checked — current
/// allocations, memory, exclusivity, and tenant counts are ignored,
/// answering "could this ever fit" rather than "does it fit now".
pub fn count_bitmap(
    state: &CrState,
    cluster: &Cluster,
    cr_type: CrType,
    job: &JobRecord,
    input: &NodeMask,
    output: &mut NodeMask,
    run_cap: u32,
    tot_cap: u32,
    mode: SelectMode,
) -> usize {
    let use_total_gres = mode == SelectMode::TestOnly;
    let check_memory =
        mode != SelectMode::TestOnly && cr_type == CrType::Memory && !job.details.memory.is_none();

    output.clear_all();
    let mut count = 0;
    for i in input.iter() {
        let cpu_cnt = cluster.cpu_cnt(i);
        let usage = &state.nodes[i];

        let node_gres = usage.gres.as_ref().unwrap_or(&cluster.nodes[i].gres);
        let gres_cpus = gres::job_test(&job.details.gres, node_gres, use_total_gres, cpu_cnt);
        if gres_cpus != u32::MAX && gres_cpus < cpu_cnt {
            continue;
        }

        if mode == SelectMode::TestOnly {
            output.set(i);
            count += 1;
            continue;
        }

        if check_memory {
            let job_mem = job.details.memory.on_node(cpu_cnt);
            if usage.alloc_memory + job_mem > cluster.real_memory(i) {
                continue;
            }
        }

        if usage.exclusive_cnt != 0 {
            // Already reserved by some exclusive job.
            continue;
        }

        let mut total_run_jobs = 0;
        let mut total_jobs = 0;
        for part in &usage.parts {
            total_run_jobs += part.run_job_cnt;
            total_jobs += part.tot_job_cnt;
        }
        if total_run_jobs <= run_cap && total_jobs <= tot_cap {
            output.set(i);
            count += 1;
        }
    }
    count
}

/// A maximal run of consecutive candidate nodes, as collected by the
/// first sweep of [`job_test`].
#[derive(Debug, Clone, Default)]
struct ConsecRun {
    start: usize,
    end: usize,
    /// Candidate nodes still available in the run (required nodes are
    /// committed during the sweep and not counted here).
    node_cnt: i64,
    /// Available CPUs across those candidate nodes.
    cpu_cnt: i64,
    /// Index of the first required node inside the run, if any.
    req_inx: Option<usize>,
}

/// Select nodes for a job on a one-dimensional node index.
///
/// `bitmap` holds the usable candidates on input and is narrowed to the
/// chosen allocation on success. Delegates to the topology-aware
/// selector when a switch table is configured.
pub fn job_test(
    cluster: &Cluster,
    job: &mut JobRecord,
    bitmap: &mut NodeMask,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<(), SelectError> {
    if bitmap.weight() < min_nodes as usize {
        return Err(SelectError::NoFit);
    }
    if let Some(req_mask) = &job.details.req_node_mask {
        if !req_mask.is_subset(bitmap) {
            return Err(SelectError::NoFit);
        }
    }
    if let Some(exc_mask) = &job.details.exc_node_mask {
        for i in exc_mask.iter() {
            bitmap.clear(i);
        }
    }
    if cluster.has_topology() {
        return topo::job_test_topo(cluster, job, bitmap, min_nodes, max_nodes, req_nodes);
    }

    let contiguous = job.details.contiguous;
    let req_mask = job.details.req_node_mask.clone();
    let mut rem_cpus = job.details.min_cpus as i64;
    let mut rem_nodes = req_nodes.max(min_nodes) as i64;
    let mut max_nodes = max_nodes as i64;
    let mut total_cpus: u32 = 0;

    // First sweep: commit required nodes immediately and build the table
    // of consecutive candidate runs. Candidates are cleared from the
    // bitmap here and only re-set once chosen.
    let mut runs: Vec<ConsecRun> = Vec::new();
    let mut cur = ConsecRun::default();
    for index in 0..cluster.node_cnt() {
        if bitmap.test(index) {
            if cur.node_cnt == 0 {
                cur.start = index;
            }
            let avail_cpus = cluster.avail_cpus(&job.details, index) as i64;
            let required = max_nodes > 0
                && req_mask.as_ref().map(|m| m.test(index)).unwrap_or(false);
            if required {
                if cur.req_inx.is_none() {
                    cur.req_inx = Some(index);
                }
                rem_nodes -= 1;
                max_nodes -= 1;
                rem_cpus -= avail_cpus;
                total_cpus += cluster.total_cpus(index);
            } else {
                bitmap.clear(index);
                cur.cpu_cnt += avail_cpus;
                cur.node_cnt += 1;
            }
        } else if cur.node_cnt == 0 {
            // Reuse the open record; any required nodes seen so far were
            // committed and their run carries nothing selectable.
            cur.req_inx = None;
        } else {
            cur.end = index - 1;
            runs.push(std::mem::take(&mut cur));
        }
    }
    if cur.node_cnt != 0 {
        cur.end = cluster.node_cnt() - 1;
        runs.push(cur);
    }

    debug!(
        "job {}: rem_cpus={} rem_nodes={} over {} runs",
        job.id,
        rem_cpus,
        rem_nodes,
        runs.len()
    );

    // All required nodes must sit in a single run for a contiguous job.
    if contiguous
        && req_mask.is_some()
        && runs.iter().filter(|r| r.req_inx.is_some()).count() > 1
    {
        return Err(SelectError::NoFit);
    }

    // Accumulate nodes from the runs until the request is satisfied.
    let mut success = false;
    while max_nodes > 0 {
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        for (i, run) in runs.iter().enumerate() {
            if run.node_cnt == 0 {
                continue;
            }
            if contiguous && req_mask.is_some() && run.req_inx.is_none() {
                continue;
            }
            let sufficient = run.cpu_cnt >= rem_cpus
                && enough_nodes(run.node_cnt, rem_nodes, min_nodes, req_nodes);
            let pick = match best {
                None => true,
                Some(b) => {
                    let cur_best = &runs[b];
                    if run.req_inx.is_some() != cur_best.req_inx.is_some() {
                        run.req_inx.is_some()
                    } else if sufficient != best_sufficient {
                        sufficient
                    } else if sufficient {
                        run.cpu_cnt < cur_best.cpu_cnt
                    } else {
                        run.cpu_cnt > cur_best.cpu_cnt
                    }
                }
            };
            if pick {
                best = Some(i);
                best_sufficient = sufficient;
            }
        }
        let best = match best {
            Some(b) => b,
            None => break,
        };
        if contiguous
            && (runs[best].cpu_cnt < rem_cpus
                || !enough_nodes(runs[best].node_cnt, rem_nodes, min_nodes, req_nodes))
        {
            // No hole large enough for the whole request.
            break;
        }

        let run = runs[best].clone();
        let mut fill = |i: usize,
                        bitmap: &mut NodeMask,
                        rem_nodes: &mut i64,
                        rem_cpus: &mut i64,
                        max_nodes: &mut i64,
                        total_cpus: &mut u32|
         -> bool {
            if *max_nodes <= 0 || (*rem_nodes <= 0 && *rem_cpus <= 0) {
                return false;
            }
            if !bitmap.test(i) {
                bitmap.set(i);
                *rem_nodes -= 1;
                *max_nodes -= 1;
                *rem_cpus -= cluster.avail_cpus(&job.details, i) as i64;
                *total_cpus += cluster.total_cpus(i);
            }
            true
        };
        if let Some(req_inx) = run.req_inx {
            // Fill upward from the first required node, then downward
            // from just before it.
            for i in req_inx..=run.end {
                if !fill(i, bitmap, &mut rem_nodes, &mut rem_cpus, &mut max_nodes, &mut total_cpus)
                {
                    break;
                }
            }
            for i in (run.start..req_inx).rev() {
                if !fill(i, bitmap, &mut rem_nodes, &mut rem_cpus, &mut max_nodes, &mut total_cpus)
                {
                    break;
                }
            }
        } else {
            for i in run.start..=run.end {
                if !fill(i, bitmap, &mut rem_nodes, &mut rem_cpus, &mut max_nodes, &mut total_cpus)
                {
                    break;
                }
            }
        }

        if contiguous || (rem_nodes <= 0 && rem_cpus <= 0) {
            success = true;
            break;
        }
        runs[best].cpu_cnt = 0;
        runs[best].node_cnt = 0;
    }

    if !success && rem_cpus <= 0 && enough_nodes(0, rem_nodes, min_nodes, req_nodes) {
        success = true;
    }
    if success {
        // The job's CPU total is needed by the will-run path.
        job.total_cpus = total_cpus;
        Ok(())
    } else {
        Err(SelectError::NoFit)
    }
}

/// Try to co-locate a job with an already-running job of identical
/// shape, when sharing allows it. On a match the candidate mask is
/// narrowed to the mate's nodes and the job inherits its CPU total.
pub fn find_job_mate(
    job: &mut JobRecord,
    bitmap: &mut NodeMask,
    req_nodes: u32,
    jobs: &[JobRecord],
) -> Result<(), SelectError> {
    for mate in jobs {
        if !mate.is_running()
            || mate.node_cnt != req_nodes
            || mate.total_cpus < job.details.min_cpus
            || !mate.node_mask.is_subset(bitmap)
        {
            continue;
        }
        if mate.details.contiguous != job.details.contiguous {
            continue;
        }
        if let Some(req_mask) = &job.details.req_node_mask {
            if !req_mask.is_subset(&mate.node_mask) {
                continue;
            }
        }
        if let Some(exc_mask) = &job.details.exc_node_mask {
            if exc_mask.overlaps(&mate.node_mask) {
                continue;
            }
        }
        *bitmap &= &mate.node_mask;
        job.total_cpus = mate.total_cpus;
        return Ok(());
    }
    Err(SelectError::NoFit)
}
