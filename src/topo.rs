//! Topology-aware selection over the switch tree.
//!
//! Like the linear selector, but fragmentation is measured in switch
//! subtrees: the job is confined to the lowest-level (and then smallest)
//! subtree that can satisfy it, and leaves under that subtree are then
//! filled on the same best-fit scoring as the linear path. Reservations
//! use a node-count-only variant of the same walk.

use log::{debug, info};

use crate::cluster::{Cluster, JobRecord};
use crate::errors::SelectError;
use crate::nodemask::NodeMask;
use crate::select::enough_nodes;

/// Working set for one switch during a selection pass.
#[derive(Debug, Clone)]
struct SwitchWork {
    /// Switch nodes still usable for this pass.
    mask: NodeMask,
    node_cnt: i64,
    cpu_cnt: i64,
    /// Whether the subtree holds any of the job's required nodes.
    required: bool,
}

fn build_switch_work(cluster: &Cluster, avail: &NodeMask, req_mask: Option<&NodeMask>) -> Vec<SwitchWork> {
    cluster
        .switches
        .iter()
        .map(|sw| {
            let mask = sw.node_mask.and(avail);
            let node_cnt = mask.weight() as i64;
            let required = req_mask.map(|req| req.overlaps(&mask)).unwrap_or(false);
            SwitchWork {
                mask,
                node_cnt,
                cpu_cnt: 0,
                required,
            }
        })
        .collect()
}

/// Topology-aware node selection for a job. Semantics match
/// [`crate::select::job_test`], with span minimized over switch subtrees
/// instead of consecutive index runs.
pub fn job_test_topo(
    cluster: &Cluster,
    job: &mut JobRecord,
    bitmap: &mut NodeMask,
    min_nodes: u32,
    max_nodes: u32,
    req_nodes: u32,
) -> Result<(), SelectError> {
    let req_mask = job.details.req_node_mask.clone();
    let mut rem_cpus = job.details.min_cpus as i64;
    let mut rem_nodes = req_nodes.max(min_nodes) as i64;
    let mut max_nodes = max_nodes as i64;
    let mut total_cpus: u32 = 0;

    if let Some(req) = &req_mask {
        let req_cnt = req.weight();
        if req_cnt > max_nodes as usize {
            info!(
                "job {} requires more nodes than currently available ({}>{})",
                job.id, req_cnt, max_nodes
            );
            return Err(SelectError::NoFit);
        }
    }

    let mut switches = build_switch_work(cluster, bitmap, req_mask.as_ref());
    let mut avail = NodeMask::new(cluster.node_cnt());
    for sw in &switches {
        avail |= &sw.mask;
    }
    bitmap.clear_all();

    for (j, sw) in switches.iter().enumerate() {
        debug!(
            "switch={} nodes={} required:{} speed={}",
            cluster.switches[j].name,
            sw.node_cnt,
            sw.required,
            cluster.switches[j].link_speed
        );
    }

    if let Some(req) = &req_mask {
        if !req.is_subset(&avail) {
            info!("job {} requires nodes not available on any switch", job.id);
            return Err(SelectError::NoFit);
        }

        // Commit the required nodes first.
        for i in req.iter() {
            if max_nodes <= 0 {
                info!("job {} requires more nodes than allowed", job.id);
                return Err(SelectError::NoFit);
            }
            bitmap.set(i);
            avail.clear(i);
            rem_nodes -= 1;
            max_nodes -= 1;
            rem_cpus -= cluster.avail_cpus(&job.details, i) as i64;
            total_cpus += cluster.total_cpus(i);
            for sw in switches.iter_mut() {
                if sw.mask.test(i) {
                    sw.mask.clear(i);
                    sw.node_cnt -= 1;
                }
            }
        }
        if rem_nodes <= 0 && rem_cpus <= 0 {
            job.total_cpus = total_cpus;
            return Ok(());
        }

        // Grab additional nodes from the leaves that already hold
        // required ones.
        for (j, sw) in switches.iter_mut().enumerate() {
            if cluster.switches[j].level != 0 || sw.node_cnt == 0 || !sw.required {
                continue;
            }
            while max_nodes > 0 && (rem_nodes > 0 || rem_cpus > 0) {
                let i = match sw.mask.first_set() {
                    Some(i) => i,
                    None => break,
                };
                sw.mask.clear(i);
                sw.node_cnt -= 1;
                if bitmap.test(i) {
                    // Node on multiple leaf switches and already selected.
                    continue;
                }
                bitmap.set(i);
                avail.clear(i);
                rem_nodes -= 1;
                max_nodes -= 1;
                rem_cpus -= cluster.avail_cpus(&job.details, i) as i64;
                total_cpus += cluster.total_cpus(i);
            }
        }
        if rem_nodes <= 0 && rem_cpus <= 0 {
            job.total_cpus = total_cpus;
            return Ok(());
        }

        // Drop nodes taken at lower levels from the higher switches and
        // compute the CPU totals of what is left.
        for sw in switches.iter_mut() {
            if sw.node_cnt == 0 {
                continue;
            }
            for i in sw.mask.clone().iter() {
                if !avail.test(i) {
                    sw.mask.clear(i);
                    sw.node_cnt -= 1;
                } else {
                    sw.cpu_cnt += cluster.avail_cpus(&job.details, i) as i64;
                }
            }
        }
    } else {
        for sw in switches.iter_mut() {
            for i in sw.mask.iter() {
                sw.cpu_cnt += cluster.avail_cpus(&job.details, i) as i64;
            }
        }
    }

    // The lowest-level switch satisfying the request, ties broken by
    // smallest subtree.
    let mut best_fit_inx: Option<usize> = None;
    for (j, sw) in switches.iter().enumerate() {
        if sw.cpu_cnt < rem_cpus || !enough_nodes(sw.node_cnt, rem_nodes, min_nodes, req_nodes) {
            continue;
        }
        let better = match best_fit_inx {
            None => true,
            Some(b) => {
                cluster.switches[j].level < cluster.switches[b].level
                    || (cluster.switches[j].level == cluster.switches[b].level
                        && sw.node_cnt < switches[b].node_cnt)
            }
        };
        if better {
            best_fit_inx = Some(j);
        }
    }
    let best_fit_inx = match best_fit_inx {
        Some(b) => b,
        None => {
            debug!("job_test_topo: could not find resources for job {}", job.id);
            return Err(SelectError::NoFit);
        }
    };

    // Only leaves under the chosen subtree stay usable.
    let chosen_mask = switches[best_fit_inx].mask.clone();
    for (j, sw) in switches.iter_mut().enumerate() {
        if cluster.switches[j].level != 0 || !sw.mask.is_subset(&chosen_mask) {
            sw.node_cnt = 0;
        }
    }

    // Pull nodes from those leaves on a best-fit basis.
    while max_nodes > 0 && (rem_nodes > 0 || rem_cpus > 0) {
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        for (j, sw) in switches.iter().enumerate() {
            if sw.node_cnt == 0 {
                continue;
            }
            let sufficient = sw.cpu_cnt >= rem_cpus
                && enough_nodes(sw.node_cnt, rem_nodes, min_nodes, req_nodes);
            let pick = match best {
                None => true,
                Some(b) => {
                    if sufficient != best_sufficient {
                        sufficient
                    } else if sufficient {
                        sw.cpu_cnt < switches[b].cpu_cnt
                    } else {
                        sw.cpu_cnt > switches[b].cpu_cnt
                    }
                }
            };
            if pick {
                best = Some(j);
                best_sufficient = sufficient;
            }
        }
        let best = match best {
            Some(b) => b,
            None => break,
        };

        let leaf = &mut switches[best];
        for i in leaf.mask.clone().iter() {
            leaf.mask.clear(i);
            leaf.node_cnt -= 1;
            let avail_cpus = cluster.avail_cpus(&job.details, i) as i64;
            leaf.cpu_cnt -= avail_cpus;
            if bitmap.test(i) {
                continue;
            }
            bitmap.set(i);
            rem_nodes -= 1;
            max_nodes -= 1;
            rem_cpus -= avail_cpus;
            total_cpus += cluster.total_cpus(i);
            if max_nodes <= 0 || (rem_nodes <= 0 && rem_cpus <= 0) {
                break;
            }
        }
        switches[best].node_cnt = 0;
    }

    if rem_cpus <= 0 && enough_nodes(0, rem_nodes, min_nodes, req_nodes) {
        job.total_cpus = total_cpus;
        Ok(())
    } else {
        Err(SelectError::NoFit)
    }
}

/// Pick nodes for an advance reservation: node count only, confined to
/// the smallest satisfying switch subtree. Returns None on shortfall.
/// Without a switch table this degrades to taking the first `node_cnt`
/// available nodes.
pub fn resv_select(cluster: &Cluster, avail: &NodeMask, node_cnt: u32) -> Option<NodeMask> {
    if !cluster.has_topology() {
        return avail.pick_cnt(node_cnt as usize);
    }
    if avail.weight() < node_cnt as usize {
        return None;
    }
    let mut rem_nodes = node_cnt as i64;

    let mut switches = build_switch_work(cluster, avail, None);

    let mut best_fit_inx: Option<usize> = None;
    for (j, sw) in switches.iter().enumerate() {
        if sw.node_cnt < rem_nodes {
            continue;
        }
        let better = match best_fit_inx {
            None => true,
            Some(b) => {
                cluster.switches[j].level < cluster.switches[b].level
                    || (cluster.switches[j].level == cluster.switches[b].level
                        && sw.node_cnt < switches[b].node_cnt)
            }
        };
        if better {
            best_fit_inx = Some(j);
        }
    }
    let best_fit_inx = match best_fit_inx {
        Some(b) => b,
        None => {
            debug!("resv_select: could not find resources for reservation");
            return None;
        }
    };

    let chosen_mask = switches[best_fit_inx].mask.clone();
    for (j, sw) in switches.iter_mut().enumerate() {
        if cluster.switches[j].level != 0 || !sw.mask.is_subset(&chosen_mask) {
            sw.node_cnt = 0;
        }
    }

    let mut picked = NodeMask::new(cluster.node_cnt());
    while rem_nodes > 0 {
        let mut best: Option<usize> = None;
        let mut best_sufficient = false;
        for (j, sw) in switches.iter().enumerate() {
            if sw.node_cnt == 0 {
                continue;
            }
            let sufficient = sw.node_cnt >= rem_nodes;
            let pick = match best {
                None => true,
                Some(b) => {
                    if sufficient != best_sufficient {
                        sufficient
                    } else if sufficient {
                        sw.node_cnt < switches[b].node_cnt
                    } else {
                        sw.node_cnt > switches[b].node_cnt
                    }
                }
            };
            if pick {
                best = Some(j);
                best_sufficient = sufficient;
            }
        }
        let best = match best {
            Some(b) => b,
            None => break,
        };

        let leaf = &mut switches[best];
        for i in leaf.mask.clone().iter() {
            leaf.mask.clear(i);
            leaf.node_cnt -= 1;
            if picked.test(i) {
                continue;
            }
            picked.set(i);
            rem_nodes -= 1;
            if rem_nodes <= 0 {
                break;
            }
        }
        switches[best].node_cnt = 0;
    }

    if rem_nodes > 0 {
        None
    } else {
        Some(picked)
    }
}
