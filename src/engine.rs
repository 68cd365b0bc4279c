//! Scheduling orchestrator and the engine's entry points.
//!
//! `LinearSelect` is the context value the surrounding workload manager
//! holds: the cluster tables, the consumable-resource type, and the
//! accounting snapshot behind a single mutex. The mutex is held for the
//! full duration of every entry point that touches the snapshot; there
//! is no finer-grained locking and no re-entry.
//!
//! The snapshot is created lazily from the caller's job table on first
//! use, dropped when the node table changes, and rebuilt on
//! reconfiguration. Hypothetical scheduling (preemption retry, will-run
//! simulation) always works on a clone that never escapes the call.

use std::sync::Mutex;
use std::sync::MutexGuard;

use log::error;

use crate::cluster::{AllocState, Cluster, JobRecord, NodeRecord, PowerState};
use crate::errors::SelectError;
use crate::lifecycle;
use crate::nodemask::NodeMask;
use crate::nodeinfo::{NodeInfo, NodeInfoData, NodeInfoKey};
use crate::select;
use crate::state::CrState;
use crate::topo;
use crate::types::{CrType, JobId, MemoryRequest, SelectMode, Timestamp, NO_SHARE_LIMIT, SHARED_FORCE};

struct Shared {
    state: Option<CrState>,
    nodeinfo: Vec<NodeInfo>,
    last_set_all: Timestamp,
}

/// The linear node-selection engine.
pub struct LinearSelect {
    cluster: Cluster,
    cr_type: CrType,
    shared: Mutex<Shared>,
}

impl LinearSelect {
    /// Build the engine around a cluster view. The consumable-resource
    /// type is read once here and fixed for the engine's lifetime.
    pub fn new(cluster: Cluster, cr_type: CrType) -> Self {
        let nodeinfo = vec![NodeInfo::new(); cluster.node_cnt()];
        LinearSelect {
            cluster,
            cr_type,
            shared: Mutex::new(Shared {
                state: None,
                nodeinfo,
                last_set_all: 0,
            }),
        }
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Replace the node table. The accounting snapshot is dropped here
    /// and rebuilt on the next use, once the caller's partition and job
    /// tables are consistent again.
    pub fn node_init(&mut self, nodes: Vec<NodeRecord>) -> Result<(), SelectError> {
        if nodes.is_empty() {
            error!("node_init: empty node table");
            return Err(SelectError::Invariant("empty node table"));
        }
        let shared = self.shared.get_mut().unwrap();
        shared.state = None;
        shared.nodeinfo = vec![NodeInfo::new(); nodes.len()];
        shared.last_set_all = 0;
        self.cluster.nodes = nodes;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap()
    }

    fn ensure_state<'a>(&self, shared: &'a mut Shared, jobs: &[JobRecord]) -> &'a mut CrState {
        if shared.state.is_none() {
            shared.state = Some(CrState::rebuild(&self.cluster, jobs, self.cr_type));
        }
        shared.state.as_mut().unwrap()
    }

    /// Identify the nodes that best satisfy a job request.
    ///
    /// `bitmap` holds the usable candidates on input and is narrowed to
    /// the chosen nodes on success. `jobs` is the table of other jobs
    /// (the job under test must not be in it); `preemptees` are the jobs
    /// the caller is willing to evict. The returned list holds the
    /// preemptees whose nodes the decision actually uses. For
    /// `WillRun`, `job.start_time` is set to when the job could begin.
    #[allow(clippy::too_many_arguments)]
    pub fn job_test(
        &self,
        job: &mut JobRecord,
        bitmap: &mut NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
        mode: SelectMode,
        now: Timestamp,
        jobs: &[JobRecord],
        preemptees: Option<&[JobId]>,
    ) -> Result<Vec<JobId>, SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);

        if bitmap.weight() < min_nodes as usize {
            return Err(SelectError::NoFit);
        }

        let max_share: u32 = if job.details.shared != 0 {
            (job.part.max_share & !SHARED_FORCE) as u32
        } else {
            1
        };

        match mode {
            SelectMode::WillRun => self.will_run_test(
                state, job, bitmap, min_nodes, max_nodes, max_share, req_nodes, now, jobs,
                preemptees,
            ),
            SelectMode::TestOnly => {
                self.test_only(state, job, bitmap, min_nodes, max_nodes, req_nodes)
                    .map(|_| Vec::new())
            }
            SelectMode::RunNow => self.run_now(
                state, job, bitmap, min_nodes, max_nodes, max_share, req_nodes, jobs, preemptees,
            ),
        }
    }

    /// Determine if a job could ever run: memory and current allocations
    /// are ignored.
    fn test_only(
        &self,
        state: &CrState,
        job: &mut JobRecord,
        bitmap: &mut NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        req_nodes: u32,
    ) -> Result<(), SelectError> {
        let orig_map = bitmap.clone();
        let cnt = select::count_bitmap(
            state,
            &self.cluster,
            self.cr_type,
            job,
            &orig_map,
            bitmap,
            NO_SHARE_LIMIT,
            NO_SHARE_LIMIT,
            SelectMode::TestOnly,
        );
        if cnt < min_nodes as usize {
            return Err(SelectError::NoFit);
        }
        let save_mem = job.details.memory;
        job.details.memory = MemoryRequest::None;
        let rc = select::job_test(&self.cluster, job, bitmap, min_nodes, max_nodes, req_nodes);
        job.details.memory = save_mem;
        rc
    }

    /// Allocate resources for a job now, if possible.
    #[allow(clippy::too_many_arguments)]
    fn run_now(
        &self,
        state: &CrState,
        job: &mut JobRecord,
        bitmap: &mut NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        max_share: u32,
        req_nodes: u32,
        jobs: &[JobRecord],
        preemptees: Option<&[JobId]>,
    ) -> Result<Vec<JobId>, SelectError> {
        let orig_map = bitmap.clone();
        let mut rc = Err(SelectError::NoFit);
        let mut prev_cnt: Option<usize> = None;

        // Sweep share levels from exclusive up to the partition's limit,
        // preferring the least-loaded placement that newly fits.
        'sweep: for max_run_job in 0..max_share {
            let last_iteration = max_run_job + 1 == max_share;
            let sus_levels: &[u32] = if last_iteration { &[NO_SHARE_LIMIT] } else { &[0, 4] };
            for &sus_jobs in sus_levels {
                let cnt = select::count_bitmap(
                    state,
                    &self.cluster,
                    self.cr_type,
                    job,
                    &orig_map,
                    bitmap,
                    max_run_job,
                    max_run_job.saturating_add(sus_jobs),
                    SelectMode::RunNow,
                );
                if prev_cnt == Some(cnt) || cnt < min_nodes as usize {
                    continue;
                }
                prev_cnt = Some(cnt);
                if max_run_job > 0
                    && select::find_job_mate(job, bitmap, req_nodes, jobs).is_ok()
                {
                    // Sharing: ride along with a matching running job.
                    rc = Ok(());
                    break 'sweep;
                }
                rc = select::job_test(&self.cluster, job, bitmap, min_nodes, max_nodes, req_nodes);
                if rc.is_ok() {
                    break 'sweep;
                }
            }
        }

        let mut victims = Vec::new();
        if rc.is_err() {
            if let Some(cands) = preemptees.filter(|c| !c.is_empty()) {
                // Retry on a scratch copy, evicting preemptible tenants
                // one at a time until the job fits.
                let mut exp_state = state.clone();
                for tmp_job in jobs {
                    if !tmp_job.is_active() || !cands.contains(&tmp_job.id) {
                        continue;
                    }
                    let mut scratch = tmp_job.clone();
                    let _ = lifecycle::remove_job(
                        &mut exp_state,
                        &self.cluster,
                        self.cr_type,
                        &mut scratch,
                        tmp_job.preempt_mode.removes_all(),
                        "run_now",
                    );
                    let cnt = select::count_bitmap(
                        &exp_state,
                        &self.cluster,
                        self.cr_type,
                        job,
                        &orig_map,
                        bitmap,
                        max_share.saturating_sub(1),
                        NO_SHARE_LIMIT,
                        SelectMode::RunNow,
                    );
                    if cnt < min_nodes as usize {
                        continue;
                    }
                    rc = select::job_test(
                        &self.cluster,
                        job,
                        bitmap,
                        min_nodes,
                        max_nodes,
                        req_nodes,
                    );
                    if rc.is_ok() {
                        break;
                    }
                }
                if rc.is_ok() {
                    victims = overlap_victims(cands, jobs, bitmap);
                }
            }
        }

        rc.map(|_| {
            lifecycle::build_resources(&self.cluster, self.cr_type, job, bitmap);
            victims
        })
    }

    /// Determine where and when a job can begin by simulating running
    /// jobs terminating at the end of their time limits.
    #[allow(clippy::too_many_arguments)]
    fn will_run_test(
        &self,
        state: &CrState,
        job: &mut JobRecord,
        bitmap: &mut NodeMask,
        min_nodes: u32,
        max_nodes: u32,
        max_share: u32,
        req_nodes: u32,
        now: Timestamp,
        jobs: &[JobRecord],
        preemptees: Option<&[JobId]>,
    ) -> Result<Vec<JobId>, SelectError> {
        // This job is excluded from the share count.
        let max_run_jobs = max_share.saturating_sub(1).max(1);
        let orig_map = bitmap.clone();

        // Try with the nodes available right now.
        let cnt = select::count_bitmap(
            state,
            &self.cluster,
            self.cr_type,
            job,
            &orig_map,
            bitmap,
            max_run_jobs,
            NO_SHARE_LIMIT,
            SelectMode::WillRun,
        );
        if cnt >= min_nodes as usize
            && select::job_test(&self.cluster, job, bitmap, min_nodes, max_nodes, req_nodes)
                .is_ok()
        {
            job.start_time = now;
            return Ok(Vec::new());
        }

        // Still pending: simulate terminations on a scratch copy.
        let mut exp_state = state.clone();
        let mut sim_jobs: Vec<&JobRecord> = Vec::new();
        for tmp_job in jobs {
            if !tmp_job.is_active() {
                continue;
            }
            if tmp_job.end_time == 0 {
                error!("job {} has zero end_time", tmp_job.id);
                continue;
            }
            if preemptees.map(|c| c.contains(&tmp_job.id)).unwrap_or(false) {
                // Preemptible tenants leave immediately.
                let mut scratch = tmp_job.clone();
                let _ = lifecycle::remove_job(
                    &mut exp_state,
                    &self.cluster,
                    self.cr_type,
                    &mut scratch,
                    tmp_job.preempt_mode.removes_all(),
                    "will_run_test",
                );
            } else {
                sim_jobs.push(tmp_job);
            }
        }

        let mut rc = Err(SelectError::NoFit);
        if preemptees.is_some() {
            // Test with every preemptible job gone.
            let cnt = select::count_bitmap(
                &exp_state,
                &self.cluster,
                self.cr_type,
                job,
                &orig_map,
                bitmap,
                max_run_jobs,
                NO_SHARE_LIMIT,
                SelectMode::RunNow,
            );
            if cnt >= min_nodes as usize {
                rc = select::job_test(&self.cluster, job, bitmap, min_nodes, max_nodes, req_nodes);
                if rc.is_ok() {
                    job.start_time = now + 1;
                }
            }
        }

        if rc.is_err() {
            // Remove the remaining jobs one at a time in end-time order,
            // rescheduling the pending job after each.
            sim_jobs.sort_by_key(|j| j.end_time);
            for tmp_job in sim_jobs {
                let mut scratch = tmp_job.clone();
                let _ = lifecycle::remove_job(
                    &mut exp_state,
                    &self.cluster,
                    self.cr_type,
                    &mut scratch,
                    true,
                    "will_run_test",
                );
                let cnt = select::count_bitmap(
                    &exp_state,
                    &self.cluster,
                    self.cr_type,
                    job,
                    &orig_map,
                    bitmap,
                    max_run_jobs,
                    NO_SHARE_LIMIT,
                    SelectMode::RunNow,
                );
                if cnt < min_nodes as usize {
                    continue;
                }
                rc = select::job_test(&self.cluster, job, bitmap, min_nodes, max_nodes, req_nodes);
                if rc.is_err() {
                    continue;
                }
                job.start_time = if tmp_job.end_time <= now {
                    now + 1
                } else {
                    tmp_job.end_time
                };
                break;
            }
        }

        match (&rc, preemptees) {
            (Ok(()), Some(cands)) => Ok(overlap_victims(cands, jobs, bitmap)),
            (Ok(()), None) => Ok(Vec::new()),
            (Err(_), _) => Err(SelectError::NoFit),
        }
    }

    /// Claim a beginning job's resources.
    pub fn job_begin(&self, job: &mut JobRecord, jobs: &[JobRecord]) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::add_job(state, &self.cluster, self.cr_type, job, true, "job_begin")
    }

    /// Whether every allocated node of a job is powered and usable.
    pub fn job_ready(&self, job: &JobRecord) -> bool {
        if !job.is_active() {
            // Gang scheduling might suspend the job immediately.
            return false;
        }
        for i in job.node_mask.iter() {
            match self.cluster.nodes[i].power {
                PowerState::Saving | PowerState::PoweringUp => return false,
                PowerState::Up => {}
            }
        }
        true
    }

    /// Release everything a finished job held.
    pub fn job_fini(&self, job: &mut JobRecord, jobs: &[JobRecord]) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::remove_job(state, &self.cluster, self.cr_type, job, true, "job_fini")
    }

    /// Release a suspended job's run-side claims; memory and exclusivity
    /// stay held.
    pub fn job_suspend(&self, job: &mut JobRecord, jobs: &[JobRecord]) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::remove_job(state, &self.cluster, self.cr_type, job, false, "job_suspend")
    }

    /// Re-claim the run-side of a resumed job.
    pub fn job_resume(&self, job: &mut JobRecord, jobs: &[JobRecord]) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::add_job(state, &self.cluster, self.cr_type, job, false, "job_resume")
    }

    /// Move all resources from one job to another.
    pub fn job_expand(
        &self,
        from_job: &mut JobRecord,
        to_job: &mut JobRecord,
        jobs: &[JobRecord],
    ) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::expand(state, &self.cluster, self.cr_type, from_job, to_job)
    }

    /// Release one lost node from a running job's allocation.
    pub fn job_resized(
        &self,
        job: &mut JobRecord,
        node_inx: usize,
        jobs: &[JobRecord],
    ) -> Result<(), SelectError> {
        let mut shared = self.lock();
        let state = self.ensure_state(&mut shared, jobs);
        lifecycle::remove_one_node(
            state,
            &self.cluster,
            self.cr_type,
            job,
            node_inx,
            "job_resized",
        )
    }

    /// A deep copy of the current accounting snapshot, for inspection.
    /// Builds the snapshot from `jobs` first when absent.
    pub fn state_snapshot(&self, jobs: &[JobRecord]) -> CrState {
        let mut shared = self.lock();
        self.ensure_state(&mut shared, jobs).clone()
    }

    /// Drop and immediately rebuild the accounting snapshot.
    pub fn reconfigure(&self, jobs: &[JobRecord]) {
        let mut shared = self.lock();
        shared.state = Some(CrState::rebuild(&self.cluster, jobs, self.cr_type));
    }

    /// Pick nodes for an advance reservation; None on shortfall.
    pub fn resv_test(&self, avail: &NodeMask, node_cnt: u32) -> Option<NodeMask> {
        topo::resv_select(&self.cluster, avail, node_cnt)
    }

    /// Publish the per-node allocated-CPU snapshot. Skipped (returning
    /// false) when the node table has not changed since the last
    /// publication.
    pub fn nodeinfo_set_all(&self) -> bool {
        let mut shared = self.lock();
        if shared.last_set_all != 0 && self.cluster.last_node_update < shared.last_set_all {
            return false;
        }
        shared.last_set_all = self.cluster.last_node_update;
        for (i, node) in self.cluster.nodes.iter().enumerate() {
            shared.nodeinfo[i].alloc_cpus = match node.alloc_state {
                AllocState::Allocated | AllocState::Completing => self.cluster.cpu_cnt(i) as u16,
                AllocState::Idle => 0,
            };
        }
        true
    }

    /// Read back one node's published info under a key.
    pub fn nodeinfo_get(
        &self,
        node_inx: usize,
        key: NodeInfoKey,
        alloc_state: AllocState,
    ) -> NodeInfoData {
        let shared = self.lock();
        shared.nodeinfo[node_inx].get(key, alloc_state)
    }
}

/// The preemption candidates whose allocated nodes the chosen bitmap
/// actually touches, in candidate order.
fn overlap_victims(cands: &[JobId], jobs: &[JobRecord], bitmap: &NodeMask) -> Vec<JobId> {
    let mut victims = Vec::new();
    for id in cands {
        if let Some(job) = jobs.iter().find(|j| j.id == *id) {
            if bitmap.overlaps(&job.node_mask) {
                victims.push(*id);
            }
        }
    }
    victims
}
