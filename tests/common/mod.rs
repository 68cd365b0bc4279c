#![allow(dead_code)]

use std::sync::Arc;

use nodesel::{
    Cluster, CrState, JobId, JobRecord, JobResources, JobState, NodeMask, PreemptMode,
};

/// Initialize logging from `RUST_LOG`-style verbosity. Idempotent: the
/// first call in the process wins, later calls are ignored.
pub fn setup_test() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// A cluster of `n` identical nodes with `cpus` CPUs and `mem` MB each,
/// one partition spanning everything.
pub fn uniform_cluster(n: usize, cpus: u32, mem: u64) -> Cluster {
    Cluster::builder().nodes(n, cpus, mem).build().unwrap()
}

/// Same, but with the partition's share limit raised.
pub fn shared_cluster(n: usize, cpus: u32, mem: u64, max_share: u16) -> Cluster {
    Cluster::builder()
        .nodes(n, cpus, mem)
        .partition("batch", max_share, None)
        .build()
        .unwrap()
}

/// A pending job in the cluster's first partition.
pub fn pending_job(cluster: &Cluster, id: u32, min_cpus: u32) -> JobRecord {
    let mut job = JobRecord::new(
        JobId(id),
        Arc::clone(&cluster.partitions[0]),
        cluster.node_cnt(),
    );
    job.details.min_cpus = min_cpus;
    job
}

/// Turn a job into a running one holding the given nodes, with a full
/// resources layout, ending at `end_time`.
pub fn start_running(cluster: &Cluster, job: &mut JobRecord, nodes: &[usize], end_time: u64) {
    job.state = JobState::Running;
    job.end_time = end_time;
    job.node_mask = NodeMask::from_indices(cluster.node_cnt(), nodes);
    job.node_cnt = nodes.len() as u32;

    let mut res = JobResources::new(nodes.len(), cluster.node_cnt());
    res.node_mask = job.node_mask.clone();
    res.nodes = cluster.node_names(&job.node_mask);
    for (j, &i) in nodes.iter().enumerate() {
        res.cpus[j] = cluster.cpu_cnt(i);
        res.memory_allocated[j] = job.details.memory.on_node(cluster.cpu_cnt(i));
    }
    res.rebuild_cpu_array();
    res.ncpus = res.cpus.iter().sum();
    job.total_cpus = res.ncpus;
    job.resources = Some(res);
}

/// A running job holding `nodes`, preemptible by requeue.
pub fn running_job(cluster: &Cluster, id: u32, nodes: &[usize], end_time: u64) -> JobRecord {
    let mut job = pending_job(cluster, id, nodes.len() as u32);
    job.preempt_mode = PreemptMode::Requeue;
    start_running(cluster, &mut job, nodes, end_time);
    job
}

pub fn mask(cluster: &Cluster, nodes: &[usize]) -> NodeMask {
    NodeMask::from_indices(cluster.node_cnt(), nodes)
}

pub fn mask_indices(mask: &NodeMask) -> Vec<usize> {
    mask.iter().collect()
}

/// Compare two accounting snapshots field by field (partition entries by
/// name, since handles are identities).
pub fn assert_states_equal(a: &CrState, b: &CrState) {
    assert_eq!(a.nodes.len(), b.nodes.len(), "node count differs");
    for (i, (na, nb)) in a.nodes.iter().zip(b.nodes.iter()).enumerate() {
        assert_eq!(
            na.alloc_memory, nb.alloc_memory,
            "alloc_memory differs on node {i}"
        );
        assert_eq!(
            na.exclusive_cnt, nb.exclusive_cnt,
            "exclusive_cnt differs on node {i}"
        );
        assert_eq!(na.gres, nb.gres, "gres state differs on node {i}");
        assert_eq!(
            na.parts.len(),
            nb.parts.len(),
            "partition entry count differs on node {i}"
        );
        for (pa, pb) in na.parts.iter().zip(nb.parts.iter()) {
            assert_eq!(pa.part.name, pb.part.name, "partition order differs on node {i}");
            assert_eq!(
                pa.run_job_cnt, pb.run_job_cnt,
                "run_job_cnt differs for {} on node {i}",
                pa.part.name
            );
            assert_eq!(
                pa.tot_job_cnt, pb.tot_job_cnt,
                "tot_job_cnt differs for {} on node {i}",
                pa.part.name
            );
        }
    }
    let run_a: Vec<_> = a.run_job_ids.iter().collect();
    let run_b: Vec<_> = b.run_job_ids.iter().collect();
    assert_eq!(run_a, run_b, "running job ids differ");
    let tot_a: Vec<_> = a.tot_job_ids.iter().collect();
    let tot_b: Vec<_> = b.tot_job_ids.iter().collect();
    assert_eq!(tot_a, tot_b, "total job ids differ");
}
