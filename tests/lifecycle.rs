//! Lifecycle bookkeeping: the begin/fini and suspend/resume identities,
//! expansion, single-node release, and drift clamping.

use nodesel::{CrType, JobId, JobState, LinearSelect, MemoryRequest, NodeMask, SelectError, SelectMode};

mod common;

/// Allocate a job through RUN_NOW and mark it running, the way the
/// surrounding scheduler would.
fn allocate(
    engine: &LinearSelect,
    job: &mut nodesel::JobRecord,
    min: u32,
    max: u32,
    req: u32,
) {
    let mut bitmap = NodeMask::all(engine.cluster().node_cnt());
    engine
        .job_test(job, &mut bitmap, min, max, req, SelectMode::RunNow, 0, &[], None)
        .unwrap();
    job.node_mask = bitmap;
    job.node_cnt = job.node_mask.weight() as u32;
    job.state = JobState::Running;
}

/// begin followed by fini leaves the accounting exactly as it started.
#[test]
fn test_begin_fini_identity() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut job = common::pending_job(&cluster, 7, 8);
    job.details.memory = MemoryRequest::PerNode(512);
    let engine = LinearSelect::new(cluster, CrType::Memory);

    let baseline = engine.state_snapshot(&[]);
    allocate(&engine, &mut job, 2, 4, 2);

    engine.job_begin(&mut job, &[]).unwrap();
    let held = engine.state_snapshot(&[]);
    assert_eq!(held.nodes[0].alloc_memory, 512);
    assert_eq!(held.nodes[0].exclusive_cnt, 1);
    assert!(held.run_job_ids.contains(JobId(7)));

    engine.job_fini(&mut job, &[]).unwrap();
    common::assert_states_equal(&baseline, &engine.state_snapshot(&[]));
}

/// Suspend releases only the running-side claims; resume restores them.
#[test]
fn test_suspend_resume_identity() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut job = common::pending_job(&cluster, 9, 8);
    job.details.memory = MemoryRequest::PerNode(256);
    let engine = LinearSelect::new(cluster, CrType::Memory);

    allocate(&engine, &mut job, 2, 4, 2);
    engine.job_begin(&mut job, &[]).unwrap();
    let running = engine.state_snapshot(&[]);

    engine.job_suspend(&mut job, &[]).unwrap();
    job.state = JobState::Suspended;
    let suspended = engine.state_snapshot(&[]);
    // The suspended job keeps memory, exclusivity, and its total-count
    // claims.
    assert!(!suspended.run_job_ids.contains(JobId(9)));
    assert!(suspended.tot_job_ids.contains(JobId(9)));
    assert_eq!(suspended.nodes[0].alloc_memory, 256);
    assert_eq!(suspended.nodes[0].exclusive_cnt, 1);
    assert_eq!(suspended.nodes[0].parts[0].run_job_cnt, 0);
    assert_eq!(suspended.nodes[0].parts[0].tot_job_cnt, 1);

    engine.job_resume(&mut job, &[]).unwrap();
    job.state = JobState::Running;
    common::assert_states_equal(&running, &engine.state_snapshot(&[]));
}

/// A full begin/suspend/resume/fini cycle is indistinguishable from a
/// fresh rebuild with no jobs at all.
#[test]
fn test_full_cycle_balances() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut job = common::pending_job(&cluster, 11, 4);
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let baseline = engine.state_snapshot(&[]);
    allocate(&engine, &mut job, 1, 4, 1);
    engine.job_begin(&mut job, &[]).unwrap();
    engine.job_suspend(&mut job, &[]).unwrap();
    engine.job_resume(&mut job, &[]).unwrap();
    engine.job_fini(&mut job, &[]).unwrap();
    common::assert_states_equal(&baseline, &engine.state_snapshot(&[]));

    // Run and total residency stay consistent throughout: finishing
    // again reports the drift instead of corrupting anything.
    assert_eq!(
        engine.job_fini(&mut job, &[]),
        Err(SelectError::NoAllocation(JobId(11)))
    );
}

/// Expansion moves everything to the receiving job and leaves the donor
/// with nothing.
#[test]
fn test_expand_moves_all_resources() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut donor = common::pending_job(&cluster, 1, 8);
    donor.details.memory = MemoryRequest::PerNode(100);
    common::start_running(&cluster, &mut donor, &[0, 1], 1000);
    let mut recipient = common::pending_job(&cluster, 2, 8);
    recipient.details.memory = MemoryRequest::PerNode(100);
    common::start_running(&cluster, &mut recipient, &[2, 3], 1000);
    let jobs = vec![donor.clone(), recipient.clone()];
    let engine = LinearSelect::new(cluster, CrType::Memory);

    engine.job_expand(&mut donor, &mut recipient, &jobs).unwrap();

    assert_eq!(donor.node_mask.weight(), 0);
    assert_eq!(donor.node_cnt, 0);
    assert_eq!(donor.total_cpus, 0);
    assert_eq!(donor.resources.as_ref().unwrap().ncpus, 0);

    assert_eq!(common::mask_indices(&recipient.node_mask), vec![0, 1, 2, 3]);
    assert_eq!(recipient.node_cnt, 4);
    assert_eq!(recipient.total_cpus, 16);
    let res = recipient.resources.as_ref().unwrap();
    assert_eq!(res.cpus, vec![4, 4, 4, 4]);
    assert_eq!(res.memory_allocated, vec![100, 100, 100, 100]);
    assert_eq!(res.nodes, "n0,n1,n2,n3");
}

/// Jobs holding generic resources refuse to merge.
#[test]
fn test_expand_refuses_gres() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut donor = common::pending_job(&cluster, 1, 4);
    donor.details.gres = nodesel::GresRequest::new(&[("gpu", 1)]);
    common::start_running(&cluster, &mut donor, &[0], 1000);
    let mut recipient = common::pending_job(&cluster, 2, 4);
    common::start_running(&cluster, &mut recipient, &[1], 1000);
    let jobs = vec![donor.clone(), recipient.clone()];
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    assert_eq!(
        engine.job_expand(&mut donor, &mut recipient, &jobs),
        Err(SelectError::ExpandGres)
    );
}

/// Losing one node releases exactly that node's claims; a second
/// release of the same node is reported as drift.
#[test]
fn test_resized_releases_one_node() {
    common::setup_test();
    let cluster = common::uniform_cluster(4, 4, 1024);
    let mut job = common::pending_job(&cluster, 5, 12);
    job.details.memory = MemoryRequest::PerNode(200);
    common::start_running(&cluster, &mut job, &[0, 1, 2], 1000);
    let jobs = vec![job.clone()];
    let engine = LinearSelect::new(cluster, CrType::Memory);

    engine.job_resized(&mut job, 1, &jobs).unwrap();

    let state = engine.state_snapshot(&[]);
    assert_eq!(state.nodes[1].alloc_memory, 0);
    assert_eq!(state.nodes[1].exclusive_cnt, 0);
    assert_eq!(state.nodes[1].parts[0].run_job_cnt, 0);
    assert_eq!(state.nodes[1].parts[0].tot_job_cnt, 0);
    // Node 0 is untouched.
    assert_eq!(state.nodes[0].alloc_memory, 200);
    let res = job.resources.as_ref().unwrap();
    assert_eq!(res.cpus, vec![4, 0, 4]);

    assert!(matches!(
        engine.job_resized(&mut job, 1, &jobs),
        Err(SelectError::Invariant(_))
    ));
}

/// Releasing more than was claimed clamps to zero and reports drift
/// instead of corrupting the counters.
#[test]
fn test_underflow_clamps_and_reports() {
    common::setup_test();
    let cluster = common::uniform_cluster(2, 4, 1024);
    let mut job = common::pending_job(&cluster, 3, 4);
    common::start_running(&cluster, &mut job, &[0], 1000);
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    // Build the state with the job resident, then finish it twice.
    engine.reconfigure(&[job.clone()]);
    engine.job_fini(&mut job, &[]).unwrap();
    assert_eq!(
        engine.job_fini(&mut job, &[]),
        Err(SelectError::NoAllocation(JobId(3)))
    );

    // The state is still usable: the job can be re-admitted.
    engine.job_begin(&mut job, &[]).unwrap();
    let state = engine.state_snapshot(&[]);
    assert_eq!(state.nodes[0].parts[0].tot_job_cnt, 1);
}

/// The node-table swap drops the snapshot; the next call rebuilds from
/// the live job set.
#[test]
fn test_node_init_drops_state() {
    common::setup_test();
    let cluster = common::uniform_cluster(2, 4, 1024);
    let mut job = common::pending_job(&cluster, 3, 4);
    common::start_running(&cluster, &mut job, &[0], 1000);
    let mut engine = LinearSelect::new(cluster, CrType::Cpu);

    engine.reconfigure(&[job.clone()]);
    assert!(engine.state_snapshot(&[]).tot_job_ids.contains(JobId(3)));

    let nodes = vec![
        nodesel::NodeRecord::new("n0", 4, 1024),
        nodesel::NodeRecord::new("n1", 4, 1024),
        nodesel::NodeRecord::new("n2", 4, 1024),
    ];
    engine.node_init(nodes).unwrap();
    // Rebuilt lazily from an empty job table: nothing resident.
    let state = engine.state_snapshot(&[]);
    assert_eq!(state.nodes.len(), 3);
    assert!(!state.tot_job_ids.contains(JobId(3)));
}
