//! Switch-topology-aware selection and reservations.

use nodesel::{Cluster, CrType, LinearSelect, NodeMask, SelectError, SelectMode};

mod common;

/// Two four-node leaves under one spine.
fn fat_tree() -> Cluster {
    Cluster::builder()
        .nodes(8, 4, 1024)
        .switch("leaf0", 0, &[0, 1, 2, 3], 100)
        .switch("leaf1", 0, &[4, 5, 6, 7], 100)
        .switch("spine", 1, &[0, 1, 2, 3, 4, 5, 6, 7], 400)
        .build()
        .unwrap()
}

/// A job fitting inside one leaf is confined to the first such leaf.
#[test]
fn test_single_leaf_fit() {
    common::setup_test();
    let cluster = fat_tree();
    let mut job = common::pending_job(&cluster, 100, 16);
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let mut bitmap = NodeMask::all(8);
    engine
        .job_test(&mut job, &mut bitmap, 4, 8, 4, SelectMode::RunNow, 0, &[], None)
        .unwrap();
    assert_eq!(common::mask_indices(&bitmap), vec![0, 1, 2, 3]);
    assert_eq!(job.total_cpus, 16);
}

/// A job too big for any leaf selects the spine and spills across
/// leaves in best-fit order.
#[test]
fn test_spans_leaves_through_spine() {
    common::setup_test();
    let cluster = fat_tree();
    let mut job = common::pending_job(&cluster, 100, 20);
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let mut bitmap = NodeMask::all(8);
    engine
        .job_test(&mut job, &mut bitmap, 5, 8, 5, SelectMode::RunNow, 0, &[], None)
        .unwrap();
    assert_eq!(common::mask_indices(&bitmap), vec![0, 1, 2, 3, 4]);
}

/// Required nodes are committed first and their leaf is drained before
/// any other.
#[test]
fn test_required_node_pulls_its_leaf() {
    common::setup_test();
    let cluster = fat_tree();
    let mut job = common::pending_job(&cluster, 100, 12);
    job.details.req_node_mask = Some(common::mask(&cluster, &[5]));
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let mut bitmap = NodeMask::all(8);
    engine
        .job_test(&mut job, &mut bitmap, 3, 8, 3, SelectMode::RunNow, 0, &[], None)
        .unwrap();
    assert!(bitmap.test(5));
    // The rest comes from leaf1, the required node's leaf.
    assert_eq!(common::mask_indices(&bitmap), vec![4, 5, 6]);
}

/// A required node outside every switch cannot be satisfied.
#[test]
fn test_required_node_off_switch_fails() {
    common::setup_test();
    // Node 8 hangs off no switch at all.
    let cluster = Cluster::builder()
        .nodes(9, 4, 1024)
        .switch("leaf0", 0, &[0, 1, 2, 3], 100)
        .switch("leaf1", 0, &[4, 5, 6, 7], 100)
        .build()
        .unwrap();
    let mut job = common::pending_job(&cluster, 100, 8);
    job.details.req_node_mask = Some(common::mask(&cluster, &[8]));
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let mut bitmap = NodeMask::all(9);
    let err = engine
        .job_test(&mut job, &mut bitmap, 2, 9, 2, SelectMode::RunNow, 0, &[], None)
        .unwrap_err();
    assert_eq!(err, SelectError::NoFit);
}

/// Reservations inside one leaf take the smallest satisfying leaf.
#[test]
fn test_resv_leaf_best_fit() {
    common::setup_test();
    let engine = LinearSelect::new(fat_tree(), CrType::Cpu);

    let picked = engine.resv_test(&NodeMask::all(8), 3).unwrap();
    assert_eq!(common::mask_indices(&picked), vec![0, 1, 2]);
}

/// Reservations larger than a leaf climb to the spine.
#[test]
fn test_resv_spans_leaves() {
    common::setup_test();
    let engine = LinearSelect::new(fat_tree(), CrType::Cpu);

    let picked = engine.resv_test(&NodeMask::all(8), 5).unwrap();
    assert_eq!(common::mask_indices(&picked), vec![0, 1, 2, 3, 4]);
}

/// Without a switch table a reservation is just the first N available
/// nodes.
#[test]
fn test_resv_without_topology() {
    common::setup_test();
    let cluster = common::uniform_cluster(8, 4, 1024);
    let avail = common::mask(&cluster, &[1, 3, 5, 7]);
    let engine = LinearSelect::new(cluster, CrType::Cpu);

    let picked = engine.resv_test(&avail, 2).unwrap();
    assert_eq!(common::mask_indices(&picked), vec![1, 3]);
}

/// A reservation that cannot be filled returns nothing.
#[test]
fn test_resv_shortfall() {
    common::setup_test();
    let engine = LinearSelect::new(fat_tree(), CrType::Cpu);
    let avail = common::mask(engine.cluster(), &[0, 1]);
    assert!(engine.resv_test(&avail, 3).is_none());
}
