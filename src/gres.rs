//! Generic-resource (GRES) residency.
//!
//! Tracks named countable resources (GPUs, licenses, ...) per node. The
//! engine only needs three things from this accounting: whether a node's
//! resources can cover a job's request, and allocate/release updates as
//! jobs come and go. Per-node views are owned by the state snapshot that
//! holds them, so hypothetical scheduling on a cloned snapshot never
//! disturbs the real counts.

use std::collections::BTreeMap;

use log::error;

/// Total and in-use counts for one resource on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GresCounts {
    pub total: u64,
    pub alloc: u64,
}

/// Per-node generic-resource state: counts by resource name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GresNodeState {
    counts: BTreeMap<String, GresCounts>,
}

impl GresNodeState {
    /// Build a node state from (name, total) pairs with nothing in use.
    pub fn with_totals(totals: &[(&str, u64)]) -> Self {
        let counts = totals
            .iter()
            .map(|(name, total)| {
                (
                    name.to_string(),
                    GresCounts {
                        total: *total,
                        alloc: 0,
                    },
                )
            })
            .collect();
        GresNodeState { counts }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self, name: &str) -> GresCounts {
        self.counts.get(name).copied().unwrap_or_default()
    }
}

/// A job's per-node generic-resource request: counts by resource name,
/// claimed on every allocated node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GresRequest {
    wants: BTreeMap<String, u64>,
}

impl GresRequest {
    pub fn new(wants: &[(&str, u64)]) -> Self {
        GresRequest {
            wants: wants.iter().map(|(n, c)| (n.to_string(), *c)).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wants.is_empty()
    }
}

/// Number of the node's CPUs a job's request can be satisfied alongside.
///
/// Returns `u32::MAX` when the request is empty (no constraint), the full
/// `cpu_cnt` when every named resource fits, and 0 when any resource is
/// short. With `use_total` the current allocations are ignored, answering
/// "could this ever fit" rather than "does it fit now".
pub fn job_test(
    request: &GresRequest,
    node: &GresNodeState,
    use_total: bool,
    cpu_cnt: u32,
) -> u32 {
    if request.is_empty() {
        return u32::MAX;
    }
    for (name, want) in &request.wants {
        let counts = node.counts(name);
        let avail = if use_total {
            counts.total
        } else {
            counts.total.saturating_sub(counts.alloc)
        };
        if avail < *want {
            return 0;
        }
    }
    cpu_cnt
}

/// Claim a job's request on a node.
pub fn job_alloc(request: &GresRequest, node: &mut GresNodeState, node_name: &str) {
    for (name, want) in &request.wants {
        let counts = node.counts.entry(name.clone()).or_default();
        counts.alloc += want;
        if counts.alloc > counts.total {
            error!(
                "gres {} over-allocated on node {} ({} > {})",
                name, node_name, counts.alloc, counts.total
            );
        }
    }
}

/// Release a job's request on a node, clamping on underflow.
pub fn job_dealloc(request: &GresRequest, node: &mut GresNodeState, node_name: &str) {
    for (name, want) in &request.wants {
        let counts = node.counts.entry(name.clone()).or_default();
        if counts.alloc >= *want {
            counts.alloc -= want;
        } else {
            error!("gres {} underflow on node {}", name, node_name);
            counts.alloc = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_request_is_unconstrained() {
        let node = GresNodeState::with_totals(&[("gpu", 2)]);
        assert_eq!(job_test(&GresRequest::default(), &node, false, 8), u32::MAX);
    }

    #[test]
    fn test_alloc_then_test() {
        let req = GresRequest::new(&[("gpu", 2)]);
        let mut node = GresNodeState::with_totals(&[("gpu", 2)]);

        assert_eq!(job_test(&req, &node, false, 8), 8);
        job_alloc(&req, &mut node, "n0");
        // Nothing left now, but the total still covers the request.
        assert_eq!(job_test(&req, &node, false, 8), 0);
        assert_eq!(job_test(&req, &node, true, 8), 8);

        job_dealloc(&req, &mut node, "n0");
        assert_eq!(job_test(&req, &node, false, 8), 8);
    }

    #[test]
    fn test_missing_resource_fails() {
        let req = GresRequest::new(&[("license", 1)]);
        let node = GresNodeState::with_totals(&[("gpu", 2)]);
        assert_eq!(job_test(&req, &node, true, 8), 0);
    }

    #[test]
    fn test_dealloc_underflow_clamps() {
        let req = GresRequest::new(&[("gpu", 2)]);
        let mut node = GresNodeState::with_totals(&[("gpu", 2)]);
        job_dealloc(&req, &mut node, "n0");
        assert_eq!(node.counts("gpu").alloc, 0);
    }
}
