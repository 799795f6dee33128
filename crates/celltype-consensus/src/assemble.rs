//! Consensus assembler — merges majority labels and discussion outcomes into
//! the final per-cluster annotation set.
//!
//! Total over the input domain: every cluster id appears exactly once in the
//! output, with a cluster whose models all failed surfaced as an explicit
//! failure marker rather than dropped.

use std::collections::BTreeMap;

use tracing::info;

use crate::discussion::DiscussionOutcome;
use crate::types::{
    AgreementMetrics, ClusterId, ClusterOutcome, ConsensusResult, MarkerSet, Provenance,
};

/// Merge initial metrics and discussion outcomes into final results.
pub fn assemble(
    marker_sets: &BTreeMap<ClusterId, MarkerSet>,
    initial_metrics: &BTreeMap<ClusterId, AgreementMetrics>,
    discussions: &BTreeMap<ClusterId, DiscussionOutcome>,
) -> BTreeMap<ClusterId, ClusterOutcome> {
    let mut outcomes = BTreeMap::new();

    for cluster in marker_sets.keys() {
        let outcome = if let Some(discussion) = discussions.get(cluster) {
            ClusterOutcome::Resolved(ConsensusResult {
                cluster: cluster.clone(),
                label: discussion.final_label.clone(),
                metrics: discussion.final_metrics.clone(),
                provenance: Provenance::FromDiscussion,
                rounds_consumed: discussion.log.rounds_consumed(),
            })
        } else if let Some(metrics) = initial_metrics.get(cluster) {
            ClusterOutcome::Resolved(ConsensusResult {
                cluster: cluster.clone(),
                label: metrics.plurality_label.clone(),
                metrics: metrics.clone(),
                provenance: Provenance::FromMajority,
                rounds_consumed: 0,
            })
        } else {
            ClusterOutcome::Failed {
                cluster: cluster.clone(),
                reason: "no successful initial annotations from any model".to_string(),
            }
        };
        outcomes.insert(cluster.clone(), outcome);
    }

    let failed = outcomes.values().filter(|o| !o.is_resolved()).count();
    info!(
        clusters = outcomes.len(),
        discussed = discussions.len(),
        failed,
        "assembled consensus results"
    );
    outcomes
}
