//! Prompt rendering — fixed templates for the initial annotation request and
//! the discussion transcript.
//!
//! Templates are engine-internal and not caller-configurable: the cache
//! fingerprint is computed over the rendered prompt, so a fixed template is
//! what makes repeated runs hit the same entries.

use crate::discussion::state::{DiscussionRound, Position};
use crate::types::Marker;

/// Render the initial annotation prompt for one cluster.
pub fn annotation_prompt(
    cluster_id: &str,
    markers: &[Marker],
    species: &str,
    tissue: Option<&str>,
    context: Option<&str>,
) -> String {
    let gene_list = marker_line(markers);
    let tissue_line = tissue
        .map(|t| format!(" from {t} tissue"))
        .unwrap_or_default();
    let context_block = context
        .map(|c| format!("\nAdditional context: {c}\n"))
        .unwrap_or_default();

    format!(
        "You are an expert in cell biology annotating {species} cell clusters{tissue_line}.\n\
         Identify the cell type of cluster {cluster_id} using these ranked marker genes:\n\
         {gene_list}\n\
         {context_block}\
         Reply with the cell type name on the first line, then a brief justification\n\
         citing the decisive marker genes. Only provide the cell type name on the\n\
         first line; do not show numbers or cluster ids before the name."
    )
}

/// Render the deliberation prompt for one discussion round: every current
/// position with its reasoning, prior syntheses, and arbiter instructions.
pub fn discussion_prompt(
    cluster_id: &str,
    markers: &[Marker],
    species: &str,
    tissue: Option<&str>,
    positions: &[Position],
    prior_rounds: &[DiscussionRound],
    round: u32,
) -> String {
    let gene_list = marker_line(markers);
    let tissue_line = tissue
        .map(|t| format!(" from {t} tissue"))
        .unwrap_or_default();

    let mut positions_block = String::new();
    for p in positions {
        positions_block.push_str(&format!(
            "- {} proposed \"{}\": {}\n",
            p.participant, p.label, p.reasoning
        ));
    }

    let mut history_block = String::new();
    if !prior_rounds.is_empty() {
        history_block.push_str("Earlier deliberation rounds synthesized:\n");
        for r in prior_rounds {
            history_block.push_str(&format!(
                "- round {}: \"{}\"\n",
                r.round, r.synthesized_label
            ));
        }
    }

    format!(
        "You are moderating a panel of models annotating a {species} cell cluster{tissue_line}.\n\
         Cluster {cluster_id} has ranked marker genes:\n\
         {gene_list}\n\
         This is deliberation round {round}. The panel's current positions:\n\
         {positions_block}\
         {history_block}\
         Weigh the evidence each participant cites against the marker genes and\n\
         synthesize the single best cell type label. Reply with the cell type name\n\
         on the first line, then your reasoning."
    )
}

fn marker_line(markers: &[Marker]) -> String {
    markers
        .iter()
        .map(|m| m.gene.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
