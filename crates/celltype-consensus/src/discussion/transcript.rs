//! Human-readable transcript export for audit.
//!
//! Rendering is lossless with respect to round content: round numbers, every
//! participant position, and each arbiter synthesis appear verbatim.

use std::fmt::Write;

use crate::discussion::state::DiscussionLog;

/// Render one cluster's full deliberation record as plain text.
pub fn render_transcript(log: &DiscussionLog) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Discussion for cluster {} [{}] — {}/{} rounds",
        log.cluster,
        log.phase,
        log.rounds_consumed(),
        log.max_rounds
    );

    for round in &log.rounds {
        let _ = writeln!(out, "\n== Round {} ==", round.round);
        for position in &round.positions {
            let _ = writeln!(
                out,
                "  {} -> \"{}\"\n    {}",
                position.participant, position.label, position.reasoning
            );
        }
        let _ = writeln!(out, "  arbiter synthesis: \"{}\"", round.synthesized_label);
        if !round.synthesized_reasoning.is_empty() {
            let _ = writeln!(out, "    {}", round.synthesized_reasoning);
        }
    }

    for failed in &log.failed_rounds {
        let _ = writeln!(out, "\n== Round {failed} == (failed, no synthesis)");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discussion::state::{DiscussionPhase, DiscussionRound, Position};
    use crate::types::ClusterId;

    #[test]
    fn test_transcript_contains_all_round_content() {
        let mut log = DiscussionLog::new(ClusterId::from("2"), 3);
        log.transition(DiscussionPhase::InDiscussion, "start").unwrap();
        log.append_round(DiscussionRound {
            round: 1,
            positions: vec![
                Position::new("openai/gpt-4o", "T cells", "CD3D dominant"),
                Position::new("anthropic/claude", "NK cells", "GNLY present"),
            ],
            synthesized_label: "T cells".to_string(),
            synthesized_reasoning: "CD3D outweighs GNLY".to_string(),
        });
        log.transition(DiscussionPhase::Resolved, "settled").unwrap();

        let text = render_transcript(&log);
        assert!(text.contains("cluster 2"));
        assert!(text.contains("== Round 1 =="));
        assert!(text.contains("openai/gpt-4o -> \"T cells\""));
        assert!(text.contains("GNLY present"));
        assert!(text.contains("arbiter synthesis: \"T cells\""));
        assert!(text.contains("CD3D outweighs GNLY"));
    }

    #[test]
    fn test_transcript_marks_failed_rounds() {
        let mut log = DiscussionLog::new(ClusterId::from("5"), 2);
        log.transition(DiscussionPhase::InDiscussion, "start").unwrap();
        log.record_failed_round(1);
        log.transition(DiscussionPhase::Exhausted, "failed").unwrap();

        let text = render_transcript(&log);
        assert!(text.contains("== Round 1 == (failed, no synthesis)"));
    }
}
