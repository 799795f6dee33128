//! Discussion state machine — phases, transitions, and the append-only
//! per-cluster deliberation log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ClusterId;

/// Phase of a cluster's deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionPhase {
    /// Flagged controversial, discussion not yet started.
    Pending,
    /// Deliberation rounds in progress.
    InDiscussion,
    /// Agreement reached (threshold or stability rule).
    Resolved,
    /// Round cap hit; the last synthesis is accepted as final.
    Exhausted,
}

impl DiscussionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Exhausted)
    }

    /// Valid transitions out of this phase.
    pub fn valid_transitions(self) -> &'static [DiscussionPhase] {
        match self {
            Self::Pending => &[Self::InDiscussion],
            Self::InDiscussion => &[Self::Resolved, Self::Exhausted],
            Self::Resolved | Self::Exhausted => &[],
        }
    }
}

impl std::fmt::Display for DiscussionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InDiscussion => write!(f, "in_discussion"),
            Self::Resolved => write!(f, "resolved"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Error for invalid phase transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}: {reason}")]
pub struct TransitionError {
    pub from: DiscussionPhase,
    pub to: DiscussionPhase,
    pub reason: String,
}

/// One participant's stated position inside a round transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Normalized model identifier of the participant.
    pub participant: String,
    pub label: String,
    pub reasoning: String,
}

impl Position {
    pub fn new(
        participant: impl Into<String>,
        label: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            participant: participant.into(),
            label: label.into(),
            reasoning: reasoning.into(),
        }
    }
}

/// One deliberation round: the transcript the arbiter saw and what it
/// synthesized. Rounds are appended, never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionRound {
    /// 1-based, monotonically increasing per cluster.
    pub round: u32,
    /// Ordered participant positions shown to the arbiter.
    pub positions: Vec<Position>,
    /// The arbiter's synthesized label for this round.
    pub synthesized_label: String,
    /// The arbiter's stated reasoning.
    pub synthesized_reasoning: String,
}

/// A recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: DiscussionPhase,
    pub to: DiscussionPhase,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Append-only deliberation record for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionLog {
    pub cluster: ClusterId,
    pub phase: DiscussionPhase,
    pub max_rounds: u32,
    pub rounds: Vec<DiscussionRound>,
    pub transitions: Vec<PhaseTransition>,
    /// Rounds whose gateway call failed (no round entry was appended).
    pub failed_rounds: Vec<u32>,
}

impl DiscussionLog {
    pub fn new(cluster: ClusterId, max_rounds: u32) -> Self {
        Self {
            cluster,
            phase: DiscussionPhase::Pending,
            max_rounds,
            rounds: Vec::new(),
            transitions: Vec::new(),
            failed_rounds: Vec::new(),
        }
    }

    /// Transition to a new phase, recording the step.
    pub fn transition(
        &mut self,
        to: DiscussionPhase,
        reason: &str,
    ) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
                reason: format!("allowed: {:?}", self.phase.valid_transitions()),
            });
        }
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
        self.phase = to;
        Ok(())
    }

    /// Append a completed round. Round numbers must be exactly 1..k.
    pub fn append_round(&mut self, round: DiscussionRound) {
        debug_assert_eq!(round.round as usize, self.rounds.len() + 1);
        self.rounds.push(round);
    }

    pub fn record_failed_round(&mut self, round: u32) {
        self.failed_rounds.push(round);
    }

    pub fn is_complete(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Most recent synthesized label, if any round completed.
    pub fn last_synthesis(&self) -> Option<&str> {
        self.rounds.last().map(|r| r.synthesized_label.as_str())
    }

    /// Number of rounds consumed.
    pub fn rounds_consumed(&self) -> u32 {
        self.rounds.last().map(|r| r.round).unwrap_or(0)
    }
}
