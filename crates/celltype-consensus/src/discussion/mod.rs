//! Deliberation for controversial clusters: state machine, orchestrator, and
//! transcript export.

pub mod orchestrator;
pub mod state;
pub mod transcript;

pub use orchestrator::{discuss_cluster, DiscussionOutcome, DiscussionSettings};
pub use state::{
    DiscussionLog, DiscussionPhase, DiscussionRound, PhaseTransition, Position, TransitionError,
};
pub use transcript::render_transcript;
