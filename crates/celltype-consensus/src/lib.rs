//! Multi-model consensus annotation for cell clusters.
//!
//! Several text-generation models independently annotate each cluster from
//! its marker genes; agreement is measured per cluster (consensus proportion
//! and Shannon entropy); clusters where the models disagree go through
//! bounded discussion rounds driven by an arbiter model; and every cluster
//! ends with a final label carrying full provenance.
//!
//! # Pipeline
//!
//! - `annotate`: one gateway call per (cluster, model) pair, responses
//!   normalized into labels
//! - `consensus`: agreement metrics and the controversy predicate
//! - `discussion`: the deliberation state machine, orchestrator, and
//!   transcript export
//! - `assemble`: merges majority and discussion outcomes into final results
//! - `cache`: content-addressed response cache so repeated runs replay
//!   without new model calls
//! - `gateway`: the provider boundary; bring your own [`ModelGateway`]
//!   implementations or use the bundled OpenAI-compatible HTTP gateway
//!
//! # Usage
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//! use celltype_consensus::{
//!     ConsensusEngine, EngineConfig, GatewayRegistry, MarkerSet, ModelSpec,
//!     OpenAiCompatGateway,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let mut registry = GatewayRegistry::new();
//! registry.register(
//!     "openai",
//!     Arc::new(OpenAiCompatGateway::new("https://api.openai.com/v1", "sk-...")?),
//! );
//!
//! let config = EngineConfig::from_toml_str(r#"
//!     species = "human"
//!     tissue = "blood"
//!
//!     [[models]]
//!     provider = "openai"
//!     name = "gpt-4o"
//!
//!     [arbiter]
//!     provider = "openai"
//!     name = "gpt-4o"
//! "#)?;
//!
//! let mut clusters = BTreeMap::new();
//! clusters.insert("1".into(), MarkerSet::from_genes(["CD3D", "CD3E", "IL7R"]));
//!
//! let engine = ConsensusEngine::new(config, registry)?;
//! let result = engine.run(&clusters).await?;
//! println!("{}", result.summary());
//! # Ok(())
//! # }
//! ```

pub mod annotate;
pub mod assemble;
pub mod cache;
pub mod consensus;
pub mod discussion;
pub mod engine;
pub mod gateway;
pub mod prompts;
pub mod types;

// Re-export the engine surface
pub use engine::{ConsensusEngine, ConsensusRunResult, EngineConfig, EngineError, InitialFailure};

// Re-export the gateway boundary
pub use gateway::{GatewayError, GatewayRegistry, ModelGateway, OpenAiCompatGateway};

// Re-export the core data model
pub use consensus::{Controversy, ControversyRule};
pub use discussion::{render_transcript, DiscussionLog, DiscussionPhase, DiscussionRound};
pub use types::{
    AgreementMetrics, ClusterId, ClusterOutcome, ConsensusResult, InitialAnnotation, Marker,
    MarkerSet, ModelSpec, Provenance, UNPARSEABLE_LABEL,
};
