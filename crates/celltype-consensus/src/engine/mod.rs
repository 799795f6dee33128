//! Caller-facing run entry point — configuration, validation, and the
//! end-to-end pipeline: collect → evaluate → detect → discuss → assemble.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use futures::future;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::annotate::{self, CallContext};
use crate::assemble;
use crate::cache::{ResponseCache, SingleFlight};
use crate::consensus::{self, Controversy, ControversyRule};
use crate::discussion::{self, DiscussionLog, DiscussionOutcome, DiscussionSettings};
use crate::gateway::GatewayRegistry;
use crate::types::{
    AgreementMetrics, ClusterId, ClusterOutcome, InitialAnnotation, MarkerSet, ModelSpec,
};

/// Fatal configuration problems, rejected before any external call is made.
/// Everything else in the engine degrades per cluster instead of failing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

fn default_controversy_threshold() -> f64 {
    0.7
}
fn default_entropy_threshold() -> f64 {
    1.0
}
fn default_max_rounds() -> u32 {
    3
}
fn default_top_genes() -> usize {
    10
}
fn default_cache_enabled() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    120
}

/// Full run configuration. Loadable from TOML; unknown providers, empty model
/// lists, and out-of-range thresholds are rejected by [`validate`].
///
/// [`validate`]: EngineConfig::validate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Species the clusters come from, e.g. "human".
    pub species: String,
    /// Optional tissue context, e.g. "blood".
    #[serde(default)]
    pub tissue: Option<String>,
    /// Optional free-text context appended to annotation prompts.
    #[serde(default)]
    pub additional_context: Option<String>,
    /// Ordered panel of models for the initial round. Order matters: it is
    /// the plurality tie-break order.
    pub models: Vec<ModelSpec>,
    /// The model that synthesizes resolutions during discussion.
    pub arbiter: ModelSpec,
    #[serde(default = "default_controversy_threshold")]
    pub controversy_threshold: f64,
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
    #[serde(default = "default_max_rounds")]
    pub max_discussion_rounds: u32,
    /// Marker genes per cluster passed into prompts, truncated to this many.
    #[serde(default = "default_top_genes")]
    pub top_genes: usize,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Cache root directory; defaults to a per-user temp location.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub gateway_timeout_secs: u64,
    #[serde(default)]
    pub controversy_rule: ControversyRule,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, EngineError> {
        Ok(toml::from_str(raw)?)
    }

    /// Reject invalid configuration before any external call.
    pub fn validate(&self, registry: &GatewayRegistry) -> Result<(), EngineError> {
        if self.species.trim().is_empty() {
            return Err(EngineError::Config("species must not be empty".to_string()));
        }
        if self.models.is_empty() {
            return Err(EngineError::Config("model list must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.controversy_threshold) {
            return Err(EngineError::Config(format!(
                "controversy_threshold must be in [0, 1], got {}",
                self.controversy_threshold
            )));
        }
        if self.entropy_threshold < 0.0 {
            return Err(EngineError::Config(format!(
                "entropy_threshold must be >= 0, got {}",
                self.entropy_threshold
            )));
        }
        if self.max_discussion_rounds == 0 {
            return Err(EngineError::Config(
                "max_discussion_rounds must be at least 1".to_string(),
            ));
        }
        if self.top_genes == 0 {
            return Err(EngineError::Config("top_genes must be at least 1".to_string()));
        }
        for model in &self.models {
            if !registry.contains(&model.provider_key()) {
                return Err(EngineError::Config(format!(
                    "no gateway registered for provider '{}' (model {})",
                    model.provider_key(),
                    model
                )));
            }
        }
        if !registry.contains(&self.arbiter.provider_key()) {
            return Err(EngineError::Config(format!(
                "no gateway registered for arbiter provider '{}'",
                self.arbiter.provider_key()
            )));
        }
        Ok(())
    }

    /// Cache namespace derived from everything that shapes responses, so runs
    /// with different configurations never share entries.
    pub fn cache_namespace(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for model in &self.models {
            hasher.update(model.normalized_id().as_bytes());
            hasher.update(b";");
        }
        hasher.update(self.arbiter.normalized_id().as_bytes());
        hasher.update(
            format!(
                ";{};{:?};{};{};{};{:?}",
                self.species,
                self.tissue,
                self.controversy_threshold,
                self.entropy_threshold,
                self.top_genes,
                self.controversy_rule
            )
            .as_bytes(),
        );
        let hex = hasher.finalize().to_hex();
        format!("run-{}", &hex.as_str()[..12])
    }

    fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("celltype-consensus"))
    }
}

/// A (cluster, model) gateway failure from the initial round, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialFailure {
    pub cluster: ClusterId,
    pub model: ModelSpec,
    pub error: String,
}

/// Everything a run produces: final labels plus the full provenance trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusRunResult {
    /// Final outcome per cluster, total over the input domain.
    pub outcomes: BTreeMap<ClusterId, ClusterOutcome>,
    /// Agreement metrics per cluster after the initial round.
    pub initial_metrics: BTreeMap<ClusterId, AgreementMetrics>,
    /// Per-model initial annotations per cluster, in configured model order.
    pub initial_annotations: BTreeMap<ClusterId, Vec<InitialAnnotation>>,
    /// Deliberation logs for clusters that entered discussion.
    pub discussions: BTreeMap<ClusterId, DiscussionLog>,
    /// Clusters flagged controversial after the initial round.
    pub controversial: Vec<ClusterId>,
    /// Initial-round gateway failures (never fatal).
    pub initial_failures: Vec<InitialFailure>,
}

impl ConsensusRunResult {
    /// Final label per resolved cluster.
    pub fn labels(&self) -> BTreeMap<ClusterId, String> {
        self.outcomes
            .iter()
            .filter_map(|(id, o)| o.result().map(|r| (id.clone(), r.label.clone())))
            .collect()
    }

    /// Human-readable transcript per discussed cluster.
    pub fn transcripts(&self) -> BTreeMap<ClusterId, String> {
        self.discussions
            .iter()
            .map(|(id, log)| (id.clone(), discussion::render_transcript(log)))
            .collect()
    }

    /// Compact text report of the whole run.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Consensus over {} clusters:", self.outcomes.len());
        for (cluster, outcome) in &self.outcomes {
            match outcome {
                ClusterOutcome::Resolved(r) => {
                    let _ = writeln!(
                        out,
                        "  {cluster}: {} ({}, P={:.2}, H={:.2} bits, rounds={})",
                        r.label,
                        r.provenance,
                        r.metrics.consensus_proportion,
                        r.metrics.shannon_entropy,
                        r.rounds_consumed
                    );
                }
                ClusterOutcome::Failed { reason, .. } => {
                    let _ = writeln!(out, "  {cluster}: FAILED ({reason})");
                }
            }
        }
        if !self.controversial.is_empty() {
            let list: Vec<&str> = self.controversial.iter().map(|c| c.as_str()).collect();
            let _ = writeln!(out, "Controversial clusters: {}", list.join(", "));
        }
        out
    }
}

/// The consensus annotation engine. Construct once per run with a validated
/// configuration and a caller-owned gateway registry.
pub struct ConsensusEngine {
    config: EngineConfig,
    registry: GatewayRegistry,
    single_flight: SingleFlight,
}

impl ConsensusEngine {
    /// Build an engine, rejecting invalid configuration up front.
    pub fn new(config: EngineConfig, registry: GatewayRegistry) -> Result<Self, EngineError> {
        config.validate(&registry)?;
        Ok(Self {
            config,
            registry,
            single_flight: SingleFlight::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The response cache this configuration addresses, for inspection or
    /// explicit invalidation. `None` when caching is disabled.
    pub fn cache(&self) -> Option<ResponseCache> {
        self.config
            .cache_enabled
            .then(|| ResponseCache::new(self.config.cache_root(), self.config.cache_namespace()))
    }

    /// Run the full pipeline over the given marker sets.
    pub async fn run(
        &self,
        marker_sets: &BTreeMap<ClusterId, MarkerSet>,
    ) -> Result<ConsensusRunResult, EngineError> {
        self.run_with_cancel(marker_sets, &CancellationToken::new())
            .await
    }

    /// Run the full pipeline, abortable at cluster granularity. Cancellation
    /// never corrupts the cache; already-resolved clusters keep their results
    /// and the partial outcome set is returned.
    pub async fn run_with_cancel(
        &self,
        marker_sets: &BTreeMap<ClusterId, MarkerSet>,
        cancel: &CancellationToken,
    ) -> Result<ConsensusRunResult, EngineError> {
        if marker_sets.is_empty() {
            return Err(EngineError::Config("no clusters to annotate".to_string()));
        }
        for (cluster, markers) in marker_sets {
            if markers.is_empty() {
                return Err(EngineError::Config(format!(
                    "cluster {cluster} has an empty marker set"
                )));
            }
        }

        let cache = self.cache();
        let ctx = CallContext {
            registry: &self.registry,
            cache: cache.as_ref(),
            single_flight: &self.single_flight,
            timeout: self.config.gateway_timeout(),
        };

        // Initial round: every (cluster, model) pair, concurrently.
        let collected = annotate::collect_initial(
            &ctx,
            marker_sets,
            &self.config.models,
            &self.config.species,
            self.config.tissue.as_deref(),
            self.config.additional_context.as_deref(),
            self.config.top_genes,
            cancel,
        )
        .await;

        // Agreement metrics per cluster over the complete label set.
        let mut initial_metrics = BTreeMap::new();
        let mut controversial = Vec::new();
        for (cluster, annotations) in &collected.annotations {
            let labels: Vec<String> = annotations.iter().map(|a| a.label.clone()).collect();
            let metrics = consensus::evaluate(&labels);
            let classification = consensus::classify(
                &metrics,
                self.config.controversy_threshold,
                self.config.entropy_threshold,
                self.config.controversy_rule,
            );
            if classification == Controversy::Controversial {
                controversial.push(cluster.clone());
            }
            initial_metrics.insert(cluster.clone(), metrics);
        }
        info!(
            clusters = collected.annotations.len(),
            controversial = controversial.len(),
            failures = collected.failures.len(),
            "initial round evaluated"
        );

        // Deliberate controversial clusters concurrently; rounds within each
        // cluster stay sequential.
        let settings = DiscussionSettings {
            max_rounds: self.config.max_discussion_rounds,
            controversy_threshold: self.config.controversy_threshold,
            entropy_threshold: self.config.entropy_threshold,
            rule: self.config.controversy_rule,
            species: self.config.species.clone(),
            tissue: self.config.tissue.clone(),
            top_genes: self.config.top_genes,
        };
        let discussion_tasks = controversial.iter().map(|cluster| {
            let ctx = &ctx;
            let settings = &settings;
            let metrics = &initial_metrics[cluster];
            let annotations = &collected.annotations[cluster];
            let markers = &marker_sets[cluster];
            async move {
                let outcome = discussion::discuss_cluster(
                    ctx,
                    &self.config.arbiter,
                    settings,
                    cluster,
                    markers,
                    annotations,
                    metrics,
                    cancel,
                )
                .await;
                (cluster.clone(), outcome)
            }
        });
        let discussions: BTreeMap<ClusterId, DiscussionOutcome> =
            future::join_all(discussion_tasks).await.into_iter().collect();

        let outcomes = assemble::assemble(marker_sets, &initial_metrics, &discussions);

        Ok(ConsensusRunResult {
            outcomes,
            initial_metrics,
            initial_annotations: collected.annotations,
            discussions: discussions
                .into_iter()
                .map(|(id, outcome)| (id, outcome.log))
                .collect(),
            controversial,
            initial_failures: collected
                .failures
                .into_iter()
                .map(|f| InitialFailure {
                    cluster: f.cluster,
                    model: f.model,
                    error: f.error.to_string(),
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, ModelGateway};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StaticGateway(&'static str);

    #[async_trait]
    impl ModelGateway for StaticGateway {
        async fn invoke(&self, _model: &str, _prompt: &str) -> Result<String, GatewayError> {
            Ok(self.0.to_string())
        }
    }

    fn registry() -> GatewayRegistry {
        let mut registry = GatewayRegistry::new();
        registry.register("openai", Arc::new(StaticGateway("T cells")));
        registry.register("anthropic", Arc::new(StaticGateway("T cells")));
        registry
    }

    fn config() -> EngineConfig {
        EngineConfig {
            species: "human".to_string(),
            tissue: None,
            additional_context: None,
            models: vec![
                ModelSpec::new("openai", "gpt-4o"),
                ModelSpec::new("anthropic", "claude-3-7-sonnet"),
            ],
            arbiter: ModelSpec::new("anthropic", "claude-3-7-sonnet"),
            controversy_threshold: 0.7,
            entropy_threshold: 1.0,
            max_discussion_rounds: 3,
            top_genes: 10,
            cache_enabled: false,
            cache_dir: None,
            gateway_timeout_secs: 30,
            controversy_rule: ControversyRule::Either,
        }
    }

    #[test]
    fn test_validate_rejects_empty_models() {
        let mut cfg = config();
        cfg.models.clear();
        let err = cfg.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("model list"));
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut cfg = config();
        cfg.controversy_threshold = 1.5;
        assert!(cfg.validate(&registry()).is_err());

        let mut cfg = config();
        cfg.entropy_threshold = -0.1;
        assert!(cfg.validate(&registry()).is_err());

        let mut cfg = config();
        cfg.max_discussion_rounds = 0;
        assert!(cfg.validate(&registry()).is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_arbiter_provider() {
        let mut cfg = config();
        cfg.arbiter = ModelSpec::new("gemini", "gemini-2.5-pro");
        let err = cfg.validate(&registry()).unwrap_err();
        assert!(err.to_string().contains("arbiter"));
    }

    #[test]
    fn test_cache_namespace_varies_with_config() {
        let a = config().cache_namespace();
        let mut cfg = config();
        cfg.controversy_threshold = 0.8;
        let b = cfg.cache_namespace();
        assert_ne!(a, b);
        assert!(a.starts_with("run-"));
        // Deterministic across calls.
        assert_eq!(a, config().cache_namespace());
    }

    #[test]
    fn test_config_from_toml() {
        let cfg = EngineConfig::from_toml_str(
            r#"
            species = "human"
            tissue = "blood"

            [[models]]
            provider = "openai"
            name = "gpt-4o"

            [arbiter]
            provider = "anthropic"
            name = "claude-3-7-sonnet"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.species, "human");
        assert_eq!(cfg.models.len(), 1);
        assert!((cfg.controversy_threshold - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.max_discussion_rounds, 3);
        assert!(cfg.cache_enabled);
        assert_eq!(cfg.controversy_rule, ControversyRule::Either);
    }

    #[tokio::test]
    async fn test_run_rejects_empty_input() {
        let engine = ConsensusEngine::new(config(), registry()).unwrap();
        let err = engine.run(&BTreeMap::new()).await.unwrap_err();
        assert!(err.to_string().contains("no clusters"));
    }

    #[tokio::test]
    async fn test_run_rejects_empty_marker_set() {
        let engine = ConsensusEngine::new(config(), registry()).unwrap();
        let mut sets = BTreeMap::new();
        sets.insert(ClusterId::from("1"), MarkerSet::new(vec![]));
        let err = engine.run(&sets).await.unwrap_err();
        assert!(err.to_string().contains("empty marker set"));
    }
}
