//! Core data model — clusters, markers, model identities, annotations,
//! agreement metrics, and final consensus results.

use serde::{Deserialize, Serialize};

/// Sentinel label recorded when a model response cannot be parsed.
///
/// Participates in agreement distributions like any other label but never
/// wins a plurality while at least one parseable label exists.
pub const UNPARSEABLE_LABEL: &str = "unparseable";

/// Opaque, caller-supplied identifier for a group of samples labeled as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single marker gene with its score for a cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub gene: String,
    pub score: f64,
}

impl Marker {
    pub fn new(gene: impl Into<String>, score: f64) -> Self {
        Self {
            gene: gene.into(),
            score,
        }
    }
}

/// Ordered marker genes for one cluster. Immutable once built for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerSet {
    markers: Vec<Marker>,
}

impl MarkerSet {
    pub fn new(markers: Vec<Marker>) -> Self {
        Self { markers }
    }

    /// Build from bare gene names, assigning descending rank scores.
    pub fn from_genes<I, S>(genes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let markers: Vec<Marker> = genes
            .into_iter()
            .enumerate()
            .map(|(i, g)| Marker::new(g, -(i as f64)))
            .collect();
        Self { markers }
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    /// The top-N markers in stored order.
    pub fn top(&self, n: usize) -> &[Marker] {
        &self.markers[..self.markers.len().min(n)]
    }
}

/// Identifies one text-generation model: provider plus model name, with an
/// optional tier marker. Equality is by normalized identifier string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Provider key, e.g. "openai", "anthropic", "openrouter".
    pub provider: String,
    /// Model name as the provider expects it, e.g. "gpt-4o".
    pub name: String,
    /// Optional free/paid tier marker, informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Normalized identifier used for equality, registry lookup, and cache keys.
    pub fn normalized_id(&self) -> String {
        format!(
            "{}/{}",
            self.provider.trim().to_ascii_lowercase(),
            self.name.trim().to_ascii_lowercase()
        )
    }

    /// Normalized provider key for gateway registry lookup.
    pub fn provider_key(&self) -> String {
        self.provider.trim().to_ascii_lowercase()
    }
}

impl PartialEq for ModelSpec {
    fn eq(&self, other: &Self) -> bool {
        self.normalized_id() == other.normalized_id()
    }
}

impl Eq for ModelSpec {}

impl std::hash::Hash for ModelSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.normalized_id().hash(state);
    }
}

impl std::fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.normalized_id())
    }
}

/// One model's opinion for one cluster from the initial round. Write-once:
/// revised opinions live in discussion rounds, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialAnnotation {
    pub model: ModelSpec,
    /// Cleaned label text ([`UNPARSEABLE_LABEL`] when parsing failed).
    pub label: String,
    /// The model's stated reasoning (raw response text, trimmed).
    pub reasoning: String,
    /// Optional confidence tier the model cited for itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    /// Marker genes the model cited as evidence, when stated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cited_genes: Vec<String>,
}

impl InitialAnnotation {
    /// Whether the response parsed into a usable label.
    pub fn is_parsed(&self) -> bool {
        self.label != UNPARSEABLE_LABEL
    }
}

/// Agreement distribution over a cluster's current label set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementMetrics {
    /// Label with the maximum count (first-encountered order breaks ties).
    pub plurality_label: String,
    /// Fraction of labels matching the plurality label, in [1/N, 1].
    pub consensus_proportion: f64,
    /// Shannon entropy of the label distribution, in bits. Zero iff all
    /// labels are identical.
    pub shannon_entropy: f64,
    /// Histogram of normalized label → count, in first-encountered order.
    pub label_histogram: Vec<(String, usize)>,
    /// Number of labels the distribution was computed over.
    pub total_labels: usize,
}

impl AgreementMetrics {
    /// Whether every label in the distribution agrees.
    pub fn is_unanimous(&self) -> bool {
        self.total_labels > 0 && (self.consensus_proportion - 1.0).abs() < f64::EPSILON
    }
}

/// How a cluster's final label was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Initial plurality held; no discussion was needed.
    FromMajority,
    /// Label was synthesized during discussion rounds.
    FromDiscussion,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FromMajority => write!(f, "from_majority"),
            Self::FromDiscussion => write!(f, "from_discussion"),
        }
    }
}

/// Final annotation for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub cluster: ClusterId,
    pub label: String,
    pub metrics: AgreementMetrics,
    pub provenance: Provenance,
    /// Discussion rounds consumed (0 when the cluster never entered discussion).
    pub rounds_consumed: u32,
}

/// Per-cluster outcome: resolved or an explicit failure marker. A failed
/// cluster never aborts the run and is never silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ClusterOutcome {
    Resolved(ConsensusResult),
    Failed { cluster: ClusterId, reason: String },
}

impl ClusterOutcome {
    pub fn cluster(&self) -> &ClusterId {
        match self {
            Self::Resolved(r) => &r.cluster,
            Self::Failed { cluster, .. } => cluster,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    pub fn result(&self) -> Option<&ConsensusResult> {
        match self {
            Self::Resolved(r) => Some(r),
            Self::Failed { .. } => None,
        }
    }
}
