//! Annotation collector — drives the gateway once per (cluster, model) pair
//! for the initial round and normalizes raw responses into labels.
//!
//! No retries happen here; a gateway failure for one pair is recorded and the
//! run continues. Parsing failures yield the sentinel label instead, which
//! participates in the agreement distribution like any other label.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{self, ResponseCache, SingleFlight};
use crate::gateway::{invoke_with_timeout, GatewayError, GatewayRegistry, ModelGateway};
use crate::prompts;
use crate::types::{ClusterId, InitialAnnotation, MarkerSet, ModelSpec, UNPARSEABLE_LABEL};

/// Cap on reasoning text carried into transcripts and discussion prompts.
const REASONING_MAX_CHARS: usize = 600;

/// Output of the initial round.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    /// Per cluster, one annotation per model in configured model order.
    /// Models whose gateway call failed are absent.
    pub annotations: BTreeMap<ClusterId, Vec<InitialAnnotation>>,
    /// Gateway failures, one per failed (cluster, model) pair.
    pub failures: Vec<CollectFailure>,
}

/// A (cluster, model) pair whose gateway call failed during collection.
#[derive(Debug, Clone)]
pub struct CollectFailure {
    pub cluster: ClusterId,
    pub model: ModelSpec,
    pub error: GatewayError,
}

/// Shared call context for cache-checked gateway invocation.
pub struct CallContext<'a> {
    pub registry: &'a GatewayRegistry,
    pub cache: Option<&'a ResponseCache>,
    pub single_flight: &'a SingleFlight,
    pub timeout: std::time::Duration,
}

impl CallContext<'_> {
    /// Cache-checked invocation: fingerprint the rendered prompt, return the
    /// cached response on a hit, otherwise call the gateway once and store
    /// the raw response. At most one live call per fingerprint is in flight.
    pub async fn invoke_cached(
        &self,
        gateway: &Arc<dyn ModelGateway>,
        model: &ModelSpec,
        prompt: &str,
    ) -> Result<String, GatewayError> {
        let model_id = model.normalized_id();
        let fp = cache::fingerprint(&model_id, prompt);
        let _guard = self.single_flight.acquire(&fp).await;

        if let Some(cache) = self.cache {
            if let Some(entry) = cache.get(&fp) {
                debug!(model = %model_id, fingerprint = %fp, "using cached response");
                return Ok(entry.response);
            }
        }

        let response = invoke_with_timeout(gateway.as_ref(), &model.name, prompt, self.timeout).await?;

        if let Some(cache) = self.cache {
            if let Err(e) = cache.put(&fp, &model_id, &response) {
                warn!(model = %model_id, error = %e, "failed to write cache entry");
            }
        }
        Ok(response)
    }
}

/// Run the initial round: one annotation request per (cluster, model) pair.
///
/// Pairs are independent, so they run concurrently; a cluster's label set is
/// only assembled once all of its models have returned. Cancellation is
/// observed per pair: a pair whose turn comes after the token fires is
/// recorded as a failure without touching the gateway.
#[allow(clippy::too_many_arguments)]
pub async fn collect_initial(
    ctx: &CallContext<'_>,
    marker_sets: &BTreeMap<ClusterId, MarkerSet>,
    models: &[ModelSpec],
    species: &str,
    tissue: Option<&str>,
    context: Option<&str>,
    top_genes: usize,
    cancel: &CancellationToken,
) -> CollectOutcome {
    info!(
        clusters = marker_sets.len(),
        models = models.len(),
        "starting initial annotation round"
    );

    let mut tasks = Vec::new();
    for (cluster, markers) in marker_sets {
        for (model_index, model) in models.iter().enumerate() {
            tasks.push(annotate_pair(
                ctx,
                cluster,
                markers,
                model,
                model_index,
                species,
                tissue,
                context,
                top_genes,
                cancel,
            ));
        }
    }

    let results = future::join_all(tasks).await;

    let mut outcome = CollectOutcome::default();
    let mut grouped: BTreeMap<ClusterId, Vec<(usize, InitialAnnotation)>> = BTreeMap::new();
    for result in results {
        match result {
            PairOutcome::Annotated {
                cluster,
                model_index,
                annotation,
            } => {
                grouped
                    .entry(cluster)
                    .or_default()
                    .push((model_index, annotation));
            }
            PairOutcome::GatewayFailed(failure) => {
                warn!(
                    cluster = %failure.cluster,
                    model = %failure.model,
                    error = %failure.error,
                    "initial annotation call failed"
                );
                outcome.failures.push(failure);
            }
        }
    }

    // Restore configured model order within each cluster.
    for (cluster, mut entries) in grouped {
        entries.sort_by_key(|(index, _)| *index);
        outcome
            .annotations
            .insert(cluster, entries.into_iter().map(|(_, a)| a).collect());
    }
    outcome
}

enum PairOutcome {
    Annotated {
        cluster: ClusterId,
        model_index: usize,
        annotation: InitialAnnotation,
    },
    GatewayFailed(CollectFailure),
}

#[allow(clippy::too_many_arguments)]
async fn annotate_pair(
    ctx: &CallContext<'_>,
    cluster: &ClusterId,
    markers: &MarkerSet,
    model: &ModelSpec,
    model_index: usize,
    species: &str,
    tissue: Option<&str>,
    context: Option<&str>,
    top_genes: usize,
    cancel: &CancellationToken,
) -> PairOutcome {
    if cancel.is_cancelled() {
        return PairOutcome::GatewayFailed(CollectFailure {
            cluster: cluster.clone(),
            model: model.clone(),
            error: GatewayError::Cancelled,
        });
    }

    let prompt = prompts::annotation_prompt(
        cluster.as_str(),
        markers.top(top_genes),
        species,
        tissue,
        context,
    );

    let gateway = match ctx.registry.get(&model.provider_key()) {
        Some(gw) => gw,
        None => {
            // Config validation rejects unknown providers up front; reaching
            // this means the registry changed mid-run.
            return PairOutcome::GatewayFailed(CollectFailure {
                cluster: cluster.clone(),
                model: model.clone(),
                error: GatewayError::Network(format!(
                    "no gateway registered for provider {}",
                    model.provider_key()
                )),
            });
        }
    };

    match ctx.invoke_cached(&gateway, model, &prompt).await {
        Ok(raw) => PairOutcome::Annotated {
            cluster: cluster.clone(),
            model_index,
            annotation: parse_annotation(model, &raw, markers),
        },
        Err(error) => PairOutcome::GatewayFailed(CollectFailure {
            cluster: cluster.clone(),
            model: model.clone(),
            error,
        }),
    }
}

/// Normalize a raw response into an annotation. An empty or unusable
/// response yields the sentinel label rather than an error.
pub fn parse_annotation(model: &ModelSpec, raw: &str, markers: &MarkerSet) -> InitialAnnotation {
    let label = extract_label(raw).unwrap_or_else(|| UNPARSEABLE_LABEL.to_string());
    let reasoning = truncate(raw.trim(), REASONING_MAX_CHARS);
    let cited_genes = cited_genes(raw, markers);

    InitialAnnotation {
        model: model.clone(),
        label,
        reasoning,
        confidence: None,
        cited_genes,
    }
}

/// Pull the label out of a raw response: skip code fences and blank lines,
/// take the first content line, strip list markers, `Cluster N:` prefixes,
/// quotes, and trailing punctuation.
pub fn extract_label(raw: &str) -> Option<String> {
    for line in raw.lines() {
        let mut line = line.trim();
        if line.is_empty() || line.starts_with("```") {
            continue;
        }
        line = line.trim_start_matches(['-', '*', '#']).trim();

        // "Cluster 3: T cells" → "T cells"; also bare "3: T cells".
        if let Some((head, rest)) = line.split_once(':') {
            let head_trimmed = head.trim();
            let is_cluster_prefix = head_trimmed
                .strip_prefix("Cluster")
                .or_else(|| head_trimmed.strip_prefix("cluster"))
                .map(|tail| tail.trim().chars().all(|c| c.is_ascii_digit()))
                .unwrap_or_else(|| head_trimmed.chars().all(|c| c.is_ascii_digit()));
            if is_cluster_prefix {
                line = rest.trim();
            }
        }

        let mut cleaned = line;
        loop {
            let next = cleaned
                .trim_matches(['"', '\'', '`'])
                .trim_end_matches(['.', ','])
                .trim();
            if next == cleaned {
                break;
            }
            cleaned = next;
        }
        if cleaned.is_empty() {
            continue;
        }
        return Some(cleaned.to_string());
    }
    None
}

/// Marker genes from the cluster's set that the response mentions.
fn cited_genes(raw: &str, markers: &MarkerSet) -> Vec<String> {
    let upper = raw.to_ascii_uppercase();
    markers
        .markers()
        .iter()
        .filter(|m| upper.contains(&m.gene.to_ascii_uppercase()))
        .map(|m| m.gene.clone())
        .collect()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelSpec {
        ModelSpec::new("openai", "gpt-4o")
    }

    fn markers() -> MarkerSet {
        MarkerSet::from_genes(["CD3D", "CD3E", "GNLY"])
    }

    #[test]
    fn test_extract_plain_label() {
        assert_eq!(extract_label("T cells\nBecause CD3D."), Some("T cells".to_string()));
    }

    #[test]
    fn test_extract_strips_cluster_prefix() {
        assert_eq!(extract_label("Cluster 3: NK cells"), Some("NK cells".to_string()));
        assert_eq!(extract_label("3: NK cells"), Some("NK cells".to_string()));
    }

    #[test]
    fn test_extract_preserves_colon_in_label_body() {
        // A colon whose head is not a cluster index belongs to the label line.
        assert_eq!(
            extract_label("Answer: T cells"),
            Some("Answer: T cells".to_string())
        );
    }

    #[test]
    fn test_extract_skips_fences_and_quotes() {
        assert_eq!(
            extract_label("```\n\"Regulatory T cells\".\n```"),
            Some("Regulatory T cells".to_string())
        );
    }

    #[test]
    fn test_extract_list_marker() {
        assert_eq!(extract_label("- B cells"), Some("B cells".to_string()));
    }

    #[test]
    fn test_unparseable_yields_sentinel() {
        let ann = parse_annotation(&model(), "   \n\n", &markers());
        assert_eq!(ann.label, UNPARSEABLE_LABEL);
        assert!(!ann.is_parsed());
    }

    #[test]
    fn test_cited_genes_detected() {
        let ann = parse_annotation(
            &model(),
            "T cells\nCD3D and cd3e are decisive markers.",
            &markers(),
        );
        assert_eq!(ann.cited_genes, vec!["CD3D", "CD3E"]);
        assert!(ann.is_parsed());
    }

    #[test]
    fn test_reasoning_truncated() {
        let long = "T cells\n".to_string() + &"x".repeat(2000);
        let ann = parse_annotation(&model(), &long, &markers());
        assert!(ann.reasoning.chars().count() <= REASONING_MAX_CHARS + 1);
        assert!(ann.reasoning.ends_with('…'));
    }
}
