//! Discussion orchestrator — bounded deliberation rounds for controversial
//! clusters, driven by a designated arbiter model.
//!
//! Rounds within a cluster are inherently sequential (each one sees the prior
//! transcript); distinct clusters are independent and are discussed
//! concurrently by the engine. The single retry permitted anywhere in the
//! engine lives here: a failed round is attempted exactly twice before the
//! cluster falls through to exhaustion.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::annotate::{extract_label, CallContext};
use crate::cache;
use crate::consensus::{self, Controversy, ControversyRule};
use crate::discussion::state::{DiscussionLog, DiscussionPhase, DiscussionRound, Position};
use crate::prompts;
use crate::types::{
    AgreementMetrics, ClusterId, InitialAnnotation, MarkerSet, ModelSpec, UNPARSEABLE_LABEL,
};

/// Tunables for a deliberation run, shared across clusters.
#[derive(Debug, Clone)]
pub struct DiscussionSettings {
    pub max_rounds: u32,
    pub controversy_threshold: f64,
    pub entropy_threshold: f64,
    pub rule: ControversyRule,
    pub species: String,
    pub tissue: Option<String>,
    pub top_genes: usize,
}

/// Result of deliberating one cluster.
#[derive(Debug, Clone)]
pub struct DiscussionOutcome {
    pub log: DiscussionLog,
    /// Label accepted at termination (synthesis, or fallback on failure).
    pub final_label: String,
    /// Agreement metrics over the terminal label set.
    pub final_metrics: AgreementMetrics,
}

/// Run the bounded deliberation loop for one controversial cluster.
///
/// Termination is guaranteed: every pass either resolves, exhausts, or
/// advances the round counter toward `max_rounds`.
pub async fn discuss_cluster(
    ctx: &CallContext<'_>,
    arbiter: &ModelSpec,
    settings: &DiscussionSettings,
    cluster: &ClusterId,
    markers: &MarkerSet,
    initial: &[InitialAnnotation],
    initial_metrics: &AgreementMetrics,
    cancel: &CancellationToken,
) -> DiscussionOutcome {
    let mut log = DiscussionLog::new(cluster.clone(), settings.max_rounds);
    let mut final_metrics = initial_metrics.clone();
    // Fallback while no round has synthesized anything.
    let mut final_label = initial_metrics.plurality_label.clone();

    let positions: Vec<Position> = initial
        .iter()
        .map(|a| Position::new(a.model.normalized_id(), a.label.clone(), a.reasoning.clone()))
        .collect();
    let initial_labels: Vec<String> = initial.iter().map(|a| a.label.clone()).collect();

    info!(cluster = %cluster, max_rounds = settings.max_rounds, "starting discussion");
    if log
        .transition(DiscussionPhase::InDiscussion, "cluster flagged controversial")
        .is_err()
    {
        // Fresh logs always start Pending; unreachable in practice.
        return DiscussionOutcome {
            log,
            final_label,
            final_metrics,
        };
    }

    for round in 1..=settings.max_rounds {
        if cancel.is_cancelled() {
            let _ = log.transition(DiscussionPhase::Exhausted, "run cancelled");
            warn!(cluster = %cluster, round, "discussion cancelled");
            break;
        }

        let prompt = prompts::discussion_prompt(
            cluster.as_str(),
            markers.top(settings.top_genes),
            &settings.species,
            settings.tissue.as_deref(),
            &positions,
            &log.rounds,
            round,
        );

        let raw = match invoke_arbiter_once_retried(ctx, arbiter, &prompt).await {
            Some(raw) => raw,
            None => {
                log.record_failed_round(round);
                let _ = log.transition(
                    DiscussionPhase::Exhausted,
                    "arbiter call failed after retry",
                );
                warn!(cluster = %cluster, round, "round failed twice, accepting best label so far");
                break;
            }
        };

        let synthesized_label =
            extract_label(&raw).unwrap_or_else(|| UNPARSEABLE_LABEL.to_string());
        let previous_synthesis = log.last_synthesis().map(consensus::normalize_label);

        log.append_round(DiscussionRound {
            round,
            positions: positions.clone(),
            synthesized_label: synthesized_label.clone(),
            synthesized_reasoning: raw.trim().to_string(),
        });
        final_label = synthesized_label.clone();

        // The arbiter's synthesis joins the prior positions as one more vote.
        let mut labels = initial_labels.clone();
        labels.push(synthesized_label.clone());
        final_metrics = consensus::evaluate(&labels);

        let classification = consensus::classify(
            &final_metrics,
            settings.controversy_threshold,
            settings.entropy_threshold,
            settings.rule,
        );
        debug!(
            cluster = %cluster,
            round,
            label = %synthesized_label,
            proportion = final_metrics.consensus_proportion,
            entropy = final_metrics.shannon_entropy,
            %classification,
            "round complete"
        );

        if classification == Controversy::Settled {
            let _ = log.transition(DiscussionPhase::Resolved, "agreement threshold met");
            break;
        }
        if previous_synthesis.as_deref() == Some(&consensus::normalize_label(&synthesized_label)) {
            // Stable synthesis across consecutive rounds: more rounds cannot help.
            let _ = log.transition(DiscussionPhase::Resolved, "synthesis stable across rounds");
            break;
        }
        if round == settings.max_rounds {
            let _ = log.transition(
                DiscussionPhase::Exhausted,
                "round cap reached, accepting last synthesis",
            );
        }
    }

    if !log.is_complete() {
        // Loop exited without a terminal transition (cancelled before round 1).
        let _ = log.transition(DiscussionPhase::Exhausted, "no rounds executed");
    }

    info!(
        cluster = %cluster,
        phase = %log.phase,
        rounds = log.rounds_consumed(),
        label = %final_label,
        "discussion finished"
    );
    DiscussionOutcome {
        log,
        final_label,
        final_metrics,
    }
}

/// Invoke the arbiter for one round, retrying exactly once on gateway error.
async fn invoke_arbiter_once_retried(
    ctx: &CallContext<'_>,
    arbiter: &ModelSpec,
    prompt: &str,
) -> Option<String> {
    let gateway = ctx.registry.get(&arbiter.provider_key())?;

    for attempt in 0..2 {
        match ctx.invoke_cached(&gateway, arbiter, prompt).await {
            Ok(raw) => return Some(raw),
            Err(e) => {
                warn!(
                    arbiter = %arbiter,
                    attempt,
                    error = %e,
                    fingerprint = %cache::fingerprint(&arbiter.normalized_id(), prompt),
                    "arbiter invocation failed"
                );
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SingleFlight;
    use crate::gateway::{GatewayError, GatewayRegistry, ModelGateway};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Gateway returning scripted responses in order, then repeating the last.
    struct ScriptedGateway {
        script: Mutex<Vec<Result<String, GatewayError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGateway {
        fn new(script: Vec<Result<String, GatewayError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn invoke(&self, _model: &str, _prompt: &str) -> Result<String, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn setup(
        script: Vec<Result<String, GatewayError>>,
    ) -> (GatewayRegistry, Arc<ScriptedGateway>) {
        let gateway = ScriptedGateway::new(script);
        let mut registry = GatewayRegistry::new();
        registry.register("arbiter", gateway.clone());
        (registry, gateway)
    }

    fn settings(max_rounds: u32) -> DiscussionSettings {
        DiscussionSettings {
            max_rounds,
            controversy_threshold: 0.7,
            entropy_threshold: 1.0,
            rule: ControversyRule::Either,
            species: "human".to_string(),
            tissue: None,
            top_genes: 10,
        }
    }

    fn annotation(provider: &str, label: &str) -> InitialAnnotation {
        InitialAnnotation {
            model: ModelSpec::new(provider, "m"),
            label: label.to_string(),
            reasoning: "markers".to_string(),
            confidence: None,
            cited_genes: vec![],
        }
    }

    fn split_initial() -> Vec<InitialAnnotation> {
        vec![
            annotation("a", "T cells"),
            annotation("b", "NK cells"),
            annotation("c", "B cells"),
        ]
    }

    async fn run(
        registry: &GatewayRegistry,
        settings: &DiscussionSettings,
        initial: &[InitialAnnotation],
    ) -> DiscussionOutcome {
        let single_flight = SingleFlight::new();
        let ctx = CallContext {
            registry,
            cache: None,
            single_flight: &single_flight,
            timeout: Duration::from_secs(5),
        };
        let labels: Vec<String> = initial.iter().map(|a| a.label.clone()).collect();
        let metrics = consensus::evaluate(&labels);
        discuss_cluster(
            &ctx,
            &ModelSpec::new("arbiter", "judge"),
            settings,
            &ClusterId::from("2"),
            &MarkerSet::from_genes(["CD3D", "CD3E"]),
            initial,
            &metrics,
            &CancellationToken::new(),
        )
        .await
    }

    #[tokio::test]
    async fn test_stability_rule_resolves_after_two_identical_syntheses() {
        // 4-way disagreement stays controversial by metrics, so only the
        // stability rule can resolve it.
        let (registry, gateway) = setup(vec![Ok("Regulatory T cells".to_string())]);
        let outcome = run(&registry, &settings(5), &split_initial()).await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Resolved);
        assert_eq!(outcome.log.rounds_consumed(), 2);
        assert_eq!(outcome.final_label, "Regulatory T cells");
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_accepts_last_synthesis() {
        let (registry, _) = setup(vec![
            Ok("Label one".to_string()),
            Ok("Label two".to_string()),
            Ok("Label three".to_string()),
        ]);
        let outcome = run(&registry, &settings(3), &split_initial()).await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Exhausted);
        assert_eq!(outcome.log.rounds_consumed(), 3);
        assert_eq!(outcome.final_label, "Label three");
        let rounds: Vec<u32> = outcome.log.rounds.iter().map(|r| r.round).collect();
        assert_eq!(rounds, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_settled_metrics_resolve_first_round() {
        // Two of three initial labels agree; the arbiter's matching vote
        // pushes the proportion to 3/4 with entropy ~0.811, under both bars.
        let initial = vec![
            annotation("a", "T cells"),
            annotation("b", "T cells"),
            annotation("c", "B cells"),
        ];
        let (registry, gateway) = setup(vec![Ok("T cells".to_string())]);
        let outcome = run(&registry, &settings(5), &initial).await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Resolved);
        assert_eq!(outcome.log.rounds_consumed(), 1);
        assert_eq!(gateway.calls(), 1);
        assert!((outcome.final_metrics.consensus_proportion - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_gateway_error_retried_once_then_succeeds() {
        let (registry, gateway) = setup(vec![
            Err(GatewayError::Network("connection reset".to_string())),
            Ok("T cells".to_string()),
        ]);
        let initial = vec![
            annotation("a", "T cells"),
            annotation("b", "T cells"),
            annotation("c", "B cells"),
        ];
        let outcome = run(&registry, &settings(3), &initial).await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Resolved);
        assert_eq!(gateway.calls(), 2);
        assert!(outcome.log.failed_rounds.is_empty());
    }

    #[tokio::test]
    async fn test_double_failure_exhausts_with_fallback_label() {
        let (registry, gateway) = setup(vec![Err(GatewayError::Timeout(
            Duration::from_secs(30),
        ))]);
        let initial = vec![
            annotation("a", "T cells"),
            annotation("b", "T cells"),
            annotation("c", "B cells"),
        ];
        let outcome = run(&registry, &settings(3), &initial).await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Exhausted);
        assert_eq!(outcome.log.rounds_consumed(), 0);
        assert_eq!(outcome.log.failed_rounds, vec![1]);
        // Falls back to the initial plurality.
        assert_eq!(outcome.final_label, "T cells");
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_round() {
        let (registry, gateway) = setup(vec![Ok("T cells".to_string())]);
        let single_flight = SingleFlight::new();
        let ctx = CallContext {
            registry: &registry,
            cache: None,
            single_flight: &single_flight,
            timeout: Duration::from_secs(5),
        };
        let initial = split_initial();
        let labels: Vec<String> = initial.iter().map(|a| a.label.clone()).collect();
        let metrics = consensus::evaluate(&labels);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = discuss_cluster(
            &ctx,
            &ModelSpec::new("arbiter", "judge"),
            &settings(3),
            &ClusterId::from("2"),
            &MarkerSet::from_genes(["CD3D"]),
            &initial,
            &metrics,
            &cancel,
        )
        .await;

        assert_eq!(outcome.log.phase, DiscussionPhase::Exhausted);
        assert_eq!(gateway.calls(), 0);
        assert_eq!(outcome.final_label, "T cells");
    }
}
