//! Agreement evaluation — label histogram, consensus proportion, Shannon
//! entropy, and the controversy predicate.
//!
//! Both operations are pure: no side effects, no external calls. They are
//! re-run whenever a cluster's label set changes (after the initial round and
//! after every discussion round).

use serde::{Deserialize, Serialize};

use crate::types::{AgreementMetrics, UNPARSEABLE_LABEL};

/// Fixed normalization rule applied before labels are compared: trim and
/// ASCII-lowercase. Two labels are the same answer iff their normalized
/// forms are byte-equal.
pub fn normalize_label(label: &str) -> String {
    label.trim().to_ascii_lowercase()
}

/// Compute the agreement distribution over a label set.
///
/// The plurality label is the histogram key with the maximum count; ties are
/// broken by first-encountered order, which follows the configured model
/// order upstream. The sentinel unparseable label counts toward totals and
/// entropy but only wins the plurality when no parseable label exists.
pub fn evaluate(labels: &[String]) -> AgreementMetrics {
    // Histogram in first-encountered order: (normalized, display, count).
    let mut histogram: Vec<(String, String, usize)> = Vec::new();
    for label in labels {
        let norm = normalize_label(label);
        match histogram.iter_mut().find(|(n, _, _)| *n == norm) {
            Some((_, _, count)) => *count += 1,
            None => histogram.push((norm, label.trim().to_string(), 1)),
        }
    }

    let total = labels.len();
    let (plurality_label, max_count) = plurality(&histogram);

    let consensus_proportion = if total == 0 {
        0.0
    } else {
        max_count as f64 / total as f64
    };

    let mut shannon_entropy = 0.0;
    for (_, _, count) in &histogram {
        let p = *count as f64 / total as f64;
        if p > 0.0 {
            shannon_entropy -= p * p.log2();
        }
    }
    // A single-bucket distribution yields -0.0; clamp for clean reporting.
    shannon_entropy = shannon_entropy.max(0.0);

    AgreementMetrics {
        plurality_label,
        consensus_proportion,
        shannon_entropy,
        label_histogram: histogram
            .into_iter()
            .map(|(norm, _, count)| (norm, count))
            .collect(),
        total_labels: total,
    }
}

/// Pick the winning label: strict maximum over counts in first-seen order,
/// preferring parseable labels over the sentinel.
fn plurality(histogram: &[(String, String, usize)]) -> (String, usize) {
    let mut best: Option<(&str, usize)> = None;
    for (norm, display, count) in histogram {
        if norm == UNPARSEABLE_LABEL {
            continue;
        }
        if best.map_or(true, |(_, best_count)| *count > best_count) {
            best = Some((display.as_str(), *count));
        }
    }
    match best {
        Some((label, count)) => (label.to_string(), count),
        // Nothing parseable at all: the sentinel (or emptiness) wins.
        None => histogram
            .first()
            .map(|(_, display, count)| (display.clone(), *count))
            .unwrap_or((String::new(), 0)),
    }
}

/// How the two controversy thresholds combine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControversyRule {
    /// Controversial when either bar fails (reference behavior).
    #[default]
    Either,
    /// Controversial only when both bars fail.
    Both,
}

/// Classification of a cluster's agreement state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Controversy {
    Settled,
    Controversial,
}

impl std::fmt::Display for Controversy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Settled => write!(f, "settled"),
            Self::Controversial => write!(f, "controversial"),
        }
    }
}

/// Controversy predicate over agreement metrics and configured thresholds.
pub fn classify(
    metrics: &AgreementMetrics,
    controversy_threshold: f64,
    entropy_threshold: f64,
    rule: ControversyRule,
) -> Controversy {
    let low_consensus = metrics.consensus_proportion < controversy_threshold;
    let high_entropy = metrics.shannon_entropy > entropy_threshold;
    let controversial = match rule {
        ControversyRule::Either => low_consensus || high_entropy,
        ControversyRule::Both => low_consensus && high_entropy,
    };
    if controversial {
        Controversy::Controversial
    } else {
        Controversy::Settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_two_thirds_split() {
        let metrics = evaluate(&labels(&["T cell", "T cell", "B cell"]));
        assert_eq!(metrics.plurality_label, "T cell");
        assert!((metrics.consensus_proportion - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.shannon_entropy - 0.9182958340544896).abs() < 1e-9);
        assert_eq!(
            classify(&metrics, 0.7, 1.0, ControversyRule::Either),
            Controversy::Controversial
        );
    }

    #[test]
    fn test_unanimous() {
        let metrics = evaluate(&labels(&["NK cell", "NK cell", "NK cell"]));
        assert_eq!(metrics.plurality_label, "NK cell");
        assert!((metrics.consensus_proportion - 1.0).abs() < f64::EPSILON);
        assert_eq!(metrics.shannon_entropy, 0.0);
        assert!(metrics.is_unanimous());
        assert_eq!(
            classify(&metrics, 0.7, 1.0, ControversyRule::Either),
            Controversy::Settled
        );
    }

    #[test]
    fn test_entropy_zero_iff_unanimous() {
        let split = evaluate(&labels(&["A", "A", "B"]));
        assert!(split.shannon_entropy > 0.0);
        assert!(split.consensus_proportion < 1.0);

        let unanimous = evaluate(&labels(&["A", "a ", "A"]));
        assert_eq!(unanimous.shannon_entropy, 0.0);
        assert!(unanimous.is_unanimous());
    }

    #[test]
    fn test_normalization_merges_case_and_whitespace() {
        let metrics = evaluate(&labels(&["T cells", " t cells", "T CELLS"]));
        assert_eq!(metrics.label_histogram.len(), 1);
        assert_eq!(metrics.label_histogram[0], ("t cells".to_string(), 3));
        // Display form is the first-encountered spelling.
        assert_eq!(metrics.plurality_label, "T cells");
    }

    #[test]
    fn test_tie_broken_by_first_encounter() {
        let metrics = evaluate(&labels(&["B cell", "T cell", "T cell", "B cell"]));
        assert_eq!(metrics.plurality_label, "B cell");
        assert!((metrics.consensus_proportion - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sentinel_never_beats_parseable_labels() {
        let metrics = evaluate(&labels(&["unparseable", "unparseable", "T cell"]));
        assert_eq!(metrics.plurality_label, "T cell");
        assert!((metrics.consensus_proportion - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_sentinel_falls_back_to_sentinel() {
        let metrics = evaluate(&labels(&["unparseable", "unparseable"]));
        assert_eq!(metrics.plurality_label, "unparseable");
        assert!((metrics.consensus_proportion - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_proportion_bounds() {
        // Fully dispersed: proportion is exactly 1/N.
        let metrics = evaluate(&labels(&["A", "B", "C", "D"]));
        assert!((metrics.consensus_proportion - 0.25).abs() < f64::EPSILON);
        assert!((metrics.shannon_entropy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_or_rule_triggers_on_either_bar() {
        // High proportion but high entropy: OR flags, AND does not.
        let metrics = evaluate(&labels(&["A", "A", "A", "B", "C"]));
        assert!(metrics.consensus_proportion >= 0.6);
        assert!(metrics.shannon_entropy > 1.0);
        assert_eq!(
            classify(&metrics, 0.5, 1.0, ControversyRule::Either),
            Controversy::Controversial
        );
        assert_eq!(
            classify(&metrics, 0.5, 1.0, ControversyRule::Both),
            Controversy::Settled
        );
    }

    #[test]
    fn test_threshold_boundaries_are_strict() {
        let metrics = evaluate(&labels(&["A", "A", "B", "B"]));
        // proportion == threshold is settled (strict <); entropy == threshold
        // is settled (strict >).
        assert_eq!(
            classify(&metrics, 0.5, 1.0, ControversyRule::Either),
            Controversy::Settled
        );
        assert_eq!(
            classify(&metrics, 0.51, 1.0, ControversyRule::Either),
            Controversy::Controversial
        );
    }
}
