//! Deterministic quality gate. No model calls: scores are term-overlap
//! arithmetic over the answer, the query, and the cited evidence, so the same
//! inputs always produce the same verdict.

use std::collections::HashSet;

use docreason_protocol::QualityMetrics;

use crate::config::EvaluatorConfig;
use crate::evidence::EvidencePool;

pub(crate) fn evaluate(
    query: &str,
    answer_markdown: &str,
    citations: &[String],
    evidence: &EvidencePool,
    config: &EvaluatorConfig,
) -> QualityMetrics {
    let valid_citations: Vec<&str> = citations
        .iter()
        .map(String::as_str)
        .filter(|citation| evidence.contains(citation))
        .collect();
    let grounding_failure =
        answer_markdown.trim().is_empty() || citations.is_empty() || valid_citations.is_empty();

    let query_alignment = query_alignment_score(query, answer_markdown);
    let citation_coverage = citation_coverage_score(answer_markdown, &valid_citations, evidence);
    let cross_document_coverage = cross_document_score(&valid_citations, evidence);

    let composite = if grounding_failure {
        0.0
    } else {
        let weight_sum =
            config.alignment_weight + config.citation_weight + config.cross_document_weight;
        ((query_alignment * config.alignment_weight
            + citation_coverage * config.citation_weight
            + cross_document_coverage * config.cross_document_weight)
            / weight_sum)
            .min(1.0)
    };

    QualityMetrics {
        composite,
        query_alignment,
        citation_coverage,
        cross_document_coverage,
        grounding_failure,
    }
}

/// Fraction of salient query terms present in the answer text.
fn query_alignment_score(query: &str, answer: &str) -> f64 {
    let terms = salient_terms(query);
    if terms.is_empty() {
        return 0.0;
    }
    let answer_lower = answer.to_lowercase();
    let matched = terms
        .iter()
        .filter(|term| answer_lower.contains(term.as_str()))
        .count();
    (matched as f64 / terms.len() as f64).min(1.0)
}

/// Fraction of answer sentences traceable to at least one cited node's text.
/// Sentences without salient terms (headings, connectives) are skipped.
fn citation_coverage_score(answer: &str, valid_citations: &[&str], evidence: &EvidencePool) -> f64 {
    let cited_texts: Vec<String> = valid_citations
        .iter()
        .filter_map(|citation| evidence.get(citation))
        .map(|item| format!("{} {}", item.title, item.text).to_lowercase())
        .collect();
    if cited_texts.is_empty() {
        return 0.0;
    }

    let mut sentences = 0usize;
    let mut traceable = 0usize;
    for sentence in split_sentences(answer) {
        let terms = salient_terms(&sentence);
        if terms.is_empty() {
            continue;
        }
        sentences += 1;
        let supported = cited_texts.iter().any(|text| {
            terms
                .iter()
                .any(|term| text.contains(term.as_str()))
        });
        if supported {
            traceable += 1;
        }
    }
    if sentences == 0 {
        return 0.0;
    }
    traceable as f64 / sentences as f64
}

/// For evidence spanning several documents, the share of those documents the
/// citations actually draw on. Single-document evidence scores 1.0.
fn cross_document_score(valid_citations: &[&str], evidence: &EvidencePool) -> f64 {
    let evidence_docs = evidence.document_ids();
    if evidence_docs.len() < 2 {
        return 1.0;
    }
    let cited_docs: HashSet<&str> = valid_citations
        .iter()
        .filter_map(|citation| evidence.get(citation))
        .map(|item| item.document_id.as_str())
        .collect();
    (cited_docs.len() as f64 / evidence_docs.len() as f64).min(1.0)
}

/// Deterministic confidence estimate used by `self_check` steps: how much
/// evidence exists and how well it covers the query terms.
pub(crate) fn evidence_confidence(query: &str, evidence: &EvidencePool) -> f64 {
    if evidence.is_empty() {
        return 0.15;
    }
    let volume_bonus = (evidence.len() as f64 * 0.08).min(0.40);
    let terms = salient_terms(query);
    let coverage = if terms.is_empty() {
        0.0
    } else {
        let pooled = evidence
            .items()
            .iter()
            .map(|item| format!("{} {}", item.title, item.text).to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        let matched = terms
            .iter()
            .filter(|term| pooled.contains(term.as_str()))
            .count();
        matched as f64 / terms.len() as f64
    };
    (0.15 + volume_bonus + coverage * 0.35).min(0.92)
}

/// Human-readable gap list handed back to the planner when a draft is
/// rejected and the run re-enters retrieval.
pub(crate) fn describe_gaps(query: &str, answer: &str, metrics: &QualityMetrics) -> Vec<String> {
    let mut gaps = Vec::new();
    if metrics.grounding_failure {
        gaps.push("the previous answer cited no verifiable evidence nodes".to_string());
    }
    if metrics.query_alignment < 0.5 {
        let answer_lower = answer.to_lowercase();
        let missing: Vec<String> = salient_terms(query)
            .into_iter()
            .filter(|term| !answer_lower.contains(term.as_str()))
            .take(5)
            .collect();
        if missing.is_empty() {
            gaps.push("the previous answer did not address the query terms".to_string());
        } else {
            gaps.push(format!(
                "the previous answer did not address: {}",
                missing.join(", ")
            ));
        }
    }
    if metrics.citation_coverage < 0.5 {
        gaps.push("claims in the previous answer were not supported by the cited nodes".to_string());
    }
    gaps
}

/// Salient tokens: lowercased, stopwords removed, short tokens dropped
/// except pure numbers (so figures like "15" still count).
pub(crate) fn salient_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        let token = token.trim().to_lowercase();
        if token.is_empty() || is_stopword(&token) {
            continue;
        }
        let numeric = token.chars().all(|c| c.is_ascii_digit());
        if (token.len() > 2 || numeric) && !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn is_stopword(token: &str) -> bool {
    matches!(
        token,
        "the" | "and"
            | "for"
            | "are"
            | "was"
            | "were"
            | "how"
            | "what"
            | "when"
            | "where"
            | "which"
            | "who"
            | "why"
            | "with"
            | "about"
            | "that"
            | "this"
            | "these"
            | "those"
            | "from"
            | "into"
            | "their"
            | "they"
            | "them"
            | "does"
            | "did"
            | "has"
            | "have"
            | "had"
            | "will"
            | "would"
            | "could"
            | "should"
            | "can"
            | "not"
            | "but"
            | "you"
            | "your"
    )
}
