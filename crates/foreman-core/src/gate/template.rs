//! Template-likelihood scoring.
//!
//! `score = min(1, 0.5 * (1 - unique_ratio) + 0.3 * repeated_trigram_ratio
//!        + 0.6 * min(1, placeholder_hits))`
//!
//! A single placeholder phrase is enough to fail the strict threshold, and
//! content shorter than `min_tokens` words scores 1.0 outright.
//!
//! Citation markers and URLs are stripped before tokenizing. Content with at
//! least `min_citations` citations and an evidence heading is judged against
//! the relaxed threshold.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::GateConfig;

const UNIQUE_WEIGHT: f64 = 0.5;
const TRIGRAM_WEIGHT: f64 = 0.3;
const PLACEHOLDER_WEIGHT: f64 = 0.6;
const PLACEHOLDER_SATURATION: f64 = 1.0;

static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d{1,3}\]").expect("valid regex"));
static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s)\]>]+").expect("valid regex"));
static EVIDENCE_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^\s*(?:#{1,6}\s*)?(?:evidence|sources|references|citations)\s*:?\s*$")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateAnalysis {
    pub score: f64,
    pub unique_ratio: f64,
    pub repeated_trigram_ratio: f64,
    pub placeholder_hits: usize,
    /// Words left after citations and URLs are stripped.
    pub tokens: usize,
    pub citations: usize,
    pub evidence_section: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateVerdict {
    pub analysis: TemplateAnalysis,
    pub threshold: f64,
    /// Whether the relaxed threshold applied.
    pub grounded: bool,
}

impl TemplateVerdict {
    pub fn accepted(&self) -> bool {
        self.analysis.score <= self.threshold
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn count_citations(content: &str) -> usize {
    CITATION.find_iter(content).count() + URL.find_iter(content).count()
}

pub fn has_evidence_section(content: &str) -> bool {
    EVIDENCE_HEADING.is_match(content)
}

pub fn analyze(content: &str, banned_placeholders: &[String]) -> TemplateAnalysis {
    let citations = count_citations(content);
    let evidence_section = has_evidence_section(content);

    let without_urls = URL.replace_all(content, " ");
    let stripped = CITATION.replace_all(&without_urls, " ");
    let words = tokens(&stripped);

    let lowered = content.to_lowercase();
    let placeholder_hits: usize = banned_placeholders
        .iter()
        .map(|p| p.trim().to_lowercase())
        .filter(|p| !p.is_empty())
        .map(|p| lowered.matches(p.as_str()).count())
        .sum();
    let placeholder_part = (placeholder_hits as f64 / PLACEHOLDER_SATURATION).min(1.0);

    if words.is_empty() {
        return TemplateAnalysis {
            score: (UNIQUE_WEIGHT + TRIGRAM_WEIGHT + PLACEHOLDER_WEIGHT * placeholder_part)
                .min(1.0),
            unique_ratio: 0.0,
            repeated_trigram_ratio: 1.0,
            placeholder_hits,
            tokens: 0,
            citations,
            evidence_section,
        };
    }

    let unique: HashSet<&str> = words.iter().map(String::as_str).collect();
    let unique_ratio = unique.len() as f64 / words.len() as f64;

    let repeated_trigram_ratio = if words.len() < 3 {
        0.0
    } else {
        let trigrams: Vec<&[String]> = words.windows(3).collect();
        let distinct: HashSet<&[String]> = trigrams.iter().copied().collect();
        (trigrams.len() - distinct.len()) as f64 / trigrams.len() as f64
    };

    let score = (UNIQUE_WEIGHT * (1.0 - unique_ratio)
        + TRIGRAM_WEIGHT * repeated_trigram_ratio
        + PLACEHOLDER_WEIGHT * placeholder_part)
        .min(1.0);

    TemplateAnalysis {
        score,
        unique_ratio,
        repeated_trigram_ratio,
        placeholder_hits,
        tokens: words.len(),
        citations,
        evidence_section,
    }
}

pub fn evaluate(content: &str, config: &GateConfig) -> TemplateVerdict {
    let mut analysis = analyze(content, &config.banned_placeholders);
    if analysis.tokens < config.min_tokens {
        analysis.score = 1.0;
    }
    let grounded = analysis.citations >= config.min_citations && analysis.evidence_section;
    let threshold = if grounded {
        config.relaxed_template_threshold
    } else {
        config.template_threshold
    };
    TemplateVerdict {
        analysis,
        threshold,
        grounded,
    }
}
