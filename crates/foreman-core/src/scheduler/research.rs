//! Research-trigger heuristics.
//!
//! Advisory only: a signal never holds a task back from dispatch. Each rule
//! contributes a fixed weight; the sum is capped at 1.0.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ResearchConfig;
use crate::domain::{Task, TaskId};

const RESEARCH_KEYWORDS: &[&str] = &["research", "investigate", "explore", "evaluate", "spike"];
const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture",
    "design",
    "migration",
    "migrate",
    "refactor",
    "redesign",
];

const RESEARCH_KEYWORD_WEIGHT: f64 = 0.4;
const ARCHITECTURE_WEIGHT: f64 = 0.25;
const COMPLEXITY_WEIGHT: f64 = 0.3;
const FAILURE_WEIGHT: f64 = 0.35;

const COMPLEX_THRESHOLD: u8 = 8;
const FAILURE_THRESHOLD: u32 = 2;

/// "Deeper investigation recommended" for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchSignal {
    pub task_id: TaskId,
    pub confidence: f64,
    pub hints: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResearchAssessment {
    pub confidence: f64,
    pub hints: Vec<String>,
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn first_match<'a>(words: &[String], table: &'a [&'a str]) -> Option<&'a str> {
    table
        .iter()
        .copied()
        .find(|keyword| words.iter().any(|w| w == keyword))
}

/// Scores a task against every rule. Pure.
pub fn assess(task: &Task) -> ResearchAssessment {
    let mut confidence = 0.0;
    let mut hints = Vec::new();

    let title = words(&task.title);
    let mut body = title.clone();
    body.extend(words(&task.description));

    if let Some(keyword) = first_match(&body, RESEARCH_KEYWORDS) {
        confidence += RESEARCH_KEYWORD_WEIGHT;
        hints.push(format!("mentions \"{keyword}\""));
    }
    if let Some(keyword) = first_match(&title, ARCHITECTURE_KEYWORDS) {
        confidence += ARCHITECTURE_WEIGHT;
        hints.push(format!("architecture-level title (\"{keyword}\")"));
    }
    if task.estimated_complexity >= COMPLEX_THRESHOLD {
        confidence += COMPLEXITY_WEIGHT;
        hints.push(format!("complexity {}", task.estimated_complexity));
    }
    let failures = task.failure_count();
    if failures >= FAILURE_THRESHOLD {
        confidence += FAILURE_WEIGHT;
        hints.push(format!("{failures} failed attempts"));
    }

    ResearchAssessment {
        confidence: f64::min(confidence, 1.0),
        hints,
    }
}

/// Applies the threshold and the per-task cooldown on top of [`assess`].
#[derive(Debug)]
pub struct ResearchTrigger {
    config: ResearchConfig,
    last_signal: HashMap<TaskId, DateTime<Utc>>,
}

impl ResearchTrigger {
    pub fn new(config: ResearchConfig) -> Self {
        Self {
            config,
            last_signal: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, task: &Task, now: DateTime<Utc>) -> Option<ResearchSignal> {
        if let Some(last) = self.last_signal.get(&task.id)
            && now - *last < self.config.cooldown()
        {
            return None;
        }
        let assessment = assess(task);
        if assessment.hints.is_empty() || assessment.confidence < self.config.threshold {
            return None;
        }
        self.last_signal.insert(task.id.clone(), now);
        Some(ResearchSignal {
            task_id: task.id.clone(),
            confidence: assessment.confidence,
            hints: assessment.hints,
            at: now,
        })
    }
}
