//! Resource classification for admission control.
//!
//! Pure and table-driven: an explicit metadata hint wins, then expected
//! runtime, then complexity, then title keywords.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::Task;

pub const HEAVY_RUNTIME_MINUTES: f64 = 45.0;
pub const HEAVY_COMPLEXITY: u8 = 8;
pub const LIGHT_COMPLEXITY: u8 = 3;

const TITLE_KEYWORDS: &[(&str, ResourceProfile)] = &[
    ("retrain", ResourceProfile::Heavy),
    ("backfill", ResourceProfile::Heavy),
    ("bulk", ResourceProfile::Heavy),
    ("reindex", ResourceProfile::Heavy),
    ("docs", ResourceProfile::Light),
    ("documentation", ResourceProfile::Light),
    ("readme", ResourceProfile::Light),
    ("lint", ResourceProfile::Light),
    ("typo", ResourceProfile::Light),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceProfile {
    Light,
    Standard,
    Heavy,
}

impl ResourceProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceProfile::Light => "light",
            ResourceProfile::Standard => "standard",
            ResourceProfile::Heavy => "heavy",
        }
    }

    pub fn is_heavy(self) -> bool {
        self == ResourceProfile::Heavy
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "light" => Ok(ResourceProfile::Light),
            "standard" => Ok(ResourceProfile::Standard),
            "heavy" => Ok(ResourceProfile::Heavy),
            other => Err(format!("unknown resource profile: {other}")),
        }
    }
}

/// Which rule decided the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ClassificationSource {
    MetadataHint,
    ExpectedRuntime { minutes: f64 },
    Complexity { value: u8 },
    TitleKeyword { keyword: String },
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceClassification {
    pub profile: ResourceProfile,
    pub source: ClassificationSource,
}

impl ResourceClassification {
    fn new(profile: ResourceProfile, source: ClassificationSource) -> Self {
        Self { profile, source }
    }
}

pub fn classify(task: &Task) -> ResourceClassification {
    // An unparseable hint falls through to the heuristics.
    if let Some(profile) = task.resource_hint().and_then(|h| h.parse().ok()) {
        return ResourceClassification::new(profile, ClassificationSource::MetadataHint);
    }

    if let Some(minutes) = task.expected_runtime_minutes()
        && minutes >= HEAVY_RUNTIME_MINUTES
    {
        return ResourceClassification::new(
            ResourceProfile::Heavy,
            ClassificationSource::ExpectedRuntime { minutes },
        );
    }

    let complexity = task.estimated_complexity;
    if complexity >= HEAVY_COMPLEXITY {
        return ResourceClassification::new(
            ResourceProfile::Heavy,
            ClassificationSource::Complexity { value: complexity },
        );
    }
    if complexity <= LIGHT_COMPLEXITY {
        return ResourceClassification::new(
            ResourceProfile::Light,
            ClassificationSource::Complexity { value: complexity },
        );
    }

    let title = task.title.to_lowercase();
    let words: Vec<&str> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    for (keyword, profile) in TITLE_KEYWORDS {
        if words.contains(keyword) {
            return ResourceClassification::new(
                *profile,
                ClassificationSource::TitleKeyword {
                    keyword: (*keyword).to_string(),
                },
            );
        }
    }

    ResourceClassification::new(ResourceProfile::Standard, ClassificationSource::Default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskId, TaskStatus, meta};
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn task(title: &str, complexity: u8) -> Task {
        Task {
            id: TaskId::new("t"),
            title: title.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            estimated_complexity: complexity,
            created_at: Utc::now(),
            set_id: None,
            metadata: BTreeMap::new(),
        }
    }

    #[rstest]
    #[case::heavy_complexity("Wire the parser", 8, ResourceProfile::Heavy)]
    #[case::light_complexity("Wire the parser", 3, ResourceProfile::Light)]
    #[case::heavy_keyword("Backfill user rows", 5, ResourceProfile::Heavy)]
    #[case::light_keyword("Fix lint warnings", 5, ResourceProfile::Light)]
    #[case::docs("Update docs for CLI", 6, ResourceProfile::Light)]
    #[case::plain("Wire the parser", 5, ResourceProfile::Standard)]
    #[case::substring_does_not_count("Bulkhead pattern", 5, ResourceProfile::Standard)]
    fn classifies_by_heuristics(
        #[case] title: &str,
        #[case] complexity: u8,
        #[case] expected: ResourceProfile,
    ) {
        assert_eq!(classify(&task(title, complexity)).profile, expected);
    }

    #[test]
    fn complexity_wins_over_keywords() {
        let c = classify(&task("Update docs", 9));
        assert_eq!(c.profile, ResourceProfile::Heavy);
        assert_eq!(c.source, ClassificationSource::Complexity { value: 9 });
    }

    #[test]
    fn metadata_hint_wins_over_everything() {
        let mut t = task("Retrain model", 9);
        t.metadata.insert(meta::RESOURCE_PROFILE.into(), json!("Light"));
        let c = classify(&t);
        assert_eq!(c.profile, ResourceProfile::Light);
        assert_eq!(c.source, ClassificationSource::MetadataHint);
    }

    #[test]
    fn unknown_hint_falls_through() {
        let mut t = task("Retrain model", 5);
        t.metadata.insert(meta::RESOURCE_PROFILE.into(), json!("huge"));
        assert_eq!(
            classify(&t).source,
            ClassificationSource::TitleKeyword {
                keyword: "retrain".into()
            }
        );
    }

    #[test]
    fn long_runtime_is_heavy() {
        let mut t = task("Wire the parser", 4);
        t.metadata
            .insert(meta::EXPECTED_RUNTIME_MINUTES.into(), json!(90));
        let c = classify(&t);
        assert_eq!(c.profile, ResourceProfile::Heavy);
        assert_eq!(c.source, ClassificationSource::ExpectedRuntime { minutes: 90.0 });
    }
}
