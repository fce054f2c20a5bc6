//! Weighted fitness rubric over catalog metadata.
//!
//! Each criterion yields a fraction in `[0, 1]`; the rubric scales the
//! fractions by their weights so the total lands in `[0, MAX_SCORE]`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use trendscout_core::{CatalogResult, ScoreRecord, Verdict};
use uuid::Uuid;

pub const MAX_SCORE: f64 = 100.0;
pub const ACCEPT_THRESHOLD: f64 = 70.0;
pub const BORDERLINE_THRESHOLD: f64 = 40.0;

/// Weighted engagement at which popularity saturates.
pub const ENGAGEMENT_SATURATION: f64 = 10_000.0;
pub const DESCRIPTION_TARGET_CHARS: usize = 200;
pub const TAG_TARGET: usize = 5;
pub const FRESH_DAYS: i64 = 30;
pub const STALE_DAYS: i64 = 365;

pub fn verdict_for(total_score: f64) -> Verdict {
    if total_score >= ACCEPT_THRESHOLD {
        Verdict::Accept
    } else if total_score >= BORDERLINE_THRESHOLD {
        Verdict::Borderline
    } else {
        Verdict::Reject
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub total_score: f64,
    pub verdict: Verdict,
    pub breakdown: BTreeMap<String, f64>,
    pub notes: Vec<String>,
}

impl ScoreCard {
    pub fn into_record(self, result: &CatalogResult, created_at: DateTime<Utc>) -> ScoreRecord {
        ScoreRecord {
            id: Uuid::new_v4(),
            run_id: result.run_id,
            keyword: result.keyword.clone(),
            model_id: result.model_id.clone(),
            total_score: self.total_score,
            verdict: self.verdict,
            breakdown: self.breakdown,
            notes: self.notes,
            created_at,
        }
    }
}

pub trait Scorer: Send + Sync {
    fn score(&self, result: &CatalogResult) -> ScoreCard;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringRubric {
    pub popularity: f64,
    pub relevance: f64,
    pub license: f64,
    pub description: f64,
    pub tags: f64,
    pub recency: f64,
}

impl Default for ScoringRubric {
    fn default() -> Self {
        Self {
            popularity: 35.0,
            relevance: 25.0,
            license: 15.0,
            description: 10.0,
            tags: 5.0,
            recency: 10.0,
        }
    }
}

impl ScoringRubric {
    fn weight_sum(&self) -> f64 {
        [
            self.popularity,
            self.relevance,
            self.license,
            self.description,
            self.tags,
            self.recency,
        ]
        .iter()
        .map(|w| w.max(0.0))
        .sum()
    }
}

impl Scorer for ScoringRubric {
    fn score(&self, result: &CatalogResult) -> ScoreCard {
        let mut notes = Vec::new();
        let criteria = [
            ("popularity", self.popularity, popularity(result, &mut notes)),
            ("relevance", self.relevance, relevance(result, &mut notes)),
            ("license", self.license, license(result, &mut notes)),
            ("description", self.description, description(result, &mut notes)),
            ("tags", self.tags, tags(result, &mut notes)),
            ("recency", self.recency, recency(result, &mut notes)),
        ];

        let weight_sum = self.weight_sum();
        let mut breakdown = BTreeMap::new();
        for (name, weight, fraction) in criteria {
            let points = if weight_sum > 0.0 {
                round2(weight.max(0.0) / weight_sum * MAX_SCORE * fraction.clamp(0.0, 1.0))
            } else {
                0.0
            };
            breakdown.insert(name.to_string(), points);
        }

        let total_score = round2(breakdown.values().sum::<f64>().clamp(0.0, MAX_SCORE));
        ScoreCard {
            total_score,
            verdict: verdict_for(total_score),
            breakdown,
            notes,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn popularity(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    let stats = result.stats;
    let engagement = stats.downloads as f64
        + 2.0 * stats.likes as f64
        + 3.0 * stats.prints as f64
        + stats.collections as f64;
    if engagement < 50.0 {
        notes.push(format!("low engagement ({engagement:.0})"));
    }
    ((1.0 + engagement).ln() / (1.0 + ENGAGEMENT_SATURATION).ln()).min(1.0)
}

fn relevance(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    let terms: Vec<String> = result
        .keyword
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let haystack = format!("{} {}", result.title, result.tags.join(" ")).to_lowercase();
    let matched = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    if matched < terms.len() {
        notes.push(format!("matched {matched}/{} keyword terms", terms.len()));
    }
    matched as f64 / terms.len() as f64
}

fn license(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    let license = result.license.trim().to_lowercase();
    if license.is_empty() {
        notes.push("license not stated".to_string());
        return 0.5;
    }
    let tokens: Vec<&str> = license
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    let non_commercial = license.contains("noncommercial")
        || license.contains("non-commercial")
        || tokens.contains(&"nc");
    if non_commercial {
        notes.push(format!("non-commercial license: {}", result.license.trim()));
        0.2
    } else {
        1.0
    }
}

fn description(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    let chars = result.description.trim().chars().count();
    if chars == 0 {
        notes.push("no description".to_string());
    }
    (chars as f64 / DESCRIPTION_TARGET_CHARS as f64).min(1.0)
}

fn tags(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    if result.tags.is_empty() {
        notes.push("no tags".to_string());
    }
    (result.tags.len() as f64 / TAG_TARGET as f64).min(1.0)
}

/// Age is measured against the fetch time so rescoring a stored row is stable.
fn recency(result: &CatalogResult, notes: &mut Vec<String>) -> f64 {
    let Some(published_at) = result.published_at else {
        notes.push("publish date unknown".to_string());
        return 0.5;
    };
    let age_days = (result.fetched_at - published_at).num_days().max(0);
    if age_days <= FRESH_DAYS {
        1.0
    } else if age_days >= STALE_DAYS {
        notes.push(format!("published {age_days} days before fetch"));
        0.0
    } else {
        1.0 - (age_days - FRESH_DAYS) as f64 / (STALE_DAYS - FRESH_DAYS) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use trendscout_core::CatalogStats;

    fn fetched_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 12, 6, 0, 0).single().unwrap()
    }

    fn strong_result() -> CatalogResult {
        CatalogResult {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            keyword: "fidget toy".into(),
            model_id: "123456".into(),
            url: "https://makerworld.com/en/models/123456".into(),
            title: "Infinity Cube Fidget".into(),
            description: "x".repeat(240),
            creator: "cubeworks".into(),
            license: "Standard Digital File License".into(),
            tags: vec!["fidget".into(), "toy".into()],
            stats: CatalogStats {
                likes: 1200,
                downloads: 5400,
                prints: 800,
                collections: 300,
            },
            published_at: Some(fetched_at() - Duration::days(42)),
            raw: None,
            fetched_at: fetched_at(),
        }
    }

    fn weak_result() -> CatalogResult {
        CatalogResult {
            title: "Cable clip".into(),
            description: String::new(),
            license: "CC BY-NC 4.0".into(),
            tags: Vec::new(),
            stats: CatalogStats::default(),
            published_at: None,
            ..strong_result()
        }
    }

    #[test]
    fn verdict_cutoffs_are_inclusive() {
        assert_eq!(verdict_for(ACCEPT_THRESHOLD), Verdict::Accept);
        assert_eq!(verdict_for(ACCEPT_THRESHOLD - 0.01), Verdict::Borderline);
        assert_eq!(verdict_for(BORDERLINE_THRESHOLD), Verdict::Borderline);
        assert_eq!(verdict_for(BORDERLINE_THRESHOLD - 0.01), Verdict::Reject);
        assert_eq!(verdict_for(MAX_SCORE), Verdict::Accept);
        assert_eq!(verdict_for(0.0), Verdict::Reject);
    }

    #[test]
    fn strong_candidate_is_accepted() {
        let card = ScoringRubric::default().score(&strong_result());
        assert_eq!(card.verdict, Verdict::Accept);
        assert_eq!(card.breakdown["popularity"], 35.0);
        assert_eq!(card.breakdown["relevance"], 25.0);
        assert_eq!(card.breakdown["license"], 15.0);
        assert_eq!(card.breakdown["description"], 10.0);
        assert_eq!(card.breakdown["tags"], 2.0);
        assert_eq!(card.breakdown["recency"], 9.64);
        assert_eq!(card.total_score, 96.64);
        assert!(card.notes.is_empty());
    }

    #[test]
    fn weak_candidate_is_rejected_with_notes() {
        let card = ScoringRubric::default().score(&weak_result());
        assert_eq!(card.verdict, Verdict::Reject);
        assert_eq!(card.breakdown["popularity"], 0.0);
        assert_eq!(card.breakdown["relevance"], 0.0);
        assert_eq!(card.breakdown["license"], 3.0);
        assert_eq!(card.breakdown["recency"], 5.0);
        assert_eq!(card.total_score, 8.0);
        for expected in [
            "low engagement",
            "matched 0/2",
            "non-commercial",
            "no description",
            "no tags",
            "publish date unknown",
        ] {
            assert!(
                card.notes.iter().any(|n| n.contains(expected)),
                "missing note {expected:?} in {:?}",
                card.notes
            );
        }
    }

    #[test]
    fn scoring_is_deterministic() {
        let rubric = ScoringRubric::default();
        let result = strong_result();
        let first = rubric.score(&result);
        for _ in 0..5 {
            assert_eq!(rubric.score(&result), first);
        }
    }

    #[test]
    fn recency_scales_between_fresh_and_stale() {
        let mut result = strong_result();
        result.published_at = Some(result.fetched_at - Duration::days(FRESH_DAYS));
        assert_eq!(recency(&result, &mut Vec::new()), 1.0);
        result.published_at = Some(result.fetched_at - Duration::days(STALE_DAYS));
        assert_eq!(recency(&result, &mut Vec::new()), 0.0);
        result.published_at = Some(result.fetched_at - Duration::days(FRESH_DAYS + 1));
        let just_past_fresh = recency(&result, &mut Vec::new());
        assert!(just_past_fresh < 1.0 && just_past_fresh > 0.99);
        result.published_at = Some(result.fetched_at + Duration::days(3));
        assert_eq!(recency(&result, &mut Vec::new()), 1.0);
    }

    #[test]
    fn license_detection_uses_tokens() {
        let mut result = strong_result();
        for (text, expected) in [
            ("CC BY-NC-SA", 0.2),
            ("Creative Commons NonCommercial", 0.2),
            ("Standard", 1.0),
            ("Syncopated Commercial", 1.0),
            ("", 0.5),
        ] {
            result.license = text.to_string();
            assert_eq!(license(&result, &mut Vec::new()), expected, "{text}");
        }
    }

    #[test]
    fn total_stays_within_bounds_for_skewed_weights() {
        let rubric = ScoringRubric {
            popularity: 500.0,
            relevance: 0.0,
            license: 0.0,
            description: 0.0,
            tags: 0.0,
            recency: -10.0,
        };
        let card = rubric.score(&strong_result());
        assert_eq!(card.total_score, MAX_SCORE);
        assert_eq!(card.breakdown["recency"], 0.0);

        let zero = ScoringRubric {
            popularity: 0.0,
            relevance: 0.0,
            license: 0.0,
            description: 0.0,
            tags: 0.0,
            recency: 0.0,
        };
        assert_eq!(zero.score(&strong_result()).total_score, 0.0);
    }
}
