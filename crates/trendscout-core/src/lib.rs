//! Core domain model for trendscout runs and the records they own.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendscout-core";

/// Lifecycle state of a run. `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Classification of a candidate derived from its total score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accept,
    Borderline,
    Reject,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Borderline => "borderline",
            Self::Reject => "reject",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(Self::Accept),
            "borderline" => Ok(Self::Borderline),
            "reject" => Ok(Self::Reject),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub region: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_keyword: String,
    pub normalized_keyword: String,
    pub expansions: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendSnapshot {
    pub id: Uuid,
    pub run_id: Uuid,
    pub region: String,
    pub keyword: String,
    pub source: String,
    pub momentum_score: f64,
    pub evidence: JsonValue,
    pub raw: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
}

/// Engagement counters reported by the catalog for one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub downloads: u64,
    #[serde(default)]
    pub prints: u64,
    #[serde(default)]
    pub collections: u64,
}

/// Parsed catalog item, before it is bound to a run and keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogCandidate {
    pub model_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub creator: String,
    pub license: String,
    pub tags: Vec<String>,
    pub stats: CatalogStats,
    pub published_at: Option<DateTime<Utc>>,
    pub raw: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogResult {
    pub id: Uuid,
    pub run_id: Uuid,
    pub keyword: String,
    pub model_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub creator: String,
    pub license: String,
    pub tags: Vec<String>,
    pub stats: CatalogStats,
    pub published_at: Option<DateTime<Utc>>,
    pub raw: Option<JsonValue>,
    pub fetched_at: DateTime<Utc>,
}

impl CatalogResult {
    pub fn from_candidate(
        run_id: Uuid,
        keyword: &str,
        candidate: CatalogCandidate,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            keyword: keyword.to_string(),
            model_id: candidate.model_id,
            url: candidate.url,
            title: candidate.title,
            description: candidate.description,
            creator: candidate.creator,
            license: candidate.license,
            tags: candidate.tags,
            stats: candidate.stats,
            published_at: candidate.published_at,
            raw: candidate.raw,
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub keyword: String,
    pub model_id: String,
    pub total_score: f64,
    pub verdict: Verdict,
    pub breakdown: BTreeMap<String, f64>,
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: Uuid,
    pub run_id: Uuid,
    pub rank: u32,
    pub keyword: String,
    pub model_id: String,
    pub report: JsonValue,
    pub created_at: DateTime<Utc>,
}

/// A recommendation joined with the catalog and score rows it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationDetail {
    pub recommendation: Recommendation,
    pub title: Option<String>,
    pub url: Option<String>,
    pub creator: Option<String>,
    pub license: Option<String>,
    pub total_score: Option<f64>,
    pub verdict: Option<Verdict>,
}

/// Shared HTTP response cache row. Not owned by any run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub request_hash: String,
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Source of "now" for TTL and lifecycle timestamps.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn status_and_verdict_round_trip_through_text() {
        for status in [RunStatus::Running, RunStatus::Succeeded, RunStatus::Failed] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        for verdict in [Verdict::Accept, Verdict::Borderline, Verdict::Reject] {
            assert_eq!(verdict.as_str().parse::<Verdict>().unwrap(), verdict);
        }
        let err = "paused".parse::<RunStatus>().unwrap_err();
        assert_eq!(err, UnknownVariant("paused".into()));
        assert_eq!(err.to_string(), "unknown variant `paused`");
    }

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn fixed_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).single().unwrap();
        let clock = FixedClock::new(start);
        clock.advance(chrono::Duration::seconds(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn cache_entry_is_stale_exactly_at_expiry() {
        let fetched = Utc.with_ymd_and_hms(2026, 1, 12, 0, 0, 0).single().unwrap();
        let entry = CacheEntry {
            url: "https://example.test/search".into(),
            request_hash: "abc".into(),
            status_code: 200,
            headers: BTreeMap::new(),
            content_type: "application/json".into(),
            body: b"{}".to_vec(),
            fetched_at: fetched,
            expires_at: fetched + chrono::Duration::seconds(60),
        };
        assert!(entry.is_fresh_at(fetched + chrono::Duration::seconds(59)));
        assert!(!entry.is_fresh_at(fetched + chrono::Duration::seconds(60)));
    }
}
