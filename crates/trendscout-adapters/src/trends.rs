use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

/// Seed terms used when no trend feed is configured.
pub const SEED_TRENDS: [&str; 6] = [
    "fidget toy",
    "desk toy",
    "mini animal",
    "keychain",
    "stress toy",
    "collectible figurine",
];

/// One trending term as reported by a feed, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTrend {
    pub keyword: String,
    pub source: String,
    pub momentum_score: f64,
    #[serde(default)]
    pub evidence: JsonValue,
    #[serde(default)]
    pub raw: Option<JsonValue>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait TrendSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Ordered trends for `region`, strongest first. An empty list is valid.
    async fn fetch_trends(&self, region: &str) -> Result<Vec<RawTrend>, AdapterError>;
}

/// Serves a fixed term list; momentum falls off linearly with list position.
#[derive(Debug, Clone)]
pub struct StaticTrendSource {
    source_id: String,
    terms: Vec<String>,
}

impl StaticTrendSource {
    pub fn new(source_id: impl Into<String>, terms: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            terms,
        }
    }

    pub fn seed() -> Self {
        Self::new("static", SEED_TRENDS.iter().map(|t| t.to_string()).collect())
    }

    /// Parse a comma-separated override such as `TRENDSCOUT_TRENDS=fidget toy,desk toy`.
    pub fn from_csv(source_id: impl Into<String>, csv: &str) -> Self {
        let terms = csv
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self::new(source_id, terms)
    }
}

#[async_trait]
impl TrendSource for StaticTrendSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_trends(&self, region: &str) -> Result<Vec<RawTrend>, AdapterError> {
        let total = self.terms.len();
        Ok(self
            .terms
            .iter()
            .enumerate()
            .map(|(idx, term)| RawTrend {
                keyword: term.clone(),
                source: self.source_id.clone(),
                momentum_score: 100.0 * (total - idx) as f64 / total as f64,
                evidence: json!({
                    "position": idx + 1,
                    "list_size": total,
                    "region": region,
                }),
                raw: None,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TrendFixture {
    source: String,
    #[serde(default)]
    region: Option<String>,
    trends: Vec<TrendFixtureItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct TrendFixtureItem {
    keyword: String,
    #[serde(default)]
    momentum_score: Option<f64>,
    #[serde(default)]
    evidence: Option<JsonValue>,
    #[serde(default)]
    raw: Option<JsonValue>,
}

/// Load a captured trend feed (`{"source": .., "trends": [..]}`) from disk.
pub fn load_trend_fixture(path: impl AsRef<Path>) -> Result<Vec<RawTrend>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let fixture: TrendFixture =
        serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
    let total = fixture.trends.len();

    Ok(fixture
        .trends
        .into_iter()
        .enumerate()
        .map(|(idx, item)| RawTrend {
            keyword: item.keyword,
            source: fixture.source.clone(),
            momentum_score: item
                .momentum_score
                .unwrap_or(100.0 * (total - idx) as f64 / total as f64),
            evidence: item.evidence.unwrap_or_else(|| {
                json!({
                    "position": idx + 1,
                    "fixture_region": fixture.region,
                })
            }),
            raw: item.raw,
        })
        .collect())
}

/// Reads trends from a fixture file on every fetch.
#[derive(Debug, Clone)]
pub struct FileTrendSource {
    path: PathBuf,
}

impl FileTrendSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl TrendSource for FileTrendSource {
    fn source_id(&self) -> &str {
        "file"
    }

    async fn fetch_trends(&self, _region: &str) -> Result<Vec<RawTrend>, AdapterError> {
        Ok(load_trend_fixture(&self.path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seed_source_orders_momentum_by_position() {
        let trends = StaticTrendSource::seed().fetch_trends("GB").await.unwrap();
        assert_eq!(trends.len(), SEED_TRENDS.len());
        assert_eq!(trends[0].keyword, "fidget toy");
        assert_eq!(trends[0].momentum_score, 100.0);
        assert!(trends
            .windows(2)
            .all(|w| w[0].momentum_score > w[1].momentum_score));
        assert_eq!(trends[0].evidence["region"], "GB");
        assert_eq!(trends[0].source, "static");
    }

    #[tokio::test]
    async fn csv_override_skips_blank_terms() {
        let source = StaticTrendSource::from_csv("env", " fidget toy, ,desk toy ,");
        let trends = source.fetch_trends("US").await.unwrap();
        let keywords: Vec<_> = trends.iter().map(|t| t.keyword.as_str()).collect();
        assert_eq!(keywords, vec!["fidget toy", "desk toy"]);
        assert_eq!(source.source_id(), "env");
    }

    #[tokio::test]
    async fn empty_source_yields_no_trends() {
        let trends = StaticTrendSource::new("static", Vec::new())
            .fetch_trends("GB")
            .await
            .unwrap();
        assert!(trends.is_empty());
    }

    #[tokio::test]
    async fn fixture_file_fills_missing_momentum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trends.json");
        std::fs::write(
            &path,
            r#"{"source": "google-trends", "region": "GB", "trends": [
                {"keyword": "Fidget Toy", "momentum_score": 87.5},
                {"keyword": "desk toy"}
            ]}"#,
        )
        .unwrap();

        let trends = FileTrendSource::new(&path).fetch_trends("GB").await.unwrap();
        assert_eq!(trends.len(), 2);
        assert_eq!(trends[0].momentum_score, 87.5);
        assert_eq!(trends[1].momentum_score, 50.0);
        assert_eq!(trends[1].source, "google-trends");
        assert_eq!(trends[1].evidence["position"], 2);
    }

    #[tokio::test]
    async fn missing_fixture_is_an_adapter_error() {
        let err = FileTrendSource::new("/nonexistent/trends.json")
            .fetch_trends("GB")
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Anyhow(_)));
    }
}
