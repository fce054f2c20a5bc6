use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use trendscout_adapters::CatalogSearch;
use trendscout_storage::HttpClientConfig;

use crate::normalize::{NormalizerConfig, SynonymRule};

pub const DEFAULT_DATABASE_URL: &str = "sqlite://trendscout.db";
pub const DEFAULT_RUN_CRON: &str = "0 0 6 * * *";
pub const DEFAULT_MIN_RESULTS: usize = 3;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub region: String,
    pub top_n: usize,
    pub worker_concurrency: usize,
    pub cache_ttl: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    /// Minimum spacing between catalog requests; zero disables pacing.
    pub request_interval: Duration,
    pub catalog: CatalogSearch,
    pub min_results: usize,
    pub normalizer: NormalizerConfig,
    pub reports_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub run_cron: String,
    pub orphan_after: Duration,
    /// Comma-separated static trend list overriding the seed terms.
    pub trends_override: Option<String>,
    /// JSON trend fixture; takes precedence over `trends_override`.
    pub trends_file: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            db_max_connections: 5,
            region: "GB".to_string(),
            top_n: 10,
            worker_concurrency: 4,
            cache_ttl: Duration::from_secs(6 * 60 * 60),
            http_timeout_secs: 15,
            user_agent: "trendscout/0.1".to_string(),
            request_interval: Duration::from_millis(500),
            catalog: CatalogSearch::default(),
            min_results: DEFAULT_MIN_RESULTS,
            normalizer: NormalizerConfig::default(),
            reports_dir: PathBuf::from("./reports"),
            scheduler_enabled: false,
            run_cron: DEFAULT_RUN_CRON.to_string(),
            orphan_after: Duration::from_secs(6 * 60 * 60),
            trends_override: None,
            trends_file: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            db_max_connections: env_parse(
                "TRENDSCOUT_DB_MAX_CONNECTIONS",
                defaults.db_max_connections,
            ),
            region: env_or("TRENDSCOUT_REGION", &defaults.region).to_ascii_uppercase(),
            top_n: env_parse("TRENDSCOUT_TOP_N", defaults.top_n),
            worker_concurrency: env_parse("TRENDSCOUT_WORKERS", defaults.worker_concurrency).max(1),
            cache_ttl: Duration::from_secs(env_parse(
                "TRENDSCOUT_CACHE_TTL_SECS",
                defaults.cache_ttl.as_secs(),
            )),
            http_timeout_secs: env_parse(
                "TRENDSCOUT_HTTP_TIMEOUT_SECS",
                defaults.http_timeout_secs,
            ),
            user_agent: env_or("TRENDSCOUT_USER_AGENT", &defaults.user_agent),
            request_interval: Duration::from_millis(env_parse(
                "TRENDSCOUT_REQUEST_INTERVAL_MS",
                defaults.request_interval.as_millis() as u64,
            )),
            catalog: CatalogSearch {
                search_url: env_or("TRENDSCOUT_SEARCH_URL", &defaults.catalog.search_url),
                site_url: env_or("TRENDSCOUT_SITE_URL", &defaults.catalog.site_url),
                page_size: env_parse("TRENDSCOUT_PAGE_SIZE", defaults.catalog.page_size),
                sort: defaults.catalog.sort,
            },
            min_results: env_parse("TRENDSCOUT_MIN_RESULTS", defaults.min_results),
            normalizer: defaults.normalizer,
            reports_dir: std::env::var("TRENDSCOUT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            scheduler_enabled: std::env::var("TRENDSCOUT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            run_cron: env_or("TRENDSCOUT_RUN_CRON", &defaults.run_cron),
            orphan_after: Duration::from_secs(env_parse(
                "TRENDSCOUT_ORPHAN_AFTER_SECS",
                defaults.orphan_after.as_secs(),
            )),
            trends_override: std::env::var("TRENDSCOUT_TRENDS")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            trends_file: std::env::var("TRENDSCOUT_TRENDS_FILE").ok().map(PathBuf::from),
            workspace_root: std::env::var("TRENDSCOUT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    /// Replace the built-in normalizer rules with `rules/*.yaml` under the workspace root.
    pub fn with_rules_from_workspace(mut self) -> Result<Self> {
        let rules_dir = self.workspace_root.join("rules");
        self.normalizer = load_normalizer_rules(&rules_dir, self.normalizer)?;
        Ok(self)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_interval: self.request_interval,
            ..Default::default()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Deserialize)]
struct DenylistFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    terms: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SynonymsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    min_length: Option<usize>,
    #[serde(default)]
    rules: Vec<SynonymRule>,
}

/// Each file that exists replaces the matching part of `base`; absent files keep it.
pub fn load_normalizer_rules(rules_dir: &Path, base: NormalizerConfig) -> Result<NormalizerConfig> {
    let mut config = base;

    let denylist_path = rules_dir.join("denylist.yaml");
    if denylist_path.exists() {
        let file: DenylistFile = serde_yaml::from_str(
            &std::fs::read_to_string(&denylist_path)
                .with_context(|| format!("reading {}", denylist_path.display()))?,
        )
        .with_context(|| format!("parsing {}", denylist_path.display()))?;
        config.denylist = file.terms;
    }

    let synonyms_path = rules_dir.join("synonyms.yaml");
    if synonyms_path.exists() {
        let file: SynonymsFile = serde_yaml::from_str(
            &std::fs::read_to_string(&synonyms_path)
                .with_context(|| format!("reading {}", synonyms_path.display()))?,
        )
        .with_context(|| format!("parsing {}", synonyms_path.display()))?;
        if let Some(min_length) = file.min_length {
            config.min_length = min_length;
        }
        config.synonyms = file.rules;
    }

    Ok(config)
}
