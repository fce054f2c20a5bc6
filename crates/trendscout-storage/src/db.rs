//! SQLite-backed data access for runs, their owned rows, and the shared HTTP cache.
//!
//! Every run-owned insert is insert-or-ignore against the table's unique key and
//! reports whether a row was actually written.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use trendscout_core::{
    CacheEntry, CatalogResult, CatalogStats, KeywordRecord, Recommendation, RecommendationDetail,
    Run, RunStatus, ScoreRecord, TrendSnapshot, Verdict,
};
use uuid::Uuid;

/// Per-table row counts owned by one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunRowCounts {
    pub trend_snapshots: u64,
    pub keywords: u64,
    pub catalog_results: u64,
    pub scores: u64,
    pub recommendations: u64,
}

impl RunRowCounts {
    pub fn total(&self) -> u64 {
        self.trend_snapshots
            + self.keywords
            + self.catalog_results
            + self.scores
            + self.recommendations
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url` and apply migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        if url.contains(":memory:") {
            return Self::connect_in_memory().await;
        }

        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("parsing database url {url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {url}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database url")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory database")?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- runs -------------------------------------------------------------

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        sqlx::query(
            "INSERT INTO runs (id, region, started_at, finished_at, status, error_message) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(&run.region)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting run {}", run.id))?;
        Ok(())
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT id, region, started_at, finished_at, status, error_message \
             FROM runs WHERE id = ?",
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading run {run_id}"))?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Move a running run to a terminal status. Returns false when the run is
    /// missing or already terminal; nothing is written in that case.
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(anyhow!("cannot finish run {run_id} with non-terminal status {status}"));
        }
        let result = sqlx::query(
            "UPDATE runs SET status = ?, finished_at = ?, error_message = ? \
             WHERE id = ? AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(finished_at)
        .bind(error_message)
        .bind(run_id.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("finishing run {run_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark runs still `running` that started before `started_before` as failed.
    /// Used to recover runs orphaned by a crashed process.
    pub async fn fail_running_runs(
        &self,
        started_before: DateTime<Utc>,
        message: &str,
        finished_at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'failed', finished_at = ?, error_message = ? \
             WHERE status = 'running' AND started_at < ?",
        )
        .bind(finished_at)
        .bind(message)
        .bind(started_before)
        .execute(&self.pool)
        .await
        .context("failing orphaned runs")?;
        Ok(result.rows_affected())
    }

    /// Delete a run; owned rows go with it through `ON DELETE CASCADE`.
    pub async fn delete_run(&self, run_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting run {run_id}"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn count_run_rows(&self, run_id: Uuid) -> Result<RunRowCounts> {
        let mut counts = RunRowCounts::default();
        for (table, slot) in [
            ("trend_snapshots", &mut counts.trend_snapshots),
            ("keywords", &mut counts.keywords),
            ("catalog_results", &mut counts.catalog_results),
            ("model_scores", &mut counts.scores),
            ("recommendations", &mut counts.recommendations),
        ] {
            let count: i64 = sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {table} WHERE run_id = ?"
            ))
            .bind(run_id.to_string())
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("counting {table} for run {run_id}"))?;
            *slot = u64::try_from(count).unwrap_or_default();
        }
        Ok(counts)
    }

    // ---- keywords and trends ------------------------------------------------

    pub async fn insert_keyword(&self, keyword: &KeywordRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO keywords (id, run_id, source_keyword, normalized_keyword, \
             expansions_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, normalized_keyword) DO NOTHING",
        )
        .bind(keyword.id.to_string())
        .bind(keyword.run_id.to_string())
        .bind(&keyword.source_keyword)
        .bind(&keyword.normalized_keyword)
        .bind(to_json(&keyword.expansions)?)
        .bind(keyword.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting keyword {}", keyword.normalized_keyword))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_keywords(&self, run_id: Uuid) -> Result<Vec<KeywordRecord>> {
        let rows = sqlx::query(
            "SELECT id, run_id, source_keyword, normalized_keyword, expansions_json, created_at \
             FROM keywords WHERE run_id = ? ORDER BY created_at ASC, normalized_keyword ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing keywords for run {run_id}"))?;

        rows.iter()
            .map(|row| {
                Ok(KeywordRecord {
                    id: uuid_col(row, "id")?,
                    run_id: uuid_col(row, "run_id")?,
                    source_keyword: row.try_get("source_keyword")?,
                    normalized_keyword: row.try_get("normalized_keyword")?,
                    expansions: json_col(row, "expansions_json")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn insert_trend_snapshot(&self, snapshot: &TrendSnapshot) -> Result<bool> {
        let raw = snapshot.raw.as_ref().map(to_json).transpose()?;
        let result = sqlx::query(
            "INSERT INTO trend_snapshots \
             (id, run_id, region, keyword, source, momentum_score, evidence_json, \
             raw_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, keyword) DO NOTHING",
        )
        .bind(snapshot.id.to_string())
        .bind(snapshot.run_id.to_string())
        .bind(&snapshot.region)
        .bind(&snapshot.keyword)
        .bind(&snapshot.source)
        .bind(snapshot.momentum_score)
        .bind(to_json(&snapshot.evidence)?)
        .bind(raw)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting trend snapshot {}", snapshot.keyword))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_trend_snapshots(&self, run_id: Uuid) -> Result<Vec<TrendSnapshot>> {
        let rows = sqlx::query(
            "SELECT id, run_id, region, keyword, source, momentum_score, evidence_json, \
             raw_json, created_at \
             FROM trend_snapshots WHERE run_id = ? ORDER BY momentum_score DESC, keyword ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing trend snapshots for run {run_id}"))?;

        rows.iter()
            .map(|row| {
                Ok(TrendSnapshot {
                    id: uuid_col(row, "id")?,
                    run_id: uuid_col(row, "run_id")?,
                    region: row.try_get("region")?,
                    keyword: row.try_get("keyword")?,
                    source: row.try_get("source")?,
                    momentum_score: row.try_get("momentum_score")?,
                    evidence: json_col(row, "evidence_json")?,
                    raw: optional_json_col(row, "raw_json")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // ---- catalog results and scores ----------------------------------------

    pub async fn insert_catalog_result(&self, result: &CatalogResult) -> Result<bool> {
        let raw = result.raw.as_ref().map(to_json).transpose()?;
        let outcome = sqlx::query(
            "INSERT INTO catalog_results \
             (id, run_id, keyword, model_id, url, title, description, creator, license, \
              tags_json, stats_json, published_at, raw_json, fetched_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, keyword, model_id) DO NOTHING",
        )
        .bind(result.id.to_string())
        .bind(result.run_id.to_string())
        .bind(&result.keyword)
        .bind(&result.model_id)
        .bind(&result.url)
        .bind(&result.title)
        .bind(&result.description)
        .bind(&result.creator)
        .bind(&result.license)
        .bind(to_json(&result.tags)?)
        .bind(to_json(&result.stats)?)
        .bind(result.published_at)
        .bind(raw)
        .bind(result.fetched_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!("inserting catalog result {} for {}", result.model_id, result.keyword)
        })?;
        Ok(outcome.rows_affected() == 1)
    }

    pub async fn list_catalog_results(&self, run_id: Uuid) -> Result<Vec<CatalogResult>> {
        let rows = sqlx::query(
            "SELECT id, run_id, keyword, model_id, url, title, description, creator, license, \
                    tags_json, stats_json, published_at, raw_json, fetched_at \
             FROM catalog_results WHERE run_id = ? ORDER BY keyword ASC, model_id ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing catalog results for run {run_id}"))?;

        rows.iter()
            .map(|row| {
                let stats: CatalogStats = json_col(row, "stats_json")?;
                Ok(CatalogResult {
                    id: uuid_col(row, "id")?,
                    run_id: uuid_col(row, "run_id")?,
                    keyword: row.try_get("keyword")?,
                    model_id: row.try_get("model_id")?,
                    url: row.try_get("url")?,
                    title: row.try_get("title")?,
                    description: row.try_get("description")?,
                    creator: row.try_get("creator")?,
                    license: row.try_get("license")?,
                    tags: json_col(row, "tags_json")?,
                    stats,
                    published_at: row.try_get("published_at")?,
                    raw: optional_json_col(row, "raw_json")?,
                    fetched_at: row.try_get("fetched_at")?,
                })
            })
            .collect()
    }

    pub async fn insert_score(&self, score: &ScoreRecord) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO model_scores \
             (id, run_id, keyword, model_id, total_score, verdict, scores_json, \
             notes_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, keyword, model_id) DO NOTHING",
        )
        .bind(score.id.to_string())
        .bind(score.run_id.to_string())
        .bind(&score.keyword)
        .bind(&score.model_id)
        .bind(score.total_score)
        .bind(score.verdict.as_str())
        .bind(to_json(&score.breakdown)?)
        .bind(to_json(&score.notes)?)
        .bind(score.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("inserting score {} for {}", score.model_id, score.keyword))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn list_scores(&self, run_id: Uuid) -> Result<Vec<ScoreRecord>> {
        let rows = sqlx::query(
            "SELECT id, run_id, keyword, model_id, total_score, verdict, scores_json, \
             notes_json, created_at \
             FROM model_scores WHERE run_id = ? ORDER BY total_score DESC, model_id ASC, \
             keyword ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing scores for run {run_id}"))?;

        rows.iter()
            .map(|row| {
                let verdict: String = row.try_get("verdict")?;
                let breakdown: BTreeMap<String, f64> = json_col(row, "scores_json")?;
                Ok(ScoreRecord {
                    id: uuid_col(row, "id")?,
                    run_id: uuid_col(row, "run_id")?,
                    keyword: row.try_get("keyword")?,
                    model_id: row.try_get("model_id")?,
                    total_score: row.try_get("total_score")?,
                    verdict: verdict.parse::<Verdict>()?,
                    breakdown,
                    notes: json_col(row, "notes_json")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    // ---- recommendations --------------------------------------------------

    pub async fn insert_recommendation(&self, recommendation: &Recommendation) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO recommendations (id, run_id, rank, keyword, model_id, \
             report_json, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (run_id, rank) DO NOTHING",
        )
        .bind(recommendation.id.to_string())
        .bind(recommendation.run_id.to_string())
        .bind(i64::from(recommendation.rank))
        .bind(&recommendation.keyword)
        .bind(&recommendation.model_id)
        .bind(to_json(&recommendation.report)?)
        .bind(recommendation.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| {
            format!(
                "inserting recommendation rank {} for run {}",
                recommendation.rank, recommendation.run_id
            )
        })?;
        Ok(result.rows_affected() == 1)
    }

    /// Recommendations of a run ordered by rank, joined with their catalog and score rows.
    pub async fn list_recommendations(&self, run_id: Uuid) -> Result<Vec<RecommendationDetail>> {
        let rows = sqlx::query(
            "SELECT r.id, r.run_id, r.rank, r.keyword, r.model_id, r.report_json, r.created_at, \
                    c.title, c.url, c.creator, c.license, s.total_score, s.verdict \
             FROM recommendations r \
             LEFT JOIN catalog_results c \
               ON c.run_id = r.run_id AND c.keyword = r.keyword AND c.model_id = r.model_id \
             LEFT JOIN model_scores s \
               ON s.run_id = r.run_id AND s.keyword = r.keyword AND s.model_id = r.model_id \
             WHERE r.run_id = ? \
             ORDER BY r.rank ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("listing recommendations for run {run_id}"))?;

        rows.iter()
            .map(|row| {
                let rank: i64 = row.try_get("rank")?;
                let verdict: Option<String> = row.try_get("verdict")?;
                Ok(RecommendationDetail {
                    recommendation: Recommendation {
                        id: uuid_col(row, "id")?,
                        run_id: uuid_col(row, "run_id")?,
                        rank: u32::try_from(rank)
                            .with_context(|| format!("rank {rank} out of range"))?,
                        keyword: row.try_get("keyword")?,
                        model_id: row.try_get("model_id")?,
                        report: json_col(row, "report_json")?,
                        created_at: row.try_get("created_at")?,
                    },
                    title: row.try_get("title")?,
                    url: row.try_get("url")?,
                    creator: row.try_get("creator")?,
                    license: row.try_get("license")?,
                    total_score: row.try_get("total_score")?,
                    verdict: verdict.map(|v| v.parse::<Verdict>()).transpose()?,
                })
            })
            .collect()
    }

    // ---- http cache ---------------------------------------------------------

    pub async fn get_cache_entry(
        &self,
        url: &str,
        request_hash: &str,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT url, request_hash, status_code, headers_json, content_type, \
             body_bytes, fetched_at, expires_at \
             FROM http_cache WHERE url = ? AND request_hash = ?",
        )
        .bind(url)
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading cache entry for {url}"))?;

        row.as_ref()
            .map(|row| {
                let status: i64 = row.try_get("status_code")?;
                Ok(CacheEntry {
                    url: row.try_get("url")?,
                    request_hash: row.try_get("request_hash")?,
                    status_code: u16::try_from(status)
                        .with_context(|| format!("cached status {status} out of range"))?,
                    headers: json_col(row, "headers_json")?,
                    content_type: row.try_get("content_type")?,
                    body: row.try_get("body_bytes")?,
                    fetched_at: row.try_get("fetched_at")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .transpose()
    }

    /// Insert or fully overwrite the entry for `(url, request_hash)`.
    pub async fn upsert_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO http_cache \
             (id, url, request_hash, status_code, headers_json, content_type, body_bytes, \
             fetched_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (url, request_hash) DO UPDATE SET \
               status_code = excluded.status_code, \
               headers_json = excluded.headers_json, \
               content_type = excluded.content_type, \
               body_bytes = excluded.body_bytes, \
               fetched_at = excluded.fetched_at, \
               expires_at = excluded.expires_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&entry.url)
        .bind(&entry.request_hash)
        .bind(i64::from(entry.status_code))
        .bind(to_json(&entry.headers)?)
        .bind(&entry.content_type)
        .bind(&entry.body)
        .bind(entry.fetched_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("writing cache entry for {}", entry.url))?;
        Ok(())
    }

    pub async fn purge_expired_cache(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM http_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("purging expired cache entries")?;
        Ok(result.rows_affected())
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("serializing json column")
}

fn json_col<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let text: String = row.try_get(column)?;
    serde_json::from_str(&text).with_context(|| format!("parsing json column {column}"))
}

fn optional_json_col<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| serde_json::from_str(&t).with_context(|| format!("parsing json column {column}")))
        .transpose()
}

fn uuid_col(row: &SqliteRow, column: &str) -> Result<Uuid> {
    let text: String = row.try_get(column)?;
    Uuid::parse_str(&text).with_context(|| format!("parsing uuid column {column}"))
}

fn run_from_row(row: &SqliteRow) -> Result<Run> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: uuid_col(row, "id")?,
        region: row.try_get("region")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status: status.parse::<RunStatus>()?,
        error_message: row.try_get("error_message")?,
    })
}
