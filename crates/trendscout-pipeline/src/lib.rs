//! Run orchestration: trends in, ranked catalog recommendations out.

mod collect;
mod config;
mod normalize;
mod recommend;
mod report;
mod runs;
mod score;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use trendscout_adapters::{FileTrendSource, StaticTrendSource, TrendSource};
use trendscout_core::{Clock, KeywordRecord, Run, RunStatus, SystemClock, TrendSnapshot, Verdict};
use trendscout_storage::{CacheStore, Database, Fetch, HttpFetcher};
use uuid::Uuid;

pub use collect::CandidateCollector;
pub use config::{
    load_normalizer_rules, PipelineConfig, DEFAULT_DATABASE_URL, DEFAULT_MIN_RESULTS,
    DEFAULT_RUN_CRON,
};
pub use normalize::{
    canonicalize, KeywordNormalizer, NormalizedKeyword, NormalizerConfig, SynonymRule,
    DEFAULT_DENYLIST, DEFAULT_MIN_LENGTH,
};
pub use recommend::{rank_candidates, RecommendationBuilder, ScoredCandidate};
pub use report::{render_markdown, report_file_name, write_report};
pub use runs::{RunError, RunManager, RunOutcome, ORPHAN_MESSAGE};
pub use score::{
    verdict_for, ScoreCard, Scorer, ScoringRubric, ACCEPT_THRESHOLD, BORDERLINE_THRESHOLD,
    MAX_SCORE,
};

pub const CRATE_NAME: &str = "trendscout-pipeline";

pub const CANCELLED_MESSAGE: &str = "run cancelled: shutdown requested";

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub region: String,
    pub status: RunStatus,
    pub trends: usize,
    pub keywords: usize,
    pub candidates: usize,
    pub accepted: usize,
    pub borderline: usize,
    pub rejected: usize,
    pub recommendations: usize,
    pub report_path: Option<String>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not open run: {0}")]
    Start(#[source] RunError),
    #[error("run {run_id} failed: {message}")]
    Failed { run_id: Uuid, message: String },
    #[error("run {run_id} cancelled before completion")]
    Cancelled { run_id: Uuid },
    #[error("run {run_id} completed but could not be closed: {source}")]
    Finish {
        run_id: Uuid,
        #[source]
        source: RunError,
    },
}

impl PipelineError {
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::Start(_) => None,
            Self::Failed { run_id, .. }
            | Self::Cancelled { run_id }
            | Self::Finish { run_id, .. } => Some(*run_id),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    db: Database,
    runs: RunManager,
    normalizer: KeywordNormalizer,
    collector: Arc<CandidateCollector>,
    scorer: Arc<dyn Scorer>,
    recommender: RecommendationBuilder,
    cache: Arc<CacheStore>,
    trends: Box<dyn TrendSource>,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    /// Wire every stage from explicit collaborators.
    pub fn new(
        config: PipelineConfig,
        db: Database,
        fetcher: Arc<dyn Fetch>,
        trends: Box<dyn TrendSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = Arc::new(CacheStore::new(db.clone(), clock.clone()));
        let collector = Arc::new(CandidateCollector::new(
            db.clone(),
            cache.clone(),
            fetcher,
            config.catalog.clone(),
            config.cache_ttl,
            config.min_results,
        ));
        Self {
            normalizer: KeywordNormalizer::new(&config.normalizer),
            runs: RunManager::new(db.clone(), clock.clone()),
            recommender: RecommendationBuilder::new(db.clone(), clock.clone()),
            scorer: Arc::new(ScoringRubric::default()),
            collector,
            cache,
            trends,
            clock,
            db,
            config,
        }
    }

    /// Connect the configured database and HTTP client, then recover orphaned runs.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url, config.db_max_connections).await?;
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let trends = trend_source_for(&config);
        let pipeline = Self::new(config, db, fetcher, trends, Arc::new(SystemClock));
        pipeline
            .runs
            .recover_orphans(pipeline.config.orphan_after)
            .await
            .context("recovering orphaned runs")?;
        Ok(pipeline)
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn runs(&self) -> &RunManager {
        &self.runs
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// One run, cancelled by Ctrl-C.
    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        self.run_until(shutdown_signal()).await
    }

    /// One run; if `shutdown` resolves first the run is closed as failed.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<RunSummary, PipelineError>
    where
        S: Future<Output = ()>,
    {
        let run = self
            .runs
            .start(&self.config.region)
            .await
            .map_err(PipelineError::Start)?;
        let span = info_span!("run", run_id = %run.id, region = %run.region);
        self.drive(&run, shutdown).instrument(span).await
    }

    async fn drive<S>(&self, run: &Run, shutdown: S) -> Result<RunSummary, PipelineError>
    where
        S: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            result = self.execute(run) => Some(result),
            () = shutdown => None,
        };

        match outcome {
            Some(Ok(mut summary)) => {
                let finished = match self.runs.finish(run.id, RunOutcome::Succeeded, None).await {
                    Ok(finished) => finished,
                    Err(source) => {
                        return Err(PipelineError::Finish {
                            run_id: run.id,
                            source,
                        })
                    }
                };
                summary.status = finished.status;
                info!(
                    keywords = summary.keywords,
                    candidates = summary.candidates,
                    recommendations = summary.recommendations,
                    "run succeeded"
                );
                Ok(summary)
            }
            Some(Err(err)) => {
                let message = format!("{err:#}");
                error!(error = %message, "run failed");
                self.close_failed(run.id, &message).await;
                Err(PipelineError::Failed {
                    run_id: run.id,
                    message,
                })
            }
            None => {
                warn!("shutdown requested; abandoning run");
                self.close_failed(run.id, CANCELLED_MESSAGE).await;
                Err(PipelineError::Cancelled { run_id: run.id })
            }
        }
    }

    async fn close_failed(&self, run_id: Uuid, message: &str) {
        if let Err(err) = self.runs.finish(run_id, RunOutcome::Failed, Some(message)).await {
            error!(%run_id, error = %err, "could not record run failure");
        }
    }

    async fn execute(&self, run: &Run) -> Result<RunSummary> {
        let raw_trends = match self.trends.fetch_trends(&run.region).await {
            Ok(trends) => trends,
            Err(err) => {
                warn!(
                    source = self.trends.source_id(),
                    error = %err,
                    "trend source failed; continuing with no trends"
                );
                Vec::new()
            }
        };
        info!(source = self.trends.source_id(), trends = raw_trends.len(), "trends fetched");

        let mut keywords = Vec::new();
        for trend in &raw_trends {
            let keyword = trend.keyword.trim();
            if keyword.is_empty() {
                continue;
            }
            let snapshot = TrendSnapshot {
                id: Uuid::new_v4(),
                run_id: run.id,
                region: run.region.clone(),
                keyword: keyword.to_string(),
                source: trend.source.clone(),
                momentum_score: trend.momentum_score,
                evidence: trend.evidence.clone(),
                raw: trend.raw.clone(),
                created_at: self.clock.now(),
            };
            self.db.insert_trend_snapshot(&snapshot).await?;

            let Some(normalized) = self.normalizer.normalize(keyword) else {
                debug!(keyword, "trend dropped by normalizer");
                continue;
            };
            let record = KeywordRecord {
                id: Uuid::new_v4(),
                run_id: run.id,
                source_keyword: normalized.source.clone(),
                normalized_keyword: normalized.normalized.clone(),
                expansions: normalized.expansions.clone(),
                created_at: self.clock.now(),
            };
            if self.db.insert_keyword(&record).await? {
                keywords.push(normalized);
            } else {
                debug!(keyword = %normalized.normalized, "keyword already queued for this run");
            }
        }

        let scored = self.score_keywords(run.id, &keywords).await?;
        let recommendations = self
            .recommender
            .build(run.id, &scored, self.config.top_n)
            .await?;

        let count = |verdict: Verdict| scored.iter().filter(|c| c.score.verdict == verdict).count();
        Ok(RunSummary {
            run_id: run.id,
            region: run.region.clone(),
            status: run.status,
            trends: raw_trends.len(),
            keywords: keywords.len(),
            candidates: scored.len(),
            accepted: count(Verdict::Accept),
            borderline: count(Verdict::Borderline),
            rejected: count(Verdict::Reject),
            recommendations: recommendations.len(),
            report_path: None,
        })
    }

    /// Collect and score every keyword on a bounded pool; returns once all are done.
    async fn score_keywords(
        &self,
        run_id: Uuid,
        keywords: &[NormalizedKeyword],
    ) -> Result<Vec<ScoredCandidate>> {
        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for keyword in keywords.iter().cloned() {
            let permits = permits.clone();
            let collector = self.collector.clone();
            let scorer = self.scorer.clone();
            let db = self.db.clone();
            let clock = self.clock.clone();
            let span = info_span!("keyword", keyword = %keyword.normalized);
            tasks.spawn(
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .expect("worker semaphore is never closed");
                    let results = collector
                        .collect(run_id, &keyword.normalized, &keyword.expansions)
                        .await?;

                    let mut scored = Vec::with_capacity(results.len());
                    for result in results {
                        let record = scorer.score(&result).into_record(&result, clock.now());
                        if !db.insert_score(&record).await? {
                            debug!(model_id = %record.model_id, "score already recorded");
                        }
                        scored.push(ScoredCandidate {
                            result,
                            score: record,
                        });
                    }
                    anyhow::Ok(scored)
                }
                .instrument(span),
            );
        }

        let mut scored = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(batch)) => scored.extend(batch),
                Ok(Err(err)) => return Err(err.context("scoring keyword")),
                Err(join_err) => {
                    warn!(error = %join_err, "keyword worker panicked; skipping keyword");
                }
            }
        }
        Ok(scored)
    }

    pub async fn write_report(&self, run_id: Uuid) -> Result<PathBuf> {
        let run = self.runs.get(run_id).await?;
        let details = self.db.list_recommendations(run_id).await?;
        write_report(&self.config.reports_dir, &run, &details).await
    }

    /// `None` unless scheduling is enabled in configuration.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        self.build_scheduler().await.map(Some)
    }

    /// A scheduler firing one fresh run per `run_cron` tick. Not started.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.run_cron.clone();
        let pipeline = self;
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => match pipeline.write_report(summary.run_id).await {
                        Ok(path) => info!(
                            run_id = %summary.run_id,
                            report = %path.display(),
                            "scheduled run complete"
                        ),
                        Err(err) => warn!(
                            run_id = %summary.run_id,
                            error = %format!("{err:#}"),
                            "scheduled run report failed"
                        ),
                    },
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

fn trend_source_for(config: &PipelineConfig) -> Box<dyn TrendSource> {
    if let Some(path) = &config.trends_file {
        return Box::new(FileTrendSource::new(path.clone()));
    }
    match &config.trends_override {
        Some(csv) => Box::new(StaticTrendSource::from_csv("env", csv)),
        None => Box::new(StaticTrendSource::seed()),
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // no signal handler available: never cancel
        std::future::pending::<()>().await;
    }
}

pub async fn run_pipeline_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env().with_rules_from_workspace()?;
    let pipeline = Pipeline::from_config(config).await?;
    let mut summary = pipeline.run_once().await?;
    let path = pipeline.write_report(summary.run_id).await?;
    summary.report_path = Some(path.display().to_string());
    Ok(summary)
}
