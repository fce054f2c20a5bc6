use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use trendscout_adapters::CatalogSearch;
use trendscout_core::CatalogResult;
use trendscout_storage::{CacheError, CacheStore, Database, Fetch, FetchError};
use uuid::Uuid;

/// Queries the catalog for one keyword through the cache and records what it finds.
pub struct CandidateCollector {
    db: Database,
    cache: Arc<CacheStore>,
    fetcher: Arc<dyn Fetch>,
    search: CatalogSearch,
    ttl: Duration,
    min_results: usize,
}

impl CandidateCollector {
    pub fn new(
        db: Database,
        cache: Arc<CacheStore>,
        fetcher: Arc<dyn Fetch>,
        search: CatalogSearch,
        ttl: Duration,
        min_results: usize,
    ) -> Self {
        Self {
            db,
            cache,
            fetcher,
            search,
            ttl,
            min_results,
        }
    }

    /// Query `keyword`, then each expansion in order while fewer than `min_results`
    /// unique candidates are known. Upstream failures count as zero results; only
    /// store failures are returned as errors.
    pub async fn collect(
        &self,
        run_id: Uuid,
        keyword: &str,
        expansions: &[String],
    ) -> Result<Vec<CatalogResult>> {
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let mut queries = 0usize;

        for query in std::iter::once(keyword).chain(expansions.iter().map(String::as_str)) {
            if queries > 0 && results.len() >= self.min_results {
                break;
            }
            queries += 1;
            for result in self.search_once(run_id, keyword, query).await? {
                if seen.insert(result.model_id.clone()) {
                    results.push(result);
                }
            }
        }

        for result in &results {
            let inserted = self
                .db
                .insert_catalog_result(result)
                .await
                .with_context(|| format!("recording candidate {} for {keyword}", result.model_id))?;
            if !inserted {
                debug!(%run_id, keyword, model_id = %result.model_id, "candidate already recorded");
            }
        }

        info!(%run_id, keyword, queries, candidates = results.len(), "collected candidates");
        Ok(results)
    }

    async fn search_once(
        &self,
        run_id: Uuid,
        keyword: &str,
        query: &str,
    ) -> Result<Vec<CatalogResult>> {
        let request = self.search.request_for(query);
        let fetcher = self.fetcher.as_ref();
        let search = &self.search;
        let request_ref = &request;

        // a 200 with an unusable body is rejected before it reaches the cache
        let outcome = self
            .cache
            .get_or_fetch(&request, self.ttl, || async move {
                let response = fetcher.fetch(request_ref).await?;
                if response.is_success() {
                    if let Err(err) = search.parse_response(&response.body) {
                        return Err(FetchError::MalformedBody {
                            url: response.final_url,
                            reason: err.to_string(),
                        });
                    }
                }
                Ok(response)
            })
            .await;

        let cached = match outcome {
            Ok(cached) => cached,
            Err(err @ CacheError::Fetch(_)) => {
                warn!(
                    %run_id,
                    keyword,
                    query,
                    error = %err,
                    "catalog query failed; treating as zero results"
                );
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("catalog query {query:?} for {keyword}")));
            }
        };

        let parsed = match self.search.parse_response(&cached.entry.body) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    %run_id,
                    keyword,
                    query,
                    error = %err,
                    "cached catalog response unreadable; treating as zero results"
                );
                return Ok(Vec::new());
            }
        };
        if parsed.skipped > 0 {
            debug!(
                %run_id,
                keyword,
                query,
                skipped = parsed.skipped,
                "skipped catalog items without title or id"
            );
        }
        debug!(
            %run_id,
            keyword,
            query,
            from_cache = cached.from_cache,
            items = parsed.candidates.len(),
            "catalog query complete"
        );

        let fetched_at = cached.entry.fetched_at;
        Ok(parsed
            .candidates
            .into_iter()
            .map(|candidate| CatalogResult::from_candidate(run_id, keyword, candidate, fetched_at))
            .collect())
    }
}
