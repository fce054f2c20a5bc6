use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};
use trendscout_core::{CatalogResult, Clock, Recommendation, ScoreRecord, Verdict};
use trendscout_storage::Database;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub result: CatalogResult,
    pub score: ScoreRecord,
}

/// Highest score first; ties by model id, then keyword.
fn ranking_order(a: &ScoredCandidate, b: &ScoredCandidate) -> Ordering {
    b.score
        .total_score
        .total_cmp(&a.score.total_score)
        .then_with(|| a.score.model_id.cmp(&b.score.model_id))
        .then_with(|| a.score.keyword.cmp(&b.score.keyword))
}

/// Non-rejected candidates in ranking order, one per model, at most `top_n`.
pub fn rank_candidates(scored: &[ScoredCandidate], top_n: usize) -> Vec<&ScoredCandidate> {
    let mut eligible: Vec<&ScoredCandidate> = scored
        .iter()
        .filter(|c| c.score.verdict != Verdict::Reject)
        .collect();
    eligible.sort_by(|a, b| ranking_order(a, b));

    let mut seen_models = HashSet::new();
    eligible
        .into_iter()
        .filter(|c| seen_models.insert(c.score.model_id.as_str()))
        .take(top_n)
        .collect()
}

pub struct RecommendationBuilder {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl RecommendationBuilder {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Persist ranks `1..=k` for the best `k <= top_n` eligible candidates.
    pub async fn build(
        &self,
        run_id: Uuid,
        scored: &[ScoredCandidate],
        top_n: usize,
    ) -> Result<Vec<Recommendation>> {
        let ranked = rank_candidates(scored, top_n);
        let created_at = self.clock.now();
        let mut recommendations = Vec::with_capacity(ranked.len());

        for (idx, candidate) in ranked.into_iter().enumerate() {
            let rank = u32::try_from(idx + 1).context("rank overflow")?;
            let recommendation = Recommendation {
                id: Uuid::new_v4(),
                run_id,
                rank,
                keyword: candidate.score.keyword.clone(),
                model_id: candidate.score.model_id.clone(),
                report: report_payload(candidate),
                created_at,
            };
            let inserted = self
                .db
                .insert_recommendation(&recommendation)
                .await
                .with_context(|| format!("recording recommendation rank {rank}"))?;
            if !inserted {
                debug!(%run_id, rank, "rank already recorded for run");
            }
            recommendations.push(recommendation);
        }

        info!(
            %run_id,
            scored = scored.len(),
            recommended = recommendations.len(),
            top_n,
            "built recommendations"
        );
        Ok(recommendations)
    }
}

fn report_payload(candidate: &ScoredCandidate) -> serde_json::Value {
    let result = &candidate.result;
    let score = &candidate.score;
    json!({
        "title": result.title,
        "url": result.url,
        "creator": result.creator,
        "license": result.license,
        "tags": result.tags,
        "stats": result.stats,
        "total_score": score.total_score,
        "verdict": score.verdict,
        "breakdown": score.breakdown,
        "notes": score.notes,
    })
}
