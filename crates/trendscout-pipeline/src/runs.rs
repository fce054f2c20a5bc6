use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;
use tracing::{info, warn};
use trendscout_core::{Clock, Run, RunStatus};
use trendscout_storage::{Database, RunRowCounts};
use uuid::Uuid;

pub const ORPHAN_MESSAGE: &str = "abandoned: process exited before completion";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(Uuid),
    #[error("run {run_id} already finished as {status}")]
    AlreadyFinished { run_id: Uuid, status: RunStatus },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Owns run rows: creation, the single `running -> terminal` transition, and deletion.
#[derive(Debug, Clone)]
pub struct RunManager {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl RunManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub async fn start(&self, region: &str) -> Result<Run, RunError> {
        let run = Run {
            id: Uuid::new_v4(),
            region: region.to_string(),
            started_at: self.clock.now(),
            finished_at: None,
            status: RunStatus::Running,
            error_message: None,
        };
        self.db.insert_run(&run).await.context("opening run")?;
        info!(run_id = %run.id, region = %run.region, "run started");
        Ok(run)
    }

    /// Close a running run. Finishing a run twice is an error, never a silent no-op.
    pub async fn finish(
        &self,
        run_id: Uuid,
        outcome: RunOutcome,
        error_message: Option<&str>,
    ) -> Result<Run, RunError> {
        let status = RunStatus::from(outcome);
        let updated = self
            .db
            .finish_run(run_id, status, self.clock.now(), error_message)
            .await?;

        let run = self.get(run_id).await?;
        if !updated {
            return Err(RunError::AlreadyFinished {
                run_id,
                status: run.status,
            });
        }
        info!(%run_id, status = %run.status, "run finished");
        Ok(run)
    }

    pub async fn get(&self, run_id: Uuid) -> Result<Run, RunError> {
        self.db
            .get_run(run_id)
            .await?
            .ok_or(RunError::NotFound(run_id))
    }

    /// Remove a run and, through the cascade, every row it owns.
    pub async fn delete(&self, run_id: Uuid) -> Result<RunRowCounts, RunError> {
        let counts = self.db.count_run_rows(run_id).await?;
        if !self.db.delete_run(run_id).await? {
            return Err(RunError::NotFound(run_id));
        }
        info!(%run_id, rows = counts.total(), "run deleted");
        Ok(counts)
    }

    /// Fail runs still `running` that started more than `older_than` ago.
    pub async fn recover_orphans(&self, older_than: Duration) -> Result<u64, RunError> {
        let now = self.clock.now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .context("orphan cutoff out of range")?;
        let recovered = self.db.fail_running_runs(cutoff, ORPHAN_MESSAGE, now).await?;
        if recovered > 0 {
            warn!(recovered, "marked orphaned runs as failed");
        }
        Ok(recovered)
    }
}
