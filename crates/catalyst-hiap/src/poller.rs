use std::collections::HashSet;
use std::sync::Arc;

use catalyst_adapters::{BulkPrioritizationResult, PrioritizerApi, RankedItem, TaskStatus};
use catalyst_core::{NewRankedAction, Ranking, RankingStatus};
use catalyst_storage::{PendingJob, RankingStore};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::orchestrator::{BatchOrchestrator, BatchOutcome};
use crate::HiapError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub jobs_checked: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub rankings_succeeded: usize,
    pub rankings_failed: usize,
    pub batches_started: usize,
    pub errors: usize,
}

/// Drives in-flight prioritization jobs to a terminal state and keeps each
/// group's queue moving.
pub struct StatusPoller {
    store: Arc<dyn RankingStore>,
    prioritizer: Arc<dyn PrioritizerApi>,
    orchestrator: Arc<BatchOrchestrator>,
}

impl StatusPoller {
    pub fn new(
        store: Arc<dyn RankingStore>,
        prioritizer: Arc<dyn PrioritizerApi>,
        orchestrator: Arc<BatchOrchestrator>,
    ) -> Self {
        Self {
            store,
            prioritizer,
            orchestrator,
        }
    }

    /// One polling pass. Per-job and per-group errors are logged and counted;
    /// only failing to list the work at all is returned.
    pub async fn poll_once(&self) -> Result<PollSummary, HiapError> {
        let mut summary = PollSummary::default();

        for job in self.store.pending_jobs().await? {
            summary.jobs_checked += 1;
            let span = info_span!("hiap_job", job_id = %job.job_id, project_id = %job.project_id);
            match self.check_job(&job, &mut summary).instrument(span).await {
                Ok(()) => {}
                Err(HiapError::Adapter(err)) if !err.is_retryable() => {
                    let message = format!("prioritization job {} could not be read: {err}", job.job_id);
                    warn!(job_id = %job.job_id, %message, "failing unreadable prioritization job");
                    match self.fail_job(&job.job_id, &message, &mut summary).await {
                        Ok(()) => summary.jobs_failed += 1,
                        Err(err) => {
                            warn!(job_id = %job.job_id, error = %err, "failing prioritization job");
                            summary.errors += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "prioritization job check failed; will retry");
                    summary.errors += 1;
                }
            }
        }

        for (project_id, action_type) in self.store.groups_with_to_do().await? {
            match self.orchestrator.start_next_batch(project_id, action_type).await {
                Ok(BatchOutcome::Started { .. }) => summary.batches_started += 1,
                Ok(BatchOutcome::Busy { .. } | BatchOutcome::Idle) => {}
                Err(err) => {
                    warn!(%project_id, %action_type, error = %err, "starting next batch failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            jobs_checked = summary.jobs_checked,
            batches_started = summary.batches_started,
            errors = summary.errors,
            "hiap poll finished"
        );
        Ok(summary)
    }

    async fn check_job(&self, job: &PendingJob, summary: &mut PollSummary) -> Result<(), HiapError> {
        let progress = self.prioritizer.check_progress(&job.job_id).await?;
        match progress.status {
            TaskStatus::Completed => {
                let result = self.prioritizer.bulk_result(&job.job_id).await?;
                self.apply_result(job, &result, summary).await?;
                summary.jobs_completed += 1;
            }
            TaskStatus::Failed => {
                let message = progress
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("prioritization job {} failed", job.job_id));
                self.fail_job(&job.job_id, &message, summary).await?;
                warn!(job_id = %job.job_id, %message, "prioritization job failed");
                summary.jobs_failed += 1;
            }
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Unknown => {}
        }
        Ok(())
    }

    async fn apply_result(
        &self,
        job: &PendingJob,
        result: &BulkPrioritizationResult,
        summary: &mut PollSummary,
    ) -> Result<(), HiapError> {
        for ranking in self.pending_rankings(&job.job_id).await? {
            let Some(city) = result.for_locode(&ranking.locode) else {
                let message = format!(
                    "no prioritization result for locode {} in job {}",
                    ranking.locode, job.job_id
                );
                warn!(locode = %ranking.locode, "{message}");
                self.store.mark_failure(ranking.id, &message).await?;
                summary.rankings_failed += 1;
                continue;
            };

            let action_type = ranking.action_type;
            if let Some(problem) = invalid_ranking(city.ranked(action_type)) {
                let message = format!(
                    "invalid prioritization result for locode {} in job {}: {problem}",
                    ranking.locode, job.job_id
                );
                warn!(locode = %ranking.locode, "{message}");
                self.store.mark_failure(ranking.id, &message).await?;
                summary.rankings_failed += 1;
                continue;
            }

            let langs = &ranking.langs;
            // one row per ranked item and language, all sharing the upstream rank
            let actions = city
                .ranked(action_type)
                .iter()
                .flat_map(|item| {
                    langs.iter().map(move |lang| NewRankedAction {
                        action_id: item.action_id.clone(),
                        rank: item.rank,
                        explanation: item.explanation.text_for(lang).to_string(),
                        lang: lang.clone(),
                        action_type,
                    })
                })
                .collect::<Vec<_>>();
            self.store.complete_ranking(ranking.id, &actions).await?;
            summary.rankings_succeeded += 1;
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, message: &str, summary: &mut PollSummary) -> Result<(), HiapError> {
        for ranking in self.pending_rankings(job_id).await? {
            self.store.mark_failure(ranking.id, message).await?;
            summary.rankings_failed += 1;
        }
        Ok(())
    }

    async fn pending_rankings(&self, job_id: &str) -> Result<Vec<Ranking>, HiapError> {
        Ok(self
            .store
            .rankings_for_job(job_id)
            .await?
            .into_iter()
            .filter(|r| r.status == RankingStatus::Pending)
            .collect())
    }
}

/// First reason a city's ranked list cannot be stored, if any.
fn invalid_ranking(items: &[RankedItem]) -> Option<String> {
    let mut seen = HashSet::new();
    for item in items {
        if item.rank < 1 {
            return Some(format!("action {} has rank {}", item.action_id, item.rank));
        }
        if !seen.insert(item.action_id.as_str()) {
            return Some(format!("action {} is ranked more than once", item.action_id));
        }
    }
    None
}
