use std::collections::BTreeSet;
use std::sync::Arc;

use catalyst_adapters::{
    BulkPrioritizationRequest, CityContextSource, CityData, CityEmissions, CityRequest,
    PrioritizerApi,
};
use catalyst_core::{ActionType, Language, NewRanking, Ranking, RankingStatus};
use catalyst_storage::RankingStore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::HiapError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizeRequest {
    pub project_id: Uuid,
    pub year: i32,
    pub action_type: ActionType,
    pub languages: Vec<Language>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum BatchOutcome {
    /// A job was started for `ranking_ids`; `failed_ids` lost their context fetch.
    #[serde(rename_all = "camelCase")]
    Started {
        job_id: String,
        ranking_ids: Vec<Uuid>,
        failed_ids: Vec<Uuid>,
    },
    /// Another job of the same group is still in flight.
    #[serde(rename_all = "camelCase")]
    Busy { pending: usize },
    /// Nothing left to do.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrioritizeSummary {
    pub rankings: Vec<Ranking>,
    pub batch: BatchOutcome,
}

pub struct BatchOrchestrator {
    store: Arc<dyn RankingStore>,
    prioritizer: Arc<dyn PrioritizerApi>,
    context: Arc<dyn CityContextSource>,
    batch_size: usize,
    // serializes batch starts within this process
    start_lock: Mutex<()>,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn RankingStore>,
        prioritizer: Arc<dyn PrioritizerApi>,
        context: Arc<dyn CityContextSource>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            prioritizer,
            context,
            batch_size: batch_size.max(1),
            start_lock: Mutex::new(()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn store(&self) -> &Arc<dyn RankingStore> {
        &self.store
    }

    /// Upsert one `TO_DO` ranking per city of the project with an inventory for `year`.
    pub async fn create_ranking_records(
        &self,
        project_id: Uuid,
        year: i32,
        action_type: ActionType,
        langs: &[Language],
    ) -> Result<Vec<Ranking>, HiapError> {
        let inventories = self.store.project_inventories(project_id, year).await?;
        let mut rankings = Vec::with_capacity(inventories.len());
        for inventory in inventories {
            let ranking = self
                .store
                .upsert_ranking(&NewRanking {
                    project_id,
                    inventory_id: inventory.inventory_id,
                    locode: inventory.locode,
                    action_type,
                    langs: langs.to_vec(),
                })
                .await?;
            rankings.push(ranking);
        }
        info!(%project_id, year, %action_type, count = rankings.len(), "ranking records ready");
        Ok(rankings)
    }

    pub async fn prioritize_project(&self, request: &PrioritizeRequest) -> Result<PrioritizeSummary, HiapError> {
        let rankings = self
            .create_ranking_records(
                request.project_id,
                request.year,
                request.action_type,
                &request.languages,
            )
            .await?;
        let batch = self
            .start_next_batch(request.project_id, request.action_type)
            .await?;
        Ok(PrioritizeSummary { rankings, batch })
    }

    /// Start a bulk job for the next `TO_DO` rows of the group, unless one is
    /// already in flight.
    pub async fn start_next_batch(
        &self,
        project_id: Uuid,
        action_type: ActionType,
    ) -> Result<BatchOutcome, HiapError> {
        let span = info_span!("hiap_batch", %project_id, %action_type);
        self.start_next_batch_inner(project_id, action_type)
            .instrument(span)
            .await
    }

    async fn start_next_batch_inner(
        &self,
        project_id: Uuid,
        action_type: ActionType,
    ) -> Result<BatchOutcome, HiapError> {
        let _guard = self.start_lock.lock().await;

        let pending = self
            .store
            .count_status(project_id, action_type, RankingStatus::Pending)
            .await?;
        if pending > 0 {
            return Ok(BatchOutcome::Busy { pending });
        }

        let batch = self
            .store
            .to_do_batch(project_id, action_type, self.batch_size)
            .await?;
        if batch.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        let mut ready: Vec<(Uuid, CityData)> = Vec::with_capacity(batch.len());
        let mut failed_ids = Vec::new();
        let mut failures = Vec::new();
        let mut langs = BTreeSet::new();

        for ranking in &batch {
            match self.city_data(ranking).await {
                Ok(data) => {
                    langs.extend(ranking.langs.iter().cloned());
                    ready.push((ranking.id, data));
                }
                Err(err) => {
                    let message = format!("city context fetch failed for {}: {err}", ranking.locode);
                    warn!(locode = %ranking.locode, ranking_id = %ranking.id, error = %err, "city context fetch failed");
                    self.store.mark_failure(ranking.id, &message).await?;
                    failed_ids.push(ranking.id);
                    failures.push(message);
                }
            }
        }

        if ready.is_empty() {
            return Err(HiapError::AllContextFetchesFailed {
                project_id,
                action_type,
                failures,
            });
        }

        let request = BulkPrioritizationRequest {
            request_data: ready
                .iter()
                .map(|(_, data)| CityRequest {
                    city_data: data.clone(),
                })
                .collect(),
            language: langs.into_iter().collect(),
        };
        let job_id = self.prioritizer.start_bulk(&request).await?;

        let ranking_ids = ready.iter().map(|(id, _)| *id).collect::<Vec<_>>();
        self.store.mark_pending(&ranking_ids, &job_id).await?;
        info!(
            %job_id,
            started = ranking_ids.len(),
            failed = failed_ids.len(),
            "bulk prioritization batch started"
        );

        Ok(BatchOutcome::Started {
            job_id,
            ranking_ids,
            failed_ids,
        })
    }

    async fn city_data(&self, ranking: &Ranking) -> Result<CityData, HiapError> {
        let context = self.context.city_context(&ranking.locode).await?;
        let sectors = self.store.sector_emissions(ranking.inventory_id).await?;
        Ok(CityData {
            city_context_data: context,
            city_emissions_data: CityEmissions::from_sectors(&sectors),
        })
    }
}
