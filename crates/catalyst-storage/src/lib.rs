//! Relational store for HIAP rankings, ranked actions and the inventory rows they hang off.

use async_trait::async_trait;
use catalyst_core::{
    ActionType, CityInventory, InventoryRecord, NewRankedAction, NewRanking, ParseError,
    RankedAction, Ranking, RankingStatus, SectorEmission,
};
use thiserror::Error;
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryRankingStore;
pub use postgres::PgRankingStore;

pub const CRATE_NAME: &str = "catalyst-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid stored value: {0}")]
    Decode(#[from] ParseError),
    #[error("invalid transition for ranking {id}: {status} -> {target}")]
    InvalidTransition {
        id: Uuid,
        status: RankingStatus,
        target: RankingStatus,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A job currently in flight, keyed by the group it was started for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingJob {
    pub job_id: String,
    pub project_id: Uuid,
    pub action_type: ActionType,
}

#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Every (city, inventory) pair of `project_id` with an inventory for `year`.
    async fn project_inventories(&self, project_id: Uuid, year: i32) -> StoreResult<Vec<CityInventory>>;

    async fn inventory(&self, inventory_id: Uuid) -> StoreResult<Option<InventoryRecord>>;

    /// Co2eq of an inventory summed per GPC sector, ordered by sector.
    async fn sector_emissions(&self, inventory_id: Uuid) -> StoreResult<Vec<SectorEmission>>;

    /// Insert a `TO_DO` ranking, or refresh the existing one for the same
    /// (inventory, locode, action type).
    ///
    /// Existing `TO_DO` rows take the new languages, `FAILURE` rows are reset to
    /// `TO_DO`, and `PENDING`/`SUCCESS` rows are returned untouched.
    async fn upsert_ranking(&self, new: &NewRanking) -> StoreResult<Ranking>;

    async fn ranking(&self, id: Uuid) -> StoreResult<Option<Ranking>>;

    async fn rankings_for_inventory(&self, inventory_id: Uuid) -> StoreResult<Vec<Ranking>>;

    /// `TO_DO` rows of a group in creation order.
    async fn to_do_batch(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        limit: usize,
    ) -> StoreResult<Vec<Ranking>>;

    async fn count_status(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        status: RankingStatus,
    ) -> StoreResult<usize>;

    /// Move `TO_DO` rows to `PENDING` under `job_id`.
    async fn mark_pending(&self, ids: &[Uuid], job_id: &str) -> StoreResult<()>;

    /// Move a `TO_DO` or `PENDING` row to `FAILURE`.
    async fn mark_failure(&self, id: Uuid, message: &str) -> StoreResult<()>;

    async fn pending_jobs(&self) -> StoreResult<Vec<PendingJob>>;

    async fn rankings_for_job(&self, job_id: &str) -> StoreResult<Vec<Ranking>>;

    /// Persist the ranked actions of a `PENDING` ranking and mark it `SUCCESS`.
    async fn complete_ranking(&self, id: Uuid, actions: &[NewRankedAction]) -> StoreResult<()>;

    /// Groups that still have `TO_DO` rows waiting for a batch.
    async fn groups_with_to_do(&self) -> StoreResult<Vec<(Uuid, ActionType)>>;

    async fn ranked_actions(&self, ranking_id: Uuid) -> StoreResult<Vec<RankedAction>>;

    /// Set the selection flag on every language row of `action_id`; returns rows touched.
    async fn select_action(&self, ranking_id: Uuid, action_id: &str, selected: bool) -> StoreResult<usize>;
}
