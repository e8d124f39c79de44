use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use catalyst_core::gpc::sector_of;
use catalyst_core::{
    ActionType, CityInventory, InventoryRecord, InventoryType, NewRankedAction, NewRanking,
    RankedAction, Ranking, RankingStatus, SectorEmission,
};
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{PendingJob, RankingStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct CityRow {
    id: Uuid,
    project_id: Uuid,
    locode: String,
    name: String,
}

#[derive(Debug, Clone)]
struct InventoryRow {
    id: Uuid,
    city_id: Uuid,
    year: i32,
    inventory_type: InventoryType,
}

#[derive(Debug, Default)]
struct State {
    projects: BTreeMap<Uuid, String>,
    cities: Vec<CityRow>,
    inventories: Vec<InventoryRow>,
    values: Vec<(Uuid, String, f64)>,
    // insertion order doubles as creation order
    rankings: Vec<Ranking>,
    ranked_actions: Vec<RankedAction>,
}

impl State {
    fn ranking_mut(&mut self, id: Uuid) -> StoreResult<&mut Ranking> {
        self.rankings
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "ranking",
                id: id.to_string(),
            })
    }

    fn inventory_record(&self, inventory_id: Uuid) -> Option<InventoryRecord> {
        let inventory = self.inventories.iter().find(|i| i.id == inventory_id)?;
        let city = self.cities.iter().find(|c| c.id == inventory.city_id)?;
        Some(InventoryRecord {
            id: inventory.id,
            city_id: city.id,
            project_id: city.project_id,
            locode: city.locode.clone(),
            year: inventory.year,
            inventory_type: inventory.inventory_type,
        })
    }
}

/// Process-local store for tests and `--in-memory` runs.
#[derive(Debug, Default)]
pub struct MemoryRankingStore {
    state: Mutex<State>,
}

impl MemoryRankingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_project(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.projects.insert(id, name.to_string());
        id
    }

    pub async fn add_city(&self, project_id: Uuid, locode: &str, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.cities.push(CityRow {
            id,
            project_id,
            locode: locode.to_string(),
            name: name.to_string(),
        });
        id
    }

    pub async fn add_inventory(&self, city_id: Uuid, year: i32, inventory_type: InventoryType) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().await.inventories.push(InventoryRow {
            id,
            city_id,
            year,
            inventory_type,
        });
        id
    }

    pub async fn add_inventory_value(&self, inventory_id: Uuid, gpc_ref_no: &str, co2eq: f64) {
        self.state
            .lock()
            .await
            .values
            .push((inventory_id, gpc_ref_no.to_string(), co2eq));
    }
}

#[async_trait]
impl RankingStore for MemoryRankingStore {
    async fn project_inventories(&self, project_id: Uuid, year: i32) -> StoreResult<Vec<CityInventory>> {
        let state = self.state.lock().await;
        let mut out = Vec::new();
        for city in state.cities.iter().filter(|c| c.project_id == project_id) {
            for inventory in state
                .inventories
                .iter()
                .filter(|i| i.city_id == city.id && i.year == year)
            {
                out.push(CityInventory {
                    city_id: city.id,
                    city_name: city.name.clone(),
                    locode: city.locode.clone(),
                    inventory_id: inventory.id,
                    year: inventory.year,
                    inventory_type: inventory.inventory_type,
                });
            }
        }
        Ok(out)
    }

    async fn inventory(&self, inventory_id: Uuid) -> StoreResult<Option<InventoryRecord>> {
        Ok(self.state.lock().await.inventory_record(inventory_id))
    }

    async fn sector_emissions(&self, inventory_id: Uuid) -> StoreResult<Vec<SectorEmission>> {
        let state = self.state.lock().await;
        let mut totals: BTreeMap<String, f64> = BTreeMap::new();
        for (inv, ref_no, co2eq) in &state.values {
            if *inv == inventory_id {
                *totals.entry(sector_of(ref_no).to_string()).or_default() += co2eq;
            }
        }
        Ok(totals
            .into_iter()
            .map(|(sector, co2eq)| SectorEmission { sector, co2eq })
            .collect())
    }

    async fn upsert_ranking(&self, new: &NewRanking) -> StoreResult<Ranking> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        if let Some(existing) = state.rankings.iter_mut().find(|r| {
            r.inventory_id == new.inventory_id
                && r.locode == new.locode
                && r.action_type == new.action_type
        }) {
            match existing.status {
                RankingStatus::ToDo => {
                    existing.langs = new.langs.clone();
                    existing.updated_at = now;
                }
                RankingStatus::Failure => {
                    existing.langs = new.langs.clone();
                    existing.status = RankingStatus::ToDo;
                    existing.job_id = None;
                    existing.error_message = None;
                    existing.updated_at = now;
                }
                RankingStatus::Pending | RankingStatus::Success => {}
            }
            return Ok(existing.clone());
        }

        let ranking = Ranking {
            id: Uuid::new_v4(),
            project_id: new.project_id,
            inventory_id: new.inventory_id,
            locode: new.locode.clone(),
            action_type: new.action_type,
            langs: new.langs.clone(),
            job_id: None,
            status: RankingStatus::ToDo,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.rankings.push(ranking.clone());
        Ok(ranking)
    }

    async fn ranking(&self, id: Uuid) -> StoreResult<Option<Ranking>> {
        let state = self.state.lock().await;
        Ok(state.rankings.iter().find(|r| r.id == id).cloned())
    }

    async fn rankings_for_inventory(&self, inventory_id: Uuid) -> StoreResult<Vec<Ranking>> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .iter()
            .filter(|r| r.inventory_id == inventory_id)
            .cloned()
            .collect())
    }

    async fn to_do_batch(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        limit: usize,
    ) -> StoreResult<Vec<Ranking>> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .iter()
            .filter(|r| {
                r.project_id == project_id
                    && r.action_type == action_type
                    && r.status == RankingStatus::ToDo
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_status(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        status: RankingStatus,
    ) -> StoreResult<usize> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .iter()
            .filter(|r| r.project_id == project_id && r.action_type == action_type && r.status == status)
            .count())
    }

    async fn mark_pending(&self, ids: &[Uuid], job_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        for id in ids {
            let ranking = state.ranking_mut(*id)?;
            if ranking.status != RankingStatus::ToDo {
                return Err(StoreError::InvalidTransition {
                    id: *id,
                    status: ranking.status,
                    target: RankingStatus::Pending,
                });
            }
        }
        let now = Utc::now();
        for id in ids {
            let ranking = state.ranking_mut(*id)?;
            ranking.status = RankingStatus::Pending;
            ranking.job_id = Some(job_id.to_string());
            ranking.error_message = None;
            ranking.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failure(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let ranking = state.ranking_mut(id)?;
        if !matches!(ranking.status, RankingStatus::ToDo | RankingStatus::Pending) {
            return Err(StoreError::InvalidTransition {
                id,
                status: ranking.status,
                target: RankingStatus::Failure,
            });
        }
        ranking.status = RankingStatus::Failure;
        ranking.error_message = Some(message.to_string());
        ranking.updated_at = Utc::now();
        Ok(())
    }

    async fn pending_jobs(&self) -> StoreResult<Vec<PendingJob>> {
        let state = self.state.lock().await;
        let jobs = state
            .rankings
            .iter()
            .filter(|r| r.status == RankingStatus::Pending)
            .filter_map(|r| {
                r.job_id.as_ref().map(|job_id| PendingJob {
                    job_id: job_id.clone(),
                    project_id: r.project_id,
                    action_type: r.action_type,
                })
            })
            .collect::<BTreeSet<_>>();
        Ok(jobs.into_iter().collect())
    }

    async fn rankings_for_job(&self, job_id: &str) -> StoreResult<Vec<Ranking>> {
        let state = self.state.lock().await;
        Ok(state
            .rankings
            .iter()
            .filter(|r| r.job_id.as_deref() == Some(job_id))
            .cloned()
            .collect())
    }

    async fn complete_ranking(&self, id: Uuid, actions: &[NewRankedAction]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let ranking = state.ranking_mut(id)?;
        if ranking.status != RankingStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id,
                status: ranking.status,
                target: RankingStatus::Success,
            });
        }
        ranking.status = RankingStatus::Success;
        ranking.error_message = None;
        ranking.updated_at = now;

        state.ranked_actions.extend(actions.iter().map(|a| RankedAction {
            id: Uuid::new_v4(),
            ranking_id: id,
            action_id: a.action_id.clone(),
            rank: a.rank,
            explanation: a.explanation.clone(),
            lang: a.lang.clone(),
            action_type: a.action_type,
            is_selected: false,
            created_at: now,
        }));
        Ok(())
    }

    async fn groups_with_to_do(&self) -> StoreResult<Vec<(Uuid, ActionType)>> {
        let state = self.state.lock().await;
        let groups = state
            .rankings
            .iter()
            .filter(|r| r.status == RankingStatus::ToDo)
            .map(|r| (r.project_id, r.action_type))
            .collect::<BTreeSet<_>>();
        Ok(groups.into_iter().collect())
    }

    async fn ranked_actions(&self, ranking_id: Uuid) -> StoreResult<Vec<RankedAction>> {
        let state = self.state.lock().await;
        let mut rows = state
            .ranked_actions
            .iter()
            .filter(|a| a.ranking_id == ranking_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| a.lang.cmp(&b.lang).then(a.rank.cmp(&b.rank)));
        Ok(rows)
    }

    async fn select_action(&self, ranking_id: Uuid, action_id: &str, selected: bool) -> StoreResult<usize> {
        let mut state = self.state.lock().await;
        let mut touched = 0;
        for action in state
            .ranked_actions
            .iter_mut()
            .filter(|a| a.ranking_id == ranking_id && a.action_id == action_id)
        {
            action.is_selected = selected;
            touched += 1;
        }
        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalyst_core::Language;

    async fn seeded() -> (MemoryRankingStore, Uuid, Uuid) {
        let store = MemoryRankingStore::new();
        let project = store.add_project("Brazil pilot").await;
        let city = store.add_city(project, "BR SAO", "São Paulo").await;
        let inventory = store.add_inventory(city, 2023, InventoryType::GpcBasic).await;
        (store, project, inventory)
    }

    fn new_ranking(project: Uuid, inventory: Uuid, langs: &[&str]) -> NewRanking {
        NewRanking {
            project_id: project,
            inventory_id: inventory,
            locode: "BR SAO".into(),
            action_type: ActionType::Mitigation,
            langs: langs.iter().map(|l| Language::new(l).unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_for_identical_input() {
        let (store, project, inventory) = seeded().await;
        let first = store.upsert_ranking(&new_ranking(project, inventory, &["en"])).await.unwrap();
        let second = store.upsert_ranking(&new_ranking(project, inventory, &["en"])).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.rankings_for_inventory(inventory).await.unwrap().len(), 1);
        assert_eq!(second.status, RankingStatus::ToDo);
        assert!(second.job_id.is_none());
    }

    #[tokio::test]
    async fn upsert_requeues_failures_and_keeps_pending_rows() {
        let (store, project, inventory) = seeded().await;
        let ranking = store.upsert_ranking(&new_ranking(project, inventory, &["en"])).await.unwrap();
        store.mark_pending(&[ranking.id], "job-1").await.unwrap();

        let again = store.upsert_ranking(&new_ranking(project, inventory, &["es"])).await.unwrap();
        assert_eq!(again.status, RankingStatus::Pending);
        assert_eq!(again.langs, vec![Language::english()]);

        store.mark_failure(ranking.id, "boom").await.unwrap();
        let requeued = store.upsert_ranking(&new_ranking(project, inventory, &["es"])).await.unwrap();
        assert_eq!(requeued.status, RankingStatus::ToDo);
        assert!(requeued.job_id.is_none());
        assert!(requeued.error_message.is_none());
        assert_eq!(requeued.langs[0].as_str(), "es");
    }

    #[tokio::test]
    async fn complete_requires_pending_and_attaches_actions() {
        let (store, project, inventory) = seeded().await;
        let ranking = store.upsert_ranking(&new_ranking(project, inventory, &["en"])).await.unwrap();
        let actions = vec![NewRankedAction {
            action_id: "c40_0001".into(),
            rank: 1,
            explanation: "cheap".into(),
            lang: Language::english(),
            action_type: ActionType::Mitigation,
        }];
        assert!(matches!(
            store.complete_ranking(ranking.id, &actions).await,
            Err(StoreError::InvalidTransition { .. })
        ));

        store.mark_pending(&[ranking.id], "job-1").await.unwrap();
        assert_eq!(store.pending_jobs().await.unwrap().len(), 1);
        store.complete_ranking(ranking.id, &actions).await.unwrap();
        assert!(store.pending_jobs().await.unwrap().is_empty());
        assert_eq!(store.ranked_actions(ranking.id).await.unwrap().len(), 1);
        assert_eq!(store.select_action(ranking.id, "c40_0001", true).await.unwrap(), 1);
        assert!(store.ranked_actions(ranking.id).await.unwrap()[0].is_selected);
    }

    #[tokio::test]
    async fn finished_rankings_cannot_be_failed() {
        let (store, project, inventory) = seeded().await;
        let ranking = store.upsert_ranking(&new_ranking(project, inventory, &["en"])).await.unwrap();
        store.mark_pending(&[ranking.id], "job-1").await.unwrap();
        store.complete_ranking(ranking.id, &[]).await.unwrap();

        assert!(matches!(
            store.mark_failure(ranking.id, "late error").await,
            Err(StoreError::InvalidTransition {
                status: RankingStatus::Success,
                target: RankingStatus::Failure,
                ..
            })
        ));
        let stored = store.ranking(ranking.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RankingStatus::Success);
        assert!(stored.error_message.is_none());
    }

    #[tokio::test]
    async fn sector_emissions_are_summed_per_sector() {
        let (store, _project, inventory) = seeded().await;
        store.add_inventory_value(inventory, "I.1.1", 10.0).await;
        store.add_inventory_value(inventory, "I.2.1", 5.0).await;
        store.add_inventory_value(inventory, "III.1.1", 2.5).await;
        let totals = store.sector_emissions(inventory).await.unwrap();
        assert_eq!(
            totals,
            vec![
                SectorEmission { sector: "I".into(), co2eq: 15.0 },
                SectorEmission { sector: "III".into(), co2eq: 2.5 },
            ]
        );
    }

    #[tokio::test]
    async fn project_inventories_filters_by_year() {
        let (store, project, _inventory) = seeded().await;
        let other_city = store.add_city(project, "BR RIO", "Rio de Janeiro").await;
        store.add_inventory(other_city, 2022, InventoryType::GpcBasicPlus).await;
        let rows = store.project_inventories(project, 2023).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].locode, "BR SAO");
    }
}
