use async_trait::async_trait;
use catalyst_core::{
    ActionType, CityInventory, InventoryRecord, Language, NewRankedAction, NewRanking,
    RankedAction, Ranking, RankingStatus, SectorEmission,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{PendingJob, RankingStore, StoreError, StoreResult};

const RANKING_COLUMNS: &str = "id, project_id, inventory_id, locode, action_type, langs, job_id, \
                               status, error_message, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgRankingStore {
    pool: PgPool,
}

impl PgRankingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn ranking_from_row(row: &PgRow) -> StoreResult<Ranking> {
    let action_type: String = row.try_get("action_type")?;
    let status: String = row.try_get("status")?;
    let langs: Vec<String> = row.try_get("langs")?;
    Ok(Ranking {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        inventory_id: row.try_get("inventory_id")?,
        locode: row.try_get("locode")?,
        action_type: action_type.parse()?,
        langs: langs
            .iter()
            .map(|l| Language::new(l))
            .collect::<Result<Vec<_>, _>>()?,
        job_id: row.try_get("job_id")?,
        status: status.parse()?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ranked_action_from_row(row: &PgRow) -> StoreResult<RankedAction> {
    let rank: i32 = row.try_get("rank")?;
    let lang: String = row.try_get("lang")?;
    let action_type: String = row.try_get("action_type")?;
    Ok(RankedAction {
        id: row.try_get("id")?,
        ranking_id: row.try_get("ranking_id")?,
        action_id: row.try_get("action_id")?,
        rank: rank.max(1) as u32,
        explanation: row.try_get("explanation")?,
        lang: Language::new(&lang)?,
        action_type: action_type.parse()?,
        is_selected: row.try_get("is_selected")?,
        created_at: row.try_get("created_at")?,
    })
}

fn lang_strings(langs: &[Language]) -> Vec<String> {
    langs.iter().map(|l| l.as_str().to_string()).collect()
}

#[async_trait]
impl RankingStore for PgRankingStore {
    async fn project_inventories(&self, project_id: Uuid, year: i32) -> StoreResult<Vec<CityInventory>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id AS city_id, c.name AS city_name, c.locode,
                   i.id AS inventory_id, i.year, i.inventory_type
              FROM city c
              JOIN inventory i ON i.city_id = c.id
             WHERE c.project_id = $1
               AND i.year = $2
             ORDER BY c.created_at, c.id, i.created_at
            "#,
        )
        .bind(project_id)
        .bind(year)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let inventory_type: String = row.try_get("inventory_type")?;
            out.push(CityInventory {
                city_id: row.try_get("city_id")?,
                city_name: row.try_get("city_name")?,
                locode: row.try_get("locode")?,
                inventory_id: row.try_get("inventory_id")?,
                year: row.try_get("year")?,
                inventory_type: inventory_type.parse()?,
            });
        }
        Ok(out)
    }

    async fn inventory(&self, inventory_id: Uuid) -> StoreResult<Option<InventoryRecord>> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.city_id, c.project_id, c.locode, i.year, i.inventory_type
              FROM inventory i
              JOIN city c ON c.id = i.city_id
             WHERE i.id = $1
            "#,
        )
        .bind(inventory_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let inventory_type: String = row.try_get("inventory_type")?;
        Ok(Some(InventoryRecord {
            id: row.try_get("id")?,
            city_id: row.try_get("city_id")?,
            project_id: row.try_get("project_id")?,
            locode: row.try_get("locode")?,
            year: row.try_get("year")?,
            inventory_type: inventory_type.parse()?,
        }))
    }

    async fn sector_emissions(&self, inventory_id: Uuid) -> StoreResult<Vec<SectorEmission>> {
        let rows = sqlx::query(
            r#"
            SELECT split_part(gpc_ref_no, '.', 1) AS sector,
                   COALESCE(SUM(co2eq), 0) AS co2eq
              FROM inventory_value
             WHERE inventory_id = $1
             GROUP BY 1
             ORDER BY 1
            "#,
        )
        .bind(inventory_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SectorEmission {
                sector: row.try_get("sector")?,
                co2eq: row.try_get("co2eq")?,
            });
        }
        Ok(out)
    }

    async fn upsert_ranking(&self, new: &NewRanking) -> StoreResult<Ranking> {
        let sql = format!(
            r#"
            INSERT INTO hiap_ranking (id, project_id, inventory_id, locode, action_type, langs, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'TO_DO')
            ON CONFLICT (inventory_id, locode, action_type) DO UPDATE
               SET langs = CASE WHEN hiap_ranking.status IN ('TO_DO', 'FAILURE')
                                THEN EXCLUDED.langs ELSE hiap_ranking.langs END,
                   job_id = CASE WHEN hiap_ranking.status = 'FAILURE'
                                 THEN NULL ELSE hiap_ranking.job_id END,
                   error_message = CASE WHEN hiap_ranking.status = 'FAILURE'
                                        THEN NULL ELSE hiap_ranking.error_message END,
                   status = CASE WHEN hiap_ranking.status = 'FAILURE'
                                 THEN 'TO_DO' ELSE hiap_ranking.status END,
                   updated_at = CASE WHEN hiap_ranking.status IN ('TO_DO', 'FAILURE')
                                     THEN NOW() ELSE hiap_ranking.updated_at END
            RETURNING {RANKING_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(new.project_id)
            .bind(new.inventory_id)
            .bind(&new.locode)
            .bind(new.action_type.as_str())
            .bind(lang_strings(&new.langs))
            .fetch_one(&self.pool)
            .await?;
        ranking_from_row(&row)
    }

    async fn ranking(&self, id: Uuid) -> StoreResult<Option<Ranking>> {
        let sql = format!("SELECT {RANKING_COLUMNS} FROM hiap_ranking WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(ranking_from_row).transpose()
    }

    async fn rankings_for_inventory(&self, inventory_id: Uuid) -> StoreResult<Vec<Ranking>> {
        let sql = format!(
            "SELECT {RANKING_COLUMNS} FROM hiap_ranking WHERE inventory_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql).bind(inventory_id).fetch_all(&self.pool).await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn to_do_batch(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        limit: usize,
    ) -> StoreResult<Vec<Ranking>> {
        let sql = format!(
            r#"
            SELECT {RANKING_COLUMNS}
              FROM hiap_ranking
             WHERE project_id = $1
               AND action_type = $2
               AND status = 'TO_DO'
             ORDER BY created_at, id
             LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(project_id)
            .bind(action_type.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn count_status(
        &self,
        project_id: Uuid,
        action_type: ActionType,
        status: RankingStatus,
    ) -> StoreResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
              FROM hiap_ranking
             WHERE project_id = $1 AND action_type = $2 AND status = $3
            "#,
        )
        .bind(project_id)
        .bind(action_type.as_str())
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn mark_pending(&self, ids: &[Uuid], job_id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id, status FROM hiap_ranking WHERE id = ANY($1) FOR UPDATE")
            .bind(ids)
            .fetch_all(&mut *tx)
            .await?;
        for id in ids {
            let Some(row) = rows
                .iter()
                .find(|r| r.try_get::<Uuid, _>("id").ok() == Some(*id))
            else {
                return Err(StoreError::NotFound {
                    entity: "ranking",
                    id: id.to_string(),
                });
            };
            let status: String = row.try_get("status")?;
            let status: RankingStatus = status.parse()?;
            if status != RankingStatus::ToDo {
                return Err(StoreError::InvalidTransition {
                    id: *id,
                    status,
                    target: RankingStatus::Pending,
                });
            }
        }

        sqlx::query(
            r#"
            UPDATE hiap_ranking
               SET status = 'PENDING',
                   job_id = $1,
                   error_message = NULL,
                   updated_at = NOW()
             WHERE id = ANY($2)
            "#,
        )
        .bind(job_id)
        .bind(ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_failure(&self, id: Uuid, message: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM hiap_ranking WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(status) = status else {
            return Err(StoreError::NotFound {
                entity: "ranking",
                id: id.to_string(),
            });
        };
        let status: RankingStatus = status.parse()?;
        if !matches!(status, RankingStatus::ToDo | RankingStatus::Pending) {
            return Err(StoreError::InvalidTransition {
                id,
                status,
                target: RankingStatus::Failure,
            });
        }

        sqlx::query(
            r#"
            UPDATE hiap_ranking
               SET status = 'FAILURE',
                   error_message = $2,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pending_jobs(&self) -> StoreResult<Vec<PendingJob>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT job_id, project_id, action_type
              FROM hiap_ranking
             WHERE status = 'PENDING'
               AND job_id IS NOT NULL
             ORDER BY job_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let action_type: String = row.try_get("action_type")?;
            out.push(PendingJob {
                job_id: row.try_get("job_id")?,
                project_id: row.try_get("project_id")?,
                action_type: action_type.parse()?,
            });
        }
        Ok(out)
    }

    async fn rankings_for_job(&self, job_id: &str) -> StoreResult<Vec<Ranking>> {
        let sql = format!(
            "SELECT {RANKING_COLUMNS} FROM hiap_ranking WHERE job_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql).bind(job_id).fetch_all(&self.pool).await?;
        rows.iter().map(ranking_from_row).collect()
    }

    async fn complete_ranking(&self, id: Uuid, actions: &[NewRankedAction]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM hiap_ranking WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(status) = status else {
            return Err(StoreError::NotFound {
                entity: "ranking",
                id: id.to_string(),
            });
        };
        let status: RankingStatus = status.parse()?;
        if status != RankingStatus::Pending {
            return Err(StoreError::InvalidTransition {
                id,
                status,
                target: RankingStatus::Success,
            });
        }

        for action in actions {
            sqlx::query(
                r#"
                INSERT INTO hiap_ranked_action
                    (id, ranking_id, action_id, rank, explanation, lang, action_type)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(id)
            .bind(&action.action_id)
            .bind(i32::try_from(action.rank).unwrap_or(i32::MAX))
            .bind(&action.explanation)
            .bind(action.lang.as_str())
            .bind(action.action_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE hiap_ranking
               SET status = 'SUCCESS',
                   error_message = NULL,
                   updated_at = NOW()
             WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn groups_with_to_do(&self) -> StoreResult<Vec<(Uuid, ActionType)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT project_id, action_type
              FROM hiap_ranking
             WHERE status = 'TO_DO'
             ORDER BY project_id, action_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let action_type: String = row.try_get("action_type")?;
            out.push((row.try_get("project_id")?, action_type.parse()?));
        }
        Ok(out)
    }

    async fn ranked_actions(&self, ranking_id: Uuid) -> StoreResult<Vec<RankedAction>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ranking_id, action_id, rank, explanation, lang, action_type,
                   is_selected, created_at
              FROM hiap_ranked_action
             WHERE ranking_id = $1
             ORDER BY lang, rank
            "#,
        )
        .bind(ranking_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(ranked_action_from_row).collect()
    }

    async fn select_action(&self, ranking_id: Uuid, action_id: &str, selected: bool) -> StoreResult<usize> {
        let result = sqlx::query(
            r#"
            UPDATE hiap_ranked_action
               SET is_selected = $3
             WHERE ranking_id = $1
               AND action_id = $2
            "#,
        )
        .bind(ranking_id)
        .bind(action_id)
        .bind(selected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }
}
