//! PostgreSQL backend. Entities are stored as JSONB documents next to the
//! normalized lookup keys; provenance ids live in their own table.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herbsync_core::{
    CatalogEntity, CheckpointPatch, EntityOrigin, EntityPatch, ImportCheckpoint, ImportRunLog,
    LifecycleStatus,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::{CatalogStore, CheckpointStore, RunLogStore, StoreError};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn origin_str(origin: EntityOrigin) -> &'static str {
    match origin {
        EntityOrigin::Imported => "imported",
        EntityOrigin::Manual => "manual",
    }
}

fn entity_from_row(row: &PgRow) -> Result<CatalogEntity, StoreError> {
    let Json(entity): Json<CatalogEntity> = row.try_get("data_json")?;
    Ok(entity)
}

fn checkpoint_from_row(row: &PgRow) -> Result<ImportCheckpoint, StoreError> {
    let current_page: i32 = row.try_get("current_page")?;
    let current_page = u32::try_from(current_page)
        .map_err(|_| StoreError::Invalid(format!("negative current_page {current_page}")))?;
    Ok(ImportCheckpoint {
        provider: row.try_get("provider")?,
        current_page,
        is_complete: row.try_get("is_complete")?,
        last_run_at: row.try_get::<Option<DateTime<Utc>>, _>("last_run_at")?,
        last_completed_at: row.try_get::<Option<DateTime<Utc>>, _>("last_completed_at")?,
    })
}

fn page_to_db(page: Option<u32>) -> Result<Option<i32>, StoreError> {
    page.map(|p| i32::try_from(p).map_err(|_| StoreError::Invalid(format!("page {p} out of range"))))
        .transpose()
}

async fn sync_provenance(
    tx: &mut Transaction<'_, Postgres>,
    entity_id: Uuid,
    provenance: &BTreeMap<String, i64>,
) -> Result<(), StoreError> {
    for (provider, record_id) in provenance {
        sqlx::query(
            r#"
            DELETE FROM catalog_provenance
             WHERE entity_id = $1 AND provider = $2 AND provider_record_id <> $3
            "#,
        )
        .bind(entity_id)
        .bind(provider)
        .bind(record_id)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO catalog_provenance (provider, provider_record_id, entity_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, provider_record_id)
            DO UPDATE SET entity_id = EXCLUDED.entity_id
            "#,
        )
        .bind(provider)
        .bind(record_id)
        .bind(entity_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn write_entity_row(
    tx: &mut Transaction<'_, Postgres>,
    entity: &CatalogEntity,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO catalog_entities
            (id, scientific_key, display_key, status, origin, data_json, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        ON CONFLICT (id) DO UPDATE
           SET scientific_key = EXCLUDED.scientific_key,
               display_key = EXCLUDED.display_key,
               status = EXCLUDED.status,
               origin = EXCLUDED.origin,
               data_json = EXCLUDED.data_json,
               updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(entity.id)
    .bind(entity.scientific_key())
    .bind(entity.display_key())
    .bind(entity.status.as_str())
    .bind(origin_str(entity.origin))
    .bind(Json(entity))
    .bind(entity.created_at)
    .bind(entity.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_by_provenance_id(
        &self,
        provider: &str,
        record_id: i64,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT e.data_json
              FROM catalog_entities e
              JOIN catalog_provenance p ON p.entity_id = e.id
             WHERE p.provider = $1 AND p.provider_record_id = $2
             LIMIT 1
            "#,
        )
        .bind(provider)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn find_by_scientific_name(
        &self,
        scientific_key: &str,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data_json
              FROM catalog_entities
             WHERE scientific_key = $1
             ORDER BY created_at, id
             LIMIT 1
            "#,
        )
        .bind(scientific_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn find_by_display_name(
        &self,
        display_key: &str,
    ) -> Result<Option<CatalogEntity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT data_json
              FROM catalog_entities
             WHERE display_key = $1
             ORDER BY created_at, id
             LIMIT 1
            "#,
        )
        .bind(display_key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(entity_from_row).transpose()
    }

    async fn create_draft(&self, mut entity: CatalogEntity) -> Result<CatalogEntity, StoreError> {
        entity.status = LifecycleStatus::Draft;
        let mut tx = self.pool.begin().await?;
        write_entity_row(&mut tx, &entity).await?;
        sync_provenance(&mut tx, entity.id, &entity.provenance).await?;
        tx.commit().await?;
        Ok(entity)
    }

    async fn update_by_id(&self, id: Uuid, patch: &EntityPatch) -> Result<CatalogEntity, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT data_json FROM catalog_entities WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(id));
        };
        let mut entity = entity_from_row(&row)?;
        patch.apply_to(&mut entity, Utc::now());
        write_entity_row(&mut tx, &entity).await?;
        sync_provenance(&mut tx, id, &patch.provenance).await?;
        tx.commit().await?;
        Ok(entity)
    }

    async fn list_all(&self) -> Result<Vec<CatalogEntity>, StoreError> {
        let rows = sqlx::query("SELECT data_json FROM catalog_entities ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entity_from_row).collect()
    }

    async fn delete_by_id(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM catalog_entities WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

impl PgStore {
    async fn ensure_checkpoint_row(&self, provider: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO import_checkpoints (provider) VALUES ($1) ON CONFLICT (provider) DO NOTHING",
        )
        .bind(provider)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load_checkpoint(&self, provider: &str) -> Result<ImportCheckpoint, StoreError> {
        self.ensure_checkpoint_row(provider).await?;
        let row = sqlx::query(
            r#"
            SELECT provider, current_page, is_complete, last_run_at, last_completed_at
              FROM import_checkpoints
             WHERE provider = $1
            "#,
        )
        .bind(provider)
        .fetch_one(&self.pool)
        .await?;
        checkpoint_from_row(&row)
    }

    async fn save_checkpoint(
        &self,
        provider: &str,
        patch: &CheckpointPatch,
    ) -> Result<ImportCheckpoint, StoreError> {
        self.ensure_checkpoint_row(provider).await?;
        let row = sqlx::query(
            r#"
            UPDATE import_checkpoints
               SET current_page = COALESCE($2, current_page),
                   is_complete = COALESCE($3, is_complete),
                   last_run_at = COALESCE($4, last_run_at),
                   last_completed_at = COALESCE($5, last_completed_at)
             WHERE provider = $1
            RETURNING provider, current_page, is_complete, last_run_at, last_completed_at
            "#,
        )
        .bind(provider)
        .bind(page_to_db(patch.current_page)?)
        .bind(patch.is_complete)
        .bind(patch.last_run_at)
        .bind(patch.last_completed_at)
        .fetch_one(&self.pool)
        .await?;
        checkpoint_from_row(&row)
    }

    async fn list_checkpoints(&self) -> Result<Vec<ImportCheckpoint>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT provider, current_page, is_complete, last_run_at, last_completed_at
              FROM import_checkpoints
             ORDER BY provider
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn try_acquire_lease(
        &self,
        provider: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_checkpoint_row(provider).await?;
        let result = sqlx::query(
            r#"
            UPDATE import_checkpoints
               SET lease_holder = $2,
                   lease_expires_at = now() + make_interval(secs => $3)
             WHERE provider = $1
               AND (lease_holder IS NULL
                    OR lease_holder = $2
                    OR lease_expires_at IS NULL
                    OR lease_expires_at < now())
            "#,
        )
        .bind(provider)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, provider: &str, holder: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE import_checkpoints
               SET lease_holder = NULL, lease_expires_at = NULL
             WHERE provider = $1 AND lease_holder = $2
            "#,
        )
        .bind(provider)
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunLogStore for PgStore {
    async fn append_run_log(&self, entry: &ImportRunLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO import_run_logs (id, run_id, provider, outcome, data_json, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.run_id)
        .bind(&entry.provider)
        .bind(&entry.outcome)
        .bind(Json(entry))
        .bind(entry.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> Result<Vec<ImportRunLog>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT data_json FROM import_run_logs ORDER BY created_at DESC, id DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let Json(entry): Json<ImportRunLog> = row.try_get("data_json")?;
                Ok(entry)
            })
            .collect()
    }
}
