//! Item repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use crate::jobs::insert_job;

use intake_core::{
    new_v7, Analysis, Error, Item, ItemEffect, ItemMetadata, ItemNote, ItemStore, JobType,
    NewItem, NewItemNote, NoteKind, Result, StatusCount, WorkerJob,
};

pub(crate) const ITEM_COLUMNS: &str = "id, owner, content_type, content, title, status, analysis, \
     metadata, is_normalized, created_at, updated_at";

const NOTE_COLUMNS: &str = "id, item_id, owner, text, kind, created_at";

/// PostgreSQL implementation of ItemStore.
#[derive(Clone)]
pub struct PgItemRepository {
    pool: Pool<Postgres>,
}

impl PgItemRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse an item row.
    pub(crate) fn parse_item_row(row: &PgRow) -> Result<Item> {
        let content_type: String = row.get("content_type");
        let status: String = row.get("status");
        let analysis: Option<JsonValue> = row.get("analysis");
        let metadata: Option<JsonValue> = row.get("metadata");

        Ok(Item {
            id: row.get("id"),
            owner: row.get("owner"),
            content_type: content_type.parse()?,
            content: row.get("content"),
            title: row.get("title"),
            status: status.parse()?,
            analysis: analysis
                .map(serde_json::from_value::<Analysis>)
                .transpose()?,
            metadata: metadata
                .map(serde_json::from_value::<ItemMetadata>)
                .transpose()?,
            is_normalized: row.get("is_normalized"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_note_row(row: &PgRow) -> Result<ItemNote> {
        let kind: String = row.get("kind");
        Ok(ItemNote {
            id: row.get("id"),
            item_id: row.get("item_id"),
            owner: row.get("owner"),
            text: row.get("text"),
            kind: kind.parse()?,
            created_at: row.get("created_at"),
        })
    }
}

/// Insert a `new` item on `conn`.
async fn insert_item(conn: &mut PgConnection, item: &NewItem) -> Result<Item> {
    let metadata = item.metadata.as_ref().map(serde_json::to_value).transpose()?;

    let row = sqlx::query(&format!(
        "INSERT INTO items (id, owner, content_type, content, title, status, metadata,
                            is_normalized, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, 'new', $6, FALSE, $7, $7)
         RETURNING {ITEM_COLUMNS}"
    ))
    .bind(new_v7())
    .bind(&item.owner)
    .bind(item.content_type.as_str())
    .bind(&item.content)
    .bind(&item.title)
    .bind(metadata)
    .bind(Utc::now())
    .fetch_one(&mut *conn)
    .await
    .map_err(Error::Database)?;

    PgItemRepository::parse_item_row(&row)
}

/// Apply an item effect as a single conditional update.
///
/// Shared with the job repository so a release can apply its effect in the
/// same transaction that resolves the job.
pub(crate) async fn apply_effect(conn: &mut PgConnection, effect: &ItemEffect) -> Result<bool> {
    let expected: Vec<String> = effect
        .expected_status
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    let analysis = effect
        .update
        .analysis
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let updated = sqlx::query(
        "UPDATE items
         SET status = COALESCE($2, status),
             analysis = COALESCE($3, analysis),
             title = COALESCE($4, title),
             is_normalized = is_normalized OR $5,
             updated_at = now()
         WHERE id = $1
           AND (cardinality($6::text[]) = 0 OR status = ANY($6))
         RETURNING id",
    )
    .bind(effect.item_id)
    .bind(effect.update.status.map(|s| s.as_str()))
    .bind(analysis)
    .bind(effect.update.title.as_deref())
    .bind(effect.update.mark_normalized)
    .bind(&expected)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;

    if updated.is_some() {
        return Ok(true);
    }

    let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM items WHERE id = $1)")
        .bind(effect.item_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(Error::Database)?;

    if exists {
        debug!(
            subsystem = "db",
            component = "items",
            op = "apply_effect",
            item_id = %effect.item_id,
            "Item status moved on, effect skipped"
        );
        Ok(false)
    } else {
        Err(Error::ItemNotFound(effect.item_id))
    }
}

/// Replace the tags on an analysis. Items without an analysis cannot be tagged.
pub(crate) fn retag(item: &Item, tags: Vec<String>) -> Result<Analysis> {
    let mut analysis = item.analysis.clone().ok_or_else(|| {
        Error::InvalidInput(format!("item {} has no analysis to tag", item.id))
    })?;
    analysis.tags = tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    Ok(analysis)
}

#[async_trait]
impl ItemStore for PgItemRepository {
    async fn insert(&self, item: NewItem) -> Result<Item> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        insert_item(&mut *conn, &item).await
    }

    async fn insert_with_jobs(
        &self,
        item: NewItem,
        job_types: &[JobType],
    ) -> Result<(Item, Vec<WorkerJob>)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let item = insert_item(&mut *tx, &item).await?;
        let mut jobs = Vec::with_capacity(job_types.len());
        for job_type in job_types {
            jobs.push(insert_job(&mut *tx, *job_type, item.id).await?);
        }

        tx.commit().await.map_err(Error::Database)?;
        debug!(
            subsystem = "db",
            component = "items",
            op = "insert_with_jobs",
            item_id = %item.id,
            jobs = jobs.len(),
            "Item inserted with jobs"
        );
        Ok((item, jobs))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_item_row).transpose()
    }

    async fn apply(&self, effect: &ItemEffect) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        apply_effect(&mut *conn, effect).await
    }

    async fn update_details(
        &self,
        id: Uuid,
        title: Option<String>,
        tags: Option<Vec<String>>,
    ) -> Result<Item> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::ItemNotFound(id))?;
        let item = Self::parse_item_row(&row)?;

        let analysis = match tags {
            Some(tags) => Some(serde_json::to_value(retag(&item, tags)?)?),
            None => None,
        };

        let row = sqlx::query(&format!(
            "UPDATE items
             SET title = COALESCE($2, title),
                 analysis = COALESCE($3, analysis),
                 updated_at = $4
             WHERE id = $1
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id)
        .bind(title)
        .bind(analysis)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Self::parse_item_row(&row)
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_passed_timeline(&self, today: NaiveDate, limit: i64) -> Result<Vec<Item>> {
        // Timeline dates are stored zero-padded, so string order is date order.
        let rows = sqlx::query(&format!(
            r"SELECT {ITEM_COLUMNS} FROM items
             WHERE status = 'timeline'
               AND analysis->'timeline'->>'date' ~ '^\d{{4}}-\d{{2}}-\d{{2}}$'
               AND analysis->'timeline'->>'date' < $1
             ORDER BY updated_at ASC
             LIMIT $2"
        ))
        .bind(today.format("%Y-%m-%d").to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_item_row).collect()
    }

    async fn list_due_deferred(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE status = 'follow_up'
               AND CASE WHEN analysis->'follow_up'->'state'->>'kind' = 'deferred'
                        THEN (analysis->'follow_up'->'state'->>'until')::timestamptz <= $1
                        ELSE FALSE
                   END
             ORDER BY updated_at ASC
             LIMIT $2"
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_item_row).collect()
    }

    async fn count_by_status(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM items GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(StatusCount {
                    status: status.parse()?,
                    count: row.get("count"),
                })
            })
            .collect()
    }

    async fn owner_tags(&self, owner: &str, limit: i64) -> Result<Vec<String>> {
        let tags: Vec<String> = sqlx::query_scalar(
            "SELECT tag FROM (
                 SELECT tag, COUNT(*) AS uses
                 FROM items,
                      jsonb_array_elements_text(COALESCE(analysis->'tags', '[]'::jsonb)) AS tag
                 WHERE owner = $1 AND status <> 'soft_deleted'
                 GROUP BY tag
             ) t
             ORDER BY uses DESC, tag ASC
             LIMIT $2",
        )
        .bind(owner)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(tags)
    }

    async fn add_note(&self, note: NewItemNote) -> Result<ItemNote> {
        let row = sqlx::query(&format!(
            "INSERT INTO item_notes (id, item_id, owner, text, kind, created_at)
             SELECT $1, $2, $3, $4, $5, $6
             WHERE EXISTS (SELECT 1 FROM items WHERE id = $2)
             RETURNING {NOTE_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(note.item_id)
        .bind(&note.owner)
        .bind(&note.text)
        .bind(note.kind.as_str())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .ok_or(Error::InvalidTarget(note.item_id))?;

        Self::parse_note_row(&row)
    }

    async fn list_notes(&self, item_id: Uuid, kind: Option<NoteKind>) -> Result<Vec<ItemNote>> {
        let rows = sqlx::query(&format!(
            "SELECT {NOTE_COLUMNS} FROM item_notes
             WHERE item_id = $1 AND ($2::text IS NULL OR kind = $2)
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(item_id)
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_note_row).collect()
    }
}
