//! Record store contract, in-memory and Postgres implementations, and the dedup check.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gamefeed_core::{CandidateRecord, Image, PersistedRecord, Tag};
use gamefeed_storage::ImageStore;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a record with url {0} already exists")]
    DuplicateUrl(String),
    #[error("record {0} not found")]
    NotFound(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_by_url(&self, url: &str) -> Result<Option<PersistedRecord>, StoreError>;
    async fn create(&self, record: CandidateRecord) -> Result<PersistedRecord, StoreError>;
    /// Appends the image after the record's existing images; returns the image id.
    async fn attach_image(&self, record_id: i64, image: &Image) -> Result<String, StoreError>;
    async fn list_records(&self, name_filter: Option<&str>) -> Result<Vec<PersistedRecord>, StoreError>;
    async fn list_tags(&self) -> Result<Vec<Tag>, StoreError>;
}

/// Exact-match URL lookup run before any synthesis.
#[derive(Clone)]
pub struct DedupCheck {
    store: Arc<dyn RecordStore>,
}

impl DedupCheck {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// No normalization: scheme case and trailing slashes make distinct URLs.
    pub async fn exists_by_url(&self, url: &str) -> Result<bool, StoreError> {
        Ok(self.store.find_by_url(url).await?.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedImage {
    pub record_id: i64,
    pub position: u32,
    pub image_id: String,
    pub byte_len: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<PersistedRecord>,
    tags: Vec<Tag>,
    images: Vec<AttachedImage>,
    next_id: i64,
}

/// Process-local store; optionally writes attached images to an `ImageStore`.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: Mutex<MemoryState>,
    image_store: Option<ImageStore>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image_store(mut self, image_store: ImageStore) -> Self {
        self.image_store = Some(image_store);
        self
    }

    pub fn with_tags(mut self, tags: Vec<Tag>) -> Self {
        self.state.get_mut().tags = tags;
        self
    }

    pub async fn images(&self) -> Vec<AttachedImage> {
        self.state.lock().await.images.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.iter().find(|r| r.url == url).cloned())
    }

    async fn create(&self, record: CandidateRecord) -> Result<PersistedRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.records.iter().any(|r| r.url == record.url) {
            return Err(StoreError::DuplicateUrl(record.url));
        }
        state.next_id += 1;
        let persisted = PersistedRecord {
            id: state.next_id,
            name: record.name,
            description: record.description,
            url: record.url,
            tag_ids: record.tag_ids,
            created_at: Utc::now(),
        };
        state.records.push(persisted.clone());
        Ok(persisted)
    }

    async fn attach_image(&self, record_id: i64, image: &Image) -> Result<String, StoreError> {
        if !self.state.lock().await.records.iter().any(|r| r.id == record_id) {
            return Err(StoreError::NotFound(record_id));
        }

        let image_id = match &self.image_store {
            Some(store) => store.store_image(record_id, image).await?.image_id(),
            None => format!("{record_id}/{}.{}", image.sha256_hex(), image.extension()),
        };

        let mut state = self.state.lock().await;
        let position = state
            .images
            .iter()
            .filter(|i| i.record_id == record_id)
            .map(|i| i.position + 1)
            .max()
            .unwrap_or(0);
        state.images.push(AttachedImage {
            record_id,
            position,
            image_id: image_id.clone(),
            byte_len: image.byte_len(),
        });
        Ok(image_id)
    }

    async fn list_records(&self, name_filter: Option<&str>) -> Result<Vec<PersistedRecord>, StoreError> {
        let state = self.state.lock().await;
        let needle = name_filter.map(str::to_lowercase);
        Ok(state
            .records
            .iter()
            .filter(|r| match &needle {
                Some(n) => r.name.to_lowercase().contains(n),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_tags(&self) -> Result<Vec<Tag>, StoreError> {
        Ok(self.state.lock().await.tags.clone())
    }
}

/// Store backed by the existing Postgres tables `games`, `tags`, `game_tags`
/// and `game_images`. Schema management lives elsewhere.
pub struct PgRecordStore {
    pool: PgPool,
    images: ImageStore,
    proposing_user: Option<Uuid>,
}

impl PgRecordStore {
    pub fn new(pool: PgPool, images: ImageStore) -> Self {
        Self {
            pool,
            images,
            proposing_user: None,
        }
    }

    pub async fn connect(database_url: &str, images: ImageStore) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self::new(pool, images))
    }

    /// Account recorded as the proposer of pipeline-created records.
    pub fn with_proposing_user(mut self, user: Option<Uuid>) -> Self {
        self.proposing_user = user;
        self
    }

    const RECORD_COLUMNS: &'static str = r#"
        SELECT g.id::bigint AS id,
               g.name,
               COALESCE(g.description, '') AS description,
               g.url,
               g.created_at::timestamptz AS created_at,
               COALESCE(array_agg(gt.tag_id::bigint) FILTER (WHERE gt.tag_id IS NOT NULL), ARRAY[]::bigint[]) AS tag_ids
          FROM games g
          LEFT JOIN game_tags gt ON gt.game_id = g.id
    "#;

    fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<PersistedRecord, StoreError> {
        Ok(PersistedRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            url: row.try_get("url")?,
            tag_ids: row.try_get("tag_ids")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<PersistedRecord>, StoreError> {
        let sql = format!("{} WHERE g.url = $1 GROUP BY g.id LIMIT 1", Self::RECORD_COLUMNS);
        let row = sqlx::query(&sql).bind(url).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn create(&self, record: CandidateRecord) -> Result<PersistedRecord, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO games (name, description, url, proposing_user, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'approved', NOW(), NOW())
            RETURNING id::bigint AS id, created_at::timestamptz AS created_at
            "#,
        )
        .bind(&record.name)
        .bind(&record.description)
        .bind(&record.url)
        .bind(self.proposing_user)
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateUrl(record.url.clone())
            }
            _ => StoreError::Database(err),
        })?;
        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        let tag_rows = sqlx::query(
            r#"
            INSERT INTO game_tags (game_id, tag_id)
            SELECT $1, t.id FROM tags t WHERE t.id::bigint = ANY($2)
            RETURNING tag_id::bigint AS tag_id
            "#,
        )
        .bind(id)
        .bind(&record.tag_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let tag_ids = tag_rows
            .iter()
            .map(|r| r.try_get::<i64, _>("tag_id"))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(id, url = %record.url, tags = tag_ids.len(), "inserted record");

        Ok(PersistedRecord {
            id,
            name: record.name,
            description: record.description,
            url: record.url,
            tag_ids,
            created_at,
        })
    }

    async fn attach_image(&self, record_id: i64, image: &Image) -> Result<String, StoreError> {
        let stored = self.images.store_image(record_id, image).await?;
        let image_id = stored.image_id();
        let result = sqlx::query(
            r#"
            INSERT INTO game_images (game_id, position, image)
            SELECT g.id,
                   COALESCE((SELECT MAX(gi.position) + 1 FROM game_images gi WHERE gi.game_id = g.id), 0),
                   $2
              FROM games g
             WHERE g.id = $1
            "#,
        )
        .bind(record_id)
        .bind(&image_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record_id));
        }
        Ok(image_id)
    }

    async fn list_records(&self, name_filter: Option<&str>) -> Result<Vec<PersistedRecord>, StoreError> {
        let sql = format!(
            "{} WHERE ($1::text IS NULL OR g.name ILIKE '%' || $1 || '%') GROUP BY g.id ORDER BY g.id",
            Self::RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql).bind(name_filter).fetch_all(&self.pool).await?;
        rows.iter().map(Self::record_from_row).collect()
    }

    async fn list_tags(&self) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query("SELECT id::bigint AS id, name FROM tags ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(Tag {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }
}
