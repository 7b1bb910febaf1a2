//! Detection and synthesis stages wrapped around their reasoning collaborators.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamefeed_core::{CandidateRecord, ContentItem, DetectionResult, PersistedRecord, Stage, SynthesisDraft};
use gamefeed_storage::ImageResolver;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{RecordStore, StoreError};

#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage:?} stage timed out after {secs}s")]
    Timeout { stage: Stage, secs: u64 },
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

async fn bounded<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T, StageError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(StageError::Collaborator),
        Err(_) => Err(StageError::Timeout {
            stage,
            secs: limit.as_secs(),
        }),
    }
}

/// Classifies a content item; may return any URL, normalization happens in the stage.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, item: &ContentItem) -> anyhow::Result<DetectionResult>;
}

pub struct DetectionStage {
    detector: Arc<dyn Detector>,
    timeout: Duration,
}

impl DetectionStage {
    pub fn new(detector: Arc<dyn Detector>, timeout: Duration) -> Self {
        Self { detector, timeout }
    }

    pub async fn detect(&self, item: &ContentItem) -> Result<DetectionResult, StageError> {
        let raw = bounded(Stage::Detection, self.timeout, self.detector.detect(item)).await?;
        let result = DetectionResult::new(raw.has_candidate, raw.url);
        debug!(title = %item.title, candidate = ?result.candidate_url(), "detection finished");
        Ok(result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

/// Outbound web lookups offered to a reasoning session.
#[async_trait]
pub trait WebLookup: Send + Sync {
    /// Visible text of a page, truncated.
    async fn fetch_page_text(&self, url: &str) -> anyhow::Result<String>;
    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>>;
}

/// Capabilities a synthesizer may use. Nothing here can persist a record.
#[derive(Clone)]
pub struct Toolbox {
    pub store: Arc<dyn RecordStore>,
    pub web: Arc<dyn WebLookup>,
}

/// Produces a draft for the resource at `url`, or `None` to decline.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, url: &str, tools: &Toolbox) -> anyhow::Result<Option<SynthesisDraft>>;
}

pub struct SynthesisStage {
    synthesizer: Arc<dyn Synthesizer>,
    toolbox: Toolbox,
    store: Arc<dyn RecordStore>,
    images: Arc<ImageResolver>,
    timeout: Duration,
}

impl SynthesisStage {
    pub fn new(
        synthesizer: Arc<dyn Synthesizer>,
        toolbox: Toolbox,
        store: Arc<dyn RecordStore>,
        images: Arc<ImageResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            synthesizer,
            toolbox,
            store,
            images,
            timeout,
        }
    }

    /// Runs the session and persists its draft under `url`.
    ///
    /// `on_created` fires once, after the record is stored and the best-effort
    /// image step has run. It never fires when nothing was created.
    pub async fn synthesize(
        &self,
        url: &str,
        on_created: impl FnOnce(&PersistedRecord) + Send,
    ) -> Result<Option<PersistedRecord>, StageError> {
        let Some(candidate) = self.candidate(url).await? else {
            return Ok(None);
        };

        let record = self.store.create(candidate).await?;
        info!(record_id = record.id, name = %record.name, url = %record.url, "record created");

        self.attach_first_image(&record).await;
        on_created(&record);
        Ok(Some(record))
    }

    /// Same session as `synthesize`, without persisting anything.
    pub async fn preview(&self, url: &str) -> Result<Option<CandidateRecord>, StageError> {
        self.candidate(url).await
    }

    async fn candidate(&self, url: &str) -> Result<Option<CandidateRecord>, StageError> {
        let draft = bounded(
            Stage::Synthesis,
            self.timeout,
            self.synthesizer.synthesize(url, &self.toolbox),
        )
        .await?;

        let Some(draft) = draft.filter(|d| !d.name.trim().is_empty()) else {
            debug!(url, "synthesis declined");
            return Ok(None);
        };

        let mut candidate = CandidateRecord::from_draft(draft, url);
        candidate.tag_ids = self.known_tag_ids(candidate.tag_ids).await;
        Ok(Some(candidate))
    }

    async fn known_tag_ids(&self, requested: Vec<i64>) -> Vec<i64> {
        let known = match self.store.list_tags().await {
            Ok(tags) => tags.into_iter().map(|t| t.id).collect::<HashSet<_>>(),
            Err(err) => {
                warn!(error = %err, "tag lookup failed, keeping requested tag ids");
                return requested;
            }
        };
        let mut seen = HashSet::new();
        requested
            .into_iter()
            .filter(|id| known.contains(id) && seen.insert(*id))
            .collect()
    }

    async fn attach_first_image(&self, record: &PersistedRecord) {
        let query = format!("{} game", record.name);
        let Some(image) = self.images.resolve_first_image(&query).await else {
            warn!(record_id = record.id, query, "no image attached");
            return;
        };
        match self.store.attach_image(record.id, &image).await {
            Ok(image_id) => info!(record_id = record.id, image_id, "image attached"),
            Err(err) => warn!(record_id = record.id, error = %err, "image attach failed"),
        }
    }
}
