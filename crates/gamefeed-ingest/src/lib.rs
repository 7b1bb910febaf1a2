//! Ingestion pipeline: record stores, detection and synthesis stages, and the
//! single-flight job controller that drives them.

use std::sync::Arc;

use anyhow::Context;
use gamefeed_adapters::{source_for_config, ContentSource, MultiSource};
use gamefeed_agent::{ChatBackend, OpenAiCompatClient};
use gamefeed_storage::{
    GoogleCustomSearch, HttpClientConfig, HttpFetcher, ImageResolver, ImageSearch, ImageStore, NoImageSearch,
    PrivateNetworkGuard, TargetGuard,
};
use tracing::info;

mod config;
mod controller;
mod llm;
mod scheduler;
mod stages;
mod store;
mod tools;

pub use config::{load_source_registry, IngestConfig, StoreBackend};
pub use controller::{IngestPipeline, JobController, JobProgress};
pub use llm::{parse_detection, LlmDetector, LlmSynthesizer, SYNTHESIS_MAX_TURNS};
pub use scheduler::{build_scheduler, maybe_build_scheduler};
pub use stages::{
    DetectionStage, Detector, SearchHit, StageError, SynthesisStage, Synthesizer, Toolbox, WebLookup,
};
pub use store::{AttachedImage, DedupCheck, InMemoryRecordStore, PgRecordStore, RecordStore, StoreError};
pub use tools::{
    page_text, parse_wikipedia_search, CreateGameTool, FetchPageContentTool, GetGamesTool, GetTagsTool,
    HttpWebLookup, SkipGameTool, ToolError, WikipediaSearchTool, PAGE_TEXT_LIMIT, TRUNCATION_MARKER,
};

pub const CRATE_NAME: &str = "gamefeed-ingest";

/// Wires the production collaborators described by `config` into a controller.
pub async fn build_controller(config: &IngestConfig) -> anyhow::Result<Arc<JobController>> {
    let guard: Arc<dyn TargetGuard> = Arc::new(PrivateNetworkGuard::new(config.guard_fail_closed));
    let http = Arc::new(
        HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })?
        .with_redirect_guard(Arc::clone(&guard)),
    );

    let registry = load_source_registry(&config.sources_file()).await?;
    let sources = registry
        .sources
        .iter()
        .map(|source| source_for_config(source, Arc::clone(&http), &config.workspace_root))
        .collect::<Vec<_>>();
    info!(sources = sources.len(), "content sources loaded");
    let source: Arc<dyn ContentSource> = Arc::new(MultiSource::new(sources));

    let image_store = ImageStore::new(&config.images_dir);
    let store: Arc<dyn RecordStore> = match config.store {
        StoreBackend::Memory => Arc::new(InMemoryRecordStore::new().with_image_store(image_store)),
        StoreBackend::Postgres => Arc::new(
            PgRecordStore::connect(&config.database_url, image_store)
                .await
                .context("connecting to postgres")?
                .with_proposing_user(config.ai_user_id),
        ),
    };

    let api_key = config.llm_api_key.clone().context("LLM_API_KEY is not set")?;
    let backend: Arc<dyn ChatBackend> = Arc::new(
        OpenAiCompatClient::new(api_key, config.stage_timeout())?.with_base_url(config.llm_base_url.clone()),
    );

    let search: Arc<dyn ImageSearch> = match (&config.google_cse_key, &config.google_cse_id) {
        (Some(key), Some(engine)) => Arc::new(GoogleCustomSearch::new(Arc::clone(&http), key, engine)),
        _ => {
            info!("image search disabled, GOOGLE_CSE_KEY or GOOGLE_CSE_ID missing");
            Arc::new(NoImageSearch)
        }
    };
    let images = Arc::new(ImageResolver::new(search, Arc::clone(&guard), http.clone()));

    let toolbox = Toolbox {
        store: Arc::clone(&store),
        web: Arc::new(HttpWebLookup::new(Arc::clone(&http), guard)),
    };
    let detection = DetectionStage::new(
        Arc::new(LlmDetector::new(Arc::clone(&backend), config.llm_model.clone())),
        config.stage_timeout(),
    );
    let synthesis = SynthesisStage::new(
        Arc::new(LlmSynthesizer::new(backend, config.llm_model.clone())),
        toolbox,
        Arc::clone(&store),
        images,
        config.stage_timeout(),
    );

    let pipeline = IngestPipeline::new(source, detection, DedupCheck::new(store), synthesis)
        .with_item_concurrency(config.item_concurrency)
        .with_fetch_timeout(config.stage_timeout());
    Ok(JobController::new(Arc::new(pipeline)))
}
