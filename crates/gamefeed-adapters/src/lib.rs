//! Content source contracts + Reddit and fixture-file implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use gamefeed_core::ContentItem;
use gamefeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "gamefeed-adapters";

const REDDIT_BASE_URL: &str = "https://www.reddit.com";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Produces one finite batch of content items per ingestion run.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError>;
}

/// One entry of the `sources.yaml` registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Reddit {
        subreddits: Vec<String>,
        #[serde(default = "default_reddit_limit")]
        limit: u32,
        #[serde(default = "default_time_filter")]
        time_filter: String,
    },
    Fixture {
        path: PathBuf,
    },
}

fn default_reddit_limit() -> u32 {
    50
}

fn default_time_filter() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

/// Top posts of a fixed set of subreddits, via the public listing JSON.
pub struct RedditTopPostsSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    subreddits: Vec<String>,
    limit: u32,
    time_filter: String,
}

impl RedditTopPostsSource {
    pub fn new(http: Arc<HttpFetcher>, subreddits: Vec<String>, limit: u32, time_filter: impl Into<String>) -> Self {
        Self {
            http,
            base_url: REDDIT_BASE_URL.to_string(),
            subreddits,
            limit,
            time_filter: time_filter.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn listing_url(&self, subreddit: &str) -> String {
        format!(
            "{}/r/{}/top.json?limit={}&t={}",
            self.base_url.trim_end_matches('/'),
            subreddit,
            self.limit,
            self.time_filter
        )
    }
}

#[async_trait]
impl ContentSource for RedditTopPostsSource {
    fn source_id(&self) -> &str {
        "reddit"
    }

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError> {
        let mut items = Vec::new();
        for subreddit in &self.subreddits {
            let listing: JsonValue = self.http.fetch_json(&self.listing_url(subreddit)).await?;
            let posts = parse_reddit_listing(&listing)?;
            info!(subreddit, posts = posts.len(), "fetched subreddit listing");
            items.extend(posts);
        }
        Ok(items)
    }
}

/// Parses a Reddit listing document into content items.
pub fn parse_reddit_listing(listing: &JsonValue) -> Result<Vec<ContentItem>, AdapterError> {
    let children = listing
        .pointer("/data/children")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| AdapterError::Message("reddit listing has no data.children".into()))?;

    Ok(children
        .iter()
        .filter_map(|child| child.get("data"))
        .filter_map(|post| {
            let title = post.get("title").and_then(JsonValue::as_str)?;
            let body = post
                .get("selftext")
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            let url = post
                .get("url")
                .and_then(JsonValue::as_str)
                .filter(|u| !u.is_empty() && !is_self_post_link(u))
                .map(str::to_string);
            Some(ContentItem::new(title, url, body))
        })
        .collect())
}

/// True for links pointing back at a Reddit comment thread (text posts).
pub fn is_self_post_link(url: &str) -> bool {
    let Some(rest) = url.strip_prefix("https://www.reddit.com/r/") else {
        return false;
    };
    match rest.split_once('/') {
        Some((subreddit, tail)) => {
            subreddit.chars().all(|c| c.is_ascii_alphabetic()) && tail.starts_with("comments")
        }
        None => false,
    }
}

/// JSON array of content items on disk.
pub struct FixtureSource {
    path: PathBuf,
}

impl FixtureSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError> {
        load_fixture_items(&self.path).map_err(AdapterError::from)
    }
}

pub fn load_fixture_items(path: impl AsRef<Path>) -> anyhow::Result<Vec<ContentItem>> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Concatenates the batches of several sources in registry order.
/// Any failing source fails the whole batch.
pub struct MultiSource {
    sources: Vec<Box<dyn ContentSource>>,
}

impl MultiSource {
    pub fn new(sources: Vec<Box<dyn ContentSource>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl ContentSource for MultiSource {
    fn source_id(&self) -> &str {
        "multi"
    }

    async fn fetch_batch(&self) -> Result<Vec<ContentItem>, AdapterError> {
        let mut items = Vec::new();
        for source in &self.sources {
            let batch = source.fetch_batch().await.map_err(|err| {
                warn!(source_id = source.source_id(), error = %err, "content source failed");
                err
            })?;
            items.extend(batch);
        }
        Ok(items)
    }
}

pub fn source_for_config(
    config: &SourceConfig,
    http: Arc<HttpFetcher>,
    workspace_root: &Path,
) -> Box<dyn ContentSource> {
    match config {
        SourceConfig::Reddit {
            subreddits,
            limit,
            time_filter,
        } => Box::new(RedditTopPostsSource::new(
            http,
            subreddits.clone(),
            *limit,
            time_filter.clone(),
        )),
        SourceConfig::Fixture { path } => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                workspace_root.join(path)
            };
            Box::new(FixtureSource::new(path))
        }
    }
}
