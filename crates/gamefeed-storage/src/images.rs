//! Image search and first-safe-download resolution.

use std::sync::Arc;

use async_trait::async_trait;
use gamefeed_core::Image;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{FetchError, HttpFetcher, TargetGuard};

const CUSTOM_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// Ranked candidate image URLs for a free-text query.
#[async_trait]
pub trait ImageSearch: Send + Sync {
    async fn search_images(&self, query: &str) -> anyhow::Result<Vec<String>>;
}

/// Downloads one candidate image; any non-2xx answer is an error.
#[async_trait]
pub trait ImageDownload: Send + Sync {
    async fn download(&self, url: &str) -> Result<Image, FetchError>;
}

#[async_trait]
impl ImageDownload for HttpFetcher {
    async fn download(&self, url: &str) -> Result<Image, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        Ok(Image::new(resp.body))
    }
}

/// Used when no search provider is configured.
#[derive(Debug, Default)]
pub struct NoImageSearch;

#[async_trait]
impl ImageSearch for NoImageSearch {
    async fn search_images(&self, _query: &str) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Google Custom Search JSON API provider.
pub struct GoogleCustomSearch {
    http: Arc<HttpFetcher>,
    api_key: String,
    engine_id: String,
}

impl GoogleCustomSearch {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
        }
    }
}

#[async_trait]
impl ImageSearch for GoogleCustomSearch {
    async fn search_images(&self, query: &str) -> anyhow::Result<Vec<String>> {
        let url = url::Url::parse_with_params(
            CUSTOM_SEARCH_ENDPOINT,
            &[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
            ],
        )?;
        let body: JsonValue = self.http.fetch_json(url.as_str()).await?;
        Ok(extract_image_links(&body))
    }
}

/// Pulls one image URL per search result: the `cse_image` thumbnail source,
/// falling back to the page's `og:image` meta tag.
pub fn extract_image_links(body: &JsonValue) -> Vec<String> {
    let Some(items) = body.get("items").and_then(JsonValue::as_array) else {
        return Vec::new();
    };

    items
        .iter()
        .filter(|item| item.get("kind").and_then(JsonValue::as_str) == Some("customsearch#result"))
        .filter_map(|item| {
            let pagemap = item.get("pagemap")?;
            if let Some(images) = pagemap.get("cse_image").and_then(JsonValue::as_array) {
                return images
                    .first()
                    .and_then(|img| img.get("src"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
            }
            pagemap
                .get("metatags")
                .and_then(JsonValue::as_array)
                .and_then(|tags| tags.first())
                .and_then(|tag| tag.get("og:image"))
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        })
        .collect()
}

/// Returns the first candidate image that passes the guard and downloads successfully.
pub struct ImageResolver {
    search: Arc<dyn ImageSearch>,
    guard: Arc<dyn TargetGuard>,
    downloader: Arc<dyn ImageDownload>,
}

impl ImageResolver {
    pub fn new(
        search: Arc<dyn ImageSearch>,
        guard: Arc<dyn TargetGuard>,
        downloader: Arc<dyn ImageDownload>,
    ) -> Self {
        Self {
            search,
            guard,
            downloader,
        }
    }

    pub async fn resolve_first_image(&self, query: &str) -> Option<Image> {
        let candidates = match self.search.search_images(query).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(query, error = %err, "image search failed");
                return None;
            }
        };

        if candidates.is_empty() {
            warn!(query, "no image candidates found");
            return None;
        }

        for candidate in candidates {
            if self.is_unsafe(&candidate).await {
                warn!(url = %candidate, "skipping image candidate on private network");
                continue;
            }

            match self.downloader.download(&candidate).await {
                Ok(image) => {
                    info!(url = %candidate, bytes = image.byte_len(), "downloaded image");
                    return Some(image);
                }
                Err(err) => {
                    warn!(url = %candidate, error = %err, "image download failed");
                }
            }
        }

        debug!(query, "image candidates exhausted");
        None
    }

    async fn is_unsafe(&self, candidate: &str) -> bool {
        let guard = Arc::clone(&self.guard);
        let uri = candidate.to_string();
        // The guard performs a blocking DNS lookup.
        tokio::task::spawn_blocking(move || guard.is_unsafe(&uri))
            .await
            .unwrap_or(true)
    }
}
