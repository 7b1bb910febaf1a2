//! Web lookups and the tools handed to the synthesis session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gamefeed_agent::{Tool, ToolDefinition};
use gamefeed_core::{SynthesisDraft, Tag};
use gamefeed_storage::{FetchError, HttpFetcher, TargetGuard};
use scraper::{Html, Node};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use crate::stages::{SearchHit, Toolbox, WebLookup};
use crate::store::StoreError;

pub const PAGE_TEXT_LIMIT: usize = 5000;
pub const TRUNCATION_MARKER: &str = "... (content truncated)";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
const WIKIPEDIA_API: &str = "https://en.wikipedia.org/w/api.php";
const WIKIPEDIA_RESULTS: usize = 3;

/// Visible text of an HTML document: script and style content removed,
/// whitespace collapsed, cut at `PAGE_TEXT_LIMIT` characters.
pub fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    for node in document.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|parent| {
            parent
                .value()
                .as_element()
                .is_some_and(|el| matches!(el.name(), "script" | "style" | "noscript"))
        });
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > PAGE_TEXT_LIMIT {
        let mut cut: String = collapsed.chars().take(PAGE_TEXT_LIMIT).collect();
        cut.push_str(TRUNCATION_MARKER);
        cut
    } else {
        collapsed
    }
}

fn strip_markup(fragment: &str) -> String {
    let parsed = Html::parse_fragment(fragment);
    parsed
        .root_element()
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses a MediaWiki `list=search` response.
pub fn parse_wikipedia_search(body: &JsonValue) -> Vec<SearchHit> {
    body.pointer("/query/search")
        .and_then(JsonValue::as_array)
        .map(|hits| {
            hits.iter()
                .filter_map(|hit| {
                    let title = hit.get("title")?.as_str()?.to_string();
                    let snippet = hit
                        .get("snippet")
                        .and_then(JsonValue::as_str)
                        .map(strip_markup)
                        .unwrap_or_default();
                    let url = format!("https://en.wikipedia.org/wiki/{}", title.replace(' ', "_"));
                    Some(SearchHit { title, snippet, url })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// `WebLookup` over the shared fetcher; page fetches are guard-checked.
pub struct HttpWebLookup {
    http: Arc<HttpFetcher>,
    guard: Arc<dyn TargetGuard>,
    page_timeout: Duration,
}

impl HttpWebLookup {
    pub fn new(http: Arc<HttpFetcher>, guard: Arc<dyn TargetGuard>) -> Self {
        Self {
            http,
            guard,
            page_timeout: Duration::from_secs(10),
        }
    }

    async fn is_unsafe(&self, url: &str) -> bool {
        let guard = Arc::clone(&self.guard);
        let uri = url.to_string();
        tokio::task::spawn_blocking(move || guard.is_unsafe(&uri))
            .await
            .unwrap_or(true)
    }
}

#[async_trait]
impl WebLookup for HttpWebLookup {
    async fn fetch_page_text(&self, url: &str) -> anyhow::Result<String> {
        if self.is_unsafe(url).await {
            return Err(FetchError::UnsafeTarget(url.to_string()).into());
        }
        let resp = self
            .http
            .fetch_bytes_within(url, self.page_timeout, &[("User-Agent", BROWSER_USER_AGENT)])
            .await?;
        let html = String::from_utf8_lossy(&resp.body);
        Ok(page_text(&html))
    }

    async fn search(&self, query: &str) -> anyhow::Result<Vec<SearchHit>> {
        let endpoint = url::Url::parse_with_params(
            WIKIPEDIA_API,
            &[
                ("action", "query"),
                ("list", "search"),
                ("format", "json"),
                ("srlimit", &WIKIPEDIA_RESULTS.to_string()),
                ("srsearch", query),
            ],
        )?;
        let body: JsonValue = self.http.fetch_json(endpoint.as_str()).await?;
        let hits = parse_wikipedia_search(&body);
        debug!(query, hits = hits.len(), "wikipedia search");
        Ok(hits)
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lookup(#[from] anyhow::Error),
}

#[derive(Debug, Deserialize)]
pub struct GetGamesArgs {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct GameSummary {
    pub id: i64,
    pub name: String,
    pub url: String,
}

pub struct GetGamesTool {
    tools: Toolbox,
}

#[async_trait]
impl Tool for GetGamesTool {
    const NAME: &'static str = "get_games";
    type Error = ToolError;
    type Args = GetGamesArgs;
    type Output = Vec<GameSummary>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "List games already in the catalogue, optionally filtered by a case-insensitive name fragment."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Name fragment to filter by" }
                }
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        let records = self.tools.store.list_records(args.name.as_deref()).await?;
        Ok(records
            .into_iter()
            .map(|r| GameSummary {
                id: r.id,
                name: r.name,
                url: r.url,
            })
            .collect())
    }
}

#[derive(Debug, Deserialize)]
pub struct NoArgs {}

pub struct GetTagsTool {
    tools: Toolbox,
}

#[async_trait]
impl Tool for GetTagsTool {
    const NAME: &'static str = "get_tags";
    type Error = ToolError;
    type Args = NoArgs;
    type Output = Vec<Tag>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "List every tag that can be attached to a game, with its numeric id.".to_string(),
            parameters: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    async fn call(&self, _args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(self.tools.store.list_tags().await?)
    }
}

#[derive(Debug, Deserialize)]
pub struct UrlArgs {
    pub url: String,
}

pub struct FetchPageContentTool {
    tools: Toolbox,
}

#[async_trait]
impl Tool for FetchPageContentTool {
    const NAME: &'static str = "fetch_page_content";
    type Error = ToolError;
    type Args = UrlArgs;
    type Output = String;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Fetch a web page and return its visible text (truncated).".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "url": { "type": "string", "description": "The URL to read" }
                },
                "required": ["url"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(self.tools.web.fetch_page_text(&args.url).await?)
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryArgs {
    pub query: String,
}

pub struct WikipediaSearchTool {
    tools: Toolbox,
}

#[async_trait]
impl Tool for WikipediaSearchTool {
    const NAME: &'static str = "wikipedia_search";
    type Error = ToolError;
    type Args = QueryArgs;
    type Output = Vec<SearchHit>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Search Wikipedia. Returns titles, snippets and article URLs.".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "The search query" }
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(self.tools.web.search(&args.query).await?)
    }
}

/// Terminal tool: hands the draft back to the caller, which owns persistence.
pub struct CreateGameTool;

#[async_trait]
impl Tool for CreateGameTool {
    const NAME: &'static str = "create_game";
    const TERMINAL: bool = true;
    type Error = ToolError;
    type Args = SynthesisDraft;
    type Output = SynthesisDraft;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Create the catalogue entry for the game being researched. The URL is fixed and must not be supplied. Ends the session."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "The game's name" },
                    "description": { "type": "string", "description": "What the game is and what it teaches" },
                    "tags": {
                        "type": "array",
                        "items": { "type": "integer" },
                        "description": "Ids of existing tags, from get_tags"
                    }
                },
                "required": ["name", "description"]
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(args)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SkipArgs {
    #[serde(default)]
    pub reason: String,
}

/// Terminal tool: declines to create anything.
pub struct SkipGameTool;

#[async_trait]
impl Tool for SkipGameTool {
    const NAME: &'static str = "skip_game";
    const TERMINAL: bool = true;
    type Error = ToolError;
    type Args = SkipArgs;
    type Output = SkipArgs;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: Self::NAME.to_string(),
            description: "Decline: the page is not an educational game, or not enough is known about it. Ends the session."
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" }
                }
            }),
        }
    }

    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
        Ok(args)
    }
}

impl Toolbox {
    pub fn get_games(&self) -> GetGamesTool {
        GetGamesTool { tools: self.clone() }
    }

    pub fn get_tags(&self) -> GetTagsTool {
        GetTagsTool { tools: self.clone() }
    }

    pub fn fetch_page_content(&self) -> FetchPageContentTool {
        FetchPageContentTool { tools: self.clone() }
    }

    pub fn wikipedia_search(&self) -> WikipediaSearchTool {
        WikipediaSearchTool { tools: self.clone() }
    }
}
