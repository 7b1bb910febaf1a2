//! Chat-model backed detector and synthesizer.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use gamefeed_agent::{Agent, AgentOutcome, ChatBackend};
use gamefeed_core::{ContentItem, DetectionResult, SynthesisDraft};
use serde::Deserialize;
use tracing::{debug, info};

use crate::stages::{Detector, Synthesizer, Toolbox};
use crate::tools::{CreateGameTool, SkipGameTool};

pub const SYNTHESIS_MAX_TURNS: usize = 12;

const DETECTION_PROMPT: &str = "You read posts from communities about educational games. \
Decide whether the post links to a specific educational game that can be played or downloaded. \
Answer with a JSON object only: {\"has_game_url\": boolean, \"url\": string or null}. \
The url must be the game's own page, copied from the post. \
If the post only discusses games in general, asks for recommendations, or links to an article, \
answer {\"has_game_url\": false, \"url\": null}.";

const SYNTHESIS_PROMPT: &str = "You catalogue educational games. \
You are given the URL of one game. Research it with the tools: read the page, \
check get_games so you do not add a game that is already listed under another URL, \
and pick fitting tags from get_tags. Use wikipedia_search when the page says little. \
When you know what the game is, call create_game with its name, a short description \
of what it teaches, and the tag ids. If the page is not an educational game, call skip_game.";

#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(default, alias = "has_candidate")]
    has_game_url: bool,
    #[serde(default)]
    url: Option<String>,
}

/// Parses the model's detection answer, tolerating markdown code fences.
pub fn parse_detection(answer: &str) -> anyhow::Result<DetectionResult> {
    let trimmed = answer.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();
    let raw: RawDetection =
        serde_json::from_str(body).with_context(|| format!("unparseable detection answer: {body}"))?;
    Ok(DetectionResult::new(raw.has_game_url, raw.url))
}

pub struct LlmDetector {
    agent: Agent,
}

impl LlmDetector {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>) -> Self {
        Self {
            agent: Agent::new(backend, model).temperature(0.0),
        }
    }
}

#[async_trait]
impl Detector for LlmDetector {
    async fn detect(&self, item: &ContentItem) -> anyhow::Result<DetectionResult> {
        let answer = self
            .agent
            .complete_json(DETECTION_PROMPT, &item.context_text())
            .await?;
        parse_detection(&answer)
    }
}

pub struct LlmSynthesizer {
    backend: Arc<dyn ChatBackend>,
    model: String,
    max_turns: usize,
}

impl LlmSynthesizer {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            max_turns: SYNTHESIS_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }
}

#[async_trait]
impl Synthesizer for LlmSynthesizer {
    async fn synthesize(&self, url: &str, tools: &Toolbox) -> anyhow::Result<Option<SynthesisDraft>> {
        let agent = Agent::new(Arc::clone(&self.backend), self.model.clone())
            .temperature(0.2)
            .tool(tools.get_games())
            .tool(tools.get_tags())
            .tool(tools.fetch_page_content())
            .tool(tools.wikipedia_search())
            .tool(CreateGameTool)
            .tool(SkipGameTool);

        let user = format!("Game URL: {url}");
        match agent.run(SYNTHESIS_PROMPT, &user, self.max_turns).await? {
            AgentOutcome::Terminal { tool, output } if tool == "create_game" => {
                let draft: SynthesisDraft =
                    serde_json::from_value(output).context("create_game output is not a draft")?;
                info!(url, name = %draft.name, "synthesis produced a draft");
                Ok(Some(draft))
            }
            AgentOutcome::Terminal { tool, output } => {
                debug!(url, tool = %tool, %output, "synthesis declined");
                Ok(None)
            }
            AgentOutcome::Text(text) => {
                debug!(url, text = %text, "synthesis ended without a tool call");
                Ok(None)
            }
        }
    }
}
