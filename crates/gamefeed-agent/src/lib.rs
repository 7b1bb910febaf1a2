//! Tool-calling chat agent over OpenAI-compatible chat completion endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

mod tool;
pub mod wire;

pub use tool::{DynTool, Tool, ToolDefinition, ToolWrapper};
use wire::{ChatRequest, ChatResponse, Role, ToolDefinitionWire, WireMessage};

pub const CRATE_NAME: &str = "gamefeed-agent";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("chat API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("invalid API key header")]
    InvalidHeader,
    #[error("no choices in chat response")]
    EmptyResponse,
    #[error("max turns ({0}) exceeded")]
    MaxTurns(usize),
}

/// Anything that can answer a chat completion request.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AgentError>;
}

/// HTTP backend for any endpoint speaking the OpenAI chat completions protocol.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn headers(&self) -> Result<HeaderMap, AgentError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| AgentError::InvalidHeader)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatClient {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AgentError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        debug!(model = %request.model, messages = request.messages.len(), "chat request");

        let response = self
            .http
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::Api { status, body });
        }

        Ok(response.json().await?)
    }
}

/// How a tool-calling session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// The model answered in text without calling a terminal tool.
    Text(String),
    /// A terminal tool was called successfully; its output ends the session.
    Terminal { tool: String, output: Value },
}

#[derive(Clone)]
pub struct Agent {
    backend: Arc<dyn ChatBackend>,
    model: String,
    temperature: Option<f32>,
    tools: Vec<Arc<dyn DynTool>>,
}

impl Agent {
    pub fn new(backend: Arc<dyn ChatBackend>, model: impl Into<String>) -> Self {
        Self {
            backend,
            model: model.into(),
            temperature: None,
            tools: Vec::new(),
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn tool<T: Tool + 'static>(self, tool: T) -> Self {
        self.dyn_tool(Arc::new(ToolWrapper(tool)))
    }

    pub fn dyn_tool(mut self, tool: Arc<dyn DynTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn base_request(&self, system: &str, user: &str) -> ChatRequest {
        let mut request = ChatRequest::new(&self.model)
            .message(WireMessage::system(system))
            .message(WireMessage::user(user));
        if let Some(temperature) = self.temperature {
            request = request.temperature(temperature);
        }
        request
    }

    /// Single-turn completion asking for a JSON object, tools ignored.
    pub async fn complete_json(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let request = self.base_request(system, user).json_object();
        let response = self.backend.chat(&request).await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or(AgentError::EmptyResponse)
    }

    /// Multi-turn tool loop. Stops at the first successful terminal tool call,
    /// at a plain text answer, or with `MaxTurns`.
    pub async fn run(&self, system: &str, user: &str, max_turns: usize) -> Result<AgentOutcome, AgentError> {
        let mut request = self.base_request(system, user);
        for tool in &self.tools {
            let def = tool.definition();
            request = request.tool(ToolDefinitionWire::function(
                &def.name,
                &def.description,
                def.parameters,
            ));
        }
        if request.tools.is_some() {
            request.tool_choice = Some(serde_json::json!("auto"));
        }

        for turn in 1..=max_turns {
            let response = self.backend.chat(&request).await?;
            let choice = response
                .choices
                .into_iter()
                .next()
                .ok_or(AgentError::EmptyResponse)?;

            let tool_calls = choice.message.tool_calls.clone().unwrap_or_default();
            if tool_calls.is_empty() {
                return Ok(AgentOutcome::Text(choice.message.content.unwrap_or_default()));
            }

            request.messages.push(WireMessage {
                role: Role::Assistant,
                content: choice.message.content.clone(),
                tool_calls: Some(tool_calls.clone()),
                tool_call_id: None,
            });

            for call in &tool_calls {
                let Some(tool) = self.tools.iter().find(|t| t.name() == call.function.name) else {
                    warn!(tool = %call.function.name, "model requested unknown tool");
                    request.messages.push(WireMessage::tool(
                        &call.id,
                        format!("Error: unknown tool {}", call.function.name),
                    ));
                    continue;
                };

                let args: Value = if call.function.arguments.trim().is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&call.function.arguments).unwrap_or_default()
                };

                debug!(tool = %call.function.name, turn, "executing tool call");

                match tool.call_json(args).await {
                    Ok(output) if tool.is_terminal() => {
                        return Ok(AgentOutcome::Terminal {
                            tool: call.function.name.clone(),
                            output,
                        });
                    }
                    Ok(output) => {
                        request.messages.push(WireMessage::tool(&call.id, output.to_string()));
                    }
                    Err(err) => {
                        request.messages.push(WireMessage::tool(&call.id, format!("Error: {err}")));
                    }
                }
            }
        }

        Err(AgentError::MaxTurns(max_turns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<VecDeque<ChatResponse>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, AgentError> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(AgentError::EmptyResponse)
        }
    }

    #[derive(Deserialize)]
    struct NoArgs {}

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    struct ListTool;

    #[async_trait]
    impl Tool for ListTool {
        const NAME: &'static str = "list";
        type Error = Never;
        type Args = NoArgs;
        type Output = Vec<i32>;

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: Self::NAME.into(),
                description: "list things".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }
        }

        async fn call(&self, _args: NoArgs) -> Result<Vec<i32>, Never> {
            Ok(vec![1, 2])
        }
    }

    #[derive(Deserialize)]
    struct FinishArgs {
        answer: String,
    }

    struct FinishTool;

    #[async_trait]
    impl Tool for FinishTool {
        const NAME: &'static str = "finish";
        const TERMINAL: bool = true;
        type Error = Never;
        type Args = FinishArgs;
        type Output = String;

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: Self::NAME.into(),
                description: "finish".into(),
                parameters: serde_json::json!({"type": "object"}),
            }
        }

        async fn call(&self, args: FinishArgs) -> Result<String, Never> {
            Ok(args.answer)
        }
    }

    #[tokio::test]
    async fn tool_results_feed_back_until_terminal_call() {
        let backend = ScriptedBackend::new(vec![
            ChatResponse::tool_call("c1", "list", serde_json::json!({})),
            ChatResponse::tool_call("c2", "finish", serde_json::json!({"answer": "done"})),
            ChatResponse::text("should not be requested"),
        ]);
        let agent = Agent::new(backend.clone(), "test-model").tool(ListTool).tool(FinishTool);

        let outcome = agent.run("sys", "go", 5).await.unwrap();
        assert_eq!(
            outcome,
            AgentOutcome::Terminal {
                tool: "finish".into(),
                output: serde_json::json!("done")
            }
        );

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second = &requests[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert_eq!(last.content.as_deref(), Some("[1,2]"));
        assert_eq!(second.tools.as_ref().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bad_terminal_args_are_reported_back_to_the_model() {
        let backend = ScriptedBackend::new(vec![
            ChatResponse::tool_call("c1", "finish", serde_json::json!({"wrong": 1})),
            ChatResponse::tool_call("c2", "nope", serde_json::json!({})),
            ChatResponse::text("giving up"),
        ]);
        let agent = Agent::new(backend.clone(), "m").tool(FinishTool);

        let outcome = agent.run("sys", "go", 5).await.unwrap();
        assert_eq!(outcome, AgentOutcome::Text("giving up".into()));

        let requests = backend.requests.lock().unwrap();
        let msgs = &requests[2].messages;
        assert!(msgs
            .iter()
            .any(|m| m.content.as_deref().is_some_and(|c| c.starts_with("Error: Failed to parse args"))));
        assert!(msgs
            .iter()
            .any(|m| m.content.as_deref() == Some("Error: unknown tool nope")));
    }

    #[tokio::test]
    async fn runaway_sessions_hit_max_turns() {
        let backend = ScriptedBackend::new(
            (0..3)
                .map(|i| ChatResponse::tool_call(&format!("c{i}"), "list", serde_json::json!({})))
                .collect(),
        );
        let agent = Agent::new(backend, "m").tool(ListTool);
        assert!(matches!(agent.run("s", "u", 3).await, Err(AgentError::MaxTurns(3))));
    }

    #[tokio::test]
    async fn complete_json_requests_json_object() {
        let backend = ScriptedBackend::new(vec![ChatResponse::text(r#"{"ok":true}"#)]);
        let agent = Agent::new(backend.clone(), "m").temperature(0.0);
        assert_eq!(agent.complete_json("s", "u").await.unwrap(), r#"{"ok":true}"#);
        let requests = backend.requests.lock().unwrap();
        assert_eq!(
            requests[0].response_format,
            Some(serde_json::json!({"type": "json_object"}))
        );
        assert_eq!(requests[0].temperature, Some(0.0));
    }
}
