use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::error::Error;

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    const NAME: &'static str;
    /// A successful call of a terminal tool ends the session and becomes its result.
    const TERMINAL: bool = false;
    type Error: Error + Send + Sync + 'static;
    type Args: DeserializeOwned + Send + Sync;
    type Output: Serialize + Send + Sync;

    fn definition(&self) -> ToolDefinition;
    async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error>;
}

#[async_trait]
pub trait DynTool: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_terminal(&self) -> bool;
    fn definition(&self) -> ToolDefinition;
    async fn call_json(&self, args: Value) -> Result<Value, String>;
}

pub struct ToolWrapper<T: Tool>(pub T);

#[async_trait]
impl<T: Tool> DynTool for ToolWrapper<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn is_terminal(&self) -> bool {
        T::TERMINAL
    }

    fn definition(&self) -> ToolDefinition {
        self.0.definition()
    }

    async fn call_json(&self, args: Value) -> Result<Value, String> {
        let parsed_args: T::Args =
            serde_json::from_value(args).map_err(|e| format!("Failed to parse args: {}", e))?;

        let result = self
            .0
            .call(parsed_args)
            .await
            .map_err(|e| format!("Tool error: {}", e))?;

        serde_json::to_value(result).map_err(|e| format!("Failed to serialize result: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct EchoArgs {
        message: String,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("echo error")]
    struct EchoError;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        const NAME: &'static str = "echo";
        type Error = EchoError;
        type Args = EchoArgs;
        type Output = String;

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: Self::NAME.to_string(),
                description: "Echo back the input".to_string(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "message": { "type": "string" } },
                    "required": ["message"]
                }),
            }
        }

        async fn call(&self, args: Self::Args) -> Result<Self::Output, Self::Error> {
            if args.message.is_empty() {
                return Err(EchoError);
            }
            Ok(args.message)
        }
    }

    #[tokio::test]
    async fn wrapper_round_trips_json() {
        let tool: Box<dyn DynTool> = Box::new(ToolWrapper(EchoTool));
        assert_eq!(tool.name(), "echo");
        assert!(!tool.is_terminal());

        let result = tool
            .call_json(serde_json::json!({"message": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("hello"));
    }

    #[tokio::test]
    async fn wrapper_reports_bad_args_and_tool_errors() {
        let tool = ToolWrapper(EchoTool);
        let err = tool.call_json(serde_json::json!({})).await.unwrap_err();
        assert!(err.starts_with("Failed to parse args"));
        let err = tool
            .call_json(serde_json::json!({"message": ""}))
            .await
            .unwrap_err();
        assert_eq!(err, "Tool error: echo error");
    }
}
