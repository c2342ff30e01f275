// Tool registry: resolves a step's `uses` address to an adapter
//
// The registry ships with the built-in adapters (echo, log, http.fetch);
// real extensions register their own tools at startup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

/// Failure reported by a tool adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolError {
    /// No tool registered at the address.
    #[error("no tool registered at address: {0}")]
    Unknown(String),

    /// The adapter ran and failed.
    #[error("{0}")]
    Failed(String),
}

/// A tool adapter invocable from a pipeline step.
///
/// Adapters may use whatever I/O model they wish internally but must be
/// cancellable: the engine drops the in-flight future when the step's
/// deadline fires.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Address the registry resolves (e.g. "http.fetch").
    fn address(&self) -> &str;

    /// Human description, surfaced by operator tooling.
    fn description(&self) -> &str;

    /// Execute the tool with rendered arguments. The returned value must be
    /// serializable JSON; it becomes the step's output in the context.
    async fn invoke(&self, args: Value) -> Result<Value, ToolError>;
}

/// Address -> adapter map.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(LogTool));
        registry.register(Arc::new(HttpFetchTool::new()));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.address().to_string(), tool);
    }

    pub fn get(&self, address: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(address).cloned()
    }

    pub async fn invoke(&self, address: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(address)
            .ok_or_else(|| ToolError::Unknown(address.to_string()))?;
        tool.invoke(args).await
    }
}

/// Echoes its arguments back as the step output.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn address(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the rendered arguments unchanged."
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        Ok(args)
    }
}

/// Logs the rendered `text` argument and returns it.
pub struct LogTool;

#[async_trait]
impl Tool for LogTool {
    fn address(&self) -> &str {
        "log"
    }

    fn description(&self) -> &str {
        "Log the `text` argument at info level."
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let text = args
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed("log requires a string `text` argument".into()))?;
        info!(target: "metronome::pipeline", "{}", text);
        Ok(json!({ "logged": true, "text": text }))
    }
}

/// HTTP adapter: GET/POST a URL, returning status and body.
pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn address(&self) -> &str {
        "http.fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL. Arguments: url, method (GET|POST, default GET), optional json body."
    }

    async fn invoke(&self, args: Value) -> Result<Value, ToolError> {
        let url = args
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Failed("http.fetch requires a `url` argument".into()))?;
        let method = args
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();

        let request = match method.as_str() {
            "GET" => self.client.get(url),
            "POST" => {
                let mut req = self.client.post(url);
                if let Some(body) = args.get("body") {
                    req = req.json(body);
                }
                req
            }
            other => {
                return Err(ToolError::Failed(format!(
                    "http.fetch supports GET and POST, got {}",
                    other
                )))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Failed(format!("failed to read body: {}", e)))?;

        if status.is_server_error() {
            return Err(ToolError::Failed(format!("upstream returned {}", status)));
        }

        // JSON bodies come back structured; anything else stays a string.
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        Ok(json!({ "status": status.as_u16(), "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_args() {
        let registry = ToolRegistry::builtin();
        let out = registry
            .invoke("echo", json!({"message": "hi"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"message": "hi"}));
    }

    #[tokio::test]
    async fn log_requires_text() {
        let registry = ToolRegistry::builtin();
        assert!(registry.invoke("log", json!({})).await.is_err());
        let out = registry
            .invoke("log", json!({"text": "note"}))
            .await
            .unwrap();
        assert_eq!(out, json!({"logged": true, "text": "note"}));
    }

    #[tokio::test]
    async fn unknown_address_is_reported() {
        let registry = ToolRegistry::builtin();
        let err = registry.invoke("nope.nothing", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));
    }
}
