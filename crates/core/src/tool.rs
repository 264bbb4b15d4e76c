//! Tool trait and the process-level tool library.
//!
//! Tools are named callables a TOOL_CALL step can invoke. Personality
//! packs declare tools by name; at pack load the names are bound against
//! the [`ToolLibrary`] registered at startup. Tool code is never loaded
//! from pack directories — dynamic in-process code is a supply-chain risk,
//! so packs can only select from the vetted library.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ToolError;

/// A callable exposed to personalities.
///
/// Tools receive a key/value argument map and return a JSON-serializable
/// value that becomes the step result.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "get_weather").
    fn name(&self) -> &str;

    /// What this tool does, used in planning prompts.
    fn description(&self) -> &str;

    async fn execute(
        &self,
        arguments: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<serde_json::Value, ToolError>;
}

/// The process-level registry of vetted tools.
///
/// Personalities bind a subset of these by name at pack load.
#[derive(Default)]
pub struct ToolLibrary {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echoes back the input"
        }

        async fn execute(
            &self,
            arguments: serde_json::Map<String, serde_json::Value>,
        ) -> std::result::Result<serde_json::Value, ToolError> {
            let text = arguments
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidArguments("missing 'text'".into()))?;
            Ok(serde_json::json!({ "echo": text }))
        }
    }

    #[tokio::test]
    async fn library_register_and_execute() {
        let mut library = ToolLibrary::new();
        library.register(Arc::new(EchoTool));

        assert!(library.contains("echo"));
        assert!(!library.contains("nonexistent"));

        let tool = library.get("echo").unwrap();
        let mut args = serde_json::Map::new();
        args.insert("text".into(), serde_json::json!("hello"));
        let result = tool.execute(args).await.unwrap();
        assert_eq!(result["echo"], "hello");
    }

    #[tokio::test]
    async fn invalid_arguments_surface_as_tool_error() {
        let tool = EchoTool;
        let err = tool.execute(serde_json::Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[test]
    fn register_replaces_same_name() {
        let mut library = ToolLibrary::new();
        library.register(Arc::new(EchoTool));
        library.register(Arc::new(EchoTool));
        assert_eq!(library.len(), 1);
    }
}
