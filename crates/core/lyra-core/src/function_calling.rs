//! Tool (function-calling) support shared by the agent bridge and the
//! speech-to-speech engines

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tool definition exposed to providers that support function calling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique within a registry)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Parameters schema (JSON Schema)
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-generated call id, echoed back with the result
    pub call_id: String,

    /// Tool name to invoke
    pub name: String,

    /// Arguments (JSON object)
    pub arguments: serde_json::Value,
}

/// Tool handler type
pub type ToolHandler = Arc<
    dyn Fn(
            serde_json::Value,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::Result<serde_json::Value>> + Send>>
        + Send
        + Sync,
>;

/// Registry of callable tools
///
/// Execution never surfaces an `Err` to the caller: unknown tools and
/// failing handlers both produce an `{"error": "..."}` value, so a bad
/// tool call can never take down a voice session.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, (ToolDefinition, ToolHandler)>,
}

impl ToolRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool
    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        info!(tool = %definition.name, "Registering tool");
        self.tools
            .insert(definition.name.clone(), (definition, handler));
    }

    /// Get a tool definition by name
    pub fn get_definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|(def, _)| def)
    }

    /// Get all tool definitions (for S2S session setup)
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|(def, _)| def.clone()).collect()
    }

    /// Execute a tool by name
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> serde_json::Value {
        debug!(tool = %name, args = %arguments, "Executing tool");

        match self.tools.get(name) {
            Some((_def, handler)) => match handler(arguments).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %name, error = %e, "Tool handler failed");
                    serde_json::json!({ "error": e.to_string() })
                }
            },
            None => {
                warn!(tool = %name, "Unknown tool");
                serde_json::json!({ "error": format!("Unknown tool: {}", name) })
            }
        }
    }

    /// Check if a tool exists
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Helper to create a tool definition
pub fn create_tool_definition(
    name: impl Into<String>,
    description: impl Into<String>,
    parameters: serde_json::Value,
) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    }
}
