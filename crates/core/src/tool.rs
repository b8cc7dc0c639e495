//! Tool trait: capabilities the model can ask the pipeline to run.
//!
//! Tools are registered once at startup in a [`ToolRegistry`], which is then
//! shared immutably (behind `Arc`) by every request.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::CallContext;
use crate::error::{ConfigurationError, ToolError};
use crate::message::ToolCallIntent;
use crate::model::ToolDefinition;

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g. "createTicket").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// When true, a successful result of this tool is the final answer and
    /// no further model round runs.
    fn returns_direct(&self) -> bool {
        false
    }

    /// Keys this tool reads from the [`CallContext`].
    fn required_context(&self) -> &[&str] {
        &[]
    }

    /// Execute the tool with parsed arguments and the request's call context.
    async fn invoke(
        &self,
        arguments: serde_json::Value,
        context: &CallContext,
    ) -> Result<String, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools, in registration order.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.
    ///
    /// Fails on a duplicate name or a malformed parameter schema.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ConfigurationError> {
        let name = tool.name().to_string();
        if self.index.contains_key(&name) {
            return Err(ConfigurationError::DuplicateTool(name));
        }
        validate_schema(&name, &tool.parameters_schema())?;

        self.index.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// All tool definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.to_definition()).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve and run one intent: lookup, argument parsing, context check,
    /// then the tool itself. Timeouts are the caller's concern.
    pub async fn invoke(
        &self,
        intent: &ToolCallIntent,
        context: &CallContext,
    ) -> Result<String, ToolError> {
        let tool = self
            .get(&intent.name)
            .ok_or_else(|| ToolError::NotFound(intent.name.clone()))?;

        let arguments = intent
            .parsed_arguments()
            .map_err(|e| ToolError::InvalidArguments {
                tool_name: intent.name.clone(),
                reason: e.to_string(),
            })?;

        if let Some(key) = tool
            .required_context()
            .iter()
            .find(|key| !context.contains(key))
        {
            return Err(ToolError::MissingContext {
                tool_name: intent.name.clone(),
                key: key.to_string(),
            });
        }

        tool.invoke(arguments, context).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

fn validate_schema(tool_name: &str, schema: &serde_json::Value) -> Result<(), ConfigurationError> {
    let invalid = |reason: &str| ConfigurationError::InvalidToolSchema {
        tool_name: tool_name.to_string(),
        reason: reason.to_string(),
    };

    let obj = schema
        .as_object()
        .ok_or_else(|| invalid("schema must be a JSON object"))?;

    if obj.get("type").and_then(|t| t.as_str()) != Some("object") {
        return Err(invalid("schema type must be \"object\""));
    }

    let properties = match obj.get("properties") {
        None => None,
        Some(serde_json::Value::Object(props)) => Some(props),
        Some(_) => return Err(invalid("\"properties\" must be an object")),
    };

    if let Some(required) = obj.get("required") {
        let required = required
            .as_array()
            .ok_or_else(|| invalid("\"required\" must be an array"))?;
        for field in required {
            let field = field
                .as_str()
                .ok_or_else(|| invalid("\"required\" entries must be strings"))?;
            if !properties.is_some_and(|p| p.contains_key(field)) {
                return Err(invalid(&format!(
                    "required field '{field}' is not declared in properties"
                )));
            }
        }
    }

    Ok(())
}
