//! Execution context handed to the computation engine.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ContextMessage, ExecutionId, ExecutionInput, ExecutionKind};

/// Toolset configuration resolved from the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsetConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub toolset_type: String,
    #[serde(default)]
    pub configuration: Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

/// Everything the engine needs to run one turn.
///
/// The coordinator builds this after history is loaded; the engine never
/// sees stored metadata, only the projected conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub kind: ExecutionKind,
    pub entity_id: String,
    pub organization_id: String,
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    /// Prior conversation, oldest first.
    #[serde(default)]
    pub history: Vec<ContextMessage>,
    #[serde(default)]
    pub toolsets: Vec<ToolsetConfig>,

    /// Arbitrary metadata for engine-specific needs.
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionContext {
    /// Build a context for `input` continuing `history`.
    #[must_use]
    pub fn new(input: &ExecutionInput, history: Vec<ContextMessage>) -> Self {
        Self {
            execution_id: input.execution_id.clone(),
            kind: input.kind,
            entity_id: input.entity_id.clone(),
            organization_id: input.organization_id.clone(),
            prompt: input.prompt.clone(),
            system_prompt: input.system_prompt.clone(),
            model_id: input.model_id.clone(),
            history,
            toolsets: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Attach resolved toolsets.
    #[must_use]
    pub fn with_toolsets(mut self, toolsets: Vec<ToolsetConfig>) -> Self {
        self.toolsets = toolsets;
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
