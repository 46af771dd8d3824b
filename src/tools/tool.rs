//! Tool descriptor types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Coarse parameter category exposed to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Number,
    String,
}

impl ParamType {
    pub fn json_type(self) -> &'static str {
        match self {
            ParamType::Number => "number",
            ParamType::String => "string",
        }
    }
}

/// One declared field of a tool's parameter struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    pub kind: ParamType,
    pub description: String,
}

/// Provider-agnostic description of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        kind: ParamType,
        description: impl Into<String>,
    ) -> Self {
        self.parameters.push(ToolParameter {
            name: name.into(),
            kind,
            description: description.into(),
        });
        self
    }

    /// JSON schema of the parameters object.
    ///
    /// Every parameter is required and no others are accepted, which is what
    /// strict function calling expects.
    pub fn json_schema(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({
                        "type": p.kind.json_type(),
                        "description": p.description,
                    }),
                )
            })
            .collect();
        let required: Vec<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// A built tool the agent can call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    /// The tool's directory, which also holds its private sub-tools.
    pub dir: PathBuf,
    pub executable: PathBuf,
}

impl RegisteredTool {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}
