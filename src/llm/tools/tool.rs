use crate::error::Result;
use schemars::JsonSchema;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// A tool the model may call: name, description and JSON schema for its arguments.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parameters: Value,
}

/// OpenAI-style tool descriptor (`{"type": "function", "function": {...}}`)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolDescriptor {
    pub r#type: String,
    pub function: FunctionDescriptor,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDeclaration {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }

    /// Derive the parameter schema from a Rust type.
    pub fn from_schema<T: JsonSchema>(
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Self> {
        let mut parameters = serde_json::to_value(schemars::schema_for!(T))?;
        if let Some(object) = parameters.as_object_mut() {
            // Vendors reject the draft marker; the title just repeats the type name.
            object.remove("$schema");
            object.remove("title");
        }
        Ok(Self::new(name, description, parameters))
    }

    /// Anthropic `tools[]` entry.
    pub fn to_anthropic(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "input_schema": self.parameters,
        })
    }

    /// Gemini `function_declarations[]` entry.
    pub fn to_gemini(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    pub fn to_openai(&self) -> ToolDescriptor {
        ToolDescriptor {
            r#type: "function".to_string(),
            function: FunctionDescriptor {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
            },
        }
    }
}

/// Source of tool declarations, consulted only when building requests.
pub trait ToolRegistry {
    fn declarations(&self) -> Vec<ToolDeclaration>;
}

impl ToolRegistry for [ToolDeclaration] {
    fn declarations(&self) -> Vec<ToolDeclaration> {
        self.to_vec()
    }
}

impl ToolRegistry for Vec<ToolDeclaration> {
    fn declarations(&self) -> Vec<ToolDeclaration> {
        self.clone()
    }
}

/// Bare `{name → schema}` registries carry no descriptions.
impl ToolRegistry for BTreeMap<String, Value> {
    fn declarations(&self) -> Vec<ToolDeclaration> {
        self.iter()
            .map(|(name, schema)| ToolDeclaration::new(name.clone(), "", schema.clone()))
            .collect()
    }
}
