use anyhow::Context;
use serde::{Deserialize, Serialize};

/// One operation of a topology: a unique id, its kind, the ids it reads in
/// slot order, and kind-specific parameters the core never interprets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrimitiveDesc {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl PrimitiveDesc {
    pub fn new(id: &str, kind: &str, inputs: &[&str], params: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            params,
        }
    }

    /// Deserializes `params` into an op-specific struct, naming the primitive on failure.
    pub fn parse_params<T: for<'de> Deserialize<'de>>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.params.clone())
            .with_context(|| format!("Invalid parameters for '{}' ({})", self.id, self.kind))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Topology {
    pub primitives: Vec<PrimitiveDesc>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("Failed to parse topology")
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn add(&mut self, desc: PrimitiveDesc) -> &mut Self {
        self.primitives.push(desc);
        self
    }

    pub fn with(mut self, desc: PrimitiveDesc) -> Self {
        self.primitives.push(desc);
        self
    }

    pub fn get(&self, id: &str) -> Option<&PrimitiveDesc> {
        self.primitives.iter().find(|p| p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PrimitiveDesc> {
        self.primitives.iter()
    }

    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}
