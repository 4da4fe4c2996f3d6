//! Parser-boundary graph types.
//!
//! These structs are the contract with the external ONNX parsing layer:
//! only `graph.input`, `graph.initializer`, and `graph.node` survive the
//! decode, and they arrive here as plain values deserializable from JSON.
//! Symbolic input dimensions are carried by name and resolved against the
//! per-model options at load time.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One dimension of a tensor shape: fixed, or symbolic by axis name.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Dim {
    Fixed(u64),
    Symbolic(String),
}

/// A graph input or initializer: a named tensor with a shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ValueInfo {
    pub name: String,
    #[serde(default)]
    pub dims: Vec<Dim>,
}

/// One node attribute value.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Attribute {
    Int(i64),
    Ints(Vec<i64>),
    Float(f64),
    Str(String),
}

impl Attribute {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Attribute::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Attribute::Ints(v) => Some(v),
            _ => None,
        }
    }
}

/// One operator node of the graph.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSummary {
    #[serde(default)]
    pub name: String,
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub attributes: HashMap<String, Attribute>,
}

/// Everything the parsing layer hands over for one model.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GraphSummary {
    pub inputs: Vec<ValueInfo>,
    pub initializers: Vec<ValueInfo>,
    pub nodes: Vec<NodeSummary>,
}

impl GraphSummary {
    /// Load a graph summary from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let graph = serde_json::from_str(&content)?;
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_json_round_trip() {
        let json = r#"{
            "inputs": [{"name": "x", "dims": [1, "seq", 64]}],
            "initializers": [{"name": "w", "dims": [64, 64]}],
            "nodes": [{
                "op_type": "MatMul",
                "inputs": ["x", "w"],
                "outputs": ["y"],
                "attributes": {"alpha": 1.5, "pads": [0, 0, 0, 0]}
            }]
        }"#;
        let graph: GraphSummary = serde_json::from_str(json).unwrap();
        assert_eq!(graph.inputs[0].dims[1], Dim::Symbolic("seq".into()));
        assert_eq!(graph.inputs[0].dims[0], Dim::Fixed(1));
        let node = &graph.nodes[0];
        assert_eq!(node.op_type, "MatMul");
        assert_eq!(node.attributes["pads"].as_ints(), Some(&[0i64, 0, 0, 0][..]));
    }

    #[test]
    fn test_missing_sections_default_empty() {
        let graph: GraphSummary = serde_json::from_str("{}").unwrap();
        assert!(graph.inputs.is_empty());
        assert!(graph.nodes.is_empty());
    }
}
