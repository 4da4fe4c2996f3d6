//! Model state: the operator DAG of one submitted network.
//!
//! A model is built when its request time is reached: the graph summary is
//! wired into operations and tensors, shapes are inferred, synthetic DRAM
//! addresses are assigned, and every operation is expanded into tiles. From
//! then on the model tracks which layers are executable (all inputs
//! produced) in an ordered ready queue consumed by the scheduler.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::graph::{Dim, GraphSummary};
use super::mapping::MappingTable;
use super::operation::{OpKind, Operation};
use super::tensor::Tensor;
use crate::config::SimulationConfig;
use crate::core::tile::Tile;

static NEXT_MODEL_ID: AtomicU64 = AtomicU64::new(0);

fn next_model_id() -> u64 {
    NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised while building a model from its graph summary.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unresolved symbolic axis '{0}': no binding in the model options")]
    UnresolvedAxis(String),

    #[error("model option '{0}' has the wrong type")]
    BadOption(String),
}

/// Per-model options from the workload file.
#[derive(Debug, Clone, Default)]
pub struct ModelOptions {
    /// Arrival time in seconds.
    pub request_time: f64,

    /// Partition hint for spatial schedulers.
    pub partition_id: Option<u32>,

    /// When >= 0, truncate the graph after `2 * nr_atten`
    /// SkipLayerNormalization nodes.
    pub nr_atten: Option<i64>,

    /// Bindings for symbolic input dimensions.
    pub axes: HashMap<String, u64>,
}

impl ModelOptions {
    /// Parse options from a JSON object. Recognized keys are lifted out;
    /// every other key is a dynamic-axis binding.
    pub fn from_json(value: &Value) -> Result<Self, ModelError> {
        let mut options = ModelOptions::default();
        let Some(object) = value.as_object() else {
            return Ok(options);
        };
        for (key, v) in object {
            match key.as_str() {
                "request_time" => {
                    options.request_time = v
                        .as_f64()
                        .ok_or_else(|| ModelError::BadOption(key.clone()))?;
                }
                "partition_id" => {
                    options.partition_id = Some(
                        v.as_u64()
                            .ok_or_else(|| ModelError::BadOption(key.clone()))?
                            as u32,
                    );
                }
                "nr_atten" => {
                    options.nr_atten =
                        Some(v.as_i64().ok_or_else(|| ModelError::BadOption(key.clone()))?);
                }
                _ => {
                    let bound = v.as_u64().filter(|&b| b > 0);
                    options.axes.insert(
                        key.clone(),
                        bound.ok_or_else(|| ModelError::BadOption(key.clone()))?,
                    );
                }
            }
        }
        Ok(options)
    }

    /// Arrival time in picoseconds.
    pub fn request_time_ps(&self) -> u64 {
        (self.request_time * 1e12).round() as u64
    }
}

/// One live model: its tensors, operations, and ready queue.
#[derive(Debug)]
pub struct Model {
    pub id: u64,
    pub name: String,

    /// Arrival time in picoseconds.
    pub request_time_ps: u64,

    /// Core-domain time of the first run, stamped by the driver.
    pub start_time_ps: Option<u64>,

    pub partition_id: Option<u32>,

    tensors: HashMap<u32, Tensor>,
    ops: HashMap<u32, Operation>,

    /// Operation ids in creation order, for deterministic iteration.
    op_order: Vec<u32>,

    /// Executable operations awaiting tile distribution, in readiness order.
    ready: Vec<u32>,
}

impl Model {
    /// Build a model from its graph summary and options.
    pub fn build(
        name: impl Into<String>,
        graph: &GraphSummary,
        options: &ModelOptions,
        config: &SimulationConfig,
        mapping: &MappingTable,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        let id = next_model_id();
        let mut model = Self {
            id,
            name,
            request_time_ps: options.request_time_ps(),
            start_time_ps: None,
            partition_id: options.partition_id,
            tensors: HashMap::new(),
            ops: HashMap::new(),
            op_order: Vec::new(),
            ready: Vec::new(),
        };
        let mut by_name: HashMap<String, u32> = HashMap::new();

        // Graph inputs, with dynamic axes resolved and channel-first inputs
        // canonicalized to channel-last.
        for (idx, input) in graph.inputs.iter().enumerate() {
            let mut dims = Vec::with_capacity(input.dims.len());
            for dim in &input.dims {
                match dim {
                    Dim::Fixed(v) => dims.push(*v),
                    Dim::Symbolic(axis) => dims.push(
                        *options
                            .axes
                            .get(axis)
                            .ok_or_else(|| ModelError::UnresolvedAxis(axis.clone()))?,
                    ),
                }
            }
            if idx == 0 && graph.inputs.len() == 1 && dims.len() == 4 && dims[2] == dims[3] {
                let channel = dims.remove(1);
                dims.push(channel);
            }
            let tensor = Tensor::new(&input.name, dims, config.precision, true);
            by_name.insert(input.name.clone(), tensor.id);
            model.tensors.insert(tensor.id, tensor);
        }

        for init in &graph.initializers {
            let dims = init
                .dims
                .iter()
                .map(|d| match d {
                    Dim::Fixed(v) => *v,
                    Dim::Symbolic(_) => 1,
                })
                .collect();
            let tensor = Tensor::new(&init.name, dims, config.precision, true);
            by_name.insert(init.name.clone(), tensor.id);
            model.tensors.insert(tensor.id, tensor);
        }

        // Nodes, through the operator factory. Unknown op types are skipped.
        let mut nr_skip = 0i64;
        for node in &graph.nodes {
            let Some(kind) = OpKind::from_node(node) else {
                log::warn!("model {}: skipping unknown op type '{}'", model.name, node.op_type);
                continue;
            };
            let mut inputs = Vec::new();
            for input_name in &node.inputs {
                if input_name.is_empty() {
                    continue;
                }
                let tensor_id = match by_name.get(input_name) {
                    Some(id) => *id,
                    None => {
                        // Output of a skipped node: treat as an external
                        // constant so consumers stay schedulable.
                        log::warn!(
                            "model {}: input '{}' has no producer, treating as constant",
                            model.name,
                            input_name
                        );
                        let tensor = Tensor::new(input_name, vec![1], config.precision, true);
                        let tensor_id = tensor.id;
                        by_name.insert(input_name.clone(), tensor_id);
                        model.tensors.insert(tensor_id, tensor);
                        tensor_id
                    }
                };
                inputs.push(tensor_id);
            }
            let mut op = Operation::new(node.name.clone(), node.op_type.clone(), kind, inputs);

            // Graph truncation for transformer subsetting: once enough
            // SkipLayerNormalization nodes have been seen, the last one
            // keeps no outputs and node creation stops.
            let truncate = node.op_type == "SkipLayerNormalization" && {
                nr_skip += 1;
                matches!(options.nr_atten, Some(n) if n >= 0 && nr_skip >= 2 * n)
            };
            if !truncate {
                let out_dims = op.output_dims(&model.tensors);
                for output_name in &node.outputs {
                    if output_name.is_empty() {
                        continue;
                    }
                    let mut tensor =
                        Tensor::new(output_name, out_dims.clone(), config.precision, false);
                    tensor.producer = Some(op.id);
                    let tensor_id = tensor.id;
                    by_name.insert(output_name.clone(), tensor_id);
                    model.tensors.insert(tensor_id, tensor);
                    op.outputs.push(tensor_id);
                }
            }
            model.op_order.push(op.id);
            model.ops.insert(op.id, op);
            if truncate {
                break;
            }
        }

        model.wire_edges();
        model.allocate_addresses(config.dram_req_size);
        let order = model.op_order.clone();
        for op_id in order {
            let mut op = model.ops.remove(&op_id).unwrap();
            op.initialize_tiles(model.id, mapping, config, &model.tensors);
            model.ops.insert(op_id, op);
        }

        // Seed the ready queue with every operation whose inputs are all
        // produced.
        for &op_id in &model.op_order {
            if model.ops[&op_id].check_executable(&model.tensors) {
                model.ready.push(op_id);
            }
        }
        log::info!(
            "model {} ({}): {} ops, {} tensors, {} initially executable",
            model.name,
            model.id,
            model.op_order.len(),
            model.tensors.len(),
            model.ready.len()
        );
        Ok(model)
    }

    /// Connect parent/child edges through tensor producers.
    fn wire_edges(&mut self) {
        let mut edges: Vec<(u32, u32)> = Vec::new();
        for (&op_id, op) in &self.ops {
            for input in &op.inputs {
                if let Some(producer) = self.tensors.get(input).and_then(|t| t.producer) {
                    edges.push((producer, op_id));
                }
            }
        }
        for (parent, child) in edges {
            let op = self.ops.get_mut(&child).unwrap();
            if !op.parents.contains(&parent) {
                op.parents.push(parent);
            }
            let op = self.ops.get_mut(&parent).unwrap();
            if !op.children.contains(&child) {
                op.children.push(child);
            }
        }
    }

    /// Assign synthetic DRAM base addresses, request-size aligned.
    fn allocate_addresses(&mut self, req_size: u64) {
        let mut ids: Vec<u32> = self.tensors.keys().copied().collect();
        ids.sort_unstable();
        let mut next = 0u64;
        for id in ids {
            let tensor = self.tensors.get_mut(&id).unwrap();
            tensor.address = next;
            let size = tensor.size_bytes();
            next += size.div_ceil(req_size).max(1) * req_size;
        }
    }

    /// Pop the next executable operation, if any.
    pub fn pop_ready(&mut self) -> Option<u32> {
        if self.ready.is_empty() {
            None
        } else {
            Some(self.ready.remove(0))
        }
    }

    /// Move an operation's tiles out for distribution.
    pub fn take_tiles(&mut self, op_id: u32) -> Vec<Tile> {
        std::mem::take(&mut self.ops.get_mut(&op_id).unwrap().tiles)
    }

    /// Mark a layer finished, produce its outputs, and enqueue any children
    /// that became executable. Duplicates are prevented by a linear check.
    pub fn set_layer_finish(&mut self, op_id: u32) {
        let (outputs, children) = {
            let op = self.ops.get_mut(&op_id).unwrap();
            op.set_finish();
            (op.outputs.clone(), op.children.clone())
        };
        for tensor_id in outputs {
            if let Some(tensor) = self.tensors.get_mut(&tensor_id) {
                tensor.produced = true;
            }
        }
        for child in children {
            if self.ops[&child].check_executable(&self.tensors) && !self.ready.contains(&child) {
                self.ready.push(child);
            }
        }
    }

    /// Stamp the first-run time. Later stamps are ignored.
    pub fn update_start_time(&mut self, now_ps: u64) {
        if self.start_time_ps.is_none() {
            self.start_time_ps = Some(now_ps);
        }
    }

    /// Whether every operation has finished.
    pub fn finished(&self) -> bool {
        self.ops.values().all(|op| op.finished)
    }

    pub fn num_ops(&self) -> usize {
        self.op_order.len()
    }

    pub fn op(&self, op_id: u32) -> Option<&Operation> {
        self.ops.get(&op_id)
    }

    /// Total tiles across all operations. Meaningful before distribution.
    pub fn total_tiles(&self) -> usize {
        self.ops.values().map(|op| op.tiles.len()).sum()
    }
}

/// Arena of live models, owned by the simulator. The scheduler addresses
/// models by id through this pool instead of holding references.
#[derive(Debug, Default)]
pub struct ModelPool {
    models: HashMap<u64, Model>,
}

impl ModelPool {
    pub fn insert(&mut self, model: Model) -> u64 {
        let id = model.id;
        self.models.insert(id, model);
        id
    }

    pub fn get(&self, id: u64) -> Option<&Model> {
        self.models.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Model> {
        self.models.get_mut(&id)
    }

    pub fn remove(&mut self, id: u64) -> Option<Model> {
        self.models.remove(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::graph::{NodeSummary, ValueInfo};

    fn value(name: &str, dims: Vec<u64>) -> ValueInfo {
        ValueInfo {
            name: name.into(),
            dims: dims.into_iter().map(Dim::Fixed).collect(),
        }
    }

    fn node(op_type: &str, inputs: &[&str], outputs: &[&str]) -> NodeSummary {
        NodeSummary {
            name: format!("{}_{}", op_type, outputs.first().unwrap_or(&"")),
            op_type: op_type.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            attributes: HashMap::new(),
        }
    }

    fn build(graph: &GraphSummary, options: &ModelOptions) -> Model {
        let config = SimulationConfig::default();
        let mapping = MappingTable::from_config(&config);
        Model::build("test", graph, options, &config, &mapping).unwrap()
    }

    fn chain_graph() -> GraphSummary {
        // x -> MatMul(w0) -> Relu -> MatMul(w1) -> y
        GraphSummary {
            inputs: vec![value("x", vec![4, 8])],
            initializers: vec![value("w0", vec![8, 8]), value("w1", vec![8, 4])],
            nodes: vec![
                node("MatMul", &["x", "w0"], &["h0"]),
                node("Relu", &["h0"], &["h1"]),
                node("MatMul", &["h1", "w1"], &["y"]),
            ],
        }
    }

    #[test]
    fn test_chain_wiring_and_initial_ready() {
        let model = build(&chain_graph(), &ModelOptions::default());
        assert_eq!(model.num_ops(), 3);
        // Only the first MatMul is executable at load.
        assert_eq!(model.ready.len(), 1);
        let first = model.ops[&model.ready[0]].clone();
        assert_eq!(first.op_type, "MatMul");
        assert!(first.parents.is_empty());
        assert_eq!(first.children.len(), 1);
    }

    #[test]
    fn test_layer_finish_unlocks_children() {
        let mut model = build(&chain_graph(), &ModelOptions::default());
        let first = model.pop_ready().unwrap();
        assert!(model.pop_ready().is_none());
        model.set_layer_finish(first);
        let second = model.pop_ready().unwrap();
        assert_eq!(model.ops[&second].op_type, "Relu");
        model.set_layer_finish(second);
        let third = model.pop_ready().unwrap();
        model.set_layer_finish(third);
        assert!(model.finished());
    }

    #[test]
    fn test_duplicate_ready_entries_prevented() {
        // Diamond: both parents finishing re-check the join node.
        let graph = GraphSummary {
            inputs: vec![value("x", vec![4, 4])],
            initializers: vec![],
            nodes: vec![
                node("Relu", &["x"], &["a"]),
                node("Gelu", &["x"], &["b"]),
                node("Add", &["a", "b"], &["y"]),
            ],
        };
        let mut model = build(&graph, &ModelOptions::default());
        let first = model.pop_ready().unwrap();
        let second = model.pop_ready().unwrap();
        model.set_layer_finish(first);
        model.set_layer_finish(second);
        let join = model.pop_ready().unwrap();
        assert_eq!(model.ops[&join].op_type, "Add");
        assert!(model.pop_ready().is_none());
    }

    #[test]
    fn test_symbolic_axis_resolution() {
        let graph = GraphSummary {
            inputs: vec![ValueInfo {
                name: "x".into(),
                dims: vec![Dim::Fixed(1), Dim::Symbolic("seq".into()), Dim::Fixed(8)],
            }],
            initializers: vec![],
            nodes: vec![node("Relu", &["x"], &["y"])],
        };
        let mut options = ModelOptions::default();
        options.axes.insert("seq".into(), 16);
        let model = build(&graph, &options);
        let x = model.tensors.values().find(|t| t.name == "x").unwrap();
        assert_eq!(x.dims, vec![1, 16, 8]);
    }

    #[test]
    fn test_unresolved_axis_is_an_error() {
        let graph = GraphSummary {
            inputs: vec![ValueInfo {
                name: "x".into(),
                dims: vec![Dim::Symbolic("seq".into())],
            }],
            initializers: vec![],
            nodes: vec![],
        };
        let config = SimulationConfig::default();
        let mapping = MappingTable::from_config(&config);
        let result = Model::build("t", &graph, &ModelOptions::default(), &config, &mapping);
        assert!(matches!(result, Err(ModelError::UnresolvedAxis(_))));
    }

    #[test]
    fn test_channel_first_input_canonicalized() {
        let graph = GraphSummary {
            inputs: vec![value("x", vec![1, 3, 224, 224])],
            initializers: vec![],
            nodes: vec![node("Relu", &["x"], &["y"])],
        };
        let model = build(&graph, &ModelOptions::default());
        let x = model.tensors.values().find(|t| t.name == "x").unwrap();
        assert_eq!(x.dims, vec![1, 224, 224, 3]);
    }

    #[test]
    fn test_unknown_ops_are_skipped() {
        let graph = GraphSummary {
            inputs: vec![value("x", vec![4, 4])],
            initializers: vec![],
            nodes: vec![
                node("EsotericCustomOp", &["x"], &["a"]),
                node("Relu", &["a"], &["y"]),
            ],
        };
        let model = build(&graph, &ModelOptions::default());
        // The unknown op vanished; its consumer runs against a placeholder.
        assert_eq!(model.num_ops(), 1);
        assert_eq!(model.ready.len(), 1);
    }

    #[test]
    fn test_nr_atten_truncates_graph() {
        let graph = GraphSummary {
            inputs: vec![value("x", vec![4, 4])],
            initializers: vec![],
            nodes: vec![
                node("SkipLayerNormalization", &["x"], &["a"]),
                node("SkipLayerNormalization", &["a"], &["b"]),
                node("SkipLayerNormalization", &["b"], &["c"]),
                node("Relu", &["c"], &["y"]),
            ],
        };
        let options = ModelOptions {
            nr_atten: Some(1),
            ..Default::default()
        };
        let model = build(&graph, &options);
        // Truncated after 2 * nr_atten SkipLayerNormalization nodes; the
        // second keeps no outputs and nothing follows it.
        assert_eq!(model.num_ops(), 2);
        let last = model
            .ops
            .values()
            .find(|op| op.outputs.is_empty())
            .expect("truncated node has no outputs");
        assert_eq!(last.op_type, "SkipLayerNormalization");
    }

    #[test]
    fn test_request_time_converts_to_picoseconds() {
        let json: Value = serde_json::from_str(r#"{"request_time": 1e-6, "seq": 32}"#).unwrap();
        let options = ModelOptions::from_json(&json).unwrap();
        assert_eq!(options.request_time_ps(), 1_000_000);
        assert_eq!(options.axes["seq"], 32);
    }

    #[test]
    fn test_addresses_do_not_overlap() {
        let model = build(&chain_graph(), &ModelOptions::default());
        let mut spans: Vec<(u64, u64)> = model
            .tensors
            .values()
            .map(|t| (t.address, t.address + t.size_bytes()))
            .collect();
        spans.sort_unstable();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "tensor allocations overlap");
        }
    }
}
