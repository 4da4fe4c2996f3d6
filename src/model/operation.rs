//! Operations: nodes of the operator graph.
//!
//! Operator kinds share one edge/state representation and differ only in
//! shape inference and tile expansion, dispatched over [`OpKind`]. The
//! factory resolves ONNX op-type strings; unknown types yield no operation
//! and the node is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use super::graph::NodeSummary;
use super::mapping::MappingTable;
use super::tensor::Tensor;
use crate::config::SimulationConfig;
use crate::core::tile::{Instruction, Tile, VectorOp};

static NEXT_LAYER_ID: AtomicU32 = AtomicU32::new(0);

fn next_layer_id() -> u32 {
    NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
    Global,
}

/// Operator kind with its shape parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Convolution, mapped to GEMM space through its im2col view.
    Conv {
        kernel: (u64, u64),
        stride: (u64, u64),
        /// Total padding per spatial dim (begin + end).
        pads: (u64, u64),
    },
    /// Dense matrix product (Gemm, MatMul).
    Gemm,
    Pool {
        kind: PoolKind,
        kernel: (u64, u64),
        stride: (u64, u64),
    },
    Activation {
        op: VectorOp,
    },
    LayerNorm {
        /// SkipLayerNormalization fuses the residual add.
        skip: bool,
    },
    Eltwise {
        op: VectorOp,
    },
    /// Shape-only operators (Flatten, Reshape, ...): one bookkeeping tile,
    /// no data movement.
    Passthrough,
}

impl OpKind {
    /// Resolve an ONNX op-type string. Unknown types return `None` and the
    /// caller skips the node.
    pub fn from_node(node: &NodeSummary) -> Option<OpKind> {
        let spatial_pair = |key: &str, default: u64| -> (u64, u64) {
            node.attributes
                .get(key)
                .and_then(|a| a.as_ints())
                .map(|v| {
                    let h = v.first().copied().unwrap_or(default as i64).max(0) as u64;
                    let w = v.get(1).copied().unwrap_or(h as i64).max(0) as u64;
                    (h, w)
                })
                .unwrap_or((default, default))
        };
        let total_pads = || -> (u64, u64) {
            node.attributes
                .get("pads")
                .and_then(|a| a.as_ints())
                .map(|v| {
                    let get = |i: usize| v.get(i).copied().unwrap_or(0).max(0) as u64;
                    // ONNX order: [h_begin, w_begin, h_end, w_end]
                    (get(0) + get(2), get(1) + get(3))
                })
                .unwrap_or((0, 0))
        };
        match node.op_type.as_str() {
            "Conv" => Some(OpKind::Conv {
                kernel: spatial_pair("kernel_shape", 1),
                stride: spatial_pair("strides", 1),
                pads: total_pads(),
            }),
            "Gemm" | "MatMul" => Some(OpKind::Gemm),
            "MaxPool" => Some(OpKind::Pool {
                kind: PoolKind::Max,
                kernel: spatial_pair("kernel_shape", 1),
                stride: spatial_pair("strides", 1),
            }),
            "AveragePool" => Some(OpKind::Pool {
                kind: PoolKind::Average,
                kernel: spatial_pair("kernel_shape", 1),
                stride: spatial_pair("strides", 1),
            }),
            "GlobalAveragePool" => Some(OpKind::Pool {
                kind: PoolKind::Global,
                kernel: (0, 0),
                stride: (1, 1),
            }),
            "Relu" => Some(OpKind::Activation { op: VectorOp::Relu }),
            "Gelu" | "FastGelu" => Some(OpKind::Activation { op: VectorOp::Gelu }),
            "Softmax" => Some(OpKind::Activation { op: VectorOp::Softmax }),
            "LayerNormalization" => Some(OpKind::LayerNorm { skip: false }),
            "SkipLayerNormalization" => Some(OpKind::LayerNorm { skip: true }),
            "Add" | "Sum" => Some(OpKind::Eltwise { op: VectorOp::Add }),
            "Mul" => Some(OpKind::Eltwise { op: VectorOp::Mul }),
            "Flatten" | "Reshape" | "Squeeze" | "Unsqueeze" | "Transpose" | "Identity"
            | "Cast" => Some(OpKind::Passthrough),
            _ => None,
        }
    }
}

/// One node of the operator graph: shared edge and state data plus the
/// kind-specific tile generator.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Process-unique layer id.
    pub id: u32,
    pub name: String,
    pub op_type: String,
    pub kind: OpKind,

    /// Input tensor ids.
    pub inputs: Vec<u32>,

    /// Output tensor ids. May be empty after graph truncation.
    pub outputs: Vec<u32>,

    /// Producing operations of this operation's inputs.
    pub parents: Vec<u32>,

    /// Operations consuming this operation's outputs.
    pub children: Vec<u32>,

    pub finished: bool,

    /// Tiles produced by `initialize_tiles`, taken by the scheduler.
    pub tiles: Vec<Tile>,
}

impl Operation {
    pub fn new(name: String, op_type: String, kind: OpKind, inputs: Vec<u32>) -> Self {
        Self {
            id: next_layer_id(),
            name,
            op_type,
            kind,
            inputs,
            outputs: Vec::new(),
            parents: Vec::new(),
            children: Vec::new(),
            finished: false,
            tiles: Vec::new(),
        }
    }

    fn input_tensor<'t>(&self, tensors: &'t HashMap<u32, Tensor>, idx: usize) -> Option<&'t Tensor> {
        self.inputs.get(idx).and_then(|id| tensors.get(id))
    }

    /// Infer the shape of this operation's (single) output.
    pub fn output_dims(&self, tensors: &HashMap<u32, Tensor>) -> Vec<u64> {
        let in0: Vec<u64> = self
            .input_tensor(tensors, 0)
            .map(|t| t.dims.clone())
            .unwrap_or_else(|| vec![1]);
        match &self.kind {
            OpKind::Conv { kernel, stride, pads } => {
                // Channel-last layout: [batch, h, w, c]
                if in0.len() == 4 {
                    let (b, h, w) = (in0[0], in0[1], in0[2]);
                    let oh = (h + pads.0).saturating_sub(kernel.0) / stride.0.max(1) + 1;
                    let ow = (w + pads.1).saturating_sub(kernel.1) / stride.1.max(1) + 1;
                    let out_c = self
                        .input_tensor(tensors, 1)
                        .and_then(|wt| wt.dims.first().copied())
                        .unwrap_or(in0[3]);
                    vec![b, oh, ow, out_c]
                } else {
                    in0
                }
            }
            OpKind::Gemm => {
                let n = self
                    .input_tensor(tensors, 1)
                    .and_then(|t| t.dims.last().copied())
                    .unwrap_or(1);
                let mut dims = in0;
                if dims.is_empty() {
                    dims.push(1);
                }
                *dims.last_mut().unwrap() = n;
                dims
            }
            OpKind::Pool { kind, kernel, stride } => {
                if in0.len() == 4 {
                    let (b, h, w, c) = (in0[0], in0[1], in0[2], in0[3]);
                    match kind {
                        PoolKind::Global => vec![b, 1, 1, c],
                        _ => {
                            let oh = h.saturating_sub(kernel.0) / stride.0.max(1) + 1;
                            let ow = w.saturating_sub(kernel.1) / stride.1.max(1) + 1;
                            vec![b, oh, ow, c]
                        }
                    }
                } else {
                    in0
                }
            }
            OpKind::Activation { .. }
            | OpKind::LayerNorm { .. }
            | OpKind::Eltwise { .. }
            | OpKind::Passthrough => in0,
        }
    }

    /// GEMM-space problem size for array-mapped kinds.
    fn gemm_dims(&self, tensors: &HashMap<u32, Tensor>) -> Option<(u64, u64, u64)> {
        match &self.kind {
            OpKind::Gemm => {
                let a = self.input_tensor(tensors, 0)?;
                let k = a.dims.last().copied().unwrap_or(1).max(1);
                let m = (a.num_elems() / k).max(1);
                let n = self
                    .input_tensor(tensors, 1)
                    .map(|b| (b.num_elems() / k).max(1))
                    .unwrap_or(1);
                Some((m, n, k))
            }
            OpKind::Conv { kernel, .. } => {
                let a = self.input_tensor(tensors, 0)?;
                let out_dims = self.output_dims(tensors);
                if a.dims.len() == 4 && out_dims.len() == 4 {
                    let m = out_dims[0] * out_dims[1] * out_dims[2];
                    let n = out_dims[3];
                    let k = kernel.0.max(1) * kernel.1.max(1) * a.dims[3];
                    Some((m.max(1), n.max(1), k.max(1)))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// An operation is executable iff all its inputs are produced and it is
    /// not finished.
    pub fn check_executable(&self, tensors: &HashMap<u32, Tensor>) -> bool {
        !self.finished
            && self.inputs.iter().all(|id| {
                tensors.get(id).map(|t| t.produced).unwrap_or(false)
            })
    }

    /// Mark the operation finished. Finishing twice is a programming error;
    /// the flag never reverts.
    pub fn set_finish(&mut self) {
        assert!(!self.finished, "layer {} finished twice", self.id);
        self.finished = true;
    }

    /// Expand this operation into tiles using the mapping table.
    pub fn initialize_tiles(
        &mut self,
        model_id: u64,
        mapping: &MappingTable,
        config: &SimulationConfig,
        tensors: &HashMap<u32, Tensor>,
    ) {
        self.tiles = match &self.kind {
            OpKind::Conv { .. } | OpKind::Gemm => {
                self.gemm_tiles(model_id, mapping, config, tensors)
            }
            OpKind::Pool { .. } => self.vector_tiles(model_id, VectorOp::Pool, mapping, config, tensors),
            OpKind::Activation { op } => {
                self.vector_tiles(model_id, *op, mapping, config, tensors)
            }
            OpKind::LayerNorm { .. } => {
                self.vector_tiles(model_id, VectorOp::LayerNorm, mapping, config, tensors)
            }
            OpKind::Eltwise { op } => self.vector_tiles(model_id, *op, mapping, config, tensors),
            OpKind::Passthrough => {
                vec![Tile::new(model_id, self.id, 0, false, Vec::new())]
            }
        };
        log::debug!(
            "layer {} ({}): {} tiles",
            self.id,
            self.op_type,
            self.tiles.len()
        );
    }

    /// Tiles for array-mapped kinds: one tile per (m, n, k) block, k
    /// innermost so that accumulation tiles chain directly behind the block
    /// that opens their accumulator.
    fn gemm_tiles(
        &self,
        model_id: u64,
        mapping: &MappingTable,
        config: &SimulationConfig,
        tensors: &HashMap<u32, Tensor>,
    ) -> Vec<Tile> {
        let Some((m, n, k)) = self.gemm_dims(tensors) else {
            return vec![Tile::new(model_id, self.id, 0, false, Vec::new())];
        };
        let map = mapping.gemm(m, n, k);
        let prec = config.precision as u64;
        let req = config.dram_req_size;
        let a = self.input_tensor(tensors, 0);
        let b = self.input_tensor(tensors, 1);
        let out = self.outputs.first().and_then(|id| tensors.get(id));

        let mt = m.div_ceil(map.tile_m.max(1));
        let nt = n.div_ceil(map.tile_n.max(1));
        let kt = k.div_ceil(map.tile_k.max(1));
        let mut tiles = Vec::new();
        let mut index = 0u32;
        for mi in 0..mt {
            let tm = (m - mi * map.tile_m).min(map.tile_m);
            for ni in 0..nt {
                let tn = (n - ni * map.tile_n).min(map.tile_n);
                for ki in 0..kt {
                    let tk = (k - ki * map.tile_k).min(map.tile_k);
                    let mut instructions = Vec::new();
                    let mut movin = Vec::new();
                    if let Some(a) = a {
                        let off = block_offset((mi * kt + ki) * map.tile_m * map.tile_k * prec, a, req);
                        movin.extend(line_addrs(a.address + off, tm * tk * prec, req));
                    }
                    if let Some(b) = b {
                        let off = block_offset((ni * kt + ki) * map.tile_n * map.tile_k * prec, b, req);
                        movin.extend(line_addrs(b.address + off, tn * tk * prec, req));
                    }
                    if !movin.is_empty() {
                        instructions.push(Instruction::Movin { addrs: movin });
                    }
                    instructions.push(Instruction::Gemm {
                        m: tm as u32,
                        n: tn as u32,
                        k: tk as u32,
                    });
                    if ki + 1 == kt {
                        if let Some(out) = out {
                            let off =
                                block_offset((mi * nt + ni) * map.tile_m * map.tile_n * prec, out, req);
                            instructions.push(Instruction::Movout {
                                addrs: line_addrs(out.address + off, tm * tn * prec, req),
                            });
                        }
                    }
                    tiles.push(Tile::new(model_id, self.id, index, ki > 0, instructions));
                    index += 1;
                }
            }
        }
        tiles
    }

    /// Tiles for vector-unit kinds: chunk the output elements, load the
    /// matching chunk of every input, run the vector op, store the result.
    fn vector_tiles(
        &self,
        model_id: u64,
        op: VectorOp,
        mapping: &MappingTable,
        config: &SimulationConfig,
        tensors: &HashMap<u32, Tensor>,
    ) -> Vec<Tile> {
        let prec = config.precision as u64;
        let req = config.dram_req_size;
        let out = self.outputs.first().and_then(|id| tensors.get(id));
        let total = out
            .map(|t| t.num_elems())
            .or_else(|| self.input_tensor(tensors, 0).map(|t| t.num_elems()))
            .unwrap_or(1);
        let tile_elems = mapping.vector_tile();
        let count = total.div_ceil(tile_elems);
        let mut tiles = Vec::new();
        for ti in 0..count {
            let elems = (total - ti * tile_elems).min(tile_elems);
            let mut instructions = Vec::new();
            let mut movin = Vec::new();
            for id in &self.inputs {
                if let Some(input) = tensors.get(id) {
                    let off = block_offset(ti * tile_elems * prec, input, req);
                    let bytes = (elems * prec).min(input.size_bytes());
                    movin.extend(line_addrs(input.address + off, bytes, req));
                }
            }
            if !movin.is_empty() {
                instructions.push(Instruction::Movin { addrs: movin });
            }
            instructions.push(Instruction::Vector { op, elems });
            if let Some(out) = out {
                let off = block_offset(ti * tile_elems * prec, out, req);
                instructions.push(Instruction::Movout {
                    addrs: line_addrs(out.address + off, elems * prec, req),
                });
            }
            tiles.push(Tile::new(model_id, self.id, ti as u32, false, instructions));
        }
        tiles
    }
}

/// Request-size-aligned line addresses covering `bytes` from `base`.
fn line_addrs(base: u64, bytes: u64, req_size: u64) -> Vec<u64> {
    let base = base - base % req_size;
    (0..bytes.div_ceil(req_size).max(1))
        .map(|i| base + i * req_size)
        .collect()
}

/// Keep a nominal block offset inside the tensor's allocation, aligned to
/// the request size.
fn block_offset(nominal: u64, tensor: &Tensor, req_size: u64) -> u64 {
    let size = tensor.size_bytes().max(1);
    let off = nominal % size;
    off - off % req_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::graph::Attribute;

    fn node(op_type: &str) -> NodeSummary {
        NodeSummary {
            name: format!("{}_0", op_type.to_lowercase()),
            op_type: op_type.to_string(),
            inputs: vec![],
            outputs: vec![],
            attributes: HashMap::new(),
        }
    }

    fn tensor_map(tensors: Vec<Tensor>) -> HashMap<u32, Tensor> {
        tensors.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn test_unknown_op_type_yields_none() {
        assert!(OpKind::from_node(&node("EsotericCustomOp")).is_none());
        assert!(OpKind::from_node(&node("MatMul")).is_some());
    }

    #[test]
    fn test_conv_attributes_parsed() {
        let mut n = node("Conv");
        n.attributes.insert("kernel_shape".into(), Attribute::Ints(vec![3, 3]));
        n.attributes.insert("strides".into(), Attribute::Ints(vec![2, 2]));
        n.attributes.insert("pads".into(), Attribute::Ints(vec![1, 1, 1, 1]));
        let kind = OpKind::from_node(&n).unwrap();
        assert_eq!(
            kind,
            OpKind::Conv { kernel: (3, 3), stride: (2, 2), pads: (2, 2) }
        );
    }

    #[test]
    fn test_conv_output_shape() {
        let input = Tensor::new("x", vec![1, 8, 8, 3], 2, true);
        let weight = Tensor::new("w", vec![16, 3, 3, 3], 2, true);
        let op = Operation::new(
            "conv".into(),
            "Conv".into(),
            OpKind::Conv { kernel: (3, 3), stride: (1, 1), pads: (0, 0) },
            vec![input.id, weight.id],
        );
        let tensors = tensor_map(vec![input, weight]);
        assert_eq!(op.output_dims(&tensors), vec![1, 6, 6, 16]);
    }

    #[test]
    fn test_matmul_output_shape_keeps_batch() {
        let a = Tensor::new("a", vec![2, 16, 8], 2, true);
        let b = Tensor::new("b", vec![8, 4], 2, true);
        let op = Operation::new("mm".into(), "MatMul".into(), OpKind::Gemm, vec![a.id, b.id]);
        let tensors = tensor_map(vec![a, b]);
        assert_eq!(op.output_dims(&tensors), vec![2, 16, 4]);
    }

    #[test]
    fn test_gemm_tiling_marks_accumulation() {
        let config = SimulationConfig {
            systolic_rows: 4,
            systolic_cols: 4,
            ..Default::default()
        };
        let mapping = MappingTable::from_config(&config);
        let a = Tensor::new("a", vec![4, 8], 2, true);
        let b = Tensor::new("b", vec![8, 4], 2, true);
        let mut op = Operation::new("mm".into(), "MatMul".into(), OpKind::Gemm, vec![a.id, b.id]);
        let tensors = tensor_map(vec![a, b]);
        // m=4 n=4 k=8, WS tiles: tile_k = 4 -> two k blocks.
        op.initialize_tiles(7, &mapping, &config, &tensors);
        assert_eq!(op.tiles.len(), 2);
        assert!(!op.tiles[0].accum);
        assert!(op.tiles[1].accum);
        assert!(op.tiles.iter().all(|t| t.model_id == 7 && t.layer_id == op.id));
    }

    #[test]
    fn test_vector_tiling_covers_all_elements() {
        let config = SimulationConfig::default();
        let mapping = MappingTable::from_config(&config);
        // 10000 elements with a 4096-element vector tile -> 3 tiles.
        let x = Tensor::new("x", vec![100, 100], 2, true);
        let mut op = Operation::new(
            "relu".into(),
            "Relu".into(),
            OpKind::Activation { op: VectorOp::Relu },
            vec![x.id],
        );
        let tensors = tensor_map(vec![x]);
        op.initialize_tiles(0, &mapping, &config, &tensors);
        assert_eq!(op.tiles.len(), 3);
        let total: u64 = op
            .tiles
            .iter()
            .flat_map(|t| t.instructions.iter())
            .filter_map(|i| match i {
                Instruction::Vector { elems, .. } => Some(*elems),
                _ => None,
            })
            .sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn test_passthrough_yields_one_bookkeeping_tile() {
        let config = SimulationConfig::default();
        let mapping = MappingTable::from_config(&config);
        let x = Tensor::new("x", vec![4, 4], 2, true);
        let mut op = Operation::new(
            "flat".into(),
            "Flatten".into(),
            OpKind::Passthrough,
            vec![x.id],
        );
        let tensors = tensor_map(vec![x]);
        op.initialize_tiles(0, &mapping, &config, &tensors);
        assert_eq!(op.tiles.len(), 1);
        assert!(op.tiles[0].instructions.is_empty());
    }

    #[test]
    fn test_finish_is_monotonic() {
        let mut op = Operation::new("mm".into(), "MatMul".into(), OpKind::Gemm, vec![]);
        op.set_finish();
        assert!(op.finished);
    }

    #[test]
    #[should_panic(expected = "finished twice")]
    fn test_double_finish_panics() {
        let mut op = Operation::new("mm".into(), "MatMul".into(), OpKind::Gemm, vec![]);
        op.set_finish();
        op.set_finish();
    }

    #[test]
    fn test_line_addrs_are_aligned() {
        let addrs = line_addrs(100, 100, 32);
        assert_eq!(addrs, vec![96, 128, 160, 192]);
    }
}
