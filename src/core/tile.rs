//! Computation tiles and their micro-instructions.
//!
//! A tile is the smallest unit of work a core accepts: one fragment of an
//! operator's computation after tiling. It carries an ordered list of
//! micro-instructions that the core walks one at a time; the list is opaque
//! to the scheduler.

use std::collections::VecDeque;

/// Lifecycle state of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    /// Created by layer expansion, waiting in the scheduler.
    Initialized,
    /// Issued to a core.
    Running,
    /// All instructions retired.
    Finish,
}

/// Element-wise operations executed on the vector unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    Add,
    Mul,
    Relu,
    Gelu,
    Softmax,
    LayerNorm,
    Pool,
}

/// One micro-instruction of a tile.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Load the listed DRAM lines into the scratchpad.
    Movin { addrs: Vec<u64> },

    /// Store the listed DRAM lines from the scratchpad.
    Movout { addrs: Vec<u64> },

    /// Run the systolic array over an `m x k` by `k x n` product.
    Gemm { m: u32, n: u32, k: u32 },

    /// Run the vector unit over `elems` elements.
    Vector { op: VectorOp, elems: u64 },
}

/// One schedulable fragment of a layer's computation.
#[derive(Debug, Clone)]
pub struct Tile {
    /// Model this tile belongs to.
    pub model_id: u64,

    /// Layer (operation) this tile belongs to. Layer ids are process-unique.
    pub layer_id: u32,

    /// Index of this tile within its layer.
    pub index: u32,

    /// Whether this tile folds into the accumulator left by the preceding
    /// tile of the same layer on the same core.
    pub accum: bool,

    pub status: TileStatus,

    /// Remaining micro-instructions, front first.
    pub instructions: VecDeque<Instruction>,
}

impl Tile {
    pub fn new(
        model_id: u64,
        layer_id: u32,
        index: u32,
        accum: bool,
        instructions: Vec<Instruction>,
    ) -> Self {
        Self {
            model_id,
            layer_id,
            index,
            accum,
            status: TileStatus::Initialized,
            instructions: instructions.into(),
        }
    }
}
