//! Systolic compute core.
//!
//! One core model covers both dataflows; they differ in the cycle cost of a
//! GEMM pass and in which tile dimensions the tiler clamps to the array:
//!
//! | Dataflow | Stationary | GEMM pass |
//! |----------|------------|-----------|
//! | WS | weights (k x n in-array) | k preload + m stream + n-1 skew |
//! | OS | outputs (m x n in-array) | k stream + m+n-2 skew + m drain |
//!
//! The core walks its tile's micro-instructions strictly in order: a
//! `Movin`/`Movout` emits one DRAM access per cycle and completes when every
//! response has returned; a `Gemm`/`Vector` occupies the datapath for its
//! computed cycle count. A tile retires once its instruction list is empty
//! and no access is outstanding.

use std::collections::{HashMap, VecDeque};

use super::{Core, CoreStats, Instruction, Tile, TileStatus, VectorOp};
use crate::config::{CoreKind, SimulationConfig};
use crate::mem::MemoryAccess;

/// Vector-unit latency per pass, in cycles.
const fn vector_pass_cycles(op: VectorOp) -> u64 {
    match op {
        VectorOp::Add | VectorOp::Mul | VectorOp::Relu => 1,
        VectorOp::Pool => 2,
        VectorOp::Gelu => 4,
        VectorOp::LayerNorm => 6,
        VectorOp::Softmax => 8,
    }
}

/// A core built around one systolic array and one vector unit.
pub struct SystolicCore {
    id: usize,
    kind: CoreKind,
    rows: u64,
    cols: u64,
    lanes: u64,
    req_size: u64,
    cycles: u64,

    /// The single in-flight tile.
    tile: Option<Tile>,

    /// Addresses of the current data-movement instruction not yet emitted.
    pending_addrs: VecDeque<(u64, bool)>,

    /// Outstanding accesses by id: (write, size).
    outstanding: HashMap<u64, (bool, u32)>,

    /// Cycles left on the datapath for the current compute instruction.
    compute_remaining: u64,

    /// Outbound requests awaiting the interconnect.
    request_queue: VecDeque<MemoryAccess>,

    /// Retired tiles awaiting collection by the driver.
    finished: VecDeque<Tile>,

    /// Layer of the most recent issue; an accumulation tile may only chain
    /// from this.
    accum_layer: Option<u32>,

    stats: CoreStats,
}

impl SystolicCore {
    pub fn new(id: usize, config: &SimulationConfig) -> Self {
        Self {
            id,
            kind: config.core_kind,
            rows: config.systolic_rows as u64,
            cols: config.systolic_cols as u64,
            lanes: config.vector_lanes as u64,
            req_size: config.dram_req_size,
            cycles: 0,
            tile: None,
            pending_addrs: VecDeque::new(),
            outstanding: HashMap::new(),
            compute_remaining: 0,
            request_queue: VecDeque::new(),
            finished: VecDeque::new(),
            accum_layer: None,
            stats: CoreStats::default(),
        }
    }

    /// Cycles the systolic array is occupied by one `m x n x k` GEMM pass.
    fn gemm_cycles(&self, m: u32, n: u32, k: u32) -> u64 {
        let m = (m as u64).max(1);
        let n = (n as u64).max(1).min(self.cols);
        let k = (k as u64).max(1);
        match self.kind {
            // Preload k weight rows, stream m input rows, drain the skew.
            CoreKind::SystolicWs => k.min(self.rows) + m + n - 1,
            // Stream k partials through the array, then shift out m rows of
            // stationary outputs.
            CoreKind::SystolicOs => {
                let m = m.min(self.rows);
                k + m + n - 2 + m
            }
        }
    }

    /// Cycles the vector unit is occupied by `elems` elements of `op`.
    fn vector_cycles(&self, op: VectorOp, elems: u64) -> u64 {
        let passes = elems.div_ceil(self.lanes).max(1);
        passes * vector_pass_cycles(op)
    }

    /// Emit one pending address as a memory request.
    fn emit_request(&mut self) {
        let (addr, write) = self.pending_addrs.pop_front().unwrap();
        let layer_id = self.tile.as_ref().map(|t| t.layer_id).unwrap_or(0);
        let access = if write {
            MemoryAccess::write(addr, self.req_size as u32, self.id, layer_id)
        } else {
            MemoryAccess::read(addr, self.req_size as u32, self.id, layer_id)
        };
        self.outstanding.insert(access.id, (write, access.size));
        self.stats.requests_sent += 1;
        self.request_queue.push_back(access);
    }

    /// Fetch the tile's next instruction, or retire the tile.
    fn fetch_instruction(&mut self) {
        let Some(tile) = self.tile.as_mut() else {
            self.stats.idle_cycles += 1;
            return;
        };
        match tile.instructions.pop_front() {
            Some(Instruction::Movin { addrs }) => {
                self.pending_addrs.extend(addrs.into_iter().map(|a| (a, false)));
                self.stats.memory_stall_cycles += 1;
            }
            Some(Instruction::Movout { addrs }) => {
                self.pending_addrs.extend(addrs.into_iter().map(|a| (a, true)));
                self.stats.memory_stall_cycles += 1;
            }
            Some(Instruction::Gemm { m, n, k }) => {
                self.compute_remaining = self.gemm_cycles(m, n, k) - 1;
                self.stats.compute_cycles += 1;
            }
            Some(Instruction::Vector { op, elems }) => {
                self.compute_remaining = self.vector_cycles(op, elems) - 1;
                self.stats.compute_cycles += 1;
            }
            None => {
                let mut tile = self.tile.take().unwrap();
                tile.status = TileStatus::Finish;
                log::trace!(
                    "core {}: tile {}/{} finished at cycle {}",
                    self.id,
                    tile.layer_id,
                    tile.index,
                    self.cycles
                );
                self.stats.tiles_finished += 1;
                self.finished.push_back(tile);
            }
        }
    }
}

impl Core for SystolicCore {
    fn can_issue(&self, is_accum: bool) -> bool {
        if self.tile.is_some() {
            return false;
        }
        if is_accum {
            self.accum_layer.is_some()
        } else {
            true
        }
    }

    fn issue(&mut self, tile: Tile) {
        assert!(
            self.can_issue(tile.accum),
            "core {}: issue while can_issue is false",
            self.id
        );
        assert_eq!(tile.status, TileStatus::Initialized);
        if tile.accum {
            assert_eq!(
                self.accum_layer,
                Some(tile.layer_id),
                "core {}: accumulation tile of layer {} cannot chain",
                self.id,
                tile.layer_id
            );
        }
        log::trace!(
            "core {}: issue tile {}/{} (accum: {})",
            self.id,
            tile.layer_id,
            tile.index,
            tile.accum
        );
        self.accum_layer = Some(tile.layer_id);
        let mut tile = tile;
        tile.status = TileStatus::Running;
        self.tile = Some(tile);
    }

    fn cycle(&mut self) {
        self.cycles += 1;
        self.stats.total_cycles += 1;
        if self.compute_remaining > 0 {
            self.compute_remaining -= 1;
            self.stats.compute_cycles += 1;
            return;
        }
        if !self.pending_addrs.is_empty() {
            self.emit_request();
            self.stats.memory_stall_cycles += 1;
            return;
        }
        if !self.outstanding.is_empty() {
            self.stats.memory_stall_cycles += 1;
            return;
        }
        self.fetch_instruction();
    }

    fn pop_finished_tile(&mut self) -> Option<Tile> {
        self.finished.pop_front()
    }

    fn has_memory_request(&self) -> bool {
        !self.request_queue.is_empty()
    }

    fn top_memory_request(&self) -> Option<&MemoryAccess> {
        self.request_queue.front()
    }

    fn pop_memory_request(&mut self) -> Option<MemoryAccess> {
        self.request_queue.pop_front()
    }

    fn push_memory_response(&mut self, access: MemoryAccess) {
        assert!(!access.request, "core {}: request delivered as response", self.id);
        let Some((write, size)) = self.outstanding.remove(&access.id) else {
            panic!(
                "core {}: unmatched memory response id={} addr={:#x}",
                self.id, access.id, access.dram_address
            );
        };
        self.stats.responses_received += 1;
        if write {
            self.stats.bytes_stored += size as u64;
        } else {
            self.stats.bytes_loaded += size as u64;
        }
    }

    fn running(&self) -> bool {
        self.tile.is_some()
            || !self.request_queue.is_empty()
            || !self.outstanding.is_empty()
            || !self.finished.is_empty()
    }

    fn current_tile(&self) -> Option<&Tile> {
        self.tile.as_ref()
    }

    fn stats(&self) -> &CoreStats {
        &self.stats
    }

    fn print_stats(&self) {
        let s = &self.stats;
        println!(
            "Core[{}]: {} cycles ({} compute, {} memory, {} idle), {} tiles, {} B loaded, {} B stored",
            self.id,
            s.total_cycles,
            s.compute_cycles,
            s.memory_stall_cycles,
            s.idle_cycles,
            s.tiles_finished,
            s.bytes_loaded,
            s.bytes_stored
        );
    }
}
