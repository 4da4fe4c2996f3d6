//! Compute cores.
//!
//! A core executes at most one tile at a time. It walks the tile's
//! micro-instructions, emitting DRAM requests for data movement and
//! occupying the systolic array or vector unit for compute, and reports the
//! tile back to the driver once everything has retired. Memory responses
//! are matched to outstanding requests by access id; an unmatched response
//! is a programming error and aborts the simulation.

pub mod systolic;
pub mod tile;

pub use systolic::SystolicCore;
pub use tile::{Instruction, Tile, TileStatus, VectorOp};

use crate::config::SimulationConfig;
use crate::mem::MemoryAccess;

/// Cycle-class and traffic counters for one core.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreStats {
    pub total_cycles: u64,
    pub compute_cycles: u64,
    pub memory_stall_cycles: u64,
    pub idle_cycles: u64,
    pub tiles_finished: u64,
    pub requests_sent: u64,
    pub responses_received: u64,
    pub bytes_loaded: u64,
    pub bytes_stored: u64,
}

/// Contract every core model implements.
pub trait Core {
    /// Whether a new tile may be accepted. An accumulation tile is accepted
    /// only when it can chain from the accumulator left by this core's
    /// previous issue.
    fn can_issue(&self, is_accum: bool) -> bool;

    /// Accept a tile. Precondition: `can_issue(tile.accum)` and the tile is
    /// `Initialized`.
    fn issue(&mut self, tile: Tile);

    /// Advance one core cycle.
    fn cycle(&mut self);

    /// Take the most recently finished tile, if any.
    fn pop_finished_tile(&mut self) -> Option<Tile>;

    /// Whether an outbound memory request is waiting.
    fn has_memory_request(&self) -> bool;

    /// Peek the oldest outbound memory request.
    fn top_memory_request(&self) -> Option<&MemoryAccess>;

    /// Take the oldest outbound memory request.
    fn pop_memory_request(&mut self) -> Option<MemoryAccess>;

    /// Deliver a memory response. Panics on an unmatched response.
    fn push_memory_response(&mut self, access: MemoryAccess);

    /// Whether any work is in flight on this core.
    fn running(&self) -> bool;

    /// The tile currently occupying the core, if any.
    fn current_tile(&self) -> Option<&Tile>;

    fn stats(&self) -> &CoreStats;

    /// Print finalized statistics. Called exactly once after the main loop.
    fn print_stats(&self);
}

/// Build the configured number of cores of the configured kind.
pub fn build_cores(config: &SimulationConfig) -> Vec<Box<dyn Core>> {
    (0..config.num_cores)
        .map(|id| Box::new(SystolicCore::new(id, config)) as Box<dyn Core>)
        .collect()
}
