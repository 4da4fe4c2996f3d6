//! DRAM models.
//!
//! The memory subsystem accepts read and write requests per channel and
//! returns each of them as a response after a modeled delay. Two models are
//! provided:
//!
//! - [`SimpleDram`]: fixed service latency, per-channel serialized service
//! - [`BankedDram`]: per-bank row-buffer state machines with
//!   precharge/activate/CAS timing
//!
//! Both decode the channel from the access address by striping:
//! `(address / request_size) % channel_count`.

pub mod access;
pub mod banked;
pub mod simple;

pub use access::MemoryAccess;
pub use banked::BankedDram;
pub use simple::SimpleDram;

use crate::config::{DramKind, SimulationConfig};

/// Contract every DRAM model implements.
///
/// A push transfers ownership of the access into the channel; the same
/// access reappears (direction flipped to response) in the channel's
/// response queue after the modeled delay. A push against a full channel is
/// refused through `is_full` and the caller retries on a later cycle; that
/// retry loop is the only backpressure mechanism.
pub trait Dram {
    /// Whether the channel cannot accept this request right now.
    fn is_full(&self, ch: usize, access: &MemoryAccess) -> bool;

    /// Accept a request into the channel. Precondition: `!is_full(ch, ..)`.
    fn push(&mut self, ch: usize, access: MemoryAccess);

    /// Whether the channel has no response ready to collect.
    fn is_empty(&self, ch: usize) -> bool;

    /// Peek the channel's next ready response.
    fn top(&self, ch: usize) -> Option<&MemoryAccess>;

    /// Collect the channel's next ready response.
    fn pop(&mut self, ch: usize) -> Option<MemoryAccess>;

    /// Advance one DRAM cycle.
    fn cycle(&mut self);

    /// Which channel serves the given access.
    fn channel(&self, access: &MemoryAccess) -> usize;

    /// Whether any work is queued or in flight.
    fn running(&self) -> bool;

    /// Print finalized statistics. Called exactly once after the main loop.
    fn print_stats(&self);
}

/// Address-striped channel decode shared by both models.
#[inline]
pub(crate) fn stripe_channel(address: u64, req_size: u64, channels: usize) -> usize {
    ((address / req_size) % channels as u64) as usize
}

/// Build the DRAM model selected by the configuration.
pub fn build_dram(config: &SimulationConfig) -> Box<dyn Dram> {
    match config.dram_kind {
        DramKind::Simple => Box::new(SimpleDram::new(config)),
        DramKind::Banked => Box::new(BankedDram::new(config)),
    }
}
