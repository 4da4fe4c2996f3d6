//! Interconnect models.
//!
//! The interconnect carries memory accesses between compute cores and DRAM
//! channels. Endpoints are numbered `0..N-1` for the cores and `N..N+M-1`
//! for the memory channels; the destination of a request is the endpoint of
//! its striped channel, the destination of a response is the originating
//! core's endpoint.
//!
//! Two models are provided:
//!
//! - [`SimpleInterconnect`]: one bounded FIFO per destination endpoint with
//!   a fixed traversal latency
//! - [`RoutedInterconnect`]: ring topology with per-hop latency and
//!   round-robin arbitration over per-source queues

pub mod routed;
pub mod simple;

pub use routed::RoutedInterconnect;
pub use simple::SimpleInterconnect;

use crate::config::{IcntKind, SimulationConfig};
use crate::mem::MemoryAccess;

/// Contract every interconnect model implements.
///
/// `push` transfers ownership of the packet; after an implementation-defined
/// latency it becomes visible at `dst` through `is_empty`/`top`/`pop`.
/// Backpressure is expressed through `is_full`; a refused push is retried by
/// the caller on a later cycle. Delivery order per (src, dst) pair is FIFO.
pub trait Interconnect {
    /// Whether a packet from `src` cannot be accepted right now.
    fn is_full(&self, src: usize, access: &MemoryAccess) -> bool;

    /// Inject a packet from endpoint `src` toward endpoint `dst`.
    fn push(&mut self, src: usize, dst: usize, access: MemoryAccess);

    /// Whether no packet is currently deliverable at `dst`.
    fn is_empty(&self, dst: usize) -> bool;

    /// Peek the next deliverable packet at `dst`.
    fn top(&self, dst: usize) -> Option<&MemoryAccess>;

    /// Take the next deliverable packet at `dst`.
    fn pop(&mut self, dst: usize) -> Option<MemoryAccess>;

    /// Advance one interconnect cycle.
    fn cycle(&mut self);

    /// Whether any packet is still in flight.
    fn running(&self) -> bool;

    /// Print finalized statistics. Called exactly once after the main loop.
    fn print_stats(&self);
}

/// Build the interconnect model selected by the configuration.
pub fn build_interconnect(config: &SimulationConfig) -> Box<dyn Interconnect> {
    match config.icnt_kind {
        IcntKind::Simple => Box::new(SimpleInterconnect::new(config)),
        IcntKind::Routed => Box::new(RoutedInterconnect::new(config)),
    }
}

/// Destination endpoint for a packet: the striped channel's endpoint for a
/// request, the originating core's endpoint for a response.
pub(crate) fn dest_endpoint(
    access: &MemoryAccess,
    num_cores: usize,
    req_size: u64,
    channels: usize,
) -> usize {
    if access.request {
        num_cores + crate::mem::stripe_channel(access.dram_address, req_size, channels)
    } else {
        access.core_id
    }
}
