//! Memory access records.
//!
//! A [`MemoryAccess`] is the unit of traffic between cores, the
//! interconnect, and DRAM. It is created by a core as a request, consumed by
//! the memory subsystem (which flips its direction flag to response exactly
//! once), and delivered back to the originating core, which matches it to an
//! outstanding request by id. Ownership follows the access through the
//! queues: a push transfers the record to the receiving component.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ACCESS_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a process-unique access id.
fn next_access_id() -> u64 {
    NEXT_ACCESS_ID.fetch_add(1, Ordering::Relaxed)
}

/// One memory request or response.
///
/// `id`, `dram_address`, `size`, `write`, and `core_id` are immutable after
/// creation; only the `request` direction flag changes, exactly once, when
/// the memory subsystem turns the request into its response.
#[derive(Debug, Clone)]
pub struct MemoryAccess {
    /// Process-unique id used by the originating core to match responses.
    pub id: u64,

    /// Byte address in DRAM space.
    pub dram_address: u64,

    /// Access size in bytes.
    pub size: u32,

    /// Write access (true) or read access (false).
    pub write: bool,

    /// Direction: request on the way to DRAM, response on the way back.
    pub request: bool,

    /// Index of the originating core. Carried as data so responses can be
    /// routed home without any back-reference.
    pub core_id: usize,

    /// Layer that generated this access, for per-layer statistics.
    pub layer_id: u32,
}

impl MemoryAccess {
    /// Create a read request.
    pub fn read(dram_address: u64, size: u32, core_id: usize, layer_id: u32) -> Self {
        Self {
            id: next_access_id(),
            dram_address,
            size,
            write: false,
            request: true,
            core_id,
            layer_id,
        }
    }

    /// Create a write request.
    pub fn write(dram_address: u64, size: u32, core_id: usize, layer_id: u32) -> Self {
        Self {
            id: next_access_id(),
            dram_address,
            size,
            write: true,
            request: true,
            core_id,
            layer_id,
        }
    }

    /// Flip the direction flag from request to response.
    ///
    /// Flipping twice is a programming error.
    pub fn make_response(&mut self) {
        assert!(self.request, "access {} already turned into a response", self.id);
        self.request = false;
    }
}
