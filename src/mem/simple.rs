//! Fixed-latency DRAM model.
//!
//! Each channel holds a bounded waiting queue and a response queue. An
//! accepted request becomes a response `dram_latency` cycles later, and
//! service is serialized per channel: no two responses of the same channel
//! complete in the same cycle.

use std::collections::VecDeque;

use super::{stripe_channel, Dram, MemoryAccess};
use crate::config::SimulationConfig;

/// Simple DRAM: per-channel fixed latency with serialized service.
pub struct SimpleDram {
    latency: u64,
    req_size: u64,
    channels: usize,
    queue_size: usize,
    cycles: u64,
    /// Per-channel completion cycle of the most recently scheduled request.
    last_finish: Vec<u64>,
    /// Per-channel requests waiting for their completion cycle.
    waiting: Vec<VecDeque<(u64, MemoryAccess)>>,
    /// Per-channel completed responses awaiting collection.
    responses: Vec<VecDeque<MemoryAccess>>,
    processed: Vec<u64>,
}

impl SimpleDram {
    pub fn new(config: &SimulationConfig) -> Self {
        let channels = config.dram_channels;
        Self {
            latency: config.dram_latency,
            req_size: config.dram_req_size,
            channels,
            queue_size: config.dram_queue_size,
            cycles: 0,
            last_finish: vec![0; channels],
            waiting: (0..channels).map(|_| VecDeque::new()).collect(),
            responses: (0..channels).map(|_| VecDeque::new()).collect(),
            processed: vec![0; channels],
        }
    }
}

impl Dram for SimpleDram {
    fn is_full(&self, ch: usize, _access: &MemoryAccess) -> bool {
        self.waiting[ch].len() >= self.queue_size
    }

    fn push(&mut self, ch: usize, mut access: MemoryAccess) {
        assert!(
            access.dram_address % self.req_size == 0 && access.size as u64 == self.req_size,
            "misaligned or mis-sized DRAM access: addr={:#x} size={}",
            access.dram_address,
            access.size
        );
        assert!(!self.is_full(ch, &access), "push into full DRAM channel {}", ch);
        access.make_response();
        // Serialize per channel: a request never completes in the same cycle
        // as the one scheduled before it.
        let ready = (self.cycles + self.latency).max(self.last_finish[ch] + 1);
        self.last_finish[ch] = ready;
        self.waiting[ch].push_back((ready, access));
    }

    fn is_empty(&self, ch: usize) -> bool {
        self.responses[ch].is_empty()
    }

    fn top(&self, ch: usize) -> Option<&MemoryAccess> {
        self.responses[ch].front()
    }

    fn pop(&mut self, ch: usize) -> Option<MemoryAccess> {
        self.responses[ch].pop_front()
    }

    fn cycle(&mut self) {
        for ch in 0..self.channels {
            if let Some((ready, _)) = self.waiting[ch].front() {
                if *ready <= self.cycles {
                    let (_, access) = self.waiting[ch].pop_front().unwrap();
                    self.processed[ch] += 1;
                    self.responses[ch].push_back(access);
                }
            }
        }
        self.cycles += 1;
    }

    fn channel(&self, access: &MemoryAccess) -> usize {
        stripe_channel(access.dram_address, self.req_size, self.channels)
    }

    fn running(&self) -> bool {
        self.waiting.iter().any(|q| !q.is_empty())
            || self.responses.iter().any(|q| !q.is_empty())
    }

    fn print_stats(&self) {
        println!("DRAM (simple, {} cycles)", self.cycles);
        let mut total = 0u64;
        for ch in 0..self.channels {
            let util = if self.cycles > 0 {
                self.processed[ch] as f64 / self.cycles as f64 * 100.0
            } else {
                0.0
            };
            println!(
                "  ch[{}]: {} accesses, service util {:.2}%",
                ch, self.processed[ch], util
            );
            total += self.processed[ch];
        }
        println!("  total: {} accesses", total);
    }
}
