//! Simulation driver: the multi-domain clock and the top-level cycle loop.

pub mod clock;
pub mod simulator;

pub use clock::{DomainClock, TickMask};
pub use simulator::{ModelRequest, Simulator};
