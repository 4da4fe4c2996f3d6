//! Multi-domain clock.
//!
//! The simulator advances three asynchronous clock domains: compute cores,
//! interconnect, and DRAM, each with its own frequency. Time is kept in
//! picoseconds per domain; on each step the domains whose accumulated time
//! is least are ticked together and advanced by their own period. This keeps
//! per-domain cycle counts consistent with the configured frequency ratios
//! and bounds event lag to one period of the slowest domain.

/// Picoseconds in one cycle at the given frequency.
///
/// 1 MHz corresponds to a 1 us period, i.e. 1_000_000 ps.
fn period_ps(freq_mhz: u64) -> u64 {
    debug_assert!(freq_mhz > 0);
    1_000_000 / freq_mhz
}

/// Which domains tick on the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickMask {
    pub core: bool,
    pub icnt: bool,
    pub dram: bool,
}

impl TickMask {
    /// At least one domain must tick every step.
    pub fn any(&self) -> bool {
        self.core || self.icnt || self.dram
    }
}

/// Clock state for the three domains.
#[derive(Debug, Clone)]
pub struct DomainClock {
    core_period: u64,
    icnt_period: u64,
    dram_period: u64,
    core_time: u64,
    icnt_time: u64,
    dram_time: u64,
    core_cycles: u64,
    icnt_cycles: u64,
    dram_cycles: u64,
}

impl DomainClock {
    /// Create a clock from the three domain frequencies in MHz.
    pub fn new(core_freq_mhz: u64, icnt_freq_mhz: u64, dram_freq_mhz: u64) -> Self {
        Self {
            core_period: period_ps(core_freq_mhz),
            icnt_period: period_ps(icnt_freq_mhz),
            dram_period: period_ps(dram_freq_mhz),
            core_time: 0,
            icnt_time: 0,
            dram_time: 0,
            core_cycles: 0,
            icnt_cycles: 0,
            dram_cycles: 0,
        }
    }

    /// Advance one simulator step.
    ///
    /// Every domain whose accumulated time equals the least accumulated time
    /// ticks this step and then advances by its own period.
    pub fn advance(&mut self) -> TickMask {
        let minimum = self.core_time.min(self.icnt_time).min(self.dram_time);
        let mut mask = TickMask {
            core: false,
            icnt: false,
            dram: false,
        };
        if self.core_time <= minimum {
            mask.core = true;
            self.core_time += self.core_period;
            self.core_cycles += 1;
        }
        if self.icnt_time <= minimum {
            mask.icnt = true;
            self.icnt_time += self.icnt_period;
            self.icnt_cycles += 1;
        }
        if self.dram_time <= minimum {
            mask.dram = true;
            self.dram_time += self.dram_period;
            self.dram_cycles += 1;
        }
        debug_assert!(mask.any());
        mask
    }

    /// Accumulated core-domain time in picoseconds.
    ///
    /// This is the time of the *next* core tick; after `advance` returns a
    /// mask with `core` set, the cycle that just ran started at
    /// `core_time() - core period`.
    #[inline]
    pub fn core_time(&self) -> u64 {
        self.core_time
    }

    /// Core-domain time at which the most recent core cycle started.
    #[inline]
    pub fn current_core_time(&self) -> u64 {
        self.core_time.saturating_sub(self.core_period)
    }

    #[inline]
    pub fn core_cycles(&self) -> u64 {
        self.core_cycles
    }

    #[inline]
    pub fn icnt_cycles(&self) -> u64 {
        self.icnt_cycles
    }

    #[inline]
    pub fn dram_cycles(&self) -> u64 {
        self.dram_cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_ticks_all_domains() {
        let mut clock = DomainClock::new(1000, 2000, 1200);
        let mask = clock.advance();
        assert!(mask.core && mask.icnt && mask.dram);
    }

    #[test]
    fn test_equal_frequencies_stay_in_lockstep() {
        let mut clock = DomainClock::new(1000, 1000, 1000);
        for _ in 0..100 {
            let mask = clock.advance();
            assert!(mask.core && mask.icnt && mask.dram);
        }
        assert_eq!(clock.core_cycles(), 100);
        assert_eq!(clock.icnt_cycles(), 100);
        assert_eq!(clock.dram_cycles(), 100);
    }

    #[test]
    fn test_cycle_counts_follow_frequency_ratio() {
        // 2 GHz interconnect should tick twice as often as a 1 GHz core.
        let mut clock = DomainClock::new(1000, 2000, 1000);
        for _ in 0..3000 {
            clock.advance();
        }
        let ratio = clock.icnt_cycles() as f64 / clock.core_cycles() as f64;
        assert!((ratio - 2.0).abs() < 0.01, "ratio was {}", ratio);
    }

    #[test]
    fn test_time_equals_cycles_times_period() {
        let mut clock = DomainClock::new(800, 1333, 1600);
        for _ in 0..997 {
            clock.advance();
        }
        assert_eq!(clock.core_time, clock.core_cycles * (1_000_000 / 800));
        assert_eq!(clock.icnt_time, clock.icnt_cycles * (1_000_000 / 1333));
        assert_eq!(clock.dram_time, clock.dram_cycles * (1_000_000 / 1600));
    }

    #[test]
    fn test_at_least_one_domain_ticks() {
        let mut clock = DomainClock::new(7, 13, 29);
        for _ in 0..10_000 {
            assert!(clock.advance().any());
        }
    }
}
