//! Configuration management for npu-sim.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (`NPUSIM_MAPPING_PATH`)
//! 2. An explicit TOML config file passed on the command line
//! 3. Built-in defaults
//!
//! All file locations consumed by the simulator (the mapping table in
//! particular) travel through this struct as explicit paths; nothing is
//! resolved from the user's home directory at construction time.
//!
//! # Config File Format
//!
//! ```toml
//! # npu-sim.toml
//! num_cores = 4
//! dram_channels = 4
//! core_freq_mhz = 1000
//! core_kind = "systolic_ws"
//! dram_kind = "simple"
//! icnt_kind = "simple"
//! scheduler_kind = "simple"
//!
//! [partitions]
//! 0 = [0, 1]
//! 1 = [2, 3]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating the simulator configuration.
///
/// All of these are fatal at startup: the binary reports the diagnostic and
/// exits nonzero. There is no recovery path once simulation has begun.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Systolic-array dataflow selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreKind {
    /// Output-stationary dataflow.
    SystolicOs,
    /// Weight-stationary dataflow.
    SystolicWs,
}

/// DRAM timing model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DramKind {
    /// Fixed-latency model with per-channel serialized service.
    Simple,
    /// Detailed model with per-bank row-buffer timing.
    Banked,
}

/// Interconnect model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IcntKind {
    /// Fixed-latency crossbar with per-endpoint queues.
    Simple,
    /// Ring with per-hop latency and round-robin arbitration.
    Routed,
}

/// Tile scheduling policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Global FIFO of executable layers; any core pulls any tile.
    Simple,
    /// Tiles of a model run only on the cores of its partition.
    PartitionCpu,
    /// One model occupies all cores at a time; rotation at layer boundaries.
    TimeMultiplex,
    /// Cores split in two halves, one model per half, two-model cap.
    SpatialSplit,
}

/// Complete simulator configuration.
///
/// Every field has a default so a bare `SimulationConfig::default()` is a
/// valid 4-core / 4-channel weight-stationary machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of compute cores.
    pub num_cores: usize,

    /// Number of independent DRAM channels.
    pub dram_channels: usize,

    /// Core clock domain frequency in MHz.
    pub core_freq_mhz: u64,

    /// Interconnect clock domain frequency in MHz.
    pub icnt_freq_mhz: u64,

    /// DRAM clock domain frequency in MHz.
    pub dram_freq_mhz: u64,

    /// Which systolic dataflow the cores implement.
    pub core_kind: CoreKind,

    /// Which DRAM timing model backs the channels.
    pub dram_kind: DramKind,

    /// Which interconnect model routes accesses.
    pub icnt_kind: IcntKind,

    /// Which scheduling policy assigns tiles to cores.
    pub scheduler_kind: SchedulerKind,

    /// Service latency of the simple DRAM model, in DRAM cycles.
    pub dram_latency: u64,

    /// Size of one DRAM access in bytes. Every access at the DRAM boundary
    /// must be exactly this size and aligned to it.
    pub dram_req_size: u64,

    /// Capacity of each DRAM channel's waiting queue. Pushes beyond this
    /// are refused via `is_full` and retried by the caller.
    pub dram_queue_size: usize,

    /// Banks per channel (banked DRAM model only).
    pub banks_per_channel: usize,

    /// Column-access latency in DRAM cycles (banked model).
    pub dram_cas: u64,

    /// Row-activate latency in DRAM cycles (banked model).
    pub dram_rcd: u64,

    /// Precharge latency in DRAM cycles (banked model).
    pub dram_rp: u64,

    /// Base traversal latency of the interconnect, in interconnect cycles.
    pub icnt_latency: u64,

    /// Additional latency per ring hop (routed interconnect only).
    pub icnt_link_latency: u64,

    /// Capacity of each interconnect endpoint queue.
    pub icnt_queue_size: usize,

    /// Bytes per tensor element.
    pub precision: u32,

    /// Rows of the systolic array.
    pub systolic_rows: usize,

    /// Columns of the systolic array.
    pub systolic_cols: usize,

    /// Lanes of the vector unit attached to each core.
    pub vector_lanes: usize,

    /// Scratchpad capacity in KiB, used by the heuristic tiler.
    pub spad_kb: usize,

    /// Partition id to core set, for the `partition_cpu` scheduler. Keys
    /// are decimal partition ids (TOML table keys are strings).
    pub partitions: HashMap<String, Vec<usize>>,

    /// Optional path to a tile-mapping table file.
    pub mapping_path: Option<String>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_cores: 4,
            dram_channels: 4,
            core_freq_mhz: 1000,
            icnt_freq_mhz: 2000,
            dram_freq_mhz: 1200,
            core_kind: CoreKind::SystolicWs,
            dram_kind: DramKind::Simple,
            icnt_kind: IcntKind::Simple,
            scheduler_kind: SchedulerKind::Simple,
            dram_latency: 10,
            dram_req_size: 32,
            dram_queue_size: 32,
            banks_per_channel: 8,
            dram_cas: 4,
            dram_rcd: 6,
            dram_rp: 6,
            icnt_latency: 2,
            icnt_link_latency: 1,
            icnt_queue_size: 16,
            precision: 2,
            systolic_rows: 32,
            systolic_cols: 32,
            vector_lanes: 32,
            spad_kb: 512,
            partitions: HashMap::new(),
            mapping_path: None,
        }
    }
}

impl SimulationConfig {
    /// Load configuration: defaults, then the given file (if any), then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::load_from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("NPUSIM_MAPPING_PATH") {
            log::info!("Using NPUSIM_MAPPING_PATH from environment: {}", path);
            self.mapping_path = Some(path);
        }
    }

    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cores == 0 {
            return Err(ConfigError::Invalid("num_cores must be > 0".into()));
        }
        if self.dram_channels == 0 {
            return Err(ConfigError::Invalid("dram_channels must be > 0".into()));
        }
        for (name, freq) in [
            ("core_freq_mhz", self.core_freq_mhz),
            ("icnt_freq_mhz", self.icnt_freq_mhz),
            ("dram_freq_mhz", self.dram_freq_mhz),
        ] {
            if freq == 0 || freq > 1_000_000 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be in 1..=1000000, got {}",
                    name, freq
                )));
            }
        }
        if !self.dram_req_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "dram_req_size must be a power of two, got {}",
                self.dram_req_size
            )));
        }
        if self.dram_queue_size == 0 || self.icnt_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be > 0".into(),
            ));
        }
        if self.precision == 0 {
            return Err(ConfigError::Invalid("precision must be > 0".into()));
        }
        if self.systolic_rows == 0 || self.systolic_cols == 0 || self.vector_lanes == 0 {
            return Err(ConfigError::Invalid(
                "systolic geometry must be nonzero".into(),
            ));
        }
        match self.scheduler_kind {
            SchedulerKind::PartitionCpu => {
                if self.partitions.is_empty() {
                    return Err(ConfigError::Invalid(
                        "partition_cpu scheduler requires a [partitions] table".into(),
                    ));
                }
                for (pid, cores) in &self.partitions {
                    if pid.parse::<u32>().is_err() {
                        return Err(ConfigError::Invalid(format!(
                            "partition key '{}' is not an unsigned integer",
                            pid
                        )));
                    }
                    if cores.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "partition {} has an empty core set",
                            pid
                        )));
                    }
                    if let Some(&bad) = cores.iter().find(|&&c| c >= self.num_cores) {
                        return Err(ConfigError::Invalid(format!(
                            "partition {} references core {} but num_cores is {}",
                            pid, bad, self.num_cores
                        )));
                    }
                }
            }
            SchedulerKind::SpatialSplit => {
                if self.num_cores < 2 || self.num_cores % 2 != 0 {
                    return Err(ConfigError::Invalid(format!(
                        "spatial_split scheduler requires an even core count, got {}",
                        self.num_cores
                    )));
                }
            }
            SchedulerKind::Simple | SchedulerKind::TimeMultiplex => {}
        }
        if self.dram_kind == DramKind::Banked && !self.banks_per_channel.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "banks_per_channel must be a power of two, got {}",
                self.banks_per_channel
            )));
        }
        Ok(())
    }
}
