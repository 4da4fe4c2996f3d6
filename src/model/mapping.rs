//! Tile-mapping table.
//!
//! Maps an operator's GEMM-space problem size to the tile shape its
//! generator should use. Explicit entries load from an optional TOML file
//! (the path travels through [`SimulationConfig`]); any size without an
//! entry falls back to a deterministic heuristic derived from the systolic
//! geometry, so the table is total.
//!
//! # Mapping File Format
//!
//! ```toml
//! vector_tile_elems = 8192
//!
//! [[gemm]]
//! m = 1024
//! n = 1024
//! k = 1024
//! tile_m = 128
//! tile_n = 32
//! tile_k = 32
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::config::{ConfigError, CoreKind, SimulationConfig};

/// Tile shape for one GEMM-space problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub tile_m: u64,
    pub tile_n: u64,
    pub tile_k: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct GemmEntry {
    m: u64,
    n: u64,
    k: u64,
    tile_m: u64,
    tile_n: u64,
    tile_k: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct MappingFile {
    gemm: Vec<GemmEntry>,
    vector_tile_elems: Option<u64>,
}

/// Lookup table from operator shape to tiling parameters.
#[derive(Debug, Clone)]
pub struct MappingTable {
    gemm: HashMap<(u64, u64, u64), Mapping>,
    vector_tile_elems: u64,
    kind: CoreKind,
    rows: u64,
    cols: u64,
}

/// Default element count per vector-unit tile.
const DEFAULT_VECTOR_TILE: u64 = 4096;

impl MappingTable {
    /// Build the table: heuristic defaults plus entries from the configured
    /// mapping file, if one is set.
    pub fn load(config: &SimulationConfig) -> Result<Self, ConfigError> {
        let mut table = Self::from_config(config);
        if let Some(path) = &config.mapping_path {
            table.merge_file(Path::new(path))?;
        }
        Ok(table)
    }

    /// Heuristic-only table derived from the systolic geometry.
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            gemm: HashMap::new(),
            vector_tile_elems: DEFAULT_VECTOR_TILE,
            kind: config.core_kind,
            rows: config.systolic_rows as u64,
            cols: config.systolic_cols as u64,
        }
    }

    fn merge_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let file: MappingFile = toml::from_str(&content)?;
        for entry in file.gemm {
            self.gemm.insert(
                (entry.m, entry.n, entry.k),
                Mapping {
                    tile_m: entry.tile_m,
                    tile_n: entry.tile_n,
                    tile_k: entry.tile_k,
                },
            );
        }
        if let Some(elems) = file.vector_tile_elems {
            self.vector_tile_elems = elems.max(1);
        }
        log::info!("Loaded {} mapping entries from {}", self.gemm.len(), path.display());
        Ok(())
    }

    /// Tile shape for an `m x n x k` GEMM-space problem.
    pub fn gemm(&self, m: u64, n: u64, k: u64) -> Mapping {
        self.gemm
            .get(&(m, n, k))
            .copied()
            .unwrap_or_else(|| self.heuristic_gemm(m, n, k))
    }

    /// Elements per vector-unit tile.
    pub fn vector_tile(&self) -> u64 {
        self.vector_tile_elems
    }

    /// Clamp the stationary dimensions to the array and bound the streamed
    /// dimension so one tile's working set stays scratchpad-sized.
    fn heuristic_gemm(&self, m: u64, n: u64, k: u64) -> Mapping {
        const STREAM_TILE: u64 = 128;
        let (m, n, k) = (m.max(1), n.max(1), k.max(1));
        match self.kind {
            // Weight-stationary: a k x n weight block lives in the array.
            CoreKind::SystolicWs => Mapping {
                tile_m: m.min(STREAM_TILE),
                tile_n: n.min(self.cols),
                tile_k: k.min(self.rows),
            },
            // Output-stationary: an m x n output block lives in the array.
            CoreKind::SystolicOs => Mapping {
                tile_m: m.min(self.rows),
                tile_n: n.min(self.cols),
                tile_k: k.min(STREAM_TILE),
            },
        }
    }
}
