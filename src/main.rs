//! npu-sim: cycle-accurate NPU performance simulator
//!
//! Usage:
//!
//! ```text
//! npu-sim [--config sim.toml] workload.json
//! ```
//!
//! The workload file lists the models to simulate:
//!
//! ```json
//! [
//!   {"name": "bert", "graph": "graphs/bert.json",
//!    "options": {"request_time": 0.0, "nr_atten": 4, "seq": 128}}
//! ]
//! ```
//!
//! Graph paths are resolved relative to the workload file. Options carry
//! the arrival time, partition hint, attention truncation, and dynamic-axis
//! bindings.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;

use npu_sim::config::SimulationConfig;
use npu_sim::model::{GraphSummary, ModelOptions};
use npu_sim::sim::{ModelRequest, Simulator};

/// One entry of the workload file.
#[derive(Debug, Deserialize)]
struct WorkloadEntry {
    name: String,
    graph: String,
    #[serde(default)]
    options: serde_json::Value,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut workload_path: Option<PathBuf> = None;

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config requires a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("usage: npu-sim [--config sim.toml] workload.json");
                return Ok(());
            }
            other if !other.starts_with('-') => {
                workload_path = Some(PathBuf::from(other));
            }
            other => bail!("unknown option: {}", other),
        }
    }
    let Some(workload_path) = workload_path else {
        bail!("usage: npu-sim [--config sim.toml] workload.json");
    };

    let config = SimulationConfig::load(config_path.as_deref())?;
    let mut sim = Simulator::new(config)?;

    let workload_text = std::fs::read_to_string(&workload_path)
        .with_context(|| format!("failed to read workload {}", workload_path.display()))?;
    let entries: Vec<WorkloadEntry> =
        serde_json::from_str(&workload_text).context("failed to parse workload file")?;
    let workload_dir = workload_path.parent().unwrap_or(Path::new("."));

    for entry in entries {
        let graph_path = workload_dir.join(&entry.graph);
        let graph = GraphSummary::from_file(&graph_path)
            .with_context(|| format!("failed to load graph {}", graph_path.display()))?;
        let options = ModelOptions::from_json(&entry.options)
            .with_context(|| format!("bad options for model {}", entry.name))?;
        log::info!(
            "Registered model {} (request time {} s)",
            entry.name,
            options.request_time
        );
        sim.register_model(ModelRequest {
            name: entry.name,
            graph,
            options,
        });
    }

    sim.run();
    sim.print_stats();
    Ok(())
}
