//! Tile scheduling policies.
//!
//! The scheduler receives models as they arrive, expands their executable
//! layers into per-layer tile queues, and hands tiles to cores on request.
//! Four policies share the machinery and differ only in which queues a
//! given core may draw from and when:
//!
//! - `simple`: global FIFO of executable layers, any core pulls any tile
//! - `partition_cpu`: a model's tiles stay on its partition's cores
//! - `time_multiplex`: one model owns all cores; rotation at layer
//!   boundaries
//! - `spatial_split`: cores split in two halves, one model per half, with a
//!   two-model cap and an overflow queue
//!
//! Policy selection is a tagged variant resolved once at construction; no
//! dynamic dispatch is involved.
//!
//! Live models are owned by the simulator's [`ModelPool`]; the scheduler
//! addresses them by id and borrows the pool only inside the calls that
//! need it.

use std::collections::{HashMap, VecDeque};

use crate::config::{SchedulerKind, SimulationConfig};
use crate::core::tile::Tile;
use crate::model::ModelPool;

/// Completion record of one model, for final statistics.
#[derive(Debug, Clone)]
pub struct ModelRecord {
    pub name: String,
    pub request_time_ps: u64,
    pub start_time_ps: u64,
    pub finish_time_ps: u64,
}

/// Completion record of one layer, for dependency-order statistics.
#[derive(Debug, Clone, Copy)]
pub struct LayerRecord {
    pub model_id: u64,
    pub layer_id: u32,
    pub finish_time_ps: u64,
}

/// Tiles of one executable layer being distributed to cores.
#[derive(Debug)]
struct LayerQueue {
    model_id: u64,
    layer_id: u32,
    tiles: VecDeque<Tile>,
    /// Tiles issued to cores and not yet reported finished.
    outstanding: u32,
    /// Core that took this queue's most recent tile. An accumulation tile
    /// at the front is reserved for this core, since only its accumulator
    /// holds the partial sums to chain from.
    last_core: Option<usize>,
}

/// What a tile-finish event amounted to.
struct FinishOutcome {
    model_id: u64,
    /// The layer's last tile retired and the layer was marked finished.
    layer_completed: bool,
    model_finished: bool,
}

/// Machinery shared by all policies.
#[derive(Debug, Default)]
struct SchedulerBase {
    queues: VecDeque<LayerQueue>,
    model_records: Vec<ModelRecord>,
    layer_records: Vec<LayerRecord>,
}

impl SchedulerBase {
    /// Index of the queue `core_id` should draw a tile from.
    ///
    /// A chain this core has open takes priority over everything else: its
    /// partial sums sit in the core's accumulator, and issuing any other
    /// layer in between would clobber them. Queues whose front is an
    /// accumulation tile belonging to another core's chain are invisible.
    fn select(&self, core_id: usize, eligible: impl Fn(&LayerQueue) -> bool) -> Option<usize> {
        let open_chain = self.queues.iter().position(|q| {
            !q.tiles.is_empty()
                && eligible(q)
                && q.tiles.front().unwrap().accum
                && q.last_core == Some(core_id)
        });
        if open_chain.is_some() {
            return open_chain;
        }
        self.queues.iter().position(|q| {
            !q.tiles.is_empty() && eligible(q) && !q.tiles.front().unwrap().accum
        })
    }

    fn take(&mut self, idx: usize, core_id: usize) -> Tile {
        let queue = &mut self.queues[idx];
        let tile = queue.tiles.pop_front().unwrap();
        queue.outstanding += 1;
        queue.last_core = Some(core_id);
        tile
    }

    /// Expand every currently-executable layer of the model into queues.
    /// Priority above the default pushes the new queues ahead of the rest.
    fn admit_layers(&mut self, pool: &mut ModelPool, model_id: u64, priority: u32) {
        let model = pool.get_mut(model_id).expect("admit for unknown model");
        let mut fresh = Vec::new();
        while let Some(op_id) = model.pop_ready() {
            let tiles: VecDeque<Tile> = model.take_tiles(op_id).into();
            debug_assert!(!tiles.is_empty(), "layer {} expanded to zero tiles", op_id);
            fresh.push(LayerQueue {
                model_id,
                layer_id: op_id,
                tiles,
                outstanding: 0,
                last_core: None,
            });
        }
        if priority > 1 {
            for queue in fresh.into_iter().rev() {
                self.queues.push_front(queue);
            }
        } else {
            self.queues.extend(fresh);
        }
    }

    /// Account one finished tile; on a layer boundary, mark the layer
    /// finished on the model, admit unlocked layers, and retire the model
    /// if everything is done.
    fn finish_tile(
        &mut self,
        layer_id: u32,
        pool: &mut ModelPool,
        now_ps: u64,
    ) -> FinishOutcome {
        let idx = self
            .queues
            .iter()
            .position(|q| q.layer_id == layer_id)
            .expect("finish reported for a layer the scheduler is not tracking");
        let queue = &mut self.queues[idx];
        let model_id = queue.model_id;
        assert!(queue.outstanding > 0, "finish with no outstanding tile");
        queue.outstanding -= 1;
        if !queue.tiles.is_empty() || queue.outstanding > 0 {
            return FinishOutcome {
                model_id,
                layer_completed: false,
                model_finished: false,
            };
        }
        self.queues.remove(idx);
        self.layer_records.push(LayerRecord {
            model_id,
            layer_id,
            finish_time_ps: now_ps,
        });
        let model = pool.get_mut(model_id).expect("finish for unknown model");
        model.set_layer_finish(layer_id);
        self.admit_layers(pool, model_id, 1);
        let model_finished = pool.get(model_id).unwrap().finished();
        if model_finished {
            self.retire_model(pool, model_id, now_ps);
        }
        FinishOutcome {
            model_id,
            layer_completed: true,
            model_finished,
        }
    }

    fn retire_model(&mut self, pool: &mut ModelPool, model_id: u64, now_ps: u64) {
        let model = pool.remove(model_id).unwrap();
        log::info!(
            "model {} finished at {} us",
            model.name,
            now_ps / 1_000_000
        );
        self.model_records.push(ModelRecord {
            name: model.name,
            request_time_ps: model.request_time_ps,
            start_time_ps: model.start_time_ps.unwrap_or(0),
            finish_time_ps: now_ps,
        });
    }

    /// Whether the given model has any tile issued and unfinished.
    fn model_has_outstanding(&self, model_id: u64) -> bool {
        self.queues
            .iter()
            .any(|q| q.model_id == model_id && q.outstanding > 0)
    }

    /// Whether the given model has a half-issued accumulation chain. Such a
    /// chain pins its core's accumulator and must not be preempted.
    fn model_has_open_chain(&self, model_id: u64) -> bool {
        self.queues.iter().any(|q| {
            q.model_id == model_id && q.tiles.front().map(|t| t.accum).unwrap_or(false)
        })
    }
}

/// Global FIFO: any core serves the frontmost layer with tiles.
#[derive(Debug, Default)]
pub struct SimpleScheduler {
    base: SchedulerBase,
}

/// Partitioned: a model's tiles are assignable only to the cores of its
/// partition's configured core set.
#[derive(Debug)]
pub struct PartitionScheduler {
    base: SchedulerBase,
    partitions: HashMap<u32, Vec<usize>>,
    model_partition: HashMap<u64, Option<u32>>,
}

/// Time multiplexed: the front of the rotation owns every core; the
/// rotation advances only at a layer boundary with nothing of the current
/// model left in flight.
#[derive(Debug, Default)]
pub struct TimeMultiplexScheduler {
    base: SchedulerBase,
    rotation: VecDeque<u64>,
}

/// Spatially split: the low-indexed half of the cores serves one model, the
/// high-indexed half another; further models wait in submission order.
#[derive(Debug)]
pub struct HalfSplitScheduler {
    base: SchedulerBase,
    half_cores: usize,
    active: [Option<u64>; 2],
    waiting: VecDeque<u64>,
}

/// The scheduling policy selected at construction.
#[derive(Debug)]
pub enum Scheduler {
    Simple(SimpleScheduler),
    Partition(PartitionScheduler),
    TimeMultiplex(TimeMultiplexScheduler),
    HalfSplit(HalfSplitScheduler),
}

impl Scheduler {
    pub fn new(config: &SimulationConfig) -> Self {
        match config.scheduler_kind {
            SchedulerKind::Simple => Scheduler::Simple(SimpleScheduler::default()),
            SchedulerKind::PartitionCpu => Scheduler::Partition(PartitionScheduler {
                base: SchedulerBase::default(),
                partitions: config
                    .partitions
                    .iter()
                    .map(|(pid, cores)| {
                        let pid = pid.parse().expect("partition key validated at load");
                        (pid, cores.clone())
                    })
                    .collect(),
                model_partition: HashMap::new(),
            }),
            SchedulerKind::TimeMultiplex => {
                Scheduler::TimeMultiplex(TimeMultiplexScheduler::default())
            }
            SchedulerKind::SpatialSplit => Scheduler::HalfSplit(HalfSplitScheduler {
                base: SchedulerBase::default(),
                half_cores: config.num_cores / 2,
                active: [None, None],
                waiting: VecDeque::new(),
            }),
        }
    }

    fn base(&self) -> &SchedulerBase {
        match self {
            Scheduler::Simple(s) => &s.base,
            Scheduler::Partition(s) => &s.base,
            Scheduler::TimeMultiplex(s) => &s.base,
            Scheduler::HalfSplit(s) => &s.base,
        }
    }

    fn base_mut(&mut self) -> &mut SchedulerBase {
        match self {
            Scheduler::Simple(s) => &mut s.base,
            Scheduler::Partition(s) => &mut s.base,
            Scheduler::TimeMultiplex(s) => &mut s.base,
            Scheduler::HalfSplit(s) => &mut s.base,
        }
    }

    /// Register an arrived model and expand its initially-executable layers.
    pub fn schedule_model(&mut self, pool: &mut ModelPool, model_id: u64, priority: u32) {
        match self {
            Scheduler::Simple(_) => {}
            Scheduler::Partition(s) => {
                let partition = pool.get(model_id).and_then(|m| m.partition_id);
                if let Some(pid) = partition {
                    assert!(
                        s.partitions.contains_key(&pid),
                        "model partition {} has no configured core set",
                        pid
                    );
                }
                s.model_partition.insert(model_id, partition);
            }
            Scheduler::TimeMultiplex(s) => s.rotation.push_back(model_id),
            Scheduler::HalfSplit(s) => {
                if let Some(slot) = s.active.iter().position(|a| a.is_none()) {
                    s.active[slot] = Some(model_id);
                } else {
                    s.waiting.push_back(model_id);
                }
            }
        }
        self.base_mut().admit_layers(pool, model_id, priority);
        // A degenerate model with no operations is already finished.
        if pool.get(model_id).map(|m| m.finished()).unwrap_or(false) {
            let now = pool.get(model_id).unwrap().start_time_ps.unwrap_or(0);
            self.base_mut().retire_model(pool, model_id, now);
            self.forget_model(model_id);
        }
    }

    /// Account a tile finish reported by a core.
    pub fn finish_tile(
        &mut self,
        core_id: usize,
        layer_id: u32,
        pool: &mut ModelPool,
        now_ps: u64,
    ) {
        log::trace!("core {}: finished a tile of layer {}", core_id, layer_id);
        let outcome = self.base_mut().finish_tile(layer_id, pool, now_ps);
        if outcome.model_finished {
            self.forget_model(outcome.model_id);
            return;
        }
        // Rotation advances only at a layer boundary once nothing of the
        // current model remains in flight and no accumulation chain is half
        // issued, so issued tiles always belong to a single model.
        if let Scheduler::TimeMultiplex(s) = self {
            if outcome.layer_completed
                && s.rotation.front() == Some(&outcome.model_id)
                && s.rotation.len() > 1
                && !s.base.model_has_outstanding(outcome.model_id)
                && !s.base.model_has_open_chain(outcome.model_id)
            {
                let current = s.rotation.pop_front().unwrap();
                s.rotation.push_back(current);
            }
        }
    }

    /// Drop a finished model from policy bookkeeping.
    fn forget_model(&mut self, model_id: u64) {
        match self {
            Scheduler::Simple(_) => {}
            Scheduler::Partition(s) => {
                s.model_partition.remove(&model_id);
            }
            Scheduler::TimeMultiplex(s) => s.rotation.retain(|&m| m != model_id),
            Scheduler::HalfSplit(s) => {
                for slot in &mut s.active {
                    if *slot == Some(model_id) {
                        *slot = s.waiting.pop_front();
                    }
                }
            }
        }
    }

    /// Index of the queue `core_id` would be served from.
    fn select_for(&self, core_id: usize) -> Option<usize> {
        match self {
            Scheduler::Simple(s) => s.base.select(core_id, |_| true),
            Scheduler::Partition(s) => s.base.select(core_id, |q| {
                match s.model_partition.get(&q.model_id) {
                    Some(Some(pid)) => s.partitions[pid].contains(&core_id),
                    // No partition hint: any core may serve the model.
                    _ => true,
                }
            }),
            Scheduler::TimeMultiplex(s) => {
                let current = *s.rotation.front()?;
                s.base.select(core_id, |q| q.model_id == current)
            }
            Scheduler::HalfSplit(s) => {
                let half = usize::from(core_id >= s.half_cores);
                let owner = s.active[half]?;
                s.base.select(core_id, |q| q.model_id == owner)
            }
        }
    }

    /// Hand out the next tile assignable to `core_id`, if any. The returned
    /// tile is always `Initialized`.
    pub fn get_tile(&mut self, core_id: usize) -> Option<Tile> {
        let idx = self.select_for(core_id)?;
        Some(self.base_mut().take(idx, core_id))
    }

    /// Whether the `ahead`-th upcoming tile for `core_id` needs accumulator
    /// chaining. Only `ahead == 0` is consulted by the driver.
    pub fn is_accum_tile(&self, core_id: usize, ahead: usize) -> bool {
        let Some(idx) = self.select_for(core_id) else {
            return false;
        };
        self.base().queues[idx]
            .tiles
            .get(ahead)
            .map(|t| t.accum)
            .unwrap_or(false)
    }

    /// True iff no layer has tiles pending assignment or in flight.
    pub fn empty(&self) -> bool {
        self.base().queues.is_empty()
    }

    pub fn model_records(&self) -> &[ModelRecord] {
        &self.base().model_records
    }

    pub fn layer_records(&self) -> &[LayerRecord] {
        &self.base().layer_records
    }

    /// Print per-model turnaround statistics. Called exactly once after the
    /// main loop.
    pub fn print_stats(&self) {
        println!("Models ({} finished)", self.base().model_records.len());
        for record in &self.base().model_records {
            println!(
                "  {}: requested {} us, started {} us, finished {} us, turnaround {} us",
                record.name,
                record.request_time_ps / 1_000_000,
                record.start_time_ps / 1_000_000,
                record.finish_time_ps / 1_000_000,
                (record.finish_time_ps - record.request_time_ps) / 1_000_000
            );
        }
    }
}
