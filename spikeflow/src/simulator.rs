//! The distributed simulator: build dispatch, steady-state control, and the
//! worker loop.
//!
//! Process 0 owns a [`Simulator`] and drives every phase. During build it
//! applies records to its own chunk or ships them to the owning process;
//! afterwards it broadcasts commands: a non-negative value runs that many
//! steps (followed by a broadcast of the log flag), and negative values
//! request reset, probe gather, or termination. Every other process runs
//! [`worker`], which mirrors the protocol.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use itertools::Itertools;
use spikeflow_communication::{Fabric, Generic};

use crate::build::BuildRecord;
use crate::chunk::{Chunk, LogMode, DEFAULT_FLUSH_PROBES_EVERY};
use crate::error::{BuildError, Result, RuntimeError};
use crate::logsink::ProbeDecl;
use crate::operator::host::CallbackRegistry;
use crate::operator::OpSpec;
use crate::signal::{Key, Tensor};

const CMD_TERMINATE: i64 = -1;
const CMD_RESET: i64 = -2;
const CMD_GATHER: i64 = -3;

/// Run-wide options fixed at simulator construction.
#[derive(Copy, Clone, Debug)]
pub struct SimOptions {
    /// The fixed timestep.
    pub dt: f64,
    /// Steps between probe-ring flushes.
    pub flush_every: u64,
    /// Merge per-peer communication at finalize.
    pub merged: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        SimOptions { dt: 0.001, flush_every: DEFAULT_FLUSH_PROBES_EVERY, merged: false }
    }
}

struct SignalMeta {
    label: String,
    shape1: usize,
    shape2: usize,
    ndim: u8,
}

/// The master-side surface of a distributed simulation.
pub struct Simulator {
    chunk: Chunk,
    fabric: Rc<RefCell<Generic>>,
    options: SimOptions,
    signal_meta: HashMap<(usize, Key), SignalMeta>,
    probe_meta: Vec<(usize, ProbeDecl)>,
    probe_owner: HashMap<Key, usize>,
    cache: HashMap<Key, Vec<Tensor>>,
    dirty: bool,
    finalized: bool,
    closed: bool,
}

impl Simulator {
    /// A simulator driving the given fabric from process 0.
    pub fn new(fabric: Generic, options: SimOptions, registry: CallbackRegistry) -> Result<Simulator> {
        if fabric.index() != 0 {
            return Err(BuildError::Protocol("the simulator drives from process 0".into()).into());
        }
        let mut chunk = Chunk::new(fabric, options.dt, registry);
        chunk.set_flush_every(options.flush_every);
        chunk.set_merged(options.merged);
        let fabric = chunk.fabric();
        let mut sim = Simulator {
            chunk,
            fabric,
            options,
            signal_meta: HashMap::new(),
            probe_meta: Vec::new(),
            probe_owner: HashMap::new(),
            cache: HashMap::new(),
            dirty: false,
            finalized: false,
            closed: false,
        };
        let configure = BuildRecord::Configure {
            dt: options.dt,
            flush_every: options.flush_every,
            merged: options.merged,
        };
        for peer in 1..sim.n_procs() {
            sim.post_record(peer, &configure)?;
        }
        Ok(sim)
    }

    /// Number of participating processes.
    pub fn n_procs(&self) -> usize {
        self.chunk.n_procs()
    }

    /// The fixed timestep.
    pub fn dt(&self) -> f64 {
        self.options.dt
    }

    /// Simulated time so far on the master's chunk.
    pub fn time(&self) -> f64 {
        self.chunk.time()
    }

    fn post_record(&mut self, rank: usize, record: &BuildRecord) -> Result<()> {
        let frame = record.encode()?;
        self.fabric
            .borrow_mut()
            .post_control(rank, frame)
            .map_err(RuntimeError::Comm)?;
        Ok(())
    }

    fn ensure_building(&self, rank: usize) -> Result<()> {
        if self.finalized {
            return Err(BuildError::Protocol("build already finalized".into()).into());
        }
        if rank >= self.n_procs() {
            return Err(BuildError::Protocol(format!(
                "rank {} out of range ({} processes)",
                rank,
                self.n_procs()
            ))
            .into());
        }
        Ok(())
    }

    /// Adds a base signal to the chunk owned by `rank`.
    pub fn add_signal(&mut self, rank: usize, key: Key, label: &str, tensor: Tensor) -> Result<()> {
        self.ensure_building(rank)?;
        self.signal_meta.insert(
            (rank, key),
            SignalMeta {
                label: label.to_string(),
                shape1: tensor.shape1(),
                shape2: tensor.shape2(),
                ndim: tensor.ndim(),
            },
        );
        if rank == 0 {
            self.chunk.add_base_signal(key, label.to_string(), tensor)
        } else {
            self.post_record(rank, &BuildRecord::AddSignal { key, label: label.to_string(), tensor })
        }
    }

    /// Adds an operator to the chunk owned by `rank`.
    pub fn add_op(&mut self, rank: usize, spec: OpSpec) -> Result<()> {
        self.ensure_building(rank)?;
        if rank == 0 {
            self.chunk.add_op(spec)
        } else {
            self.post_record(rank, &BuildRecord::AddOp { spec })
        }
    }

    /// Adds a full-extent probe over `signal` on the chunk owned by `rank`.
    pub fn add_probe(&mut self, rank: usize, probe: Key, signal: Key, period: u64) -> Result<()> {
        self.ensure_building(rank)?;
        if self.probe_owner.contains_key(&probe) {
            return Err(BuildError::DuplicateProbe(probe).into());
        }
        let meta = self
            .signal_meta
            .get(&(rank, signal))
            .ok_or(BuildError::UnknownKey(signal))?;
        let decl = ProbeDecl {
            key: probe,
            label: meta.label.clone(),
            shape1: meta.shape1,
            shape2: meta.shape2,
            ndim: meta.ndim,
            period,
        };
        self.probe_owner.insert(probe, rank);
        self.probe_meta.push((rank, decl));
        if rank == 0 {
            self.chunk.add_probe(probe, signal, period)
        } else {
            self.post_record(rank, &BuildRecord::AddProbe { probe, signal, period })
        }
    }

    /// Closes the build streams and seals every chunk.
    pub fn finalize_build(&mut self) -> Result<()> {
        if self.finalized {
            return Err(BuildError::Protocol("finalize_build called twice".into()).into());
        }
        for peer in 1..self.n_procs() {
            self.post_record(peer, &BuildRecord::Stop)?;
        }
        self.chunk.finalize_build()?;
        self.finalized = true;
        Ok(())
    }

    /// Runs `steps` timesteps on every chunk, optionally writing probe
    /// output to the log file at `log_path`.
    pub fn run_n_steps(&mut self, steps: u64, show_progress: bool, log_path: Option<&Path>) -> Result<()> {
        if !self.finalized {
            return Err(BuildError::Protocol("run_n_steps before finalize_build".into()).into());
        }
        self.fabric
            .borrow_mut()
            .broadcast(0, steps as i64)
            .map_err(RuntimeError::Comm)?;
        self.fabric
            .borrow_mut()
            .broadcast(0, i64::from(log_path.is_some()))
            .map_err(RuntimeError::Comm)?;
        let mode = match log_path {
            Some(path) => LogMode::Root { path: path.to_path_buf(), decls: self.sorted_decls() },
            None => LogMode::Off,
        };
        self.chunk.run_n_steps(steps, show_progress, mode)?;
        self.dirty = true;
        Ok(())
    }

    fn sorted_decls(&self) -> Vec<ProbeDecl> {
        self.probe_meta
            .iter()
            .sorted_by_key(|(rank, decl)| (*rank, decl.key))
            .map(|(_, decl)| decl.clone())
            .collect()
    }

    /// The samples the probe under `key` has collected in memory, gathering
    /// from the owning process if a run happened since the last gather.
    pub fn probe_data(&mut self, key: Key) -> Result<Vec<Tensor>> {
        if !self.probe_owner.contains_key(&key) {
            return Err(BuildError::UnknownProbe(key).into());
        }
        if self.dirty {
            self.gather()?;
        }
        Ok(self.cache.get(&key).cloned().unwrap_or_default())
    }

    fn gather(&mut self) -> Result<()> {
        self.fabric
            .borrow_mut()
            .broadcast(0, CMD_GATHER)
            .map_err(RuntimeError::Comm)?;
        self.cache.clear();
        for (key, samples) in self.chunk.dump_probe_data() {
            self.cache.insert(key, samples);
        }
        for peer in 1..self.n_procs() {
            let frame = self
                .fabric
                .borrow_mut()
                .wait_control(peer)
                .map_err(RuntimeError::Comm)?;
            let blocks: Vec<(Key, Vec<Tensor>)> = bincode::deserialize(&frame)?;
            for (key, samples) in blocks {
                self.cache.insert(key, samples);
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Restores every chunk to its initial state. The seed is recorded for
    /// the embedding layer.
    pub fn reset(&mut self, seed: u32) -> Result<()> {
        if !self.finalized {
            return Err(BuildError::Protocol("reset before finalize_build".into()).into());
        }
        self.fabric
            .borrow_mut()
            .broadcast(0, CMD_RESET)
            .map_err(RuntimeError::Comm)?;
        self.fabric
            .borrow_mut()
            .broadcast(0, i64::from(seed))
            .map_err(RuntimeError::Comm)?;
        self.chunk.reset(seed);
        self.cache.clear();
        self.dirty = false;
        Ok(())
    }

    /// Terminates the workers and releases the fabric. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.finalized {
            self.fabric
                .borrow_mut()
                .broadcast(0, CMD_TERMINATE)
                .map_err(RuntimeError::Comm)?;
        } else if self.n_procs() > 1 {
            log::warn!("closing an unfinalized simulator; worker processes may hang");
        }
        self.fabric.borrow_mut().shutdown().map_err(RuntimeError::Comm)?;
        Ok(())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close() {
                log::error!("simulator close failed: {}", error);
            }
        }
    }
}

/// Runs the worker side of the protocol on every process other than 0:
/// consume build records until the stream stops, seal the chunk, then follow
/// broadcast commands until termination.
pub fn worker(fabric: Generic, registry: CallbackRegistry) -> Result<()> {
    let mut fabric = fabric;
    let rank = fabric.index();
    if rank == 0 {
        return Err(BuildError::Protocol("worker called on process 0".into()).into());
    }

    // The first record carries the run-wide configuration.
    let frame = fabric.wait_control(0).map_err(RuntimeError::Comm)?;
    let (dt, flush_every, merged) = match BuildRecord::decode(&frame)? {
        BuildRecord::Configure { dt, flush_every, merged } => (dt, flush_every, merged),
        other => {
            return Err(BuildError::Protocol(format!(
                "expected the configure record, got flag {}",
                other.flag()
            ))
            .into())
        }
    };
    let mut chunk = Chunk::new(fabric, dt, registry);
    chunk.set_flush_every(flush_every);
    chunk.set_merged(merged);
    let fabric = chunk.fabric();

    loop {
        let frame = fabric.borrow_mut().wait_control(0).map_err(RuntimeError::Comm)?;
        match BuildRecord::decode(&frame)? {
            BuildRecord::Configure { .. } => {
                return Err(BuildError::Protocol("configure after build start".into()).into());
            }
            BuildRecord::AddSignal { key, label, tensor } => {
                chunk.add_base_signal(key, label, tensor)?;
            }
            BuildRecord::AddOp { spec } => chunk.add_op(spec)?,
            BuildRecord::AddProbe { probe, signal, period } => {
                chunk.add_probe(probe, signal, period)?;
            }
            BuildRecord::Stop => break,
        }
    }
    chunk.finalize_build()?;

    loop {
        let command = fabric.borrow_mut().broadcast(0, 0).map_err(RuntimeError::Comm)?;
        match command {
            steps if steps >= 0 => {
                let log_flag = fabric.borrow_mut().broadcast(0, 0).map_err(RuntimeError::Comm)?;
                let mode = if log_flag != 0 { LogMode::Worker } else { LogMode::Off };
                chunk.run_n_steps(steps as u64, false, mode)?;
            }
            CMD_RESET => {
                let seed = fabric.borrow_mut().broadcast(0, 0).map_err(RuntimeError::Comm)?;
                chunk.reset(seed as u32);
            }
            CMD_GATHER => {
                let blocks = chunk.dump_probe_data();
                let frame = bincode::serialize(&blocks)?;
                fabric
                    .borrow_mut()
                    .post_control(0, frame)
                    .map_err(RuntimeError::Comm)?;
            }
            CMD_TERMINATE => break,
            other => {
                return Err(BuildError::Protocol(format!("unknown command {}", other)).into());
            }
        }
    }
    fabric.borrow_mut().shutdown().map_err(RuntimeError::Comm)?;
    log::debug!("process {}: worker loop complete", rank);
    Ok(())
}
