//! One process's slice of the network: signals, operators, probes, and the
//! per-step loop.
//!
//! A chunk is built incrementally from signal, operator and probe additions,
//! then sealed by [`Chunk::finalize_build`], which orders the schedule,
//! validates the communication tables collectively, optionally merges
//! per-peer traffic, resolves every view, and snapshots initial values for
//! reset. After that the chunk only steps: operators in schedule order,
//! probes at end of step, periodic probe flushes to the log sink.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use spikeflow_communication::{Fabric, Generic, MAX_USER_TAG, MERGED_TAG};

use crate::error::{BuildError, Result, RuntimeError};
use crate::logsink::{LogWriter, ProbeDecl};
use crate::operator::algebra::{Copy, DotInc, ProdUpdate, Reset, ScalarDotInc, ScalarProdUpdate};
use crate::operator::comm::{BarrierOp, MergedRecvOp, MergedSendOp, RecvOp, SendOp};
use crate::operator::filter::Filter;
use crate::operator::host::{CallbackRegistry, HostCallback};
use crate::operator::neuron::{SimLif, SimLifRate};
use crate::operator::{OpIndex, OpSpec, Operator};
use crate::probe::Probe;
use crate::signal::{Key, ResolvedView, SignalStore, Tensor, ViewSpec};

/// Steps between probe-ring flushes to the log sink, unless overridden.
pub const DEFAULT_FLUSH_PROBES_EVERY: u64 = 1000;

/// Steps between collective barriers bounding inter-chunk skew.
pub const BARRIER_PERIOD: u64 = 1000;

/// How probe output leaves the chunk during a run.
pub enum LogMode {
    /// Keep flushed samples in memory.
    Off,
    /// This process writes the single log file, interleaving its own blocks
    /// with blocks shipped by every peer at each flush boundary.
    Root { path: PathBuf, decls: Vec<ProbeDecl> },
    /// Ship blocks to the writing process at each flush boundary.
    Worker,
}

enum ActiveSink {
    Off,
    Writer(LogWriter),
    /// The writer failed; keep draining shipped blocks so peers never block.
    Draining,
    Worker,
}

/// A send/receive table entry exchanged for collective validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CommDesc {
    send: bool,
    rank: usize,
    peer: usize,
    tag: u32,
    len: usize,
}

enum PendingOp {
    Spec(OpSpec),
    MergedSend { target: usize, members: Vec<(u32, ViewSpec)> },
    MergedRecv { source: usize, members: Vec<(u32, ViewSpec)> },
}

/// Everything one process owns: the signal store, the ordered operator
/// schedule, probes, and the bookkeeping needed for reset.
pub struct Chunk {
    rank: usize,
    n_procs: usize,
    dt: f64,
    time: Rc<Cell<f64>>,
    step_counter: u64,
    seed: u32,
    store: SignalStore,
    initial: HashMap<Key, Vec<f64>>,
    op_specs: Vec<(OpIndex, OpSpec)>,
    next_seq: u64,
    operators: Vec<Box<dyn Operator>>,
    probes: BTreeMap<Key, Probe>,
    merged: bool,
    flush_every: u64,
    fabric: Rc<RefCell<Generic>>,
    registry: Rc<RefCell<CallbackRegistry>>,
    finalized: bool,
}

impl Chunk {
    /// A fresh chunk bound to a fabric.
    pub fn new(fabric: Generic, dt: f64, registry: CallbackRegistry) -> Chunk {
        let rank = fabric.index();
        let n_procs = fabric.peers();
        Chunk {
            rank,
            n_procs,
            dt,
            time: Rc::new(Cell::new(0.0)),
            step_counter: 0,
            seed: 0,
            store: SignalStore::default(),
            initial: HashMap::new(),
            op_specs: Vec::new(),
            next_seq: 0,
            operators: Vec::new(),
            probes: BTreeMap::new(),
            merged: false,
            flush_every: DEFAULT_FLUSH_PROBES_EVERY,
            fabric: Rc::new(RefCell::new(fabric)),
            registry: Rc::new(RefCell::new(registry)),
            finalized: false,
        }
    }

    /// Index of this process.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of participating processes.
    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    /// The fixed timestep.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Simulated time so far.
    pub fn time(&self) -> f64 {
        self.time.get()
    }

    /// Steps executed so far.
    pub fn step_count(&self) -> u64 {
        self.step_counter
    }

    /// The seed recorded at the last reset.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// The shared fabric handle.
    pub fn fabric(&self) -> Rc<RefCell<Generic>> {
        Rc::clone(&self.fabric)
    }

    /// Overrides the probe flush period. Every process must use the same
    /// value, since flush boundaries are a collective rendezvous.
    pub fn set_flush_every(&mut self, every: u64) {
        assert!(every >= 1, "flush period must be at least 1");
        self.flush_every = every;
    }

    /// Enables per-peer merging of communication operators at finalize.
    pub fn set_merged(&mut self, merged: bool) {
        self.merged = merged;
    }

    /// Adds a base signal.
    pub fn add_base_signal(&mut self, key: Key, label: String, tensor: Tensor) -> Result<()> {
        self.store.add_base(key, label, tensor)
    }

    /// Stages an operator for the schedule.
    pub fn add_op(&mut self, spec: OpSpec) -> Result<()> {
        if let OpSpec::Send { tag, .. } | OpSpec::Recv { tag, .. } = &spec {
            if *tag > MAX_USER_TAG {
                return Err(BuildError::ReservedTag(*tag).into());
            }
        }
        let index = OpIndex { index: spec.index(), seq: self.next_seq };
        self.next_seq += 1;
        self.op_specs.push((index, spec));
        Ok(())
    }

    /// Adds a full-extent probe over the signal under `signal`.
    pub fn add_probe(&mut self, probe: Key, signal: Key, period: u64) -> Result<()> {
        let spec = self.store.get(signal)?.full_view();
        self.add_probe_view(probe, spec, period)
    }

    /// Adds a probe over an arbitrary view.
    pub fn add_probe_view(&mut self, probe: Key, spec: ViewSpec, period: u64) -> Result<()> {
        if period == 0 {
            return Err(BuildError::BadPeriod(probe).into());
        }
        if self.probes.contains_key(&probe) {
            return Err(BuildError::DuplicateProbe(probe).into());
        }
        let view = self.store.view(&spec)?;
        self.probes.insert(probe, Probe::new(probe, spec, view, period));
        Ok(())
    }

    /// Declaration records for every probe this chunk carries, in key order.
    pub fn probe_decls(&self) -> Vec<ProbeDecl> {
        self.probes
            .values()
            .map(|probe| ProbeDecl {
                key: probe.key(),
                label: probe.label().to_string(),
                shape1: probe.target().shape1,
                shape2: probe.target().shape2,
                ndim: probe.target().ndim,
                period: probe.period(),
            })
            .collect()
    }

    /// Seals the build: orders the schedule, validates communication tables
    /// collectively, synthesizes merged plans, resolves views, installs the
    /// terminal barrier, and snapshots initial values.
    pub fn finalize_build(&mut self) -> Result<()> {
        if self.finalized {
            return Err(BuildError::Protocol("finalize_build called twice".into()).into());
        }

        let mut specs = std::mem::take(&mut self.op_specs);
        specs.sort_by(|a, b| a.0.cmp(&b.0));

        self.validate_comm_tables(&specs)?;

        let pending = if self.merged { merge_comm_specs(specs) } else {
            specs.into_iter().map(|(index, spec)| (index, PendingOp::Spec(spec))).collect()
        };

        let mut operators = Vec::with_capacity(pending.len() + 1);
        for (_, item) in pending {
            operators.push(self.build_operator(item)?);
        }
        operators.push(Box::new(BarrierOp::new(self.fabric(), BARRIER_PERIOD)) as Box<dyn Operator>);
        self.operators = operators;

        self.initial = self.store.snapshot();
        self.finalized = true;
        log::debug!(
            "process {}: build sealed with {} signals, {} operators, {} probes",
            self.rank,
            self.store.len(),
            self.operators.len(),
            self.probes.len()
        );
        Ok(())
    }

    /// Executes `steps` timesteps.
    pub fn run_n_steps(&mut self, steps: u64, show_progress: bool, log: LogMode) -> Result<()> {
        if !self.finalized {
            return Err(BuildError::Protocol("run_n_steps before finalize_build".into()).into());
        }
        let mut sink = match log {
            LogMode::Off => ActiveSink::Off,
            LogMode::Worker => ActiveSink::Worker,
            LogMode::Root { path, decls } => match LogWriter::create(&path, self.dt, &decls) {
                Ok(writer) => ActiveSink::Writer(writer),
                Err(error) => {
                    log::warn!("probe log disabled: cannot open {}: {}", path.display(), error);
                    ActiveSink::Draining
                }
            },
        };
        if show_progress && steps > 0 {
            log::info!("process {}: running {} steps (dt {})", self.rank, steps, self.dt);
        }

        for _ in 0..steps {
            for op in &mut self.operators {
                op.step()?;
            }
            let step = self.step_counter;
            for probe in self.probes.values_mut() {
                probe.sample(step);
            }
            self.time.set(self.time.get() + self.dt);
            self.step_counter += 1;
            if self.step_counter % self.flush_every == 0 {
                self.flush_probes(&mut sink)?;
            }
        }

        // Trailing flush so the sink holds everything the run produced.
        self.flush_probes(&mut sink)?;
        if let ActiveSink::Writer(writer) = &mut sink {
            if let Err(error) = writer.flush() {
                log::warn!("probe log disabled: flush failed: {}", error);
            }
        }
        if show_progress && steps > 0 {
            log::info!("process {}: completed {} steps, time {}", self.rank, steps, self.time.get());
        }
        Ok(())
    }

    /// Restores every signal to its initial snapshot, empties probe buffers,
    /// re-arms communication operators, and rewinds the clock.
    pub fn reset(&mut self, seed: u32) {
        self.store.restore(&self.initial);
        self.time.set(0.0);
        self.step_counter = 0;
        self.seed = seed;
        for probe in self.probes.values_mut() {
            probe.clear(false);
        }
        for op in &mut self.operators {
            op.reset();
        }
    }

    /// The in-memory samples of the probe under `key`.
    pub fn probe_data(&self, key: Key) -> Result<&[Tensor]> {
        self.probes
            .get(&key)
            .map(|probe| probe.samples())
            .ok_or_else(|| BuildError::UnknownProbe(key).into())
    }

    /// Clones every probe's in-memory samples, in key order.
    pub(crate) fn dump_probe_data(&self) -> Vec<(Key, Vec<Tensor>)> {
        self.probes
            .values()
            .map(|probe| (probe.key(), probe.samples().to_vec()))
            .collect()
    }

    fn flush_probes(&mut self, sink: &mut ActiveSink) -> Result<()> {
        match sink {
            ActiveSink::Off => Ok(()),
            ActiveSink::Worker => {
                let blocks: Vec<(Key, Vec<Tensor>)> = self
                    .probes
                    .values_mut()
                    .map(|probe| (probe.key(), probe.take_block()))
                    .collect();
                let frame = bincode::serialize(&blocks)?;
                self.fabric
                    .borrow_mut()
                    .post_control(0, frame)
                    .map_err(RuntimeError::Comm)?;
                Ok(())
            }
            ActiveSink::Writer(_) | ActiveSink::Draining => {
                let own: Vec<(Key, Vec<Tensor>)> = self
                    .probes
                    .values_mut()
                    .map(|probe| (probe.key(), probe.take_block()))
                    .collect();
                let mut failed = false;
                if let ActiveSink::Writer(writer) = &mut *sink {
                    failed = write_blocks(writer, &own);
                }
                // Peers ship exactly one frame per flush boundary; drain them
                // even when writing has failed so nobody blocks.
                let peers = self.n_procs;
                for peer in 1..peers {
                    let frame = self
                        .fabric
                        .borrow_mut()
                        .wait_control(peer)
                        .map_err(RuntimeError::Comm)?;
                    let blocks: Vec<(Key, Vec<Tensor>)> = bincode::deserialize(&frame)?;
                    if let ActiveSink::Writer(writer) = &mut *sink {
                        if !failed {
                            failed = write_blocks(writer, &blocks);
                        }
                    }
                }
                if failed {
                    *sink = ActiveSink::Draining;
                }
                Ok(())
            }
        }
    }

    fn validate_comm_tables(&mut self, specs: &[(OpIndex, OpSpec)]) -> Result<()> {
        let mut descriptors = Vec::new();
        for (_, spec) in specs {
            match spec {
                OpSpec::Send { target, tag, content, .. } => descriptors.push(CommDesc {
                    send: true,
                    rank: self.rank,
                    peer: *target,
                    tag: *tag,
                    len: content.len(),
                }),
                OpSpec::Recv { source, tag, content, .. } => descriptors.push(CommDesc {
                    send: false,
                    rank: self.rank,
                    peer: *source,
                    tag: *tag,
                    len: content.len(),
                }),
                _ => {}
            }
        }

        if self.n_procs == 1 {
            return match_comm_tables(&descriptors);
        }

        if self.rank == 0 {
            let mut all = descriptors;
            for peer in 1..self.n_procs {
                let frame = self
                    .fabric
                    .borrow_mut()
                    .wait_control(peer)
                    .map_err(RuntimeError::Comm)?;
                let mut remote: Vec<CommDesc> = bincode::deserialize(&frame)?;
                all.append(&mut remote);
            }
            let verdict = match_comm_tables(&all);
            let flag = if verdict.is_ok() { 0 } else { 1 };
            self.fabric
                .borrow_mut()
                .broadcast(0, flag)
                .map_err(RuntimeError::Comm)?;
            verdict
        } else {
            let frame = bincode::serialize(&descriptors)?;
            self.fabric
                .borrow_mut()
                .post_control(0, frame)
                .map_err(RuntimeError::Comm)?;
            let flag = self
                .fabric
                .borrow_mut()
                .broadcast(0, 0)
                .map_err(RuntimeError::Comm)?;
            if flag != 0 {
                return Err(BuildError::ValidationFailed.into());
            }
            Ok(())
        }
    }

    fn build_operator(&self, item: PendingOp) -> Result<Box<dyn Operator>> {
        match item {
            PendingOp::Spec(spec) => self.build_from_spec(spec),
            PendingOp::MergedSend { target, members } => {
                let segments = self.resolve_segments(&members)?;
                let endpoint = self
                    .fabric
                    .borrow_mut()
                    .sender(target, MERGED_TAG)
                    .map_err(|e| BuildError::Protocol(format!("{:#}", e)))?;
                Ok(Box::new(MergedSendOp::new(endpoint, segments)))
            }
            PendingOp::MergedRecv { source, members } => {
                let segments = self.resolve_segments(&members)?;
                let endpoint = self
                    .fabric
                    .borrow_mut()
                    .receiver(source, MERGED_TAG)
                    .map_err(|e| BuildError::Protocol(format!("{:#}", e)))?;
                Ok(Box::new(MergedRecvOp::new(endpoint, segments)))
            }
        }
    }

    fn resolve_segments(&self, members: &[(u32, ViewSpec)]) -> Result<Vec<ResolvedView>> {
        members.iter().map(|(_, spec)| self.store.view(spec)).collect()
    }

    fn build_from_spec(&self, spec: OpSpec) -> Result<Box<dyn Operator>> {
        match spec {
            OpSpec::Reset { dst, value, .. } => {
                Ok(Box::new(Reset::new(self.store.view(&dst)?, value)))
            }
            OpSpec::Copy { dst, src, .. } => {
                let dst = self.store.view(&dst)?;
                let src = self.store.view(&src)?;
                if (dst.shape1(), dst.shape2()) != (src.shape1(), src.shape2()) {
                    return Err(shape_mismatch("Copy", &[("dst", &dst), ("src", &src)]));
                }
                Ok(Box::new(Copy::new(dst, src)))
            }
            OpSpec::DotInc { a, x, y, .. } => {
                let a = self.store.view(&a)?;
                let x = self.store.view(&x)?;
                let y = self.store.view(&y)?;
                if a.shape1() != y.len() || a.shape2() != x.len() {
                    return Err(shape_mismatch("DotInc", &[("a", &a), ("x", &x), ("y", &y)]));
                }
                Ok(Box::new(DotInc::new(a, x, y)))
            }
            OpSpec::ScalarDotInc { a, x, y, .. } => {
                let a = self.store.view(&a)?;
                let x = self.store.view(&x)?;
                let y = self.store.view(&y)?;
                if a.len() != 1 || x.len() != y.len() {
                    return Err(shape_mismatch("ScalarDotInc", &[("a", &a), ("x", &x), ("y", &y)]));
                }
                Ok(Box::new(ScalarDotInc::new(a, x, y)))
            }
            OpSpec::ProdUpdate { a, x, b, y, .. } => {
                let a = self.store.view(&a)?;
                let x = self.store.view(&x)?;
                let b = self.store.view(&b)?;
                let y = self.store.view(&y)?;
                if a.shape1() != y.len() || a.shape2() != x.len() || b.len() != y.len() {
                    return Err(shape_mismatch(
                        "ProdUpdate",
                        &[("a", &a), ("x", &x), ("b", &b), ("y", &y)],
                    ));
                }
                Ok(Box::new(ProdUpdate::new(a, x, b, y)))
            }
            OpSpec::ScalarProdUpdate { a, x, b, y, .. } => {
                let a = self.store.view(&a)?;
                let x = self.store.view(&x)?;
                let b = self.store.view(&b)?;
                let y = self.store.view(&y)?;
                if a.len() != 1 || b.len() != 1 || x.len() != y.len() {
                    return Err(shape_mismatch(
                        "ScalarProdUpdate",
                        &[("a", &a), ("x", &x), ("b", &b), ("y", &y)],
                    ));
                }
                Ok(Box::new(ScalarProdUpdate::new(a, x, b, y)))
            }
            OpSpec::Filter { input, output, numer, denom, .. } => {
                let input = self.store.view(&input)?;
                let output = self.store.view(&output)?;
                if input.len() != output.len() {
                    return Err(shape_mismatch("Filter", &[("input", &input), ("output", &output)]));
                }
                Ok(Box::new(Filter::new(input, output, numer, denom)?))
            }
            OpSpec::SimLif { n, tau_rc, tau_ref, j, out, .. } => {
                let j = self.store.view(&j)?;
                let out = self.store.view(&out)?;
                if j.len() != n || out.len() != n {
                    return Err(shape_mismatch("SimLIF", &[("j", &j), ("out", &out)]));
                }
                Ok(Box::new(SimLif::new(n, tau_rc, tau_ref, self.dt, j, out)))
            }
            OpSpec::SimLifRate { n, tau_rc, tau_ref, j, out, .. } => {
                let j = self.store.view(&j)?;
                let out = self.store.view(&out)?;
                if j.len() != n || out.len() != n {
                    return Err(shape_mismatch("SimLIFRate", &[("j", &j), ("out", &out)]));
                }
                Ok(Box::new(SimLifRate::new(n, tau_rc, tau_ref, j, out)))
            }
            OpSpec::HostCallback { fn_ref, want_time, input, output, .. } => {
                if !self.registry.borrow().contains(fn_ref) {
                    return Err(BuildError::UnknownCallback(fn_ref).into());
                }
                let input = input.as_ref().map(|spec| self.store.view(spec)).transpose()?;
                let output = self.store.view(&output)?;
                Ok(Box::new(HostCallback::new(
                    fn_ref,
                    Rc::clone(&self.registry),
                    want_time,
                    Rc::clone(&self.time),
                    input,
                    output,
                )))
            }
            OpSpec::Send { target, tag, content, .. } => {
                let content = self.store.view(&content)?;
                let endpoint = self
                    .fabric
                    .borrow_mut()
                    .sender(target, tag)
                    .map_err(|e| BuildError::Protocol(format!("{:#}", e)))?;
                Ok(Box::new(SendOp::new(endpoint, content)))
            }
            OpSpec::Recv { source, tag, content, .. } => {
                let content = self.store.view(&content)?;
                let endpoint = self
                    .fabric
                    .borrow_mut()
                    .receiver(source, tag)
                    .map_err(|e| BuildError::Protocol(format!("{:#}", e)))?;
                Ok(Box::new(RecvOp::new(endpoint, content)))
            }
        }
    }
}

fn shape_mismatch(op: &str, operands: &[(&str, &ResolvedView)]) -> crate::error::Error {
    let described: Vec<String> = operands
        .iter()
        .map(|(name, view)| format!("{} {}x{}", name, view.shape1(), view.shape2()))
        .collect();
    BuildError::ShapeMismatch(format!("{}: {}", op, described.join(", "))).into()
}

fn write_blocks(writer: &mut LogWriter, blocks: &[(Key, Vec<Tensor>)]) -> bool {
    for (key, block) in blocks {
        if let Err(error) = writer.append_block(*key, block) {
            log::warn!("probe log disabled: write failed: {}", error);
            return true;
        }
    }
    false
}

/// Groups send (receive) specs by peer into one composite per direction,
/// scheduled at the latest (earliest) index of the group's members. Segment
/// order inside a composite follows the original tags, so both sides of a
/// pair agree on the layout.
fn merge_comm_specs(specs: Vec<(OpIndex, OpSpec)>) -> Vec<(OpIndex, PendingOp)> {
    let mut pending: Vec<(OpIndex, PendingOp)> = Vec::with_capacity(specs.len());
    let mut sends: BTreeMap<usize, (OpIndex, Vec<(u32, ViewSpec)>)> = BTreeMap::new();
    let mut recvs: BTreeMap<usize, (OpIndex, Vec<(u32, ViewSpec)>)> = BTreeMap::new();

    for (index, spec) in specs {
        match spec {
            OpSpec::Send { target, tag, content, .. } => {
                let entry = sends.entry(target).or_insert((index, Vec::new()));
                if index > entry.0 {
                    entry.0 = index;
                }
                entry.1.push((tag, content));
            }
            OpSpec::Recv { source, tag, content, .. } => {
                let entry = recvs.entry(source).or_insert((index, Vec::new()));
                if index < entry.0 {
                    entry.0 = index;
                }
                entry.1.push((tag, content));
            }
            other => pending.push((index, PendingOp::Spec(other))),
        }
    }

    for (target, (index, mut members)) in sends {
        members.sort_by_key(|(tag, _)| *tag);
        pending.push((index, PendingOp::MergedSend { target, members }));
    }
    for (source, (index, mut members)) in recvs {
        members.sort_by_key(|(tag, _)| *tag);
        pending.push((index, PendingOp::MergedRecv { source, members }));
    }

    pending.sort_by(|a, b| a.0.cmp(&b.0));
    pending
}

/// Checks the mirror-image property of the union of all processes' tables:
/// every send has exactly one matching receive with the same element count,
/// and vice versa.
fn match_comm_tables(descriptors: &[CommDesc]) -> Result<()> {
    let mut sends: HashMap<(usize, usize, u32), usize> = HashMap::new();
    let mut recvs: HashMap<(usize, usize, u32), usize> = HashMap::new();
    for desc in descriptors {
        let table = if desc.send { &mut sends } else { &mut recvs };
        if table.insert((desc.rank, desc.peer, desc.tag), desc.len).is_some() {
            return Err(BuildError::Protocol(format!(
                "duplicate tag {} between processes {} and {}",
                desc.tag, desc.rank, desc.peer
            ))
            .into());
        }
    }

    for (&(rank, peer, tag), &send_len) in &sends {
        match recvs.get(&(peer, rank, tag)) {
            None => {
                return Err(BuildError::MissingPeer { expected: "recv", peer, tag }.into());
            }
            Some(&recv_len) if recv_len != send_len => {
                return Err(BuildError::CountMismatch { peer, tag, send_len, recv_len }.into());
            }
            Some(_) => {}
        }
    }
    for (&(rank, peer, tag), _) in &recvs {
        if !sends.contains_key(&(peer, rank, tag)) {
            return Err(BuildError::MissingPeer { expected: "send", peer, tag }.into());
        }
    }
    Ok(())
}
