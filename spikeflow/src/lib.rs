//! Distributed, globally stepped simulation of operator networks.
//!
//! A network is a dataflow graph of numeric operators over named signals,
//! partitioned into one *chunk* per process. Each timestep every chunk runs
//! its operators in a fixed schedule order; communication operators exchange
//! signal contents with peer chunks through a message-passing fabric with
//! exactly one step of latency per link; probes snapshot signal views on a
//! period and spill to a columnar log sink.
//!
//! The main entry points:
//!
//! - [`execute_directly`] runs a single-process simulation on the current
//!   thread;
//! - [`execute`] builds a fabric from a [`Config`] (threads of one OS
//!   process, or one process per machine slot over sockets), runs the master
//!   closure on process 0 and [`worker`] loops everywhere else;
//! - [`Simulator`] is the master-side surface: `add_signal`, `add_op`,
//!   `add_probe`, `finalize_build`, `run_n_steps`, `probe_data`, `reset`,
//!   `close`.
//!
//! Determinism is a correctness requirement: operator order within a chunk
//! is the builder-assigned index order with insertion-order ties, and a
//! network run twice from the same build produces bit-identical probe
//! output.

pub mod build;
pub mod chunk;
pub mod error;
pub mod execute;
pub mod logsink;
pub mod operator;
pub mod probe;
pub mod signal;
pub mod simulator;

pub use chunk::{Chunk, LogMode, BARRIER_PERIOD, DEFAULT_FLUSH_PROBES_EVERY};
pub use error::{BuildError, Error, Result, RuntimeError};
pub use execute::{execute, execute_directly, execute_with_callbacks};
pub use operator::{OpSpec, Operator};
pub use probe::Probe;
pub use signal::{Key, Tensor, ViewSpec};
pub use simulator::{worker, SimOptions, Simulator};

pub use spikeflow_communication as communication;
pub use spikeflow_communication::Config;
