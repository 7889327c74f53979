//! A message-passing fabric for bulk-synchronous distributed simulations.
//!
//! This crate is the communication layer of the spikeflow system, separated
//! out to keep a clear boundary between moving bytes and stepping operators.
//! It provides point-to-point channels between simulation processes, keyed by
//! a `(peer, tag)` pair, plus the small set of collectives a globally stepped
//! loop relies on: a barrier, an integer broadcast, and a control plane of
//! framed byte messages.
//!
//! Three fabrics implement the same [`Fabric`] interface:
//!
//! - [`fabric::ThreadFabric`] — a single process with loopback channels;
//! - [`fabric::ProcessFabric`] — several simulation processes as threads of
//!   one OS process, exchanging payloads through shared channel registries;
//! - [`fabric::ClusterFabric`] — one process per machine slot, exchanging
//!   framed payloads over a TCP socket mesh with one send and one receive
//!   thread per remote peer.
//!
//! The [`Generic`] enum unifies the three so downstream code need not be
//! generic over the fabric. A [`Config`] describes which fabric to build and
//! can be parsed from command-line arguments.
//!
//! Channels are FIFO and unbounded. A posted payload transfers ownership to
//! the fabric, so the caller's buffers are immediately reusable; the matching
//! [`fabric::RecvEndpoint::wait`] blocks until the payload crosses.

pub mod fabric;
pub mod initialize;
pub mod networking;

pub use fabric::{Fabric, Generic, GenericBuilder, RecvEndpoint, SendEndpoint, Tag};
pub use initialize::Config;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Tag reserved for collectives and control frames.
pub const CONTROL_TAG: Tag = u32::MAX;

/// Tag reserved for the per-peer-pair merged data channel.
pub const MERGED_TAG: Tag = u32::MAX - 1;

/// Tag reserved for the end-of-stream header written at shutdown.
pub const SHUTDOWN_TAG: Tag = u32::MAX - 2;

/// Highest tag available to user channels.
pub const MAX_USER_TAG: Tag = u32::MAX - 3;
