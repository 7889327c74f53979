//! A generic fabric, wrapping the known implementors of `Fabric`.
//!
//! This type is useful in settings where it is difficult to write code
//! generic in `F: Fabric`, for example worker closures whose type arguments
//! must be specified.

use super::{ClusterBuilder, ClusterFabric, Fabric, ProcessBuilder, ProcessFabric, RecvEndpoint, SendEndpoint, Tag, ThreadBuilder, ThreadFabric};
use crate::Result;

/// Enumerates known implementors of `Fabric`.
/// Passes trait method calls on to members.
pub enum Generic {
    /// Single-process loopback fabric.
    Thread(ThreadFabric),
    /// Inter-thread, intra-process fabric.
    Process(ProcessFabric),
    /// Inter-process socket fabric.
    Cluster(ClusterFabric),
}

impl Fabric for Generic {
    fn index(&self) -> usize {
        match self {
            Generic::Thread(t) => t.index(),
            Generic::Process(p) => p.index(),
            Generic::Cluster(c) => c.index(),
        }
    }

    fn peers(&self) -> usize {
        match self {
            Generic::Thread(t) => t.peers(),
            Generic::Process(p) => p.peers(),
            Generic::Cluster(c) => c.peers(),
        }
    }

    fn sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        match self {
            Generic::Thread(t) => t.sender(target, tag),
            Generic::Process(p) => p.sender(target, tag),
            Generic::Cluster(c) => c.sender(target, tag),
        }
    }

    fn receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        match self {
            Generic::Thread(t) => t.receiver(source, tag),
            Generic::Process(p) => p.receiver(source, tag),
            Generic::Cluster(c) => c.receiver(source, tag),
        }
    }

    fn post_control(&mut self, target: usize, frame: Vec<u8>) -> Result<()> {
        match self {
            Generic::Thread(t) => t.post_control(target, frame),
            Generic::Process(p) => p.post_control(target, frame),
            Generic::Cluster(c) => c.post_control(target, frame),
        }
    }

    fn wait_control(&mut self, source: usize) -> Result<Vec<u8>> {
        match self {
            Generic::Thread(t) => t.wait_control(source),
            Generic::Process(p) => p.wait_control(source),
            Generic::Cluster(c) => c.wait_control(source),
        }
    }

    fn barrier(&mut self) -> Result<()> {
        match self {
            Generic::Thread(t) => t.barrier(),
            Generic::Process(p) => p.barrier(),
            Generic::Cluster(c) => c.barrier(),
        }
    }

    fn broadcast(&mut self, root: usize, value: i64) -> Result<i64> {
        match self {
            Generic::Thread(t) => t.broadcast(root, value),
            Generic::Process(p) => p.broadcast(root, value),
            Generic::Cluster(c) => c.broadcast(root, value),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        match self {
            Generic::Thread(t) => t.shutdown(),
            Generic::Process(p) => p.shutdown(),
            Generic::Cluster(c) => c.shutdown(),
        }
    }
}

/// Enumerations of constructable implementors of `Fabric`.
///
/// The builder variants are `Send`, so that they can be moved across threads,
/// whereas the fabric they construct may hold thread-local state and is built
/// on the owning thread.
pub enum GenericBuilder {
    /// Builder for the `Thread` fabric.
    Thread(ThreadBuilder),
    /// Builder for the `Process` fabric.
    Process(ProcessBuilder),
    /// Builder for the `Cluster` fabric.
    Cluster(ClusterBuilder),
}

impl GenericBuilder {
    /// Constructs the fabric, spawning communication threads if needed.
    pub fn build(self) -> Result<Generic> {
        match self {
            GenericBuilder::Thread(t) => Ok(Generic::Thread(t.build())),
            GenericBuilder::Process(p) => Ok(Generic::Process(p.build())),
            GenericBuilder::Cluster(c) => Ok(Generic::Cluster(c.build()?)),
        }
    }
}
