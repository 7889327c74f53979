//! A fabric for several simulation processes running as threads of one OS
//! process, exchanging payloads through a shared channel registry.

use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};

use anyhow::{anyhow, bail};

use super::{control_broadcast, ChannelEntry, Fabric, RecvEndpoint, SendEndpoint, Tag};
use crate::{Result, CONTROL_TAG};

type SharedRegistry = Arc<Mutex<HashMap<(usize, usize, Tag), ChannelEntry>>>;

/// Builder for one member of an intra-process fabric.
///
/// Builders are `Send` so each can move to its own thread; the fabric itself
/// is constructed there.
pub struct ProcessBuilder {
    index: usize,
    peers: usize,
    registry: SharedRegistry,
    barrier: Arc<Barrier>,
}

impl ProcessBuilder {
    /// Allocates a list of connected intra-process fabric builders.
    pub fn new_vector(peers: usize) -> Vec<ProcessBuilder> {
        let registry: SharedRegistry = Arc::new(Mutex::new(HashMap::new()));
        let barrier = Arc::new(Barrier::new(peers));
        (0..peers)
            .map(|index| ProcessBuilder {
                index,
                peers,
                registry: Arc::clone(&registry),
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }

    /// Constructs the fabric.
    pub fn build(self) -> ProcessFabric {
        let peers = self.peers;
        ProcessFabric {
            index: self.index,
            peers,
            registry: self.registry,
            barrier: self.barrier,
            control_tx: (0..peers).map(|_| None).collect(),
            control_rx: (0..peers).map(|_| None).collect(),
        }
    }
}

/// One member of an intra-process fabric.
pub struct ProcessFabric {
    index: usize,
    peers: usize,
    registry: SharedRegistry,
    barrier: Arc<Barrier>,
    control_tx: Vec<Option<SendEndpoint>>,
    control_rx: Vec<Option<RecvEndpoint>>,
}

impl ProcessFabric {
    fn channel_sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        if target >= self.peers {
            bail!("no such process: {} (peers: {})", target, self.peers);
        }
        let mut registry = self.registry.lock().expect("poisoned registry");
        let entry = registry
            .entry((self.index, target, tag))
            .or_insert_with(ChannelEntry::new);
        Ok(SendEndpoint::local(self.index, tag, entry.sender()))
    }

    fn channel_receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        if source >= self.peers {
            bail!("no such process: {} (peers: {})", source, self.peers);
        }
        let mut registry = self.registry.lock().expect("poisoned registry");
        let entry = registry
            .entry((source, self.index, tag))
            .or_insert_with(ChannelEntry::new);
        let channel = entry
            .take_receiver()
            .ok_or_else(|| anyhow!("channel (source {}, tag {}) already consumed", source, tag))?;
        Ok(RecvEndpoint::new(source, tag, channel))
    }

    fn control_sender(&mut self, target: usize) -> Result<&mut SendEndpoint> {
        if self.control_tx[target].is_none() {
            let endpoint = self.channel_sender(target, CONTROL_TAG)?;
            self.control_tx[target] = Some(endpoint);
        }
        Ok(self.control_tx[target].as_mut().expect("just installed"))
    }

    fn control_receiver(&mut self, source: usize) -> Result<&mut RecvEndpoint> {
        if self.control_rx[source].is_none() {
            let endpoint = self.channel_receiver(source, CONTROL_TAG)?;
            self.control_rx[source] = Some(endpoint);
        }
        Ok(self.control_rx[source].as_mut().expect("just installed"))
    }
}

impl Fabric for ProcessFabric {
    fn index(&self) -> usize {
        self.index
    }

    fn peers(&self) -> usize {
        self.peers
    }

    fn sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        self.channel_sender(target, tag)
    }

    fn receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        self.channel_receiver(source, tag)
    }

    fn post_control(&mut self, target: usize, frame: Vec<u8>) -> Result<()> {
        self.control_sender(target)?.post(frame)
    }

    fn wait_control(&mut self, source: usize) -> Result<Vec<u8>> {
        self.control_receiver(source)?.wait()
    }

    fn barrier(&mut self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn broadcast(&mut self, root: usize, value: i64) -> Result<i64> {
        control_broadcast(self, root, value)
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn payloads_cross_threads() {
        let mut builders = ProcessBuilder::new_vector(2);
        let second = builders.pop().expect("two builders");
        let first = builders.pop().expect("two builders");

        let guard = thread::spawn(move || {
            let mut fabric = second.build();
            let mut from_zero = fabric.receiver(0, 7).unwrap();
            let payload = from_zero.wait().unwrap();
            assert_eq!(payload, vec![1, 2, 3]);
            fabric.barrier().unwrap();
        });

        let mut fabric = first.build();
        let mut to_one = fabric.sender(1, 7).unwrap();
        to_one.post(vec![1, 2, 3]).unwrap();
        fabric.barrier().unwrap();
        guard.join().expect("peer thread panicked");
    }

    #[test]
    fn broadcast_reaches_all() {
        let mut builders = ProcessBuilder::new_vector(2);
        let second = builders.pop().expect("two builders");
        let first = builders.pop().expect("two builders");

        let guard = thread::spawn(move || {
            let mut fabric = second.build();
            assert_eq!(fabric.broadcast(0, 0).unwrap(), 41);
        });

        let mut fabric = first.build();
        assert_eq!(fabric.broadcast(0, 41).unwrap(), 41);
        guard.join().expect("peer thread panicked");
    }

    #[test]
    fn receiver_consumed_once() {
        let mut builders = ProcessBuilder::new_vector(1);
        let mut fabric = builders.pop().expect("one builder").build();
        fabric.receiver(0, 3).unwrap();
        assert!(fabric.receiver(0, 3).is_err());
    }
}
