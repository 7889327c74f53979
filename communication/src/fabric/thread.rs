//! A fabric for a single process talking only to itself.

use std::collections::HashMap;

use anyhow::bail;
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{ChannelEntry, Fabric, RecvEndpoint, SendEndpoint, Tag};
use crate::Result;

/// Builder for the single-process fabric.
pub struct ThreadBuilder;

impl ThreadBuilder {
    /// Constructs the fabric.
    pub fn build(self) -> ThreadFabric {
        let (control_tx, control_rx) = unbounded();
        ThreadFabric {
            channels: HashMap::new(),
            control_tx,
            control_rx,
        }
    }
}

/// A fabric with one process and loopback channels.
///
/// Self-directed channels are permitted so a network built for many
/// processes still runs when mapped onto one.
pub struct ThreadFabric {
    channels: HashMap<Tag, ChannelEntry>,
    control_tx: Sender<Vec<u8>>,
    control_rx: Receiver<Vec<u8>>,
}

impl ThreadFabric {
    fn entry(&mut self, tag: Tag) -> &mut ChannelEntry {
        self.channels.entry(tag).or_insert_with(ChannelEntry::new)
    }
}

impl Fabric for ThreadFabric {
    fn index(&self) -> usize {
        0
    }

    fn peers(&self) -> usize {
        1
    }

    fn sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        if target != 0 {
            bail!("no such process: {}", target);
        }
        Ok(SendEndpoint::local(0, tag, self.entry(tag).sender()))
    }

    fn receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        if source != 0 {
            bail!("no such process: {}", source);
        }
        match self.entry(tag).take_receiver() {
            Some(channel) => Ok(RecvEndpoint::new(0, tag, channel)),
            None => bail!("channel (source 0, tag {}) already consumed", tag),
        }
    }

    fn post_control(&mut self, target: usize, frame: Vec<u8>) -> Result<()> {
        if target != 0 {
            bail!("no such process: {}", target);
        }
        self.control_tx.send(frame).expect("control loopback closed");
        Ok(())
    }

    fn wait_control(&mut self, source: usize) -> Result<Vec<u8>> {
        if source != 0 {
            bail!("no such process: {}", source);
        }
        Ok(self.control_rx.recv()?)
    }

    fn barrier(&mut self) -> Result<()> {
        Ok(())
    }

    fn broadcast(&mut self, _root: usize, value: i64) -> Result<i64> {
        Ok(value)
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
