//! Fabric implementations and the channel endpoints they hand out.

pub mod cluster;
pub mod generic;
pub mod process;
pub mod thread;

pub use self::cluster::{ClusterBuilder, ClusterFabric};
pub use self::generic::{Generic, GenericBuilder};
pub use self::process::{ProcessBuilder, ProcessFabric};
pub use self::thread::{ThreadBuilder, ThreadFabric};

use anyhow::{anyhow, bail, Context};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::networking::MessageHeader;
use crate::Result;

/// Identifier disambiguating channels between the same pair of processes.
pub type Tag = u32;

/// Items queued at a cluster send thread.
pub(crate) enum SendItem {
    /// A framed payload to write out.
    Message(MessageHeader, Vec<u8>),
    /// Ends the stream: write the shutdown header, flush, exit.
    Shutdown,
}

enum SendKind {
    /// Delivery into an in-process mailbox.
    Local(Sender<Vec<u8>>),
    /// Delivery through a socket send thread.
    Remote(Sender<SendItem>),
}

/// The sending half of a point-to-point channel.
///
/// Posting is non-blocking: ownership of the payload moves to the fabric, so
/// the caller's buffers are immediately reusable and nothing downstream can
/// observe a partially written message.
pub struct SendEndpoint {
    header: MessageHeader,
    kind: SendKind,
}

impl SendEndpoint {
    pub(crate) fn local(source: usize, tag: Tag, channel: Sender<Vec<u8>>) -> Self {
        SendEndpoint {
            header: MessageHeader { source: source as u32, tag, length: 0 },
            kind: SendKind::Local(channel),
        }
    }

    pub(crate) fn remote(source: usize, tag: Tag, queue: Sender<SendItem>) -> Self {
        SendEndpoint {
            header: MessageHeader { source: source as u32, tag, length: 0 },
            kind: SendKind::Remote(queue),
        }
    }

    /// The tag this endpoint sends on.
    pub fn tag(&self) -> Tag {
        self.header.tag
    }

    /// Posts a payload.
    pub fn post(&mut self, payload: Vec<u8>) -> Result<()> {
        match &self.kind {
            SendKind::Local(channel) => channel
                .send(payload)
                .map_err(|_| anyhow!("peer mailbox closed (tag {})", self.header.tag)),
            SendKind::Remote(queue) => {
                let mut header = self.header;
                header.length = payload.len() as u32;
                queue
                    .send(SendItem::Message(header, payload))
                    .map_err(|_| anyhow!("send thread gone (tag {})", self.header.tag))
            }
        }
    }

    /// Packs `data` little-endian and posts it.
    pub fn post_f64(&mut self, data: &[f64]) -> Result<()> {
        let mut bytes = Vec::with_capacity(8 * data.len());
        for &x in data {
            // Writes to a Vec<u8> do not fail.
            bytes.write_f64::<LittleEndian>(x).expect("write to Vec failed");
        }
        self.post(bytes)
    }
}

/// The receiving half of a point-to-point channel.
pub struct RecvEndpoint {
    source: usize,
    tag: Tag,
    channel: Receiver<Vec<u8>>,
}

impl RecvEndpoint {
    pub(crate) fn new(source: usize, tag: Tag, channel: Receiver<Vec<u8>>) -> Self {
        RecvEndpoint { source, tag, channel }
    }

    /// Index of the sending process.
    pub fn source(&self) -> usize {
        self.source
    }

    /// The tag this endpoint receives on.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Blocks until the next payload arrives.
    pub fn wait(&mut self) -> Result<Vec<u8>> {
        self.channel
            .recv()
            .with_context(|| format!("channel from process {} (tag {}) closed", self.source, self.tag))
    }

    /// Blocks until the next payload arrives and unpacks little-endian f64s
    /// into `out`, reusing its capacity.
    pub fn wait_f64(&mut self, out: &mut Vec<f64>) -> Result<()> {
        let bytes = self.wait()?;
        if bytes.len() % 8 != 0 {
            bail!(
                "payload from process {} (tag {}) has {} bytes, not a multiple of 8",
                self.source,
                self.tag,
                bytes.len()
            );
        }
        out.clear();
        let mut slice = &bytes[..];
        while !slice.is_empty() {
            out.push(slice.read_f64::<LittleEndian>()?);
        }
        Ok(())
    }

    /// Discards payloads that have arrived but were never waited on.
    ///
    /// Returns the number of discarded payloads.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.channel.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}

/// A lazily allocated in-process channel whose receiving half may be taken
/// exactly once.
pub(crate) struct ChannelEntry {
    tx: Sender<Vec<u8>>,
    rx: Option<Receiver<Vec<u8>>>,
}

impl ChannelEntry {
    pub(crate) fn new() -> Self {
        let (tx, rx) = unbounded();
        ChannelEntry { tx, rx: Some(rx) }
    }

    pub(crate) fn sender(&self) -> Sender<Vec<u8>> {
        self.tx.clone()
    }

    pub(crate) fn take_receiver(&mut self) -> Option<Receiver<Vec<u8>>> {
        self.rx.take()
    }
}

/// The interface a simulation process has to its peers.
///
/// Implementations hand out channel endpoints keyed by `(peer, tag)` and
/// provide the collectives a globally stepped loop relies on. Every process
/// is expected to perform the same sequence of collective calls; things go
/// wrong otherwise.
pub trait Fabric {
    /// The index of this process out of `0..self.peers()`.
    fn index(&self) -> usize;

    /// The number of processes.
    fn peers(&self) -> usize;

    /// Constructs the sending half of the channel `(self -> target, tag)`.
    fn sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint>;

    /// Constructs the receiving half of the channel `(source -> self, tag)`.
    ///
    /// Each receiving half may be constructed at most once.
    fn receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint>;

    /// Posts a control frame to `target`.
    fn post_control(&mut self, target: usize, frame: Vec<u8>) -> Result<()>;

    /// Blocks until the next control frame from `source`.
    fn wait_control(&mut self, source: usize) -> Result<Vec<u8>>;

    /// Blocks until every process has reached the barrier.
    fn barrier(&mut self) -> Result<()>;

    /// Distributes `value` from `root` to every process; returns the value.
    fn broadcast(&mut self, root: usize, value: i64) -> Result<i64>;

    /// Releases fabric resources. Idempotent.
    fn shutdown(&mut self) -> Result<()>;
}

/// A barrier built from control frames: everyone reports to `root`, which
/// releases everyone once all reports are in.
pub(crate) fn token_barrier<F: Fabric + ?Sized>(fabric: &mut F) -> Result<()> {
    let index = fabric.index();
    let peers = fabric.peers();
    if peers == 1 {
        return Ok(());
    }
    if index == 0 {
        for peer in 1..peers {
            fabric.wait_control(peer).context("collecting barrier token")?;
        }
        for peer in 1..peers {
            fabric.post_control(peer, vec![0])?;
        }
    } else {
        fabric.post_control(0, vec![0])?;
        fabric.wait_control(0).context("awaiting barrier release")?;
    }
    Ok(())
}

/// A broadcast built from control frames: `root` fans the value out and
/// everyone else blocks for it.
pub(crate) fn control_broadcast<F: Fabric + ?Sized>(fabric: &mut F, root: usize, value: i64) -> Result<i64> {
    if fabric.peers() == 1 {
        return Ok(value);
    }
    if fabric.index() == root {
        let mut frame = [0u8; 8];
        LittleEndian::write_i64(&mut frame, value);
        for peer in 0..fabric.peers() {
            if peer != root {
                fabric.post_control(peer, frame.to_vec())?;
            }
        }
        Ok(value)
    } else {
        let frame = fabric.wait_control(root).context("awaiting broadcast")?;
        if frame.len() != 8 {
            bail!("broadcast frame has {} bytes, expected 8", frame.len());
        }
        Ok(LittleEndian::read_i64(&frame))
    }
}
