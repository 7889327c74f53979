//! A fabric for one process per machine slot, exchanging framed payloads over
//! a TCP socket mesh with one send and one receive thread per remote peer.

use std::collections::{HashMap, VecDeque};
use std::io::{BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context};
use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{control_broadcast, token_barrier, ChannelEntry, Fabric, RecvEndpoint, SendEndpoint, SendItem, Tag};
use crate::networking::{create_sockets, MessageHeader};
use crate::{Result, CONTROL_TAG, SHUTDOWN_TAG};

#[derive(Default)]
struct RouterState {
    routes: HashMap<(usize, Tag), Sender<Vec<u8>>>,
    pending: HashMap<(usize, Tag), VecDeque<Vec<u8>>>,
}

/// Builder for one process of a socket-mesh fabric.
pub struct ClusterBuilder {
    index: usize,
    peers: usize,
    sockets: Vec<Option<TcpStream>>,
}

impl ClusterBuilder {
    /// Establishes the socket mesh described by `addresses`.
    ///
    /// Blocks until every pairwise connection is up.
    pub fn connect(addresses: Vec<String>, my_index: usize) -> Result<ClusterBuilder> {
        let peers = addresses.len();
        let sockets = create_sockets(addresses, my_index).context("establishing socket mesh")?;
        Ok(ClusterBuilder { index: my_index, peers, sockets })
    }

    /// Spawns the per-peer send and receive threads and constructs the fabric.
    pub fn build(self) -> Result<ClusterFabric> {
        let router: Arc<Mutex<RouterState>> = Arc::new(Mutex::new(RouterState::default()));
        let mut send_queues: Vec<Option<Sender<SendItem>>> = (0..self.peers).map(|_| None).collect();
        let mut guards = Vec::with_capacity(2 * self.peers);

        for (peer, socket) in self.sockets.into_iter().enumerate() {
            let stream = match socket {
                Some(stream) => stream,
                None => continue,
            };
            let reader = stream.try_clone().context("cloning stream")?;
            let (queue_tx, queue_rx) = unbounded();
            send_queues[peer] = Some(queue_tx);

            let index = self.index;
            guards.push(
                thread::Builder::new()
                    .name(format!("spikeflow:send-{}", peer))
                    .spawn(move || {
                        if let Err(error) = send_loop(stream, queue_rx, index) {
                            log::error!("process {}: send thread for peer {} failed: {:#}", index, peer, error);
                        }
                    })
                    .context("spawning send thread")?,
            );

            let shared = Arc::clone(&router);
            guards.push(
                thread::Builder::new()
                    .name(format!("spikeflow:recv-{}", peer))
                    .spawn(move || {
                        if let Err(error) = recv_loop(reader, shared, peer) {
                            log::error!("process {}: recv thread for peer {} failed: {:#}", index, peer, error);
                        }
                    })
                    .context("spawning recv thread")?,
            );
        }

        Ok(ClusterFabric {
            index: self.index,
            peers: self.peers,
            send_queues,
            router,
            loopback: HashMap::new(),
            control_tx: (0..self.peers).map(|_| None).collect(),
            control_rx: (0..self.peers).map(|_| None).collect(),
            guards,
            down: false,
        })
    }
}

/// One process of a socket-mesh fabric.
pub struct ClusterFabric {
    index: usize,
    peers: usize,
    send_queues: Vec<Option<Sender<SendItem>>>,
    router: Arc<Mutex<RouterState>>,
    loopback: HashMap<Tag, ChannelEntry>,
    control_tx: Vec<Option<SendEndpoint>>,
    control_rx: Vec<Option<RecvEndpoint>>,
    guards: Vec<JoinHandle<()>>,
    down: bool,
}

impl ClusterFabric {
    fn loopback_entry(&mut self, tag: Tag) -> &mut ChannelEntry {
        self.loopback.entry(tag).or_insert_with(ChannelEntry::new)
    }

    fn make_sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        if target >= self.peers {
            bail!("no such process: {} (peers: {})", target, self.peers);
        }
        if target == self.index {
            let index = self.index;
            return Ok(SendEndpoint::local(index, tag, self.loopback_entry(tag).sender()));
        }
        let queue = self.send_queues[target]
            .as_ref()
            .ok_or_else(|| anyhow!("send thread for peer {} gone", target))?;
        Ok(SendEndpoint::remote(self.index, tag, queue.clone()))
    }

    fn make_receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        if source >= self.peers {
            bail!("no such process: {} (peers: {})", source, self.peers);
        }
        if source == self.index {
            let index = self.index;
            return match self.loopback_entry(tag).take_receiver() {
                Some(channel) => Ok(RecvEndpoint::new(index, tag, channel)),
                None => bail!("channel (source {}, tag {}) already consumed", source, tag),
            };
        }
        let (tx, rx) = unbounded();
        let key = (source, tag);
        let mut state = self.router.lock().expect("poisoned router");
        if state.routes.contains_key(&key) {
            bail!("channel (source {}, tag {}) already consumed", source, tag);
        }
        // Deliveries that raced ahead of registration are staged; hand them
        // over before new ones arrive so FIFO order holds.
        if let Some(mut staged) = state.pending.remove(&key) {
            for payload in staged.drain(..) {
                tx.send(payload).expect("fresh channel closed");
            }
        }
        state.routes.insert(key, tx);
        Ok(RecvEndpoint::new(source, tag, rx))
    }

    fn control_sender(&mut self, target: usize) -> Result<&mut SendEndpoint> {
        if self.control_tx[target].is_none() {
            let endpoint = self.make_sender(target, CONTROL_TAG)?;
            self.control_tx[target] = Some(endpoint);
        }
        Ok(self.control_tx[target].as_mut().expect("just installed"))
    }

    fn control_receiver(&mut self, source: usize) -> Result<&mut RecvEndpoint> {
        if self.control_rx[source].is_none() {
            let endpoint = self.make_receiver(source, CONTROL_TAG)?;
            self.control_rx[source] = Some(endpoint);
        }
        Ok(self.control_rx[source].as_mut().expect("just installed"))
    }
}

impl Fabric for ClusterFabric {
    fn index(&self) -> usize {
        self.index
    }

    fn peers(&self) -> usize {
        self.peers
    }

    fn sender(&mut self, target: usize, tag: Tag) -> Result<SendEndpoint> {
        self.make_sender(target, tag)
    }

    fn receiver(&mut self, source: usize, tag: Tag) -> Result<RecvEndpoint> {
        self.make_receiver(source, tag)
    }

    fn post_control(&mut self, target: usize, frame: Vec<u8>) -> Result<()> {
        self.control_sender(target)?.post(frame)
    }

    fn wait_control(&mut self, source: usize) -> Result<Vec<u8>> {
        self.control_receiver(source)?.wait()
    }

    fn barrier(&mut self) -> Result<()> {
        token_barrier(self)
    }

    fn broadcast(&mut self, root: usize, value: i64) -> Result<i64> {
        control_broadcast(self, root, value)
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.down {
            return Ok(());
        }
        self.down = true;
        for queue in self.send_queues.iter().flatten() {
            // A failed enqueue means the thread already exited; joining below
            // will surface whatever it logged.
            let _ = queue.send(SendItem::Shutdown);
        }
        for guard in self.guards.drain(..) {
            if guard.join().is_err() {
                bail!("communication thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for ClusterFabric {
    fn drop(&mut self) {
        if !self.down {
            if let Err(error) = self.shutdown() {
                log::error!("process {}: shutdown failed: {:#}", self.index, error);
            }
        }
    }
}

/// Repeatedly writes queued messages into a TcpStream.
///
/// The stream carries a sequence of (header, payload) frames followed by a
/// zero-length shutdown header. Queued items are drained in bursts and the
/// writer flushed only when the queue runs dry, so consecutive posts
/// coalesce into one system call.
fn send_loop(stream: TcpStream, queue: Receiver<SendItem>, index: usize) -> Result<()> {
    let mut writer = BufWriter::with_capacity(1 << 16, stream);

    loop {
        let first = match queue.recv() {
            Ok(item) => item,
            // All senders dropped without an explicit shutdown.
            Err(_) => break,
        };
        let mut next = Some(first);
        while let Some(item) = next.take() {
            match item {
                SendItem::Message(header, payload) => {
                    header.write_to(&mut writer).context("writing header")?;
                    writer.write_all(&payload).context("writing payload")?;
                }
                SendItem::Shutdown => {
                    let header = MessageHeader { source: index as u32, tag: SHUTDOWN_TAG, length: 0 };
                    header.write_to(&mut writer).context("writing shutdown header")?;
                    writer.flush().context("flushing writer")?;
                    writer
                        .get_ref()
                        .shutdown(Shutdown::Write)
                        .context("write shutdown failed")?;
                    return Ok(());
                }
            }
            next = queue.try_recv().ok();
        }
        writer.flush().context("flushing writer")?;
    }

    Ok(())
}

/// Repeatedly reads frames from a TcpStream and routes payloads by
/// `(source, tag)`.
///
/// Payloads for slots nobody has registered yet are staged until
/// registration; payloads for receivers that have since been dropped are
/// discarded. Exits cleanly on the peer's shutdown header.
fn recv_loop(mut stream: TcpStream, router: Arc<Mutex<RouterState>>, peer: usize) -> Result<()> {
    loop {
        let header = MessageHeader::read_from(&mut stream)
            .with_context(|| format!("reading header from peer {}", peer))?;
        if header.tag == SHUTDOWN_TAG {
            break;
        }
        let mut payload = vec![0u8; header.length as usize];
        std::io::Read::read_exact(&mut stream, &mut payload)
            .with_context(|| format!("reading payload from peer {}", peer))?;

        let key = (header.source as usize, header.tag);
        let mut state = router.lock().expect("poisoned router");
        let dead = if let Some(route) = state.routes.get(&key) {
            route.send(payload).is_err()
        } else {
            state.pending.entry(key).or_default().push_back(payload);
            false
        };
        if dead {
            state.routes.remove(&key);
        }
    }
    Ok(())
}
