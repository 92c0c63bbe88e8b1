// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The transport: identity-addressed multipart frames over TCP.
//!
//! Each node binds one listener. An outbound channel to a peer is a TCP
//! connection that opens with a single-part identity frame naming the local
//! node; everything after the handshake is message frames. Inbound
//! connections each get a reader thread that reassembles messages and feeds
//! them into one merged queue, so [`Van::recv`] is a single blocking pull
//! regardless of how many peers are talking. A reader that hits EOF outside
//! of shutdown reports the peer id on the monitor channel.

use crate::error::{Error, Result};
use crate::messaging::{Message, WireMsg};
use crate::types::{Node, NodeId, NodeRole};
use backoff::ExponentialBackoff;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// The message transport of one node.
pub struct Van {
    my_node: Arc<RwLock<Node>>,
    local_addr: SocketAddr,
    /// Outbound identity-tagged channels, by remote node id.
    senders: DashMap<NodeId, Arc<Mutex<TcpStream>>>,
    /// Inbound stream handles, kept so shutdown can unblock the readers.
    inbound: Arc<Mutex<Vec<TcpStream>>>,
    incoming_tx: Sender<Message>,
    incoming_rx: Receiver<Message>,
    /// Peer-disconnect notifications; taken once by the monitor thread.
    events_rx: Mutex<Option<Receiver<NodeId>>>,
    shutdown: Arc<AtomicBool>,
    acceptor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Van {
    /// Binds the node's listener and starts accepting inbound channels. A
    /// port of 0 picks an ephemeral one; the effective port is written back
    /// into the node record.
    pub fn bind(mut my_node: Node) -> Result<Self> {
        let host = if my_node.hostname.is_empty() {
            "0.0.0.0"
        } else {
            my_node.hostname.as_str()
        };
        let listener = TcpListener::bind((host, my_node.port))?;
        let local_addr = listener.local_addr()?;
        my_node.port = local_addr.port();
        info!("BIND {} on {}", my_node, local_addr);

        let my_node = Arc::new(RwLock::new(my_node));
        let (incoming_tx, incoming_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let inbound = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let acceptor = thread::Builder::new().name("van-acceptor".to_string()).spawn({
            let my_node = my_node.clone();
            let incoming_tx = incoming_tx.clone();
            let inbound = inbound.clone();
            let shutdown = shutdown.clone();
            move || {
                accept_loop(listener, my_node, incoming_tx, events_tx, inbound, shutdown)
            }
        })?;

        Ok(Self {
            my_node,
            local_addr,
            senders: DashMap::new(),
            inbound,
            incoming_tx,
            incoming_rx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn my_node(&self) -> Node {
        self.my_node.read().clone()
    }

    /// Adopts a (re)assigned identity for this node. Channels opened later
    /// carry the new identity; existing ones must be reconnected.
    pub fn set_my_node(&self, node: Node) {
        *self.my_node.write() = node;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The monitor channel. Yields the id of every peer whose inbound
    /// channel dropped outside of shutdown. Can be taken once.
    pub fn take_events(&self) -> Option<Receiver<NodeId>> {
        self.events_rx.lock().take()
    }

    /// Opens an identity-tagged channel to `node`. Idempotent: an existing
    /// channel is kept. Transient connection failures are retried with
    /// backoff before giving up.
    pub fn connect(&self, node: &Node) -> Result<()> {
        if node.role == NodeRole::Group || node.hostname.is_empty() {
            return Err(Error::InvalidConfig(format!("{} has no address", node.id)));
        }
        {
            let mut me = self.my_node.write();
            if node.id == me.id {
                *me = node.clone();
                return Ok(());
            }
        }
        if self.senders.contains_key(&node.id) {
            return Ok(());
        }

        let addr = node.addr();
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(CONNECT_TIMEOUT),
            ..ExponentialBackoff::default()
        };
        let mut stream = backoff::retry(backoff, || {
            TcpStream::connect((node.hostname.as_str(), node.port)).map_err(backoff::Error::transient)
        })
        .map_err(|err| match err {
            backoff::Error::Permanent(e) | backoff::Error::Transient { err: e, .. } => {
                warn!("connect to {} [{}] failed: {}", node.id, addr, e);
                Error::Io(e)
            }
        })?;
        stream.set_nodelay(true)?;

        let identity = self.my_node.read().id.clone();
        WireMsg::write_parts(&mut stream, &[Bytes::from(identity.into_bytes())])?;
        let _ = self
            .senders
            .insert(node.id.clone(), Arc::new(Mutex::new(stream)));
        debug!("CONNECT to {} [{}]", node.id, addr);
        Ok(())
    }

    /// Drops any existing channel to `node` and opens a fresh one, tagged
    /// with the current identity.
    pub fn reconnect(&self, node: &Node) -> Result<()> {
        let _ = self.senders.remove(&node.id);
        self.connect(node)
    }

    pub fn disconnect(&self, id: &str) {
        if self.senders.remove(id).is_some() {
            debug!("DISCONNECT from {}", id);
        }
    }

    /// Serialises `msg` and writes it to the channel of `msg.recver`.
    /// Messages to this node short-circuit into the inbound queue.
    pub fn send(&self, mut msg: Message) -> Result<()> {
        let my_id = self.my_node.read().id.clone();
        if msg.recver == my_id {
            msg.sender = my_id;
            return self.incoming_tx.send(msg).map_err(|_| Error::Disconnected);
        }
        let stream = match self.senders.get(&msg.recver) {
            Some(entry) => entry.value().clone(),
            None => return Err(Error::NoChannel(msg.recver)),
        };
        let parts = WireMsg::to_parts(&mut msg)?;
        trace!("TO {:?}", msg);
        let mut guard = stream.lock();
        WireMsg::write_parts(&mut *guard, &parts)
    }

    /// Blocks until the next complete message arrives from any peer. A
    /// message with `terminate` set means the transport has shut down.
    pub fn recv(&self) -> Result<Message> {
        self.incoming_rx.recv().map_err(|_| Error::Disconnected)
    }

    /// Queues a disconnect marker for `id` behind everything the peer
    /// already delivered, so the membership plane never sees a death before
    /// the peer's final messages.
    pub(crate) fn inject_disconnect(&self, id: NodeId) {
        let mut marker = Message::new();
        marker.disconnected = Some(id);
        let _ = self.incoming_tx.send(marker);
    }

    /// Tears the transport down: closes every channel, stops the acceptor
    /// and delivers a terminate sentinel to `recv`.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for stream in self.inbound.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.senders.clear();
        // Wake the acceptor so it can observe the flag.
        let _ = TcpStream::connect(self.local_addr);
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        let mut sentinel = Message::new();
        sentinel.terminate = true;
        let _ = self.incoming_tx.send(sentinel);
    }
}

impl Drop for Van {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    my_node: Arc<RwLock<Node>>,
    incoming_tx: Sender<Message>,
    events_tx: Sender<NodeId>,
    inbound: Arc<Mutex<Vec<TcpStream>>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                warn!("accept failed: {}", err);
                continue;
            }
        };
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let _ = stream.set_nodelay(true);
        match stream.try_clone() {
            Ok(clone) => inbound.lock().push(clone),
            Err(err) => warn!("could not register channel from {}: {}", peer_addr, err),
        }
        let spawned = thread::Builder::new().name("van-reader".to_string()).spawn({
            let my_node = my_node.clone();
            let incoming_tx = incoming_tx.clone();
            let events_tx = events_tx.clone();
            let shutdown = shutdown.clone();
            move || reader_loop(stream, my_node, incoming_tx, events_tx, shutdown)
        });
        if let Err(err) = spawned {
            warn!("could not spawn reader for {}: {}", peer_addr, err);
        }
    }
    trace!("acceptor stopped");
}

fn reader_loop(
    mut stream: TcpStream,
    my_node: Arc<RwLock<Node>>,
    incoming_tx: Sender<Message>,
    events_tx: Sender<NodeId>,
    shutdown: Arc<AtomicBool>,
) {
    // The first frame on a channel is the single-part peer identity.
    let identity = match WireMsg::read_parts(&mut stream) {
        Ok(parts) if parts.len() == 1 => String::from_utf8_lossy(&parts[0]).to_string(),
        Ok(_) => {
            warn!("channel opened without an identity frame; closing");
            return;
        }
        Err(_) => return,
    };
    debug!("inbound channel from {}", identity);

    loop {
        let parts = match WireMsg::read_parts(&mut stream) {
            Ok(parts) => parts,
            Err(_) => break,
        };
        let recver = my_node.read().id.clone();
        match WireMsg::from_parts(identity.clone(), recver, parts) {
            Ok(msg) => {
                trace!("FROM {:?}", msg);
                if incoming_tx.send(msg).is_err() {
                    break;
                }
            }
            Err(err) => {
                // Version skew or a corrupted stream; there is no way to
                // resynchronise a framed channel.
                error!("protocol violation from {}: {}", identity, err);
                std::process::abort();
            }
        }
    }
    if !shutdown.load(Ordering::SeqCst) {
        let _ = events_tx.send(identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn van(id: &str) -> Van {
        Van::bind(Node::new(id, NodeRole::Worker, "127.0.0.1", 0)).expect("bind")
    }

    #[test]
    fn send_and_recv_between_vans() -> eyre::Result<()> {
        let a = van("A");
        let b = van("B");
        a.connect(&b.my_node())?;

        let mut msg = Message::to("B");
        msg.task.time = 3;
        msg.set_key(&[1u64, 2]);
        msg.add_value(&[0.5f32, 1.5]);
        a.send(msg)?;

        let got = b.recv()?;
        assert_eq!(got.sender, "A");
        assert_eq!(got.recver, "B");
        assert_eq!(got.task.time, 3);
        assert_eq!(got.key_as::<u64>(), vec![1, 2]);
        assert_eq!(got.value_as::<f32>(0), vec![0.5, 1.5]);
        Ok(())
    }

    #[test]
    fn send_to_self_loops_back() -> eyre::Result<()> {
        let a = van("A");
        let mut msg = Message::to("A");
        msg.task.time = 9;
        a.send(msg)?;
        let got = a.recv()?;
        assert_eq!(got.sender, "A");
        assert_eq!(got.task.time, 9);
        Ok(())
    }

    #[test]
    fn send_without_channel_fails() {
        let a = van("A");
        let result = a.send(Message::to("NOWHERE"));
        assert!(matches!(result, Err(Error::NoChannel(_))));
    }

    #[test]
    fn dropped_peer_raises_a_monitor_event() -> eyre::Result<()> {
        let a = van("A");
        let b = van("B");
        let events = b.take_events().expect("events");
        a.connect(&b.my_node())?;
        a.send(Message::to("B"))?;
        let _ = b.recv()?;

        drop(a);
        let dead = events.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(dead, "A");
        Ok(())
    }
}
