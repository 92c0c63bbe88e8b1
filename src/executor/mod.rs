// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The per-customer task engine.
//!
//! An executor owns one worker thread. Producers hand received messages to
//! [`Executor::accept`]; the worker picks the oldest message whose
//! dependencies are satisfied, runs the customer's handler, and maintains the
//! per-peer sent/received timestamp trackers that back `wait_sent_req` /
//! `wait_recv_req` and group completion.

mod remote_node;
mod tracker;

pub(crate) use remote_node::RemoteNode;
pub use tracker::Tracker;

use crate::customer::Customer;
use crate::error::{Error, Result};
use crate::messaging::{Callback, FilterFactory, Message, RecvHandle, Task, INVALID_TIME};
use crate::types::{CustomerId, Node, NodeId, NodeRole, GROUP_IDS, LIVE_GROUP, SERVER_GROUP, WORKER_GROUP, COMP_GROUP, REPLICA_GROUP, OWNER_GROUP};
use crossbeam_channel::Sender;
use itertools::izip;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One-shot slot for a request's completion callback.
enum CallbackState {
    Unset,
    Pending(Callback),
    Fired,
}

impl CallbackState {
    fn take_pending(&mut self) -> Option<Callback> {
        match std::mem::replace(self, CallbackState::Fired) {
            CallbackState::Pending(cb) => Some(cb),
            CallbackState::Unset => {
                *self = CallbackState::Unset;
                None
            }
            CallbackState::Fired => None,
        }
    }

    fn is_pending(&self) -> bool {
        matches!(self, CallbackState::Pending(_))
    }
}

/// Executor-local record of a submitted request. Kept for the lifetime of
/// the executor so late `wait` calls and replayed responses stay correct.
struct SentRequest {
    recver: NodeId,
    recv_handle: Option<RecvHandle>,
    callback: CallbackState,
}

/// Guarded by the node lock: peers, trackers, timestamps and sent requests.
struct NodeState {
    my_node: Node,
    num_replicas: usize,
    /// The last timestamp assigned by `submit`.
    time: i32,
    nodes: HashMap<NodeId, RemoteNode>,
    sent_reqs: HashMap<i32, SentRequest>,
    last_request: Option<Task>,
    last_response: Option<Task>,
}

/// Guarded by the message lock: the arrival-ordered receive buffer.
struct RecvBuffer {
    msgs: VecDeque<Message>,
    done: bool,
}

/// The task engine of one customer. See the module docs.
pub struct Executor {
    customer_id: CustomerId,
    customer: Arc<dyn Customer>,
    sending: Sender<Message>,
    filter_factory: FilterFactory,

    state: Mutex<NodeState>,
    sent_req_cond: Condvar,
    recv_req_cond: Condvar,

    buffer: Mutex<RecvBuffer>,
    dag_cond: Condvar,

    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    /// Creates the executor and starts its worker thread. The virtual group
    /// peers exist from birth; concrete peers arrive via [`Self::add_node`].
    pub fn spawn(
        customer_id: CustomerId,
        customer: Arc<dyn Customer>,
        my_node: Node,
        num_replicas: usize,
        sending: Sender<Message>,
        filter_factory: FilterFactory,
    ) -> Result<Arc<Self>> {
        let mut nodes = HashMap::new();
        for gid in GROUP_IDS {
            let _ = nodes.insert(gid.to_string(), RemoteNode::new(Node::group(gid)));
        }
        let exec = Arc::new(Self {
            customer_id,
            customer,
            sending,
            filter_factory,
            state: Mutex::new(NodeState {
                my_node,
                num_replicas,
                time: 0,
                nodes,
                sent_reqs: HashMap::new(),
                last_request: None,
                last_response: None,
            }),
            sent_req_cond: Condvar::new(),
            recv_req_cond: Condvar::new(),
            buffer: Mutex::new(RecvBuffer {
                msgs: VecDeque::new(),
                done: false,
            }),
            dag_cond: Condvar::new(),
            worker: Mutex::new(None),
        });
        let handle = thread::Builder::new()
            .name(format!("executor-{}", customer_id))
            .spawn({
                let exec = exec.clone();
                move || exec.run()
            })?;
        *exec.worker.lock() = Some(handle);
        Ok(exec)
    }

    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    pub fn my_node(&self) -> Node {
        self.state.lock().my_node.clone()
    }

    /// The header of the most recently processed request, if any.
    pub fn last_request(&self) -> Option<Task> {
        self.state.lock().last_request.clone()
    }

    /// The header of the most recently processed response, if any.
    pub fn last_response(&self) -> Option<Task> {
        self.state.lock().last_response.clone()
    }

    /// Submits a request. Assigns the customer's next timestamp (or adopts
    /// `msg.task.time` if the caller set one), slices the message across the
    /// recver's members, and queues every piece that intersects its shard.
    /// Returns the assigned timestamp.
    pub fn submit(&self, mut msg: Message) -> Result<i32> {
        if msg.recver.is_empty() {
            return Err(Error::InvalidConfig("message has no recver".to_string()));
        }
        let recver = msg.recver.clone();
        let fin_handle = msg.fin_handle.take();
        let recv_handle = msg.recv_handle.take();

        let (ts, subs, ranges) = {
            let mut st = self.state.lock();
            let ts = if msg.task.time > INVALID_TIME {
                msg.task.time
            } else {
                st.time + 1
            };
            if ts <= st.time {
                return Err(Error::NonMonotonicTimestamp {
                    got: ts,
                    last: st.time,
                });
            }
            st.time = ts;
            msg.task.time = ts;
            msg.task.request = true;
            msg.task.customer_id = self.customer_id;
            let _ = st.sent_reqs.insert(
                ts,
                SentRequest {
                    recver: recver.clone(),
                    recv_handle,
                    callback: fin_handle.map_or(CallbackState::Unset, CallbackState::Pending),
                },
            );

            let rnode = st
                .nodes
                .get(&recver)
                .ok_or_else(|| Error::UnknownNode(recver.clone()))?;
            if rnode.node.role == NodeRole::Group {
                (ts, rnode.sub_nodes.clone(), rnode.sub_key_ranges.clone())
            } else {
                (ts, vec![recver.clone()], vec![rnode.node.key_range])
            }
        };

        // The slicing hook is customer code; it runs outside the locks.
        let pieces = self.customer.slice(msg, &ranges)?;
        if pieces.len() != subs.len() {
            return Err(Error::SliceMismatch {
                got: pieces.len(),
                expected: subs.len(),
            });
        }

        let mut outgoing = Vec::with_capacity(pieces.len());
        let mut marked_done = false;
        {
            let mut st = self.state.lock();
            let my_id = st.my_node.id.clone();
            for (sub_id, mut piece) in izip!(&subs, pieces) {
                let rnode = st
                    .nodes
                    .get_mut(sub_id)
                    .ok_or_else(|| Error::UnknownNode(sub_id.clone()))?;
                if !piece.valid {
                    // Nothing for this shard: done without a wire send.
                    rnode.sent_req_tracker.finish(ts);
                    marked_done = true;
                    continue;
                }
                rnode.encode_message(&mut piece, &self.filter_factory);
                piece.sender = my_id.clone();
                piece.recver = sub_id.clone();
                piece.original_recver = recver.clone();
                outgoing.push(piece);
            }
        }
        if marked_done {
            self.sent_req_cond.notify_all();
        }
        for piece in outgoing {
            trace!("submit t={} to {}", ts, piece.recver);
            self.sending.send(piece).map_err(|_| Error::Disconnected)?;
        }
        Ok(ts)
    }

    /// Producer entry: appends a received message for the worker thread.
    /// Never processes on the caller's thread.
    pub fn accept(&self, msg: Message) {
        let mut buf = self.buffer.lock();
        if buf.done {
            return;
        }
        buf.msgs.push_back(msg);
        self.dag_cond.notify_one();
    }

    /// Blocks until the request submitted with `time` has completed: its
    /// recver is dead, or responded, or — for groups — every living member
    /// has responded (dead members count as done).
    pub fn wait_sent_req(&self, time: i32) -> Result<()> {
        let mut st = self.state.lock();
        let recver = match st.sent_reqs.get(&time) {
            Some(entry) => entry.recver.clone(),
            None => return Err(Error::UnknownTimestamp(time)),
        };
        while !Self::check_finished(&mut st, &recver, time, true) {
            self.sent_req_cond.wait(&mut st);
        }
        Ok(())
    }

    /// Blocks until the request `time` received from `sender` has been
    /// processed locally.
    pub fn wait_recv_req(&self, time: i32, sender: &str) {
        let mut st = self.state.lock();
        while !Self::check_finished(&mut st, sender, time, false) {
            self.recv_req_cond.wait(&mut st);
        }
    }

    /// Marks request `time` from `sender` processed. Called by the worker
    /// when a handler returns with `finished` still set, or later by the
    /// customer itself if it cleared the flag.
    pub fn finish_recv_req(&self, time: i32, sender: &str) {
        {
            let mut st = self.state.lock();
            match st.nodes.get_mut(sender) {
                Some(rnode) => rnode.recv_req_tracker.finish(time),
                None => {
                    warn!("finish_recv_req({}, {}): unknown sender", time, sender);
                    return;
                }
            }
        }
        self.recv_req_cond.notify_all();
        // Requests waiting on this timestamp become eligible.
        let _buf = self.buffer.lock();
        self.dag_cond.notify_all();
    }

    /// Queues `response` as the answer to `request`, mirroring its timestamp
    /// and marking the request replied.
    pub fn reply(&self, request: &mut Message, mut response: Message) -> Result<()> {
        response.task.request = false;
        response.task.control = false;
        response.task.time = request.task.time;
        response.task.customer_id = self.customer_id;
        response.sender = self.state.lock().my_node.id.clone();
        response.recver = request.sender.clone();
        request.replied = true;
        self.sending.send(response).map_err(|_| Error::Disconnected)
    }

    /// Registers `node` (or refreshes it) and files it into the virtual
    /// groups its role belongs to.
    pub fn add_node(&self, node: Node) {
        let mut st = self.state.lock();
        st.add_node(node);
    }

    /// Marks `node_id` dead. The peer stays in the table so its trackers
    /// keep swallowing late traffic; every waiter wakes to re-observe
    /// completion, and group requests that only waited on this peer fire
    /// their callbacks.
    pub fn remove_node(&self, node_id: &str) {
        let fired = {
            let mut st = self.state.lock();
            if !st.nodes.contains_key(node_id) {
                return;
            }
            for gid in GROUP_IDS {
                if let Some(group) = st.nodes.get_mut(gid) {
                    group.remove_sub_node(node_id);
                }
            }
            if let Some(rnode) = st.nodes.get_mut(node_id) {
                rnode.alive = false;
            }
            if st.my_node.role == NodeRole::Server && st.num_replicas > 0 {
                st.rebuild_replica_groups();
            }
            self.complete_orphaned_group_reqs(&mut st)
        };
        self.sent_req_cond.notify_all();
        self.recv_req_cond.notify_all();
        {
            let _buf = self.buffer.lock();
            self.dag_cond.notify_all();
        }
        for cb in fired {
            cb();
        }
    }

    /// Replaces a dead node: the old id is retired, the new node joins the
    /// same groups.
    pub fn replace_node(&self, old_id: &str, new_node: Node) {
        self.remove_node(old_id);
        self.add_node(new_node);
    }

    /// Stops the worker thread. Buffered but unpicked messages are dropped.
    pub fn stop(&self) {
        {
            let mut buf = self.buffer.lock();
            if buf.done {
                return;
            }
            buf.done = true;
            self.dag_cond.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    fn run(&self) {
        while let Some(msg) = self.pick_active_msg() {
            self.process_active_msg(msg);
        }
        trace!("executor {} worker stopped", self.customer_id);
    }

    /// Scans the receive buffer in arrival order for the first message that
    /// is from a living peer, not a duplicate, and (for requests) has every
    /// `wait_time` dependency satisfied. Sleeps when nothing qualifies.
    fn pick_active_msg(&self) -> Option<Message> {
        let mut buf = self.buffer.lock();
        loop {
            if buf.done {
                return None;
            }
            let mut picked = None;
            {
                let mut st = self.state.lock();
                let mut idx = 0;
                while idx < buf.msgs.len() {
                    let msg = &buf.msgs[idx];
                    let req = msg.task.request;
                    let ts = msg.task.time;
                    let rnode = match st.nodes.get(&msg.sender) {
                        Some(rnode) => rnode,
                        None => {
                            warn!("message from unknown node; dropping: {:?}", msg);
                            let _ = buf.msgs.remove(idx);
                            continue;
                        }
                    };
                    if !rnode.alive {
                        warn!("{} is dead; dropping: {:?}", msg.sender, msg);
                        let _ = buf.msgs.remove(idx);
                        continue;
                    }
                    if (req && rnode.recv_req_tracker.is_finished(ts))
                        || (!req && rnode.sent_req_tracker.is_finished(ts))
                    {
                        warn!("duplicate delivery; dropping: {:?}", msg);
                        let _ = buf.msgs.remove(idx);
                        continue;
                    }
                    if req
                        && msg.task.wait_time.iter().any(|w| {
                            *w > INVALID_TIME && !rnode.recv_req_tracker.is_finished(*w)
                        })
                    {
                        // Dependencies outstanding; leave it in place.
                        idx += 1;
                        continue;
                    }
                    picked = Some(idx);
                    break;
                }
                if let Some(idx) = picked {
                    if let Some(mut msg) = buf.msgs.remove(idx) {
                        if let Some(rnode) = st.nodes.get_mut(&msg.sender) {
                            rnode.decode_message(&mut msg, &self.filter_factory);
                        }
                        return Some(msg);
                    }
                }
            }
            self.dag_cond.wait(&mut buf);
        }
    }

    fn process_active_msg(&self, mut msg: Message) {
        let ts = msg.task.time;
        let sender = msg.sender.clone();
        if msg.task.request {
            self.state.lock().last_request = Some(msg.task.clone());
            self.customer.process_request(&mut msg);
            if msg.finished {
                self.finish_recv_req(ts, &sender);
                if !msg.replied {
                    self.reply_empty(&msg);
                }
            }
        } else {
            self.state.lock().last_response = Some(msg.task.clone());
            self.customer.process_response(&mut msg);

            let mut callback = None;
            let mut recv_handle = None;
            {
                let mut st = self.state.lock();
                if let Some(rnode) = st.nodes.get_mut(&sender) {
                    rnode.sent_req_tracker.finish(ts);
                }
                let orig = match st.sent_reqs.get(&ts) {
                    Some(entry) => {
                        recv_handle = entry.recv_handle.clone();
                        entry.recver.clone()
                    }
                    None => {
                        warn!("response for untracked timestamp; dropping: {:?}", msg);
                        return;
                    }
                };
                let mut complete = true;
                if orig != sender {
                    let group_subs = match st.nodes.get(&orig) {
                        Some(onode) if onode.node.role == NodeRole::Group => {
                            Some(onode.sub_nodes.clone())
                        }
                        // The original recver died and `sender` answered in
                        // its place; the request is complete.
                        _ => None,
                    };
                    if let Some(subs) = group_subs {
                        let pending = subs.iter().any(|id| {
                            st.nodes
                                .get(id)
                                .map_or(false, |r| r.alive && !r.sent_req_tracker.is_finished(ts))
                        });
                        if pending {
                            complete = false;
                        } else if let Some(onode) = st.nodes.get_mut(&orig) {
                            onode.sent_req_tracker.finish(ts);
                        }
                    }
                }
                if complete {
                    if let Some(entry) = st.sent_reqs.get_mut(&ts) {
                        callback = entry.callback.take_pending();
                    }
                }
            }
            self.sent_req_cond.notify_all();
            if let Some(handle) = recv_handle {
                handle();
            }
            if let Some(cb) = callback {
                cb();
            }
        }
    }

    fn reply_empty(&self, request: &Message) {
        let mut task = Task::default();
        task.time = request.task.time;
        task.request = false;
        task.customer_id = self.customer_id;
        let mut response = Message::with_task(task, request.sender.clone());
        response.sender = self.state.lock().my_node.id.clone();
        if self.sending.send(response).is_err() {
            debug!("dropping reply to {}; runtime is shutting down", request.sender);
        }
    }

    /// True if `id`'s side of request `time` is done: the peer is dead, its
    /// tracker is finished, or — for groups — every living member's tracker
    /// is finished. Dead members are pinned finished so their late traffic
    /// is swallowed as duplicates.
    fn check_finished(st: &mut NodeState, id: &str, time: i32, sent: bool) -> bool {
        if time < 0 {
            return true;
        }
        let (alive, finished, role, subs) = match st.nodes.get(id) {
            Some(rnode) => {
                let tracker = if sent {
                    &rnode.sent_req_tracker
                } else {
                    &rnode.recv_req_tracker
                };
                (
                    rnode.alive,
                    tracker.is_finished(time),
                    rnode.node.role,
                    rnode.sub_nodes.clone(),
                )
            }
            None => {
                debug!("check_finished on unknown node {}", id);
                return true;
            }
        };
        if !alive || finished {
            return true;
        }
        if role == NodeRole::Group {
            for sub_id in &subs {
                if let Some(rnode) = st.nodes.get_mut(sub_id) {
                    let tracker = if sent {
                        &mut rnode.sent_req_tracker
                    } else {
                        &mut rnode.recv_req_tracker
                    };
                    if rnode.alive && !tracker.is_finished(time) {
                        return false;
                    }
                    tracker.finish(time);
                }
            }
            return true;
        }
        false
    }

    /// After a peer death: group requests that were only waiting on the dead
    /// peer are now complete, so their callbacks must fire. Returns the
    /// callbacks to run outside the lock.
    fn complete_orphaned_group_reqs(&self, st: &mut NodeState) -> Vec<Callback> {
        let candidates: Vec<(i32, NodeId)> = st
            .sent_reqs
            .iter()
            .filter(|(_, entry)| entry.callback.is_pending())
            .map(|(ts, entry)| (*ts, entry.recver.clone()))
            .collect();
        let mut fired = Vec::new();
        for (ts, recver) in candidates {
            let is_group = st
                .nodes
                .get(&recver)
                .map_or(false, |r| r.node.role == NodeRole::Group);
            if !is_group || !Self::check_finished(st, &recver, ts, true) {
                continue;
            }
            if let Some(onode) = st.nodes.get_mut(&recver) {
                onode.sent_req_tracker.finish(ts);
            }
            if let Some(entry) = st.sent_reqs.get_mut(&ts) {
                if let Some(cb) = entry.callback.take_pending() {
                    fired.push(cb);
                }
            }
        }
        fired
    }
}

impl NodeState {
    fn add_node(&mut self, node: Node) {
        if node.id == self.my_node.id
            || (node.role != NodeRole::Group
                && !node.hostname.is_empty()
                && node.port != 0
                && node.addr() == self.my_node.addr())
        {
            self.my_node = node.clone();
        }
        let id = node.id.clone();
        if let Some(rnode) = self.nodes.get_mut(&id) {
            // A refresh: the node re-files into its groups below.
            rnode.node = node.clone();
            for gid in GROUP_IDS {
                if let Some(group) = self.nodes.get_mut(gid) {
                    group.remove_sub_node(&id);
                }
            }
        } else {
            let _ = self.nodes.insert(id.clone(), RemoteNode::new(node.clone()));
        }

        let range = node.key_range;
        match node.role {
            NodeRole::Server => {
                self.group_add(SERVER_GROUP, &id, range);
                self.group_add(COMP_GROUP, &id, range);
                self.group_add(LIVE_GROUP, &id, range);
            }
            NodeRole::Worker => {
                self.group_add(WORKER_GROUP, &id, range);
                self.group_add(COMP_GROUP, &id, range);
                self.group_add(LIVE_GROUP, &id, range);
            }
            NodeRole::Unused => self.group_add(LIVE_GROUP, &id, range),
            NodeRole::Scheduler | NodeRole::Group => {}
        }

        if node.role == NodeRole::Server
            && self.my_node.role == NodeRole::Server
            && self.num_replicas > 0
        {
            self.rebuild_replica_groups();
        }
    }

    fn group_add(&mut self, gid: &str, id: &NodeId, range: crate::types::KeyRange) {
        if let Some(group) = self.nodes.get_mut(gid) {
            group.add_sub_node(id.clone(), range);
        }
    }

    /// Recomputes the replica and owner groups of this server: the
    /// `num_replicas` servers immediately before it hold its replicas, the
    /// ones immediately after it are the owners it replicates for.
    fn rebuild_replica_groups(&mut self) {
        let (server_ids, server_ranges) = match self.nodes.get(SERVER_GROUP) {
            Some(group) => (group.sub_nodes.clone(), group.sub_key_ranges.clone()),
            None => return,
        };
        let me = match server_ids.iter().position(|id| *id == self.my_node.id) {
            Some(i) => i,
            None => return,
        };
        let n = server_ids.len();
        let replicas = me.saturating_sub(self.num_replicas)..me;
        let owners = (me + 1)..(me + 1 + self.num_replicas).min(n);
        for (gid, span) in [(REPLICA_GROUP, replicas), (OWNER_GROUP, owners)] {
            if let Some(group) = self.nodes.get_mut(gid) {
                group.sub_nodes = server_ids[span.clone()].to_vec();
                group.sub_key_ranges = server_ranges[span].to_vec();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::no_filters;
    use crate::types::KeyRange;
    use crossbeam_channel::{unbounded, Receiver};
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        requests: PlMutex<Vec<(NodeId, i32)>>,
        responses: PlMutex<Vec<(NodeId, i32)>>,
    }

    impl Customer for Recorder {
        fn process_request(&self, req: &mut Message) {
            self.requests.lock().push((req.sender.clone(), req.task.time));
        }
        fn process_response(&self, res: &mut Message) {
            self.responses.lock().push((res.sender.clone(), res.task.time));
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    fn server(id: &str, lo: u64, hi: u64) -> Node {
        let mut node = Node::new(id, NodeRole::Server, "127.0.0.1", 0);
        node.key_range = KeyRange::new(lo, hi);
        node
    }

    fn worker_exec(
        customer: Arc<dyn Customer>,
    ) -> (Arc<Executor>, Receiver<Message>) {
        let (tx, rx) = unbounded();
        let me = Node::new("W0", NodeRole::Worker, "127.0.0.1", 0);
        let exec = Executor::spawn(1, customer, me, 0, tx, no_filters()).expect("spawn");
        (exec, rx)
    }

    fn response_for(piece: &Message) -> Message {
        let mut task = Task::default();
        task.time = piece.task.time;
        task.request = false;
        task.customer_id = piece.task.customer_id;
        let mut res = Message::with_task(task, piece.sender.clone());
        res.sender = piece.recver.clone();
        res
    }

    #[test]
    fn submit_slices_keyed_message_across_the_group() -> eyre::Result<()> {
        let (exec, rx) = worker_exec(Arc::new(Recorder::default()));
        let half = 1u64 << 63;
        exec.add_node(server("S0", 0, half));
        exec.add_node(server("S1", half, u64::MAX));

        let mut msg = Message::to(SERVER_GROUP);
        msg.set_key(&[10u64, half, half + 5]);
        msg.add_value(&[1.0f64, 2.0, 3.0]);
        let ts = exec.submit(msg)?;
        assert_eq!(ts, 1);

        let a = rx.recv_timeout(Duration::from_secs(1))?;
        let b = rx.recv_timeout(Duration::from_secs(1))?;
        assert_eq!(a.recver, "S0");
        assert_eq!(a.original_recver, SERVER_GROUP);
        assert_eq!(a.key_as::<u64>(), vec![10]);
        assert_eq!(a.value_as::<f64>(0), vec![1.0]);
        assert_eq!(b.recver, "S1");
        assert_eq!(b.key_as::<u64>(), vec![half, half + 5]);
        assert_eq!(b.value_as::<f64>(0), vec![2.0, 3.0]);
        exec.stop();
        Ok(())
    }

    #[test]
    fn timestamps_are_strictly_increasing() -> eyre::Result<()> {
        let (exec, _rx) = worker_exec(Arc::new(Recorder::default()));
        exec.add_node(server("S0", 0, u64::MAX));

        assert_eq!(exec.submit(Message::to("S0"))?, 1);
        assert_eq!(exec.submit(Message::to("S0"))?, 2);
        let mut early = Message::to("S0");
        early.task.time = 2;
        assert_matches::assert_matches!(
            exec.submit(early),
            Err(Error::NonMonotonicTimestamp { got: 2, last: 2 })
        );
        let mut late = Message::to("S0");
        late.task.time = 10;
        assert_eq!(exec.submit(late)?, 10);
        exec.stop();
        Ok(())
    }

    #[test]
    fn group_callback_fires_once_after_all_members_respond() -> eyre::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let (exec, rx) = worker_exec(recorder.clone());
        exec.add_node(server("S0", 0, 1 << 63));
        exec.add_node(server("S1", 1 << 63, u64::MAX));

        let fired = Arc::new(AtomicUsize::new(0));
        let mut msg = Message::to(SERVER_GROUP);
        let counter = fired.clone();
        msg.fin_handle = Some(Box::new(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }));
        let ts = exec.submit(msg)?;

        let a = rx.recv_timeout(Duration::from_secs(1))?;
        let b = rx.recv_timeout(Duration::from_secs(1))?;
        exec.accept(response_for(&a));
        assert!(wait_until(Duration::from_secs(1), || {
            recorder.responses.lock().len() == 1
        }));
        // One member has not answered yet.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        exec.accept(response_for(&b));
        assert!(wait_until(Duration::from_secs(1), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        exec.wait_sent_req(ts)?;

        // A replayed response is discarded, the callback stays fired once.
        exec.accept(response_for(&b));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.responses.lock().len(), 2);
        exec.stop();
        Ok(())
    }

    #[test]
    fn peer_death_completes_the_group_wait() -> eyre::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let (exec, rx) = worker_exec(recorder.clone());
        exec.add_node(server("S0", 0, 1 << 63));
        exec.add_node(server("S1", 1 << 63, u64::MAX));

        let fired = Arc::new(AtomicUsize::new(0));
        let mut msg = Message::to(SERVER_GROUP);
        let counter = fired.clone();
        msg.fin_handle = Some(Box::new(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }));
        let ts = exec.submit(msg)?;

        let a = rx.recv_timeout(Duration::from_secs(1))?;
        let _b = rx.recv_timeout(Duration::from_secs(1))?;
        exec.accept(response_for(&a));
        assert!(wait_until(Duration::from_secs(1), || {
            recorder.responses.lock().len() == 1
        }));

        // S1 dies before answering; the wait completes and the callback
        // fires exactly once.
        exec.remove_node("S1");
        exec.wait_sent_req(ts)?;
        assert!(wait_until(Duration::from_secs(1), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        exec.stop();
        Ok(())
    }

    #[test]
    fn requests_obey_wait_time_dependencies() -> eyre::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let (tx, _rx) = unbounded();
        let me = server("S0", 0, u64::MAX);
        let exec = Executor::spawn(1, recorder.clone(), me, 0, tx, no_filters())?;
        exec.add_node(Node::new("W0", NodeRole::Worker, "127.0.0.1", 0));

        let mut second = Message::new();
        second.task.time = 2;
        second.task.request = true;
        second.task.wait_time = vec![1];
        second.sender = "W0".to_string();
        let mut first = Message::new();
        first.task.time = 1;
        first.task.request = true;
        first.sender = "W0".to_string();

        // The dependant arrives first and must not run until request 1 does.
        exec.accept(second);
        thread::sleep(Duration::from_millis(20));
        assert!(recorder.requests.lock().is_empty());

        exec.accept(first);
        assert!(wait_until(Duration::from_secs(1), || {
            recorder.requests.lock().len() == 2
        }));
        let order: Vec<i32> = recorder.requests.lock().iter().map(|(_, t)| *t).collect();
        assert_eq!(order, vec![1, 2]);
        exec.stop();
        Ok(())
    }

    #[test]
    fn duplicate_requests_are_processed_once() -> eyre::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let (tx, _rx) = unbounded();
        let me = server("S0", 0, u64::MAX);
        let exec = Executor::spawn(1, recorder.clone(), me, 0, tx, no_filters())?;
        exec.add_node(Node::new("W0", NodeRole::Worker, "127.0.0.1", 0));

        for _ in 0..2 {
            let mut req = Message::new();
            req.task.time = 1;
            req.task.request = true;
            req.sender = "W0".to_string();
            exec.accept(req);
        }
        assert!(wait_until(Duration::from_secs(1), || {
            !recorder.requests.lock().is_empty()
        }));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(recorder.requests.lock().len(), 1);
        exec.stop();
        Ok(())
    }

    #[test]
    fn non_intersecting_shard_is_finished_locally() -> eyre::Result<()> {
        let (exec, rx) = worker_exec(Arc::new(Recorder::default()));
        exec.add_node(server("A", 0, 1000));
        exec.add_node(server("B", 1000, 2000));

        let fired = Arc::new(AtomicUsize::new(0));
        let mut msg = Message::to(SERVER_GROUP);
        msg.task.key_range = Some(KeyRange::new(0, 1000));
        msg.set_key(&[5u64, 500, 900]);
        let counter = fired.clone();
        msg.fin_handle = Some(Box::new(move || {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
        }));
        let ts = exec.submit(msg)?;

        // Only the intersecting shard goes to the wire.
        let piece = rx.recv_timeout(Duration::from_secs(1))?;
        assert_eq!(piece.recver, "A");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        exec.accept(response_for(&piece));
        exec.wait_sent_req(ts)?;
        assert!(wait_until(Duration::from_secs(1), || {
            fired.load(Ordering::SeqCst) == 1
        }));
        exec.stop();
        Ok(())
    }

    #[test]
    fn replica_and_owner_groups_flank_this_server() -> eyre::Result<()> {
        let (tx, _rx) = unbounded();
        let me = server("S2", 200, 300);
        let exec = Executor::spawn(1, Arc::new(Recorder::default()), me, 1, tx, no_filters())?;
        for (i, (lo, hi)) in [(0, 100), (100, 200), (200, 300), (300, 400)].iter().enumerate() {
            exec.add_node(server(&format!("S{}", i), *lo, *hi));
        }
        let st = exec.state.lock();
        assert_eq!(st.nodes[REPLICA_GROUP].sub_nodes, vec!["S1"]);
        assert_eq!(st.nodes[OWNER_GROUP].sub_nodes, vec!["S3"]);
        drop(st);
        exec.stop();
        Ok(())
    }
}
