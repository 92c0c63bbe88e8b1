// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The membership control plane.
//!
//! The scheduler is authoritative: joining peers send `RequestApp`, the
//! scheduler assigns identities and roles in join order (workers first, then
//! servers with an even key-range partition, the rest unused) and broadcasts
//! the roster plus the application configuration once everyone expected has
//! joined. Node deaths observed by the transport monitor become
//! `RemoveNode` broadcasts. Shutdown runs scheduler-ward: every peer reports
//! `ReadyToExit`, the scheduler answers with `Exit` once all living peers
//! have reported.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messaging::{Control, ControlCmd, Message, Task};
use crate::postoffice::Postoffice;
use crate::types::{KeyRange, Node, NodeId, NodeRole};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, Ordering};

struct ManagerState {
    nodes: HashMap<NodeId, Node>,
    alive: HashSet<NodeId>,
    assigned_workers: usize,
    assigned_servers: usize,
    assigned_unused: usize,
    app_conf: Option<String>,
    exit_acks: HashSet<NodeId>,
    ready: bool,
    done: bool,
    scheduler_dead: bool,
}

/// Control plane of one node; authoritative on the scheduler.
pub struct Manager {
    scheduler: Node,
    num_workers: usize,
    num_servers: usize,
    num_unused: usize,
    time: AtomicI32,
    state: Mutex<ManagerState>,
    ready_cond: Condvar,
    done_cond: Condvar,
    acks_cond: Condvar,
}

impl Manager {
    pub(crate) fn new(config: &Config, scheduler: Node) -> Self {
        Self {
            scheduler,
            num_workers: config.num_workers,
            num_servers: config.num_servers,
            num_unused: config.num_unused,
            time: AtomicI32::new(0),
            state: Mutex::new(ManagerState {
                nodes: HashMap::new(),
                alive: HashSet::new(),
                assigned_workers: 0,
                assigned_servers: 0,
                assigned_unused: 0,
                app_conf: config.app_conf().ok().flatten(),
                exit_acks: HashSet::new(),
                ready: false,
                done: false,
                scheduler_dead: false,
            }),
            ready_cond: Condvar::new(),
            done_cond: Condvar::new(),
            acks_cond: Condvar::new(),
        }
    }

    /// Seeds the scheduler's own (bound) node into the roster.
    pub(crate) fn init_scheduler(&self, node: Node) {
        let mut st = self.state.lock();
        let _ = st.alive.insert(node.id.clone());
        let _ = st.nodes.insert(node.id.clone(), node);
    }

    /// Announces this peer to the scheduler.
    pub(crate) fn request_app(&self, po: &Postoffice) {
        let mut ctrl = Control::new(ControlCmd::RequestApp);
        ctrl.node = vec![po.van().my_node()];
        self.send_ctrl(po, &self.scheduler.id.clone(), ctrl);
    }

    /// Roster and app-config snapshot, for seeding freshly registered
    /// customers.
    pub(crate) fn nodes_snapshot(&self) -> Vec<Node> {
        self.state.lock().nodes.values().cloned().collect()
    }

    /// The application configuration the scheduler distributed, if any.
    pub fn app_conf(&self) -> Option<String> {
        self.state.lock().app_conf.clone()
    }

    /// Blocks until the whole roster is known and connected.
    pub fn wait_ready(&self) -> Result<()> {
        let mut st = self.state.lock();
        while !st.ready && !st.done {
            self.ready_cond.wait(&mut st);
        }
        if st.scheduler_dead {
            return Err(Error::SchedulerDied);
        }
        Ok(())
    }

    /// Dispatches a received control message.
    pub(crate) fn process(&self, msg: Message, po: &Postoffice) -> Result<()> {
        let ctrl = msg
            .task
            .ctrl
            .clone()
            .ok_or_else(|| Error::FailedToParse("control message without body".to_string()))?;
        trace!("ctrl {:?} from {}", ctrl.cmd, msg.sender);
        match ctrl.cmd {
            ControlCmd::RequestApp => self.handle_request_app(ctrl, po),
            ControlCmd::AddNode => self.handle_add_node(ctrl, po),
            ControlCmd::RemoveNode => self.handle_remove_node(ctrl, po),
            ControlCmd::ReplaceNode => self.handle_replace_node(ctrl, po),
            ControlCmd::ReadyToExit => self.handle_ready_to_exit(&msg.sender),
            ControlCmd::Exit => self.handle_exit(),
        }
        Ok(())
    }

    /// Scheduler: a peer channel died. Mark the node dead, let every
    /// executor observe it, and tell the remaining peers. Peers: losing the
    /// scheduler is fatal; any other id is the scheduler's to announce.
    pub(crate) fn node_disconnected(&self, id: NodeId, po: &Postoffice) {
        if !po.is_scheduler() {
            if id == self.scheduler.id {
                {
                    let mut st = self.state.lock();
                    if st.done {
                        // Clean shutdown: the Exit came through first.
                        return;
                    }
                    error!("lost the scheduler; the computation cannot continue");
                    st.scheduler_dead = true;
                    st.done = true;
                }
                self.done_cond.notify_all();
                self.ready_cond.notify_all();
            } else {
                debug!("channel from {} dropped; the scheduler will decide", id);
            }
            return;
        }

        let (node, peers) = {
            let mut st = self.state.lock();
            if st.done {
                return;
            }
            let node = match st.nodes.get(&id) {
                Some(node) => node.clone(),
                None => {
                    // A provisional or never-registered channel; harmless.
                    debug!("disconnect on unknown channel {}", id);
                    return;
                }
            };
            if !st.alive.remove(&id) {
                return;
            }
            warn!("node {} disconnected", node);
            (node, self.alive_peers(&st))
        };

        for exec in po.executors() {
            exec.remove_node(&id);
        }
        po.van().disconnect(&id);
        for peer in peers {
            let mut ctrl = Control::new(ControlCmd::RemoveNode);
            ctrl.node = vec![node.clone()];
            self.send_ctrl(po, &peer, ctrl);
        }
        // The exit barrier no longer waits on the dead node.
        self.acks_cond.notify_all();
    }

    /// Scheduler-side shutdown: wait for every living peer's ReadyToExit,
    /// then broadcast Exit.
    pub(crate) fn scheduler_stop(&self, po: &Postoffice) -> Result<()> {
        let peers = {
            let mut st = self.state.lock();
            loop {
                let outstanding = self
                    .alive_peers(&st)
                    .into_iter()
                    .any(|id| !st.exit_acks.contains(&id));
                if !outstanding {
                    break;
                }
                self.acks_cond.wait(&mut st);
            }
            st.done = true;
            self.alive_peers(&st)
        };
        for peer in peers {
            self.send_ctrl(po, &peer, Control::new(ControlCmd::Exit));
        }
        self.done_cond.notify_all();
        self.ready_cond.notify_all();
        Ok(())
    }

    /// Peer-side shutdown: report ReadyToExit and block until the scheduler
    /// answers with Exit.
    pub(crate) fn peer_stop(&self, po: &Postoffice) -> Result<()> {
        self.send_ctrl(
            po,
            &self.scheduler.id.clone(),
            Control::new(ControlCmd::ReadyToExit),
        );
        let mut st = self.state.lock();
        while !st.done {
            self.done_cond.wait(&mut st);
        }
        if st.scheduler_dead {
            return Err(Error::SchedulerDied);
        }
        Ok(())
    }

    fn handle_request_app(&self, ctrl: Control, po: &Postoffice) {
        if !po.is_scheduler() {
            warn!("ignoring RequestApp: this node is not the scheduler");
            return;
        }
        let joining = match ctrl.node.first() {
            Some(node) => node.clone(),
            None => {
                warn!("RequestApp without a node record");
                return;
            }
        };

        let complete = {
            let mut st = self.state.lock();
            if st.done {
                return;
            }
            if let Some(existing) = st
                .nodes
                .values()
                .find(|n| !n.is_scheduler() && n.addr() == joining.addr())
                .cloned()
            {
                // A re-sent join; answer with the roster again if we have it.
                debug!("{} already assigned as {}", joining.addr(), existing.id);
                if st.ready {
                    let roster = self.roster(&st);
                    let conf = st.app_conf.clone();
                    drop(st);
                    self.send_roster_to(po, &existing.id, roster, conf);
                }
                return;
            }

            let (id, role, key_range) = if st.assigned_workers < self.num_workers {
                (format!("W{}", st.assigned_workers), NodeRole::Worker, KeyRange::default())
            } else if st.assigned_servers < self.num_servers {
                (
                    format!("S{}", st.assigned_servers),
                    NodeRole::Server,
                    KeyRange::all().sub_range(st.assigned_servers, self.num_servers),
                )
            } else {
                (format!("U{}", st.assigned_unused), NodeRole::Unused, KeyRange::default())
            };
            match role {
                NodeRole::Worker => st.assigned_workers += 1,
                NodeRole::Server => st.assigned_servers += 1,
                _ => st.assigned_unused += 1,
            }

            let mut node = Node::new(id, role, joining.hostname, joining.port);
            node.key_range = key_range;
            info!("assigned {} to {}", node, joining.id);
            let _ = st.nodes.insert(node.id.clone(), node.clone());
            let _ = st.alive.insert(node.id.clone());

            let expected = self.num_workers + self.num_servers + self.num_unused;
            let joined = st.assigned_workers + st.assigned_servers + st.assigned_unused;
            joined == expected
        };

        if complete {
            self.broadcast_roster(po);
        }
    }

    /// Everyone has joined: connect to each peer, ship the roster with the
    /// app config, and apply it locally.
    fn broadcast_roster(&self, po: &Postoffice) {
        let (roster, conf) = {
            let st = self.state.lock();
            (self.roster(&st), st.app_conf.clone())
        };
        for node in &roster {
            if node.is_scheduler() {
                continue;
            }
            if let Err(err) = po.van().connect(node) {
                warn!("could not connect to {}: {}", node, err);
            }
        }
        for node in &roster {
            if node.is_scheduler() {
                continue;
            }
            self.send_roster_to(po, &node.id, roster.clone(), conf.clone());
        }
        for exec in po.executors() {
            for node in &roster {
                exec.add_node(node.clone());
            }
        }
        info!(
            "roster complete: {} workers, {} servers, {} unused",
            self.num_workers, self.num_servers, self.num_unused
        );
        self.state.lock().ready = true;
        self.ready_cond.notify_all();
    }

    fn handle_add_node(&self, ctrl: Control, po: &Postoffice) {
        // Adopt the identity the scheduler assigned to this address.
        let me = po.van().my_node();
        if let Some(mine) = ctrl
            .node
            .iter()
            .find(|n| n.role != NodeRole::Group && n.addr() == me.addr())
        {
            if *mine != me {
                info!("assigned identity {}", mine);
                po.van().set_my_node(mine.clone());
                if mine.id != me.id {
                    // Re-tag the scheduler channel with the new identity.
                    if let Err(err) = po.van().reconnect(&self.scheduler) {
                        warn!("could not re-identify with the scheduler: {}", err);
                    }
                }
            }
        }

        let my_id = po.van().my_node().id;
        for node in &ctrl.node {
            if node.id == my_id {
                continue;
            }
            if let Err(err) = po.van().connect(node) {
                warn!("could not connect to {}: {}", node, err);
            }
        }

        {
            let mut st = self.state.lock();
            if let Some(conf) = ctrl.app_conf.clone() {
                st.app_conf = Some(conf);
            }
            for node in &ctrl.node {
                let _ = st.alive.insert(node.id.clone());
                let _ = st.nodes.insert(node.id.clone(), node.clone());
            }
            st.ready = true;
        }
        for exec in po.executors() {
            for node in &ctrl.node {
                exec.add_node(node.clone());
            }
        }
        self.ready_cond.notify_all();
    }

    fn handle_remove_node(&self, ctrl: Control, po: &Postoffice) {
        for node in &ctrl.node {
            warn!("node {} removed from the computation", node);
            {
                let mut st = self.state.lock();
                let _ = st.alive.remove(&node.id);
            }
            for exec in po.executors() {
                exec.remove_node(&node.id);
            }
            po.van().disconnect(&node.id);
        }
    }

    fn handle_replace_node(&self, ctrl: Control, po: &Postoffice) {
        let (old, new) = match (ctrl.node.first(), ctrl.node.get(1)) {
            (Some(old), Some(new)) => (old.clone(), new.clone()),
            _ => {
                warn!("ReplaceNode needs the old and the new node");
                return;
            }
        };
        info!("replacing {} with {}", old, new);
        {
            let mut st = self.state.lock();
            let _ = st.alive.remove(&old.id);
            let _ = st.alive.insert(new.id.clone());
            let _ = st.nodes.insert(new.id.clone(), new.clone());
        }
        po.van().disconnect(&old.id);
        if let Err(err) = po.van().connect(&new) {
            warn!("could not connect to replacement {}: {}", new, err);
        }
        for exec in po.executors() {
            exec.replace_node(&old.id, new.clone());
        }
    }

    fn handle_ready_to_exit(&self, sender: &str) {
        let _ = self.state.lock().exit_acks.insert(sender.to_string());
        self.acks_cond.notify_all();
    }

    fn handle_exit(&self) {
        {
            let mut st = self.state.lock();
            st.done = true;
        }
        self.done_cond.notify_all();
        self.ready_cond.notify_all();
    }

    fn send_roster_to(&self, po: &Postoffice, recver: &str, roster: Vec<Node>, conf: Option<String>) {
        let mut ctrl = Control::new(ControlCmd::AddNode);
        ctrl.node = roster;
        ctrl.app_conf = conf;
        self.send_ctrl(po, recver, ctrl);
    }

    fn send_ctrl(&self, po: &Postoffice, recver: &str, ctrl: Control) {
        let mut task = Task::control(ctrl.cmd);
        task.time = self.time.fetch_add(1, Ordering::SeqCst) + 1;
        task.ctrl = Some(ctrl);
        let mut msg = Message::with_task(task, recver);
        msg.sender = po.van().my_node().id;
        po.queue(msg);
    }

    fn roster(&self, st: &ManagerState) -> Vec<Node> {
        let mut roster: Vec<Node> = st.nodes.values().cloned().collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    fn alive_peers(&self, st: &ManagerState) -> Vec<NodeId> {
        st.alive
            .iter()
            .filter(|id| **id != self.scheduler.id)
            .cloned()
            .collect()
    }
}
