// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The per-process I/O driver.
//!
//! One `Postoffice` per node owns the transport, the manager and three
//! threads: the send thread drains the outbound queue into the transport,
//! the recv thread routes inbound messages (control to the manager, data to
//! the addressed customer's executor), and the monitor thread turns
//! transport disconnects into membership events. It is an explicit object
//! handed to whoever needs it, not ambient process state, so several nodes
//! can live in one test process.

use crate::comm::Van;
use crate::config::Config;
use crate::customer::Customer;
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::manager::Manager;
use crate::messaging::{no_filters, FilterFactory, Message};
use crate::types::{provisional_id, CustomerId, Node, NodeRole};
use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

/// The runtime context of one node. See the module docs.
pub struct Postoffice {
    config: Config,
    van: Van,
    manager: Manager,
    sending_tx: Sender<Message>,
    sending_rx: Mutex<Option<Receiver<Message>>>,
    customers: DashMap<CustomerId, Arc<Executor>>,
    /// Data that arrived before its customer registered.
    pending: DashMap<CustomerId, Vec<Message>>,
    /// Serialises registration against routing of early data.
    registry_mu: Mutex<()>,
    next_customer_id: Mutex<CustomerId>,
    filter_factory: FilterFactory,
    /// Joined before the transport closes so queued messages still flush.
    send_thread: Mutex<Option<thread::JoinHandle<()>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Postoffice {
    /// Boots this node: binds the transport, starts the I/O threads and —
    /// unless this is the scheduler — announces the node to the scheduler.
    /// Returns once the node is running; use [`Self::wait_ready`] to block
    /// until the whole roster is assembled.
    pub fn start(config: Config) -> Result<Arc<Self>> {
        Self::start_with_filters(config, no_filters())
    }

    /// Like [`Self::start`], with a codec factory for the filters this
    /// process understands.
    pub fn start_with_filters(config: Config, filter_factory: FilterFactory) -> Result<Arc<Self>> {
        config.validate()?;
        let scheduler = config.scheduler_node()?;
        let my_node = config.my_node()?;
        let is_scheduler = my_node.is_scheduler();

        let van = Van::bind(my_node)?;
        if !is_scheduler && config.my_node.is_none() {
            // The listener picked the port; derive the provisional identity
            // from the effective address.
            let mut node = van.my_node();
            node.id = match config.my_rank {
                Some(rank) => format!("N{}_{}:{}", rank, node.hostname, node.port),
                None => provisional_id(&node.hostname, node.port, node.role),
            };
            van.set_my_node(node);
        }

        let manager = Manager::new(&config, scheduler.clone());
        let (sending_tx, sending_rx) = unbounded();
        let po = Arc::new(Self {
            config,
            van,
            manager,
            sending_tx,
            sending_rx: Mutex::new(Some(sending_rx)),
            customers: DashMap::new(),
            pending: DashMap::new(),
            registry_mu: Mutex::new(()),
            next_customer_id: Mutex::new(0),
            filter_factory,
            send_thread: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        });

        // Bootstrap before the I/O threads run: the scheduler must know
        // itself before the first RequestApp is processed, and a peer's join
        // message just waits in the queue until the send thread starts.
        if is_scheduler {
            po.manager.init_scheduler(po.van.my_node());
        } else {
            po.van.connect(&scheduler)?;
            po.manager.request_app(&po);
        }

        let mut threads = Vec::new();
        *po.send_thread.lock() = Some(
            thread::Builder::new().name("po-send".to_string()).spawn({
                let po = po.clone();
                move || po.send_loop()
            })?,
        );
        threads.push(
            thread::Builder::new().name("po-recv".to_string()).spawn({
                let po = po.clone();
                move || po.recv_loop()
            })?,
        );
        threads.push(
            thread::Builder::new().name("po-monitor".to_string()).spawn({
                let po = po.clone();
                move || po.monitor_loop()
            })?,
        );
        *po.threads.lock() = threads;
        Ok(po)
    }

    pub(crate) fn van(&self) -> &Van {
        &self.van
    }

    pub fn my_node(&self) -> Node {
        self.van.my_node()
    }

    pub fn is_scheduler(&self) -> bool {
        self.my_node().role == NodeRole::Scheduler
    }

    pub fn is_worker(&self) -> bool {
        self.my_node().role == NodeRole::Worker
    }

    pub fn is_server(&self) -> bool {
        self.my_node().role == NodeRole::Server
    }

    /// Blocks until the scheduler has assembled and distributed the full
    /// roster (including this node's assigned identity).
    pub fn wait_ready(&self) -> Result<()> {
        self.manager.wait_ready()
    }

    /// The application configuration distributed with the roster.
    pub fn app_conf(&self) -> Option<String> {
        self.manager.app_conf()
    }

    /// The next unused customer id on this node. Customer ids must agree
    /// across the fleet for peers that talk to each other.
    pub fn next_customer_id(&self) -> CustomerId {
        let mut next = self.next_customer_id.lock();
        *next += 1;
        *next
    }

    /// Attaches `customer` under `id` and starts its executor, seeded with
    /// every node known so far. Register customers after [`Self::wait_ready`]
    /// so they are born with their final identity.
    pub fn register_customer(
        &self,
        id: CustomerId,
        customer: Arc<dyn Customer>,
    ) -> Result<Arc<Executor>> {
        if self.customers.contains_key(&id) {
            return Err(Error::CustomerExists(id));
        }
        let exec = Executor::spawn(
            id,
            customer,
            self.van.my_node(),
            self.config.num_replicas,
            self.sending_tx.clone(),
            self.filter_factory.clone(),
        )?;
        for node in self.manager.nodes_snapshot() {
            exec.add_node(node);
        }
        {
            let _guard = self.registry_mu.lock();
            let _ = self.customers.insert(id, exec.clone());
            if let Some((_, early)) = self.pending.remove(&id) {
                debug!("delivering {} early messages to customer {}", early.len(), id);
                for msg in early {
                    exec.accept(msg);
                }
            }
        }
        Ok(exec)
    }

    pub fn remove_customer(&self, id: CustomerId) {
        if let Some((_, exec)) = self.customers.remove(&id) {
            exec.stop();
        }
    }

    /// Queues a message for the send thread. Thread safe.
    pub fn queue(&self, msg: Message) {
        if self.sending_tx.send(msg).is_err() {
            debug!("dropping queued message; runtime is shutting down");
        }
    }

    pub(crate) fn executors(&self) -> Vec<Arc<Executor>> {
        self.customers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Shuts this node down.
    ///
    /// On a peer this reports ReadyToExit and blocks until the scheduler's
    /// Exit; on the scheduler it blocks until every living peer has
    /// reported, then broadcasts Exit. Either way the executors and I/O
    /// threads are then joined. Returns an error if the control plane failed
    /// (e.g. the scheduler died).
    pub fn stop(&self) -> Result<()> {
        let result = if self.is_scheduler() {
            self.manager.scheduler_stop(self)
        } else {
            self.manager.peer_stop(self)
        };

        for exec in self.executors() {
            exec.stop();
        }
        // Flush the outbound queue (the Exit broadcast rides on it) before
        // tearing the transport down.
        let mut terminate = Message::new();
        terminate.terminate = true;
        let _ = self.sending_tx.send(terminate);
        if let Some(handle) = self.send_thread.lock().take() {
            let _ = handle.join();
        }
        self.van.shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        result
    }

    fn send_loop(&self) {
        let rx = match self.sending_rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        while let Ok(msg) = rx.recv() {
            if msg.terminate {
                break;
            }
            let recver = msg.recver.clone();
            if let Err(err) = self.van.send(msg) {
                warn!("send to {} failed: {}", recver, err);
            }
        }
        trace!("send thread stopped");
    }

    fn recv_loop(self: &Arc<Self>) {
        loop {
            let mut msg = match self.van.recv() {
                Ok(msg) => msg,
                Err(_) => break,
            };
            if msg.terminate {
                break;
            }
            if let Some(id) = msg.disconnected.take() {
                self.manager.node_disconnected(id, self);
                continue;
            }
            if msg.task.control {
                if let Err(err) = self.manager.process(msg, self) {
                    warn!("control message failed: {}", err);
                }
            } else {
                let id = msg.task.customer_id;
                match self.customers.get(&id) {
                    Some(exec) => exec.accept(msg),
                    None => {
                        // Not registered (yet); park the message so a late
                        // customer still sees everything in order.
                        let _guard = self.registry_mu.lock();
                        match self.customers.get(&id) {
                            Some(exec) => exec.accept(msg),
                            None => self.pending.entry(id).or_default().push(msg),
                        }
                    }
                }
            }
        }
        trace!("recv thread stopped");
    }

    /// Turns raw transport disconnects into ordered membership events: the
    /// marker queues behind everything the dead peer already delivered.
    fn monitor_loop(self: &Arc<Self>) {
        let events = match self.van.take_events() {
            Some(events) => events,
            None => return,
        };
        while let Ok(id) = events.recv() {
            self.van.inject_disconnect(id);
        }
        trace!("monitor thread stopped");
    }
}
