// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! End-to-end key-range slicing across two servers: each server receives
//! exactly the keys of its shard, and a message whose span misses a shard
//! entirely never reaches that server yet still completes.

mod utils;

use eyre::Result;
use parking_lot::Mutex;
use ps_runtime::messaging::Message;
use ps_runtime::types::{KeyRange, Node, NodeRole, SERVER_GROUP};
use ps_runtime::{Config, Customer, Postoffice};
use std::sync::Arc;
use std::thread;
use utils::{free_port, scheduler_config, CUSTOMER_ID};

type SeenRequest = (String, Vec<u64>, Vec<f64>);

#[derive(Default)]
struct ShardApp {
    requests: Mutex<Vec<SeenRequest>>,
}

impl Customer for ShardApp {
    fn process_request(&self, req: &mut Message) {
        let values = if req.value.is_empty() {
            Vec::new()
        } else {
            req.value_as::<f64>(0)
        };
        self.requests
            .lock()
            .push((req.original_recver.clone(), req.key_as::<u64>(), values));
    }
}

fn run_peer(spec: String, half: u64) -> thread::JoinHandle<Result<(Node, Vec<SeenRequest>)>> {
    thread::spawn(move || {
        let po = Postoffice::start(Config::new(&spec))?;
        po.wait_ready()?;
        let app = Arc::new(ShardApp::default());
        let exec = po.register_customer(CUSTOMER_ID, app.clone())?;

        if po.is_worker() {
            // Spans both shards: split at the boundary.
            let mut wide = Message::to(SERVER_GROUP);
            wide.set_key(&[10u64, half, half + 5]);
            wide.add_value(&[1.0f64, 2.0, 3.0]);
            let ts = exec.submit(wide)?;
            exec.wait_sent_req(ts)?;

            // Confined to the low shard: the high server is skipped locally
            // and the wait still completes.
            let mut narrow = Message::to(SERVER_GROUP);
            narrow.task.key_range = Some(KeyRange::new(0, 1000));
            narrow.set_key(&[1u64, 2, 3]);
            let ts = exec.submit(narrow)?;
            exec.wait_sent_req(ts)?;
        }

        po.stop()?;
        let requests = app.requests.lock().clone();
        Ok((po.my_node(), requests))
    })
}

#[test]
fn keyed_messages_split_by_shard() -> Result<()> {
    let port = free_port()?;
    let spec = format!("role:SCHEDULER,hostname:127.0.0.1,port:{},id:'H'", port);
    let half = 1u64 << 63;

    let scheduler = thread::spawn({
        let spec = spec.clone();
        move || -> Result<()> {
            let po = Postoffice::start(scheduler_config(&spec, 1, 2))?;
            po.wait_ready()?;
            po.stop()?;
            Ok(())
        }
    });
    let peers = [
        run_peer(spec.clone(), half),
        run_peer(spec.clone(), half),
        run_peer(spec, half),
    ];

    let outcomes: Vec<(Node, Vec<SeenRequest>)> = peers
        .into_iter()
        .map(|handle| handle.join().expect("peer panicked"))
        .collect::<Result<_>>()?;
    scheduler.join().expect("scheduler panicked")?;

    // The two servers split the key space evenly; the exact cut sits within
    // a rounding step of 2^63, so select by which side of it they own.
    let low = outcomes
        .iter()
        .find(|(node, _)| node.role == NodeRole::Server && node.key_range.lo == 0)
        .expect("low-shard server");
    let high = outcomes
        .iter()
        .find(|(node, _)| node.role == NodeRole::Server && node.key_range.lo > 0)
        .expect("high-shard server");

    let seen = &low.1;
    assert_eq!(seen.len(), 2, "low server sees both messages: {:?}", seen);
    assert_eq!(seen[0].0, SERVER_GROUP);
    assert_eq!(seen[0].1, vec![10]);
    assert_eq!(seen[0].2, vec![1.0]);
    assert_eq!(seen[1].1, vec![1, 2, 3]);

    let seen = &high.1;
    assert_eq!(seen.len(), 1, "high server sees only the wide message: {:?}", seen);
    assert_eq!(seen[0].1, vec![half, half + 5]);
    assert_eq!(seen[0].2, vec![2.0, 3.0]);
    Ok(())
}
