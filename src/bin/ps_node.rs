// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! A runnable node: joins the computation under the scheduler and, on
//! workers, drives a small hello round against the server group.
//!
//! One process per node:
//!
//! ```text
//! ps_node --scheduler "role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'" \
//!         --my-node   "role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'" \
//!         --num-workers 1 --num-servers 1
//! ps_node --scheduler "role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'"   # twice
//! ```

use eyre::Result;
use ps_runtime::messaging::Message;
use ps_runtime::types::SERVER_GROUP;
use ps_runtime::{init_logging, Config, Customer, Postoffice};
use std::sync::Arc;
use structopt::StructOpt;
use tracing::info;

#[derive(Default)]
struct HelloApp;

impl Customer for HelloApp {
    fn process_request(&self, req: &mut Message) {
        info!("processing request {} from {}", req.task.time, req.sender);
    }

    fn process_response(&self, res: &mut Message) {
        info!("received response {} from {}", res.task.time, res.sender);
    }
}

fn main() -> Result<()> {
    init_logging();
    let config = Config::from_args();
    let po = Postoffice::start(config)?;
    po.wait_ready()?;
    let node = po.my_node();
    info!("ready as {}", node);

    let exec = po.register_customer(po.next_customer_id(), Arc::new(HelloApp))?;
    if po.is_worker() {
        for _ in 0..3 {
            let ts = exec.submit(Message::to(SERVER_GROUP))?;
            exec.wait_sent_req(ts)?;
            info!("request {} finished", ts);
        }
    }

    po.stop()?;
    info!("{} done", node.id);
    Ok(())
}
