// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use eyre::Result;
use ps_runtime::Config;
use std::net::TcpListener;
use std::time::{Duration, Instant};

/// The customer id every node in these tests registers under.
pub const CUSTOMER_ID: i32 = 1;

/// Picks a currently free loopback port for the scheduler to bind.
pub fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

pub fn scheduler_config(spec: &str, workers: usize, servers: usize) -> Config {
    let mut config = Config::new(spec);
    config.my_node = Some(spec.to_string());
    config.num_workers = workers;
    config.num_servers = servers;
    config
}

/// Polls `cond` for up to five seconds.
#[allow(dead_code)]
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
