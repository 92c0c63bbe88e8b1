// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node identities, roles and key ranges.

mod range;

pub use range::KeyRange;

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A node is addressed by its id string.
pub type NodeId = String;

/// Customers within a process are addressed by a numeric id.
pub type CustomerId = i32;

/// The scheduler's well-known id.
pub const SCHEDULER_ID: &str = "H";

/// Virtual id addressing every server.
pub const SERVER_GROUP: &str = "S";
/// Virtual id addressing every worker.
pub const WORKER_GROUP: &str = "W";
/// Virtual id addressing servers and workers.
pub const COMP_GROUP: &str = "C";
/// Virtual id addressing every non-scheduler node.
pub const LIVE_GROUP: &str = "L";
/// Virtual id addressing the servers replicating this server's range.
pub const REPLICA_GROUP: &str = "R";
/// Virtual id addressing the servers this server replicates for.
pub const OWNER_GROUP: &str = "O";

/// All virtual group ids. No concrete node may use one of these.
pub const GROUP_IDS: [&str; 6] = [
    SERVER_GROUP,
    WORKER_GROUP,
    COMP_GROUP,
    LIVE_GROUP,
    REPLICA_GROUP,
    OWNER_GROUP,
];

/// Returns true if `id` names a virtual group rather than a concrete node.
pub fn is_group_id(id: &str) -> bool {
    GROUP_IDS.contains(&id)
}

/// What a node does in the computation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    /// The single control-plane node.
    Scheduler,
    /// Drives the computation; submits requests.
    Worker,
    /// Owns a shard of the key space.
    Server,
    /// A virtual node standing for a set of concrete peers.
    Group,
    /// Joined but not assigned a role in this computation.
    Unused,
}

impl NodeRole {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "SCHEDULER" => Ok(NodeRole::Scheduler),
            "WORKER" => Ok(NodeRole::Worker),
            "SERVER" => Ok(NodeRole::Server),
            "UNUSED" => Ok(NodeRole::Unused),
            other => Err(Error::InvalidConfig(format!("unknown role '{}'", other))),
        }
    }
}

/// A member of the computation, concrete or virtual.
///
/// Identity is the id string. Group nodes carry no address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub role: NodeRole,
    pub hostname: String,
    pub port: u16,
    /// The shard this node owns; empty unless the node is a server.
    pub key_range: KeyRange,
}

impl Node {
    /// A concrete node at `hostname:port`. The id may be provisional until
    /// the scheduler assigns the final one.
    pub fn new(id: impl Into<NodeId>, role: NodeRole, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            role,
            hostname: hostname.into(),
            port,
            key_range: KeyRange::default(),
        }
    }

    /// A virtual group node. Carries no address.
    pub fn group(id: &str) -> Self {
        debug_assert!(is_group_id(id));
        Self {
            id: id.to_string(),
            role: NodeRole::Group,
            hostname: String::new(),
            port: 0,
            key_range: KeyRange::default(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn is_scheduler(&self) -> bool {
        self.role == NodeRole::Scheduler
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}@{})", self.id, self.role, self.addr())
    }
}

/// Parses a bootstrap string such as
/// `role:SCHEDULER,hostname:127.0.0.1,port:8000,id:'H'`.
///
/// Fields may come in any order; `id` is optional (a provisional id is
/// derived from the address) and may be quoted with single quotes.
impl FromStr for Node {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut role = None;
        let mut hostname = None;
        let mut port = None;
        let mut id = None;
        for field in s.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = field
                .split_once(':')
                .ok_or_else(|| Error::InvalidConfig(format!("bad node field '{}'", field)))?;
            let value = value.trim().trim_matches('\'');
            match key.trim() {
                "role" => role = Some(NodeRole::parse(value)?),
                "hostname" => hostname = Some(value.to_string()),
                "port" => {
                    port = Some(value.parse::<u16>().map_err(|e| {
                        Error::InvalidConfig(format!("bad port '{}': {}", value, e))
                    })?)
                }
                "id" => id = Some(value.to_string()),
                other => {
                    return Err(Error::InvalidConfig(format!("unknown node field '{}'", other)))
                }
            }
        }
        let role = role.unwrap_or(NodeRole::Unused);
        let hostname =
            hostname.ok_or_else(|| Error::InvalidConfig(format!("no hostname in '{}'", s)))?;
        let port = port.ok_or_else(|| Error::InvalidConfig(format!("no port in '{}'", s)))?;
        let id = id.unwrap_or_else(|| provisional_id(&hostname, port, role));
        if is_group_id(&id) {
            return Err(Error::InvalidConfig(format!("'{}' is a reserved group id", id)));
        }
        Ok(Node {
            id,
            role,
            hostname,
            port,
            key_range: KeyRange::default(),
        })
    }
}

/// The id a node uses before the scheduler assigns its final one.
pub fn provisional_id(hostname: &str, port: u16, role: NodeRole) -> NodeId {
    match role {
        NodeRole::Scheduler => SCHEDULER_ID.to_string(),
        _ => format!("N_{}:{}", hostname, port),
    }
}
