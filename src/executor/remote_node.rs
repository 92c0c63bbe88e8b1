// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::tracker::Tracker;
use crate::messaging::{Filter, FilterFactory, FilterKind, Message};
use crate::types::{KeyRange, Node, NodeId};
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};

/// What this executor knows about one peer, concrete or group.
///
/// A group peer lists its members in ascending order of their key range's
/// lower bound, with `sub_key_ranges` index-aligned; a concrete peer's lists
/// are empty. Peers are never removed, only marked dead, so stale traffic
/// from a removed node still hits its trackers and is swallowed.
pub(crate) struct RemoteNode {
    pub node: Node,
    pub alive: bool,
    /// Requests this executor sent to the peer.
    pub sent_req_tracker: Tracker,
    /// Requests this executor received from the peer.
    pub recv_req_tracker: Tracker,
    /// Member ids, for group peers.
    pub sub_nodes: Vec<NodeId>,
    /// Member key ranges, aligned with `sub_nodes`.
    pub sub_key_ranges: Vec<KeyRange>,
    /// Codec instances for this peer, created lazily per filter kind.
    filters: HashMap<FilterKind, Box<dyn Filter>>,
}

impl RemoteNode {
    pub fn new(node: Node) -> Self {
        Self {
            node,
            alive: true,
            sent_req_tracker: Tracker::new(),
            recv_req_tracker: Tracker::new(),
            sub_nodes: Vec::new(),
            sub_key_ranges: Vec::new(),
            filters: HashMap::new(),
        }
    }

    /// Inserts a member, keeping the list ordered by `key_range.lo`. Group
    /// sizes are bounded by the fleet, so a linear scan is fine.
    pub fn add_sub_node(&mut self, id: NodeId, range: KeyRange) {
        if self.sub_nodes.contains(&id) {
            return;
        }
        let pos = self
            .sub_key_ranges
            .iter()
            .position(|r| range.starts_before(r))
            .unwrap_or(self.sub_nodes.len());
        self.sub_nodes.insert(pos, id);
        self.sub_key_ranges.insert(pos, range);
    }

    pub fn remove_sub_node(&mut self, id: &str) {
        if let Some(pos) = self.sub_nodes.iter().position(|n| n == id) {
            let _ = self.sub_nodes.remove(pos);
            let _ = self.sub_key_ranges.remove(pos);
        }
    }

    /// Applies the message's filters in declaration order.
    pub fn encode_message(&mut self, msg: &mut Message, factory: &FilterFactory) {
        for conf in msg.task.filter.clone() {
            if let Some(filter) = self.filter_for(conf.kind, factory, &conf) {
                filter.encode(msg);
            }
        }
    }

    /// Applies the message's filters in reverse order.
    pub fn decode_message(&mut self, msg: &mut Message, factory: &FilterFactory) {
        for conf in msg.task.filter.clone().into_iter().rev() {
            if let Some(filter) = self.filter_for(conf.kind, factory, &conf) {
                filter.decode(msg);
            }
        }
    }

    fn filter_for(
        &mut self,
        kind: FilterKind,
        factory: &FilterFactory,
        conf: &crate::messaging::FilterConfig,
    ) -> Option<&mut Box<dyn Filter>> {
        if !self.filters.contains_key(&kind) {
            match (**factory)(conf) {
                Some(filter) => {
                    let _ = self.filters.insert(kind, filter);
                }
                None => {
                    warn!("no codec for filter {:?}; skipping", kind);
                    return None;
                }
            }
        }
        self.filters.get_mut(&kind)
    }
}

impl Debug for RemoteNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteNode")
            .field("node", &self.node)
            .field("alive", &self.alive)
            .field("sub_nodes", &self.sub_nodes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeRole;

    fn server(id: &str, lo: u64, hi: u64) -> Node {
        let mut node = Node::new(id, NodeRole::Server, "127.0.0.1", 0);
        node.key_range = KeyRange::new(lo, hi);
        node
    }

    #[test]
    fn sub_nodes_stay_ordered_by_range() {
        let mut group = RemoteNode::new(Node::group(crate::types::SERVER_GROUP));
        let b = server("S1", 100, 200);
        let a = server("S0", 0, 100);
        let c = server("S2", 200, 300);
        group.add_sub_node(b.id.clone(), b.key_range);
        group.add_sub_node(c.id.clone(), c.key_range);
        group.add_sub_node(a.id.clone(), a.key_range);
        assert_eq!(group.sub_nodes, vec!["S0", "S1", "S2"]);
        assert_eq!(
            group.sub_key_ranges,
            vec![a.key_range, b.key_range, c.key_range]
        );

        // Re-adding is a no-op; removal keeps alignment.
        group.add_sub_node(a.id.clone(), a.key_range);
        assert_eq!(group.sub_nodes.len(), 3);
        group.remove_sub_node("S1");
        assert_eq!(group.sub_nodes, vec!["S0", "S2"]);
        assert_eq!(group.sub_key_ranges, vec![a.key_range, c.key_range]);
    }
}
