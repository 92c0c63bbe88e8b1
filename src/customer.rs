// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::error::Result;
use crate::messaging::{replicate, slice_key_ordered, Message};
use crate::types::KeyRange;

/// Application logic attached to one executor.
///
/// A customer is registered with the [`Postoffice`](crate::Postoffice) under
/// a numeric id; its handlers run on the executor's worker thread, outside
/// the executor's locks, and must not re-submit under the timestamp being
/// processed.
pub trait Customer: Send + Sync + 'static {
    /// Handles an incoming request.
    ///
    /// The default reply (empty, same timestamp) goes out when this returns,
    /// unless the handler already replied via
    /// [`Executor::reply`](crate::Executor::reply) or cleared `req.finished`
    /// to defer completion to a later
    /// [`finish_recv_req`](crate::Executor::finish_recv_req) call.
    fn process_request(&self, req: &mut Message) {
        let _ = req;
    }

    /// Handles an incoming response to a request this customer submitted.
    fn process_response(&self, res: &mut Message) {
        let _ = res;
    }

    /// Splits a submitted message into one sub-message per target range, in
    /// range order. Sub-messages that should not be transmitted are marked
    /// `valid = false`.
    ///
    /// The default replicates non-keyed messages and range-splits keyed ones.
    fn slice(&self, msg: Message, ranges: &[KeyRange]) -> Result<Vec<Message>> {
        if msg.task.has_key {
            slice_key_ordered(&msg, ranges)
        } else {
            Ok(replicate(&msg, ranges))
        }
    }
}
