// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use crate::types::NodeId;
use thiserror::Error;

/// The type returned by this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal error.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("there is no channel to node {0}")]
    NoChannel(NodeId),
    #[error("node {0} is not known to this executor")]
    UnknownNode(NodeId),
    #[error("no customer is registered under id {0}")]
    UnknownCustomer(i32),
    #[error("customer {0} is already registered")]
    CustomerExists(i32),
    #[error("timestamp {got} is not newer than {last} for this customer")]
    NonMonotonicTimestamp { got: i32, last: i32 },
    #[error("timestamp {0} was never submitted by this customer")]
    UnknownTimestamp(i32),
    #[error("could not serialize message: {0}")]
    Serialisation(String),
    #[error("could not parse message: {0}")]
    FailedToParse(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("slicing produced {got} sub-messages for {expected} key ranges")]
    SliceMismatch { got: usize, expected: usize },
    #[error("the runtime is shutting down")]
    Disconnected,
    #[error("the scheduler is gone; the computation cannot make progress")]
    SchedulerDied,
}
