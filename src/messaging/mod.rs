// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The message envelope: an immutable `Task` header plus key/value payload
//! arrays, and the control bodies the membership plane rides on.

mod filter;
mod slice;
mod wire_msg;

pub use filter::{Filter, FilterConfig, FilterFactory, FilterKind, no_filters};
pub use slice::{replicate, slice_key_ordered};
pub use wire_msg::WireMsg;

use crate::types::{KeyRange, Node, NodeId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

/// Sentinel timestamp. Never blocks a dependency wait and never matches a
/// tracked request.
pub const INVALID_TIME: i32 = -1;

/// Element type of a key or value array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Uint8,
    Int8,
    Uint32,
    Int32,
    Uint64,
    Int64,
    Float,
    Double,
    #[default]
    Other,
}

/// A scalar that can live in a key or value array.
pub trait Scalar: Copy + Send + Sync + 'static {
    const DATA_TYPE: DataType;
    const WIDTH: usize;
    fn write_le(&self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($t:ty, $dt:expr) => {
        impl Scalar for $t {
            const DATA_TYPE: DataType = $dt;
            const WIDTH: usize = std::mem::size_of::<$t>();
            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_scalar!(u8, DataType::Uint8);
impl_scalar!(i8, DataType::Int8);
impl_scalar!(u32, DataType::Uint32);
impl_scalar!(i32, DataType::Int32);
impl_scalar!(u64, DataType::Uint64);
impl_scalar!(i64, DataType::Int64);
impl_scalar!(f32, DataType::Float);
impl_scalar!(f64, DataType::Double);

pub(crate) fn scalars_to_bytes<T: Scalar>(vals: &[T]) -> Bytes {
    let mut out = Vec::with_capacity(vals.len() * T::WIDTH);
    for v in vals {
        v.write_le(&mut out);
    }
    Bytes::from(out)
}

pub(crate) fn bytes_to_scalars<T: Scalar>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::WIDTH).map(T::read_le).collect()
}

/// Membership commands carried by control messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCmd {
    /// A joining peer asks the scheduler for an identity and role.
    RequestApp,
    /// The scheduler announces (part of) the roster.
    AddNode,
    /// A peer left; mark it dead everywhere.
    RemoveNode,
    /// A dead peer has a replacement.
    ReplaceNode,
    /// A non-scheduler node has no more work to submit.
    ReadyToExit,
    /// Shut the process down.
    Exit,
}

/// Body of a control message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub cmd: ControlCmd,
    pub node: Vec<Node>,
    pub app_conf: Option<String>,
}

impl Control {
    pub fn new(cmd: ControlCmd) -> Self {
        Self {
            cmd,
            node: Vec::new(),
            app_conf: None,
        }
    }
}

/// The message header. Everything a receiver needs to route, order and
/// decode the payload arrays that follow it on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Sender-assigned timestamp, unique per customer.
    pub time: i32,
    /// Request timestamps from the same sender that must be processed first.
    pub wait_time: Vec<i32>,
    /// True for requests, false for responses.
    pub request: bool,
    /// True for membership-plane messages; routed to the manager.
    pub control: bool,
    /// The customer this task belongs to.
    pub customer_id: i32,
    /// The group this message was addressed to before slicing, so the
    /// receiver can tell a direct send from a group shard.
    pub original_recver: Option<NodeId>,
    /// The span of the key space the key array covers.
    pub key_range: Option<KeyRange>,
    /// Whether a key array part follows the header on the wire.
    pub has_key: bool,
    pub key_type: DataType,
    /// One entry per value array part.
    pub value_type: Vec<DataType>,
    /// Codecs to apply before transmission, in order.
    pub filter: Vec<FilterConfig>,
    pub ctrl: Option<Control>,
    /// Opaque application payload.
    pub msg: Option<Bytes>,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            time: INVALID_TIME,
            wait_time: Vec::new(),
            request: false,
            control: false,
            customer_id: 0,
            original_recver: None,
            key_range: None,
            has_key: false,
            key_type: DataType::Other,
            value_type: Vec::new(),
            filter: Vec::new(),
            ctrl: None,
            msg: None,
        }
    }
}

impl Task {
    /// A control task carrying `cmd`.
    pub fn control(cmd: ControlCmd) -> Self {
        Self {
            control: true,
            request: true,
            ctrl: Some(Control::new(cmd)),
            ..Default::default()
        }
    }
}

/// Fires once when a submitted request has completed group-wide.
pub type Callback = Box<dyn FnOnce() + Send + Sync + 'static>;

/// Fires each time any response for a submitted request arrives; a group
/// recver produces one call per replying member.
pub type RecvHandle = Arc<dyn Fn() + Send + Sync + 'static>;

/// A routable message: `Task` header, payload arrays, and local-only flags
/// that never cross the wire.
#[derive(Default)]
pub struct Message {
    pub task: Task,
    /// The key array, `task.key_type`-encoded. Empty unless `task.has_key`.
    pub key: Bytes,
    /// Value arrays, aligned with `task.value_type`.
    pub value: Vec<Bytes>,

    pub sender: NodeId,
    pub recver: NodeId,
    /// The group id this message was addressed to before slicing, if any.
    pub original_recver: NodeId,

    /// Set once a reply for this request has been queued.
    pub replied: bool,
    /// Cleared by a request handler that will call `finish_recv_req` later.
    pub finished: bool,
    /// An invalid message is not transmitted; its shard is marked done.
    pub valid: bool,
    /// Stops the sending thread when it pops this message.
    pub terminate: bool,
    /// Process-local marker: the named peer's channel dropped. Ordered
    /// behind everything the peer sent, unlike a raw monitor event.
    pub(crate) disconnected: Option<NodeId>,

    pub recv_handle: Option<RecvHandle>,
    pub fin_handle: Option<Callback>,
}

impl Message {
    pub fn new() -> Self {
        Self {
            finished: true,
            valid: true,
            ..Default::default()
        }
    }

    /// A message addressed to `recver`.
    pub fn to(recver: impl Into<NodeId>) -> Self {
        Self {
            recver: recver.into(),
            ..Self::new()
        }
    }

    /// A message carrying `task`, addressed to `recver`.
    pub fn with_task(task: Task, recver: impl Into<NodeId>) -> Self {
        Self {
            task,
            ..Self::to(recver)
        }
    }

    /// A copy of the header and routing flags with no payload arrays: the
    /// starting point of every sliced sub-message. `has_key` is cleared; the
    /// rest of the task (including `value_type`) is carried over and the
    /// slicer re-populates the arrays.
    pub fn mini_copy(&self) -> Message {
        let mut task = self.task.clone();
        task.has_key = false;
        Message {
            task,
            terminate: self.terminate,
            original_recver: self.original_recver.clone(),
            ..Self::new()
        }
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    /// Installs `keys` as the key array, recording its type and defaulting
    /// the key range to the whole key space.
    pub fn set_key<T: Scalar>(&mut self, keys: &[T]) {
        self.task.key_type = T::DATA_TYPE;
        self.task.has_key = true;
        self.key = scalars_to_bytes(keys);
        if self.task.key_range.is_none() {
            self.task.key_range = Some(KeyRange::all());
        }
    }

    /// Appends a value array aligned with the key array.
    pub fn add_value<T: Scalar>(&mut self, vals: &[T]) {
        self.task.value_type.push(T::DATA_TYPE);
        self.value.push(scalars_to_bytes(vals));
    }

    pub fn key_as<T: Scalar>(&self) -> Vec<T> {
        bytes_to_scalars(&self.key)
    }

    pub fn value_as<T: Scalar>(&self, i: usize) -> Vec<T> {
        bytes_to_scalars(&self.value[i])
    }

    pub fn clear_key(&mut self) {
        self.task.has_key = false;
        self.task.key_type = DataType::Other;
        self.key = Bytes::new();
    }

    pub fn clear_value(&mut self) {
        self.task.value_type.clear();
        self.value.clear();
    }

    pub fn clear_data(&mut self) {
        self.clear_key();
        self.clear_value();
    }

    /// Number of payload parts that follow the header on the wire.
    pub fn data_parts(&self) -> usize {
        usize::from(self.task.has_key) + self.value.len()
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} => {}", self.sender, self.recver)?;
        if !self.original_recver.is_empty() {
            write!(f, " ({})", self.original_recver)?;
        }
        if self.has_key() {
            write!(f, " key[{}]", self.key.len())?;
        }
        if !self.value.is_empty() {
            let sizes: Vec<usize> = self.value.iter().map(Bytes::len).collect();
            write!(f, " value{:?}", sizes)?;
        }
        if !self.valid {
            write!(f, " INVALID")?;
        }
        write!(f, " {:?}", self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_key_and_value_round_trip() {
        let mut msg = Message::new();
        msg.set_key(&[1u64, 2, 3]);
        msg.add_value(&[1.0f64, 2.0, 3.0]);
        assert!(msg.task.has_key);
        assert_eq!(msg.task.key_type, DataType::Uint64);
        assert_eq!(msg.task.key_range, Some(KeyRange::all()));
        assert_eq!(msg.key_as::<u64>(), vec![1, 2, 3]);
        assert_eq!(msg.value_as::<f64>(0), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn mini_copy_keeps_header_but_drops_data() {
        let mut msg = Message::to("S0");
        msg.task.time = 7;
        msg.original_recver = "S".to_string();
        msg.set_key(&[4u64, 5]);
        msg.add_value(&[9i32, 10]);

        let copy = msg.mini_copy();
        assert_eq!(copy.task.time, 7);
        assert!(!copy.task.has_key);
        // value_type is carried over; the slicer refills the arrays.
        assert_eq!(copy.task.value_type, vec![DataType::Int32]);
        assert!(copy.key.is_empty());
        assert!(copy.value.is_empty());
        assert_eq!(copy.original_recver, "S");
    }
}
