// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use super::{Message, Task};
use crate::error::{Error, Result};
use crate::types::NodeId;
use bincode::{
    config::{BigEndian, FixintEncoding, WithOtherEndian, WithOtherIntEncoding},
    Options,
};
use bytes::Bytes;
use lazy_static::lazy_static;
use std::io::{Read, Write};

// A message never carries more parts than a header, a key array and one
// value array per value type; anything bigger is version skew or corruption.
const MAX_PARTS: u32 = 1024;
// Single-part cap. Payload arrays are sliced per shard well below this.
const MAX_PART_LEN: u32 = 1 << 30;

lazy_static! {
    // Options used for all bincode encoding.
    static ref BINCODE_OPTIONS: WithOtherIntEncoding<
        WithOtherEndian<bincode::DefaultOptions, BigEndian>,
        FixintEncoding,
    > = {
        bincode::DefaultOptions::new()
            .with_big_endian()
            // We want known sizes in our wire format.
            .with_fixint_encoding()
    };
}

/// Serialises messages into multipart frames and back.
///
/// On the wire a message is a part count followed by length-prefixed parts:
/// the serialized [`Task`] header, then the key array iff `task.has_key`,
/// then one part per entry of `task.value_type`. The sender identity is not a
/// part; the channel itself is identity-tagged at connect time.
pub struct WireMsg;

impl WireMsg {
    pub fn encode_task(task: &Task) -> Result<Bytes> {
        let buf = BINCODE_OPTIONS
            .serialize(task)
            .map_err(|err| Error::Serialisation(format!("task header: {}", err)))?;
        Ok(Bytes::from(buf))
    }

    pub fn decode_task(bytes: &[u8]) -> Result<Task> {
        BINCODE_OPTIONS
            .deserialize(bytes)
            .map_err(|err| Error::FailedToParse(format!("task header: {}", err)))
    }

    /// The parts of `msg` in wire order. `task.has_key` is re-derived from
    /// the key array so the header always matches the parts that follow it.
    /// Fails if the value arrays do not match what the header declares.
    pub fn to_parts(msg: &mut Message) -> Result<Vec<Bytes>> {
        msg.task.has_key = !msg.key.is_empty();
        msg.task.original_recver = if msg.original_recver.is_empty() {
            None
        } else {
            Some(msg.original_recver.clone())
        };
        if msg.value.len() != msg.task.value_type.len() {
            return Err(Error::Serialisation(format!(
                "{} value arrays but {} value types",
                msg.value.len(),
                msg.task.value_type.len()
            )));
        }
        let mut parts = Vec::with_capacity(1 + msg.data_parts());
        parts.push(Self::encode_task(&msg.task)?);
        if msg.task.has_key {
            parts.push(msg.key.clone());
        }
        parts.extend(msg.value.iter().cloned());
        Ok(parts)
    }

    /// Reassembles a message received from `sender`. The part layout must
    /// match the header exactly; a mismatch is a protocol violation.
    pub fn from_parts(sender: NodeId, recver: NodeId, mut parts: Vec<Bytes>) -> Result<Message> {
        if parts.is_empty() {
            return Err(Error::FailedToParse("empty frame".to_string()));
        }
        let data = parts.split_off(1);
        let task = Self::decode_task(&parts[0])?;
        let expected = usize::from(task.has_key) + task.value_type.len();
        if data.len() != expected {
            return Err(Error::FailedToParse(format!(
                "{} data parts from {} but the header declares {}",
                data.len(),
                sender,
                expected
            )));
        }
        let mut data = data.into_iter();
        let key = if task.has_key {
            data.next().unwrap_or_default()
        } else {
            Bytes::new()
        };
        let mut msg = Message::new();
        msg.original_recver = task.original_recver.clone().unwrap_or_default();
        msg.task = task;
        msg.key = key;
        msg.value = data.collect();
        msg.sender = sender;
        msg.recver = recver;
        Ok(msg)
    }

    /// Writes one multipart frame.
    pub fn write_parts<W: Write>(writer: &mut W, parts: &[Bytes]) -> Result<()> {
        writer.write_all(&(parts.len() as u32).to_be_bytes())?;
        for part in parts {
            writer.write_all(&(part.len() as u32).to_be_bytes())?;
            writer.write_all(part)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads one complete multipart frame, blocking until it is all in.
    pub fn read_parts<R: Read>(reader: &mut R) -> Result<Vec<Bytes>> {
        let count = read_u32(reader)?;
        if count == 0 || count > MAX_PARTS {
            return Err(Error::FailedToParse(format!("bad part count {}", count)));
        }
        let mut parts = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u32(reader)?;
            if len > MAX_PART_LEN {
                return Err(Error::FailedToParse(format!("part of {} bytes", len)));
            }
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf)?;
            parts.push(Bytes::from(buf));
        }
        Ok(parts)
    }
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{Control, ControlCmd, DataType};
    use crate::types::{KeyRange, Node, NodeRole};
    use assert_matches::assert_matches;
    use std::io::Cursor;

    fn sample_task() -> Task {
        let mut task = Task::default();
        task.time = 42;
        task.wait_time = vec![40, 41];
        task.request = true;
        task.customer_id = 3;
        task.key_range = Some(KeyRange::new(0, 1 << 20));
        task.has_key = true;
        task.key_type = DataType::Uint64;
        task.value_type = vec![DataType::Double];
        task.msg = Some(Bytes::from_static(b"payload"));
        task
    }

    #[test]
    fn task_round_trip() -> eyre::Result<()> {
        let task = sample_task();
        let bytes = WireMsg::encode_task(&task)?;
        assert_eq!(WireMsg::decode_task(&bytes)?, task);

        let mut ctrl = Task::control(ControlCmd::AddNode);
        let mut body = Control::new(ControlCmd::AddNode);
        body.node = vec![Node::new("S0", NodeRole::Server, "127.0.0.1", 9000)];
        body.app_conf = Some("conf".to_string());
        ctrl.ctrl = Some(body);
        let bytes = WireMsg::encode_task(&ctrl)?;
        assert_eq!(WireMsg::decode_task(&bytes)?, ctrl);
        Ok(())
    }

    #[test]
    fn message_round_trip() -> eyre::Result<()> {
        let mut msg = Message::to("S0");
        msg.task.time = 7;
        msg.task.request = true;
        msg.set_key(&[1u64, 2, 3]);
        msg.add_value(&[0.5f64, 1.5, 2.5]);

        let parts = WireMsg::to_parts(&mut msg)?;
        let mut wire = Vec::new();
        WireMsg::write_parts(&mut wire, &parts)?;
        let parts = WireMsg::read_parts(&mut Cursor::new(wire))?;
        let got = WireMsg::from_parts("W0".to_string(), "S0".to_string(), parts)?;

        assert_eq!(got.sender, "W0");
        assert_eq!(got.recver, "S0");
        assert_eq!(got.task, msg.task);
        assert_eq!(got.key_as::<u64>(), vec![1, 2, 3]);
        assert_eq!(got.value_as::<f64>(0), vec![0.5, 1.5, 2.5]);
        Ok(())
    }

    #[test]
    fn part_count_must_match_header() -> eyre::Result<()> {
        let mut msg = Message::to("S0");
        msg.set_key(&[1u64]);
        let mut parts = WireMsg::to_parts(&mut msg)?;
        let _ = parts.pop();
        assert_matches!(
            WireMsg::from_parts("W0".to_string(), "S0".to_string(), parts),
            Err(Error::FailedToParse(_))
        );
        Ok(())
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        WireMsg::write_parts(&mut wire, &[Bytes::from_static(b"hello")]).expect("write");
        wire.truncate(wire.len() - 2);
        assert_matches!(
            WireMsg::read_parts(&mut Cursor::new(wire)),
            Err(Error::Io(_))
        );
    }
}
