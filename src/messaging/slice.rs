// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The two default message slicers.
//!
//! Submitting to a group produces one sub-message per member. Non-keyed
//! messages are replicated; keyed messages are split by binary search so that
//! each member receives exactly the keys (and the aligned value stretches)
//! that fall into its shard.

use super::{DataType, Message, Scalar};
use crate::error::{Error, Result};
use crate::types::KeyRange;

/// Copies `msg` once per target range. The default for non-keyed messages.
pub fn replicate(msg: &Message, ranges: &[KeyRange]) -> Vec<Message> {
    (0..ranges.len())
        .map(|_| {
            let mut copy = Message::new();
            copy.task = msg.task.clone();
            copy.key = msg.key.clone();
            copy.value = msg.value.clone();
            copy.sender = msg.sender.clone();
            copy.recver = msg.recver.clone();
            copy.original_recver = msg.original_recver.clone();
            copy.terminate = msg.terminate;
            copy
        })
        .collect()
}

/// A scalar type usable as a key: ordered, and constructible from a global
/// key-space coordinate.
trait KeyScalar: Scalar + Ord {
    fn from_key_coord(v: u64) -> Self;
}

impl KeyScalar for u64 {
    fn from_key_coord(v: u64) -> Self {
        v
    }
}
impl KeyScalar for u32 {
    fn from_key_coord(v: u64) -> Self {
        v as u32
    }
}
impl KeyScalar for i32 {
    fn from_key_coord(v: u64) -> Self {
        v as i32
    }
}
impl KeyScalar for i64 {
    fn from_key_coord(v: u64) -> Self {
        v as i64
    }
}

/// Splits a keyed message with an ascending key array across contiguous
/// target sub-ranges.
///
/// Sub-message `i` covers `ranges[i]`: it receives the key stretch whose
/// projection falls into that range, and for every value array the stretch at
/// the same index positions scaled by the array's per-key stride. A
/// sub-message whose range does not intersect the message's own key range is
/// marked invalid and carries no data; the caller marks its shard done
/// locally instead of transmitting.
pub fn slice_key_ordered(msg: &Message, ranges: &[KeyRange]) -> Result<Vec<Message>> {
    match msg.task.key_type {
        DataType::Uint64 => slice_typed::<u64>(msg, ranges),
        DataType::Uint32 => slice_typed::<u32>(msg, ranges),
        DataType::Int64 => slice_typed::<i64>(msg, ranges),
        DataType::Int32 => slice_typed::<i32>(msg, ranges),
        other => Err(Error::InvalidConfig(format!(
            "{:?} keys cannot be range-sliced",
            other
        ))),
    }
}

fn slice_typed<K: KeyScalar>(msg: &Message, ranges: &[KeyRange]) -> Result<Vec<Message>> {
    let keys: Vec<K> = msg.key_as();
    let msg_range = msg.task.key_range.unwrap_or_else(KeyRange::all);
    let n = ranges.len();

    // One binary search per boundary; pos[i]..pos[i+1] is range i's stretch.
    let mut pos = vec![0usize; n + 1];
    for i in 0..n {
        if i == 0 {
            let lo = K::from_key_coord(msg_range.project(ranges[0].lo));
            pos[0] = keys.partition_point(|k| *k < lo);
        } else if ranges[i - 1].hi != ranges[i].lo {
            return Err(Error::InvalidConfig(format!(
                "target sub-ranges are not contiguous at {:?} -> {:?}",
                ranges[i - 1],
                ranges[i]
            )));
        }
        let hi = K::from_key_coord(msg_range.project(ranges[i].hi));
        pos[i + 1] = keys.partition_point(|k| *k < hi);
    }

    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let mut sub = msg.mini_copy();
        if ranges[i].intersect(&msg_range).is_empty() {
            // The member does not hold any of this span; nothing to send.
            sub.valid = false;
        } else {
            sub.valid = true;
            if keys.is_empty() {
                sub.task.value_type.clear();
            } else {
                sub.task.has_key = true;
                sub.key = msg.key.slice(pos[i] * K::WIDTH..pos[i + 1] * K::WIDTH);
                for v in &msg.value {
                    let stride = v.len() / keys.len();
                    sub.value.push(v.slice(pos[i] * stride..pos[i + 1] * stride));
                }
            }
        }
        out.push(sub);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn keyed_msg(keys: &[u64], vals: &[f64]) -> Message {
        let mut msg = Message::to("S");
        msg.set_key(keys);
        msg.add_value(vals);
        msg
    }

    #[test]
    fn splits_at_shard_boundary() -> eyre::Result<()> {
        let half = 1u64 << 63;
        let msg = keyed_msg(&[10, half, half + 5], &[1.0, 2.0, 3.0]);
        let ranges = [KeyRange::new(0, half), KeyRange::new(half, u64::MAX)];

        let subs = slice_key_ordered(&msg, &ranges)?;
        assert_eq!(subs.len(), 2);
        assert!(subs[0].valid && subs[1].valid);
        assert_eq!(subs[0].key_as::<u64>(), vec![10]);
        assert_eq!(subs[0].value_as::<f64>(0), vec![1.0]);
        assert_eq!(subs[1].key_as::<u64>(), vec![half, half + 5]);
        assert_eq!(subs[1].value_as::<f64>(0), vec![2.0, 3.0]);
        Ok(())
    }

    #[test]
    fn non_intersecting_member_is_invalid() -> eyre::Result<()> {
        let mut msg = keyed_msg(&[5, 500, 900], &[1.0, 2.0, 3.0]);
        msg.task.key_range = Some(KeyRange::new(0, 1000));
        let ranges = [KeyRange::new(0, 1000), KeyRange::new(1000, 2000)];

        let subs = slice_key_ordered(&msg, &ranges)?;
        assert!(subs[0].valid);
        assert_eq!(subs[0].key_as::<u64>(), vec![5, 500, 900]);
        assert!(!subs[1].valid);
        assert!(subs[1].key.is_empty());
        Ok(())
    }

    #[test]
    fn wide_value_stride() -> eyre::Result<()> {
        // Two values per key.
        let mut msg = Message::to("S");
        msg.set_key(&[1u64, 10, 20]);
        msg.add_value(&[1.0f64, 1.5, 10.0, 10.5, 20.0, 20.5]);
        let ranges = [KeyRange::new(0, 15), KeyRange::new(15, u64::MAX)];

        let subs = slice_key_ordered(&msg, &ranges)?;
        assert_eq!(subs[0].value_as::<f64>(0), vec![1.0, 1.5, 10.0, 10.5]);
        assert_eq!(subs[1].value_as::<f64>(0), vec![20.0, 20.5]);
        Ok(())
    }

    #[test]
    fn rejects_gap_in_ranges() {
        let msg = keyed_msg(&[1, 2], &[1.0, 2.0]);
        let ranges = [KeyRange::new(0, 10), KeyRange::new(20, 30)];
        assert!(slice_key_ordered(&msg, &ranges).is_err());
    }

    #[test]
    fn replicate_copies_everything() {
        let msg = keyed_msg(&[1, 2], &[1.0, 2.0]);
        let copies = replicate(&msg, &[KeyRange::default(); 3]);
        assert_eq!(copies.len(), 3);
        for copy in &copies {
            assert_eq!(copy.key_as::<u64>(), vec![1, 2]);
            assert_eq!(copy.value_as::<f64>(0), vec![1.0, 2.0]);
        }
    }

    proptest! {
        // Slices over any contiguous partition of the key space concatenate
        // back to the original arrays.
        #[test]
        fn slices_reassemble(
            mut keys in proptest::collection::vec(0..u64::MAX - 1, 0..64),
            mut bounds in proptest::collection::vec(1..u64::MAX - 1, 1..8),
        ) {
            keys.sort_unstable();
            keys.dedup();
            bounds.sort_unstable();
            bounds.dedup();

            let mut ranges = Vec::new();
            let mut lo = 0u64;
            for b in bounds {
                ranges.push(KeyRange::new(lo, b));
                lo = b;
            }
            ranges.push(KeyRange::new(lo, u64::MAX));

            let vals: Vec<f64> = keys.iter().map(|k| *k as f64).collect();
            let msg = keyed_msg(&keys, &vals);
            let subs = slice_key_ordered(&msg, &ranges).expect("contiguous ranges");

            let mut got_keys = Vec::new();
            let mut got_vals = Vec::new();
            for sub in &subs {
                if sub.valid && !sub.key.is_empty() {
                    got_keys.extend(sub.key_as::<u64>());
                    got_vals.extend(sub.value_as::<f64>(0));
                }
            }
            prop_assert_eq!(got_keys, keys);
            prop_assert_eq!(got_vals, vals);
        }
    }
}
