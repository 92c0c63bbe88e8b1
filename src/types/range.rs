// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Formatter};

/// A half-open interval `[lo, hi)` of the global key space.
///
/// Servers are assigned disjoint `KeyRange`s covering the whole key space;
/// keyed messages carry the range their key array spans so that receivers can
/// place the payload without inspecting it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub lo: u64,
    /// Exclusive upper bound.
    pub hi: u64,
}

impl KeyRange {
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// The whole key space.
    pub fn all() -> Self {
        Self {
            lo: 0,
            hi: u64::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lo >= self.hi
    }

    pub fn len(&self) -> u64 {
        self.hi.saturating_sub(self.lo)
    }

    pub fn contains(&self, key: u64) -> bool {
        self.lo <= key && key < self.hi
    }

    /// Clamps `v` into this range. Used to map a shard boundary expressed in
    /// global coordinates onto the span a message's key array covers.
    pub fn project(&self, v: u64) -> u64 {
        v.clamp(self.lo, self.hi)
    }

    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        KeyRange {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    /// True if this range sorts before `other`, ordering by lower bound.
    pub fn starts_before(&self, other: &KeyRange) -> bool {
        self.lo < other.lo
    }

    /// The `i`-th of `n` even sub-ranges. The last sub-range absorbs the
    /// rounding remainder so that the `n` pieces tile `self` exactly.
    pub fn sub_range(&self, i: usize, n: usize) -> KeyRange {
        assert!(n > 0 && i < n, "sub_range({}, {})", i, n);
        let len = self.len() as u128;
        let lo = self.lo + (len * i as u128 / n as u128) as u64;
        let hi = if i + 1 == n {
            self.hi
        } else {
            self.lo + (len * (i as u128 + 1) / n as u128) as u64
        };
        KeyRange { lo, hi }
    }
}

impl Debug for KeyRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.lo, self.hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_clamps_into_range() {
        let r = KeyRange::new(10, 20);
        assert_eq!(r.project(5), 10);
        assert_eq!(r.project(15), 15);
        assert_eq!(r.project(25), 20);
    }

    #[test]
    fn intersect() {
        let a = KeyRange::new(0, 1000);
        let b = KeyRange::new(1000, 2000);
        assert!(a.intersect(&b).is_empty());
        assert_eq!(a.intersect(&KeyRange::new(500, 1500)), KeyRange::new(500, 1000));
    }

    #[test]
    fn sub_ranges_tile_the_parent() {
        let all = KeyRange::all();
        for n in 1..7 {
            let mut prev_hi = all.lo;
            for i in 0..n {
                let s = all.sub_range(i, n);
                assert_eq!(s.lo, prev_hi);
                assert!(!s.is_empty());
                prev_hi = s.hi;
            }
            assert_eq!(prev_hi, all.hi);
        }
    }
}
