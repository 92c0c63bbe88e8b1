// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::collections::HashSet;

/// The monotonically growing set of finished timestamps for one direction of
/// one peer.
///
/// Timestamps are assigned from 1 and finished mostly in order, so the set
/// is a contiguous-prefix watermark plus an overflow set for out-of-order
/// completions; both operations are amortised O(1). Once finished, a
/// timestamp never un-finishes.
#[derive(Debug, Default)]
pub struct Tracker {
    /// Every timestamp in `[1, watermark]` is finished.
    watermark: i32,
    /// Finished timestamps above the watermark.
    overflow: HashSet<i32>,
}

impl Tracker {
    pub fn new() -> Self {
        Self {
            watermark: 0,
            overflow: HashSet::new(),
        }
    }

    /// Marks `time` finished. Idempotent; negative sentinels are ignored.
    pub fn finish(&mut self, time: i32) {
        if time <= 0 || time <= self.watermark {
            return;
        }
        if time == self.watermark + 1 {
            self.watermark = time;
            while self.overflow.remove(&(self.watermark + 1)) {
                self.watermark += 1;
            }
        } else {
            let _ = self.overflow.insert(time);
        }
    }

    /// True if `time` has been finished. Negative sentinels never block, so
    /// they count as finished.
    pub fn is_finished(&self, time: i32) -> bool {
        time < 0 || time <= self.watermark || self.overflow.contains(&time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_finishes_advance_the_watermark() {
        let mut t = Tracker::new();
        assert!(!t.is_finished(1));
        for ts in 1..100 {
            t.finish(ts);
            assert!(t.is_finished(ts));
        }
        assert!(t.overflow.is_empty());
        assert!(!t.is_finished(100));
    }

    #[test]
    fn out_of_order_finishes_are_absorbed() {
        let mut t = Tracker::new();
        t.finish(2);
        t.finish(4);
        assert!(!t.is_finished(1));
        assert!(t.is_finished(2));
        t.finish(1);
        assert!(!t.is_finished(3));
        t.finish(3);
        // 1..=4 collapse into the watermark.
        assert_eq!(t.watermark, 4);
        assert!(t.overflow.is_empty());
    }

    #[test]
    fn sentinel_never_blocks() {
        let t = Tracker::new();
        assert!(t.is_finished(crate::messaging::INVALID_TIME));
    }

    #[test]
    fn finish_is_idempotent() {
        let mut t = Tracker::new();
        t.finish(1);
        t.finish(1);
        t.finish(5);
        t.finish(5);
        assert!(t.is_finished(1));
        assert!(t.is_finished(5));
        assert!(!t.is_finished(2));
    }
}
