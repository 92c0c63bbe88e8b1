// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Pluggable message codecs.
//!
//! A filter rewrites a message before transmission (`encode`) and undoes the
//! rewrite after reception (`decode`, applied in reverse order). The concrete
//! codecs — key caching, compression and the like — plug in from outside the
//! runtime; this module only defines the wire configuration and the hook.

use super::Message;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which codec a [`FilterConfig`] selects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterKind {
    KeyCaching,
    Compressing,
    FixingFloat,
}

/// Wire-visible filter selection carried in the task header. Both ends must
/// be able to construct the same codec from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub kind: FilterKind,
}

/// A message codec. Instances are created per remote peer and may keep
/// per-peer state between messages.
pub trait Filter: Send {
    fn encode(&mut self, msg: &mut Message);
    fn decode(&mut self, msg: &mut Message);
}

/// Builds codec instances from wire configurations. Returning `None` skips
/// the filter with a warning.
pub type FilterFactory = Arc<dyn Fn(&FilterConfig) -> Option<Box<dyn Filter>> + Send + Sync>;

/// A factory that knows no codecs.
pub fn no_filters() -> FilterFactory {
    Arc::new(|_| None)
}
