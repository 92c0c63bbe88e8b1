// Copyright 2021 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The parameter-server runtime core.
//!
//! A computation is a scheduler, a set of workers and a set of servers
//! exchanging timestamped request/response tasks. Workers submit keyed
//! payloads that are sliced across the servers' key ranges; the per-customer
//! [`Executor`] orders requests by their declared dependencies, tracks which
//! timestamps each peer has finished, and fires a one-shot callback when a
//! group-wide request completes. The [`Postoffice`] owns the I/O threads and
//! the [`Manager`] runs the membership plane on top of the [`comm::Van`]
//! transport.

// Forbid some very bad patterns. Forbid is stronger than `deny`, preventing us from suppressing the
// lint with `#[allow(...)]` et-all.
#![forbid(
    arithmetic_overflow,
    mutable_transmutes,
    no_mangle_const_items,
    unknown_crate_types,
    unsafe_code
)]
// Turn on some additional warnings to encourage good style.
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::unicode_not_nfc,
    clippy::unwrap_used
)]

#[macro_use]
extern crate tracing;

pub mod comm;
mod config;
mod customer;
mod error;
mod executor;
mod logging;
mod manager;
pub mod messaging;
mod postoffice;
pub mod types;

pub use config::Config;
pub use customer::Customer;
pub use error::{Error, Result};
pub use executor::Executor;
pub use logging::init_logging;
pub use manager::Manager;
pub use postoffice::Postoffice;
