//! Minimal mesh stack riding on a `bm-net` network device.
//!
//! The stack is brought up in a fixed order, halting on the first failure:
//!
//! 1. [`l2::L2::init`] — install device callbacks, enable the device
//! 2. [`ip::init`]
//! 3. [`bcmp::Bcmp::init`] — neighbor discovery, echo, renegotiation
//! 4. [`topology::Topology::init`] — port-indexed neighbor table
//! 5. [`service::init`]
//! 6. [`pubsub::PubSub::init`] — topic flood + local subscriber registry
//! 7. [`middleware::init`]
//!
//! Everything below the L2 dispatch is reached only through the
//! [`bm_net::NetworkDevice`] surface, so any device (virtual ports alone or
//! the serial gateway composite) slots in unchanged.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bcmp;
pub mod ip;
pub mod l2;
pub mod middleware;
pub mod pubsub;
pub mod service;
pub mod topology;

use thiserror::Error;

pub use bcmp::{Bcmp, BcmpConfig, DiscoveryCallback, Neighbor};
pub use l2::{L2Addr, L2Protocol, L2};
pub use pubsub::{PubSub, SubscriberCallback};
pub use topology::Topology;

/// Stack errors
#[derive(Error, Debug)]
pub enum StackError {
    /// The network device rejected an operation.
    #[error("device: {0}")]
    Device(#[from] bm_net::DeviceError),

    /// Topic empty or too long for the wire encoding.
    #[error("topic rejected")]
    InvalidTopic,
}
