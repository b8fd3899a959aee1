//! A link layer for talking to a wearable device over a notification based link with a small
//!  MTU, e.g. Bluetooth LE.
//!
//! Messages are split into fragments that fit into a single link write, and reassembled on
//!  receipt ([protocol]). Every complete inbound message goes to exactly one recipient
//!  ([routing]): the single pending request ([link::Link::call]), the single active bulk transfer
//!  ([transfer]), or event waiters and handlers ([events]).
//!
//! [session::LinkSession] owns a link over its lifetime, and [test_util] provides an in-memory
//!  device for testing application code without hardware.

pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod protocol;
pub mod routing;
pub mod session;
pub mod stats;
pub mod test_util;
pub mod transfer;
pub mod transport;

pub use config::{BusyPolicy, LinkConfig, ReconnectPolicy};
pub use error::LinkError;
pub use link::{Link, Response};
pub use session::{DeviceTarget, LinkSession};
