//! Delivery of complete inbound messages to whoever is waiting for them.

mod router;
pub(crate) mod table;

pub use router::RouteOutcome;
pub(crate) use router::Router;
pub use table::HandlerId;
