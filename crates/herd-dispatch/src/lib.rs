//! herd-dispatch — per-request worker selection and HTTP forwarding.
//!
//! The dispatcher asks the supervisor for the eligible worker with the
//! lowest composite load and proxies the caller's JSON body to that
//! worker's local prompt endpoint, inside the worker's execute bracket so
//! the inflight and rate counters stay truthful.

pub mod dispatcher;
pub mod error;

pub use dispatcher::Dispatcher;
pub use error::{DispatchError, DispatchResult};
