//! herd-pool — worker lifecycle, supervision, and the autoscaling control loop.
//!
//! A [`Worker`] owns one `ollama serve` subprocess on its own loopback port
//! and tracks inflight requests, CPU, memory, and a per-window request rate.
//! The [`Supervisor`] keeps the port-keyed pool and the cluster-wide rate
//! state. The [`ControlLoop`] ticks once per second: it reaps dead workers,
//! folds the cluster request rate into an EMA, and applies the reactive and
//! predictive scaling rules.

pub mod control;
pub mod error;
pub mod port;
mod proc_stats;
pub mod supervisor;
pub mod worker;

pub use control::ControlLoop;
pub use error::{PoolError, PoolResult};
pub use supervisor::Supervisor;
pub use worker::{Worker, WorkerSnapshot};
