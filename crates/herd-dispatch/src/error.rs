//! Dispatch error types.

use thiserror::Error;

/// Errors surfaced to the client by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no eligible worker available")]
    NoEligibleWorker,

    #[error("upstream worker {port} failed: {reason}")]
    Upstream { port: u16, reason: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;
