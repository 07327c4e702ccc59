//! Pool error types.

use thiserror::Error;

/// Errors that can occur while managing the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no confirmable loopback port after {0} attempts")]
    PortsExhausted(u32),

    #[error("failed to spawn inference process: {0}")]
    SpawnFailed(#[source] std::io::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;
