//! Loopback port discovery.
//!
//! Asks the OS for an ephemeral port, releases it, and confirms it can be
//! rebound before handing it out. The window between confirmation and the
//! subprocess binding it is inherently racy; a worker that loses the race
//! fails to start and is reaped by the control loop.

use std::net::TcpListener;

use crate::error::{PoolError, PoolResult};

const MAX_ATTEMPTS: u32 = 10;

/// Return a loopback TCP port that was bindable a moment ago.
pub fn alloc_port() -> PoolResult<u16> {
    for _ in 0..MAX_ATTEMPTS {
        let Ok(listener) = TcpListener::bind(("127.0.0.1", 0)) else {
            continue;
        };
        let Ok(addr) = listener.local_addr() else {
            continue;
        };
        let port = addr.port();
        drop(listener);

        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(PoolError::PortsExhausted(MAX_ATTEMPTS))
}
