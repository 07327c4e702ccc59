//! herd-api — HTTP control plane for ollaherd.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Redirect to cluster status |
//! | GET | `/instances` | List worker snapshots |
//! | POST | `/instances/{port}/disable` | Exclude a worker from dispatch |
//! | POST | `/instances/{port}/enable` | Re-admit a worker to dispatch |
//! | GET | `/cluster/status` | Aggregate pool state |
//! | POST | `/cluster/scale` | Manual scale up/down |
//! | POST | `/route` | Proxy an inference request |
//! | GET | `/health` | Liveness of the pool |
//! | GET | `/metrics` | Flat-text metrics |
//! | POST | `/users/reset` | Clear per-user counters |

pub mod handlers;
pub mod metrics;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use herd_dispatch::Dispatcher;
use herd_pool::Supervisor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<Supervisor>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the complete control-plane router.
pub fn build_router(supervisor: Arc<Supervisor>, dispatcher: Arc<Dispatcher>) -> Router {
    let state = ApiState {
        supervisor,
        dispatcher,
    };

    Router::new()
        .route("/", get(handlers::root))
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{port}/disable", post(handlers::disable_instance))
        .route("/instances/{port}/enable", post(handlers::enable_instance))
        .route("/cluster/status", get(handlers::cluster_status))
        .route("/cluster/scale", post(handlers::scale_cluster))
        .route("/route", post(handlers::route_request))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_text))
        .route("/users/reset", post(handlers::reset_users))
        .with_state(state)
}
