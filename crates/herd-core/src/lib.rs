//! herd-core — shared configuration model for ollaherd.
//!
//! The cluster configuration lives in a JSON file (`clusterconfig.json` by
//! default) and is distributed to the supervisor and control loop as an
//! immutable snapshot through a `tokio::sync::watch` channel owned by the
//! daemon. Every field has a default so a missing file can be scaffolded.

pub mod config;

pub use config::{ClusterConfig, ConfigError};
