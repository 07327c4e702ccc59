//! Supervisor — the port-keyed worker pool and cluster-wide rate state.
//!
//! The registry is a sharded concurrent map: the dispatcher and control
//! plane take snapshots while the control loop and operator endpoints do
//! point writes. `cluster_rps` and `rps_history` have a single writer (the
//! control loop); readers take copies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use herd_core::ClusterConfig;

use crate::error::PoolResult;
use crate::worker::Worker;

pub struct Supervisor {
    workers: DashMap<u16, Arc<Worker>>,
    config: watch::Receiver<ClusterConfig>,
    /// Smoothed cluster request rate, f64 bits.
    cluster_rps: AtomicU64,
    /// Recent smoothed rate samples, oldest first.
    rps_history: Mutex<VecDeque<f64>>,
    /// Per-user request counters, reset only by the operator.
    user_requests: DashMap<String, u64>,
}

impl Supervisor {
    pub fn new(config: watch::Receiver<ClusterConfig>) -> Self {
        Self {
            workers: DashMap::new(),
            config,
            cluster_rps: AtomicU64::new(0.0f64.to_bits()),
            rps_history: Mutex::new(VecDeque::new()),
            user_requests: DashMap::new(),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> ClusterConfig {
        self.config.borrow().clone()
    }

    /// Construct, register, and start one worker. No-op at `maxInstances`.
    ///
    /// The worker is inserted before it is started so a concurrent scan
    /// observes the new entry; a failed spawn leaves it in the pool
    /// not-alive, to be reaped on the next control tick.
    pub async fn start_instance(&self) -> PoolResult<Option<Arc<Worker>>> {
        let config = self.config();
        if self.workers.len() >= config.max_instances as usize {
            debug!(max = config.max_instances, "pool at capacity, not starting");
            return Ok(None);
        }

        let worker = Worker::new(&config.model, config.max_concurrency)?;
        self.workers.insert(worker.port(), worker.clone());

        if let Err(e) = worker.start().await {
            warn!(port = worker.port(), error = %e, "worker spawn failed, will be reaped");
        }
        Ok(Some(worker))
    }

    /// Kill a worker and drop it from the pool. Returns false for an
    /// unknown port.
    pub async fn kill_instance(&self, port: u16) -> bool {
        let Some(worker) = self.workers.get(&port).map(|entry| entry.value().clone()) else {
            return false;
        };
        worker.kill().await;
        self.workers.remove(&port);
        info!(port, "worker removed from pool");
        true
    }

    pub fn get(&self, port: u16) -> Option<Arc<Worker>> {
        self.workers.get(&port).map(|entry| entry.value().clone())
    }

    /// Snapshot of the pool, ordered by port for stable enumeration.
    pub fn snapshot(&self) -> Vec<Arc<Worker>> {
        let mut workers: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        workers.sort_by_key(|w| w.port());
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub async fn alive_count(&self) -> usize {
        let mut alive = 0;
        for worker in self.snapshot() {
            if worker.is_alive().await {
                alive += 1;
            }
        }
        alive
    }

    /// Bring the pool up to `minInstances` at startup.
    pub async fn initial_fill(&self) {
        let min = self.config().min_instances;
        for _ in 0..min {
            if let Err(e) = self.start_instance().await {
                warn!(error = %e, "initial fill start failed");
            }
        }
        info!(workers = self.workers.len(), "initial pool filled");
    }

    pub fn cluster_rps(&self) -> f64 {
        f64::from_bits(self.cluster_rps.load(Ordering::Relaxed))
    }

    pub fn set_cluster_rps(&self, value: f64) {
        self.cluster_rps.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Append a smoothed rate sample, evicting the oldest past `window`.
    pub fn push_rps_history(&self, sample: f64, window: usize) {
        let mut history = self
            .rps_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(sample);
        while history.len() > window {
            history.pop_front();
        }
    }

    pub fn rps_history(&self) -> Vec<f64> {
        let history = self
            .rps_history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.iter().copied().collect()
    }

    /// Count a request against a user bucket.
    pub fn record_user(&self, user: &str) {
        *self.user_requests.entry(user.to_string()).or_insert(0) += 1;
    }

    /// Per-user counters, sorted by user for stable output.
    pub fn user_requests(&self) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .user_requests
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        counts.sort_by(|a, b| a.0.cmp(&b.0));
        counts
    }

    pub fn reset_users(&self) {
        self.user_requests.clear();
        info!("user request counters reset");
    }

    /// Kill every worker and empty the pool. Best-effort; errors inside
    /// kill are already swallowed.
    pub async fn shutdown(&self) {
        info!(workers = self.workers.len(), "supervisor shutting down");
        for worker in self.snapshot() {
            worker.kill().await;
        }
        self.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_supervisor(config: ClusterConfig) -> (watch::Sender<ClusterConfig>, Supervisor) {
        let (tx, rx) = watch::channel(config);
        (tx, Supervisor::new(rx))
    }

    fn small_config(min: u32, max: u32) -> ClusterConfig {
        ClusterConfig {
            min_instances: min,
            max_instances: max,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn start_instance_registers_worker() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));

        let worker = supervisor.start_instance().await.unwrap().unwrap();
        assert_eq!(supervisor.len(), 1);
        assert!(supervisor.get(worker.port()).is_some());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn start_instance_is_a_noop_at_max() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 1));

        assert!(supervisor.start_instance().await.unwrap().is_some());
        assert!(supervisor.start_instance().await.unwrap().is_none());
        assert_eq!(supervisor.len(), 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn kill_instance_removes_worker() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));
        let worker = supervisor.start_instance().await.unwrap().unwrap();

        assert!(supervisor.kill_instance(worker.port()).await);
        assert_eq!(supervisor.len(), 0);
        assert!(supervisor.get(worker.port()).is_none());
    }

    #[tokio::test]
    async fn kill_unknown_port_returns_false() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));
        assert!(!supervisor.kill_instance(1).await);
    }

    #[tokio::test]
    async fn initial_fill_reaches_min_instances() {
        let (_tx, supervisor) = test_supervisor(small_config(2, 5));

        supervisor.initial_fill().await;
        assert_eq!(supervisor.len(), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_is_sorted_by_port() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 4));
        supervisor.initial_fill().await;
        supervisor.start_instance().await.unwrap();
        supervisor.start_instance().await.unwrap();

        let snapshot = supervisor.snapshot();
        assert_eq!(snapshot.len(), 3);
        let ports: Vec<u16> = snapshot.iter().map(|w| w.port()).collect();
        let mut sorted = ports.clone();
        sorted.sort_unstable();
        assert_eq!(ports, sorted);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_empties_pool() {
        let (_tx, supervisor) = test_supervisor(small_config(2, 4));
        supervisor.initial_fill().await;

        supervisor.shutdown().await;
        assert!(supervisor.is_empty());
    }

    #[test]
    fn rps_history_is_bounded() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));

        for i in 0..10 {
            supervisor.push_rps_history(i as f64, 4);
        }
        let history = supervisor.rps_history();
        assert_eq!(history, vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn cluster_rps_round_trips() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));
        assert_eq!(supervisor.cluster_rps(), 0.0);
        supervisor.set_cluster_rps(12.5);
        assert_eq!(supervisor.cluster_rps(), 12.5);
    }

    #[test]
    fn user_counters_accumulate_and_reset() {
        let (_tx, supervisor) = test_supervisor(small_config(1, 2));

        supervisor.record_user("alice");
        supervisor.record_user("alice");
        supervisor.record_user("anonymous");

        assert_eq!(
            supervisor.user_requests(),
            vec![("alice".to_string(), 2), ("anonymous".to_string(), 1)]
        );

        supervisor.reset_users();
        assert!(supervisor.user_requests().is_empty());
    }
}
