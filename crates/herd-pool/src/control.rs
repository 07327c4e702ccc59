//! Control loop — periodic reap, rate tracking, and scaling decisions.
//!
//! One tick per second: replace dead workers, fold the raw cluster rate
//! into an EMA, compute a first-order trend over the history window, then
//! apply the reactive and predictive scale-up rules and the idle
//! scale-down rule. The decision arithmetic is kept in free functions so
//! it is testable without clocks or processes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use herd_core::ClusterConfig;

use crate::supervisor::Supervisor;
use crate::worker::Worker;

/// Smoothing factor for the cluster request rate.
const RPS_EMA_ALPHA: f64 = 0.2;
/// Time between control iterations.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Fold a raw per-tick rate sample into the smoothed cluster rate.
pub fn smooth_rps(previous: f64, raw: f64) -> f64 {
    RPS_EMA_ALPHA * raw + (1.0 - RPS_EMA_ALPHA) * previous
}

/// First-order slope across the history window: newest minus oldest.
pub fn trend(history: &[f64]) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    history[history.len() - 1] - history[0]
}

/// Number of workers to add this tick: the reactive rule (composite load
/// or absolute rate) and the predictive rule (rate trend) fire
/// independently, so both may add one in the same tick.
///
/// `max_composite` is `None` when no worker is eligible, which suppresses
/// scaling entirely.
pub fn scale_up_count(
    max_composite: Option<f64>,
    cluster_rps: f64,
    trend: f64,
    pool_len: usize,
    config: &ClusterConfig,
) -> u32 {
    let Some(max_composite) = max_composite else {
        return 0;
    };
    if pool_len >= config.max_instances as usize {
        return 0;
    }

    let mut adds = 0;
    if max_composite >= config.scale_up_load_threshold || cluster_rps >= config.scale_up_rps {
        adds += 1;
    }
    if trend > config.predictive_rps_trend_threshold {
        adds += 1;
    }
    adds
}

/// Whether a worker is idle and unloaded enough to remove. The caller
/// still enforces the pool-size floor.
pub fn is_scale_down_candidate(idle: Duration, composite_load: f64, config: &ClusterConfig) -> bool {
    idle.as_secs() > config.idle_timeout_seconds
        && composite_load <= config.scale_down_load_threshold
}

pub struct ControlLoop {
    supervisor: Arc<Supervisor>,
    config: watch::Receiver<ClusterConfig>,
}

impl ControlLoop {
    pub fn new(supervisor: Arc<Supervisor>, config: watch::Receiver<ClusterConfig>) -> Self {
        Self { supervisor, config }
    }

    /// Run until the shutdown signal fires. Each iteration takes a fresh
    /// config snapshot, ticks, then sleeps; cancellation lands at the
    /// sleep point.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("control loop started");
        loop {
            let config = self.config.borrow().clone();
            self.tick(&config).await;

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = shutdown.changed() => {
                    info!("control loop shutting down");
                    break;
                }
            }
        }
    }

    /// One control iteration. Every step logs and swallows its own
    /// failures so a bad tick never kills the loop.
    pub async fn tick(&self, config: &ClusterConfig) {
        let workers = self.supervisor.snapshot();

        self.reap_dead(&workers).await;
        self.ensure_floor(config).await;
        let (cluster_rps, rate_trend) = self.update_cluster_rate(&workers, config);
        self.apply_scale_up(&workers, cluster_rps, rate_trend, config)
            .await;
        self.apply_scale_down(&workers, config).await;
    }

    /// Replace workers whose subprocess died. A disabled dead worker is
    /// left untouched: the operator turned it off on purpose.
    async fn reap_dead(&self, workers: &[Arc<Worker>]) {
        for worker in workers {
            if worker.is_disabled() || worker.is_alive().await {
                continue;
            }
            warn!(port = worker.port(), "dead worker reaped, starting replacement");
            self.supervisor.kill_instance(worker.port()).await;
            match self.supervisor.start_instance().await {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "replacement start failed, retrying next tick"),
            }
        }
    }

    /// Top the pool back up to `minInstances`, e.g. after a manual
    /// scale-down drained it below the floor.
    async fn ensure_floor(&self, config: &ClusterConfig) {
        while self.supervisor.len() < config.min_instances as usize {
            match self.supervisor.start_instance().await {
                Ok(Some(worker)) => {
                    info!(port = worker.port(), "pool below minimum, started worker");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "floor start failed, retrying next tick");
                    break;
                }
            }
        }
    }

    /// Fold the raw rate sum into the cluster EMA and extend the history.
    /// Disabled workers still count: they may be draining inflight calls.
    /// The history holds smoothed samples, so the trend is a slope of EMA
    /// values.
    fn update_cluster_rate(&self, workers: &[Arc<Worker>], config: &ClusterConfig) -> (f64, f64) {
        let raw: f64 = workers.iter().map(|w| w.rps()).sum();
        let smoothed = smooth_rps(self.supervisor.cluster_rps(), raw);
        self.supervisor.set_cluster_rps(smoothed);
        self.supervisor
            .push_rps_history(smoothed, config.predictive_rps_window);

        let history = self.supervisor.rps_history();
        (smoothed, trend(&history))
    }

    async fn apply_scale_up(
        &self,
        workers: &[Arc<Worker>],
        cluster_rps: f64,
        rate_trend: f64,
        config: &ClusterConfig,
    ) {
        let mut max_composite: Option<f64> = None;
        for worker in workers {
            if !worker.is_disabled() && worker.is_alive().await {
                let load = worker.composite_load();
                max_composite = Some(max_composite.map_or(load, |m: f64| m.max(load)));
            }
        }

        let adds = scale_up_count(
            max_composite,
            cluster_rps,
            rate_trend,
            self.supervisor.len(),
            config,
        );
        for _ in 0..adds {
            match self.supervisor.start_instance().await {
                Ok(Some(worker)) => {
                    info!(
                        port = worker.port(),
                        cluster_rps, trend = rate_trend, "scaled up"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "scale-up start failed"),
            }
        }
    }

    /// Remove idle, unloaded workers. The pool-size floor is re-checked
    /// before each kill so one tick cannot breach `minInstances`.
    async fn apply_scale_down(&self, workers: &[Arc<Worker>], config: &ClusterConfig) {
        for worker in workers {
            if self.supervisor.len() <= config.min_instances as usize {
                break;
            }
            if is_scale_down_candidate(worker.idle_time(), worker.composite_load(), config) {
                info!(port = worker.port(), "idle worker scaled down");
                self.supervisor.kill_instance(worker.port()).await;
            }
        }
    }
}
