//! Worker — owns one inference subprocess and its load metrics.
//!
//! Identity is the loopback port the subprocess listens on. Request
//! bookkeeping (`inflight`, the 2 s request window) uses relaxed atomics;
//! the float metrics (`moving_average_load`, `cpu_percent`) are stored as
//! `f64` bits in an `AtomicU64` — single writer, racy readers.
//! Start and kill are serialized by the mutex owning the child handle and
//! are idempotent against concurrent callers.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::port::alloc_port;
use crate::proc_stats;

/// Smoothing factor for the per-worker moving-average load.
const LOAD_EMA_ALPHA: f64 = 0.2;
/// Cadence of the per-worker metrics ticker; also the request-rate window.
const METRICS_INTERVAL: Duration = Duration::from_secs(2);
/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// One inference worker: a subprocess slot plus its observable metrics.
pub struct Worker {
    port: u16,
    model: String,
    max_concurrency: u32,
    /// Operator override: excluded from dispatch but kept in the pool.
    disabled: AtomicBool,
    inflight: AtomicU32,
    /// Requests accepted in the current 2 s window; reset by the ticker.
    requests_in_window: AtomicU64,
    /// EMA of inflight/max_concurrency, stored as f64 bits.
    moving_average_load: AtomicU64,
    /// Last sampled CPU percentage, stored as f64 bits.
    cpu_percent: AtomicU64,
    memory_bytes: AtomicU64,
    last_used_ms: AtomicU64,
    /// Owns the subprocess handle; serializes start/kill.
    child: Mutex<Option<Child>>,
    ticker_shutdown: watch::Sender<bool>,
}

/// Point-in-time view of a worker, as served by the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub port: u16,
    pub alive: bool,
    pub disabled: bool,
    pub inflight: u32,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub moving_average_load: f64,
    pub composite_load: f64,
    pub rps: f64,
    pub last_used_epoch_ms: u64,
}

impl Worker {
    /// Allocate a port and set up the worker shell. The subprocess is not
    /// started; the metrics ticker begins immediately.
    pub fn new(model: &str, max_concurrency: u32) -> PoolResult<Arc<Self>> {
        let port = alloc_port()?;
        let (ticker_shutdown, ticker_rx) = watch::channel(false);

        let worker = Arc::new(Self {
            port,
            model: model.to_string(),
            max_concurrency: max_concurrency.max(1),
            disabled: AtomicBool::new(false),
            inflight: AtomicU32::new(0),
            requests_in_window: AtomicU64::new(0),
            moving_average_load: AtomicU64::new(0.0f64.to_bits()),
            cpu_percent: AtomicU64::new(0.0f64.to_bits()),
            memory_bytes: AtomicU64::new(0),
            last_used_ms: AtomicU64::new(now_ms()),
            child: Mutex::new(None),
            ticker_shutdown,
        });

        spawn_metrics_ticker(&worker, ticker_rx);
        debug!(port, model, "worker created");
        Ok(worker)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
        info!(port = self.port, disabled, "worker dispatch flag changed");
    }

    pub fn inflight(&self) -> u32 {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Request rate over the current metrics window.
    pub fn rps(&self) -> f64 {
        self.requests_in_window.load(Ordering::Relaxed) as f64 / METRICS_INTERVAL.as_secs_f64()
    }

    pub fn moving_average_load(&self) -> f64 {
        load_f64(&self.moving_average_load)
    }

    pub fn cpu_percent(&self) -> f64 {
        load_f64(&self.cpu_percent)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.load(Ordering::Relaxed)
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    /// Time since the worker last finished serving a request.
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_used_ms()))
    }

    /// Blend of inflight saturation and CPU usage, in [0, ~1].
    pub fn composite_load(&self) -> f64 {
        let saturation = self.inflight() as f64 / self.max_concurrency as f64;
        (saturation + self.cpu_percent() / 100.0) / 2.0
    }

    /// Whether the subprocess exists and has not exited.
    pub async fn is_alive(&self) -> bool {
        self.pid().await.is_some()
    }

    async fn pid(&self) -> Option<u32> {
        let mut slot = self.child.lock().await;
        let child = slot.as_mut()?;
        match child.try_wait() {
            Ok(None) => child.id(),
            _ => None,
        }
    }

    /// Start the inference subprocess. Idempotent: a live process is left
    /// alone. The spawned process binds `127.0.0.1:<port>` via its
    /// environment; output lines are forwarded to the operator log.
    pub async fn start(&self) -> PoolResult<()> {
        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        let mut command = Command::new("ollama");
        command
            .arg("serve")
            .env("OLLAMA_HOST", format!("127.0.0.1:{}", self.port))
            .env("OLLAMA_MODEL", &self.model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so kill can take children down with it.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(PoolError::SpawnFailed)?;
        if let Some(stdout) = child.stdout.take() {
            forward_output_lines(self.port, false, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output_lines(self.port, true, stderr);
        }

        info!(port = self.port, model = %self.model, "inference process started");
        *slot = Some(child);
        Ok(())
    }

    /// Terminate the subprocess and its children and wait for exit.
    /// Idempotent; never fails. Also stops the metrics ticker, since a
    /// killed worker is leaving the pool.
    pub async fn kill(&self) {
        let _ = self.ticker_shutdown.send(true);

        let mut slot = self.child.lock().await;
        let Some(child) = slot.as_mut() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            *slot = None;
            return;
        }

        signal_group(child, false);
        #[cfg(not(unix))]
        let _ = child.start_kill();

        let deadline = tokio::time::Instant::now() + KILL_GRACE;
        while tokio::time::Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if matches!(child.try_wait(), Ok(None)) {
            warn!(port = self.port, "inference process ignored SIGTERM, killing");
            signal_group(child, true);
            let _ = child.start_kill();
        }

        let _ = child.wait().await;
        info!(port = self.port, "inference process stopped");
        *slot = None;
    }

    /// Bracket an upstream call with request bookkeeping.
    ///
    /// The counters are adjusted even when the call fails or the task is
    /// cancelled mid-await; the call's outcome is returned unchanged.
    pub async fn execute<T, E, Fut>(&self, call: Fut) -> Result<T, E>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        self.requests_in_window.fetch_add(1, Ordering::Relaxed);
        let _guard = ExecuteGuard { worker: self };
        call.await
    }

    /// Refresh CPU and memory samples, then reset the request window.
    /// The reset lands at the end of the tick body.
    async fn refresh_samples(&self) {
        if let Some(pid) = self.pid().await {
            let cpu = proc_stats::sample_cpu_percent(pid).await;
            store_f64(&self.cpu_percent, cpu);
            self.memory_bytes
                .store(proc_stats::resident_memory_bytes(pid), Ordering::Relaxed);
        }
        self.requests_in_window.store(0, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> WorkerSnapshot {
        let memory_mb = self.memory_bytes() as f64 / (1024.0 * 1024.0);
        WorkerSnapshot {
            port: self.port,
            alive: self.is_alive().await,
            disabled: self.is_disabled(),
            inflight: self.inflight(),
            cpu_percent: self.cpu_percent(),
            memory_mb: (memory_mb * 100.0).round() / 100.0,
            moving_average_load: self.moving_average_load(),
            composite_load: self.composite_load(),
            rps: self.rps(),
            last_used_epoch_ms: self.last_used_ms(),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.ticker_shutdown.send(true);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("port", &self.port)
            .field("model", &self.model)
            .field("inflight", &self.inflight())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Finalizer for [`Worker::execute`]: decrements inflight, stamps
/// `last_used`, and folds the new saturation into the moving average.
struct ExecuteGuard<'a> {
    worker: &'a Worker,
}

impl Drop for ExecuteGuard<'_> {
    fn drop(&mut self) {
        let worker = self.worker;
        worker.inflight.fetch_sub(1, Ordering::Relaxed);
        worker.last_used_ms.store(now_ms(), Ordering::Relaxed);

        let saturation =
            worker.inflight.load(Ordering::Relaxed) as f64 / worker.max_concurrency as f64;
        let previous = load_f64(&worker.moving_average_load);
        store_f64(
            &worker.moving_average_load,
            (1.0 - LOAD_EMA_ALPHA) * previous + LOAD_EMA_ALPHA * saturation,
        );
    }
}

/// Per-worker metrics loop. Holds only a weak reference so a worker that
/// leaves the pool is freed; exits on shutdown signal or once the worker
/// is gone.
fn spawn_metrics_ticker(worker: &Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let weak = Arc::downgrade(worker);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(METRICS_INTERVAL) => {
                    let Some(worker) = weak.upgrade() else { break };
                    worker.refresh_samples().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

/// Forward subprocess output lines to the operator log.
fn forward_output_lines<R>(port: u16, is_stderr: bool, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(port, "[ollama] {line}");
            } else {
                debug!(port, "[ollama] {line}");
            }
        }
    });
}

/// Signal the subprocess's whole process group.
#[cfg(unix)]
fn signal_group(child: &Child, force: bool) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let _ = killpg(Pid::from_raw(pid as i32), signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _force: bool) {}

fn load_f64(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Relaxed))
}

fn store_f64(cell: &AtomicU64, value: f64) {
    cell.store(value.to_bits(), Ordering::Relaxed);
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
