//! Worker selection and upstream proxying.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use herd_pool::{Supervisor, Worker};

use crate::error::{DispatchError, DispatchResult};

/// Bound on a single upstream inference call.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(120);
/// Prompt endpoint exposed by each inference subprocess.
const PROMPT_PATH: &str = "/api/prompt";
/// Counter bucket for callers that send no user header.
const ANONYMOUS_USER: &str = "anonymous";

pub struct Dispatcher {
    supervisor: Arc<Supervisor>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            timeout: UPSTREAM_TIMEOUT,
        }
    }

    /// Override the bound on upstream calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The eligible worker with the lowest composite load; ties go to the
    /// lowest port.
    pub async fn select_worker(&self) -> DispatchResult<Arc<Worker>> {
        let mut candidates = Vec::new();
        for worker in self.supervisor.snapshot() {
            if !worker.is_disabled() && worker.is_alive().await {
                candidates.push((worker.composite_load(), worker));
            }
        }
        pick_least_loaded(candidates).ok_or(DispatchError::NoEligibleWorker)
    }

    /// Route one inference call: account the user, pick a worker, and
    /// proxy the body inside the worker's execute bracket. The outcome is
    /// returned unchanged; a failed call does not disable the worker.
    pub async fn dispatch(&self, user: Option<&str>, body: Bytes) -> DispatchResult<Bytes> {
        let user = match user {
            Some(u) if !u.is_empty() => u,
            _ => ANONYMOUS_USER,
        };
        self.supervisor.record_user(user);

        let worker = self.select_worker().await?;
        let port = worker.port();
        debug!(port, user, "dispatching request");
        worker.execute(forward(port, body, self.timeout)).await
    }
}

/// Deterministic selection over (load, worker) pairs given in port order:
/// strict less-than keeps the earliest entry on equal loads.
fn pick_least_loaded(candidates: Vec<(f64, Arc<Worker>)>) -> Option<Arc<Worker>> {
    let mut best: Option<(f64, Arc<Worker>)> = None;
    for (load, worker) in candidates {
        match &best {
            Some((best_load, _)) if load >= *best_load => {}
            _ => best = Some((load, worker)),
        }
    }
    best.map(|(_, worker)| worker)
}

/// POST the opaque JSON body to a worker's prompt endpoint and return the
/// response body. Transport failures, non-2xx statuses, and timeouts all
/// map to [`DispatchError::Upstream`] naming the port.
async fn forward(port: u16, body: Bytes, timeout: Duration) -> DispatchResult<Bytes> {
    let address = format!("127.0.0.1:{port}");

    let result = tokio::time::timeout(timeout, async {
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| upstream(port, format!("connect failed: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| upstream(port, format!("handshake failed: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = http::Request::builder()
            .method("POST")
            .uri(format!("http://{address}{PROMPT_PATH}"))
            .header("host", address.clone())
            .header("content-type", "application/json")
            .body(Full::new(body))
            .map_err(|e| upstream(port, format!("request build failed: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| upstream(port, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(upstream(port, format!("status {status}")));
        }

        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| upstream(port, format!("body read failed: {e}")))?;
        Ok(collected.to_bytes())
    })
    .await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => Err(upstream(
            port,
            format!("timed out after {}s", timeout.as_secs()),
        )),
    }
}

fn upstream(port: u16, reason: String) -> DispatchError {
    DispatchError::Upstream { port, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herd_core::ClusterConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    fn test_supervisor() -> (watch::Sender<ClusterConfig>, Arc<Supervisor>) {
        let (tx, rx) = watch::channel(ClusterConfig::default());
        (tx, Arc::new(Supervisor::new(rx)))
    }

    /// Accept one connection, read a full request, answer with `response`.
    async fn stub_upstream(listener: TcpListener, response: &'static str) {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = vec![0u8; 4096];
            let mut raw = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                raw.extend_from_slice(&buf[..n]);
                if request_complete(&raw) {
                    break;
                }
            }
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.flush().await;
        }
    }

    fn request_complete(raw: &[u8]) -> bool {
        let Some(end) = raw.windows(4).position(|w| w == b"\r\n\r\n") else {
            return false;
        };
        let headers = String::from_utf8_lossy(&raw[..end]);
        let content_length = headers
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        raw.len() >= end + 4 + content_length
    }

    #[tokio::test]
    async fn dispatch_without_workers_is_unavailable() {
        let (_tx, supervisor) = test_supervisor();
        let dispatcher = Dispatcher::new(supervisor);

        let result = dispatcher.dispatch(None, Bytes::from("{}")).await;
        assert!(matches!(result, Err(DispatchError::NoEligibleWorker)));
    }

    #[tokio::test]
    async fn dispatch_records_user_buckets() {
        let (_tx, supervisor) = test_supervisor();
        let dispatcher = Dispatcher::new(supervisor.clone());

        // Selection fails (no workers) but the user is still counted.
        let _ = dispatcher.dispatch(Some("alice"), Bytes::from("{}")).await;
        let _ = dispatcher.dispatch(Some(""), Bytes::from("{}")).await;
        let _ = dispatcher.dispatch(None, Bytes::from("{}")).await;

        assert_eq!(
            supervisor.user_requests(),
            vec![("alice".to_string(), 1), ("anonymous".to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn pick_least_loaded_prefers_lowest_load() {
        let a = Worker::new("m", 4).unwrap();
        let b = Worker::new("m", 4).unwrap();

        let chosen = pick_least_loaded(vec![(0.8, a.clone()), (0.1, b.clone())]).unwrap();
        assert_eq!(chosen.port(), b.port());
    }

    #[tokio::test]
    async fn pick_least_loaded_breaks_ties_by_order() {
        let a = Worker::new("m", 4).unwrap();
        let b = Worker::new("m", 4).unwrap();

        // Candidates arrive in port order; equal loads keep the first.
        let chosen = pick_least_loaded(vec![(0.5, a.clone()), (0.5, b.clone())]).unwrap();
        assert_eq!(chosen.port(), a.port());
    }

    #[tokio::test]
    async fn pick_least_loaded_empty_is_none() {
        assert!(pick_least_loaded(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn forward_to_dead_port_is_an_upstream_error() {
        let port = herd_pool::port::alloc_port().unwrap();
        let result = forward(port, Bytes::from("{}"), Duration::from_millis(500)).await;

        match result {
            Err(DispatchError::Upstream { port: p, reason }) => {
                assert_eq!(p, port);
                assert!(reason.contains("connect failed"), "reason: {reason}");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forward_returns_upstream_body_on_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(stub_upstream(
            listener,
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 15\r\n\r\n{\"result\":\"ok\"}",
        ));

        let body = forward(
            port,
            Bytes::from("{\"prompt\":\"hi\"}"),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(&body[..], b"{\"result\":\"ok\"}");
    }

    #[tokio::test]
    async fn forward_maps_non_2xx_to_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(stub_upstream(
            listener,
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\n\r\n",
        ));

        let result = forward(port, Bytes::from("{}"), Duration::from_secs(5)).await;
        match result {
            Err(DispatchError::Upstream { port: p, reason }) => {
                assert_eq!(p, port);
                assert!(reason.contains("status 500"), "reason: {reason}");
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }
}
