//! Config hot-reload — mtime polling with a debounce.
//!
//! Polls the config file's modification time once per second and pushes a
//! freshly parsed snapshot through the watch channel on change. Malformed
//! content is logged and the previous snapshot retained.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::watch;
use tracing::{info, warn};

use herd_core::ClusterConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Editors often write a file twice in quick succession; changes inside
/// this window collapse into one reload.
const DEBOUNCE: Duration = Duration::from_secs(2);

pub async fn watch_config(
    path: PathBuf,
    tx: watch::Sender<ClusterConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(path = ?path, "config watcher started");
    let mut last_mtime = modified_time(&path);
    let mut last_reload: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                let mtime = modified_time(&path);
                if mtime == last_mtime {
                    continue;
                }
                if let Some(at) = last_reload {
                    // Debouncing: leave last_mtime untouched so the next
                    // poll outside the window picks the change up.
                    if at.elapsed() < DEBOUNCE {
                        continue;
                    }
                }
                last_mtime = mtime;
                last_reload = Some(Instant::now());

                match ClusterConfig::load(&path) {
                    Ok(config) => {
                        info!("configuration reloaded");
                        let _ = tx.send(config);
                    }
                    Err(e) => warn!(error = %e, "config reload failed, keeping previous"),
                }
            }
            _ = shutdown.changed() => {
                info!("config watcher shutting down");
                break;
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_config(name: &str, config: &ClusterConfig) -> PathBuf {
        let path =
            std::env::temp_dir().join(format!("herd-watch-{}-{name}", std::process::id()));
        std::fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
        path
    }

    #[tokio::test]
    async fn reloads_on_file_change() {
        let initial = ClusterConfig::default();
        let path = scratch_config("reload.json", &initial);

        let (config_tx, mut config_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watch_config(path.clone(), config_tx, shutdown_rx));

        // First poll observes the original mtime.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        let updated = ClusterConfig {
            model: "mistral".to_string(),
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string_pretty(&updated).unwrap()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), config_rx.changed())
            .await
            .expect("reload within the poll window")
            .unwrap();
        assert_eq!(config_rx.borrow().model, "mistral");

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn malformed_change_keeps_previous_config() {
        let initial = ClusterConfig::default();
        let path = scratch_config("malformed.json", &initial);

        let (config_tx, config_rx) = watch::channel(initial.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watch_config(path.clone(), config_tx, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(1200)).await;
        std::fs::write(&path, "{broken").unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(*config_rx.borrow(), initial);

        let _ = shutdown_tx.send(true);
        let _ = handle.await;
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn modified_time_of_missing_file_is_none() {
        assert!(modified_time(Path::new("/nonexistent/herd.json")).is_none());
    }
}
