//! Heartbeat: periodic self-wake on the workspace HEARTBEAT.md prompt.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runs the agent with the heartbeat prompt, returning its output.
pub type HeartbeatRunFn = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

/// Delivers a heartbeat result to the user.
pub type HeartbeatNotifyFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Output containing this token is suppressed: the agent found nothing to do.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEDUP_WINDOW_HOURS: i64 = 24;

#[derive(Default)]
struct NotifyState {
    last_text: String,
    last_at: Option<DateTime<Utc>>,
}

pub struct Heartbeat {
    workspace: PathBuf,
    interval: Duration,
    on_heartbeat: HeartbeatRunFn,
    notify: HeartbeatNotifyFn,
    state: Mutex<NotifyState>,
}

impl Heartbeat {
    /// `interval` of zero falls back to the 30-minute default.
    pub fn new(
        workspace: PathBuf,
        interval: Duration,
        on_heartbeat: HeartbeatRunFn,
        notify: HeartbeatNotifyFn,
    ) -> Self {
        let interval = if interval.is_zero() { DEFAULT_INTERVAL } else { interval };
        Self {
            workspace,
            interval,
            on_heartbeat,
            notify,
            state: Mutex::new(NotifyState::default()),
        }
    }

    pub async fn start(&self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat started");
        let mut ticker = tokio::time::interval(self.interval);
        // The immediate first tick of tokio's interval is skipped: a
        // heartbeat fires after its interval, not at startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat stopped");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let path = self.workspace.join("HEARTBEAT.md");
        let content = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("heartbeat read error: {e}");
                return;
            }
        };
        let content = content.trim();
        if content.is_empty() {
            return;
        }

        debug!(chars = content.len(), "heartbeat triggering");
        let result = match (self.on_heartbeat)(content.to_string()).await {
            Ok(result) => result,
            Err(e) => {
                warn!("heartbeat error: {e:#}");
                return;
            }
        };

        if result.contains(HEARTBEAT_OK) {
            debug!("heartbeat: nothing to do");
            return;
        }

        // Identical output inside the dedup window is dropped.
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let is_dup = state.last_text == result
                && state
                    .last_at
                    .is_some_and(|at| now - at < chrono::Duration::hours(DEDUP_WINDOW_HOURS));
            if is_dup {
                debug!("heartbeat: duplicate result inside dedup window, skipping");
                return;
            }
            state.last_text = result.clone();
            state.last_at = Some(now);
        }

        (self.notify)(result).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn run_fn(output: &str) -> (HeartbeatRunFn, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let output = output.to_string();
        let run: HeartbeatRunFn = Arc::new(move |_prompt| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let output = output.clone();
            Box::pin(async move { Ok(output) })
        });
        (run, calls)
    }

    fn notify_fn() -> (HeartbeatNotifyFn, Arc<StdMutex<Vec<String>>>) {
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let notify: HeartbeatNotifyFn = Arc::new(move |text| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().unwrap().push(text);
            })
        });
        (notify, seen)
    }

    fn heartbeat(dir: &std::path::Path, output: &str) -> (Heartbeat, Arc<AtomicUsize>, Arc<StdMutex<Vec<String>>>) {
        let (run, calls) = run_fn(output);
        let (notify, seen) = notify_fn();
        let hb = Heartbeat::new(dir.to_path_buf(), Duration::from_secs(1), run, notify);
        (hb, calls, seen)
    }

    #[test]
    fn test_default_interval() {
        let (run, _) = run_fn("x");
        let (notify, _) = notify_fn();
        let hb = Heartbeat::new(PathBuf::from("/tmp/ws"), Duration::ZERO, run, notify);
        assert_eq!(hb.interval, DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn test_tick_missing_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (hb, calls, _) = heartbeat(dir.path(), "done");
        hb.tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_empty_file_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "  \n").unwrap();
        let (hb, calls, _) = heartbeat(dir.path(), "done");
        hb.tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_runs_prompt_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "Check tasks").unwrap();
        let (hb, calls, seen) = heartbeat(dir.path(), "found something");
        hb.tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["found something".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_ok_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "Check tasks").unwrap();
        let (hb, calls, seen) = heartbeat(dir.path(), "HEARTBEAT_OK - nothing to do");
        hb.tick().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identical_output_deduped_within_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "Check tasks").unwrap();
        let (hb, _, seen) = heartbeat(dir.path(), "same thing");
        hb.tick().await;
        hb.tick().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_different_output_not_deduped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "Check tasks").unwrap();

        let outputs = Arc::new(StdMutex::new(vec!["second".to_string(), "first".to_string()]));
        let run: HeartbeatRunFn = {
            let outputs = outputs.clone();
            Arc::new(move |_prompt| {
                let next = outputs.lock().unwrap().pop().unwrap_or_default();
                Box::pin(async move { Ok(next) })
            })
        };
        let (notify, seen) = notify_fn();
        let hb = Heartbeat::new(dir.path().to_path_buf(), Duration::from_secs(1), run, notify);

        hb.tick().await;
        hb.tick().await;
        assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_error_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("HEARTBEAT.md"), "Check tasks").unwrap();
        let run: HeartbeatRunFn =
            Arc::new(|_prompt| Box::pin(async { Err::<String, _>(anyhow::anyhow!("boom")) }));
        let (notify, seen) = notify_fn();
        let hb = Heartbeat::new(dir.path().to_path_buf(), Duration::from_secs(1), run, notify);
        hb.tick().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_exits_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (hb, _, _) = heartbeat(dir.path(), "x");
        let cancel = CancellationToken::new();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), hb.start(cancel))
            .await
            .expect("heartbeat should exit promptly on cancel");
    }
}
