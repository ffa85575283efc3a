use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LogPollConfig;
use crate::service::client::BuildServiceClient;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum LogEvent {
    #[serde(rename_all = "camelCase")]
    Logs { job_id: String, lines: Vec<String> },
    #[serde(rename_all = "camelCase")]
    Error { job_id: String, message: String },
}

/// Repeatedly fetches build logs for one job until stopped.
///
/// Starting a new job replaces the previous poll loop. The loop also ends
/// when the event receiver is dropped or the poller itself is dropped.
pub struct LogPoller {
    client: BuildServiceClient,
    interval: Duration,
    error_interval: Duration,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LogPoller {
    pub fn new(client: BuildServiceClient, config: &LogPollConfig) -> Self {
        Self {
            client,
            interval: Duration::from_millis(config.interval_ms),
            error_interval: Duration::from_millis(config.error_interval_ms),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_active(&self) -> bool {
        match self.handle.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|h| !h.is_finished()),
            // Locked means start/stop is mid-flight; report the loop as live.
            Err(_) => true,
        }
    }

    pub async fn start(&self, job_id: &str, on_event: mpsc::UnboundedSender<LogEvent>) {
        let mut guard = self.handle.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }

        let client = self.client.clone();
        let interval = self.interval;
        let error_interval = self.error_interval;
        let job_id = job_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let (event, delay) = match client.logs(&job_id).await {
                    Ok(lines) => {
                        debug!(job_id = %job_id, lines = lines.len(), "polled build logs");
                        (
                            LogEvent::Logs {
                                job_id: job_id.clone(),
                                lines,
                            },
                            interval,
                        )
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "log poll failed");
                        (
                            LogEvent::Error {
                                job_id: job_id.clone(),
                                message: e.to_string(),
                            },
                            error_interval,
                        )
                    }
                };

                if on_event.send(event).is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
            }
        });

        *guard = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Synchronous stop for drop paths.
    pub fn kill_sync(&self) {
        if let Ok(mut guard) = self.handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for LogPoller {
    fn drop(&mut self) {
        self.kill_sync();
    }
}
