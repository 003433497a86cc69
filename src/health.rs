//! Backend health monitoring
//!
//! Polls the configured health endpoint once calibration has finished.
//! Transient blips are absorbed by a consecutive-failure counter: only a
//! full run of failures marks the backend errored, and any single success
//! resets the run.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{WorkerConfig, HEALTHCHECK_POLL_INTERVAL, HEALTHCHECK_TIMEOUT};
use crate::error::Result;
use crate::metrics::WorkerMetrics;

/// Counts probe outcomes and decides when a failure run becomes an error.
/// Kept separate from the poll loop so the threshold logic is testable
/// without a network.
struct FailureTracker {
    threshold: u32,
    consecutive_failures: u32,
}

impl FailureTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    /// Record a failed probe. Returns true when the run just reached the
    /// threshold; the counter resets so one episode alerts once.
    fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            self.consecutive_failures = 0;
            return true;
        }
        false
    }

    /// Record a successful probe. Returns true if it ended a failure run.
    fn record_success(&mut self) -> bool {
        let recovered = self.consecutive_failures > 0;
        self.consecutive_failures = 0;
        recovered
    }
}

pub struct HealthMonitor {
    url: String,
    client: reqwest::Client,
    metrics: Arc<WorkerMetrics>,
    tracker: FailureTracker,
    ready_rx: watch::Receiver<bool>,
}

impl HealthMonitor {
    /// Returns None when no health endpoint is configured; the worker then
    /// runs without ongoing health polling.
    pub fn new(
        config: &WorkerConfig,
        metrics: Arc<WorkerMetrics>,
        ready_rx: watch::Receiver<bool>,
    ) -> Result<Option<Self>> {
        let endpoint = match &config.healthcheck_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => {
                tracing::debug!("No healthcheck endpoint configured, monitor disabled");
                return Ok(None);
            }
        };
        let client = reqwest::Client::builder()
            .timeout(HEALTHCHECK_TIMEOUT)
            .build()?;
        Ok(Some(Self {
            url: format!(
                "{}{}",
                config.model_server_url.trim_end_matches('/'),
                endpoint
            ),
            client,
            metrics,
            tracker: FailureTracker::new(config.healthcheck_consecutive_failures),
            ready_rx,
        }))
    }

    /// Poll forever. Waits for the calibrator's Ready signal before the
    /// first probe so startup slowness never counts as a failure.
    pub async fn run(mut self) {
        while !*self.ready_rx.borrow() {
            if self.ready_rx.changed().await.is_err() {
                // Calibrator dropped without reaching Ready, nothing to monitor.
                return;
            }
        }

        tracing::info!(url = %self.url, "Health monitoring started");
        loop {
            tokio::time::sleep(HEALTHCHECK_POLL_INTERVAL).await;
            self.probe_once().await;
        }
    }

    async fn probe_once(&mut self) {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                if self.tracker.record_success() {
                    tracing::info!(url = %self.url, "Backend healthy again");
                } else {
                    tracing::debug!("Healthcheck successful");
                }
            }
            Ok(response) => {
                let status = response.status();
                tracing::debug!(%status, "Healthcheck failed");
                if self.tracker.record_failure() {
                    self.metrics
                        .model_errored(format!("healthcheck failed with status {status}"));
                }
            }
            Err(err) => {
                tracing::debug!(error = %err, "Healthcheck failed");
                if self.tracker.record_failure() {
                    self.metrics.model_errored(format!("healthcheck failed: {err}"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_reached_exactly_once() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
        // Counter reset after alerting; the episode does not re-alert.
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn test_success_resets_run() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_success());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(tracker.record_failure());
    }

    #[test]
    fn test_success_without_failures_is_not_recovery() {
        let mut tracker = FailureTracker::new(3);
        assert!(!tracker.record_success());
    }

    #[test]
    fn test_zero_threshold_clamped() {
        let mut tracker = FailureTracker::new(0);
        assert!(tracker.record_failure());
    }

    #[test]
    fn test_monitor_disabled_without_endpoint() {
        let config = WorkerConfig::default();
        let metrics = Arc::new(WorkerMetrics::new(
            0,
            String::new(),
            "0.3.0".to_string(),
            String::new(),
        ));
        let (_tx, rx) = watch::channel(false);
        assert!(HealthMonitor::new(&config, metrics, rx).unwrap().is_none());
    }
}
