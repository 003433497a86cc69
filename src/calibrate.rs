//! Startup calibration — measure or restore the backend's max throughput
//!
//! Two states, Uncalibrated then Ready. A single-line float file persisted
//! next to the agent distinguishes a resume (weights already on disk, short
//! readiness budget, cached throughput) from an initial boot (long readiness
//! budget, benchmark run, result persisted). Readiness is signalled to the
//! health monitor through a watch channel.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::benchmark;
use crate::config::{WorkerConfig, HEALTHCHECK_RETRY_INTERVAL, HEALTHCHECK_TIMEOUT};
use crate::error::{AgentError, Result};
use crate::metrics::WorkerMetrics;

pub struct BenchmarkCalibrator {
    model_server_url: String,
    healthcheck_endpoint: Option<String>,
    benchmark_name: Option<String>,
    ready_timeout: u64,
    resume_ready_timeout: u64,
    state_file: PathBuf,
    metrics: std::sync::Arc<WorkerMetrics>,
    probe_client: reqwest::Client,
    backend_client: reqwest::Client,
    ready_tx: watch::Sender<bool>,
}

impl BenchmarkCalibrator {
    /// Build the calibrator and the readiness channel the health monitor
    /// subscribes to.
    pub fn new(
        config: &WorkerConfig,
        metrics: std::sync::Arc<WorkerMetrics>,
        backend_client: reqwest::Client,
    ) -> Result<(Self, watch::Receiver<bool>)> {
        let probe_client = reqwest::Client::builder()
            .timeout(HEALTHCHECK_TIMEOUT)
            .build()?;
        let (ready_tx, ready_rx) = watch::channel(false);
        Ok((
            Self {
                model_server_url: config.model_server_url.trim_end_matches('/').to_string(),
                healthcheck_endpoint: config.healthcheck_endpoint.clone(),
                benchmark_name: config.benchmark.clone(),
                ready_timeout: config.ready_timeout,
                resume_ready_timeout: config.resume_ready_timeout,
                state_file: config.benchmark_file.clone(),
                metrics,
                probe_client,
                backend_client,
                ready_tx,
            },
            ready_rx,
        ))
    }

    /// Run calibration to completion. Returns once the worker is Ready or
    /// the readiness wait timed out; a timeout leaves a sticky error behind
    /// and the worker serves nothing useful until restarted.
    pub async fn run(self) -> Result<()> {
        match self.read_cached() {
            Some(cached) => {
                tracing::info!(max_throughput = cached, "Resuming with cached benchmark result");
                self.wait_for_backend_ready(self.resume_ready_timeout)
                    .await?;
                self.metrics.model_loaded(cached);
            }
            None => {
                self.wait_for_backend_ready(self.ready_timeout).await?;
                let (max_throughput, error) = self.measure().await;
                self.persist(max_throughput);
                self.metrics.model_loaded(max_throughput);
                // Recorded after model_loaded, which clears any prior error;
                // a degraded calibration must stay visible to the autoscaler.
                if let Some(msg) = error {
                    self.metrics.model_errored(msg);
                }
            }
        }

        // Value is best-effort; the monitor only ever observes `true`.
        let _ = self.ready_tx.send(true);
        Ok(())
    }

    fn read_cached(&self) -> Option<f64> {
        let text = std::fs::read_to_string(&self.state_file).ok()?;
        match text.lines().next().unwrap_or("").trim().parse::<f64>() {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(
                    path = %self.state_file.display(),
                    error = %err,
                    "Ignoring unreadable benchmark cache, re-measuring"
                );
                None
            }
        }
    }

    fn persist(&self, max_throughput: f64) {
        // A failed write costs a re-measurement on the next boot, nothing more.
        if let Err(err) = std::fs::write(&self.state_file, format!("{max_throughput}")) {
            tracing::warn!(
                path = %self.state_file.display(),
                error = %err,
                "Failed to persist benchmark result"
            );
        }
    }

    /// Measure throughput, or fall back to 1.0 with the failure reason.
    async fn measure(&self) -> (f64, Option<String>) {
        let name = match &self.benchmark_name {
            Some(name) => name,
            None => {
                let msg = "no benchmark configured, using default throughput of 1.0".to_string();
                tracing::warn!("{msg}");
                return (1.0, Some(msg));
            }
        };

        let func = match benchmark::lookup(name) {
            Some(func) => func,
            None => {
                let msg = format!("unknown benchmark {name:?}, using default throughput of 1.0");
                tracing::error!("{msg}");
                return (1.0, Some(msg));
            }
        };

        tracing::info!(benchmark = %name, "Running startup benchmark");
        match func(self.backend_client.clone(), self.model_server_url.clone()).await {
            Ok(max_throughput) => {
                tracing::info!(max_throughput, "Benchmark complete");
                (max_throughput, None)
            }
            Err(msg) => {
                tracing::error!(error = %msg, "Benchmark failed, using default throughput of 1.0");
                (1.0, Some(msg))
            }
        }
    }

    /// Poll the health endpoint until it answers 200 or the budget runs out.
    /// Workers without a configured health endpoint probe `/health`.
    async fn wait_for_backend_ready(&self, timeout_secs: u64) -> Result<()> {
        let endpoint = self.healthcheck_endpoint.as_deref().unwrap_or("/health");
        let url = format!("{}{}", self.model_server_url, endpoint);
        tracing::info!(url = %url, timeout_secs, "Waiting for backend to become ready");

        let start = Instant::now();
        loop {
            if start.elapsed() >= Duration::from_secs(timeout_secs) {
                let msg = format!("backend failed to become ready after {timeout_secs} seconds");
                tracing::error!("{msg}");
                self.metrics.model_errored(msg);
                return Err(AgentError::ReadinessTimeout(timeout_secs));
            }

            match self.probe_client.get(&url).send().await {
                Ok(response) if response.status() == reqwest::StatusCode::OK => {
                    tracing::info!(
                        elapsed_secs = start.elapsed().as_secs_f64(),
                        "Backend is ready"
                    );
                    return Ok(());
                }
                Ok(response) => {
                    tracing::debug!(status = %response.status(), "Backend not ready yet");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Backend not reachable yet");
                }
            }

            tokio::time::sleep(HEALTHCHECK_RETRY_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use std::sync::Arc;

    fn test_metrics() -> Arc<WorkerMetrics> {
        Arc::new(WorkerMetrics::new(
            0,
            String::new(),
            "0.3.0".to_string(),
            String::new(),
        ))
    }

    fn calibrator_with_file(path: PathBuf) -> BenchmarkCalibrator {
        let config = WorkerConfig {
            benchmark_file: path,
            ..WorkerConfig::default()
        };
        let (calibrator, _rx) =
            BenchmarkCalibrator::new(&config, test_metrics(), reqwest::Client::new()).unwrap();
        calibrator
    }

    #[tokio::test]
    async fn test_cached_value_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = calibrator_with_file(dir.path().join(".max_throughput"));
        assert_eq!(calibrator.read_cached(), None);
        calibrator.persist(42.5);
        assert_eq!(calibrator.read_cached(), Some(42.5));
    }

    #[tokio::test]
    async fn test_garbage_cache_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".max_throughput");
        std::fs::write(&path, "not a float\n").unwrap();
        let calibrator = calibrator_with_file(path);
        assert_eq!(calibrator.read_cached(), None);
    }

    #[tokio::test]
    async fn test_measure_without_benchmark_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let calibrator = calibrator_with_file(dir.path().join(".max_throughput"));
        let (throughput, error) = calibrator.measure().await;
        assert_eq!(throughput, 1.0);
        assert!(error.is_some());
    }

    #[tokio::test]
    async fn test_measure_unknown_benchmark_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            benchmark_file: dir.path().join(".max_throughput"),
            benchmark: Some("quantum".to_string()),
            ..WorkerConfig::default()
        };
        let (calibrator, _rx) =
            BenchmarkCalibrator::new(&config, test_metrics(), reqwest::Client::new()).unwrap();
        let (throughput, error) = calibrator.measure().await;
        assert_eq!(throughput, 1.0);
        assert!(error.is_some());
    }

    /// Minimal backend whose health endpoint always answers 200.
    async fn spawn_ready_backend() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(
                            b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n",
                        )
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_failed_calibration_keeps_sticky_error_after_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            benchmark_file: dir.path().join(".max_throughput"),
            model_server_url: spawn_ready_backend().await,
            benchmark: None,
            ..WorkerConfig::default()
        };
        let metrics = test_metrics();
        let (calibrator, mut ready_rx) =
            BenchmarkCalibrator::new(&config, metrics.clone(), reqwest::Client::new()).unwrap();
        calibrator.run().await.unwrap();
        assert!(*ready_rx.borrow_and_update());
        assert_eq!(metrics.snapshot().max_throughput, 1.0);
        // Ready but degraded: the failure reason must survive model_loaded
        assert!(metrics.error_msg().is_some());
    }

    #[tokio::test]
    async fn test_resume_skips_remeasurement_and_keeps_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".max_throughput");
        std::fs::write(&path, "42.5\n").unwrap();
        let backend = spawn_ready_backend().await;

        for _ in 0..2 {
            let config = WorkerConfig {
                benchmark_file: path.clone(),
                model_server_url: backend.clone(),
                benchmark: None,
                ..WorkerConfig::default()
            };
            let metrics = test_metrics();
            let (calibrator, _rx) =
                BenchmarkCalibrator::new(&config, metrics.clone(), reqwest::Client::new()).unwrap();
            calibrator.run().await.unwrap();
            assert_eq!(metrics.snapshot().max_throughput, 42.5);
            // measure() never ran: no benchmark is configured, so running it
            // would have left an error behind
            assert!(metrics.error_msg().is_none());
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "42.5\n");
    }

    #[tokio::test]
    async fn test_initial_boot_persists_then_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".max_throughput");
        let backend = spawn_ready_backend().await;

        let config = WorkerConfig {
            benchmark_file: path.clone(),
            model_server_url: backend.clone(),
            benchmark: None,
            ..WorkerConfig::default()
        };
        let first = test_metrics();
        let (calibrator, _rx) =
            BenchmarkCalibrator::new(&config, first.clone(), reqwest::Client::new()).unwrap();
        calibrator.run().await.unwrap();
        assert_eq!(first.snapshot().max_throughput, 1.0);
        assert!(first.error_msg().is_some());

        // Second boot resumes from the persisted value without re-measuring
        let second = test_metrics();
        let (calibrator, _rx) =
            BenchmarkCalibrator::new(&config, second.clone(), reqwest::Client::new()).unwrap();
        calibrator.run().await.unwrap();
        assert_eq!(second.snapshot().max_throughput, 1.0);
        assert!(second.error_msg().is_none());
    }

    #[tokio::test]
    async fn test_readiness_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig {
            benchmark_file: dir.path().join(".max_throughput"),
            model_server_url: "http://127.0.0.1:1".to_string(),
            ..WorkerConfig::default()
        };
        let metrics = test_metrics();
        let (calibrator, _rx) =
            BenchmarkCalibrator::new(&config, metrics.clone(), reqwest::Client::new()).unwrap();
        let err = calibrator.wait_for_backend_ready(0).await.unwrap_err();
        assert!(matches!(err, AgentError::ReadinessTimeout(0)));
        assert!(metrics.error_msg().is_some());
    }
}
