//! Worker agent entrypoint — listener loop and background tasks
//!
//! Wires the pipeline, calibrator, health monitor and reporter together and
//! serves the catch-all HTTP surface. Every route except `/ping` goes
//! through admission.

use std::convert::Infallible;
use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::admission::RequestPipeline;
use crate::auth::AuthVerifier;
use crate::calibrate::BenchmarkCalibrator;
use crate::config::WorkerConfig;
use crate::error::{AgentError, Result};
use crate::health::HealthMonitor;
use crate::metrics::WorkerMetrics;
use crate::proxy::{full_body, AgentBody, Forwarder};
use crate::report::Reporter;
use crate::VERSION;

pub struct WorkerAgent {
    config: WorkerConfig,
    metrics: Arc<WorkerMetrics>,
    verifier: Arc<AuthVerifier>,
    forwarder: Arc<Forwarder>,
    pipeline: Arc<RequestPipeline>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        let metrics = Arc::new(WorkerMetrics::new(
            config.worker_id,
            config.mtoken.clone(),
            VERSION.to_string(),
            config.worker_url.clone(),
        ));
        let verifier = Arc::new(AuthVerifier::new(&config.report_addr, config.unsecured));
        let forwarder = Arc::new(Forwarder::new(&config.model_server_url)?);
        let pipeline = Arc::new(RequestPipeline::new(
            &config,
            metrics.clone(),
            verifier.clone(),
            forwarder.clone(),
        ));
        Ok(Self {
            config,
            metrics,
            verifier,
            forwarder,
            pipeline,
        })
    }

    /// Start the background loops and serve until the process is killed.
    pub async fn run(self) -> Result<()> {
        self.verifier.init().await;

        let (calibrator, ready_rx) = BenchmarkCalibrator::new(
            &self.config,
            self.metrics.clone(),
            self.forwarder.client(),
        )?;
        tokio::spawn(async move {
            if let Err(err) = calibrator.run().await {
                // Sticky error already recorded; keep serving so the
                // autoscaler sees the failure in the next report.
                tracing::error!(error = %err, "Calibration failed");
            }
        });

        if let Some(monitor) = HealthMonitor::new(&self.config, self.metrics.clone(), ready_rx)? {
            tokio::spawn(monitor.run());
        }

        let reporter = Arc::new(Reporter::new(&self.config, self.metrics.clone())?);
        tokio::spawn(reporter.clone().run_status_loop());
        tokio::spawn(reporter.run_delete_loop());

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| {
                AgentError::Config(format!("failed to bind {}: {}", self.config.listen_addr, e))
            })?;
        tracing::info!(
            address = %self.config.listen_addr,
            backend = %self.config.model_server_url,
            version = VERSION,
            "Worker agent listening"
        );

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            tracing::debug!(remote = %remote_addr, "Connection accepted");

            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                // Fires when the connection is gone, releasing any handler
                // still racing the backend.
                let disconnect = CancellationToken::new();
                let handler_token = disconnect.clone();

                let service = service_fn(move |request: Request<Incoming>| {
                    let pipeline = pipeline.clone();
                    let cancel = handler_token.clone();
                    async move { Ok::<_, Infallible>(route(&pipeline, request, cancel).await) }
                });

                let io = TokioIo::new(stream);
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!(error = %err, "Connection ended with error");
                }
                disconnect.cancel();
            });
        }
    }
}

async fn route(
    pipeline: &RequestPipeline,
    request: Request<Incoming>,
    cancel: CancellationToken,
) -> Response<AgentBody> {
    if request.method() == Method::GET && request.uri().path() == "/ping" {
        return pong();
    }
    pipeline.handle(request, cancel).await
}

/// Liveness probe for the deploying platform, outside admission entirely.
fn pong() -> Response<AgentBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(full_body("pong"))
        .unwrap_or_else(|_| Response::new(full_body("pong")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_response() {
        let response = pong();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_agent_construction() {
        let config = WorkerConfig::default();
        assert!(WorkerAgent::new(config).is_ok());
    }
}
