//! Request admission and forwarding — the core pipeline
//!
//! Each inbound request runs: envelope parse, signature check, queue-wait
//! admission, concurrency gate, then a race between the backend forward and
//! client disconnect. Rejections never touch the backend. Terminal status
//! is recorded exactly once per request, with a drop guard covering every
//! early-exit path including hyper dropping the handler future.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use http::{Method, Request, Response, StatusCode};
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthVerifier;
use crate::config::WorkerConfig;
use crate::envelope::{self, ValidationError};
use crate::error::AgentError;
use crate::metrics::{RequestMetrics, WorkerMetrics};
use crate::proxy::{full_body, AgentBody, BackendResponse, Forwarder};

/// Client closed the connection before the response was produced.
const STATUS_CLIENT_CLOSED: u16 = 499;

pub struct RequestPipeline {
    metrics: Arc<WorkerMetrics>,
    verifier: Arc<AuthVerifier>,
    forwarder: Arc<Forwarder>,
    semaphore: Arc<Semaphore>,
    allow_parallel_requests: bool,
    max_wait_time: f64,
}

impl RequestPipeline {
    pub fn new(
        config: &WorkerConfig,
        metrics: Arc<WorkerMetrics>,
        verifier: Arc<AuthVerifier>,
        forwarder: Arc<Forwarder>,
    ) -> Self {
        Self {
            metrics,
            verifier,
            forwarder,
            semaphore: Arc::new(Semaphore::new(1)),
            allow_parallel_requests: config.allow_parallel_requests,
            max_wait_time: config.max_wait_time,
        }
    }

    /// Handle one inbound request end to end. `cancel` fires when the
    /// client connection goes away.
    pub async fn handle(
        &self,
        request: Request<Incoming>,
        cancel: CancellationToken,
    ) -> Response<AgentBody> {
        let method = request.method().clone();

        let parsed = match self.parse_envelope(request).await {
            Ok(parsed) => parsed,
            Err(response) => return response,
        };
        let (auth, payload) = parsed;

        // from_json guarantees a parsable cost, but the guard stays local
        let workload = match auth.workload() {
            Some(workload) => workload,
            None => {
                return validation_response(&ValidationError::InvalidJson);
            }
        };
        let mut rm = RequestMetrics::new(auth.request_idx, auth.reqnum, workload);

        if !self.verifier.verify(&auth).await {
            tracing::debug!(reqnum = rm.reqnum, "Signature rejected");
            self.metrics.request_reject(&mut rm);
            return status_response(StatusCode::UNAUTHORIZED);
        }

        let wait_time = self.metrics.wait_time();
        if wait_time > self.max_wait_time {
            tracing::debug!(
                reqnum = rm.reqnum,
                wait_time,
                max_wait_time = self.max_wait_time,
                "Queue too deep, rejecting"
            );
            self.metrics.request_reject(&mut rm);
            return status_response(StatusCode::TOO_MANY_REQUESTS);
        }

        let mut tracker = RequestTracker::start(self.metrics.clone(), rm);

        if !self.allow_parallel_requests {
            tracing::debug!(reqnum = tracker.reqnum(), "Waiting for concurrency slot");
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => permit,
                _ = cancel.cancelled() => {
                    tracker.canceled();
                    return client_closed_response();
                }
            };
            match permit {
                Ok(permit) => tracker.hold_permit(permit),
                Err(_) => {
                    tracker.errored();
                    return status_response(StatusCode::INTERNAL_SERVER_ERROR);
                }
            }
        }
        tracing::debug!(reqnum = tracker.reqnum(), "Starting forward");

        let forwarder = self.forwarder.clone();
        let endpoint = auth.endpoint.clone();
        let forward_method = method.clone();
        let mut forward = tokio::spawn(async move {
            let response = forwarder.forward(&forward_method, &endpoint, &payload).await?;
            forwarder.classify(response).await
        });
        // Hyper drops this handler future when the client vanishes; the
        // tracker then aborts the forward instead of letting it run out.
        tracker.watch_forward(forward.abort_handle());

        let joined = tokio::select! {
            joined = &mut forward => joined,
            _ = cancel.cancelled() => {
                tracing::debug!(reqnum = tracker.reqnum(), "Client disconnected, aborting forward");
                forward.abort();
                let _ = forward.await;
                tracker.canceled();
                return client_closed_response();
            }
        };

        tracker.forward_done();
        match joined {
            Ok(Ok(backend)) => self.relay(backend, tracker),
            Ok(Err(err)) => {
                tracing::debug!(reqnum = tracker.reqnum(), error = %err, "Forward failed");
                tracker.errored();
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Err(join_err) => {
                tracing::debug!(reqnum = tracker.reqnum(), error = %join_err, "Forward task failed");
                tracker.errored();
                status_response(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    async fn parse_envelope(
        &self,
        request: Request<Incoming>,
    ) -> std::result::Result<(envelope::AuthData, serde_json::Value), Response<AgentBody>> {
        let unsecured = self.verifier.is_unsecured();
        match *request.method() {
            Method::GET | Method::DELETE | Method::HEAD => {
                let query = request.uri().query().unwrap_or("");
                envelope::parse_query(query).map_err(|e| validation_response(&e))
            }
            _ => {
                let path = request.uri().path().to_string();
                let body = match read_body(request).await {
                    Ok(body) => body,
                    Err(err) => {
                        tracing::debug!(error = %err, "Failed reading request body");
                        return Err(client_closed_response());
                    }
                };
                envelope::parse_body(&body, &path, unsecured).map_err(|e| validation_response(&e))
            }
        }
    }

    /// Turn a classified backend response into the client response. Buffered
    /// bodies complete the request here; streams carry the tracker with them
    /// so the terminal status lands when the relay actually finishes.
    fn relay(&self, backend: BackendResponse, mut tracker: RequestTracker) -> Response<AgentBody> {
        match backend {
            BackendResponse::Buffered {
                status,
                content_type,
                body,
            } => {
                tracker.success();
                let mut builder = Response::builder().status(status);
                if let Some(content_type) = content_type {
                    builder = builder.header(http::header::CONTENT_TYPE, content_type);
                }
                builder
                    .body(full_body(body))
                    .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
            }
            BackendResponse::Streaming {
                content_type,
                cache_control,
                response,
            } => {
                let guarded = GuardedStream {
                    inner: response.bytes_stream().boxed(),
                    tracker: Some(tracker),
                };
                let body: AgentBody = Box::pin(StreamBody::new(guarded));

                let mut builder = Response::builder().status(StatusCode::OK);
                if let Some(content_type) = content_type {
                    builder = builder.header(http::header::CONTENT_TYPE, content_type);
                }
                if let Some(cache_control) = cache_control {
                    builder = builder.header(http::header::CACHE_CONTROL, cache_control);
                }
                builder
                    .body(body)
                    .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }
}

async fn read_body(request: Request<Incoming>) -> std::result::Result<Bytes, AgentError> {
    use http_body_util::BodyExt;
    let collected = request
        .into_body()
        .collect()
        .await
        .map_err(|e| AgentError::Other(e.to_string()))?;
    Ok(collected.to_bytes())
}

/// Exactly-once terminal accounting for one admitted request.
///
/// Created after admission (start recorded), finished by one of the
/// terminal methods. If the tracker is dropped unfinished, the request
/// counts as canceled and any in-flight forward task is aborted: hyper
/// drops the handler future when the client goes away, and a streaming
/// client can vanish mid-relay.
struct RequestTracker {
    metrics: Arc<WorkerMetrics>,
    rm: RequestMetrics,
    finished: bool,
    permit: Option<OwnedSemaphorePermit>,
    forward: Option<AbortHandle>,
}

impl RequestTracker {
    fn start(metrics: Arc<WorkerMetrics>, mut rm: RequestMetrics) -> Self {
        metrics.request_start(&mut rm);
        Self {
            metrics,
            rm,
            finished: false,
            permit: None,
            forward: None,
        }
    }

    fn reqnum(&self) -> i64 {
        self.rm.reqnum
    }

    fn hold_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }

    fn watch_forward(&mut self, handle: AbortHandle) {
        self.forward = Some(handle);
    }

    /// The forward task has been joined; nothing left to abort.
    fn forward_done(&mut self) {
        self.forward = None;
    }

    fn success(&mut self) {
        if !self.finished {
            self.metrics.request_success(&mut self.rm);
            self.finished = true;
        }
    }

    fn errored(&mut self) {
        if !self.finished {
            self.metrics.request_errored(&mut self.rm);
            self.finished = true;
        }
    }

    fn canceled(&mut self) {
        if !self.finished {
            tracing::debug!(reqnum = self.rm.reqnum, "Request canceled");
            self.metrics.request_canceled(&mut self.rm);
            self.finished = true;
        }
    }
}

impl Drop for RequestTracker {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(handle) = self.forward.take() {
                handle.abort();
            }
            self.metrics.request_canceled(&mut self.rm);
            self.finished = true;
        }
        self.metrics.request_end(&mut self.rm);
        // permit released here, after the working-set entry is gone
    }
}

/// Relay stream that records the request outcome from the stream's fate:
/// clean end is success, mid-stream backend error is errored, and dropping
/// the body before the end counts as canceled via the tracker drop guard.
struct GuardedStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    tracker: Option<RequestTracker>,
}

impl Stream for GuardedStream {
    type Item = std::result::Result<Frame<Bytes>, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Poll::Ready(Some(Err(err))) => {
                if let Some(tracker) = self.tracker.as_mut() {
                    tracker.errored();
                }
                Poll::Ready(Some(Err(std::io::Error::other(err))))
            }
            Poll::Ready(None) => {
                if let Some(mut tracker) = self.tracker.take() {
                    tracker.success();
                }
                tracing::debug!("Streaming complete");
                Poll::Ready(None)
            }
        }
    }
}

fn status_response(status: StatusCode) -> Response<AgentBody> {
    match Response::builder().status(status).body(full_body(Bytes::new())) {
        Ok(response) => response,
        Err(_) => Response::new(full_body(Bytes::new())),
    }
}

fn client_closed_response() -> Response<AgentBody> {
    match StatusCode::from_u16(STATUS_CLIENT_CLOSED) {
        Ok(status) => status_response(status),
        Err(_) => status_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// 422 with the field-level reasons in the body.
fn validation_response(error: &ValidationError) -> Response<AgentBody> {
    let body = error.to_body().to_string();
    Response::builder()
        .status(StatusCode::UNPROCESSABLE_ENTITY)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}
