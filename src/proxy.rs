//! Backend forwarding — pass-through proxy to the model server
//!
//! The agent never interprets payloads: it forwards the method and payload
//! verbatim and relays the response back, streaming chunk-by-chunk when the
//! backend response looks like a stream.

use crate::error::{AgentError, Result};
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use serde_json::Value;
use std::pin::Pin;

/// Response body type used throughout the agent's HTTP surface. Boxed with
/// Send but not Sync, because relayed backend streams are not Sync.
pub type AgentBody = Pin<Box<dyn Body<Data = Bytes, Error = std::io::Error> + Send>>;

/// Fully-buffered response body.
pub fn full_body(bytes: impl Into<Bytes>) -> AgentBody {
    Box::pin(Full::new(bytes.into()).map_err(|never| -> std::io::Error { match never {} }))
}

/// Classified backend response, ready to relay to the caller.
pub enum BackendResponse {
    /// Read fully, relayed in one piece with the original status
    Buffered {
        status: StatusCode,
        content_type: Option<String>,
        body: Bytes,
    },
    /// Relayed chunk-by-chunk as it arrives
    Streaming {
        content_type: Option<String>,
        cache_control: Option<String>,
        response: reqwest::Response,
    },
}

/// HTTP client for the model server.
///
/// Built eagerly at startup. No request timeout: inference calls may run
/// arbitrarily long, and only client disconnect or a real I/O failure ends
/// a forward early.
pub struct Forwarder {
    base_url: String,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Shared client handle, handed to benchmark functions.
    pub fn client(&self) -> reqwest::Client {
        self.client.clone()
    }

    /// Forward a request to `<base_url><endpoint>`.
    ///
    /// GET sends the payload as query parameters; POST/PUT/PATCH/DELETE as a
    /// JSON body. Unknown methods default to POST semantics.
    pub async fn forward(
        &self,
        method: &http::Method,
        endpoint: &str,
        payload: &Value,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, endpoint);
        tracing::debug!(method = %method, url = %url, "Forwarding to backend");

        let request = match *method {
            http::Method::GET => self.client.get(&url).query(&query_pairs(payload)),
            http::Method::POST | http::Method::PUT | http::Method::PATCH | http::Method::DELETE => {
                self.client.request(method.clone(), &url).json(payload)
            }
            _ => self.client.post(&url).json(payload),
        };

        Ok(request.send().await?)
    }

    /// Decide how a backend response will be relayed.
    ///
    /// Non-200 responses pass through byte-for-byte with their original
    /// status and content type. 200 responses are inspected for streaming
    /// indicators; anything non-streaming is read fully.
    pub async fn classify(&self, response: reqwest::Response) -> Result<BackendResponse> {
        let status = response.status();
        let content_type = header_str(&response, "content-type");

        if status != StatusCode::OK {
            let body = response.bytes().await.map_err(AgentError::Http)?;
            return Ok(BackendResponse::Buffered {
                status,
                content_type,
                body,
            });
        }

        let transfer_encoding = header_str(&response, "transfer-encoding");
        if is_streaming(content_type.as_deref(), transfer_encoding.as_deref()) {
            tracing::debug!("Streaming response detected, relaying chunks");
            let cache_control = header_str(&response, "cache-control");
            return Ok(BackendResponse::Streaming {
                content_type,
                cache_control,
                response,
            });
        }

        let body = response.bytes().await.map_err(AgentError::Http)?;
        Ok(BackendResponse::Buffered {
            status: StatusCode::OK,
            content_type,
            body,
        })
    }
}

/// Streaming heuristic, kept exactly as observed in production: exact match
/// on the SSE/NDJSON media types, chunked transfer encoding, or the
/// substring "stream" anywhere in the content type (case-insensitive).
pub fn is_streaming(content_type: Option<&str>, transfer_encoding: Option<&str>) -> bool {
    let content_type = content_type.unwrap_or("");
    let mime = content_type.split(';').next().unwrap_or("").trim();
    mime == "text/event-stream"
        || mime == "application/x-ndjson"
        || transfer_encoding.map(str::trim) == Some("chunked")
        || content_type.to_ascii_lowercase().contains("stream")
}

/// Flatten a JSON payload into query parameters for GET forwarding.
fn query_pairs(payload: &Value) -> Vec<(String, String)> {
    match payload {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn header_str(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
