//! Shared HTTP transport for the adapters.
//!
//! [`Backend`] wraps a `reqwest::Client` together with the base URL and the
//! remediation hint used when the backend can't be reached. It provides
//! timeout-bounded sends (with one retry on connection failure), status
//! translation into the error taxonomy, and line framing for NDJSON and SSE
//! bodies.

use std::time::Duration;

use async_stream::try_stream;
use futures_core::Stream;
use futures_util::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use lcm_core::utils::{join_url, truncate_string};
use lcm_core::{LcmError, Result};

/// Longest backend error body quoted in an error message.
const MAX_ERROR_BODY: usize = 300;

/// Attempts per request: the first try plus one retry on connection failure.
const MAX_ATTEMPTS: u32 = 2;

/// Pause before retrying a refused connection.
const RETRY_DELAY: Duration = Duration::from_millis(250);

/// Build the per-adapter HTTP client.
pub fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| {
            LcmError::runtime_unavailable(
                format!("Failed to initialise HTTP client: {e}"),
                "Check the system TLS configuration.",
            )
        })
}

/// One backend endpoint: client, base URL, and how to tell the user to fix
/// connectivity problems.
#[derive(Clone, Debug)]
pub struct Backend {
    pub client: reqwest::Client,
    pub name: &'static str,
    pub base_url: String,
    pub unreachable_fix: &'static str,
}

impl Backend {
    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn unreachable(&self, cause: impl std::fmt::Display) -> LcmError {
        LcmError::runtime_unavailable(
            format!("Could not connect to {} at {}: {cause}", self.name, self.base_url),
            self.unreachable_fix,
        )
    }

    pub fn timed_out(&self, timeout: Duration) -> LcmError {
        LcmError::runtime_unavailable(
            format!(
                "{} at {} did not respond within {}s",
                self.name,
                self.base_url,
                timeout.as_secs()
            ),
            format!(
                "Raise `timeout` in your .model file (or per call), or check that {} is not overloaded.",
                self.name
            ),
        )
    }

    /// Send a request built by `build`, bounded by `timeout`.
    ///
    /// Connection failures are retried once; timeouts are not.
    pub async fn send(
        &self,
        build: impl Fn() -> RequestBuilder,
        timeout: Duration,
    ) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match tokio::time::timeout(timeout, build().send()).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(e)) if e.is_connect() && attempt < MAX_ATTEMPTS => {
                    warn!(backend = self.name, error = %e, attempt, "connection failed, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Ok(Err(e)) if e.is_timeout() => return Err(self.timed_out(timeout)),
                Ok(Err(e)) => return Err(self.unreachable(e)),
                Err(_) => return Err(self.timed_out(timeout)),
            }
        }
    }

    /// Read and decode a JSON body, bounded by `timeout`.
    ///
    /// `send` returns once headers arrive; the body still needs its own bound.
    pub async fn read_json<T: DeserializeOwned>(
        &self,
        response: Response,
        timeout: Duration,
        what: &str,
    ) -> Result<T> {
        tokio::time::timeout(timeout, response.json::<T>())
            .await
            .map_err(|_| self.timed_out(timeout))?
            .map_err(|e| self.unreachable(format!("invalid {what} response: {e}")))
    }

    /// Pass successful responses through; translate the rest.
    ///
    /// 401/403 → auth, 404 → model unavailable, anything else → runtime
    /// unavailable with the body text. Reading the error body is bounded by
    /// `timeout`; a stalled body is reported without its text.
    pub async fn check_status(
        &self,
        response: Response,
        model: &str,
        timeout: Duration,
    ) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = match tokio::time::timeout(timeout, response.text()).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => "Failed to read error body".to_string(),
            Err(_) => format!("error body not received within {}s", timeout.as_secs()),
        };
        debug!(backend = self.name, status = %status, body = %body, "backend error");
        let body = truncate_string(body.trim(), MAX_ERROR_BODY);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LcmError::auth(
                format!("{} rejected the credentials for model {model} ({status})", self.name),
                "Provide a valid HF_TOKEN in your .model file or environment.",
            ),
            StatusCode::NOT_FOUND => LcmError::model_unavailable(
                format!("Model {model} was not found on {} ({})", self.name, body),
                "Check the model name, or pull/download it first.",
            ),
            StatusCode::SERVICE_UNAVAILABLE => LcmError::runtime_unavailable(
                format!("{} is temporarily unavailable for {model}: {}", self.name, body),
                "The model may still be loading; retry in a few seconds.",
            ),
            _ => LcmError::runtime_unavailable(
                format!("{} returned {status}: {}", self.name, body),
                self.unreachable_fix,
            ),
        })
    }
}

/// Split a response body into non-empty, trimmed lines.
///
/// Each chunk read is bounded by `timeout`. Lines split across chunks are
/// reassembled.
pub fn lines(
    response: Response,
    timeout: Duration,
    backend: Backend,
) -> impl Stream<Item = Result<String>> + Send {
    try_stream! {
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let next = tokio::time::timeout(timeout, body.next())
                .await
                .map_err(|_| backend.timed_out(timeout))?;
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| backend.unreachable(e))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if !text.is_empty() {
                    yield text;
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
        if !rest.is_empty() {
            yield rest;
        }
    }
}

/// Payload of an SSE `data:` line, or `None` for other lines and `[DONE]`.
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        None
    } else {
        Some(data)
    }
}

/// Convert a raw option string into the JSON value a backend expects.
pub fn option_value(raw: &str) -> serde_json::Value {
    if let Ok(n) = raw.parse::<i64>() {
        return n.into();
    }
    if let Ok(f) = raw.parse::<f64>() {
        return f.into();
    }
    match raw {
        "true" => true.into(),
        "false" => false.into(),
        _ => raw.into(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Start a server that answers every request with `status_line` headers
    /// announcing a 1000-byte JSON body, sends one byte of it, then stalls.
    ///
    /// Returns the base URL.
    pub async fn stalled_server(status_line: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 8192];
                    let _ = socket.read(&mut request).await;
                    let head = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: 1000\r\n\r\n{{"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    tokio::time::sleep(Duration::from_secs(120)).await;
                });
            }
        });
        format!("http://{addr}")
    }
}
