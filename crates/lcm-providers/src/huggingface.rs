//! Hugging Face adapters — hosted Inference API and a local
//! text-generation-inference (TGI) compatible server.
//!
//! Both speak the same streaming shape: Server-Sent Events whose `data:`
//! payload carries `{"token": {"text": ..., "special": ...}}`. Special tokens
//! (end-of-sequence markers) are dropped.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use lcm_core::config::{Device, ResolvedConfig};
use lcm_core::{HealthStatus, LcmError, Prompt, Result};

use crate::http::{self, build_client, option_value, Backend};
use crate::registry::ProviderKind;
use crate::traits::{ProviderAdapter, TokenStream};

/// Upper bound for health probes, whatever the configured timeout.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────

/// One SSE `data:` payload from `generate_stream`.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    token: Option<StreamToken>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamToken {
    #[serde(default)]
    text: String,
    #[serde(default)]
    special: bool,
}

/// Non-streaming text-generation output.
#[derive(Debug, Deserialize)]
struct Generated {
    #[serde(default)]
    generated_text: String,
}

#[derive(Debug, Deserialize)]
struct ServerInfo {
    model_id: Option<String>,
}

// ─────────────────────────────────────────────
// Shared helpers
// ─────────────────────────────────────────────

/// Parameters in TGI naming (`max_tokens` → `max_new_tokens`).
fn hf_parameters(config: &ResolvedConfig) -> Map<String, Value> {
    let mut params = Map::new();
    for (key, raw) in config.generation_options() {
        match key {
            "max_tokens" => params.insert("max_new_tokens".into(), option_value(raw)),
            "repeat_penalty" => params.insert("repetition_penalty".into(), option_value(raw)),
            "stop" => params.insert("stop".into(), json!([raw])),
            _ => params.insert(key.into(), option_value(raw)),
        };
    }
    params
}

/// Turn a generation response into fragments.
///
/// `text/event-stream` bodies are streamed token by token; a plain JSON body
/// (backends that ignore `stream`) becomes a single fragment.
async fn generation_stream(
    response: Response,
    config: &ResolvedConfig,
    backend: &Backend,
) -> Result<TokenStream> {
    let is_sse = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));

    if !is_sse {
        let body: Value = backend
            .read_json(response, config.timeout, "generation")
            .await?;
        let text = generated_text(body);
        let stream = async_stream::stream! {
            if !text.is_empty() {
                yield Ok::<String, LcmError>(text);
            }
        };
        return Ok(Box::pin(stream));
    }

    let lines = http::lines(response, config.timeout, backend.clone());
    let model = config.hf_model_id().to_string();
    let name = backend.name;
    let stream = try_stream! {
        futures_util::pin_mut!(lines);
        while let Some(line) = lines.next().await {
            let line = line?;
            let Some(data) = http::sse_data(&line) else { continue };
            let event = match serde_json::from_str::<StreamEvent>(data) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, data = %data, "skipping unparseable SSE event");
                    continue;
                }
            };
            if let Some(error) = event.error {
                Err::<(), LcmError>(LcmError::runtime_unavailable(
                    format!("{name} failed while generating with {model}: {error}"),
                    "Retry the request; if it keeps failing, check the model's status page.",
                ))?;
            }
            if let Some(token) = event.token {
                if !token.special && !token.text.is_empty() {
                    yield token.text;
                }
            }
        }
    };
    Ok(Box::pin(stream))
}

/// `[{"generated_text": ...}]` or `{"generated_text": ...}`.
fn generated_text(body: Value) -> String {
    let first = match body {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    serde_json::from_value::<Generated>(first)
        .map(|g| g.generated_text)
        .unwrap_or_default()
}

/// Accept `[f]`, `[[f]]` (one row), or `[[f], [f], …]` (token rows, mean-pooled).
fn parse_embedding(body: Value) -> Option<Vec<f32>> {
    if let Ok(flat) = serde_json::from_value::<Vec<f32>>(body.clone()) {
        return Some(flat);
    }
    let mut rows = serde_json::from_value::<Vec<Vec<f32>>>(body).ok()?;
    match rows.len() {
        0 => None,
        1 => rows.pop(),
        n => {
            let dim = rows[0].len();
            if rows.iter().any(|r| r.len() != dim) {
                return None;
            }
            let mut pooled = vec![0.0f32; dim];
            for row in &rows {
                for (acc, v) in pooled.iter_mut().zip(row) {
                    *acc += v;
                }
            }
            pooled.iter_mut().for_each(|v| *v /= n as f32);
            Some(pooled)
        }
    }
}

async fn read_embedding(
    response: Response,
    config: &ResolvedConfig,
    backend: &Backend,
) -> Result<Vec<f32>> {
    let body: Value = backend
        .read_json(response, config.timeout, "embedding")
        .await?;

    match parse_embedding(body) {
        Some(vector) if !vector.is_empty() => Ok(vector),
        _ => Err(LcmError::model_unavailable(
            format!("Model {} returned no usable embedding", config.hf_model_id()),
            "Use a feature-extraction (embedding) model, e.g. `hf_model = sentence-transformers/all-MiniLM-L6-v2`.",
        )),
    }
}

// ─────────────────────────────────────────────
// HfCloudAdapter
// ─────────────────────────────────────────────

/// Adapter for the hosted Hugging Face Inference API.
pub struct HfCloudAdapter {
    backend: Backend,
    token: String,
}

impl std::fmt::Debug for HfCloudAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfCloudAdapter")
            .field("base_url", &self.backend.base_url)
            .finish()
    }
}

impl HfCloudAdapter {
    /// Build from config. Fails with an auth error when no token is set.
    pub fn new(config: &ResolvedConfig, base_url: &str) -> Result<Self> {
        let token = config.hf_token.clone().ok_or_else(|| {
            LcmError::auth(
                "Hugging Face cloud runtime needs an API token",
                "Set `hf_token = ${HF_TOKEN}` in your .model file and export HF_TOKEN.",
            )
        })?;
        let spec = ProviderKind::CloudApi.spec();
        Ok(Self {
            backend: Backend {
                client: build_client(config.timeout)?,
                name: spec.display_name,
                base_url: base_url.to_string(),
                unreachable_fix: spec.unreachable_fix,
            },
            token,
        })
    }

    fn model_url(&self, config: &ResolvedConfig) -> String {
        self.backend
            .url(&format!("models/{}", config.hf_model_id()))
    }

    fn post(&self, url: &str, body: &Value) -> RequestBuilder {
        self.backend
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
    }
}

#[async_trait]
impl ProviderAdapter for HfCloudAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudApi
    }

    fn display_name(&self) -> &str {
        self.backend.name
    }

    async fn do_chat(&self, prompt: &Prompt, config: &ResolvedConfig) -> Result<TokenStream> {
        let url = self.model_url(config);
        let mut parameters = hf_parameters(config);
        parameters.insert("stream".into(), Value::Bool(true));
        let body = json!({
            "inputs": prompt.last_text(),
            "parameters": parameters,
            "options": { "wait_for_model": true },
        });
        debug!(provider = self.backend.name, model = config.hf_model_id(), "Calling HF inference");

        let response = self
            .backend
            .send(|| self.post(&url, &body), config.timeout)
            .await?;
        let response = self
            .backend
            .check_status(response, config.hf_model_id(), config.timeout)
            .await?;
        generation_stream(response, config, &self.backend).await
    }

    async fn do_embed(&self, text: &str, config: &ResolvedConfig) -> Result<Vec<f32>> {
        let url = self.model_url(config);
        let body = json!({ "inputs": text, "options": { "wait_for_model": true } });
        let response = self
            .backend
            .send(|| self.post(&url, &body), config.timeout)
            .await?;
        let response = self
            .backend
            .check_status(response, config.hf_model_id(), config.timeout)
            .await?;
        read_embedding(response, config, &self.backend).await
    }

    async fn do_health(&self, config: &ResolvedConfig) -> Result<HealthStatus> {
        let url = self.model_url(config);
        let model = config.hf_model_id();
        let response = self
            .backend
            .send(
                || self.backend.client.get(&url).bearer_auth(&self.token),
                config.timeout.min(HEALTH_TIMEOUT),
            )
            .await?;

        let status = response.status();
        Ok(match status.as_u16() {
            200..=299 => HealthStatus::ready(format!("model {model} is served by the Inference API")),
            401 | 403 => HealthStatus::model_missing(format!("token rejected for model {model} ({status})")),
            404 => HealthStatus::model_missing(format!("model {model} not found on the Inference API")),
            503 => HealthStatus::model_missing(format!("model {model} is loading")),
            _ => HealthStatus::model_missing(format!("unexpected status {status} for model {model}")),
        })
    }
}

// ─────────────────────────────────────────────
// HfLocalAdapter
// ─────────────────────────────────────────────

/// Adapter for a locally running TGI-compatible server.
pub struct HfLocalAdapter {
    backend: Backend,
    device: Device,
}

impl std::fmt::Debug for HfLocalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfLocalAdapter")
            .field("base_url", &self.backend.base_url)
            .field("device", &self.device)
            .finish()
    }
}

impl HfLocalAdapter {
    /// `device` should already be resolved (not `Auto`).
    pub fn new(base_url: &str, device: Device, connect_timeout: Duration) -> Result<Self> {
        let spec = ProviderKind::LocalRuntime.spec();
        Ok(Self {
            backend: Backend {
                client: build_client(connect_timeout)?,
                name: spec.display_name,
                base_url: base_url.to_string(),
                unreachable_fix: spec.unreachable_fix,
            },
            device,
        })
    }

    pub fn device(&self) -> Device {
        self.device
    }
}

#[async_trait]
impl ProviderAdapter for HfLocalAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalRuntime
    }

    fn display_name(&self) -> &str {
        self.backend.name
    }

    async fn do_chat(&self, prompt: &Prompt, config: &ResolvedConfig) -> Result<TokenStream> {
        let b = &self.backend;
        let body = json!({
            "inputs": prompt.last_text(),
            "parameters": hf_parameters(config),
        });
        debug!(
            provider = b.name,
            model = config.hf_model_id(),
            device = %self.device,
            "Calling local runtime"
        );

        let response = b
            .send(
                || b.client.post(b.url("/generate_stream")).json(&body),
                config.timeout,
            )
            .await?;
        let response = b.check_status(response, config.hf_model_id(), config.timeout).await?;
        generation_stream(response, config, b).await
    }

    async fn do_embed(&self, text: &str, config: &ResolvedConfig) -> Result<Vec<f32>> {
        let b = &self.backend;
        let body = json!({ "inputs": text });
        let response = b
            .send(|| b.client.post(b.url("/embed")).json(&body), config.timeout)
            .await?;
        let response = b.check_status(response, config.hf_model_id(), config.timeout).await?;
        read_embedding(response, config, b).await
    }

    async fn do_health(&self, config: &ResolvedConfig) -> Result<HealthStatus> {
        let b = &self.backend;
        let timeout = config.timeout.min(HEALTH_TIMEOUT);
        let response = b.send(|| b.client.get(b.url("/health")), timeout).await?;
        if !response.status().is_success() {
            return Ok(HealthStatus::model_missing(format!(
                "runtime at {} is up but not ready ({}) on device {}",
                b.base_url,
                response.status(),
                self.device
            )));
        }

        // `/info` is optional; a server without it still counts as ready.
        let served = match b.send(|| b.client.get(b.url("/info")), timeout).await {
            Ok(resp) if resp.status().is_success() => b
                .read_json::<ServerInfo>(resp, timeout, "/info")
                .await
                .ok()
                .and_then(|info| info.model_id),
            _ => None,
        };

        let wanted = config.hf_model_id();
        Ok(match served {
            Some(served) if served != wanted => HealthStatus::model_missing(format!(
                "runtime serves {served}, not {wanted} (device {})",
                self.device
            )),
            _ => HealthStatus::ready(format!("model {wanted} ready on device {}", self.device)),
        })
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lcm_core::config::Overrides;
    use lcm_core::ErrorKind;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(pairs: &[(&str, &str)]) -> ResolvedConfig {
        let overrides: Overrides = pairs.iter().copied().collect();
        lcm_core::config::resolve(&overrides, None, None, &Default::default()).unwrap()
    }

    fn cloud_config(extra: &[(&str, &str)]) -> ResolvedConfig {
        let mut pairs = vec![
            ("provider", "huggingface"),
            ("runtime", "cloud"),
            ("hf_token", "hf_test"),
            ("hf_model", "gpt2"),
        ];
        pairs.extend_from_slice(extra);
        config(&pairs)
    }

    fn sse(events: &[Value]) -> String {
        events
            .iter()
            .map(|e| format!("data:{e}\n\n"))
            .collect::<String>()
    }

    async fn collect(stream: TokenStream) -> Vec<String> {
        stream.map(|t| t.unwrap()).collect().await
    }

    #[test]
    fn test_parse_embedding_shapes() {
        assert_eq!(parse_embedding(json!([0.5, 1.0])), Some(vec![0.5, 1.0]));
        assert_eq!(parse_embedding(json!([[0.5, 1.0]])), Some(vec![0.5, 1.0]));
        assert_eq!(
            parse_embedding(json!([[1.0, 2.0], [3.0, 4.0]])),
            Some(vec![2.0, 3.0])
        );
        assert_eq!(parse_embedding(json!([[1.0], [1.0, 2.0]])), None);
        assert_eq!(parse_embedding(json!({"error": "x"})), None);
    }

    #[test]
    fn test_generated_text_shapes() {
        assert_eq!(generated_text(json!([{ "generated_text": "hi" }])), "hi");
        assert_eq!(generated_text(json!({ "generated_text": "yo" })), "yo");
        assert_eq!(generated_text(json!([])), "");
    }

    #[test]
    fn test_hf_parameters_renames() {
        let cfg = config(&[("max_tokens", "32"), ("repeat_penalty", "1.1")]);
        let params = hf_parameters(&cfg);
        assert_eq!(params["max_new_tokens"], json!(32));
        assert_eq!(params["repetition_penalty"], json!(1.1));
    }

    #[test]
    fn test_cloud_requires_token() {
        let cfg = config(&[("provider", "huggingface"), ("runtime", "cloud")]);
        let err = HfCloudAdapter::new(&cfg, "http://unused").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_cloud_stream_skips_special_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gpt2"))
            .and(header("Authorization", "Bearer hf_test"))
            .and(body_partial_json(json!({ "inputs": "Once", "parameters": { "stream": true } })))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    sse(&[
                        json!({ "token": { "text": " upon", "special": false } }),
                        json!({ "token": { "text": " a time", "special": false } }),
                        json!({ "token": { "text": "</s>", "special": true }, "generated_text": " upon a time" }),
                    ]),
                    "text/event-stream",
                ),
            )
            .mount(&server)
            .await;

        let cfg = cloud_config(&[]);
        let adapter = HfCloudAdapter::new(&cfg, &server.uri()).unwrap();
        let stream = adapter.do_chat(&Prompt::from("Once"), &cfg).await.unwrap();
        assert_eq!(collect(stream).await, vec![" upon", " a time"]);
    }

    #[tokio::test]
    async fn test_cloud_json_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gpt2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{ "generated_text": "whole answer" }])),
            )
            .mount(&server)
            .await;

        let cfg = cloud_config(&[]);
        let adapter = HfCloudAdapter::new(&cfg, &server.uri()).unwrap();
        let stream = adapter.do_chat(&Prompt::from("Q"), &cfg).await.unwrap();
        assert_eq!(collect(stream).await, vec!["whole answer"]);
    }

    #[tokio::test]
    async fn test_cloud_401_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gpt2"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid token" })))
            .mount(&server)
            .await;

        let cfg = cloud_config(&[]);
        let adapter = HfCloudAdapter::new(&cfg, &server.uri()).unwrap();
        let err = adapter
            .do_chat(&Prompt::from("Q"), &cfg)
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.fix().contains("HF_TOKEN"));
    }

    #[tokio::test]
    async fn test_cloud_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/sentence-transformers/all-MiniLM-L6-v2"))
            .and(body_partial_json(json!({ "inputs": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([0.25, -0.5, 0.75])))
            .mount(&server)
            .await;

        let cfg = cloud_config(&[("hf_model", "sentence-transformers/all-MiniLM-L6-v2")]);
        let adapter = HfCloudAdapter::new(&cfg, &server.uri()).unwrap();
        let vector = adapter.do_embed("hello", &cfg).await.unwrap();
        assert_eq!(vector, vec![0.25, -0.5, 0.75]);
    }

    #[tokio::test]
    async fn test_cloud_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models/gpt2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "loaded": true })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/models/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cfg = cloud_config(&[]);
        let adapter = HfCloudAdapter::new(&cfg, &server.uri()).unwrap();
        assert!(adapter.do_health(&cfg).await.unwrap().is_healthy());

        let missing = cloud_config(&[("hf_model", "missing")]);
        let health = adapter.do_health(&missing).await.unwrap();
        assert!(health.reachable);
        assert!(!health.model_ready);
    }

    #[tokio::test]
    async fn test_local_runtime_stream_and_embed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/generate_stream"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    sse(&[
                        json!({ "token": { "text": "4", "special": false } }),
                        json!({ "token": { "text": "<|im_end|>", "special": true } }),
                    ]),
                    "text/event-stream",
                ),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([[0.1, 0.2]])))
            .mount(&server)
            .await;

        let cfg = config(&[("provider", "huggingface"), ("runtime", "local")]);
        let adapter = HfLocalAdapter::new(&server.uri(), Device::Cpu, Duration::from_secs(5)).unwrap();
        let stream = adapter.do_chat(&Prompt::from("2+2?"), &cfg).await.unwrap();
        assert_eq!(collect(stream).await, vec!["4"]);
        assert_eq!(adapter.do_embed("x", &cfg).await.unwrap(), vec![0.1, 0.2]);
    }

    #[tokio::test]
    async fn test_local_runtime_health_reports_device_and_model() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/info"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "model_id": "Qwen/Qwen2.5-0.5B" })),
            )
            .mount(&server)
            .await;

        let adapter =
            HfLocalAdapter::new(&server.uri(), Device::Cuda(0), Duration::from_secs(5)).unwrap();

        let cfg = config(&[
            ("provider", "huggingface"),
            ("hf_model", "Qwen/Qwen2.5-0.5B"),
        ]);
        let health = adapter.do_health(&cfg).await.unwrap();
        assert!(health.is_healthy());
        assert!(health.detail.contains("cuda"));

        let other = config(&[("provider", "huggingface"), ("hf_model", "gpt2")]);
        let health = adapter.do_health(&other).await.unwrap();
        assert!(health.reachable);
        assert!(!health.model_ready);
        assert!(health.detail.contains("Qwen/Qwen2.5-0.5B"));
    }

    #[tokio::test]
    async fn test_local_runtime_health_with_stalled_info_is_ready() {
        let base = crate::http::testing::stalled_server("200 OK").await;
        let adapter = HfLocalAdapter::new(&base, Device::Cpu, Duration::from_secs(5)).unwrap();
        let cfg = config(&[("provider", "huggingface"), ("runtime", "local"), ("timeout", "1")]);

        let health = tokio::time::timeout(Duration::from_secs(10), adapter.do_health(&cfg))
            .await
            .expect("health check hung on the /info body")
            .unwrap();
        assert!(health.is_healthy());
    }
}
