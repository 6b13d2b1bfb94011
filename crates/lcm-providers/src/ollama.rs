//! Ollama adapter — the local-daemon backend.
//!
//! Talks to `/api/chat` (NDJSON stream), `/api/embeddings`, `/api/tags`, and
//! `/api/pull`. Before the first generation for a model the adapter checks
//! `/api/tags` and pulls the model if it is missing; the pull is bounded by
//! the configured timeout and its last status is reported by health checks.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use lcm_core::config::ResolvedConfig;
use lcm_core::{HealthStatus, LcmError, Prompt, Result};

use crate::http::{self, build_client, option_value, Backend};
use crate::registry::ProviderKind;
use crate::traits::{ProviderAdapter, TokenStream};

// ─────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
}

/// One NDJSON line from `/api/chat`.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// One NDJSON line from `/api/pull`.
#[derive(Debug, Deserialize)]
struct PullLine {
    status: Option<String>,
    total: Option<u64>,
    completed: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

/// Last observed auto-pull outcome for one model.
#[derive(Clone, Debug, PartialEq, Eq)]
struct PullRecord {
    model: String,
    status: String,
}

// ─────────────────────────────────────────────
// OllamaAdapter
// ─────────────────────────────────────────────

/// Adapter for a local Ollama daemon.
pub struct OllamaAdapter {
    backend: Backend,
    /// Models confirmed present (or pulled) during this adapter's lifetime.
    provisioned: tokio::sync::Mutex<HashSet<String>>,
    last_pull: Mutex<Option<PullRecord>>,
}

impl std::fmt::Debug for OllamaAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaAdapter")
            .field("base_url", &self.backend.base_url)
            .finish()
    }
}

impl OllamaAdapter {
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self> {
        let spec = ProviderKind::LocalDaemon.spec();
        Ok(Self {
            backend: Backend {
                client: build_client(connect_timeout)?,
                name: spec.display_name,
                base_url: base_url.to_string(),
                unreachable_fix: spec.unreachable_fix,
            },
            provisioned: tokio::sync::Mutex::new(HashSet::new()),
            last_pull: Mutex::new(None),
        })
    }

    /// Names of the models the daemon has locally.
    async fn list_models(&self, timeout: Duration) -> Result<Vec<String>> {
        let b = &self.backend;
        let response = b.send(|| b.client.get(b.url("/api/tags")), timeout).await?;
        let response = b.check_status(response, "(tags)", timeout).await?;
        let tags: TagsResponse = b.read_json(response, timeout, "/api/tags").await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pull `model`, following progress until the daemon reports success.
    async fn pull(&self, model: &str, timeout: Duration) -> Result<()> {
        let b = &self.backend;
        info!(model, "Model not found locally, pulling");
        self.record_pull(model, "pulling");

        let response = b
            .send(
                || {
                    b.client
                        .post(b.url("/api/pull"))
                        .json(&json!({ "name": model, "stream": true }))
                },
                timeout,
            )
            .await?;
        let response = b.check_status(response, model, timeout).await?;

        let progress = http::lines(response, timeout, b.clone());
        futures_util::pin_mut!(progress);
        while let Some(line) = progress.next().await {
            let line = line?;
            let Ok(update) = serde_json::from_str::<PullLine>(&line) else {
                warn!(line = %line, "unparseable pull progress line");
                continue;
            };
            if let Some(error) = update.error {
                self.record_pull(model, &format!("failed: {error}"));
                return Err(LcmError::model_unavailable(
                    format!("Pulling model {model} failed: {error}"),
                    format!("Check the model name, or run `ollama pull {model}` manually."),
                ));
            }
            if let Some(status) = update.status {
                match (update.completed, update.total) {
                    (Some(done), Some(total)) if total > 0 => {
                        debug!(model, status = %status, percent = done * 100 / total, "pull progress")
                    }
                    _ => debug!(model, status = %status, "pull progress"),
                }
                self.record_pull(model, &status);
                if status == "success" {
                    info!(model, "Model pulled");
                    return Ok(());
                }
            }
        }

        self.record_pull(model, "failed: stream ended before success");
        Err(LcmError::model_unavailable(
            format!("Pulling model {model} ended without success"),
            format!("Run `ollama pull {model}` manually and check its output."),
        ))
    }

    fn record_pull(&self, model: &str, status: &str) {
        if let Ok(mut last) = self.last_pull.lock() {
            *last = Some(PullRecord {
                model: model.to_string(),
                status: status.to_string(),
            });
        }
    }

    fn last_pull_status(&self, model: &str) -> Option<String> {
        self.last_pull
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .filter(|record| record.model == model)
            .map(|record| record.status)
    }

    fn chat_body(prompt: &Prompt, config: &ResolvedConfig) -> Value {
        json!({
            "model": config.model,
            "messages": prompt.to_messages(),
            "stream": true,
            "options": ollama_options(config),
        })
    }
}

/// Generation options in Ollama's naming (`max_tokens` → `num_predict`).
fn ollama_options(config: &ResolvedConfig) -> Value {
    let mut options = Map::new();
    for (key, raw) in config.generation_options() {
        match key {
            "max_tokens" => options.insert("num_predict".into(), option_value(raw)),
            "stop" => options.insert("stop".into(), json!([raw])),
            _ => options.insert(key.into(), option_value(raw)),
        };
    }
    Value::Object(options)
}

/// Whether a `/api/tags` name refers to `model`.
///
/// An untagged name means `:latest`, so `llama3` matches `llama3:latest` but
/// not `llama3:8b`.
fn model_matches(listed: &str, model: &str) -> bool {
    listed == model
        || (!model.contains(':') && listed.strip_suffix(":latest") == Some(model))
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::LocalDaemon
    }

    fn display_name(&self) -> &str {
        self.backend.name
    }

    async fn provision(&self, config: &ResolvedConfig) -> Result<()> {
        let model = config.model.as_str();
        let mut provisioned = self.provisioned.lock().await;
        if provisioned.contains(model) {
            return Ok(());
        }

        let available = self.list_models(config.timeout).await?;
        if !available.iter().any(|name| model_matches(name, model)) {
            match tokio::time::timeout(config.timeout, self.pull(model, config.timeout)).await {
                Ok(result) => result?,
                Err(_) => {
                    self.record_pull(model, "failed: timed out");
                    return Err(LcmError::model_unavailable(
                        format!(
                            "Pulling model {model} did not finish within {}s",
                            config.timeout.as_secs()
                        ),
                        format!(
                            "Run `ollama pull {model}` manually, or raise `timeout` in your .model file."
                        ),
                    ));
                }
            }
        }

        provisioned.insert(model.to_string());
        Ok(())
    }

    async fn do_chat(&self, prompt: &Prompt, config: &ResolvedConfig) -> Result<TokenStream> {
        self.provision(config).await?;

        let b = &self.backend;
        let body = Self::chat_body(prompt, config);
        debug!(
            provider = b.name,
            model = %config.model,
            messages = prompt.to_messages().len(),
            "Calling Ollama chat"
        );

        let response = b
            .send(|| b.client.post(b.url("/api/chat")).json(&body), config.timeout)
            .await?;
        let response = b.check_status(response, &config.model, config.timeout).await?;

        let lines = http::lines(response, config.timeout, b.clone());
        let model = config.model.clone();
        let stream = try_stream! {
            futures_util::pin_mut!(lines);
            while let Some(line) = lines.next().await {
                let line = line?;
                let chunk = match serde_json::from_str::<ChatChunk>(&line) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, line = %line, "skipping unparseable chat line");
                        continue;
                    }
                };
                if let Some(error) = chunk.error {
                    Err::<(), LcmError>(LcmError::runtime_unavailable(
                        format!("Ollama failed while generating with {model}: {error}"),
                        "Check `ollama serve` logs; the model may have run out of memory.",
                    ))?;
                }
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        yield message.content;
                    }
                }
                if chunk.done {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn do_embed(&self, text: &str, config: &ResolvedConfig) -> Result<Vec<f32>> {
        self.provision(config).await?;

        let b = &self.backend;
        let body = json!({ "model": config.model, "prompt": text });
        let response = b
            .send(
                || b.client.post(b.url("/api/embeddings")).json(&body),
                config.timeout,
            )
            .await?;
        let response = b.check_status(response, &config.model, config.timeout).await?;
        let parsed: EmbeddingResponse = b
            .read_json(response, config.timeout, "/api/embeddings")
            .await?;

        if parsed.embedding.is_empty() {
            return Err(LcmError::model_unavailable(
                format!("Model {} returned no embedding", config.model),
                "Use an embedding-capable model, e.g. `model = nomic-embed-text`.",
            ));
        }
        Ok(parsed.embedding)
    }

    async fn do_health(&self, config: &ResolvedConfig) -> Result<HealthStatus> {
        let model = config.model.as_str();
        let available = self.list_models(config.timeout).await?;

        if available.iter().any(|name| model_matches(name, model)) {
            return Ok(HealthStatus::ready(format!(
                "Ollama at {} has model {model}",
                self.backend.base_url
            )));
        }

        let detail = match self.last_pull_status(model) {
            Some(status) => format!("model {model} not available (last pull: {status})"),
            None => format!("model {model} not pulled yet; it will be pulled on first use"),
        };
        Ok(HealthStatus::model_missing(detail))
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
