//! The `Model` facade — one object, every backend.
//!
//! A `Model` resolves its configuration once, dispatches to a provider
//! adapter once, and then serves chat, stream, embed, and health calls
//! against that adapter. Per-call overrides shadow the resolved config for a
//! single call without touching the stored copy.

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use lcm_core::config::schema::{KEY_BASE_URL, KEY_DEVICE, KEY_HF_TOKEN};
use lcm_core::config::{self, Overrides, ResolvedConfig};
use lcm_core::{HealthStatus, LcmError, Prompt, Result};
use lcm_providers::registry::{self, ProviderKind};
use lcm_providers::traits::{ProviderAdapter, TokenStream};

use crate::blocking::BlockingModel;

// ─────────────────────────────────────────────
// Model
// ─────────────────────────────────────────────

/// Unified entry point for local and cloud language models.
///
/// Cheap to share behind an `Arc`; concurrent calls own independent streams.
pub struct Model {
    config: ResolvedConfig,
    adapter: Arc<dyn ProviderAdapter>,
    /// Runtime for the blocking surface, created on first use.
    runtime: OnceLock<Runtime>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("provider", &self.adapter.display_name())
            .field("model", &self.config.model)
            .finish()
    }
}

impl Model {
    /// Resolve configuration from `./.model`, `~/.model`, and the
    /// environment, then bind the matching adapter.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// The resolved configuration this instance was built with.
    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.adapter.kind()
    }

    pub fn provider_name(&self) -> &str {
        self.adapter.display_name()
    }

    // ── chat / stream ──

    /// Generate a complete reply.
    ///
    /// Equivalent to draining [`Model::stream`] and concatenating the
    /// fragments in order.
    pub async fn chat(&self, prompt: impl Into<Prompt>) -> Result<String> {
        self.chat_with(prompt, &Overrides::new()).await
    }

    pub async fn chat_with(&self, prompt: impl Into<Prompt>, overrides: &Overrides) -> Result<String> {
        let mut stream = self.stream_with(prompt, overrides).await?;
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            reply.push_str(&fragment?);
        }
        Ok(reply)
    }

    /// Start a generation and return its fragments as they arrive.
    ///
    /// Dropping the returned stream closes the backend connection.
    pub async fn stream(&self, prompt: impl Into<Prompt>) -> Result<TokenStream> {
        self.stream_with(prompt, &Overrides::new()).await
    }

    pub async fn stream_with(
        &self,
        prompt: impl Into<Prompt>,
        overrides: &Overrides,
    ) -> Result<TokenStream> {
        let prompt = prompt.into();
        let config = self.call_config(overrides)?;
        debug!(
            provider = self.adapter.display_name(),
            model = %config.model,
            messages = prompt.to_messages().len(),
            "starting generation"
        );
        self.adapter.do_chat(&prompt, &config).await
    }

    // ── embed ──

    /// Embed `text` into a single vector.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_with(text, &Overrides::new()).await
    }

    pub async fn embed_with(&self, text: &str, overrides: &Overrides) -> Result<Vec<f32>> {
        let config = self.call_config(overrides)?;
        let vector = self.adapter.do_embed(text, &config).await?;
        if vector.is_empty() {
            return Err(LcmError::model_unavailable(
                format!("{} returned an empty embedding for {}", self.adapter.display_name(), config.model),
                "Use an embedding-capable model for `embed`.",
            ));
        }
        Ok(vector)
    }

    // ── health / provisioning ──

    /// Probe the backend. Never fails: errors become `reachable: false`.
    pub async fn health(&self) -> HealthStatus {
        match self.adapter.do_health(&self.config).await {
            Ok(status) => status,
            Err(e) => {
                debug!(provider = self.adapter.display_name(), error = %e.message(), "health probe failed");
                HealthStatus::unreachable(e.message())
            }
        }
    }

    /// Make the configured model available now (auto-pull for Ollama).
    pub async fn provision(&self) -> Result<()> {
        self.adapter.provision(&self.config).await
    }

    // ── blocking ──

    /// Synchronous view of this model.
    ///
    /// Drives each call on a small runtime owned by the `Model`. Must not be
    /// used from inside an async context, and a `Model` that has used it must
    /// be dropped outside one.
    pub fn blocking(&self) -> Result<BlockingModel<'_>> {
        Ok(BlockingModel::new(self, self.runtime()?))
    }

    fn runtime(&self) -> Result<&Runtime> {
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime);
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("lcm-blocking")
            .enable_all()
            .build()
            .map_err(|e| {
                LcmError::runtime_unavailable(
                    format!("Failed to start the blocking runtime: {e}"),
                    "Check thread and file-descriptor limits for this process.",
                )
            })?;
        // A racing caller may have won; either runtime is fine.
        let _ = self.runtime.set(runtime);
        self.runtime.get().ok_or_else(|| {
            LcmError::runtime_unavailable(
                "Blocking runtime was not initialised",
                "Retry the call.",
            )
        })
    }

    fn call_config(&self, overrides: &Overrides) -> Result<Cow<'_, ResolvedConfig>> {
        if overrides.is_empty() {
            return Ok(Cow::Borrowed(&self.config));
        }
        for key in ignored_overrides(overrides) {
            warn!(key, "per-call override has no effect; the adapter is already bound");
        }
        self.config.with_overrides(overrides).map(Cow::Owned)
    }
}

/// Keys consumed when the adapter is built.
const ADAPTER_BOUND_KEYS: &[&str] = &[KEY_BASE_URL, KEY_DEVICE, KEY_HF_TOKEN];

/// Per-call overrides that cannot reach an already-bound adapter.
fn ignored_overrides(overrides: &Overrides) -> Vec<&'static str> {
    ADAPTER_BOUND_KEYS
        .iter()
        .copied()
        .filter(|key| overrides.get(key).is_some())
        .collect()
}

// ─────────────────────────────────────────────
// ModelBuilder
// ─────────────────────────────────────────────

/// Builder for [`Model`]. Every setter is optional.
#[derive(Default)]
pub struct ModelBuilder {
    overrides: Overrides,
    project_file: Option<PathBuf>,
    home_file: Option<PathBuf>,
    skip_files: bool,
    environ: Option<HashMap<String, String>>,
    adapter: Option<Arc<dyn ProviderAdapter>>,
}

impl ModelBuilder {
    /// Shorthand for `option("model", name)`.
    pub fn model(self, name: impl ToString) -> Self {
        self.option("model", name)
    }

    /// Constructor-level setting; wins over files and environment.
    pub fn option(mut self, key: impl AsRef<str>, value: impl ToString) -> Self {
        self.overrides.set(key, value);
        self
    }

    pub fn options(mut self, overrides: &Overrides) -> Self {
        for (key, value) in overrides.iter() {
            self.overrides.set(key, value);
        }
        self
    }

    /// Read the project settings from `path` instead of `./.model`.
    pub fn project_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_file = Some(path.into());
        self
    }

    /// Read the user settings from `path` instead of `~/.model`.
    pub fn home_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.home_file = Some(path.into());
        self
    }

    /// Ignore settings files unless set explicitly with
    /// [`project_file`](Self::project_file) / [`home_file`](Self::home_file).
    pub fn no_default_files(mut self) -> Self {
        self.skip_files = true;
        self
    }

    /// Resolve against this environment instead of the process environment.
    pub fn environment(mut self, environ: HashMap<String, String>) -> Self {
        self.environ = Some(environ);
        self
    }

    /// Use `adapter` instead of dispatching on the config.
    pub fn adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Resolve the config and bind the adapter.
    ///
    /// Configuration and credential problems surface here, before any
    /// network traffic.
    pub fn build(self) -> Result<Model> {
        let project = match self.project_file {
            Some(path) => Some(path),
            None if self.skip_files => None,
            None => Some(config::default_project_path()),
        };
        let home = match self.home_file {
            Some(path) => Some(path),
            None if self.skip_files => None,
            None => config::default_home_path(),
        };
        let environ = self.environ.unwrap_or_else(config::process_environment);

        let resolved = config::resolve(
            &self.overrides,
            project.as_deref(),
            home.as_deref(),
            &environ,
        )?;

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => registry::select(&resolved)?,
        };

        info!(
            provider = adapter.display_name(),
            model = %resolved.model,
            runtime = %resolved.runtime,
            "model ready"
        );

        Ok(Model {
            config: resolved,
            adapter,
            runtime: OnceLock::new(),
        })
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use lcm_core::config::SettingSource;
    use lcm_core::{ErrorKind, Message};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Sets the flag when the stream holding it is dropped.
    struct CloseGuard(Arc<AtomicBool>);

    impl Drop for CloseGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct MockAdapter {
        fragments: Vec<&'static str>,
        embedding: Vec<f32>,
        closed: Arc<AtomicBool>,
        seen: Mutex<Vec<ResolvedConfig>>,
        prompts: Mutex<Vec<Prompt>>,
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::LocalDaemon
        }

        fn display_name(&self) -> &str {
            "Mock"
        }

        async fn do_chat(&self, prompt: &Prompt, config: &ResolvedConfig) -> Result<TokenStream> {
            self.seen.lock().unwrap().push(config.clone());
            self.prompts.lock().unwrap().push(prompt.clone());
            let fragments: Vec<String> = self.fragments.iter().map(|s| s.to_string()).collect();
            let guard = CloseGuard(self.closed.clone());
            Ok(Box::pin(async_stream::stream! {
                let _guard = guard;
                for fragment in fragments {
                    yield Ok::<String, LcmError>(fragment);
                }
            }))
        }

        async fn do_embed(&self, _text: &str, config: &ResolvedConfig) -> Result<Vec<f32>> {
            self.seen.lock().unwrap().push(config.clone());
            Ok(self.embedding.clone())
        }

        async fn do_health(&self, _config: &ResolvedConfig) -> Result<HealthStatus> {
            Err(LcmError::runtime_unavailable("mock backend is down", "start it"))
        }
    }

    fn mock(fragments: Vec<&'static str>) -> Arc<MockAdapter> {
        Arc::new(MockAdapter {
            fragments,
            embedding: vec![0.1, 0.2, 0.3],
            ..Default::default()
        })
    }

    fn isolated() -> ModelBuilder {
        Model::builder()
            .no_default_files()
            .environment(HashMap::new())
    }

    fn with_mock(adapter: &Arc<MockAdapter>) -> Model {
        isolated().adapter(adapter.clone()).build().unwrap()
    }

    #[tokio::test]
    async fn test_chat_equals_concatenated_stream() {
        let adapter = mock(vec!["The", " sky", " is", " blue."]);
        let model = with_mock(&adapter);

        let fragments: Vec<String> = model
            .stream("Why is the sky blue?")
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(fragments, vec!["The", " sky", " is", " blue."]);

        let reply = model.chat("Why is the sky blue?").await.unwrap();
        assert_eq!(reply, fragments.concat());
    }

    #[tokio::test]
    async fn test_message_prompt_reaches_adapter() {
        let adapter = mock(vec!["ok"]);
        let model = with_mock(&adapter);
        let messages = vec![Message::system("Be brief."), Message::user("Hi")];

        model.chat(messages.clone()).await.unwrap();
        assert_eq!(adapter.prompts.lock().unwrap()[0], Prompt::Messages(messages));
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_it() {
        let adapter = mock(vec!["a", "b", "c"]);
        let model = with_mock(&adapter);

        let mut stream = model.stream("hi").await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert!(!adapter.closed.load(Ordering::SeqCst));
        drop(stream);
        assert!(adapter.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_overrides_shadow_single_call() {
        let adapter = mock(vec!["x"]);
        let model = with_mock(&adapter);
        let overrides = Overrides::new().with("temperature", 0.2).with("timeout", 5);

        model.chat_with("hi", &overrides).await.unwrap();
        model.chat("hi").await.unwrap();

        let seen = adapter.seen.lock().unwrap();
        assert_eq!(seen[0].extra.get("temperature").map(String::as_str), Some("0.2"));
        assert_eq!(seen[0].timeout, Duration::from_secs(5));
        assert!(seen[1].extra.get("temperature").is_none());
        assert_eq!(seen[1], *model.config());
        assert!(model.config().extra.is_empty());
    }

    #[tokio::test]
    async fn test_provider_switch_per_call_is_config_error() {
        let adapter = mock(vec!["x"]);
        let model = with_mock(&adapter);
        let overrides = Overrides::new().with("provider", "huggingface");

        let err = model.chat_with("hi", &overrides).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(adapter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embed_and_empty_embedding() {
        let adapter = mock(vec![]);
        let model = with_mock(&adapter);
        assert_eq!(model.embed("hello").await.unwrap(), vec![0.1, 0.2, 0.3]);

        let empty = Arc::new(MockAdapter::default());
        let model = with_mock(&empty);
        let err = model.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }

    #[tokio::test]
    async fn test_health_folds_errors() {
        let model = with_mock(&mock(vec![]));
        let status = model.health().await;
        assert!(!status.reachable);
        assert!(!status.model_ready);
        assert!(status.detail.contains("mock backend is down"));
    }

    #[tokio::test]
    async fn test_health_unreachable_ollama() {
        let model = isolated()
            .option("base_url", "http://127.0.0.1:1")
            .option("timeout", 2)
            .build()
            .unwrap();
        assert_eq!(model.provider_kind(), ProviderKind::LocalDaemon);

        let status = model.health().await;
        assert!(!status.reachable);
        assert!(status.detail.contains("127.0.0.1:1"));
    }

    #[test]
    fn test_missing_hf_token_fails_at_build() {
        let err = isolated()
            .option("provider", "huggingface")
            .option("runtime", "cloud")
            .build()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
        assert!(err.to_string().contains("HOW TO FIX"));
    }

    #[test]
    fn test_hf_token_from_environment() {
        let env = HashMap::from([("HF_TOKEN".to_string(), "hf_env".to_string())]);
        let model = Model::builder()
            .no_default_files()
            .environment(env)
            .option("provider", "huggingface")
            .option("runtime", "cloud")
            .build()
            .unwrap();
        assert_eq!(model.provider_kind(), ProviderKind::CloudApi);
        assert_eq!(model.config().hf_token.as_deref(), Some("hf_env"));
    }

    #[test]
    fn test_builder_reads_explicit_files() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project.model");
        let home = dir.path().join("home.model");
        std::fs::write(&project, "model = llama3.2\n").unwrap();
        std::fs::write(&home, "model = mistral\ntimeout = 30\n").unwrap();

        let model = isolated()
            .project_file(&project)
            .home_file(&home)
            .adapter(mock(vec![]))
            .build()
            .unwrap();
        assert_eq!(model.config().model, "llama3.2");
        assert_eq!(model.config().timeout, Duration::from_secs(30));
        assert_eq!(model.config().source_of("model"), SettingSource::ProjectFile);
        assert_eq!(model.config().source_of("timeout"), SettingSource::UserFile);

        let model = isolated()
            .project_file(&project)
            .model("phi3")
            .adapter(mock(vec![]))
            .build()
            .unwrap();
        assert_eq!(model.config().model, "phi3");
    }

    #[test]
    fn test_blocking_matches_async() {
        let adapter = mock(vec!["4", "2"]);
        let model = with_mock(&adapter);

        let expected = {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let reply = rt.block_on(model.chat("answer?")).unwrap();
            let vector = rt.block_on(model.embed("answer")).unwrap();
            (reply, vector)
        };

        let blocking = model.blocking().unwrap();
        assert_eq!(blocking.chat("answer?").unwrap(), expected.0);
        assert_eq!(blocking.embed("answer").unwrap(), expected.1);

        let fragments: Vec<String> = blocking
            .stream("answer?")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(fragments, vec!["4", "2"]);
        assert!(!blocking.health().reachable);
    }

    #[test]
    fn test_blocking_stream_drop_releases_it() {
        let adapter = mock(vec!["a", "b"]);
        let model = with_mock(&adapter);
        let blocking = model.blocking().unwrap();

        let mut stream = blocking.stream("hi").unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), "a");
        drop(stream);
        assert!(adapter.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_end_to_end_against_ollama() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "models": [{ "name": "qwen2.5:7b" }] })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(concat!(
                "{\"message\":{\"role\":\"assistant\",\"content\":\"Hel\"},\"done\":false}\n",
                "{\"message\":{\"role\":\"assistant\",\"content\":\"lo\"},\"done\":false}\n",
                "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}\n",
            )))
            .mount(&server)
            .await;

        let model = isolated().option("base_url", server.uri()).build().unwrap();
        assert_eq!(model.chat("hi").await.unwrap(), "Hello");
        assert!(model.health().await.is_healthy());
    }

    #[test]
    fn test_adapter_bound_overrides_are_reported() {
        let overrides: Overrides = [("hf_token", "hf_other"), ("temperature", "0.2")]
            .into_iter()
            .collect();
        assert_eq!(ignored_overrides(&overrides), vec!["hf_token"]);

        let overrides: Overrides = [("base_url", "http://elsewhere"), ("device", "cpu")]
            .into_iter()
            .collect();
        assert_eq!(ignored_overrides(&overrides), vec!["base_url", "device"]);

        assert!(ignored_overrides(&Overrides::default()).is_empty());
    }
}
