//! Provider registry — static specs for every backend variant plus dispatch.
//!
//! Dispatch is a pure function of [`ResolvedConfig`]: the same config always
//! yields the same [`ProviderKind`]. Missing credentials fail here, before any
//! network call is attempted.

use std::sync::Arc;

use tracing::debug;

use lcm_core::config::schema::{KEY_DEVICE, KEY_HF_TOKEN};
use lcm_core::config::{AcceleratorProbe, ProviderId, ResolvedConfig, RuntimeKind};
use lcm_core::{LcmError, Result};

use crate::huggingface::{HfCloudAdapter, HfLocalAdapter};
use crate::ollama::OllamaAdapter;
use crate::traits::ProviderAdapter;

// ─────────────────────────────────────────────
// ProviderKind — closed set of adapter variants
// ─────────────────────────────────────────────

/// The adapter variant a configuration dispatches to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// A daemon on the caller's machine (Ollama), which may proxy to cloud.
    LocalDaemon,
    /// A hosted inference API (Hugging Face).
    CloudApi,
    /// A locally running model server (Hugging Face TGI-compatible).
    LocalRuntime,
}

impl ProviderKind {
    /// Static spec for this variant.
    pub fn spec(&self) -> &'static ProviderSpec {
        match self {
            ProviderKind::LocalDaemon => &PROVIDERS[0],
            ProviderKind::CloudApi => &PROVIDERS[1],
            ProviderKind::LocalRuntime => &PROVIDERS[2],
        }
    }

    /// Config keys this variant needs. The sets are disjoint.
    pub fn required_keys(&self) -> &'static [&'static str] {
        self.spec().required_keys
    }
}

// ─────────────────────────────────────────────
// ProviderSpec — static metadata for one variant
// ─────────────────────────────────────────────

/// Static specification describing one adapter variant.
#[derive(Clone, Debug)]
pub struct ProviderSpec {
    pub kind: ProviderKind,
    /// Provider identifier in the settings file (e.g. `"ollama"`).
    pub provider: ProviderId,
    /// Human-readable name for logs and error messages.
    pub display_name: &'static str,
    /// Base URL used when `base_url` is not configured.
    pub default_base_url: &'static str,
    /// Keys that must be set for this variant.
    pub required_keys: &'static [&'static str],
    /// What to tell the user when the backend can't be reached.
    pub unreachable_fix: &'static str,
}

/// Every supported variant, in `ProviderKind` order.
pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        kind: ProviderKind::LocalDaemon,
        provider: ProviderId::Ollama,
        display_name: "Ollama",
        default_base_url: "http://localhost:11434",
        required_keys: &[],
        unreachable_fix: "Is Ollama running? Start it with `ollama serve`, or set `base_url`.",
    },
    ProviderSpec {
        kind: ProviderKind::CloudApi,
        provider: ProviderId::HuggingFace,
        display_name: "Hugging Face Inference API",
        default_base_url: "https://api-inference.huggingface.co",
        required_keys: &[KEY_HF_TOKEN],
        unreachable_fix: "Check your internet connection and the model id (`hf_model`).",
    },
    ProviderSpec {
        kind: ProviderKind::LocalRuntime,
        provider: ProviderId::HuggingFace,
        display_name: "Hugging Face local runtime",
        default_base_url: "http://127.0.0.1:8080",
        required_keys: &[KEY_DEVICE],
        unreachable_fix: "Start a local text-generation-inference server for the model, or set `base_url`.",
    },
];

/// Find the specs for a provider name (e.g. `"huggingface"` has two).
pub fn find_by_name(name: &str) -> Vec<&'static ProviderSpec> {
    match name.parse::<ProviderId>() {
        Ok(id) => PROVIDERS.iter().filter(|s| s.provider == id).collect(),
        Err(_) => Vec::new(),
    }
}

// ─────────────────────────────────────────────
// Dispatch
// ─────────────────────────────────────────────

/// Decide which adapter variant serves `config`.
///
/// - `ollama` → `LocalDaemon`, whatever the runtime. A `-cloud` model suffix
///   is the daemon's business, not a different adapter.
/// - `huggingface` + `cloud` → `CloudApi`; needs `hf_token`.
/// - `huggingface` + `local` → `LocalRuntime`; `device` defaults to `auto`.
pub fn dispatch(config: &ResolvedConfig) -> Result<ProviderKind> {
    let kind = match (config.provider, config.runtime) {
        (ProviderId::Ollama, _) => ProviderKind::LocalDaemon,
        (ProviderId::HuggingFace, RuntimeKind::Cloud) => ProviderKind::CloudApi,
        (ProviderId::HuggingFace, RuntimeKind::Local) => ProviderKind::LocalRuntime,
    };

    if kind == ProviderKind::CloudApi && config.hf_token.is_none() {
        return Err(LcmError::auth(
            format!(
                "Hugging Face cloud runtime needs an API token for model {}",
                config.hf_model_id()
            ),
            "Set `hf_token = ${HF_TOKEN}` in your .model file and export HF_TOKEN, \
             or set LCM_HF_TOKEN.",
        ));
    }

    Ok(kind)
}

/// Build the adapter for `config`.
pub fn select(config: &ResolvedConfig) -> Result<Arc<dyn ProviderAdapter>> {
    let kind = dispatch(config)?;
    let spec = kind.spec();
    let base_url = config
        .base_url
        .clone()
        .unwrap_or_else(|| spec.default_base_url.to_string());

    debug!(
        provider = spec.display_name,
        model = %config.model,
        base_url = %base_url,
        "Creating provider adapter"
    );

    let adapter: Arc<dyn ProviderAdapter> = match kind {
        ProviderKind::LocalDaemon => Arc::new(OllamaAdapter::new(&base_url, config.timeout)?),
        ProviderKind::CloudApi => Arc::new(HfCloudAdapter::new(config, &base_url)?),
        ProviderKind::LocalRuntime => {
            let device = config.device.resolve(&AcceleratorProbe::detect());
            Arc::new(HfLocalAdapter::new(&base_url, device, config.timeout)?)
        }
    };
    Ok(adapter)
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
