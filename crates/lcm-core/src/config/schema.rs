//! Configuration schema — typed view over the `.model` settings.
//!
//! Raw settings are plain `key = value` strings; [`ResolvedConfig`] holds the
//! validated, typed result. Unknown keys survive in [`ResolvedConfig::extra`]
//! so newer settings files keep working with older builds.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::{LcmError, Result};

// ─────────────────────────────────────────────
// Keys & defaults
// ─────────────────────────────────────────────

pub const KEY_PROVIDER: &str = "provider";
pub const KEY_MODEL: &str = "model";
pub const KEY_RUNTIME: &str = "runtime";
pub const KEY_STREAM: &str = "stream";
pub const KEY_TIMEOUT: &str = "timeout";
pub const KEY_BASE_URL: &str = "base_url";
pub const KEY_DEVICE: &str = "device";
pub const KEY_HF_TOKEN: &str = "hf_token";
pub const KEY_HF_MODEL: &str = "hf_model";

/// Every key the resolver understands, in resolution order.
///
/// `provider` comes first: validating `runtime` depends on it.
pub const RECOGNIZED_KEYS: &[&str] = &[
    KEY_PROVIDER,
    KEY_MODEL,
    KEY_RUNTIME,
    KEY_STREAM,
    KEY_TIMEOUT,
    KEY_BASE_URL,
    KEY_DEVICE,
    KEY_HF_TOKEN,
    KEY_HF_MODEL,
];

/// Extra keys forwarded to the backend as generation options.
pub const GENERATION_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "top_k",
    "seed",
    "max_tokens",
    "stop",
    "repeat_penalty",
];

pub const DEFAULT_MODEL: &str = "qwen2.5:7b";
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

pub fn is_recognized(key: &str) -> bool {
    RECOGNIZED_KEYS.contains(&key)
}

// ─────────────────────────────────────────────
// Provider / runtime / device
// ─────────────────────────────────────────────

/// Known provider identifiers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ProviderId {
    #[default]
    Ollama,
    HuggingFace,
}

impl ProviderId {
    pub const ALL: &'static [ProviderId] = &[ProviderId::Ollama, ProviderId::HuggingFace];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Ollama => "ollama",
            ProviderId::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = LcmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ollama" => Ok(ProviderId::Ollama),
            "huggingface" | "hf" => Ok(ProviderId::HuggingFace),
            other => Err(LcmError::config(
                format!("Unknown provider '{other}'"),
                format!(
                    "Set `provider` to one of: {}.",
                    ProviderId::ALL
                        .iter()
                        .map(ProviderId::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }
}

/// Where a Hugging Face model runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RuntimeKind {
    #[default]
    Local,
    Cloud,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeKind::Local => "local",
            RuntimeKind::Cloud => "cloud",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeKind {
    type Err = LcmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(RuntimeKind::Local),
            "cloud" => Ok(RuntimeKind::Cloud),
            other => Err(LcmError::config(
                format!("Invalid runtime '{other}'"),
                "Set `runtime` to `local` or `cloud`.",
            )),
        }
    }
}

/// Compute device label for a local runtime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Device {
    /// Pick an accelerator if one is present, else CPU.
    #[default]
    Auto,
    Cpu,
    /// CUDA device ordinal.
    Cuda(u32),
    /// Apple Metal.
    Mps,
}

impl Device {
    /// Replace `Auto` with a concrete device using the given probe.
    pub fn resolve(self, probe: &AcceleratorProbe) -> Device {
        match self {
            Device::Auto if probe.cuda => Device::Cuda(0),
            Device::Auto if probe.mps => Device::Mps,
            Device::Auto => Device::Cpu,
            concrete => concrete,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Auto => f.write_str("auto"),
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(0) => f.write_str("cuda"),
            Device::Cuda(n) => write!(f, "cuda:{n}"),
            Device::Mps => f.write_str("mps"),
        }
    }
}

impl FromStr for Device {
    type Err = LcmError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_lowercase();
        let invalid = || {
            LcmError::config(
                format!("Invalid device '{lower}'"),
                "Set `device` to `auto`, `cpu`, `cuda`, `cuda:<N>`, or `mps`.",
            )
        };
        match lower.as_str() {
            "auto" => Ok(Device::Auto),
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            "mps" => Ok(Device::Mps),
            other => match other.strip_prefix("cuda:") {
                Some(n) => n.parse().map(Device::Cuda).map_err(|_| invalid()),
                None => Err(invalid()),
            },
        }
    }
}

/// Which accelerators are present on this machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceleratorProbe {
    pub cuda: bool,
    pub mps: bool,
}

impl AcceleratorProbe {
    /// Probe the current machine.
    ///
    /// CUDA: an NVIDIA control device node exists and `CUDA_VISIBLE_DEVICES`
    /// does not hide every GPU. MPS: Apple silicon.
    pub fn detect() -> Self {
        let hidden = std::env::var("CUDA_VISIBLE_DEVICES")
            .map(|v| v.trim().is_empty() || v.trim() == "-1")
            .unwrap_or(false);
        let cuda = !hidden && Path::new("/dev/nvidiactl").exists();
        let mps = cfg!(all(target_os = "macos", target_arch = "aarch64"));
        Self { cuda, mps }
    }
}

// ─────────────────────────────────────────────
// Settings & sources
// ─────────────────────────────────────────────

/// Where a setting came from, highest precedence first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingSource {
    Constructor,
    ProjectFile,
    UserFile,
    Environment,
    Default,
}

impl fmt::Display for SettingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SettingSource::Constructor => "constructor",
            SettingSource::ProjectFile => "project file",
            SettingSource::UserFile => "user file",
            SettingSource::Environment => "environment",
            SettingSource::Default => "default",
        })
    }
}

/// One raw setting, as found in a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Setting {
    /// Lowercased key.
    pub key: String,
    /// Raw value, possibly containing `${VAR}` markers.
    pub value: String,
    pub source: SettingSource,
}

/// The key/value map one reader produced, tagged with its origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigSource {
    pub tag: SettingSource,
    pub values: BTreeMap<String, String>,
}

impl ConfigSource {
    pub fn empty(tag: SettingSource) -> Self {
        Self {
            tag,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<Setting> {
        self.values.get(key).map(|value| Setting {
            key: key.to_string(),
            value: value.clone(),
            source: self.tag,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ─────────────────────────────────────────────
// Per-call overrides
// ─────────────────────────────────────────────

/// String settings that shadow the resolved config.
///
/// Used both for constructor overrides and for a single call
/// (e.g. a one-off `timeout = 5`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Overrides(BTreeMap<String, String>);

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter. Keys are lowercased.
    pub fn with(mut self, key: impl AsRef<str>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl AsRef<str>, value: impl ToString) {
        self.0
            .insert(key.as_ref().trim().to_lowercase(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: ToString> FromIterator<(K, V)> for Overrides {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut overrides = Overrides::new();
        for (k, v) in iter {
            overrides.set(k, v);
        }
        overrides
    }
}

// ─────────────────────────────────────────────
// ResolvedConfig
// ─────────────────────────────────────────────

/// The effective configuration for one facade instance.
///
/// Built once by the resolver; every recognized key has a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub provider: ProviderId,
    pub model: String,
    pub runtime: RuntimeKind,
    pub stream: bool,
    pub timeout: Duration,
    /// Custom backend base URL (overrides the provider default).
    pub base_url: Option<String>,
    pub device: Device,
    pub hf_token: Option<String>,
    /// Hugging Face model id, when it differs from `model`.
    pub hf_model: Option<String>,
    /// Unrecognized keys, kept verbatim.
    pub extra: BTreeMap<String, String>,
    origins: BTreeMap<&'static str, SettingSource>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            provider: ProviderId::default(),
            model: DEFAULT_MODEL.to_string(),
            runtime: RuntimeKind::default(),
            stream: true,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            base_url: None,
            device: Device::default(),
            hf_token: None,
            hf_model: None,
            extra: BTreeMap::new(),
            origins: BTreeMap::new(),
        }
    }
}

impl ResolvedConfig {
    /// Source of a recognized key's value (`Default` when no source set it).
    pub fn source_of(&self, key: &str) -> SettingSource {
        self.origins
            .get(key)
            .copied()
            .unwrap_or(SettingSource::Default)
    }

    /// The model id sent to Hugging Face backends.
    pub fn hf_model_id(&self) -> &str {
        self.hf_model.as_deref().unwrap_or(&self.model)
    }

    /// Extra keys that are generation parameters, in key order.
    pub fn generation_options(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra
            .iter()
            .filter(|(k, _)| GENERATION_PARAMS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this config shadowed by per-call overrides.
    ///
    /// `provider` and `runtime` can't change per call: the adapter is
    /// already bound. Recognized values are validated like file values.
    pub fn with_overrides(&self, overrides: &Overrides) -> Result<ResolvedConfig> {
        let mut shadow = self.clone();
        for (key, value) in overrides.iter() {
            match key {
                KEY_PROVIDER => {
                    let provider: ProviderId = value.parse()?;
                    if provider != self.provider {
                        return Err(LcmError::config(
                            format!(
                                "Cannot switch provider from '{}' to '{provider}' for a single call",
                                self.provider
                            ),
                            "Create a separate Model for the other provider.",
                        ));
                    }
                }
                KEY_RUNTIME if self.provider == ProviderId::HuggingFace => {
                    let runtime: RuntimeKind = value.parse()?;
                    if runtime != self.runtime {
                        return Err(LcmError::config(
                            format!(
                                "Cannot switch runtime from '{}' to '{runtime}' for a single call",
                                self.runtime
                            ),
                            "Create a separate Model for the other runtime.",
                        ));
                    }
                }
                _ => shadow.apply(key, value, SettingSource::Constructor)?,
            }
        }
        Ok(shadow)
    }

    /// Parse and store one (already interpolated) value.
    pub(crate) fn apply(&mut self, key: &str, value: &str, source: SettingSource) -> Result<()> {
        let value = value.trim();
        match key {
            KEY_PROVIDER => self.provider = value.parse()?,
            KEY_MODEL => {
                if value.is_empty() {
                    return Err(LcmError::config(
                        "Setting `model` is empty",
                        format!("Set `model` to a model name, e.g. `model = {DEFAULT_MODEL}`."),
                    ));
                }
                self.model = value.to_string();
            }
            KEY_RUNTIME => match value.parse() {
                Ok(runtime) => self.runtime = runtime,
                Err(e) if self.provider == ProviderId::HuggingFace => return Err(e),
                Err(_) => {
                    warn!(runtime = value, provider = %self.provider, "ignoring invalid runtime");
                    return Ok(());
                }
            },
            KEY_STREAM => self.stream = parse_bool(key, value)?,
            KEY_TIMEOUT => self.timeout = parse_timeout(value)?,
            KEY_BASE_URL => self.base_url = non_empty(value),
            KEY_DEVICE => self.device = value.parse()?,
            KEY_HF_TOKEN => self.hf_token = non_empty(value),
            KEY_HF_MODEL => self.hf_model = non_empty(value),
            other => {
                self.extra.insert(other.to_string(), value.to_string());
                return Ok(());
            }
        }
        if let Some(known) = RECOGNIZED_KEYS.iter().find(|k| **k == key) {
            self.origins.insert(*known, source);
        }
        Ok(())
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(LcmError::config(
            format!("Invalid value '{other}' for `{key}`"),
            format!("Set `{key}` to `true` or `false`."),
        )),
    }
}

fn parse_timeout(value: &str) -> Result<Duration> {
    match value.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(LcmError::config(
            format!("Invalid timeout '{value}'"),
            "Set `timeout` to a positive whole number of seconds, e.g. `timeout = 120`.",
        )),
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = ResolvedConfig::default();
        assert_eq!(config.provider, ProviderId::Ollama);
        assert_eq!(config.model, "qwen2.5:7b");
        assert_eq!(config.runtime, RuntimeKind::Local);
        assert_eq!(config.device, Device::Auto);
        assert!(config.stream);
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert_eq!(config.source_of(KEY_MODEL), SettingSource::Default);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("ollama".parse::<ProviderId>().unwrap(), ProviderId::Ollama);
        assert_eq!(
            "HuggingFace".parse::<ProviderId>().unwrap(),
            ProviderId::HuggingFace
        );
        let err = "openai".parse::<ProviderId>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.message().contains("openai"));
        assert!(err.fix().contains("ollama, huggingface"));
    }

    #[test]
    fn test_device_parse_and_display() {
        assert_eq!("cuda:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
        assert_eq!(Device::Cuda(0).to_string(), "cuda");
        assert!("tpu".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
    }

    #[test]
    fn test_device_auto_policy() {
        let gpu = AcceleratorProbe {
            cuda: true,
            mps: false,
        };
        let mac = AcceleratorProbe {
            cuda: false,
            mps: true,
        };
        let none = AcceleratorProbe::default();
        assert_eq!(Device::Auto.resolve(&gpu), Device::Cuda(0));
        assert_eq!(Device::Auto.resolve(&mac), Device::Mps);
        assert_eq!(Device::Auto.resolve(&none), Device::Cpu);
        assert_eq!(Device::Cpu.resolve(&gpu), Device::Cpu);
    }

    #[test]
    fn test_with_overrides_shadows_without_mutating() {
        let config = ResolvedConfig::default();
        let shadow = config
            .with_overrides(&Overrides::new().with("timeout", 5).with("temperature", 0.2))
            .unwrap();
        assert_eq!(shadow.timeout, Duration::from_secs(5));
        assert_eq!(
            shadow.generation_options().collect::<Vec<_>>(),
            vec![("temperature", "0.2")]
        );
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert!(config.extra.is_empty());
    }

    #[test]
    fn test_with_overrides_rejects_provider_switch() {
        let config = ResolvedConfig::default();
        let err = config
            .with_overrides(&Overrides::new().with("provider", "huggingface"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        // Same provider is fine.
        assert!(config
            .with_overrides(&Overrides::new().with("provider", "ollama"))
            .is_ok());
    }

    #[test]
    fn test_with_overrides_rejects_runtime_switch_for_hf() {
        let config = ResolvedConfig {
            provider: ProviderId::HuggingFace,
            runtime: RuntimeKind::Cloud,
            ..ResolvedConfig::default()
        };
        let err = config
            .with_overrides(&Overrides::new().with("runtime", "local"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_invalid_timeout_override() {
        let err = ResolvedConfig::default()
            .with_overrides(&Overrides::new().with("timeout", "soon"))
            .unwrap_err();
        assert!(err.message().contains("soon"));
        assert!(ResolvedConfig::default()
            .with_overrides(&Overrides::new().with("timeout", 0))
            .is_err());
    }

    #[test]
    fn test_generation_options_filters_unknown_extras() {
        let mut config = ResolvedConfig::default();
        config.extra.insert("top_k".into(), "40".into());
        config.extra.insert("team".into(), "ml".into());
        let opts: Vec<_> = config.generation_options().collect();
        assert_eq!(opts, vec![("top_k", "40")]);
    }

    #[test]
    fn test_overrides_lowercase_keys() {
        let overrides: Overrides = [("Timeout", "5")].into_iter().collect();
        assert_eq!(overrides.get("timeout"), Some("5"));
    }

    #[test]
    fn test_hf_model_id_fallback() {
        let mut config = ResolvedConfig::default();
        assert_eq!(config.hf_model_id(), "qwen2.5:7b");
        config.hf_model = Some("Qwen/Qwen2.5-7B-Instruct".into());
        assert_eq!(config.hf_model_id(), "Qwen/Qwen2.5-7B-Instruct");
    }
}
