//! Config loader — reads `.model` settings files and `LCM_*` environment
//! variables, then resolves them into one [`ResolvedConfig`].
//!
//! # Precedence (highest wins, decided per key)
//! 1. Constructor overrides
//! 2. Project file `./.model`
//! 3. User file `~/.model`
//! 4. Environment variables `LCM_<KEY>` (plus `HF_TOKEN`)
//! 5. Defaults (from `ResolvedConfig::default()`)
//!
//! Sources are consulted key by key, so a project file can set `model` while
//! `hf_token` still falls through to the environment.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::schema::{
    is_recognized, ConfigSource, Overrides, ResolvedConfig, Setting, SettingSource,
    KEY_HF_TOKEN, RECOGNIZED_KEYS,
};
use crate::error::{LcmError, Result};

/// Name of the settings file in the project directory and in `$HOME`.
pub const SETTINGS_FILE_NAME: &str = ".model";

/// Prefix of the environment variables the resolver reads.
pub const ENV_PREFIX: &str = "LCM_";

/// Official Hugging Face token variable, accepted as a fallback for `hf_token`.
pub const HF_TOKEN_ENV: &str = "HF_TOKEN";

/// `./.model`
pub fn default_project_path() -> PathBuf {
    PathBuf::from(SETTINGS_FILE_NAME)
}

/// `~/.model`, if a home directory is known.
pub fn default_home_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(SETTINGS_FILE_NAME))
}

// ─────────────────────────────────────────────
// Readers
// ─────────────────────────────────────────────

/// Read a settings file. A missing file yields an empty source.
pub fn read_settings_file(path: &Path, tag: SettingSource) -> Result<ConfigSource> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No settings file at {}, skipping", path.display());
            return Ok(ConfigSource::empty(tag));
        }
        Err(e) => {
            return Err(LcmError::config(
                format!("Failed to read settings file {}: {e}", path.display()),
                "Check the file's permissions, or remove it.",
            ))
        }
    };

    debug!("Loading settings from {}", path.display());
    parse_settings(&content, path, tag)
}

/// Parse `key = value` lines.
///
/// Blank lines and `#` comment lines are skipped; a `#` preceded by
/// whitespace starts a trailing comment. Values wrapped in matching quotes
/// are unquoted. Keys are lowercased.
pub fn parse_settings(content: &str, origin: &Path, tag: SettingSource) -> Result<ConfigSource> {
    let mut source = ConfigSource::empty(tag);

    for (idx, raw_line) in content.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let malformed = || {
            LcmError::config(
                format!(
                    "Malformed line {} in {}: '{}'",
                    idx + 1,
                    origin.display(),
                    raw_line.trim()
                ),
                "Use the form `key = value`, or start the line with `#` to comment it out.",
            )
        };

        let (key, value) = line.split_once('=').ok_or_else(malformed)?;
        let key = key.trim().to_lowercase();
        if key.is_empty() {
            return Err(malformed());
        }

        source
            .values
            .insert(key, unquote(value.trim()).to_string());
    }

    Ok(source)
}

/// Read `LCM_<KEY>` variables (and the `HF_TOKEN` alias) from an environment map.
pub fn read_environment(environ: &HashMap<String, String>) -> ConfigSource {
    let mut source = ConfigSource::empty(SettingSource::Environment);

    for (name, value) in environ {
        if let Some(key) = name.strip_prefix(ENV_PREFIX) {
            if !key.is_empty() && !value.is_empty() {
                source.values.insert(key.to_lowercase(), value.clone());
            }
        }
    }

    if !source.values.contains_key(KEY_HF_TOKEN) {
        if let Some(token) = environ.get(HF_TOKEN_ENV).filter(|t| !t.is_empty()) {
            source.values.insert(KEY_HF_TOKEN.to_string(), token.clone());
        }
    }

    source
}

/// Wrap constructor overrides as the highest-precedence source.
pub fn overrides_source(overrides: &Overrides) -> ConfigSource {
    let mut source = ConfigSource::empty(SettingSource::Constructor);
    for (key, value) in overrides.iter() {
        source.values.insert(key.to_string(), value.to_string());
    }
    source
}

/// Snapshot of the process environment.
pub fn process_environment() -> HashMap<String, String> {
    std::env::vars().collect()
}

// ─────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────

/// Resolve configuration from all sources.
///
/// `project_path` / `home_path` of `None` mean "no such source".
pub fn resolve(
    overrides: &Overrides,
    project_path: Option<&Path>,
    home_path: Option<&Path>,
    environ: &HashMap<String, String>,
) -> Result<ResolvedConfig> {
    let mut sources = vec![overrides_source(overrides)];
    if let Some(path) = project_path {
        sources.push(read_settings_file(path, SettingSource::ProjectFile)?);
    }
    if let Some(path) = home_path {
        sources.push(read_settings_file(path, SettingSource::UserFile)?);
    }
    sources.push(read_environment(environ));

    resolve_sources(&sources, environ)
}

/// Resolve from already-read sources, given highest precedence first.
pub fn resolve_sources(
    sources: &[ConfigSource],
    environ: &HashMap<String, String>,
) -> Result<ResolvedConfig> {
    let mut config = ResolvedConfig::default();

    for key in RECOGNIZED_KEYS {
        if let Some(setting) = lookup(sources, key) {
            let value = interpolate_setting(&setting, environ)?;
            config.apply(key, &value, setting.source)?;
        }
    }

    let unknown: BTreeSet<&str> = sources
        .iter()
        .flat_map(|s| s.values.keys())
        .map(String::as_str)
        .filter(|k| !is_recognized(k))
        .collect();
    for key in unknown {
        if let Some(setting) = lookup(sources, key) {
            let value = interpolate_setting(&setting, environ)?;
            config.apply(key, &value, setting.source)?;
        }
    }

    debug!(
        provider = %config.provider,
        model = %config.model,
        runtime = %config.runtime,
        provider_from = %config.source_of("provider"),
        model_from = %config.source_of("model"),
        "Resolved configuration"
    );

    Ok(config)
}

/// First source (in precedence order) that defines `key`.
pub fn lookup(sources: &[ConfigSource], key: &str) -> Option<Setting> {
    sources.iter().find_map(|source| source.get(key))
}

// ─────────────────────────────────────────────
// Interpolation
// ─────────────────────────────────────────────

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("interpolation pattern is valid")
    })
}

/// Replace every `${NAME}` with `environ[NAME]`.
///
/// Returns the name of the first unresolved variable on failure.
pub fn interpolate(
    value: &str,
    environ: &HashMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut last = 0;

    for caps in var_pattern().captures_iter(value) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let replacement = environ
            .get(name.as_str())
            .ok_or_else(|| name.as_str().to_string())?;
        out.push_str(&value[last..whole.start()]);
        out.push_str(replacement);
        last = whole.end();
    }
    out.push_str(&value[last..]);

    Ok(out)
}

fn interpolate_setting(setting: &Setting, environ: &HashMap<String, String>) -> Result<String> {
    interpolate(&setting.value, environ).map_err(|missing| {
        LcmError::config(
            format!(
                "Setting `{}` (from {}) references ${{{missing}}}, which is not set",
                setting.key, setting.source
            ),
            format!("Export {missing} in your environment, or set `{}` directly.", setting.key),
        )
    })
}

// ─────────────────────────────────────────────
// Line helpers
// ─────────────────────────────────────────────

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return &line[..i];
        }
    }
    line
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
