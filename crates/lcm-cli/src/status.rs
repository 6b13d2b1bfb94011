//! `lcm health` and `lcm config` output.

use std::path::Path;

use anyhow::Result;
use colored::Colorize;

use lcm::{HealthStatus, Model};
use lcm_core::config::schema::*;
use lcm_core::config::{self, Overrides, ResolvedConfig};
use lcm_core::utils::mask_secret;
use lcm_providers::registry;

/// Print a health record.
pub fn print_health(model: &Model, health: &HealthStatus) {
    println!();
    println!("{}", "lcm Health".cyan().bold());
    println!();
    println!("  {:<18} {}", "Provider:".bold(), model.provider_name());
    println!("  {:<18} {}", "Model:".bold(), model.config().model);
    println!("  {:<18} {}", "Reachable:".bold(), check(health.reachable));
    println!("  {:<18} {}", "Model ready:".bold(), check(health.model_ready));
    if !health.detail.is_empty() {
        println!("  {:<18} {}", "Detail:".bold(), health.detail.dimmed());
    }
    println!();
}

fn check(ok: bool) -> String {
    if ok {
        "✓".green().to_string()
    } else {
        "✗".red().to_string()
    }
}

/// Resolve the configuration and print each key with its source.
pub fn print_config(overrides: &Overrides) -> Result<()> {
    let project = config::default_project_path();
    let home = config::default_home_path();
    let resolved = config::resolve(
        overrides,
        Some(&project),
        home.as_deref(),
        &config::process_environment(),
    )?;

    println!();
    println!("{}", "lcm Config".cyan().bold());
    println!();
    print_file("Project file:", &project);
    match &home {
        Some(path) => print_file("User file:", path),
        None => println!("  {:<18} {}", "User file:".bold(), "(no home directory)".dimmed()),
    }

    println!();
    for key in RECOGNIZED_KEYS {
        println!(
            "  {:<18} {} {}",
            format!("{key}:").bold(),
            display_value(&resolved, key),
            format!("({})", resolved.source_of(key)).dimmed()
        );
    }

    if !resolved.extra.is_empty() {
        println!();
        println!("  {}", "Extra settings:".bold());
        for (key, value) in &resolved.extra {
            let note = if GENERATION_PARAMS.contains(&key.as_str()) {
                "(sent to backend)".dimmed().to_string()
            } else {
                "(unused)".dimmed().to_string()
            };
            println!("    {:<18} {value} {note}", format!("{key}:"));
        }
    }

    println!();
    match registry::dispatch(&resolved) {
        Ok(kind) => println!("  {:<18} {}", "Adapter:".bold(), kind.spec().display_name.green()),
        Err(e) => println!("  {:<18} {}", "Adapter:".bold(), e.message().red()),
    }
    println!();

    Ok(())
}

fn print_file(label: &str, path: &Path) {
    let marker = if path.exists() {
        "✓".green().to_string()
    } else {
        "(not found)".dimmed().to_string()
    };
    println!("  {:<18} {} {}", label.bold(), path.display(), marker);
}

/// Human-readable value of a recognized key. Secrets are masked.
fn display_value(cfg: &ResolvedConfig, key: &str) -> String {
    let unset = || "(not set)".to_string();
    match key {
        KEY_PROVIDER => cfg.provider.to_string(),
        KEY_MODEL => cfg.model.clone(),
        KEY_RUNTIME => cfg.runtime.to_string(),
        KEY_STREAM => cfg.stream.to_string(),
        KEY_TIMEOUT => format!("{}s", cfg.timeout.as_secs()),
        KEY_BASE_URL => match (&cfg.base_url, registry::dispatch(cfg)) {
            (Some(url), _) => url.clone(),
            (None, Ok(kind)) => format!("{} (default)", kind.spec().default_base_url),
            (None, Err(_)) => unset(),
        },
        KEY_DEVICE => cfg.device.to_string(),
        KEY_HF_TOKEN => cfg.hf_token.as_deref().map(mask_secret).unwrap_or_else(unset),
        KEY_HF_MODEL => cfg.hf_model.clone().unwrap_or_else(unset),
        _ => cfg.extra.get(key).cloned().unwrap_or_else(unset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(pairs: &[(&str, &str)]) -> ResolvedConfig {
        let overrides: Overrides = pairs.iter().copied().collect();
        config::resolve(&overrides, None, None, &Default::default()).unwrap()
    }

    #[test]
    fn token_is_masked() {
        let cfg = resolved(&[
            ("provider", "huggingface"),
            ("runtime", "cloud"),
            ("hf_token", "hf_supersecret"),
        ]);
        let shown = display_value(&cfg, KEY_HF_TOKEN);
        assert_eq!(shown, "hf_s****");
        assert!(!shown.contains("supersecret"));
    }

    #[test]
    fn default_base_url_follows_adapter() {
        let cfg = resolved(&[]);
        assert_eq!(
            display_value(&cfg, KEY_BASE_URL),
            "http://localhost:11434 (default)"
        );

        let cfg = resolved(&[("base_url", "http://gpu-box:11434")]);
        assert_eq!(display_value(&cfg, KEY_BASE_URL), "http://gpu-box:11434");
    }

    #[test]
    fn unset_values() {
        let cfg = resolved(&[]);
        assert_eq!(display_value(&cfg, KEY_HF_TOKEN), "(not set)");
        assert_eq!(display_value(&cfg, KEY_TIMEOUT), "120s");
        assert_eq!(display_value(&cfg, KEY_MODEL), DEFAULT_MODEL);
    }
}
