//! lcm CLI — entry point.
//!
//! # Commands
//!
//! - `lcm chat [-m MESSAGE] [--no-stream]` — single-shot or interactive REPL
//! - `lcm embed TEXT` — embed text and print the vector summary
//! - `lcm health` — probe the configured backend
//! - `lcm pull` — make the configured model available (auto-pull)
//! - `lcm config` — show the resolved configuration and where each value came from

mod helpers;
mod repl;
mod status;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use lcm::Model;
use lcm_core::config::Overrides;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// lcm — one client for local and cloud language models
#[derive(Parser)]
#[command(name = "lcm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Model name (overrides .model files and environment)
    #[arg(long, global = true)]
    model: Option<String>,

    /// Provider: ollama or huggingface
    #[arg(long, global = true)]
    provider: Option<String>,

    /// Runtime for huggingface: local or cloud
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Extra setting, repeatable (e.g. -s temperature=0.2)
    #[arg(short = 's', long = "set", value_name = "KEY=VALUE", global = true, value_parser = helpers::parse_key_value)]
    set: Vec<(String, String)>,

    /// Enable debug logging
    #[arg(long, global = true, default_value_t = false)]
    logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the model (single-shot or interactive REPL)
    Chat {
        /// Single message (non-interactive). Omit for REPL mode.
        #[arg(short, long)]
        message: Option<String>,

        /// Print the whole reply at once instead of streaming it
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /// Embed a piece of text
    Embed {
        /// Text to embed
        text: String,
    },

    /// Check that the backend and model are available
    Health,

    /// Pull the configured model if it is missing
    Pull,

    /// Show the resolved configuration
    Config,
}

impl Cli {
    /// Constructor-level settings from the command line.
    fn overrides(&self) -> Overrides {
        let mut overrides: Overrides = self.set.iter().map(|(k, v)| (k, v)).collect();
        if let Some(model) = &self.model {
            overrides.set("model", model);
        }
        if let Some(provider) = &self.provider {
            overrides.set("provider", provider);
        }
        if let Some(runtime) = &self.runtime {
            overrides.set("runtime", runtime);
        }
        overrides
    }

    fn build_model(&self) -> Result<Model> {
        let model = Model::builder()
            .options(&self.overrides())
            .build()
            .context("could not set up the model")?;
        info!(provider = model.provider_name(), model = %model.config().model, "using model");
        Ok(model)
    }
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.logs);

    match &cli.command {
        Commands::Chat { message, no_stream } => {
            let model = cli.build_model()?;
            let stream = model.config().stream && !no_stream;
            match message {
                Some(message) => helpers::reply(&model, message.as_str().into(), stream)
                    .await
                    .map(|_| ()),
                None => repl::run(&model, stream).await,
            }
        }
        Commands::Embed { text } => {
            let model = cli.build_model()?;
            let vector = model.embed(text).await.context("embedding failed")?;
            helpers::print_embedding(&vector);
            Ok(())
        }
        Commands::Health => {
            let model = cli.build_model()?;
            let health = model.health().await;
            status::print_health(&model, &health);
            if health.is_healthy() {
                Ok(())
            } else {
                std::process::exit(1)
            }
        }
        Commands::Pull => {
            let model = cli.build_model()?;
            println!("Pulling {} via {}...", model.config().model, model.provider_name());
            model.provision().await.context("pull failed")?;
            status::print_health(&model, &model.health().await);
            Ok(())
        }
        Commands::Config => status::print_config(&cli.overrides()),
    }
}

/// Initialize tracing/logging.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("lcm=debug,lcm_core=debug,lcm_providers=debug,info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_become_overrides() {
        let cli = Cli::parse_from([
            "lcm",
            "--model",
            "llama3.2",
            "-s",
            "temperature=0.2",
            "chat",
            "-m",
            "hi",
            "--provider",
            "ollama",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.get("model"), Some("llama3.2"));
        assert_eq!(overrides.get("temperature"), Some("0.2"));
        assert_eq!(overrides.get("provider"), Some("ollama"));
        assert!(overrides.get("runtime").is_none());
        assert!(matches!(cli.command, Commands::Chat { message: Some(_), no_stream: false }));
    }

    #[test]
    fn named_flags_win_over_set() {
        let cli = Cli::parse_from(["lcm", "-s", "model=a", "--model", "b", "config"]);
        assert_eq!(cli.overrides().get("model"), Some("b"));
    }

    #[test]
    fn malformed_set_is_rejected() {
        assert!(Cli::try_parse_from(["lcm", "-s", "novalue", "health"]).is_err());
    }
}
