//! Shared CLI helpers — reply printing, embedding summary, `-s` parsing.

use std::io::Write;

use anyhow::{Context, Result};
use colored::Colorize;
use futures_util::StreamExt;

use lcm::{Model, Prompt};

/// How many leading values `embed` prints.
const EMBED_PREVIEW: usize = 8;

/// Parse a `key=value` pair for `-s/--set`.
pub fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{raw}'"));
    }
    Ok((key.to_lowercase(), value.trim().to_string()))
}

/// Generate a reply for `prompt`, printing it as it arrives when `stream` is
/// set. Returns the full reply text.
pub async fn reply(model: &Model, prompt: Prompt, stream: bool) -> Result<String> {
    if !stream {
        print_thinking();
        let result = model.chat(prompt).await;
        clear_thinking();
        let text = result.context("generation failed")?;
        println!("{text}");
        return Ok(text);
    }

    let mut fragments = model.stream(prompt).await.context("generation failed")?;
    let mut text = String::new();
    let mut stdout = std::io::stdout();
    while let Some(fragment) = fragments.next().await {
        let fragment = fragment.context("generation interrupted")?;
        print!("{fragment}");
        stdout.flush()?;
        text.push_str(&fragment);
    }
    println!();
    Ok(text)
}

/// Print the dimension and the first few values of an embedding.
pub fn print_embedding(vector: &[f32]) {
    println!("{} {}", "Dimension:".bold(), vector.len());
    println!("{} {}", "Values:".bold(), preview(vector));
}

fn preview(vector: &[f32]) -> String {
    let shown: Vec<String> = vector
        .iter()
        .take(EMBED_PREVIEW)
        .map(|v| format!("{v:.4}"))
        .collect();
    if vector.len() > EMBED_PREVIEW {
        format!("[{}, …]", shown.join(", "))
    } else {
        format!("[{}]", shown.join(", "))
    }
}

/// Print the banner shown at REPL start.
pub fn print_banner(model: &Model) {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!(
        "{}  v{}  {}",
        "lcm".cyan().bold(),
        version.dimmed(),
        format!("{} via {}", model.config().model, model.provider_name()).dimmed()
    );
    println!(
        "{}",
        "Type a message, \"/reset\" to start over, or \"exit\" to quit.".dimmed()
    );
    println!();
}

/// Print a "thinking" placeholder while a non-streamed reply is generated.
pub fn print_thinking() {
    eprint!("{}", "⠿ thinking...".dimmed());
}

/// Clear the "thinking" placeholder.
pub fn clear_thinking() {
    eprint!("\r{}\r", " ".repeat(40));
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
