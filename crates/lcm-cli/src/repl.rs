//! Interactive REPL.
//!
//! Readline editing and persistent history come from `rustyline`. The
//! conversation lives in memory and is resent as a message list each turn,
//! so the model sees earlier replies.

use std::path::Path;

use anyhow::Result;
use rustyline::config::Configurer;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing::debug;

use lcm::{Message, Model, Prompt};
use lcm_core::utils::get_history_path;

use crate::helpers;

const PROMPT: &str = "You: ";
const MAX_HISTORY: usize = 1000;

/// What one line of input asks for.
#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Blank,
    Quit,
    Reset,
    Say(&'a str),
}

fn classify(input: &str) -> Line<'_> {
    let trimmed = input.trim();
    match trimmed.to_lowercase().as_str() {
        "" => Line::Blank,
        "exit" | "quit" | "/exit" | "/quit" | ":q" => Line::Quit,
        "/reset" | "/clear" => Line::Reset,
        _ => Line::Say(trimmed),
    }
}

/// Run the interactive loop until the user quits.
pub async fn run(model: &Model, stream: bool) -> Result<()> {
    helpers::print_banner(model);

    let history = get_history_path();
    let mut editor = DefaultEditor::new()?;
    editor.set_max_history_size(MAX_HISTORY)?;
    if editor.load_history(&history).is_ok() {
        debug!(path = %history.display(), "loaded REPL history");
    }

    let mut conversation: Vec<Message> = Vec::new();
    loop {
        let input = match editor.readline(PROMPT) {
            Ok(input) => input,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        };

        let text = match classify(&input) {
            Line::Blank => continue,
            Line::Quit => {
                println!("\nGoodbye!");
                break;
            }
            Line::Reset => {
                conversation.clear();
                println!("(conversation cleared)\n");
                continue;
            }
            Line::Say(text) => text,
        };
        let _ = editor.add_history_entry(text);

        conversation.push(Message::user(text));
        debug!(turns = conversation.len(), "sending conversation");
        match helpers::reply(model, Prompt::from(conversation.as_slice()), stream).await {
            Ok(reply) => {
                conversation.push(Message::assistant(reply));
                println!();
            }
            Err(e) => {
                // The turn got no answer; forget it.
                conversation.pop();
                eprintln!("\nError: {e:#}\n");
            }
        }
    }

    persist_history(&mut editor, &history);
    Ok(())
}

fn persist_history(editor: &mut DefaultEditor, path: &Path) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    if let Err(e) = editor.save_history(path) {
        debug!(error = %e, "could not save REPL history");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_lines() {
        assert_eq!(classify("   "), Line::Blank);
        assert_eq!(classify("EXIT"), Line::Quit);
        assert_eq!(classify(":q"), Line::Quit);
        assert_eq!(classify("/reset"), Line::Reset);
        assert_eq!(classify("  hello there "), Line::Say("hello there"));
        assert_eq!(classify("exit now"), Line::Say("exit now"));
    }
}
