//! lcm — one model facade for local and cloud LLM backends.
//!
//! Configuration comes from constructor options, `./.model`, `~/.model`, and
//! `LCM_*` environment variables (first match wins, key by key). The facade
//! dispatches to Ollama, the Hugging Face Inference API, or a local
//! Hugging Face runtime, and exposes the same calls for each.
//!
//! ```no_run
//! use futures_util::StreamExt;
//! use lcm::Model;
//!
//! # async fn demo() -> lcm::Result<()> {
//! let model = Model::new()?;
//! println!("{}", model.chat("Why is the sky blue?").await?);
//!
//! let mut stream = model.stream("Count to five").await?;
//! while let Some(fragment) = stream.next().await {
//!     print!("{}", fragment?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod model;

pub use blocking::{BlockingModel, BlockingTokenStream};
pub use model::{Model, ModelBuilder};

pub use lcm_core::config::{Overrides, ResolvedConfig};
pub use lcm_core::{ErrorKind, HealthStatus, LcmError, Message, Prompt, Result};
pub use lcm_providers::{ProviderKind, TokenStream};
