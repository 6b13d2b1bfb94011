//! Backend adapters for lcm.
//!
//! # Architecture
//!
//! - [`traits::ProviderAdapter`] — capability set every backend implements
//! - [`registry`] — static specs for the three adapter variants + dispatch
//! - [`ollama::OllamaAdapter`] — local Ollama daemon (auto-pulls models)
//! - [`huggingface`] — hosted Inference API and local TGI-compatible runtime
//! - [`http`] — shared transport: timeouts, retry, status translation, framing

pub mod http;
pub mod huggingface;
pub mod ollama;
pub mod registry;
pub mod traits;

// Re-export main types for convenience
pub use huggingface::{HfCloudAdapter, HfLocalAdapter};
pub use ollama::OllamaAdapter;
pub use registry::{dispatch, select, ProviderKind, ProviderSpec, PROVIDERS};
pub use traits::{ProviderAdapter, TokenStream};
