//! Provider capability trait — the contract every backend adapter satisfies.
//!
//! The facade only ever talks to a `dyn ProviderAdapter`; everything
//! backend-specific (wire format, auth, model provisioning) stays behind it.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use lcm_core::config::ResolvedConfig;
use lcm_core::{HealthStatus, Prompt, Result};

use crate::registry::ProviderKind;

/// Lazy, finite, ordered sequence of text fragments.
///
/// Dropping the stream releases the underlying connection.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Trait that all provider adapters must implement.
///
/// Implementations must be safe for concurrent independent calls and must
/// translate backend failures into [`lcm_core::LcmError`] kinds.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which dispatch variant this adapter implements.
    fn kind(&self) -> ProviderKind;

    /// Display name for logging.
    fn display_name(&self) -> &str;

    /// Start a generation and return its fragments.
    ///
    /// Resolves once the backend has accepted the request; fragments are
    /// then read lazily as the caller polls the stream.
    async fn do_chat(&self, prompt: &Prompt, config: &ResolvedConfig) -> Result<TokenStream>;

    /// Embed `text` into one vector.
    async fn do_embed(&self, text: &str, config: &ResolvedConfig) -> Result<Vec<f32>>;

    /// Probe the backend. Callers fold an `Err` into an unreachable status.
    async fn do_health(&self, config: &ResolvedConfig) -> Result<HealthStatus>;

    /// Make sure the configured model is available before generating.
    ///
    /// Backends without on-demand provisioning keep the default no-op.
    async fn provision(&self, _config: &ResolvedConfig) -> Result<()> {
        Ok(())
    }
}
