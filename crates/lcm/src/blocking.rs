//! Synchronous wrapper over the async [`Model`] surface.

use futures_util::StreamExt;
use tokio::runtime::Runtime;

use lcm_core::config::Overrides;
use lcm_core::{HealthStatus, Prompt, Result};
use lcm_providers::traits::TokenStream;

use crate::model::Model;

/// Blocking view of a [`Model`], obtained from [`Model::blocking`].
///
/// Each method runs the async counterpart to completion on the model's
/// runtime.
pub struct BlockingModel<'a> {
    model: &'a Model,
    runtime: &'a Runtime,
}

impl<'a> BlockingModel<'a> {
    pub(crate) fn new(model: &'a Model, runtime: &'a Runtime) -> Self {
        Self { model, runtime }
    }

    pub fn chat(&self, prompt: impl Into<Prompt>) -> Result<String> {
        self.runtime.block_on(self.model.chat(prompt))
    }

    pub fn chat_with(&self, prompt: impl Into<Prompt>, overrides: &Overrides) -> Result<String> {
        self.runtime.block_on(self.model.chat_with(prompt, overrides))
    }

    pub fn stream(&self, prompt: impl Into<Prompt>) -> Result<BlockingTokenStream<'a>> {
        self.stream_with(prompt, &Overrides::new())
    }

    pub fn stream_with(
        &self,
        prompt: impl Into<Prompt>,
        overrides: &Overrides,
    ) -> Result<BlockingTokenStream<'a>> {
        let stream = self
            .runtime
            .block_on(self.model.stream_with(prompt, overrides))?;
        Ok(BlockingTokenStream {
            stream,
            runtime: self.runtime,
        })
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.runtime.block_on(self.model.embed(text))
    }

    pub fn embed_with(&self, text: &str, overrides: &Overrides) -> Result<Vec<f32>> {
        self.runtime.block_on(self.model.embed_with(text, overrides))
    }

    pub fn health(&self) -> HealthStatus {
        self.runtime.block_on(self.model.health())
    }

    pub fn provision(&self) -> Result<()> {
        self.runtime.block_on(self.model.provision())
    }
}

/// Iterator over the fragments of one generation.
///
/// Dropping it drops the underlying stream and its connection.
pub struct BlockingTokenStream<'a> {
    stream: TokenStream,
    runtime: &'a Runtime,
}

impl Iterator for BlockingTokenStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}
