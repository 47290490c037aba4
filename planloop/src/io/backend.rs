//! Model invocation backends.
//!
//! A backend turns a prompt into text. Vendor clients live outside this crate;
//! they implement [`InvocationBackend`] and are composed through
//! [`crate::io::resilient::ResilientBackend`].

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::heuristics::estimate_tokens;
use crate::core::model_output::extract_json;

/// One generation call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: Option<String>,
    pub system: Option<String>,
    pub prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }
}

pub type TextStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait InvocationBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;

    /// Defaults to a single piece holding the whole reply.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let text = self.generate(request).await?;
        Ok(stream::iter(vec![Ok(text)]).boxed())
    }

    /// Defaults to plain generation mined for JSON. The schema is advisory.
    async fn generate_structured(&self, request: &GenerationRequest, _schema: &Value) -> Result<Value> {
        let text = self.generate(request).await?;
        extract_json(&text).ok_or_else(|| anyhow!("{} returned no JSON", self.name()))
    }

    /// Defaults to the local estimate.
    async fn count_tokens(&self, text: &str) -> Result<usize> {
        Ok(estimate_tokens(text))
    }

    async fn is_available(&self) -> bool {
        true
    }
}
