//! Model functions that render a role prompt and call a backend.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::StreamExt;
use tracing::{debug, instrument, warn};

use crate::cancel::is_cancellation;
use crate::core::model_output::extract_json;
use crate::io::backend::{GenerationRequest, InvocationBackend};
use crate::io::config::FunctionSettings;
use crate::io::model::{
    ChunkStream, FunctionChunk, FunctionOutput, FunctionRole, InvocationContext, ModelFunction,
};
use crate::io::prompt::PromptBuilder;

/// A [`ModelFunction`] for one role, backed by any [`InvocationBackend`]
/// (typically a [`crate::io::resilient::ResilientBackend`]).
pub struct PromptedFunction {
    role: FunctionRole,
    backend: Arc<dyn InvocationBackend>,
    settings: FunctionSettings,
    prompts: PromptBuilder,
}

impl PromptedFunction {
    pub fn new(
        role: FunctionRole,
        backend: Arc<dyn InvocationBackend>,
        settings: FunctionSettings,
    ) -> Result<Self> {
        let prompts = PromptBuilder::new(settings.prompt_budget_bytes)?;
        Ok(Self {
            role,
            backend,
            settings,
            prompts,
        })
    }

    /// One function per role, all sharing `backend`.
    pub fn all_roles(
        backend: Arc<dyn InvocationBackend>,
        settings: &FunctionSettings,
    ) -> Result<Vec<Arc<dyn ModelFunction>>> {
        FunctionRole::ALL
            .into_iter()
            .map(|role| {
                let function = Self::new(role, Arc::clone(&backend), settings.clone())?;
                Ok(Arc::new(function) as Arc<dyn ModelFunction>)
            })
            .collect()
    }

    fn request(&self, context: &InvocationContext) -> Result<GenerationRequest> {
        let prompt = self.prompts.build(self.role, context)?;
        Ok(GenerationRequest {
            model: self.settings.model.clone(),
            system: None,
            prompt,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        })
    }
}

#[async_trait]
impl ModelFunction for PromptedFunction {
    fn role(&self) -> FunctionRole {
        self.role
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Backend failures become an unsuccessful output; only cancellation
    /// and prompt rendering errors surface as `Err`.
    #[instrument(skip_all, fields(role = %self.role, backend = self.backend.name()))]
    async fn execute(&self, context: &InvocationContext) -> Result<FunctionOutput> {
        let request = self.request(context)?;
        debug!(prompt_bytes = request.prompt.len(), "invoking backend");
        match self.backend.generate(&request).await {
            Ok(reply) => Ok(FunctionOutput::from_reply(reply)),
            Err(err) if is_cancellation(&err) => Err(err),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "model function failed");
                Ok(FunctionOutput::failure(format!("{} failed: {err:#}", self.role)))
            }
        }
    }

    async fn execute_stream(&self, context: &InvocationContext) -> Result<ChunkStream> {
        let request = self.request(context)?;
        let mut pieces = self.backend.generate_stream(&request).await?;
        let stream = async_stream::try_stream! {
            let mut raw = String::new();
            while let Some(piece) = pieces.next().await {
                let piece = piece?;
                raw.push_str(&piece);
                yield FunctionChunk::partial(piece);
            }
            yield FunctionChunk::last(extract_json(&raw));
        };
        Ok(stream.boxed())
    }
}
