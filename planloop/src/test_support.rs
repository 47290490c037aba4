//! Scripted collaborators for tests.
//!
//! Each fake replays a fixed script and records what it was called with.
//! Scripts are sticky: once one entry is left it is returned forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::cancel::Cancelled;
use crate::io::backend::{GenerationRequest, InvocationBackend, TextStream};
use crate::io::model::{
    ChunkStream, FunctionChunk, FunctionOutput, FunctionRole, InvocationContext, ModelFunction,
};
use crate::io::registry::InMemoryRegistry;
use crate::io::tool::{Tool, ToolContract, ToolOutput};

fn next_sticky<T: Clone>(script: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut script = script.lock().unwrap_or_else(PoisonError::into_inner);
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

type Handler = Box<dyn Fn(&Value) -> Result<ToolOutput> + Send + Sync>;

/// Tool whose behavior is a closure over its input.
pub struct ScriptedTool {
    name: String,
    contract: ToolContract,
    handler: Handler,
    inputs: Mutex<Vec<Value>>,
}

impl ScriptedTool {
    pub fn new(
        name: &str,
        handler: impl Fn(&Value) -> Result<ToolOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            contract: ToolContract::default(),
            handler: Box::new(handler),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Always succeeds with `data`.
    pub fn returning(name: &str, data: Value) -> Self {
        Self::new(name, move |_| Ok(ToolOutput::success(data.clone())))
    }

    /// Succeeds with its own input.
    pub fn echo(name: &str) -> Self {
        Self::new(name, |input| {
            Ok(match input {
                Value::Null => ToolOutput::empty(),
                other => ToolOutput::success(other.clone()),
            })
        })
    }

    /// Reports failure through its output.
    pub fn failing(name: &str, error: &str) -> Self {
        let error = error.to_string();
        Self::new(name, move |_| Ok(ToolOutput::failure(error.clone())))
    }

    /// Returns `Err` instead of an output.
    pub fn erroring(name: &str, error: &str) -> Self {
        let error = error.to_string();
        Self::new(name, move |_| Err(anyhow!("{error}")))
    }

    pub fn described(mut self, description: &str) -> Self {
        self.contract.description = description.to_string();
        self
    }

    /// Mark parameters as required, optionally with a schema.
    pub fn requiring(mut self, schema: Option<Value>) -> Self {
        self.contract.requires_parameters = true;
        self.contract.input_schema = schema;
        self
    }

    pub fn inputs(&self) -> Vec<Value> {
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Tool for ScriptedTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract(&self) -> ToolContract {
        self.contract.clone()
    }

    async fn execute(&self, input: Value) -> Result<ToolOutput> {
        let output = (self.handler)(&input);
        self.inputs.lock().unwrap_or_else(PoisonError::into_inner).push(input);
        output
    }
}

/// Model function replaying a list of outputs.
pub struct ScriptedFunction {
    role: FunctionRole,
    outputs: Mutex<VecDeque<FunctionOutput>>,
    chunks: Option<Vec<String>>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<InvocationContext>>,
}

impl ScriptedFunction {
    pub fn new(role: FunctionRole, outputs: Vec<FunctionOutput>) -> Self {
        Self {
            role,
            outputs: Mutex::new(outputs.into()),
            chunks: None,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    /// Plain-text reply.
    pub fn text(role: FunctionRole, reply: &str) -> Self {
        Self::new(role, vec![FunctionOutput::from_reply(reply)])
    }

    /// Structured reply.
    pub fn json(role: FunctionRole, value: Value) -> Self {
        Self::new(role, vec![FunctionOutput::structured(value)])
    }

    /// Structured replies in order, the last one repeating.
    pub fn sequence(role: FunctionRole, values: Vec<Value>) -> Self {
        Self::new(role, values.into_iter().map(FunctionOutput::structured).collect())
    }

    pub fn failing(role: FunctionRole, error: &str) -> Self {
        Self::new(role, vec![FunctionOutput::failure(error)])
    }

    /// Advertise streaming and emit these pieces before the final chunk.
    pub fn streaming(mut self, pieces: &[&str]) -> Self {
        self.chunks = Some(pieces.iter().map(|piece| piece.to_string()).collect());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<InvocationContext> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, context: &InvocationContext) -> FunctionOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(context.clone());
        next_sticky(&self.outputs).unwrap_or_else(|| FunctionOutput::failure("no output scripted"))
    }
}

#[async_trait]
impl ModelFunction for ScriptedFunction {
    fn role(&self) -> FunctionRole {
        self.role
    }

    fn supports_streaming(&self) -> bool {
        self.chunks.is_some()
    }

    async fn execute(&self, context: &InvocationContext) -> Result<FunctionOutput> {
        Ok(self.record(context))
    }

    async fn execute_stream(&self, context: &InvocationContext) -> Result<ChunkStream> {
        let output = self.record(context);
        let mut chunks: Vec<Result<FunctionChunk>> = self
            .chunks
            .iter()
            .flatten()
            .map(|piece| Ok(FunctionChunk::partial(piece.clone())))
            .collect();
        chunks.push(Ok(FunctionChunk::last(output.parsed)));
        Ok(stream::iter(chunks).boxed())
    }
}

#[derive(Clone)]
enum Reply {
    Text(String),
    Fail(String),
    Cancel,
}

/// Backend replaying a script of replies and failures.
pub struct ScriptedBackend {
    name: String,
    replies: Mutex<VecDeque<Reply>>,
    models: Option<Vec<String>>,
    token_count: Option<usize>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn with_script(name: &str, replies: Vec<Reply>) -> Self {
        Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            models: None,
            token_count: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(name: &str, reply: &str) -> Self {
        Self::with_script(name, vec![Reply::Text(reply.to_string())])
    }

    pub fn failing(name: &str) -> Self {
        Self::with_script(name, vec![Reply::Fail(format!("{name} is down"))])
    }

    /// Fails `failures` times, then replies forever.
    pub fn flaky(name: &str, failures: usize, reply: &str) -> Self {
        let mut script = vec![Reply::Fail(format!("{name} hiccup")); failures];
        script.push(Reply::Text(reply.to_string()));
        Self::with_script(name, script)
    }

    /// Reports the call as cancelled.
    pub fn cancelled(name: &str) -> Self {
        Self::with_script(name, vec![Reply::Cancel])
    }

    pub fn with_models(mut self, models: &[&str]) -> Self {
        self.models = Some(models.iter().map(|model| model.to_string()).collect());
        self
    }

    /// Without a count, `count_tokens` fails.
    pub fn with_token_count(mut self, count: usize) -> Self {
        self.token_count = Some(count);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    fn next_reply(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.prompt.clone());
        match next_sticky(&self.replies) {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(error)) => Err(anyhow!("{error}")),
            Some(Reply::Cancel) => Err(anyhow::Error::new(Cancelled)),
            None => Err(anyhow!("{} has no reply scripted", self.name)),
        }
    }
}

#[async_trait]
impl InvocationBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_model(&self, model: &str) -> bool {
        self.models
            .as_ref()
            .is_none_or(|models| models.iter().any(|m| m == model))
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.next_reply(request)
    }

    /// Streams the reply one word at a time.
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let text = self.next_reply(request)?;
        let pieces: Vec<Result<String>> = text
            .split_inclusive(' ')
            .map(|piece| Ok(piece.to_string()))
            .collect();
        Ok(stream::iter(pieces).boxed())
    }

    async fn count_tokens(&self, _text: &str) -> Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.token_count
            .ok_or_else(|| anyhow!("{} cannot count tokens", self.name))
    }
}

/// Registry holding the given tools and functions.
pub fn registry(tools: Vec<Arc<dyn Tool>>, functions: Vec<Arc<dyn ModelFunction>>) -> Arc<InMemoryRegistry> {
    let registry = InMemoryRegistry::new();
    for tool in tools {
        registry.register_tool(tool);
    }
    for function in functions {
        registry.register_function(function);
    }
    Arc::new(registry)
}
