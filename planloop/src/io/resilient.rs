//! Ordered failover across backends with a circuit breaker per backend.
//!
//! Each operation walks the backends in priority order, skipping any whose
//! breaker is open, and returns the first success. A failure counts against
//! that backend's breaker; enough consecutive failures open it until the
//! policy timeout elapses. Cancellation is never counted as a failure and
//! ends the walk immediately.
//!
//! Breaker state lives behind a `std::sync::Mutex` that is only held for
//! bookkeeping, never across an `.await`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::cancel::is_cancellation;
use crate::core::circuit::{BreakerPolicy, CircuitState};
use crate::core::heuristics::estimate_tokens;
use crate::io::backend::{GenerationRequest, InvocationBackend, TextStream};

/// Why a resilient call produced no result.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("no backend available for {operation} (tried: {})", backends.join(", "))]
    NoneAvailable {
        operation: &'static str,
        backends: Vec<String>,
    },
    #[error("all backends failed for {operation} (attempted: {})", attempted.join(", "))]
    Exhausted {
        operation: &'static str,
        attempted: Vec<String>,
        #[source]
        last: anyhow::Error,
    },
}

/// Point-in-time view of one backend's breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub backend: String,
    pub is_open: bool,
    pub failure_count: u32,
}

type Breakers = Arc<Mutex<HashMap<String, CircuitState>>>;

pub struct ResilientBackend {
    name: String,
    backends: Vec<Arc<dyn InvocationBackend>>,
    policy: BreakerPolicy,
    breakers: Breakers,
}

impl ResilientBackend {
    /// Compose backends in priority order. At least one is required.
    pub fn new(backends: Vec<Arc<dyn InvocationBackend>>, policy: BreakerPolicy) -> Result<Self> {
        if backends.is_empty() {
            anyhow::bail!("resilient backend requires at least one backend");
        }
        let name = format!(
            "resilient({})",
            backends
                .iter()
                .map(|backend| backend.name())
                .collect::<Vec<_>>()
                .join(",")
        );
        let breakers = backends
            .iter()
            .map(|backend| (backend.name().to_string(), CircuitState::default()))
            .collect();
        Ok(Self {
            name,
            backends,
            policy,
            breakers: Arc::new(Mutex::new(breakers)),
        })
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Breaker state for every backend, in priority order.
    pub fn breaker_snapshot(&self) -> Vec<BreakerStatus> {
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        self.backends
            .iter()
            .map(|backend| {
                let state = breakers.get(backend.name()).cloned().unwrap_or_default();
                BreakerStatus {
                    backend: backend.name().to_string(),
                    is_open: state.is_open,
                    failure_count: state.failure_count,
                }
            })
            .collect()
    }

    /// Backends that support `model` and whose breaker admits a call now.
    fn eligible(&self, model: Option<&str>) -> Vec<Arc<dyn InvocationBackend>> {
        let now = Instant::now();
        let breakers = self.breakers.lock().unwrap_or_else(PoisonError::into_inner);
        self.backends
            .iter()
            .filter(|backend| model.is_none_or(|model| backend.supports_model(model)))
            .filter(|backend| {
                breakers
                    .get(backend.name())
                    .is_none_or(|state| state.is_available(&self.policy, now))
            })
            .cloned()
            .collect()
    }

    fn candidate_names(&self, model: Option<&str>) -> Vec<String> {
        self.backends
            .iter()
            .filter(|backend| model.is_none_or(|model| backend.supports_model(model)))
            .map(|backend| backend.name().to_string())
            .collect()
    }

    fn record_success(&self, backend: &str) {
        record_success(&self.breakers, backend);
    }

    fn record_failure(&self, backend: &str, err: &anyhow::Error) {
        record_failure(&self.breakers, &self.policy, backend, err);
    }

    /// Walk eligible backends until `call` succeeds.
    async fn attempt<T, F, Fut>(&self, operation: &'static str, model: Option<&str>, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn InvocationBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let eligible = self.eligible(model);
        if eligible.is_empty() {
            return Err(ProviderError::NoneAvailable {
                operation,
                backends: self.candidate_names(model),
            }
            .into());
        }

        let mut attempted = Vec::new();
        let mut last = None;
        for backend in eligible {
            let name = backend.name().to_string();
            match call(Arc::clone(&backend)).await {
                Ok(value) => {
                    self.record_success(&name);
                    return Ok(value);
                }
                Err(err) if is_cancellation(&err) => return Err(err),
                Err(err) => {
                    debug!(backend = %name, operation, error = %format!("{err:#}"), "backend call failed");
                    self.record_failure(&name, &err);
                    attempted.push(name);
                    last = Some(err);
                }
            }
        }
        match last {
            Some(last) => Err(ProviderError::Exhausted {
                operation,
                attempted,
                last,
            }
            .into()),
            None => Err(ProviderError::NoneAvailable {
                operation,
                backends: attempted,
            }
            .into()),
        }
    }
}

fn record_success(breakers: &Breakers, backend: &str) {
    let mut breakers = breakers.lock().unwrap_or_else(PoisonError::into_inner);
    breakers
        .entry(backend.to_string())
        .or_default()
        .record_success(Instant::now());
}

fn record_failure(breakers: &Breakers, policy: &BreakerPolicy, backend: &str, err: &anyhow::Error) {
    let mut breakers = breakers.lock().unwrap_or_else(PoisonError::into_inner);
    let state = breakers.entry(backend.to_string()).or_default();
    if state.record_failure(policy, Instant::now()) {
        warn!(
            backend,
            failures = state.failure_count,
            error = %format!("{err:#}"),
            "circuit breaker opened"
        );
    }
}

#[async_trait]
impl InvocationBackend for ResilientBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_model(&self, model: &str) -> bool {
        self.backends.iter().any(|backend| backend.supports_model(model))
    }

    #[instrument(skip_all, fields(backend = %self.name))]
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.attempt("generate", request.model.as_deref(), |backend| async move {
            backend.generate(request).await
        })
        .await
    }

    /// Fails over until one backend yields its first piece. Errors after
    /// that are counted against the serving backend and end the stream.
    #[instrument(skip_all, fields(backend = %self.name))]
    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TextStream> {
        let (served_by, opened) = self
            .attempt("generate_stream", request.model.as_deref(), |backend| async move {
                let mut inner = backend.generate_stream(request).await?;
                let first = match inner.next().await {
                    Some(Err(err)) => return Err(err),
                    Some(Ok(piece)) => Some(piece),
                    None => None,
                };
                let head = stream::iter(first.map(Ok));
                Ok((backend.name().to_string(), head.chain(inner).boxed()))
            })
            .await?;

        let breakers = Arc::clone(&self.breakers);
        let policy = self.policy;
        let tracked = opened.inspect(move |piece| {
            if let Err(err) = piece {
                if !is_cancellation(err) {
                    record_failure(&breakers, &policy, &served_by, err);
                }
            }
        });
        Ok(tracked.boxed())
    }

    #[instrument(skip_all, fields(backend = %self.name))]
    async fn generate_structured(&self, request: &GenerationRequest, schema: &Value) -> Result<Value> {
        self.attempt("generate_structured", request.model.as_deref(), |backend| async move {
            backend.generate_structured(request, schema).await
        })
        .await
    }

    /// Never fails: when no backend can count, the local estimate is used.
    async fn count_tokens(&self, text: &str) -> Result<usize> {
        for backend in self.eligible(None) {
            match backend.count_tokens(text).await {
                Ok(count) => {
                    self.record_success(backend.name());
                    return Ok(count);
                }
                Err(err) if is_cancellation(&err) => break,
                Err(err) => {
                    debug!(backend = backend.name(), error = %format!("{err:#}"), "token count failed");
                    self.record_failure(backend.name(), &err);
                }
            }
        }
        Ok(estimate_tokens(text))
    }

    async fn is_available(&self) -> bool {
        for backend in self.eligible(None) {
            if backend.is_available().await {
                return true;
            }
        }
        false
    }
}
