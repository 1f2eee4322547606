use crate::error::{CrosstalkError, Result};
use crate::llm::models::Provider;
use crate::llm::streaming::RawEvent;
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::{Map, Value};
use std::pin::Pin;

/// Request parameters shared by every provider.
///
/// Anything vendor-specific that is not modelled here goes into `extra`, which is merged into the
/// top level of the request body verbatim.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub system_prompt: Option<String>,
    pub stream: bool,
    pub extra: Map<String, Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_tokens: 16384,
            temperature: 1.0,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            system_prompt: None,
            stream: false,
            extra: Map::new(),
        }
    }
}

impl RequestOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Pass a vendor parameter through untouched.
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Reject settings no provider accepts. Called before any request body is built.
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(CrosstalkError::ConfigError("max_tokens must be at least 1".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(CrosstalkError::ConfigError(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            )));
        }
        if let Some(top_p) = self.top_p {
            if !(top_p > 0.0 && top_p <= 1.0) {
                return Err(CrosstalkError::ConfigError(format!("top_p {} is outside (0, 1]", top_p)));
            }
        }
        Ok(())
    }

    /// Merge `extra` into a request body; explicit extras win over generated keys.
    pub(crate) fn apply_extra(&self, body: &mut Value) {
        if let Some(object) = body.as_object_mut() {
            for (key, value) in &self.extra {
                object.insert(key.clone(), value.clone());
            }
        }
    }
}

/// HTTP/SSE collaborator that actually talks to a provider.
///
/// Retries, timeouts and credentials are the implementor's business; this crate hands it a
/// finished request body and consumes what comes back.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a non-streaming request and return the raw response body.
    async fn send(&self, provider: Provider, model: &str, body: Value) -> Result<Vec<u8>>;

    /// Send a streaming request and yield its framed events in order.
    fn stream<'a>(
        &'a self,
        provider: Provider,
        model: &'a str,
        body: Value,
    ) -> Pin<Box<dyn Stream<Item = Result<RawEvent>> + Send + 'a>>;
}
