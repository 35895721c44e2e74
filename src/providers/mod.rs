//! Upstream LLM providers. All implementations speak the OpenAI-compatible
//! chat-completions wire format; they differ only in name, default headers,
//! and key handling, so they share one HTTP adapter and one client.

mod openai_like;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt as _, TryStreamExt as _};
use tokio::io::{AsyncBufRead, BufReader};
use tokio_util::io::StreamReader;

use crate::sse;
use crate::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::Result;

pub use openai_like::OpenAiLike;

/// Per-request provider configuration, resolved (and unsealed) by the
/// orchestrator.
#[derive(Clone, Default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("headers", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChatCompletionResponse>;

    async fn send_stream(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChunkStream>;
}

/// Pull reader over an upstream SSE body. `next` yields decoded chunks,
/// skipping malformed payloads; `None` means `[DONE]` or EOF. Dropping the
/// reader releases the body and aborts an in-flight read.
pub struct ChunkStream {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    scratch: Vec<u8>,
    done: bool,
}

impl ChunkStream {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncBufRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            scratch: Vec::new(),
            done: false,
        }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        let bytes = response.bytes_stream().map_err(std::io::Error::other).boxed();
        Self::from_reader(BufReader::new(StreamReader::new(bytes)))
    }

    pub async fn next(&mut self) -> Result<Option<ChatCompletionChunk>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(payload) = sse::next_data_payload(&mut self.reader, &mut self.scratch).await?
            else {
                self.done = true;
                return Ok(None);
            };
            match serde_json::from_str::<ChatCompletionChunk>(&payload) {
                Ok(chunk) => return Ok(Some(chunk)),
                Err(_) => continue, // skip malformed chunks
            }
        }
    }
}

/// Maps `provider_type` names to implementations. The registry owns the
/// providers; callers borrow them per request.
#[derive(Default)]
pub struct Registry {
    providers: HashMap<&'static str, Arc<dyn Provider>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three stock adapters over one shared client.
    pub fn with_defaults(client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(OpenAiLike::openrouter(client.clone())));
        registry.register(Arc::new(OpenAiLike::ollama(client.clone())));
        registry.register(Arc::new(OpenAiLike::openai_compatible(client)));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }
}
