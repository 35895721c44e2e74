use std::time::Duration;

use async_trait::async_trait;

use super::{ChunkStream, Provider, ProviderConfig};
use crate::types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::{GatewayError, Result};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Shared adapter for every OpenAI-compatible endpoint. The named
/// constructors only vary identification headers and key defaults.
#[derive(Clone)]
pub struct OpenAiLike {
    name: &'static str,
    http: reqwest::Client,
    static_headers: &'static [(&'static str, &'static str)],
    fallback_api_key: Option<&'static str>,
}

impl OpenAiLike {
    pub fn openrouter(http: reqwest::Client) -> Self {
        Self {
            name: "openrouter",
            http,
            static_headers: &[
                ("HTTP-Referer", "https://openfive.dev"),
                ("X-Title", "OpenFive Gateway"),
            ],
            fallback_api_key: None,
        }
    }

    /// Ollama serves the OpenAI surface at /v1 and wants a dummy key.
    pub fn ollama(http: reqwest::Client) -> Self {
        Self {
            name: "ollama",
            http,
            static_headers: &[],
            fallback_api_key: Some("ollama"),
        }
    }

    pub fn openai_compatible(http: reqwest::Client) -> Self {
        Self {
            name: "openai_compatible",
            http,
            static_headers: &[],
            fallback_api_key: None,
        }
    }

    fn chat_completions_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{base}/chat/completions")
        }
    }

    fn request_builder(
        &self,
        cfg: &ProviderConfig,
        body: &ChatCompletionRequest,
    ) -> reqwest::RequestBuilder {
        let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut builder = self
            .http
            .post(self.chat_completions_url(&cfg.base_url))
            .timeout(timeout)
            .json(body);

        let api_key = if cfg.api_key.is_empty() {
            self.fallback_api_key.unwrap_or("")
        } else {
            cfg.api_key.as_str()
        };
        if !api_key.is_empty() {
            builder = builder.bearer_auth(api_key);
        }

        for (name, value) in self.static_headers {
            builder = builder.header(*name, *value);
        }
        for (name, value) in &cfg.headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

fn map_transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::ProviderTimeout(err.to_string())
    } else {
        GatewayError::ProviderConnect(err.to_string())
    }
}

async fn fail_on_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::ProviderHttp {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Provider for OpenAiLike {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn send(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChatCompletionResponse> {
        let response = self
            .request_builder(cfg, req)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = fail_on_status(response).await?;

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|err| GatewayError::InvalidResponse(format!("decode response: {err}")))
    }

    async fn send_stream(
        &self,
        req: &ChatCompletionRequest,
        cfg: &ProviderConfig,
    ) -> Result<ChunkStream> {
        let mut stream_req = req.clone();
        stream_req.stream = true;

        let response = self
            .request_builder(cfg, &stream_req)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = fail_on_status(response).await?;

        Ok(ChunkStream::from_response(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_tolerates_trailing_slash_and_full_paths() {
        let provider = OpenAiLike::openai_compatible(reqwest::Client::new());
        assert_eq!(
            provider.chat_completions_url("https://api.example.com/v1"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            provider.chat_completions_url("https://api.example.com/v1/"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            provider.chat_completions_url("https://api.example.com/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn adapters_carry_their_registry_names() {
        let client = reqwest::Client::new();
        assert_eq!(OpenAiLike::openrouter(client.clone()).name(), "openrouter");
        assert_eq!(OpenAiLike::ollama(client.clone()).name(), "ollama");
        assert_eq!(
            OpenAiLike::openai_compatible(client).name(),
            "openai_compatible"
        );
    }
}
