//! HTTP transport for an OpenAI-compatible API.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use tracing::{debug, info, warn};

use super::{GeneratedImage, GenerationService, SourceImage};
use crate::config::ServiceConfig;
use crate::errors::{ChainError, ClientBuildError, RemoteError, RemoteOperation};

/// Longest prompt the image endpoint accepts, in characters.
const MAX_PROMPT_CHARS: usize = 4000;

/// How the underlying HTTP client treats proxy settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Proxy settings from the environment are honoured.
    Environment,
    /// All proxies are bypassed.
    Disabled,
}

impl fmt::Display for ProxyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Environment => write!(f, "environment"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Builds a client with the default configuration, falling back once to a
/// proxy-disabled configuration if the first build fails.
pub fn with_proxy_fallback<T, E, F>(build: F) -> Result<(T, ProxyMode), ClientBuildError>
where
    F: Fn(ProxyMode) -> Result<T, E>,
    E: fmt::Display,
{
    let default_error = match build(ProxyMode::Environment) {
        Ok(client) => return Ok((client, ProxyMode::Environment)),
        Err(err) => err.to_string(),
    };

    warn!(error = %default_error, "Default client construction failed, retrying without proxy");

    match build(ProxyMode::Disabled) {
        Ok(client) => Ok((client, ProxyMode::Disabled)),
        Err(err) => Err(ClientBuildError {
            default_error,
            fallback_error: err.to_string(),
        }),
    }
}

/// Maps a non-success HTTP status to a remote error.
#[must_use]
pub fn classify_status(operation: RemoteOperation, status: u16, body: &str) -> RemoteError {
    let message = format!("HTTP {status}: {}", body.trim());
    match status {
        408 | 409 | 429 | 500..=599 => RemoteError::transient(operation, message),
        _ => RemoteError::permanent(operation, message),
    }
}

fn transport_error(operation: RemoteOperation, err: &reqwest::Error) -> RemoteError {
    if err.is_decode() || err.is_builder() || err.is_redirect() {
        RemoteError::permanent(operation, err.to_string())
    } else {
        RemoteError::transient(operation, err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ImagePayload {
    Inline(Vec<u8>),
    Remote(String),
}

fn description_from(response: ChatResponse) -> Result<String, RemoteError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| RemoteError::permanent(RemoteOperation::Analyze, "response carried no description"))
}

fn payload_from(response: ImagesResponse) -> Result<ImagePayload, RemoteError> {
    let datum = response
        .data
        .into_iter()
        .next()
        .ok_or_else(|| RemoteError::permanent(RemoteOperation::Synthesize, "response carried no image"))?;

    if let Some(encoded) = datum.b64_json.filter(|b| !b.is_empty()) {
        let bytes = STANDARD.decode(encoded.as_bytes()).map_err(|err| {
            RemoteError::permanent(RemoteOperation::Synthesize, format!("invalid base64 image: {err}"))
        })?;
        return Ok(ImagePayload::Inline(bytes));
    }
    datum
        .url
        .filter(|u| !u.is_empty())
        .map(ImagePayload::Remote)
        .ok_or_else(|| RemoteError::permanent(RemoteOperation::Synthesize, "image entry has neither data nor url"))
}

fn truncate_prompt(prompt: &str) -> String {
    prompt.chars().take(MAX_PROMPT_CHARS).collect()
}

/// [`GenerationService`] over HTTPS with bearer authentication.
pub struct HttpGenerationClient {
    http: reqwest::Client,
    config: ServiceConfig,
    api_key: String,
    proxy_mode: ProxyMode,
}

impl fmt::Debug for HttpGenerationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGenerationClient")
            .field("base_url", &self.config.base_url)
            .field("proxy_mode", &self.proxy_mode)
            .finish_non_exhaustive()
    }
}

impl HttpGenerationClient {
    /// Resolves the credential and builds the HTTP client.
    pub fn connect(config: ServiceConfig) -> Result<Self, ChainError> {
        let api_key = config.resolve_api_key()?;
        let timeout = config.request_timeout();

        let (http, proxy_mode) = with_proxy_fallback(|mode| {
            let mut builder = reqwest::Client::builder().timeout(timeout);
            if mode == ProxyMode::Disabled {
                builder = builder.no_proxy();
            }
            builder.build()
        })?;

        info!(base_url = %config.base_url, proxy = %proxy_mode, "Remote generation client ready");
        Ok(Self {
            http,
            config,
            api_key,
            proxy_mode,
        })
    }

    /// Proxy mode chosen at construction.
    #[must_use]
    pub fn proxy_mode(&self) -> ProxyMode {
        self.proxy_mode
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn ensure_success(
        operation: RemoteOperation,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(operation, status.as_u16(), &body))
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        operation: RemoteOperation,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, RemoteError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|err| transport_error(operation, &err))?;

        Self::ensure_success(operation, response)
            .await?
            .json::<T>()
            .await
            .map_err(|err| transport_error(operation, &err))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let op = RemoteOperation::Synthesize;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| transport_error(op, &err))?;
        let bytes = Self::ensure_success(op, response)
            .await?
            .bytes()
            .await
            .map_err(|err| transport_error(op, &err))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait::async_trait]
impl GenerationService for HttpGenerationClient {
    async fn analyze(&self, image: &SourceImage, instruction: &str) -> Result<String, RemoteError> {
        let data_url = format!("data:{};base64,{}", image.mime, STANDARD.encode(&image.bytes));
        let body = json!({
            "model": self.config.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": instruction },
                    { "type": "image_url", "image_url": { "url": data_url } },
                ],
            }],
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
        });

        debug!(image = %image.file_name(), bytes = image.bytes.len(), "Requesting analysis");
        let response: ChatResponse = self
            .post_json(RemoteOperation::Analyze, "chat/completions", &body)
            .await?;
        description_from(response)
    }

    async fn synthesize(&self, prompt: &str) -> Result<GeneratedImage, RemoteError> {
        let body = json!({
            "model": self.config.image_model,
            "prompt": truncate_prompt(prompt),
            "size": self.config.image_size,
            "quality": self.config.image_quality,
            "n": 1,
            "response_format": "b64_json",
        });

        debug!(prompt_chars = prompt.chars().count(), "Requesting synthesis");
        let response: ImagesResponse = self
            .post_json(RemoteOperation::Synthesize, "images/generations", &body)
            .await?;

        let bytes = match payload_from(response)? {
            ImagePayload::Inline(bytes) => bytes,
            ImagePayload::Remote(url) => self.download(&url).await?,
        };
        if bytes.is_empty() {
            return Err(RemoteError::permanent(RemoteOperation::Synthesize, "empty image payload"));
        }
        Ok(GeneratedImage::png(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;

    #[test]
    fn test_classify_status() {
        for status in [408, 409, 429, 500, 502, 503] {
            assert!(classify_status(RemoteOperation::Analyze, status, "").is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 422] {
            assert!(!classify_status(RemoteOperation::Analyze, status, "").is_retryable(), "{status}");
        }
        let err = classify_status(RemoteOperation::Synthesize, 401, " invalid api key \n");
        assert_eq!(err.message(), "HTTP 401: invalid api key");
    }

    #[test]
    fn test_proxy_fallback_prefers_default() {
        let calls = Cell::new(0);
        let (client, mode) = with_proxy_fallback(|mode| {
            calls.set(calls.get() + 1);
            Ok::<_, String>(mode)
        })
        .unwrap();
        assert_eq!((client, mode), (ProxyMode::Environment, ProxyMode::Environment));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_proxy_fallback_retries_once_without_proxy() {
        let calls = Cell::new(0);
        let (_, mode) = with_proxy_fallback(|mode| {
            calls.set(calls.get() + 1);
            match mode {
                ProxyMode::Environment => Err("unexpected keyword argument 'proxies'"),
                ProxyMode::Disabled => Ok(()),
            }
        })
        .unwrap();
        assert_eq!(mode, ProxyMode::Disabled);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_proxy_fallback_reports_both_failures() {
        let err = with_proxy_fallback(|mode| Err::<(), _>(format!("{mode} failed"))).unwrap_err();
        assert_eq!(err.default_error, "environment failed");
        assert_eq!(err.fallback_error, "disabled failed");
    }

    #[test]
    fn test_description_from_response() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{ "message": { "content": "  A red barn.  " } }]
        }))
        .unwrap();
        assert_eq!(description_from(response).unwrap(), "A red barn.");

        let empty: ChatResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(!description_from(empty).unwrap_err().is_retryable());
    }

    #[test]
    fn test_payload_from_response() {
        let inline: ImagesResponse = serde_json::from_value(json!({
            "data": [{ "b64_json": STANDARD.encode(b"png-bytes") }]
        }))
        .unwrap();
        assert_eq!(payload_from(inline).unwrap(), ImagePayload::Inline(b"png-bytes".to_vec()));

        let remote: ImagesResponse = serde_json::from_value(json!({
            "data": [{ "url": "https://cdn.example.com/x.png" }]
        }))
        .unwrap();
        assert_eq!(
            payload_from(remote).unwrap(),
            ImagePayload::Remote("https://cdn.example.com/x.png".to_string())
        );

        let broken: ImagesResponse =
            serde_json::from_value(json!({ "data": [{ "b64_json": "***" }] })).unwrap();
        assert!(payload_from(broken).is_err());
    }

    #[test]
    fn test_prompt_truncation() {
        let long = "x".repeat(MAX_PROMPT_CHARS + 10);
        assert_eq!(truncate_prompt(&long).len(), MAX_PROMPT_CHARS);
        assert_eq!(truncate_prompt("short"), "short");
    }

    #[test]
    fn test_connect_requires_credential() {
        let config = ServiceConfig::default().with_api_key_env("EVOCHAIN_HTTP_TEST_MISSING_KEY");
        let err = HttpGenerationClient::connect(config).unwrap_err();
        assert!(matches!(err, ChainError::Config(_)));
    }

    #[test]
    fn test_connect_and_endpoint() {
        std::env::set_var("EVOCHAIN_HTTP_TEST_KEY", "sk-test");
        let config = ServiceConfig::default()
            .with_api_key_env("EVOCHAIN_HTTP_TEST_KEY")
            .with_base_url("http://localhost:9999/v1/");
        let client = HttpGenerationClient::connect(config).unwrap();
        assert_eq!(client.endpoint("chat/completions"), "http://localhost:9999/v1/chat/completions");
    }
}
