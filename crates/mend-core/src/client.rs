//! Model invocation layer.
//!
//! [`ModelClient`] issues single, streaming, and fan-out-parallel calls
//! against a chat-completions backend, consulting the response cache
//! before touching the network. Backend failures are normalized into
//! [`CoreError`] variants; a missing credential degrades to a documented
//! deterministic placeholder response so that control flow (and tests)
//! work without live credentials.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::cache::ResponseCache;
use crate::config::LlmConfig;
use crate::error::CoreError;
use crate::telemetry::Telemetry;

/// Placeholder content returned when no API key is configured.
///
/// Matches the shape downstream parsers expect, so credential-free runs
/// exercise real control flow instead of crashing.
const PLACEHOLDER_CONTENT: &str =
    r#"{"mode": "tool_request", "requests": [], "why": "placeholder - no API key configured"}"#;

/// One model response.
///
/// Immutable once constructed; created per call attempt and either
/// discarded by the caller or stored as a cache value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Raw response text (callers parse it as structured data).
    pub content: String,
    /// Model that produced the response.
    pub model: String,
    /// Sampling temperature of the request.
    pub temperature: f64,
    /// Prompt tokens consumed (0 if unknown).
    pub prompt_tokens: u64,
    /// Completion tokens produced (0 if unknown).
    pub completion_tokens: u64,
    /// Wall-clock latency of the call in milliseconds.
    pub latency_ms: f64,
    /// Whether this response was served from the cache.
    pub cached: bool,
}

// ── Wire types (chat-completions shape) ──────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

// ── Streaming handle ─────────────────────────────────────────

/// Handle for consuming a streaming model response.
///
/// A lazy, finite, non-restartable sequence of text chunks. The sequence
/// ends when the backend signals completion; a transport error surfaces as
/// an `Err` item and terminates the sequence rather than yielding partial
/// success silently.
#[derive(Debug)]
pub struct ChunkStream {
    /// Receiver for text chunks from the transport task.
    chunk_rx: tokio::sync::mpsc::Receiver<Result<String, CoreError>>,
}

impl ChunkStream {
    fn new(chunk_rx: tokio::sync::mpsc::Receiver<Result<String, CoreError>>) -> Self {
        Self { chunk_rx }
    }

    /// Get the next chunk, or `None` once the stream is complete.
    pub async fn next(&mut self) -> Option<Result<String, CoreError>> {
        self.chunk_rx.recv().await
    }

    /// Drain the stream into a single string.
    ///
    /// # Errors
    ///
    /// Returns the first transport error encountered.
    pub async fn collect(mut self) -> Result<String, CoreError> {
        let mut content = String::new();
        while let Some(chunk) = self.next().await {
            content.push_str(&chunk?);
        }
        Ok(content)
    }
}

// ── Model client ─────────────────────────────────────────────

/// Client for a chat-completions model backend.
///
/// Cheap to clone pieces are shared: the underlying `reqwest` client pools
/// connections, and the optional cache is behind an `Arc`. One instance is
/// created by the controller and shared with the outer loop.
#[derive(Debug, Clone)]
pub struct ModelClient {
    /// Shared HTTP client.
    http: reqwest::Client,
    /// Chat-completions base URL (no trailing slash).
    base_url: String,
    /// Model name sent with every request.
    model: String,
    /// API key, absent in placeholder mode.
    api_key: Option<String>,
    /// Per-request time budget.
    timeout: Duration,
    /// Response cache consulted by [`invoke_cached`](Self::invoke_cached).
    cache: Option<Arc<ResponseCache>>,
    /// Telemetry handle for call tracking.
    telemetry: Telemetry,
}

impl ModelClient {
    /// Create a client from configuration.
    ///
    /// The API key is read from the environment variable named by
    /// `config.api_key_env`; when absent the client runs in placeholder
    /// mode.
    pub fn new(config: &LlmConfig, cache: Option<Arc<ResponseCache>>, telemetry: Telemetry) -> Self {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(
                env = %config.api_key_env,
                "no API key configured, model calls return placeholder responses"
            );
        }

        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            model: config.model.clone(),
            api_key,
            timeout: Duration::from_secs(config.timeout_secs),
            cache,
            telemetry,
        }
    }

    /// Whether a live backend credential is configured.
    ///
    /// Without one, calls succeed with the deterministic placeholder
    /// response instead of touching the network.
    pub fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    /// Returns the configured model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one model call.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Backend` on a non-success status or transport
    /// failure, `CoreError::Timeout` when the call exceeds its budget.
    #[instrument(skip(self, prompt, system_prompt))]
    pub async fn invoke(
        &self,
        prompt: &str,
        temperature: f64,
        system_prompt: Option<&str>,
    ) -> Result<ModelResponse, CoreError> {
        let Some(api_key) = self.api_key.clone() else {
            return Ok(self.placeholder_response(temperature));
        };

        let request = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(prompt, system_prompt),
            temperature,
            response_format: Some(ResponseFormat {
                format_type: "json_object".to_owned(),
            }),
            stream: false,
        };

        let started = Instant::now();
        let result = self.send_chat(&api_key, &request).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok((content, usage)) => {
                let usage = usage.unwrap_or_default();
                self.telemetry.track_model_call(
                    &self.model,
                    "ok",
                    latency_ms,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                Ok(ModelResponse {
                    content,
                    model: self.model.clone(),
                    temperature,
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    latency_ms,
                    cached: false,
                })
            }
            Err(e) => {
                self.telemetry
                    .track_model_call(&self.model, "error", latency_ms, 0, 0);
                Err(e)
            }
        }
    }

    /// Send a non-streaming chat request and extract content plus usage.
    async fn send_chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
    ) -> Result<(String, Option<Usage>), CoreError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if !status.is_success() {
            return Err(CoreError::Backend(format!(
                "status {status}: {}",
                truncate(&body, 200)
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| CoreError::Backend(format!("malformed response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::Backend("response contained no choices".to_owned()))?;

        Ok((content, parsed.usage))
    }

    /// Issue one streaming model call.
    ///
    /// Returns a [`ChunkStream`] fed by a background task. In placeholder
    /// mode the stream yields the single placeholder chunk and ends.
    #[instrument(skip(self, prompt, system_prompt))]
    pub async fn invoke_streaming(
        &self,
        prompt: &str,
        temperature: f64,
        system_prompt: Option<&str>,
    ) -> ChunkStream {
        let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel(64);

        let Some(api_key) = self.api_key.clone() else {
            let _ = chunk_tx.send(Ok(PLACEHOLDER_CONTENT.to_owned())).await;
            return ChunkStream::new(chunk_rx);
        };

        let request = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(prompt, system_prompt),
            temperature,
            response_format: None,
            stream: true,
        };

        let client = self.clone();
        tokio::spawn(async move {
            if let Err(e) = client.stream_chat(&api_key, &request, &chunk_tx).await {
                let _ = chunk_tx.send(Err(e)).await;
            }
        });

        ChunkStream::new(chunk_rx)
    }

    /// Drive one SSE response, forwarding content deltas to `chunk_tx`.
    async fn stream_chat(
        &self,
        api_key: &str,
        request: &ChatRequest,
        chunk_tx: &tokio::sync::mpsc::Sender<Result<String, CoreError>>,
    ) -> Result<(), CoreError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Backend(format!(
                "status {status}: {}",
                truncate(&body, 200)
            )));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_transport_error(e))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE lines; a partial line stays buffered.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_owned();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    return Ok(());
                }

                let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                    debug!("skipping malformed stream chunk");
                    continue;
                };
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content
                        && !content.is_empty()
                        && chunk_tx.send(Ok(content)).await.is_err()
                    {
                        // Receiver dropped; stop reading the transport.
                        return Ok(());
                    }
                    if choice.finish_reason.is_some() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    /// Issue many calls concurrently, one per `(prompt, temperature)` pair.
    ///
    /// Every request resolves to either a response or a captured error --
    /// a failing call never cancels or corrupts its siblings -- and the
    /// result order matches the input order.
    #[instrument(skip(self, requests, system_prompt), fields(count = requests.len()))]
    pub async fn invoke_parallel(
        &self,
        requests: &[(String, f64)],
        system_prompt: Option<&str>,
    ) -> Vec<Result<ModelResponse, CoreError>> {
        let calls = requests
            .iter()
            .map(|(prompt, temperature)| self.invoke(prompt, *temperature, system_prompt));
        futures::future::join_all(calls).await
    }

    /// Issue one call through the response cache.
    ///
    /// With `use_cache` set and a cache configured, a hit returns
    /// immediately with `cached = true` and never touches the network. On
    /// a miss the live result is written back, unless it was itself a
    /// cache hit.
    ///
    /// # Errors
    ///
    /// Same as [`invoke`](Self::invoke); cache failures degrade to misses.
    #[instrument(skip(self, prompt, system_prompt))]
    pub async fn invoke_cached(
        &self,
        prompt: &str,
        temperature: f64,
        system_prompt: Option<&str>,
        use_cache: bool,
    ) -> Result<ModelResponse, CoreError> {
        let cache = self.cache.as_ref().filter(|_| use_cache);

        if let Some(cache) = cache
            && let Some(hit) = cache.get(prompt, &self.model, temperature)
        {
            debug!("response cache hit");
            return Ok(hit);
        }

        let response = self.invoke(prompt, temperature, system_prompt).await?;

        if let Some(cache) = cache
            && !response.cached
        {
            cache.set(prompt, &self.model, temperature, &response.content);
        }

        Ok(response)
    }

    /// The deterministic response served in placeholder mode.
    fn placeholder_response(&self, temperature: f64) -> ModelResponse {
        ModelResponse {
            content: PLACEHOLDER_CONTENT.to_owned(),
            model: self.model.clone(),
            temperature,
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0.0,
            cached: false,
        }
    }

    /// Normalize a reqwest error into the backend taxonomy.
    fn map_transport_error(&self, e: reqwest::Error) -> CoreError {
        if e.is_timeout() {
            CoreError::Timeout {
                seconds: self.timeout.as_secs(),
            }
        } else {
            CoreError::Backend(e.to_string())
        }
    }
}

/// Build the message list for one request.
fn build_messages(prompt: &str, system_prompt: Option<&str>) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = system_prompt {
        messages.push(ChatMessage {
            role: "system".to_owned(),
            content: system.to_owned(),
        });
    }
    messages.push(ChatMessage {
        role: "user".to_owned(),
        content: prompt.to_owned(),
    });
    messages
}

/// Truncate a string for error messages (char-boundary safe).
fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::config::CacheConfig;

    /// Config pointing at a key env var that is never set, so the client
    /// runs in placeholder mode.
    fn placeholder_config() -> LlmConfig {
        LlmConfig {
            api_key_env: "MEND_TEST_UNSET_KEY".to_owned(),
            ..LlmConfig::default()
        }
    }

    /// Config with a dummy key against a local mock server.
    fn live_config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.to_owned(),
            api_key_env: "MEND_TEST_FAKE_KEY".to_owned(),
            timeout_secs: 5,
            ..LlmConfig::default()
        }
    }

    fn live_client(base_url: &str) -> ModelClient {
        // SAFETY: tests only ever set this variable to the same value.
        unsafe { std::env::set_var("MEND_TEST_FAKE_KEY", "test-key") };
        ModelClient::new(&live_config(base_url), None, Telemetry::new())
    }

    const COMPLETION_BODY: &str = r#"{"choices":[{"message":{"content":"{\"patch\": \"ok\"}"}}],"usage":{"prompt_tokens":10,"completion_tokens":5}}"#;

    const SSE_BODY: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n\
                            data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                            data: [DONE]\n\n";

    /// Mock chat-completions backend: 500 for request bodies containing
    /// `FAIL`, an SSE body for streaming requests, a normal completion
    /// otherwise.
    async fn spawn_mock_backend() -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("FAIL"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
            .with_priority(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_string_contains("\"stream\":true"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(SSE_BODY, "text/event-stream"))
            .with_priority(2)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(COMPLETION_BODY, "application/json"))
            .with_priority(3)
            .mount(&server)
            .await;

        server
    }

    fn backend_url(server: &MockServer) -> String {
        format!("{}/v1", server.uri())
    }

    #[tokio::test]
    async fn test_should_return_placeholder_without_api_key() {
        let client = ModelClient::new(&placeholder_config(), None, Telemetry::new());
        assert!(!client.is_available());

        let response = client
            .invoke("fix it", 0.2, None)
            .await
            .expect("placeholder mode should not fail");

        assert!(response.content.contains("tool_request"));
        assert!(!response.cached);
        assert_eq!(response.temperature, 0.2);
        // The placeholder is deterministic across calls.
        let again = client.invoke("fix it", 0.2, None).await.expect("should succeed");
        assert_eq!(response.content, again.content);
    }

    #[tokio::test]
    async fn test_should_parse_content_and_usage_from_backend() {
        let server = spawn_mock_backend().await;
        let client = live_client(&backend_url(&server));

        let response = client.invoke("fix it", 0.0, Some("be brief")).await.expect("should succeed");

        assert_eq!(response.content, "{\"patch\": \"ok\"}");
        assert_eq!(response.prompt_tokens, 10);
        assert_eq!(response.completion_tokens, 5);
        assert!(response.latency_ms >= 0.0);
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn test_should_surface_backend_error_on_non_success_status() {
        let server = spawn_mock_backend().await;
        let client = live_client(&backend_url(&server));

        let result = client.invoke("please FAIL", 0.0, None).await;

        match result {
            Err(CoreError::Backend(msg)) => assert!(msg.contains("500"), "msg: {msg}"),
            other => panic!("expected backend error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_map_stalled_backend_to_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_secs(5))
                    .set_body_raw(COMPLETION_BODY, "application/json"),
            )
            .mount(&server)
            .await;

        // SAFETY: tests only ever set this variable to the same value.
        unsafe { std::env::set_var("MEND_TEST_FAKE_KEY", "test-key") };
        let config = LlmConfig {
            timeout_secs: 1,
            ..live_config(&backend_url(&server))
        };
        let client = ModelClient::new(&config, None, Telemetry::new());

        let result = client.invoke("fix it", 0.0, None).await;
        assert!(
            matches!(result, Err(CoreError::Timeout { seconds: 1 })),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_should_surface_backend_error_when_unreachable() {
        // Port 1 is never listening.
        let client = live_client("http://127.0.0.1:1/v1");

        let result = client.invoke("fix it", 0.0, None).await;
        assert!(matches!(result, Err(CoreError::Backend(_))));
    }

    #[tokio::test]
    async fn test_should_isolate_failures_in_parallel_fan_out() {
        let server = spawn_mock_backend().await;
        let client = live_client(&backend_url(&server));

        let requests = vec![
            ("fix it".to_owned(), 0.0),
            ("please FAIL".to_owned(), 0.2),
            ("fix it again".to_owned(), 0.4),
        ];
        let results = client.invoke_parallel(&requests, None).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err(), "middle request should fail alone");
        assert!(results[2].is_ok());
        // Result order matches input order regardless of completion order.
        assert_eq!(results[0].as_ref().expect("ok").temperature, 0.0);
        assert_eq!(results[2].as_ref().expect("ok").temperature, 0.4);
    }

    #[tokio::test]
    async fn test_should_fan_out_in_placeholder_mode() {
        let client = ModelClient::new(&placeholder_config(), None, Telemetry::new());

        let requests = vec![("p".to_owned(), 0.0), ("p".to_owned(), 0.2)];
        let results = client.invoke_parallel(&requests, None).await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_should_stream_chunks_until_done_marker() {
        let server = spawn_mock_backend().await;
        let client = live_client(&backend_url(&server));

        let stream = client.invoke_streaming("fix it", 0.0, None).await;
        let content = stream.collect().await.expect("stream should succeed");

        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn test_should_stream_single_placeholder_chunk_without_key() {
        let client = ModelClient::new(&placeholder_config(), None, Telemetry::new());

        let mut stream = client.invoke_streaming("fix it", 0.0, None).await;
        let first = stream.next().await.expect("one chunk").expect("ok chunk");
        assert!(first.contains("tool_request"));
        assert!(stream.next().await.is_none(), "stream should end");
    }

    #[tokio::test]
    async fn test_should_abort_stream_with_error_on_backend_failure() {
        let server = spawn_mock_backend().await;
        let client = live_client(&backend_url(&server));

        let mut stream = client.invoke_streaming("please FAIL", 0.0, None).await;
        let first = stream.next().await.expect("one item");
        assert!(first.is_err(), "stream should abort with the error");
    }

    #[tokio::test]
    async fn test_should_serve_second_cached_call_from_cache() {
        let cache = Arc::new(
            ResponseCache::open_in_memory(&CacheConfig::default()).expect("should open"),
        );
        let client =
            ModelClient::new(&placeholder_config(), Some(Arc::clone(&cache)), Telemetry::new());

        let first = client
            .invoke_cached("fix it", 0.0, None, true)
            .await
            .expect("should succeed");
        assert!(!first.cached, "first call is a miss");

        let second = client
            .invoke_cached("fix it", 0.0, None, true)
            .await
            .expect("should succeed");
        assert!(second.cached, "second call hits the cache");
        assert_eq!(second.content, first.content);
        assert_eq!(cache.stats().total_hits, 1);
    }

    #[tokio::test]
    async fn test_should_bypass_cache_when_disabled() {
        let cache = Arc::new(
            ResponseCache::open_in_memory(&CacheConfig::default()).expect("should open"),
        );
        let client =
            ModelClient::new(&placeholder_config(), Some(Arc::clone(&cache)), Telemetry::new());

        let _ = client
            .invoke_cached("fix it", 0.0, None, false)
            .await
            .expect("should succeed");

        assert_eq!(cache.stats().entries, 0, "nothing should be written");
    }

    #[test]
    fn test_should_build_messages_with_optional_system_prompt() {
        let with_system = build_messages("user text", Some("system text"));
        assert_eq!(with_system.len(), 2);
        assert_eq!(with_system[0].role, "system");
        assert_eq!(with_system[1].role, "user");

        let without = build_messages("user text", None);
        assert_eq!(without.len(), 1);
        assert_eq!(without[0].role, "user");
    }

    #[test]
    fn test_should_truncate_long_error_bodies() {
        let long = "x".repeat(500);
        assert_eq!(truncate(&long, 200).len(), 200);
        assert_eq!(truncate("short", 200), "short");
    }
}
