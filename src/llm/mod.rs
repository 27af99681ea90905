//! Provider-agnostic LLM chat client.
//!
//! One process-wide instance talks HTTP(S) chat completions to any of the
//! supported providers. Streaming responses are line-delimited SSE: lines
//! starting with `data: ` carry JSON deltas, `[DONE]` terminates. Each
//! provider has its own endpoint template, auth header shape, and content
//! path; everything else is shared.
//!
//! ## Protocol Overview
//!
//! 1. **Request** — POST `{model, messages, temperature, max_tokens, stream}`
//! 2. **Stream** — read `data: {json}` lines, extract the provider-specific
//!    incremental content string, forward non-empty chunks
//! 3. **Terminate** — `[DONE]` (or stream end) → emit `{done: true}` and
//!    close the channel

pub mod prompt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── Providers ──────────────────────────────────────────────────────

/// Supported chat-completion providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Claude,
    Gemini,
    OpenRouter,
    Volcengine,
}

impl Provider {
    /// Default endpoint host for the provider.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Claude => "https://api.anthropic.com/v1",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Provider::OpenRouter => "https://openrouter.ai/api/v1",
            Provider::Volcengine => "https://ark.cn-beijing.volces.com/api/v3",
        }
    }
}

// ── Messages ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "system", "user" or "assistant".
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One increment of a streaming reply.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub content: String,
    pub done: bool,
    pub error: Option<String>,
}

// ── Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: Provider,
    pub api_key: String,
    /// Overrides the provider's default endpoint host when non-empty.
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Prepended as a system message unless the caller supplied one.
    pub system_prompt: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Volcengine,
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: "你是一个智能助手，请根据用户的问题提供有帮助的回答。".to_string(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

// ── Client ─────────────────────────────────────────────────────────

/// Deterministic canned reply used by the offline mock mode.
pub const MOCK_REPLY: &str = "这是一个模拟回复，用于测试流式对话功能。";

pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl LlmClient {
    pub fn new(config: LlmConfig, cancel: CancellationToken) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout + Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Arc::new(Self {
            config,
            http,
            closed: AtomicBool::new(false),
            cancel,
        })
    }

    pub fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.config.api_key.is_empty()
    }

    /// Reject all subsequent calls. In-flight streams terminate through the
    /// cancellation token they already observe.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        tracing::info!("llm client closed");
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!("llm client is closed");
        }
        Ok(())
    }

    /// Prepend the configured system prompt unless the caller already has one.
    fn prepare_messages(&self, messages: &[Message]) -> Vec<Message> {
        let mut full = Vec::with_capacity(messages.len() + 1);
        let caller_has_system = messages.first().map(|m| m.role == "system").unwrap_or(false);
        if !self.config.system_prompt.is_empty() && !caller_has_system {
            full.push(Message::system(self.config.system_prompt.clone()));
        }
        full.extend_from_slice(messages);
        full
    }

    fn endpoint_url(&self) -> String {
        let base = if self.config.base_url.is_empty() {
            self.config.provider.default_base_url()
        } else {
            self.config.base_url.as_str()
        };
        match self.config.provider {
            Provider::Claude => format!("{base}/messages"),
            Provider::Gemini => format!("{base}/models/{}:generateContent", self.config.model),
            _ => format!("{base}/chat/completions"),
        }
    }

    fn apply_headers(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req.header("Content-Type", "application/json");
        match self.config.provider {
            Provider::Claude => req
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", "2023-06-01"),
            _ => req.header(
                "Authorization",
                format!("Bearer {}", self.config.api_key),
            ),
        }
    }

    fn request_body(&self, messages: &[Message], stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream": stream,
        })
    }

    // ── Non-streaming ─────────────────────────────────────────────

    /// Blocking-style chat: returns the full reply text.
    pub async fn chat(&self, messages: &[Message]) -> anyhow::Result<String> {
        self.ensure_open()?;
        if messages.is_empty() {
            anyhow::bail!("message list is empty");
        }

        let full = self.prepare_messages(messages);
        let mut last_err = anyhow::anyhow!("no attempts made");

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tracing::info!(attempt = attempt + 1, "retrying llm request");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            match self.do_chat(&full).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    tracing::warn!(error = %e, "llm request failed");
                    last_err = e;
                }
            }
        }

        Err(anyhow::anyhow!(
            "llm request failed after {} attempts: {last_err}",
            self.config.max_retries
        ))
    }

    async fn do_chat(&self, messages: &[Message]) -> anyhow::Result<String> {
        let resp = self
            .apply_headers(self.http.post(self.endpoint_url()))
            .json(&self.request_body(messages, false))
            .timeout(self.config.timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("llm request failed with status {status}: {body}");
        }

        let value: serde_json::Value = resp.json().await?;
        extract_content(self.config.provider, &value)
            .ok_or_else(|| anyhow::anyhow!("no content in llm response"))
    }

    // ── Streaming ─────────────────────────────────────────────────

    /// Incremental chat: the returned channel yields content chunks and a
    /// final `{done: true}` marker (with `error` set on failure).
    pub fn chat_stream(
        self: Arc<Self>,
        messages: &[Message],
    ) -> anyhow::Result<mpsc::Receiver<StreamChunk>> {
        self.ensure_open()?;
        if messages.is_empty() {
            anyhow::bail!("message list is empty");
        }

        let (tx, rx) = mpsc::channel(100);
        let full = self.prepare_messages(messages);
        let client = self;

        tokio::spawn(async move {
            let result = client.stream_with_retry(&full, &tx).await;
            if let Err(e) = result {
                let _ = tx
                    .send(StreamChunk {
                        content: String::new(),
                        done: true,
                        error: Some(e.to_string()),
                    })
                    .await;
            }
        });

        Ok(rx)
    }

    /// Deterministic offline stream for mock mode.
    pub fn chat_stream_mock(&self) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx
                .send(StreamChunk {
                    content: MOCK_REPLY.to_string(),
                    done: true,
                    error: None,
                })
                .await;
        });
        rx
    }

    async fn stream_with_retry(
        &self,
        messages: &[Message],
        tx: &mpsc::Sender<StreamChunk>,
    ) -> anyhow::Result<()> {
        let mut last_err = anyhow::anyhow!("no attempts made");

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                tracing::info!(attempt = attempt + 1, "retrying llm stream");
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            match self.do_stream(messages, tx).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "llm stream failed");
                    last_err = e;
                }
            }
        }

        Err(anyhow::anyhow!(
            "llm stream failed after {} attempts: {last_err}",
            self.config.max_retries
        ))
    }

    async fn do_stream(
        &self,
        messages: &[Message],
        tx: &mpsc::Sender<StreamChunk>,
    ) -> anyhow::Result<()> {
        let resp = self
            .apply_headers(self.http.post(self.endpoint_url()))
            .json(&self.request_body(messages, true))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("llm stream failed with status {status}: {body}");
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => anyhow::bail!("llm stream cancelled"),
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let bytes = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };

                if data == "[DONE]" {
                    let _ = tx.send(StreamChunk { done: true, ..Default::default() }).await;
                    return Ok(());
                }

                let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
                    tracing::warn!(line = data, "undecodable stream line skipped");
                    continue;
                };

                if let Some(content) = extract_stream_content(self.config.provider, &value) {
                    if !content.is_empty()
                        && tx
                            .send(StreamChunk {
                                content,
                                done: false,
                                error: None,
                            })
                            .await
                            .is_err()
                    {
                        // Receiver dropped: stop reading.
                        return Ok(());
                    }
                }
            }
        }

        let _ = tx.send(StreamChunk { done: true, ..Default::default() }).await;
        Ok(())
    }
}

// ── Content extraction ─────────────────────────────────────────────

/// Full-response content path per provider.
pub fn extract_content(provider: Provider, value: &serde_json::Value) -> Option<String> {
    let text = match provider {
        Provider::OpenAi | Provider::OpenRouter | Provider::Volcengine => {
            value.pointer("/choices/0/message/content")?.as_str()?
        }
        Provider::Claude => value.pointer("/content/0/text")?.as_str()?,
        Provider::Gemini => value
            .pointer("/candidates/0/content/parts/0/text")?
            .as_str()?,
    };
    Some(text.to_string())
}

/// Incremental (stream delta) content path per provider.
pub fn extract_stream_content(provider: Provider, value: &serde_json::Value) -> Option<String> {
    let text = match provider {
        Provider::OpenAi | Provider::OpenRouter | Provider::Volcengine => {
            value.pointer("/choices/0/delta/content")?.as_str()?
        }
        Provider::Claude => value.pointer("/delta/text")?.as_str()?,
        Provider::Gemini => value
            .pointer("/candidates/0/content/parts/0/text")?
            .as_str()?,
    };
    Some(text.to_string())
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn client(config: LlmConfig) -> Arc<LlmClient> {
        LlmClient::new(config, CancellationToken::new())
    }

    #[test]
    fn endpoint_urls_per_provider() {
        let mut config = LlmConfig {
            model: "m1".to_string(),
            ..Default::default()
        };

        config.provider = Provider::OpenAi;
        assert_eq!(
            client(config.clone()).endpoint_url(),
            "https://api.openai.com/v1/chat/completions"
        );

        config.provider = Provider::Claude;
        assert_eq!(
            client(config.clone()).endpoint_url(),
            "https://api.anthropic.com/v1/messages"
        );

        config.provider = Provider::Gemini;
        assert_eq!(
            client(config.clone()).endpoint_url(),
            "https://generativelanguage.googleapis.com/v1beta/models/m1:generateContent"
        );

        config.provider = Provider::Volcengine;
        assert_eq!(
            client(config.clone()).endpoint_url(),
            "https://ark.cn-beijing.volces.com/api/v3/chat/completions"
        );
    }

    #[test]
    fn base_url_override_wins() {
        let config = LlmConfig {
            provider: Provider::OpenAi,
            base_url: "http://localhost:8080/v1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            client(config).endpoint_url(),
            "http://localhost:8080/v1/chat/completions"
        );
    }

    #[test]
    fn system_prompt_prepended_once() {
        let config = LlmConfig {
            system_prompt: "sys".to_string(),
            ..Default::default()
        };
        let c = client(config);

        let full = c.prepare_messages(&[Message::user("hi")]);
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].role, "system");
        assert_eq!(full[0].content, "sys");

        // Caller-supplied system message suppresses the configured one.
        let full = c.prepare_messages(&[Message::system("mine"), Message::user("hi")]);
        assert_eq!(full.len(), 2);
        assert_eq!(full[0].content, "mine");
    }

    #[test]
    fn extract_openai_shapes() {
        let full = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(
            extract_content(Provider::Volcengine, &full),
            Some("hello".to_string())
        );

        let delta = serde_json::json!({
            "choices": [{"delta": {"content": "he"}}]
        });
        assert_eq!(
            extract_stream_content(Provider::OpenAi, &delta),
            Some("he".to_string())
        );
    }

    #[test]
    fn extract_claude_shapes() {
        let full = serde_json::json!({"content": [{"text": "hi"}]});
        assert_eq!(
            extract_content(Provider::Claude, &full),
            Some("hi".to_string())
        );

        let delta = serde_json::json!({"delta": {"text": "h"}});
        assert_eq!(
            extract_stream_content(Provider::Claude, &delta),
            Some("h".to_string())
        );
    }

    #[test]
    fn extract_gemini_shapes() {
        let value = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "你好"}]}}]
        });
        assert_eq!(
            extract_content(Provider::Gemini, &value),
            Some("你好".to_string())
        );
        assert_eq!(
            extract_stream_content(Provider::Gemini, &value),
            Some("你好".to_string())
        );
    }

    #[test]
    fn extract_missing_content_returns_none() {
        let value = serde_json::json!({"choices": []});
        assert_eq!(extract_content(Provider::OpenAi, &value), None);
        assert_eq!(extract_stream_content(Provider::OpenAi, &value), None);
    }

    #[tokio::test]
    async fn mock_stream_is_deterministic() {
        let c = client(LlmConfig::default());
        let mut rx = c.chat_stream_mock();

        let chunk = rx.recv().await.unwrap();
        assert!(chunk.content.contains("模拟回复"));
        assert!(chunk.done);
        assert!(chunk.error.is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_client_rejects_calls() {
        let c = client(LlmConfig {
            api_key: "k".to_string(),
            ..Default::default()
        });
        assert!(c.is_ready());

        c.close();
        assert!(!c.is_ready());
        assert!(c.chat(&[Message::user("hi")]).await.is_err());
        assert!(c.chat_stream(&[Message::user("hi")]).is_err());
    }

    #[test]
    fn ready_requires_api_key() {
        let c = client(LlmConfig::default());
        assert!(!c.is_ready());
    }

    #[tokio::test]
    async fn empty_message_list_rejected() {
        let c = client(LlmConfig {
            api_key: "k".to_string(),
            ..Default::default()
        });
        assert!(c.chat(&[]).await.is_err());
        assert!(c.chat_stream(&[]).is_err());
    }
}
