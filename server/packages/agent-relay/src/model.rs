//! Streaming chat-completion client for the model backend.
//!
//! Speaks the OpenAI-compatible wire protocol: one POST to
//! `{base}/chat/completions` with `stream: true`, response body consumed as
//! SSE frames whose JSON carries incremental `choices[].delta.content`
//! fragments, terminated by a `data: [DONE]` frame.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::sleep;

const MOCK_STREAM_DELAY_MS: u64 = 30;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to reach model backend: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("model backend returned status {status}: {body}")]
    Api { status: u16, body: String },
    #[error("model stream failed: {message}")]
    Stream { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
}

/// Backend dispatch: the real HTTP client, or a scripted in-process mock for
/// tests and offline development.
#[derive(Debug, Clone)]
pub enum ChatBackend {
    Http(HttpChatClient),
    Mock(MockChatBackend),
}

impl ChatBackend {
    pub fn http() -> Self {
        Self::Http(HttpChatClient::new())
    }

    pub async fn open_stream(
        &self,
        api_key: &str,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<ChatStream, ModelError> {
        match self {
            Self::Http(client) => client
                .open_stream(api_key, base_url, request)
                .await
                .map(ChatStream::Http),
            Self::Mock(mock) => Ok(ChatStream::Mock(mock.open_stream())),
        }
    }
}

pub enum ChatStream {
    Http(HttpChatStream),
    Mock(MockChatStream),
}

impl ChatStream {
    /// Next non-empty text fragment, `Ok(None)` once the backend is done.
    pub async fn next_delta(&mut self) -> Result<Option<String>, ModelError> {
        match self {
            Self::Http(stream) => stream.next_delta().await,
            Self::Mock(stream) => stream.next_delta().await,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpChatClient {
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn open_stream(
        &self,
        api_key: &str,
        base_url: &str,
        request: &ChatRequest,
    ) -> Result<HttpChatStream, ModelError> {
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": true,
        });

        tracing::debug!(url = %url, model = %request.model, "opening model stream");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(HttpChatStream {
            response,
            accumulator: SseAccumulator::new(),
            pending: VecDeque::new(),
            done: false,
        })
    }
}

impl Default for HttpChatClient {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HttpChatStream {
    response: reqwest::Response,
    accumulator: SseAccumulator,
    pending: VecDeque<String>,
    done: bool,
}

impl HttpChatStream {
    async fn next_delta(&mut self) -> Result<Option<String>, ModelError> {
        loop {
            if let Some(delta) = self.pending.pop_front() {
                return Ok(Some(delta));
            }
            if self.done {
                return Ok(None);
            }

            let Some(chunk) = self.response.chunk().await? else {
                // body ended without a [DONE] frame; treat as exhaustion
                self.done = true;
                continue;
            };

            for frame in self.accumulator.push(&String::from_utf8_lossy(&chunk)) {
                if frame == "[DONE]" {
                    self.done = true;
                    continue;
                }
                match serde_json::from_str::<Value>(&frame) {
                    Ok(value) => self.pending.extend(extract_deltas(&value)),
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding invalid model stream frame");
                    }
                }
            }
        }
    }
}

fn extract_deltas(chunk: &Value) -> Vec<String> {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return Vec::new();
    };
    choices
        .iter()
        .filter_map(|choice| choice.get("delta")?.get("content")?.as_str())
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits a byte-chunked SSE body into complete `data:` frame payloads.
struct SseAccumulator {
    buffer: String,
    data_lines: Vec<String>,
}

impl SseAccumulator {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            data_lines: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    frames.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.trim_start().to_string());
            }
        }
        frames
    }
}

/// Scripted backend for tests: yields the configured fragments (or a failure)
/// with a small delay between chunks, like a real streaming response.
#[derive(Debug, Clone, Default)]
pub struct MockChatBackend {
    script: Vec<MockChunk>,
    delay: Duration,
}

#[derive(Debug, Clone)]
enum MockChunk {
    Delta(String),
    Error(String),
}

impl MockChatBackend {
    /// A stream that yields `deltas` in order and then completes.
    pub fn completing(deltas: &[&str]) -> Self {
        Self {
            script: deltas
                .iter()
                .map(|delta| MockChunk::Delta(delta.to_string()))
                .collect(),
            delay: Duration::from_millis(MOCK_STREAM_DELAY_MS),
        }
    }

    /// A stream that fails with `message` on the first read.
    pub fn failing(message: &str) -> Self {
        Self {
            script: vec![MockChunk::Error(message.to_string())],
            delay: Duration::from_millis(MOCK_STREAM_DELAY_MS),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn open_stream(&self) -> MockChatStream {
        MockChatStream {
            script: self.script.iter().cloned().collect(),
            delay: self.delay,
        }
    }
}

pub struct MockChatStream {
    script: VecDeque<MockChunk>,
    delay: Duration,
}

impl MockChatStream {
    async fn next_delta(&mut self) -> Result<Option<String>, ModelError> {
        let Some(chunk) = self.script.pop_front() else {
            return Ok(None);
        };
        sleep(self.delay).await;
        match chunk {
            MockChunk::Delta(text) => Ok(Some(text)),
            MockChunk::Error(message) => Err(ModelError::Stream { message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_reassembles_frames_across_chunks() {
        let mut accumulator = SseAccumulator::new();
        assert!(accumulator.push("data: {\"a\"").is_empty());
        let frames = accumulator.push(":1}\n\ndata: [DONE]\n\n");
        assert_eq!(frames, vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn accumulator_handles_crlf_and_joins_data_lines() {
        let mut accumulator = SseAccumulator::new();
        let frames = accumulator.push("data: one\r\ndata: two\r\n\r\n");
        assert_eq!(frames, vec!["one\ntwo"]);
    }

    #[test]
    fn accumulator_ignores_non_data_lines() {
        let mut accumulator = SseAccumulator::new();
        let frames = accumulator.push(": keep-alive\nevent: x\ndata: y\n\n");
        assert_eq!(frames, vec!["y"]);
    }

    #[test]
    fn extract_deltas_reads_choice_content() {
        let chunk = serde_json::json!({
            "choices": [
                {"delta": {"content": "Hel"}},
                {"delta": {"content": ""}},
                {"delta": {"role": "assistant"}},
                {"delta": {"content": "lo"}},
            ]
        });
        assert_eq!(extract_deltas(&chunk), vec!["Hel", "lo"]);
    }

    #[test]
    fn extract_deltas_tolerates_missing_choices() {
        assert!(extract_deltas(&serde_json::json!({"object": "ping"})).is_empty());
    }

    #[tokio::test]
    async fn mock_stream_yields_script_then_ends() {
        let backend = MockChatBackend::completing(&["a", "b"]).with_delay(Duration::ZERO);
        let mut stream = backend.open_stream();
        assert_eq!(stream.next_delta().await.expect("delta"), Some("a".to_string()));
        assert_eq!(stream.next_delta().await.expect("delta"), Some("b".to_string()));
        assert_eq!(stream.next_delta().await.expect("end"), None);
    }

    #[tokio::test]
    async fn mock_stream_surfaces_scripted_failure() {
        let backend = MockChatBackend::failing("boom").with_delay(Duration::ZERO);
        let mut stream = backend.open_stream();
        let err = stream.next_delta().await.expect_err("scripted failure");
        assert!(err.to_string().contains("boom"));
    }
}
