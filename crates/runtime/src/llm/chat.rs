use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use askql_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use askql_common::config::LlmSettings;
use askql_common::retry::{guarded, RetryPolicy};

use super::{is_retryable_status, ChatMessage, LlmError};

const SERVICE: &str = "chat";
const BREAKER_NAME: &str = "llm_chat";
/// Error bodies are cut to this many bytes before they end up in messages.
const MAX_ERROR_BODY: usize = 512;

/// Text deltas of one streamed completion.
pub type ChatStream = BoxStream<'static, Result<String, LlmError>>;

/// Client for `POST {base_url}/chat/completions`.
pub struct OpenAiChatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    temperature: f32,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl OpenAiChatClient {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = match &settings.api_key {
            Some(key) if settings.is_configured() => key.clone(),
            _ => return Err(LlmError::NotConfigured("llm")),
        };
        let http = build_http(settings.timeout_secs, SERVICE)?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            temperature: settings.temperature,
            breaker: Arc::new(CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                BREAKER_NAME,
                &settings.breaker,
            ))),
            retry: settings.retry.into(),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn payload(&self, messages: &[ChatMessage], temperature: Option<f32>, stream: bool) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature.unwrap_or(self.temperature),
        });
        if stream {
            payload["stream"] = Value::Bool(true);
        }
        payload
    }

    async fn send(&self, payload: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(payload)
            .send()
            .await
            .map_err(|e| LlmError::transport(SERVICE, e))?;
        check_status(SERVICE, response).await
    }

    /// One non-streaming completion; returns `choices[0].message.content`.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<String, LlmError> {
        let payload = self.payload(messages, temperature, false);
        let body: Value = guarded(
            "llm_chat",
            &self.breaker,
            &self.retry,
            LlmError::is_retryable,
            || async {
                let response = self.send(&payload).await?;
                read_json(SERVICE, response).await
            },
        )
        .await?;

        match body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
        {
            Some(content) => Ok(content.to_string()),
            None => {
                warn!(model = %self.model, body = %truncate(&body.to_string()), "unexpected chat response");
                Err(LlmError::UnexpectedShape {
                    service: SERVICE,
                    detail: "missing choices[0].message.content".to_string(),
                })
            }
        }
    }

    /// Streamed completion.
    ///
    /// Connecting is retried like [`Self::chat`]. Once the stream is handed
    /// out, the breaker learns the outcome when the stream ends: success on
    /// `[DONE]` or end of body, failure on a broken body.
    pub async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        temperature: Option<f32>,
    ) -> Result<ChatStream, LlmError> {
        self.breaker.check().await?;
        let payload = self.payload(messages, temperature, true);
        let response = match self
            .retry
            .run("llm_chat_stream", LlmError::is_retryable, || self.send(&payload))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.breaker.record_failure().await;
                return Err(e);
            }
        };

        let state = StreamState {
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                .boxed(),
            buffer: Vec::new(),
            breaker: self.breaker.clone(),
            eof: false,
            finished: false,
        };
        Ok(stream::unfold(state, next_delta).boxed())
    }
}

pub(super) fn build_http(timeout_secs: u64, service: &'static str) -> Result<reqwest::Client, LlmError> {
    let mut builder = reqwest::Client::builder();
    if timeout_secs > 0 {
        builder = builder.timeout(Duration::from_secs(timeout_secs));
    }
    builder.build().map_err(|e| LlmError::Transport {
        service,
        message: e.to_string(),
        retryable: false,
    })
}

pub(super) async fn check_status(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let status = status.as_u16();
    debug!(service, status, retryable = is_retryable_status(status), "upstream rejected request");
    Err(LlmError::Status {
        service,
        status,
        body: truncate(&body),
    })
}

/// Read a successful response as JSON. A body that arrives but does not
/// parse is the upstream's fault, not the network's.
pub(super) async fn read_json(
    service: &'static str,
    response: reqwest::Response,
) -> Result<Value, LlmError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| LlmError::transport(service, e))?;
    serde_json::from_slice(&bytes).map_err(|e| LlmError::UnexpectedShape {
        service,
        detail: format!("body is not JSON: {e}"),
    })
}

pub(super) fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    breaker: Arc<CircuitBreaker>,
    eof: bool,
    finished: bool,
}

impl StreamState {
    async fn finish(&mut self, ok: bool) {
        self.finished = true;
        if ok {
            self.breaker.record_success().await;
        } else {
            self.breaker.record_failure().await;
        }
    }
}

async fn next_delta(mut st: StreamState) -> Option<(Result<String, LlmError>, StreamState)> {
    loop {
        if st.finished {
            return None;
        }
        if let Some(pos) = st.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = st.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            match parse_sse_line(line.trim_end()) {
                SseLine::Skip => continue,
                SseLine::Delta(delta) => return Some((Ok(delta), st)),
                SseLine::Done => {
                    st.finish(true).await;
                    return None;
                }
            }
        }
        if st.eof {
            st.finish(true).await;
            return None;
        }
        match st.body.next().await {
            Some(Ok(bytes)) => st.buffer.extend_from_slice(&bytes),
            Some(Err(e)) => {
                st.finish(false).await;
                return Some((Err(LlmError::transport(SERVICE, e)), st));
            }
            None => {
                st.eof = true;
                st.buffer.push(b'\n');
            }
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Skip,
    Delta(String),
    Done,
}

/// One line of an OpenAI-style event stream. Comments, blank lines, other
/// fields, unparsable payloads and empty deltas are skipped.
pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data.is_empty() {
        return SseLine::Skip;
    }
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };
    let content = event
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| {
            event
                .pointer("/choices/0/message/content")
                .and_then(Value::as_str)
        });
    match content {
        Some(text) if !text.is_empty() => SseLine::Delta(text.to_string()),
        _ => SseLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_lines() {
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(parse_sse_line(""), SseLine::Skip);
        assert_eq!(parse_sse_line("event: message"), SseLine::Skip);
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line("data: {not json"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            SseLine::Delta("Hel".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data:{"choices":[{"message":{"content":"full"}}]}"#),
            SseLine::Delta("full".to_string())
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let cut = truncate(&long);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= MAX_ERROR_BODY + 3);
    }
}
