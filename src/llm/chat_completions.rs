//! OpenAI-compatible Chat Completions streaming driver.
//!
//! This module implements the [`LlmDriver`] trait for `/v1/chat/completions`
//! style endpoints. The response body is a server-sent sequence of
//! `data: {json}` lines; only `choices[0].delta.content` is surfaced.

use futures::StreamExt;

use crate::error::ChatError;

use super::{FragmentStream, LlmDriver, LlmSettings, Message};

/// Classification of one line of the event stream.
#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    /// Keep-alive, comment, SSE field or a chunk without text.
    Skip,
    /// Upstream signalled the end of the completion.
    Done,
    /// Upstream reported a failure inside the stream.
    Failed(String),
    /// A text fragment.
    Delta(String),
}

/// Driver for Chat Completions endpoints.
///
/// Connects to the configured URL and streams text fragments. One request
/// per call, no retries.
#[derive(Clone)]
pub struct ChatCompletionsDriver {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsDriver")
            .field("api_url", &self.settings.api_url)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionsDriver {
    /// Create a new driver with the given settings.
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn request_body(&self, messages: &[Message]) -> serde_json::Value {
        serde_json::json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "stream": true,
        })
    }
}

#[async_trait::async_trait]
impl LlmDriver for ChatCompletionsDriver {
    async fn stream(&self, messages: Vec<Message>) -> Result<FragmentStream, ChatError> {
        let body = self.request_body(&messages);

        let mut rb = self.http.post(&self.settings.api_url).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        tracing::debug!(
            url = %self.settings.api_url,
            model = %self.settings.model,
            message_count = messages.len(),
            "Sending completion request"
        );

        let resp = rb
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ChatError::GatewayTransport(e.to_string()))?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "Model stream interrupted");
                        yield Err(ChatError::GatewayTransport(e.to_string()));
                        return;
                    }
                };
                buf.extend_from_slice(&chunk);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line = buf.drain(..=pos).collect::<Vec<_>>();
                    match classify_line(&String::from_utf8_lossy(&line)) {
                        StreamLine::Skip => {}
                        StreamLine::Done => return,
                        StreamLine::Failed(message) => {
                            yield Err(ChatError::GatewayTransport(message));
                            return;
                        }
                        StreamLine::Delta(text) => yield Ok(text),
                    }
                }
            }

            // Some servers omit the trailing newline on the last line.
            if !buf.is_empty() {
                match classify_line(&String::from_utf8_lossy(&buf)) {
                    StreamLine::Delta(text) => yield Ok(text),
                    StreamLine::Failed(message) => yield Err(ChatError::GatewayTransport(message)),
                    StreamLine::Skip | StreamLine::Done => {}
                }
            }
        };

        Ok(Box::pin(out))
    }
}

/// Classify one raw line of the response body.
fn classify_line(raw: &str) -> StreamLine {
    let line = raw.trim();
    if line.is_empty() || line.starts_with(':') {
        return StreamLine::Skip;
    }

    let data = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if ["event:", "id:", "retry:"].iter().any(|p| line.starts_with(p)) => {
            return StreamLine::Skip;
        }
        None => line,
    };

    match data {
        "[DONE]" => return StreamLine::Done,
        "[ERROR]" => return StreamLine::Failed("upstream reported an error".to_string()),
        _ => {}
    }

    let v: serde_json::Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            let err = ChatError::GatewayDecode(e.to_string());
            tracing::warn!(error = %err, line = %data, "Skipping undecodable stream line");
            return StreamLine::Skip;
        }
    };

    if let Some(err) = v.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map_or_else(|| err.to_string(), ToString::to_string);
        return StreamLine::Failed(message);
    }

    match v["choices"][0]["delta"]["content"].as_str() {
        Some(s) if !s.is_empty() => StreamLine::Delta(s.to_string()),
        _ => StreamLine::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#;
        assert_eq!(classify_line(line), StreamLine::Delta("Hel".to_string()));
    }

    #[test]
    fn test_classify_without_data_prefix() {
        let line = r#"{"choices":[{"delta":{"content":"x"}}]}"#;
        assert_eq!(classify_line(line), StreamLine::Delta("x".to_string()));
    }

    #[test]
    fn test_keep_alive_lines_are_transparent() {
        assert_eq!(classify_line(""), StreamLine::Skip);
        assert_eq!(classify_line(": ping"), StreamLine::Skip);
        assert_eq!(classify_line("event: message"), StreamLine::Skip);
        assert_eq!(classify_line("data: not json at all"), StreamLine::Skip);
        assert_eq!(
            classify_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            StreamLine::Skip
        );
    }

    #[test]
    fn test_done_and_error_markers() {
        assert_eq!(classify_line("data: [DONE]"), StreamLine::Done);
        assert!(matches!(classify_line("data: [ERROR]"), StreamLine::Failed(_)));
        assert_eq!(
            classify_line(r#"data: {"error":{"message":"quota exceeded"}}"#),
            StreamLine::Failed("quota exceeded".to_string())
        );
    }
}
