//! Text protocol spoken between the model, the orchestrator and the UI.
//!
//! The model invokes tools by writing JSON inside `<tool>…</tool>` spans in
//! its ordinary text output. Results are fed back (and shown to the user) as
//! `<tool_result>…</tool_result>` spans. The UI receives raw text frames,
//! a `[DONE]` sentinel when the turn ends and `[ERROR]`-prefixed frames on
//! failure.
//!
//! # Example
//!
//! ```rust
//! use mcp_chat::protocol::{ToolResultEnvelope, extract_tool_calls};
//!
//! let reply = r#"Let me check. <tool>{"name": "get_current_time", "parameters": {}}</tool>"#;
//! let calls = extract_tool_calls(reply);
//! assert_eq!(calls.len(), 1);
//! assert_eq!(calls[0].as_ref().unwrap().name, "get_current_time");
//!
//! let wire = ToolResultEnvelope::success("get_current_time", "12:00").render();
//! assert!(wire.starts_with("<tool_result>"));
//! ```

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::mcp::registry::ToolDescriptor;

/// Sentinel sent to the UI once a turn has fully ended.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Prefix of every error frame sent to the UI.
pub const ERROR_PREFIX: &str = "[ERROR]";

static TOOL_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<tool>(.*?)</tool>").expect("tool call pattern"));

static TOOL_RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_result>(.*?)</tool_result>").expect("tool result pattern")
});

/// Literal instructions appended to the system prompt.
const INVOCATION_INSTRUCTIONS: &str = r#"To use a tool, write the call in exactly this format (after your reasoning):
<tool>
{
  "name": "tool name",
  "parameters": {
    "param1": "value1",
    "param2": "value2"
  }
}
</tool>
After writing a tool call, stop and wait for the tool result."#;

/// A tool invocation parsed from model output.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolInvocation {
    /// Qualified tool name as written by the model.
    pub name: String,
    #[serde(default)]
    parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ToolInvocation {
    /// Parse the body of one `<tool>` span.
    pub fn parse(body: &str) -> Result<Self, ChatError> {
        serde_json::from_str(body.trim()).map_err(|e| ChatError::ToolCallParse(e.to_string()))
    }

    /// Invocation parameters; an absent or `null` field is an empty object.
    #[must_use]
    pub fn parameters(&self) -> serde_json::Map<String, serde_json::Value> {
        self.parameters.clone().unwrap_or_default()
    }
}

/// Find every non-overlapping `<tool>` span, left to right, and parse each body.
pub fn extract_tool_calls(text: &str) -> Vec<Result<ToolInvocation, ChatError>> {
    TOOL_CALL_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| ToolInvocation::parse(body.as_str()))
        .collect()
}

/// Outcome carried by a `<tool_result>` span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOutcome {
    Result(String),
    Error(String),
}

/// JSON body of a `<tool_result>` span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResultEnvelope {
    pub name: String,
    #[serde(flatten)]
    pub outcome: ToolOutcome,
}

impl ToolResultEnvelope {
    pub fn success(name: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: ToolOutcome::Result(result.into()),
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: ToolOutcome::Error(error.into()),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ToolOutcome::Error(_))
    }

    /// Render the span exactly as it is streamed and fed back to the model.
    ///
    /// Strings are JSON-escaped, so quotes, backslashes and newlines in the
    /// payload survive a parse of the body.
    #[must_use]
    pub fn render(&self) -> String {
        let (key, value) = match &self.outcome {
            ToolOutcome::Result(v) => ("result", v),
            ToolOutcome::Error(v) => ("error", v),
        };
        format!(
            "<tool_result>\n{{\n  \"name\": {},\n  \"{key}\": {}\n}}\n</tool_result>\n",
            json_string(&self.name),
            json_string(value),
        )
    }

    /// Parse every `<tool_result>` span found in `text`.
    pub fn parse_all(text: &str) -> Vec<Self> {
        TOOL_RESULT_RE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1))
            .filter_map(|body| serde_json::from_str(body.as_str().trim()).ok())
            .collect()
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Diagnostic note streamed to the caller (not part of the model's reply).
#[must_use]
pub fn diagnostic_note(text: &str) -> String {
    format!("\n<think>\n{text}\n</think>\n")
}

/// One unit delivered to the UI channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    /// Raw text (model fragments, tool results, diagnostics).
    Text(String),
    /// The turn failed; the message is shown to the user.
    Error(String),
    /// The turn has fully ended.
    Done,
}

impl StreamFrame {
    /// Wire form of the frame.
    #[must_use]
    pub fn into_wire(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Error(message) => format!("{ERROR_PREFIX}{message}"),
            Self::Done => DONE_SENTINEL.to_string(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Sending half of a turn's frame channel.
///
/// A closed receiver means the caller went away; every emit after that
/// fails with [`ChatError::Cancelled`].
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<StreamFrame>,
}

impl FrameSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<StreamFrame>) -> Self {
        Self { tx }
    }

    /// A sink plus the receiver the transport reads from.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub async fn emit(&self, frame: StreamFrame) -> Result<(), ChatError> {
        self.tx.send(frame).await.map_err(|_closed| ChatError::Cancelled)
    }

    pub async fn text(&self, text: impl Into<String>) -> Result<(), ChatError> {
        self.emit(StreamFrame::Text(text.into())).await
    }
}

/// Build the synthetic system message advertising the tool catalogue.
#[must_use]
pub fn render_system_prompt(base: &str, tools: &[ToolDescriptor]) -> String {
    let mut catalogue = String::new();
    for tool in tools {
        let _ = writeln!(
            catalogue,
            "Tool name: {}\nDescription: {}\nParameters: {}\n",
            tool.qualified_name, tool.description, tool.parameter_schema
        );
    }

    format!(
        "{base}\n\nYou have the following tools available:\n{catalogue}\n{INVOCATION_INSTRUCTIONS}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_extract_in_order() {
        let text = r#"first <tool>{"name":"a","parameters":{"x":1}}</tool> then
<tool>
{"name": "b"}
</tool>"#;
        let calls: Vec<_> = extract_tool_calls(text)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "a");
        assert_eq!(calls[0].parameters()["x"], 1);
        assert_eq!(calls[1].name, "b");
        assert!(calls[1].parameters().is_empty());
    }

    #[test]
    fn test_extract_none() {
        assert!(extract_tool_calls("plain answer, no tools").is_empty());
        // Unterminated span is not a call.
        assert!(extract_tool_calls(r#"<tool>{"name":"a"}"#).is_empty());
    }

    #[test]
    fn test_malformed_body_is_parse_error() {
        let calls = extract_tool_calls("<tool>{not json}</tool>");
        assert!(matches!(calls[0], Err(ChatError::ToolCallParse(_))));

        let missing_name = extract_tool_calls(r#"<tool>{"parameters":{}}</tool>"#);
        assert!(matches!(missing_name[0], Err(ChatError::ToolCallParse(_))));
    }

    #[test]
    fn test_null_parameters_are_empty() {
        let call = ToolInvocation::parse(r#"{"name":"t","parameters":null}"#).unwrap();
        assert!(call.parameters().is_empty());
    }

    #[test]
    fn test_result_envelope_recovers_awkward_strings() {
        let payload = "line one\nsays \"hi\" with a \\ backslash\tand tab";
        let wire = ToolResultEnvelope::success("read_file", payload).render();

        let parsed = ToolResultEnvelope::parse_all(&wire);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "read_file");
        assert_eq!(parsed[0].outcome, ToolOutcome::Result(payload.to_string()));
    }

    #[test]
    fn test_error_envelope_uses_error_field() {
        let wire = ToolResultEnvelope::failure("web:search", "timeout").render();
        assert!(wire.contains("\"error\": \"timeout\""));
        let parsed = ToolResultEnvelope::parse_all(&wire);
        assert!(parsed[0].is_error());
    }

    #[test]
    fn test_frames_on_the_wire() {
        assert_eq!(StreamFrame::Done.into_wire(), "[DONE]");
        assert_eq!(StreamFrame::Error("boom".into()).into_wire(), "[ERROR]boom");
        assert_eq!(StreamFrame::Text("hi".into()).into_wire(), "hi");
    }

    #[tokio::test]
    async fn test_sink_reports_closed_receiver() {
        let (sink, mut rx) = FrameSink::channel(4);
        sink.text("a").await.unwrap();
        assert_eq!(rx.recv().await, Some(StreamFrame::Text("a".into())));
        drop(rx);
        assert!(matches!(sink.text("b").await, Err(ChatError::Cancelled)));
    }

    #[test]
    fn test_system_prompt_lists_tools() {
        let tools = vec![ToolDescriptor {
            qualified_name: "get_current_time".to_string(),
            description: "Current local time".to_string(),
            parameter_schema: serde_json::json!({"type": "object"}),
        }];
        let prompt = render_system_prompt("You are helpful.", &tools);
        assert!(prompt.starts_with("You are helpful."));
        assert!(prompt.contains("Tool name: get_current_time"));
        assert!(prompt.contains("<tool>"));
    }
}
