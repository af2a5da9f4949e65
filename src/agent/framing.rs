//! Wire framing for agent subprocess IO.
//!
//! Three disciplines exist (see [`super::Transport`]):
//!
//! - `stdio_jsonlines`: one JSON object per line in both directions. Requests
//!   carry a correlation `id`; replies are matched back by that id and a
//!   reply with `"final": true` closes the invocation.
//! - `stdio_openai_chunks`: the agent writes OpenAI-shaped chunks verbatim as
//!   SSE `data:` lines on stdout, terminated by `data: [DONE]`.
//! - `http_local`: framing is ordinary HTTP; only the startup banner
//!   (`LISTEN <port>`) comes through stdout.
//!
//! Any single frame larger than [`MAX_FRAME_BYTES`] is a framing error and
//! counts against the agent.
//!
//! Health probes on the jsonlines framing are `{"id":...,"op":"ping"}`
//! requests; agents answer with a frame carrying the same id and
//! `"final": true`.

use serde::{Deserialize, Serialize};

use crate::usage::TokenUsage;

/// Hard cap on a single stdout frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    Oversized(usize),
    #[error("unparseable frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A request frame written to a jsonlines agent's stdin.
#[derive(Debug, Serialize)]
pub struct RequestFrame<'a> {
    pub id: &'a str,
    pub op: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<&'a serde_json::Value>,
}

impl<'a> RequestFrame<'a> {
    pub fn chat(id: &'a str, model: &'a str, payload: &'a serde_json::Value) -> Self {
        Self {
            id,
            op: "chat",
            model: Some(model),
            payload: Some(payload),
        }
    }

    pub fn cancel(id: &'a str) -> Self {
        Self {
            id,
            op: "cancel",
            model: None,
            payload: None,
        }
    }

    pub fn ping(id: &'a str) -> Self {
        Self {
            id,
            op: "ping",
            model: None,
            payload: None,
        }
    }

    /// Serialize to a single newline-free line.
    pub fn to_line(&self) -> String {
        // Serialization of these shapes cannot fail; fall back to a cancel
        // no-op line rather than panicking in the writer task.
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"id\":\"{}\",\"op\":\"cancel\"}}", self.id))
            .replace('\n', "")
    }
}

/// A reply frame read from a jsonlines agent's stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyFrame {
    pub id: String,
    #[serde(default)]
    pub delta: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default, rename = "final")]
    pub is_final: bool,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<UsageFrame>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UsageFrame {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl From<UsageFrame> for TokenUsage {
    fn from(frame: UsageFrame) -> Self {
        TokenUsage::new(frame.prompt_tokens, frame.completion_tokens)
    }
}

pub fn parse_reply_line(line: &str) -> Result<ReplyFrame, FramingError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(FramingError::Oversized(line.len()));
    }
    Ok(serde_json::from_str(line)?)
}

/// One stdout line from a `stdio_openai_chunks` agent.
#[derive(Debug, Clone, PartialEq)]
pub enum SseLine {
    /// A `data:` line carrying a JSON chunk.
    Data(serde_json::Value),
    /// The `data: [DONE]` terminator.
    Done,
    /// Blank lines, comments, `event:` lines — ignored.
    Ignored,
}

pub fn parse_sse_line(line: &str) -> Result<SseLine, FramingError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(FramingError::Oversized(line.len()));
    }
    let Some(rest) = line.strip_prefix("data:") else {
        return Ok(SseLine::Ignored);
    };
    let rest = rest.trim();
    if rest == "[DONE]" {
        return Ok(SseLine::Done);
    }
    if rest.is_empty() {
        return Ok(SseLine::Ignored);
    }
    Ok(SseLine::Data(serde_json::from_str(rest)?))
}

/// Startup banner an agent may print as its first stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Banner {
    /// `READY <name> <version>` — satisfies the startup health check.
    Ready { name: String, version: String },
    /// `LISTEN <port>` — announces the loopback port of an `http_local` agent.
    Listen { port: u16 },
}

pub fn parse_banner(line: &str) -> Option<Banner> {
    let mut parts = line.split_whitespace();
    match parts.next()? {
        "READY" => {
            let name = parts.next().unwrap_or_default().to_owned();
            let version = parts.next().unwrap_or_default().to_owned();
            Some(Banner::Ready { name, version })
        }
        "LISTEN" => {
            let port = parts.next()?.parse().ok()?;
            Some(Banner::Listen { port })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_frame_round_trips_as_one_line() {
        let payload = serde_json::json!({"messages": [{"role": "user", "content": "hi"}]});
        let line = RequestFrame::chat("req-1", "gpt-x", &payload).to_line();
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["id"], "req-1");
        assert_eq!(parsed["op"], "chat");
        assert_eq!(parsed["model"], "gpt-x");
    }

    #[test]
    fn reply_frame_parses_final_and_usage() {
        let frame = parse_reply_line(
            r#"{"id":"req-1","delta":"hi","final":true,"finish_reason":"stop","usage":{"prompt_tokens":3,"completion_tokens":1}}"#,
        )
        .unwrap();
        assert!(frame.is_final);
        assert_eq!(frame.delta.as_deref(), Some("hi"));
        let usage: TokenUsage = frame.usage.unwrap().into();
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let line = format!(r#"{{"id":"x","delta":"{}"}}"#, "a".repeat(MAX_FRAME_BYTES));
        assert!(matches!(
            parse_reply_line(&line),
            Err(FramingError::Oversized(_))
        ));
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert!(matches!(
            parse_reply_line("not json"),
            Err(FramingError::Malformed(_))
        ));
    }

    #[test]
    fn sse_lines_classify() {
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Ignored);
        assert_eq!(parse_sse_line(": keepalive").unwrap(), SseLine::Ignored);
        match parse_sse_line(r#"data: {"object":"chat.completion.chunk"}"#).unwrap() {
            SseLine::Data(v) => assert_eq!(v["object"], "chat.completion.chunk"),
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn banners_parse() {
        assert_eq!(
            parse_banner("READY codex 1.4.2"),
            Some(Banner::Ready {
                name: "codex".into(),
                version: "1.4.2".into()
            })
        );
        assert_eq!(parse_banner("LISTEN 8431"), Some(Banner::Listen { port: 8431 }));
        assert_eq!(parse_banner("LISTEN not-a-port"), None);
        assert_eq!(parse_banner("hello world"), None);
    }
}
