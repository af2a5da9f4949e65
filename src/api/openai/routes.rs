//! `/v1/chat/completions` and `/v1/models`.
//!
//! The request flow: rate-limit admission, lenient parse, validation, audit
//! ticket, dispatch to the orchestrator, then either a buffered JSON
//! response or a hand-framed SSE stream (`data: <json>\n\n` per chunk,
//! `data: [DONE]\n\n` terminator). A client disconnect drops the stream,
//! which cancels the agent invocation and finalizes the audit record as a
//! client cancellation.

use std::convert::Infallible;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::{
    Json,
    body::Bytes,
    extract::{Extension, State},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use uuid::Uuid;

use super::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelCard, ModelList};
use crate::AppState;
use crate::agent::orchestrator::{Dispatch, DispatchError};
use crate::agent::{AgentEvent, BreakerSignal};
use crate::audit::{AuditTicket, Outcome, request_fingerprint};
use crate::auth::CallerIdentity;
use crate::error::GatewayError;
use crate::usage::{TokenUsage, estimate_tokens};

const SSE_DONE: &str = "data: [DONE]\n\n";

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let created = unix_now();
    let data = state
        .orchestrator
        .models_union()
        .await
        .into_iter()
        .map(|id| ModelCard {
            id,
            object: "model".to_owned(),
            created,
            owned_by: "switchboard".to_owned(),
        })
        .collect();
    Json(ModelList {
        object: "list".to_owned(),
        data,
    })
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(identity): Extension<CallerIdentity>,
    body: Bytes,
) -> Response {
    if let Err(err) = state.limiter.check(&identity) {
        return err.into_response();
    }

    let raw: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return GatewayError::invalid(format!("body is not valid JSON: {err}"), None)
                .into_response();
        }
    };
    let request: ChatCompletionRequest = match serde_json::from_value(raw.clone()) {
        Ok(request) => request,
        Err(err) => {
            return GatewayError::invalid(format!("invalid chat request: {err}"), None)
                .into_response();
        }
    };
    if let Err(err) = request.validate() {
        return err.into_response();
    }

    let prompt_estimate = request.prompt_token_estimate();
    let fingerprint =
        request_fingerprint(&request.model, request.messages.len(), prompt_estimate);
    let mut ticket = AuditTicket::open(state.audit.clone(), &identity, fingerprint);

    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = unix_now();

    tracing::info!(
        completion_id = %completion_id,
        user_id = %identity.user_id,
        org_id = %identity.org_id,
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "chat completion accepted"
    );

    let dispatch = match state
        .orchestrator
        .dispatch(&request.model, raw, request.stream)
        .await
    {
        Ok(dispatch) => dispatch,
        Err(DispatchError::NoAgent { model }) => {
            ticket.finalize(Outcome::NoAgent);
            return GatewayError::NoAgent { model }.into_response();
        }
        Err(DispatchError::Exhausted { last_error, .. }) => {
            ticket.finalize(Outcome::AgentError);
            return GatewayError::AgentError(last_error).into_response();
        }
    };
    ticket.set_agent(&dispatch.agent_name);
    tracing::info!(
        completion_id = %completion_id,
        agent = %dispatch.agent_name,
        model = %dispatch.model,
        "invocation started"
    );

    let deadline = Instant::now() + state.config.request_timeout();
    if request.stream {
        stream_response(dispatch, ticket, completion_id, created, prompt_estimate, deadline)
    } else {
        collect_response(dispatch, ticket, completion_id, created, prompt_estimate, deadline).await
    }
}

/// Buffer the whole completion and answer with a single JSON object.
async fn collect_response(
    dispatch: Dispatch,
    mut ticket: AuditTicket,
    completion_id: String,
    created: u64,
    prompt_estimate: u32,
    deadline: Instant,
) -> Response {
    let Dispatch {
        model,
        mut invocation,
        guard,
        ..
    } = dispatch;

    let mut content = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<TokenUsage> = None;
    let mut completion: Option<serde_json::Value> = None;

    enum End {
        Done,
        Failed(String),
    }

    let end = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = match tokio::time::timeout(remaining, invocation.next_event()).await {
            Err(_) => {
                guard.finish(BreakerSignal::Failure);
                ticket.set_tokens(prompt_estimate, estimate_tokens(&content));
                ticket.finalize(Outcome::UpstreamTimeout);
                return GatewayError::UpstreamTimeout.into_response();
            }
            Ok(event) => event,
        };
        match event {
            None => break End::Failed("agent stream closed unexpectedly".to_owned()),
            Some(AgentEvent::Delta { content: delta }) => content.push_str(&delta),
            Some(AgentEvent::Chunk(value)) => {
                if let Some(text) = chunk_delta_text(&value) {
                    content.push_str(text);
                }
                if let Some(reason) = chunk_finish_reason(&value) {
                    finish_reason = Some(reason);
                }
                if let Some(reported) = json_usage(&value) {
                    usage = Some(reported);
                }
            }
            Some(AgentEvent::Completion(value)) => completion = Some(value),
            Some(AgentEvent::Done {
                finish_reason: reason,
                usage: reported,
            }) => {
                if reason.is_some() {
                    finish_reason = reason;
                }
                if reported.is_some() {
                    usage = reported;
                }
                break End::Done;
            }
            Some(AgentEvent::Failed { message }) => break End::Failed(message),
        }
    };

    match end {
        End::Done => {
            invocation.mark_finished();
            guard.finish(BreakerSignal::Success);
            if let Some(mut value) = completion {
                if let Some(object) = value.as_object_mut() {
                    object.insert("model".to_owned(), serde_json::Value::String(model));
                }
                if json_usage(&value).is_none() {
                    let text = completion_text(&value);
                    let estimated = TokenUsage::new(prompt_estimate, estimate_tokens(&text));
                    if let Ok(usage_value) = serde_json::to_value(estimated) {
                        if let Some(object) = value.as_object_mut() {
                            object.insert("usage".to_owned(), usage_value);
                        }
                    }
                }
                let reported = json_usage(&value)
                    .unwrap_or_else(|| TokenUsage::new(prompt_estimate, 0));
                ticket.set_tokens(reported.prompt_tokens, reported.completion_tokens);
                ticket.finalize(Outcome::Ok);
                Json(value).into_response()
            } else {
                let usage = usage
                    .unwrap_or_else(|| TokenUsage::new(prompt_estimate, estimate_tokens(&content)));
                ticket.set_tokens(usage.prompt_tokens, usage.completion_tokens);
                ticket.finalize(Outcome::Ok);
                Json(ChatCompletionResponse::assistant(
                    completion_id,
                    created,
                    model,
                    content,
                    finish_reason.unwrap_or_else(|| "stop".to_owned()),
                    usage,
                ))
                .into_response()
            }
        }
        End::Failed(message) => {
            guard.finish(BreakerSignal::Failure);
            ticket.set_tokens(prompt_estimate, estimate_tokens(&content));
            ticket.finalize(Outcome::AgentError);
            GatewayError::AgentError(message).into_response()
        }
    }
}

/// Stream the completion as SSE. Frames preserve agent order; on mid-stream
/// failure a best-effort error frame precedes the terminator.
fn stream_response(
    dispatch: Dispatch,
    ticket: AuditTicket,
    completion_id: String,
    created: u64,
    prompt_estimate: u32,
    deadline: Instant,
) -> Response {
    let Dispatch {
        model,
        mut invocation,
        guard,
        ..
    } = dispatch;

    let sse_stream = async_stream::stream! {
        let mut ticket = ticket;
        let guard = guard;
        let mut streamed_text = String::new();
        let mut usage: Option<TokenUsage> = None;
        let mut saw_finish = false;

        yield Ok::<String, Infallible>(sse_data(&ChatCompletionChunk::role_opener(
            &completion_id,
            created,
            &model,
        )));

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, invocation.next_event()).await {
                Err(_) => {
                    yield Ok(sse_error("upstream_timeout", "upstream agent timed out"));
                    yield Ok(SSE_DONE.to_owned());
                    break Outcome::UpstreamTimeout;
                }
                Ok(None) => {
                    yield Ok(sse_error("agent_error", "agent stream closed unexpectedly"));
                    yield Ok(SSE_DONE.to_owned());
                    break Outcome::AgentError;
                }
                Ok(Some(AgentEvent::Delta { content })) => {
                    streamed_text.push_str(&content);
                    yield Ok(sse_data(&ChatCompletionChunk::content(
                        &completion_id,
                        created,
                        &model,
                        &content,
                    )));
                }
                Ok(Some(AgentEvent::Chunk(mut value))) => {
                    if let Some(object) = value.as_object_mut() {
                        object.insert("model".to_owned(), serde_json::Value::String(model.clone()));
                    }
                    if let Some(text) = chunk_delta_text(&value) {
                        streamed_text.push_str(text);
                    }
                    if let Some(reported) = json_usage(&value) {
                        usage = Some(reported);
                    }
                    if chunk_finish_reason(&value).is_some() {
                        saw_finish = true;
                    }
                    yield Ok(sse_data(&value));
                }
                Ok(Some(AgentEvent::Completion(value))) => {
                    // A non-streaming agent answered a streamed request:
                    // replay the full content as one chunk.
                    let text = completion_text(&value);
                    streamed_text.push_str(&text);
                    if let Some(reported) = json_usage(&value) {
                        usage = Some(reported);
                    }
                    yield Ok(sse_data(&ChatCompletionChunk::content(
                        &completion_id,
                        created,
                        &model,
                        &text,
                    )));
                }
                Ok(Some(AgentEvent::Done {
                    finish_reason,
                    usage: reported,
                })) => {
                    if reported.is_some() {
                        usage = reported;
                    }
                    if !saw_finish {
                        yield Ok(sse_data(&ChatCompletionChunk::finish(
                            &completion_id,
                            created,
                            &model,
                            finish_reason.as_deref().unwrap_or("stop"),
                        )));
                    }
                    yield Ok(SSE_DONE.to_owned());
                    break Outcome::Ok;
                }
                Ok(Some(AgentEvent::Failed { message })) => {
                    tracing::error!(completion_id = %completion_id, error = %message, "mid-stream agent failure");
                    yield Ok(sse_error("agent_error", &message));
                    yield Ok(SSE_DONE.to_owned());
                    break Outcome::AgentError;
                }
            }
        };

        if outcome == Outcome::Ok {
            invocation.mark_finished();
        }
        let usage = usage
            .unwrap_or_else(|| TokenUsage::new(prompt_estimate, estimate_tokens(&streamed_text)));
        ticket.set_tokens(usage.prompt_tokens, usage.completion_tokens);
        guard.finish(outcome.breaker_signal());
        ticket.finalize(outcome);
    };

    build_sse_response(axum::body::Body::from_stream(sse_stream))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn sse_data<T: Serialize>(payload: &T) -> String {
    let json = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_owned());
    format!("data: {json}\n\n")
}

fn sse_error(code: &str, message: &str) -> String {
    sse_data(&serde_json::json!({
        "error": {
            "type": code,
            "code": code,
            "message": message,
            "param": null
        }
    }))
}

fn build_sse_response(body: axum::body::Body) -> Response {
    let mut resp = Response::new(body);
    let h = resp.headers_mut();
    h.insert("Content-Type", "text/event-stream".parse().expect("static header"));
    h.insert("Cache-Control", "no-cache".parse().expect("static header"));
    h.insert("Connection", "keep-alive".parse().expect("static header"));
    h.insert("X-Accel-Buffering", "no".parse().expect("static header"));
    resp
}

fn chunk_delta_text(value: &serde_json::Value) -> Option<&str> {
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
}

fn chunk_finish_reason(value: &serde_json::Value) -> Option<String> {
    value
        .get("choices")?
        .get(0)?
        .get("finish_reason")?
        .as_str()
        .map(str::to_owned)
}

fn completion_text(value: &serde_json::Value) -> String {
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_owned()
}

fn json_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt = usage.get("prompt_tokens")?.as_u64()? as u32;
    let completion = usage.get("completion_tokens")?.as_u64()? as u32;
    Some(TokenUsage::new(prompt, completion))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_frames_end_with_blank_line() {
        let frame = sse_data(&serde_json::json!({"ok": true}));
        assert!(frame.starts_with("data: "));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn sse_error_carries_envelope() {
        let frame = sse_error("agent_error", "boom");
        assert!(frame.contains(r#""type":"agent_error""#));
        assert!(frame.contains("boom"));
    }

    #[test]
    fn chunk_helpers_read_openai_shapes() {
        let chunk = serde_json::json!({
            "choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2}
        });
        assert_eq!(chunk_delta_text(&chunk), Some("hi"));
        assert_eq!(chunk_finish_reason(&chunk).as_deref(), Some("stop"));
        assert_eq!(json_usage(&chunk).unwrap().total_tokens, 9);
    }

    #[test]
    fn completion_text_reads_message_content() {
        let completion = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "full answer"}}]
        });
        assert_eq!(completion_text(&completion), "full answer");
        assert_eq!(completion_text(&serde_json::json!({})), "");
    }
}
