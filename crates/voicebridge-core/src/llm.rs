//! LLM collaborator: streamed chat completions with optional function calls.
//!
//! The driver consumes `CompletionEvent`s from a channel; `OpenAiChat` is the
//! production backend for any OpenAI-compatible chat-completions endpoint.

use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

/// One turn of conversation context. Append-only within a session, owned by
/// the conversation driver.
#[derive(Debug, Clone, Serialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            name: None,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            name: None,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            name: None,
            content: content.into(),
        }
    }

    /// Result of a side-effecting function, fed back for a follow-up reply.
    pub fn function(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "function".to_string(),
            name: Some(name.into()),
            content: content.into(),
        }
    }
}

/// Terminal directive asking the driver to invoke a named function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionCall {
    pub name: String,
    /// Raw JSON argument text, concatenated from streamed fragments. May be
    /// malformed; the driver repairs it best-effort.
    pub arguments: String,
}

/// Events produced while streaming one completion.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    /// Next chunk of reply text.
    Delta(String),
    /// The model finished by requesting a function call.
    FunctionCall(FunctionCall),
    /// The stream ended.
    Done,
}

/// Declaration of a function the model may call, plus the phrase spoken
/// while it runs (so the caller is never left in silence).
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: serde_json::Value,
    /// Pre-configured acknowledgement spoken before the function runs.
    pub say: String,
}

/// Streaming chat completion backend.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Start one completion over the given context snapshot. Events arrive on
    /// the returned channel; the stream is cancellable by dropping the
    /// receiver.
    async fn stream_chat(
        &self,
        turns: &[ChatTurn],
        tools: &[ToolSpec],
    ) -> BridgeResult<mpsc::UnboundedReceiver<CompletionEvent>>;
}

/// OpenAI-compatible streaming chat client (OpenAI, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    fn request_body(&self, turns: &[ChatTurn], tools: &[ToolSpec]) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": turns,
            "stream": true,
        });
        if !tools.is_empty() {
            let declarations: Vec<serde_json::Value> = tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = serde_json::Value::Array(declarations);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[async_trait]
impl LlmBackend for OpenAiChat {
    async fn stream_chat(
        &self,
        turns: &[ChatTurn],
        tools: &[ToolSpec],
    ) -> BridgeResult<mpsc::UnboundedReceiver<CompletionEvent>> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(turns, tools))
            .send()
            .await
            .map_err(|e| BridgeError::Llm(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BridgeError::Llm(format!("chat API {status}: {body}")));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            // Byte buffer: a multi-byte character may straddle two network
            // chunks, so only complete lines are decoded.
            let mut buffer: Vec<u8> = Vec::new();
            // Function name and argument fragments stream across many chunks.
            let mut fn_name = String::new();
            let mut fn_args = String::new();
            let mut finished_with_call = false;

            'stream: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("chat stream aborted: {e}");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let Some(data) = line.trim().strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'stream;
                    }
                    let parsed: ChatChunk = match serde_json::from_str(data) {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("unparseable chat chunk: {e}");
                            continue;
                        }
                    };
                    let Some(choice) = parsed.choices.into_iter().next() else {
                        continue;
                    };

                    if let Some(calls) = choice.delta.tool_calls {
                        for call in calls.into_iter().filter_map(|c| c.function) {
                            if let Some(name) = call.name {
                                fn_name = name;
                            }
                            if let Some(args) = call.arguments {
                                fn_args.push_str(&args);
                            }
                        }
                    }
                    if let Some(content) = choice.delta.content {
                        if !content.is_empty() && tx.send(CompletionEvent::Delta(content)).is_err()
                        {
                            // Receiver dropped: the consumer cancelled.
                            return;
                        }
                    }
                    match choice.finish_reason.as_deref() {
                        Some("tool_calls") => {
                            finished_with_call = true;
                            break 'stream;
                        }
                        Some(_) => break 'stream,
                        None => {}
                    }
                }
            }

            if finished_with_call && !fn_name.is_empty() {
                let _ = tx.send(CompletionEvent::FunctionCall(FunctionCall {
                    name: fn_name,
                    arguments: fn_args,
                }));
            }
            let _ = tx.send(CompletionEvent::Done);
        });

        Ok(rx)
    }
}
