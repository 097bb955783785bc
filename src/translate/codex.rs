//! Chat Completions / Responses <-> Codex backend translation.
//!
//! The Codex backend only speaks a streaming Responses dialect. Chat requests
//! are restructured into it; Responses requests are normalized and passed on.

use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent, ChatUsage,
    Choice, ChoiceMessage, ChunkChoice, ChunkDelta, ContentPart,
};
use crate::error::{GatewayError, Result};

use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Parameters the Codex backend rejects.
pub const FILTERED_PARAMS: &[&str] = &[
    "temperature",
    "top_p",
    "max_output_tokens",
    "max_completion_tokens",
    "max_tokens",
    "service_tier",
    "presence_penalty",
    "frequency_penalty",
];

/// Chat-only parameters with no Responses counterpart.
const CHAT_ONLY_PARAMS: &[&str] = &["n", "stream_options", "logprobs", "top_logprobs", "seed"];

pub const FILTERED_PARAMS_HEADER: &str = "x-nexus-codex-filtered-params";

pub const SUPPORTED_MODELS: &[&str] = &[
    "gpt-5.2-codex",
    "gpt-5.2",
    "gpt-5.1-codex-max",
    "gpt-5.1-codex-mini",
];

fn input_message(role: &str, content: Vec<Value>) -> Value {
    json!({ "type": "message", "role": role, "content": content })
}

fn text_part(kind: &str, text: &str) -> Value {
    json!({ "type": kind, "text": text })
}

/// Restructure a chat request into a Codex Responses payload.
pub fn chat_to_responses(req: &ChatCompletionRequest) -> Value {
    let input: Vec<Value> = req
        .messages
        .iter()
        .map(|msg| {
            let role = match msg.role.as_str() {
                "system" => "developer",
                "tool" => "user",
                other => other,
            };
            // The backend rejects input_text on assistant turns.
            let kind = if role == "assistant" { "output_text" } else { "input_text" };
            let content = match &msg.content {
                None => Vec::new(),
                Some(ChatContent::Text(text)) => vec![text_part(kind, text)],
                Some(ChatContent::Parts(parts)) => parts
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text_part(kind, text)),
                        ContentPart::ImageUrl { image_url } => {
                            let url = image_url.get("url").unwrap_or(image_url);
                            Some(json!({ "type": "input_image", "image_url": url }))
                        }
                        ContentPart::Other => None,
                    })
                    .collect(),
            };
            input_message(role, content)
        })
        .collect();

    let mut payload = Map::new();
    payload.insert("model".to_string(), Value::String(req.model.clone()));
    payload.insert("input".to_string(), Value::Array(input));

    for (key, value) in &req.extra {
        if !CHAT_ONLY_PARAMS.contains(&key.as_str()) {
            payload.insert(key.clone(), value.clone());
        }
    }
    if let Some(t) = req.temperature {
        payload.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        payload.insert("top_p".to_string(), json!(p));
    }
    if let Some(max) = req.max_completion_tokens.or(req.max_tokens) {
        payload.insert("max_output_tokens".to_string(), json!(max));
    }

    payload.insert("stream".to_string(), Value::Bool(true));
    payload.insert("store".to_string(), Value::Bool(false));
    Value::Object(payload)
}

/// Force the fields the backend requires and strip the ones it rejects.
///
/// Returns the removed keys, sorted.
pub fn prepare_payload(payload: &mut Value) -> Result<Vec<String>> {
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| GatewayError::validation("Codex payload must be a JSON object"))?;

    obj.insert("stream".to_string(), Value::Bool(true));
    obj.insert("store".to_string(), Value::Bool(false));
    obj.entry("instructions")
        .or_insert_with(|| Value::String(String::new()));

    let mut removed: Vec<String> = FILTERED_PARAMS
        .iter()
        .filter(|key| obj.remove(**key).is_some())
        .map(|key| key.to_string())
        .collect();
    removed.sort();
    Ok(removed)
}

/// Normalize a client Responses payload for passthrough to Codex.
pub fn normalize_responses_payload(payload: &mut Value, target_model: &str) -> Result<()> {
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| GatewayError::validation("Request body must be a JSON object"))?;
    obj.insert("model".to_string(), Value::String(target_model.to_string()));
    obj.insert("parallel_tool_calls".to_string(), Value::Bool(true));
    if let Some(input) = obj.get_mut("input") {
        normalize_input(input);
    }
    Ok(())
}

/// Rewrite `input` into a list of typed message items. Items that already carry
/// a `type` are kept; `system` roles become `developer`.
pub fn normalize_input(input: &mut Value) {
    let normalized: Vec<Value> = match input {
        Value::String(text) => vec![input_message("user", vec![text_part("input_text", text)])],
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => {
                    Some(input_message("user", vec![text_part("input_text", text)]))
                }
                Value::Object(obj) if obj.contains_key("type") => {
                    let mut obj = obj.clone();
                    rename_system_role(&mut obj);
                    Some(Value::Object(obj))
                }
                Value::Object(obj) if obj.contains_key("role") => {
                    let mut obj = obj.clone();
                    obj.insert("type".to_string(), Value::String("message".to_string()));
                    if let Some(Value::String(text)) = obj.get("content") {
                        let wrapped = vec![text_part("input_text", text)];
                        obj.insert("content".to_string(), Value::Array(wrapped));
                    }
                    rename_system_role(&mut obj);
                    Some(Value::Object(obj))
                }
                _ => None,
            })
            .collect(),
        _ => return,
    };
    if !normalized.is_empty() {
        *input = Value::Array(normalized);
    }
}

fn rename_system_role(obj: &mut Map<String, Value>) {
    if obj.get("role").and_then(Value::as_str) == Some("system") {
        obj.insert("role".to_string(), Value::String("developer".to_string()));
    }
}

// ---------------------------------------------------------------------------
// Codex stream events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<CodexUsage> for ChatUsage {
    fn from(u: CodexUsage) -> Self {
        ChatUsage {
            prompt_tokens: u.input_tokens,
            completion_tokens: u.output_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodexEvent {
    OutputTextDelta { item_id: String, delta: String },
    Completed { usage: Option<CodexUsage> },
    Other,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    item_id: String,
    #[serde(default)]
    delta: String,
    #[serde(default)]
    response: Option<RawResponse>,
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    usage: Option<CodexUsage>,
}

impl CodexEvent {
    pub fn parse(data: &str) -> Result<Self> {
        let raw: RawEvent = serde_json::from_str(data)?;
        Ok(match raw.event_type.as_str() {
            "response.output_text.delta" => CodexEvent::OutputTextDelta {
                item_id: raw.item_id,
                delta: raw.delta,
            },
            "response.completed" => CodexEvent::Completed {
                usage: raw.response.and_then(|r| r.usage),
            },
            _ => CodexEvent::Other,
        })
    }
}

/// A `chat.completion.chunk` carrying one Codex text delta.
pub fn delta_chunk(item_id: &str, delta: &str, model: &str) -> ChatCompletionChunk {
    ChatCompletionChunk {
        id: item_id.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(delta.to_string()),
                tool_calls: None,
            },
            finish_reason: None,
        }],
        usage: None,
    }
}

/// Folds a Codex event stream into one chat completion.
#[derive(Debug, Default)]
pub struct CodexCollector {
    text: String,
    usage: Option<CodexUsage>,
}

impl CodexCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: CodexEvent) {
        match event {
            CodexEvent::OutputTextDelta { delta, .. } => self.text.push_str(&delta),
            CodexEvent::Completed { usage } => self.usage = usage,
            CodexEvent::Other => {}
        }
    }

    pub fn finish(self, request_id: &str, model: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: format!("chatcmpl-codex-{}", request_id),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some(self.text),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: self.usage.map(ChatUsage::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::ChatMessage;

    fn chat(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        let mut req: ChatCompletionRequest =
            serde_json::from_value(json!({"model": "gpt-5.2-codex", "messages": []})).unwrap();
        req.messages = messages;
        req
    }

    #[test]
    fn test_chat_to_responses_roles_and_content() {
        let req = chat(vec![
            ChatMessage::text("system", "Be precise."),
            ChatMessage::text("user", "hi"),
            ChatMessage::text("assistant", "hello"),
        ]);
        let payload = chat_to_responses(&req);
        let input = payload["input"].as_array().unwrap();
        assert_eq!(input.len(), 3);
        assert_eq!(
            input[0],
            json!({"type": "message", "role": "developer", "content": [{"type": "input_text", "text": "Be precise."}]})
        );
        assert_eq!(input[1]["content"][0]["type"], "input_text");
        assert_eq!(input[2]["role"], "assistant");
        assert_eq!(input[2]["content"][0]["type"], "output_text");
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["store"], false);
    }

    #[test]
    fn test_chat_image_parts() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "https://x/cat.png"}}
            ]
        }))
        .unwrap();
        let payload = chat_to_responses(&chat(vec![msg]));
        assert_eq!(
            payload["input"][0]["content"][1],
            json!({"type": "input_image", "image_url": "https://x/cat.png"})
        );
    }

    #[test]
    fn test_filtered_params_reported_sorted() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-5.2-codex",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.3,
            "top_p": 0.9,
            "max_tokens": 100,
            "service_tier": "flex",
            "reasoning": {"effort": "high"},
            "n": 1
        }))
        .unwrap();
        let mut payload = chat_to_responses(&req);
        let removed = prepare_payload(&mut payload).unwrap();
        assert_eq!(
            removed,
            vec!["max_output_tokens", "service_tier", "temperature", "top_p"]
        );
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("n").is_none());
        assert_eq!(payload["reasoning"], json!({"effort": "high"}));
        assert_eq!(payload["instructions"], "");

        let mut bare = json!({"model": "m", "input": [], "instructions": "keep"});
        assert!(prepare_payload(&mut bare).unwrap().is_empty());
        assert_eq!(bare["instructions"], "keep");
        assert!(prepare_payload(&mut json!([1])).is_err());
    }

    #[test]
    fn test_normalize_input_shapes() {
        let mut input = json!("hello");
        normalize_input(&mut input);
        assert_eq!(
            input,
            json!([{"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hello"}]}])
        );

        let mut input = json!([
            "bare",
            {"role": "system", "content": "rules"},
            {"type": "message", "role": "system", "content": [{"type": "input_text", "text": "x"}]},
            {"type": "function_call_output", "call_id": "c1", "output": "ok"},
            42
        ]);
        normalize_input(&mut input);
        let items = input.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0]["role"], "user");
        assert_eq!(items[1]["type"], "message");
        assert_eq!(items[1]["role"], "developer");
        assert_eq!(items[1]["content"][0], json!({"type": "input_text", "text": "rules"}));
        assert_eq!(items[2]["role"], "developer");
        assert_eq!(items[3]["type"], "function_call_output");
    }

    #[test]
    fn test_normalize_responses_payload() {
        let mut payload = json!({"model": "gpt-5-codex", "input": "hi", "temperature": 1});
        normalize_responses_payload(&mut payload, "gpt-5.2-codex").unwrap();
        assert_eq!(payload["model"], "gpt-5.2-codex");
        assert_eq!(payload["parallel_tool_calls"], true);
        assert!(payload["input"].is_array());
    }

    #[test]
    fn test_parse_events_and_collect() {
        let events = [
            r#"{"type":"response.created","response":{"id":"r1"}}"#,
            r#"{"type":"response.output_text.delta","item_id":"msg_1","delta":"Hel"}"#,
            r#"{"type":"response.output_text.delta","item_id":"msg_1","delta":"lo"}"#,
            r#"{"type":"response.completed","response":{"usage":{"input_tokens":7,"output_tokens":2,"total_tokens":9}}}"#,
        ];
        let mut collector = CodexCollector::new();
        for data in events {
            collector.push(CodexEvent::parse(data).unwrap());
        }
        let resp = collector.finish("req-1", "gpt-5.2-codex");
        assert_eq!(resp.id, "chatcmpl-codex-req-1");
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Hello"));
        assert_eq!(resp.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(
            resp.usage,
            Some(ChatUsage {
                prompt_tokens: 7,
                completion_tokens: 2,
                total_tokens: 9
            })
        );
        assert!(CodexEvent::parse("not json").is_err());
    }

    #[test]
    fn test_delta_chunk_uses_item_id() {
        let chunk = delta_chunk("msg_1", "Hi", "gpt-5.2");
        assert_eq!(chunk.id, "msg_1");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));
    }
}
