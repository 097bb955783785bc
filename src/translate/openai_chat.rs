//! OpenAI Chat Completions <-> Cloud Code translation.

use super::canonical::{self, Block, CanonicalMessage, Role};
use super::gemini_types::{
    CloudCodeRequest, Content, FunctionDeclaration, GenerateContentRequest,
    GenerateContentResponse, GenerationConfig, Part, ThinkingConfig, Tool, IDENTITY_PROMPT,
};
use super::openai_types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ChatTool, ChatToolCall,
    ChatToolCallFunction, ChatUsage, Choice, ChoiceMessage, ChunkChoice, ChunkDelta,
    ChunkToolCall, ChunkToolCallFunction, ChatCompletionResponse,
};
use crate::schema::{self, Strictness};
use crate::tool_id;

use serde_json::{json, Value};

/// Smallest output budget a thinking model gets; below it the whole budget goes to thoughts.
const THINKING_MIN_OUTPUT_TOKENS: u64 = 8_000;

pub const STREAM_CHUNK_ID: &str = "chatcmpl-nexus";

/// Split a chat request into system texts and canonical conversation turns.
///
/// Chat tool semantics are one-shot, so turns keep the order the client sent.
pub fn to_canonical(req: &ChatCompletionRequest) -> (Vec<String>, Vec<CanonicalMessage>) {
    let mut system = Vec::new();
    let mut messages = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" | "developer" => system.push(msg.content_text()),
            "tool" => messages.push(CanonicalMessage::new(Role::User, vec![tool_result(msg)])),
            "assistant" => messages.push(assistant_turn(msg)),
            _ => messages.push(CanonicalMessage::text(Role::User, msg.content_text())),
        }
    }

    (system, messages)
}

fn tool_result(msg: &ChatMessage) -> Block {
    let content = msg.content_text();
    let id = msg.tool_call_id.clone().unwrap_or_default();
    let name = msg
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| tool_id::decode(&id).to_string());
    let response = match serde_json::from_str::<Value>(&content) {
        Ok(obj @ Value::Object(_)) => obj,
        _ => json!({ "result": content }),
    };
    Block::ToolResult { id, name, response }
}

fn assistant_turn(msg: &ChatMessage) -> CanonicalMessage {
    let text = msg.content_text();
    let calls = msg.tool_calls.as_deref().unwrap_or_default();
    if calls.is_empty() {
        return CanonicalMessage::text(Role::Assistant, text);
    }

    let mut blocks = Vec::with_capacity(calls.len() + 1);
    if !text.is_empty() {
        blocks.push(Block::Text(text));
    }
    for call in calls {
        let args = serde_json::from_str::<Value>(&call.function.arguments)
            .ok()
            .filter(Value::is_object)
            .unwrap_or_else(|| json!({}));
        blocks.push(Block::ToolCall {
            id: call.id.clone(),
            name: call.function.name.clone(),
            args,
            signature: None,
        });
    }
    CanonicalMessage::new(Role::Assistant, blocks)
}

/// `thinkingLevel` for Gemini 3 Pro targets, chosen by model suffix.
pub fn thinking_level(model: &str) -> Option<&'static str> {
    if !model.contains("gemini-3-pro") || model.contains("image") {
        return None;
    }
    if model.contains("gemini-3-pro-high") {
        Some("high")
    } else if model.contains("gemini-3-pro-medium") {
        Some("medium")
    } else {
        Some("low")
    }
}

fn is_search_tool(tool: &ChatTool) -> bool {
    match tool.tool_type.as_str() {
        "web_search" | "web_search_preview" | "google_search" | "googleSearch" => true,
        "function" => tool
            .function
            .as_ref()
            .is_some_and(|f| f.name == "google_search" || f.name == "googleSearch"),
        _ => false,
    }
}

/// Convert chat tools to backend tools. Search grounding is skipped for gemini-3 targets.
pub fn convert_tools(tools: &[ChatTool], target_model: &str, strictness: Strictness) -> Vec<Tool> {
    let mut declarations = Vec::new();
    let mut google_search = false;

    for tool in tools {
        if is_search_tool(tool) {
            google_search = true;
            continue;
        }
        match (&tool.function, tool.tool_type.as_str()) {
            (Some(function), "function") => declarations.push(FunctionDeclaration {
                name: function.name.clone(),
                description: function.description.clone(),
                parameters: function
                    .parameters
                    .as_ref()
                    .map(|p| schema::clean_with(p, strictness)),
            }),
            (_, other) => tracing::debug!(tool_type = other, "Ignoring unsupported tool type"),
        }
    }

    let mut out = Vec::new();
    if !declarations.is_empty() {
        out.push(Tool::functions(declarations));
    }
    if google_search {
        if target_model.contains("gemini-3") {
            tracing::warn!(model = target_model, "Skipping googleSearch, thinking mode conflicts with grounding");
        } else {
            out.push(Tool::google_search());
        }
    }
    out
}

fn generation_config(req: &ChatCompletionRequest, target_model: &str) -> Option<GenerationConfig> {
    let max_tokens = req.max_tokens.or(req.max_completion_tokens);
    let stop = req.stop.as_ref().map(|s| s.to_vec()).filter(|s| !s.is_empty());

    let mut config = if req.temperature.is_some()
        || max_tokens.is_some()
        || req.top_p.is_some()
        || stop.is_some()
    {
        Some(GenerationConfig {
            temperature: req.temperature,
            max_output_tokens: max_tokens,
            top_p: req.top_p,
            stop_sequences: stop,
            thinking_config: None,
        })
    } else {
        None
    };

    if let Some(level) = thinking_level(target_model) {
        let config = config.get_or_insert_with(GenerationConfig::default);
        config.thinking_config = Some(ThinkingConfig {
            thinking_level: level.to_string(),
        });
        config.max_output_tokens = Some(
            config
                .max_output_tokens
                .map_or(THINKING_MIN_OUTPUT_TOKENS, |n| n.max(THINKING_MIN_OUTPUT_TOKENS)),
        );
    }

    config
}

/// Build the backend payload for a chat request.
pub fn build_request(
    req: &ChatCompletionRequest,
    target_model: &str,
    project_id: &str,
    request_id: &str,
    strictness: Strictness,
) -> CloudCodeRequest {
    let (system, messages) = to_canonical(req);

    let mut system_parts: Vec<Part> = system.into_iter().map(Part::text).collect();
    let has_identity = system_parts
        .iter()
        .any(|p| p.text.as_deref().is_some_and(|t| t.contains("You are Antigravity")));
    if !has_identity {
        system_parts.insert(0, Part::text(IDENTITY_PROMPT));
    }

    let tools = req
        .tools
        .as_deref()
        .map(|t| convert_tools(t, target_model, strictness))
        .filter(|t| !t.is_empty());

    let request = GenerateContentRequest {
        contents: canonical::to_contents(messages),
        system_instruction: Some(Content {
            role: String::new(),
            parts: system_parts,
        }),
        generation_config: generation_config(req, target_model),
        tools,
        tool_config: None,
        session_id: None,
    };

    CloudCodeRequest::new(project_id, request_id, target_model, request)
}

fn tool_calls(resp: &GenerateContentResponse) -> Vec<ChatToolCall> {
    resp.function_calls()
        .map(|call| ChatToolCall {
            id: tool_id::ensure(call.id.as_deref(), &call.name),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: call.name.clone(),
                arguments: arguments_string(&call.args),
            },
        })
        .collect()
}

fn arguments_string(args: &Value) -> String {
    match args {
        Value::Object(_) => args.to_string(),
        _ => "{}".to_string(),
    }
}

pub fn usage(resp: &GenerateContentResponse) -> ChatUsage {
    let u = resp.usage_metadata.unwrap_or_default();
    ChatUsage {
        prompt_tokens: u.prompt_token_count,
        completion_tokens: u.candidates_token_count,
        total_tokens: u.total_token_count,
    }
}

/// Convert a complete backend reply into a chat completion.
pub fn from_response(resp: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let calls = tool_calls(resp);
    let finish_reason = if calls.is_empty() { "stop" } else { "tool_calls" };
    let now = chrono::Utc::now();

    ChatCompletionResponse {
        id: format!("chatcmpl-nexus-{}", now.format("%Y%m%d%H%M%S")),
        object: "chat.completion".to_string(),
        created: now.timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content: Some(resp.text()),
                tool_calls: if calls.is_empty() { None } else { Some(calls) },
            },
            finish_reason: Some(finish_reason.to_string()),
        }],
        usage: Some(usage(resp)),
    }
}

/// Convert one streamed backend chunk into a chat chunk.
///
/// `next_tool_index` numbers tool calls across the whole stream. Returns `None`
/// for chunks that carry no text, calls, finish reason or role.
pub fn chunk_from_response(
    resp: &GenerateContentResponse,
    model: &str,
    next_tool_index: &mut u64,
) -> Option<ChatCompletionChunk> {
    let text = resp.text();
    let role = resp
        .role()
        .map(|r| if r == "model" { "assistant" } else { r }.to_string());

    let calls: Vec<ChunkToolCall> = resp
        .function_calls()
        .map(|call| {
            let index = *next_tool_index;
            *next_tool_index += 1;
            ChunkToolCall {
                index,
                id: Some(tool_id::ensure(call.id.as_deref(), &call.name)),
                call_type: Some("function".to_string()),
                function: Some(ChunkToolCallFunction {
                    name: Some(call.name.clone()),
                    arguments: Some(arguments_string(&call.args)),
                }),
            }
        })
        .collect();

    let finish_reason = if !calls.is_empty() {
        Some("tool_calls".to_string())
    } else {
        resp.finish_reason().map(str::to_lowercase)
    };

    if text.is_empty() && calls.is_empty() && finish_reason.is_none() && role.is_none() {
        return None;
    }

    Some(ChatCompletionChunk {
        id: STREAM_CHUNK_ID.to_string(),
        object: "chat.completion.chunk".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role,
                content: Some(text).filter(|t| !t.is_empty()),
                tool_calls: if calls.is_empty() { None } else { Some(calls) },
            },
            finish_reason,
        }],
        usage: None,
    })
}
