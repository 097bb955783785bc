//! Anthropic Messages <-> Cloud Code translation.

use super::anthropic_types::{
    ContentBlock, MessageContent, MessagesRequest, MessagesResponse, ResponseContentBlock, Role,
    Tool as AnthropicTool, ToolResultContent, Usage,
};
use super::canonical::{self, Block, CanonicalMessage};
use super::gemini_types::{
    CloudCodeRequest, FunctionDeclaration, GenerateContentRequest, GenerateContentResponse,
    GenerationConfig, Tool, ToolConfig, SKIP_THOUGHT_SIGNATURE,
};
use crate::schema::{self, Strictness};
use crate::tool_id;

use serde_json::{json, Value};

const MAX_OUTPUT_TOKENS: u64 = 64_000;
const SYSTEM_PREFIX: &str = "[System]: ";

/// Convert the conversation to canonical form, applying the backend's turn rules.
pub fn to_canonical(req: &MessagesRequest) -> Vec<CanonicalMessage> {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(system) = &req.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(CanonicalMessage::text(
                canonical::Role::System,
                format!("{}{}", SYSTEM_PREFIX, text),
            ));
        }
    }

    for msg in &req.messages {
        let role = match msg.role {
            Role::User => canonical::Role::User,
            Role::Assistant => canonical::Role::Assistant,
        };
        let blocks = match &msg.content {
            MessageContent::Text(t) => vec![Block::Text(t.clone())],
            MessageContent::Blocks(blocks) => blocks.iter().filter_map(convert_block).collect(),
        };
        messages.push(CanonicalMessage::new(role, blocks));
    }

    canonical::normalize(messages)
}

fn convert_block(block: &ContentBlock) -> Option<Block> {
    match block {
        ContentBlock::Text { text } => Some(Block::Text(text.clone())),
        ContentBlock::Thinking {
            thinking,
            signature,
        } => Some(Block::Thought {
            text: thinking.clone(),
            signature: signature.clone(),
        }),
        ContentBlock::ToolUse { id, name, input } => Some(Block::ToolCall {
            id: id.clone(),
            name: name.clone(),
            args: input.clone(),
            signature: Some(SKIP_THOUGHT_SIGNATURE.to_string()),
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => Some(Block::ToolResult {
            id: tool_use_id.clone(),
            name: tool_id::decode(tool_use_id).to_string(),
            response: json!({ "result": tool_result_value(content.as_ref()) }),
        }),
        ContentBlock::Image { .. } | ContentBlock::Other => {
            tracing::debug!("Dropping content block with no backend counterpart");
            None
        }
    }
}

/// Tool result payload: JSON-decoded when the text parses cleanly, otherwise the text itself.
fn tool_result_value(content: Option<&ToolResultContent>) -> Value {
    let text = match content {
        None => return Value::String(String::new()),
        Some(ToolResultContent::Json(v)) => return v.clone(),
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    };
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

fn is_search_tool(tool: &AnthropicTool) -> bool {
    tool.name == "web_search"
        || tool.name == "google_search"
        || tool
            .tool_type
            .as_deref()
            .is_some_and(|t| t.starts_with("web_search"))
}

fn convert_tools(tools: &[AnthropicTool], target_model: &str, strictness: Strictness) -> Vec<Tool> {
    let search_supported = !target_model.contains("gemini-3") && !target_model.contains("claude");
    let mut declarations = Vec::new();
    let mut google_search = false;

    for tool in tools {
        if is_search_tool(tool) {
            if search_supported {
                tracing::info!(tool = %tool.name, model = target_model, "Mapping search tool to googleSearch");
                google_search = true;
            } else {
                tracing::warn!(tool = %tool.name, model = target_model, "Skipping search tool, model has no search grounding");
            }
            continue;
        }
        declarations.push(FunctionDeclaration {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool
                .input_schema
                .as_ref()
                .map(|s| schema::clean_with(s, strictness)),
        });
    }

    let mut out = Vec::new();
    if !declarations.is_empty() {
        out.push(Tool::functions(declarations));
    }
    if google_search {
        out.push(Tool::google_search());
    }
    out
}

/// Build the backend payload for an Anthropic request.
pub fn build_request(
    req: &MessagesRequest,
    target_model: &str,
    project_id: &str,
    request_id: &str,
    strictness: Strictness,
) -> CloudCodeRequest {
    let contents = canonical::to_contents(to_canonical(req));

    let tools = req
        .tools
        .as_deref()
        .map(|t| convert_tools(t, target_model, strictness))
        .filter(|t| !t.is_empty());
    let tool_config = tools.as_ref().map(|_| ToolConfig::mode("AUTO"));

    let session_id = format!(
        "-{}",
        chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_default()
    );

    let request = GenerateContentRequest {
        contents,
        system_instruction: None,
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            max_output_tokens: Some(MAX_OUTPUT_TOKENS),
            top_p: req.top_p,
            stop_sequences: req.stop_sequences.clone().filter(|s| !s.is_empty()),
            thinking_config: None,
        }),
        tools,
        tool_config,
        session_id: Some(session_id),
    };

    CloudCodeRequest::new(project_id, request_id, target_model, request)
}

/// Convert a complete backend reply into an Anthropic message.
pub fn from_response(resp: &GenerateContentResponse, model: &str) -> MessagesResponse {
    let mut content = Vec::new();

    for part in resp.parts() {
        if let Some(call) = &part.function_call {
            content.push(ResponseContentBlock::ToolUse {
                id: tool_id::ensure(call.id.as_deref(), &call.name),
                name: call.name.clone(),
                input: tool_input(&call.args),
            });
            continue;
        }
        match part.text.as_deref() {
            Some(text) if part.is_thought() => content.push(ResponseContentBlock::Thinking {
                thinking: text.to_string(),
                signature: part.thought_signature.clone(),
            }),
            Some(text) if !text.is_empty() => content.push(ResponseContentBlock::Text {
                text: text.to_string(),
            }),
            _ => {}
        }
    }

    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = if content
        .iter()
        .any(|b| matches!(b, ResponseContentBlock::ToolUse { .. }))
    {
        "tool_use"
    } else {
        "end_turn"
    };

    let usage = resp.usage_metadata.unwrap_or_default();

    MessagesResponse {
        id: message_id(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: model.to_string(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage: Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: None,
        },
    }
}

/// `tool_use.input` must be an object.
pub(crate) fn tool_input(args: &Value) -> Value {
    match args {
        Value::Object(_) => args.clone(),
        _ => Value::Object(serde_json::Map::new()),
    }
}

pub(crate) fn message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::anthropic_types::{Message, SystemBlock, SystemContent};

    fn base_request(messages: Vec<Message>) -> MessagesRequest {
        MessagesRequest {
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: Some(1024),
            messages,
            system: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            tool_choice: None,
            metadata: None,
            stop_sequences: None,
            thinking: None,
            extra: Default::default(),
        }
    }

    fn user(content: &str) -> Message {
        Message {
            role: Role::User,
            content: MessageContent::Text(content.to_string()),
        }
    }

    fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Message {
        Message {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    fn text(t: &str) -> ContentBlock {
        ContentBlock::Text {
            text: t.to_string(),
        }
    }

    fn tool_use(id: &str, name: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({"q": "rust"}),
        }
    }

    fn tool_result(id: &str, content: &str) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: Some(ToolResultContent::Text(content.to_string())),
            is_error: None,
        }
    }

    // ──────────────────────────────────────────────
    // Request conversion
    // ──────────────────────────────────────────────

    #[test]
    fn test_system_becomes_leading_user_turn() {
        let mut req = base_request(vec![user("Hello")]);
        req.system = Some(SystemContent::Blocks(vec![
            SystemBlock::Text {
                text: "Be brief.".to_string(),
            },
            SystemBlock::Text {
                text: "Use English.".to_string(),
            },
        ]));

        let out = build_request(&req, "gemini-3-pro-high", "proj", "agent-1", Strictness::Standard);
        let contents = &out.request.contents;
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role, "user");
        assert_eq!(
            contents[0].parts[0].text.as_deref(),
            Some("[System]: Be brief.\nUse English.")
        );
        assert!(out.request.system_instruction.is_none());
        assert_eq!(
            out.request.generation_config.as_ref().unwrap().max_output_tokens,
            Some(64_000)
        );
        assert!(out.request.session_id.as_deref().unwrap().starts_with('-'));
        assert_eq!(out.project, "proj");
        assert_eq!(out.model, "gemini-3-pro-high");
    }

    #[test]
    fn test_assistant_blocks_reordered() {
        let req = base_request(vec![
            user("find it"),
            blocks(
                Role::Assistant,
                vec![text("first"), tool_use("search-0a1b2c3d", "search"), text("second")],
            ),
        ]);
        let canonical = to_canonical(&req);
        let assistant = &canonical[1];
        assert!(matches!(&assistant.blocks[0], Block::Text(t) if t == "first"));
        assert!(matches!(&assistant.blocks[1], Block::Text(t) if t == "second"));
        assert!(assistant.blocks[2].is_tool_call());
    }

    #[test]
    fn test_mixed_user_turn_split() {
        let req = base_request(vec![blocks(
            Role::User,
            vec![
                text("here you go"),
                tool_result("search-0a1b2c3d", "{\"hits\": 3}"),
                text("and more"),
            ],
        )]);
        let canonical = to_canonical(&req);
        assert_eq!(canonical.len(), 2);
        assert!(canonical[0].blocks.iter().all(Block::is_tool_result));
        assert_eq!(canonical[1].blocks.len(), 2);
        assert!(!canonical[1].blocks.iter().any(Block::is_tool_result));
    }

    #[test]
    fn test_tool_result_name_from_id_and_json_parsing() {
        let req = base_request(vec![blocks(
            Role::User,
            vec![
                tool_result("get_weather-0a1b2c3d", "{\"temp\": 21}"),
                tool_result("toolu_legacy", "plain text"),
            ],
        )]);
        let out = build_request(&req, "gemini-2.5-pro", "p", "r", Strictness::Standard);
        let parts = &out.request.contents[0].parts;

        let first = parts[0].function_response.as_ref().unwrap();
        assert_eq!(first.name, "get_weather");
        assert_eq!(first.id.as_deref(), Some("get_weather-0a1b2c3d"));
        assert_eq!(first.response, json!({"result": {"temp": 21}}));

        let second = parts[1].function_response.as_ref().unwrap();
        assert_eq!(second.name, "toolu_legacy");
        assert_eq!(second.response, json!({"result": "plain text"}));
    }

    #[test]
    fn test_tool_result_blocks_joined() {
        let content = ToolResultContent::Blocks(vec![text("[1,"), text("2]")]);
        assert_eq!(tool_result_value(Some(&content)), json!([1, 2]));
        let content = ToolResultContent::Blocks(vec![text("line one"), text("line two")]);
        assert_eq!(tool_result_value(Some(&content)), json!("line one\nline two"));
        assert_eq!(tool_result_value(None), json!(""));
    }

    #[test]
    fn test_tool_use_carries_skip_signature() {
        let req = base_request(vec![blocks(
            Role::Assistant,
            vec![tool_use("search-0a1b2c3d", "search")],
        )]);
        let out = build_request(&req, "claude-sonnet-4-5", "p", "r", Strictness::Standard);
        let part = &out.request.contents[0].parts[0];
        assert_eq!(part.thought_signature.as_deref(), Some(SKIP_THOUGHT_SIGNATURE));
        assert_eq!(part.function_call.as_ref().unwrap().args, json!({"q": "rust"}));
    }

    #[test]
    fn test_tools_cleaned_and_search_mapped() {
        let mut req = base_request(vec![user("hi")]);
        req.tools = Some(vec![
            AnthropicTool {
                name: "lookup".to_string(),
                tool_type: None,
                description: Some("Look things up".to_string()),
                input_schema: Some(json!({
                    "$schema": "http://json-schema.org/draft-07/schema#",
                    "type": "object",
                    "properties": {"n": {"type": "integer", "exclusiveMinimum": 0}}
                })),
            },
            AnthropicTool {
                name: "web_search".to_string(),
                tool_type: Some("web_search_20250305".to_string()),
                description: None,
                input_schema: None,
            },
        ]);

        let out = build_request(&req, "gemini-2.5-flash", "p", "r", Strictness::Standard);
        let tools = out.request.tools.as_ref().unwrap();
        assert_eq!(tools.len(), 2);
        let decls = tools[0].function_declarations.as_ref().unwrap();
        assert_eq!(decls[0].name, "lookup");
        assert_eq!(
            decls[0].parameters,
            Some(json!({"type": "object", "properties": {"n": {"type": "integer", "minimum": 1}}}))
        );
        assert!(tools[1].google_search.is_some());
        assert_eq!(
            out.request.tool_config.as_ref().unwrap().function_calling_config.mode,
            "AUTO"
        );

        let out = build_request(&req, "gemini-3-pro-high", "p", "r", Strictness::Standard);
        let tools = out.request.tools.as_ref().unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].google_search.is_none());
    }

    #[test]
    fn test_no_tools_means_no_tool_config() {
        let req = base_request(vec![user("hi")]);
        let out = build_request(&req, "gemini-2.5-pro", "p", "r", Strictness::Standard);
        assert!(out.request.tools.is_none());
        assert!(out.request.tool_config.is_none());
    }

    // ──────────────────────────────────────────────
    // Response conversion
    // ──────────────────────────────────────────────

    fn backend(value: Value) -> GenerateContentResponse {
        GenerateContentResponse::from_value(value).unwrap()
    }

    #[test]
    fn test_text_response() {
        let resp = backend(json!({"response": {
            "candidates": [{"content": {"role": "model", "parts": [{"text": "Hello!"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 2, "totalTokenCount": 12}
        }}));
        let out = from_response(&resp, "claude-sonnet-4-5");
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(out.usage.input_tokens, 10);
        assert_eq!(out.usage.output_tokens, 2);
        assert_eq!(out.model, "claude-sonnet-4-5");
        assert!(matches!(&out.content[0], ResponseContentBlock::Text { text } if text == "Hello!"));
    }

    #[test]
    fn test_function_call_gets_encoded_id() {
        let resp = backend(json!({"candidates": [{"content": {"parts": [
            {"text": "thinking it over", "thought": true, "thoughtSignature": "sig"},
            {"text": "Let me check."},
            {"functionCall": {"name": "get_weather", "args": {"city": "Oslo"}}}
        ]}}]}));
        let out = from_response(&resp, "m");
        assert_eq!(out.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(out.content.len(), 3);
        assert!(matches!(&out.content[0], ResponseContentBlock::Thinking { signature: Some(s), .. } if s == "sig"));
        match &out.content[2] {
            ResponseContentBlock::ToolUse { id, name, input } => {
                assert_eq!(name, "get_weather");
                assert_eq!(tool_id::decode(id), "get_weather");
                assert!(tool_id::is_encoded(id));
                assert_eq!(input, &json!({"city": "Oslo"}));
            }
            other => panic!("expected tool_use, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_response_has_one_text_block() {
        let out = from_response(&backend(json!({"candidates": []})), "m");
        assert_eq!(out.content.len(), 1);
        assert!(matches!(&out.content[0], ResponseContentBlock::Text { text } if text.is_empty()));
        assert_eq!(out.stop_reason.as_deref(), Some("end_turn"));
    }
}
