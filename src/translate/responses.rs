//! OpenAI Responses <-> Chat Completions translation.
//!
//! Responses requests for the Cloud Code backend are rewritten as chat requests
//! and reuse the chat translator; the reply is wrapped back into a response object.

use super::gemini_types::{Annotation, GenerateContentResponse};
use super::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatFunction, ChatMessage, ChatTool, ChatUsage,
};
use super::responses_types::{OutputItem, ResponsesInput, ResponsesRequest, ResponsesResponse};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const COMPAT_SEPARATOR: &str = "__ctx__";
const MAX_REQUEST_ID_LEN: usize = 240;

pub const COMPAT_HEADER: &str = "x-nexus-responses-compat";
pub const COMPAT_HEADER_VALUE: &str = "request_id_smuggled";

pub fn response_id() -> String {
    format!("resp_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

pub fn item_id() -> String {
    format!("item_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Rewrite a Responses request as a chat request.
pub fn to_chat_request(req: &ResponsesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(instructions) = req.instructions.as_deref().filter(|s| !s.is_empty()) {
        messages.push(ChatMessage::text("system", instructions));
    }

    match &req.input {
        Some(ResponsesInput::Text(text)) => messages.push(ChatMessage::text("user", text.clone())),
        Some(ResponsesInput::Items(items)) => {
            for item in items {
                let role = if item.role.is_empty() { "user" } else { item.role.as_str() };
                let text = item.content.as_ref().map(|c| c.as_text()).unwrap_or_default();
                if text.is_empty() {
                    tracing::debug!(role, "Skipping Responses input item without text");
                    continue;
                }
                messages.push(ChatMessage::text(role, text));
            }
        }
        None => {}
    }

    let tools = req.tools.as_ref().filter(|t| !t.is_empty()).map(|tools| {
        let kinds: Vec<&str> = tools.iter().map(|t| t.tool_type.as_str()).collect();
        tracing::warn!(tools = ?kinds, "Responses tools forwarded; backend support is not guaranteed");
        tools
            .iter()
            .map(|tool| ChatTool {
                tool_type: tool.tool_type.clone(),
                function: match (tool.tool_type.as_str(), tool.name.as_deref()) {
                    ("function", Some(name)) if !name.is_empty() => Some(ChatFunction {
                        name: name.to_string(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    }),
                    _ => None,
                },
            })
            .collect()
    });

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_output_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        tools,
        tool_choice: None,
        stop: None,
        user: None,
        extra: Default::default(),
    }
}

/// `conversation` and `previous_response_id`, which the backend has no field for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatContext {
    #[serde(rename = "c", default)]
    pub conversation: String,
    #[serde(rename = "p", default)]
    pub previous_response_id: String,
}

impl CompatContext {
    pub fn from_request(req: &ResponsesRequest) -> Self {
        Self {
            conversation: req.conversation_id().unwrap_or_default().trim().to_string(),
            previous_response_id: req
                .previous_response_id
                .as_deref()
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conversation.is_empty() && self.previous_response_id.is_empty()
    }

    /// Append the context to `base`. Returns the id to send upstream and whether
    /// the context was embedded; ids that would grow past the backend limit are left alone.
    pub fn encode_request_id(&self, base: &str) -> (String, bool) {
        if self.is_empty() {
            return (base.to_string(), false);
        }
        let Ok(body) = serde_json::to_vec(self) else {
            return (base.to_string(), false);
        };
        let id = format!("{}{}{}", base, COMPAT_SEPARATOR, URL_SAFE_NO_PAD.encode(body));
        if id.len() > MAX_REQUEST_ID_LEN {
            tracing::debug!(len = id.len(), "Compat context does not fit in request id");
            return (base.to_string(), false);
        }
        (id, true)
    }

    /// Recover the context from a request id. Malformed suffixes yield an empty context.
    pub fn decode_request_id(request_id: &str) -> Self {
        let Some((_, encoded)) = request_id.split_once(COMPAT_SEPARATOR) else {
            return Self::default();
        };
        URL_SAFE_NO_PAD
            .decode(encoded)
            .ok()
            .and_then(|raw| serde_json::from_slice::<Self>(&raw).ok())
            .map(|ctx| Self {
                conversation: ctx.conversation.trim().to_string(),
                previous_response_id: ctx.previous_response_id.trim().to_string(),
            })
            .unwrap_or_default()
    }

    pub fn apply(&self, resp: &mut ResponsesResponse) {
        if !self.previous_response_id.is_empty() {
            resp.previous_response_id = Some(self.previous_response_id.clone());
        }
        if !self.conversation.is_empty() {
            resp.metadata
                .get_or_insert_with(Map::new)
                .insert("conversation".to_string(), Value::String(self.conversation.clone()));
        }
    }
}

/// Wrap a chat completion as a completed response object.
pub fn from_chat_response(chat: &ChatCompletionResponse, annotations: Vec<Annotation>) -> ResponsesResponse {
    let output = chat
        .choices
        .iter()
        .map(|choice| {
            OutputItem::message(
                item_id(),
                choice.message.role.clone(),
                choice.message.content.clone().unwrap_or_default(),
                annotations.clone(),
            )
        })
        .collect();

    ResponsesResponse {
        id: response_id(),
        object: "response".to_string(),
        status: "completed".to_string(),
        created_at: chat.created,
        model: chat.model.clone(),
        output,
        previous_response_id: None,
        metadata: None,
        usage: chat.usage.clone(),
    }
}

/// Usage from a streamed backend chunk; a missing total is the sum of the parts.
pub fn usage_from_chunk(resp: &GenerateContentResponse) -> Option<ChatUsage> {
    resp.usage_metadata.map(|u| ChatUsage {
        prompt_tokens: u.prompt_token_count,
        completion_tokens: u.candidates_token_count,
        total_tokens: if u.total_token_count > 0 {
            u.total_token_count
        } else {
            u.prompt_token_count + u.candidates_token_count
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::gemini_types::UrlCitation;
    use crate::translate::openai_types::{ChatContent, Choice, ChoiceMessage};
    use serde_json::json;

    fn parse(value: Value) -> ResponsesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_instructions_and_string_input() {
        let req = parse(json!({
            "model": "gpt-5",
            "instructions": "Be brief.",
            "input": "hello",
            "max_output_tokens": 300,
            "stream": true
        }));
        let chat = to_chat_request(&req);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[0].content_text(), "Be brief.");
        assert_eq!(chat.messages[1].role, "user");
        assert_eq!(chat.messages[1].content_text(), "hello");
        assert_eq!(chat.max_tokens, Some(300));
        assert_eq!(chat.stream, Some(true));
    }

    #[test]
    fn test_textless_items_dropped() {
        let req = parse(json!({
            "model": "gpt-4o",
            "input": [
                {"type": "function_call_output", "call_id": "call_1", "output": "42"},
                {"role": "user", "content": ""},
                {"role": "user", "content": "what was it?"}
            ]
        }));
        let chat = to_chat_request(&req);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content_text(), "what was it?");
    }

    #[test]
    fn test_item_input_and_tools() {
        let req = parse(json!({
            "model": "gpt-5",
            "input": [
                {"role": "user", "content": [{"type": "input_text", "text": "a"}, {"type": "input_text", "text": "b"}]},
                {"role": "assistant", "content": [{"type": "output_text", "text": "c"}]}
            ],
            "tools": [
                {"type": "function", "name": "lookup", "parameters": {"type": "object"}},
                {"type": "web_search"}
            ]
        }));
        let chat = to_chat_request(&req);
        assert_eq!(chat.messages.len(), 2);
        assert!(matches!(&chat.messages[0].content, Some(ChatContent::Text(t)) if t == "a\nb"));
        assert_eq!(chat.messages[1].role, "assistant");

        let tools = chat.tools.unwrap();
        assert_eq!(tools[0].tool_type, "function");
        assert_eq!(tools[0].function.as_ref().unwrap().name, "lookup");
        assert_eq!(tools[1].tool_type, "web_search");
        assert!(tools[1].function.is_none());
    }

    #[test]
    fn test_compat_context_round_trip() {
        let req = parse(json!({
            "model": "gpt-5",
            "input": "x",
            "conversation": " conv_123 ",
            "previous_response_id": "resp_abc"
        }));
        let ctx = CompatContext::from_request(&req);
        assert_eq!(ctx.conversation, "conv_123");

        let (id, embedded) = ctx.encode_request_id("agent-1");
        assert!(embedded);
        assert!(id.starts_with("agent-1__ctx__"));
        assert_eq!(CompatContext::decode_request_id(&id), ctx);

        let mut resp = ResponsesResponse {
            id: response_id(),
            object: "response".to_string(),
            status: "completed".to_string(),
            created_at: 0,
            model: "gpt-5".to_string(),
            output: Vec::new(),
            previous_response_id: None,
            metadata: None,
            usage: None,
        };
        CompatContext::decode_request_id(&id).apply(&mut resp);
        assert_eq!(resp.previous_response_id.as_deref(), Some("resp_abc"));
        assert_eq!(resp.metadata.unwrap()["conversation"], "conv_123");
    }

    #[test]
    fn test_compat_context_not_embedded() {
        let (id, embedded) = CompatContext::default().encode_request_id("agent-1");
        assert_eq!(id, "agent-1");
        assert!(!embedded);

        let long = CompatContext {
            conversation: "c".repeat(300),
            previous_response_id: String::new(),
        };
        let (id, embedded) = long.encode_request_id("agent-1");
        assert_eq!(id, "agent-1");
        assert!(!embedded);

        assert!(CompatContext::decode_request_id("agent-1").is_empty());
        assert!(CompatContext::decode_request_id("agent-1__ctx__!!!").is_empty());
    }

    #[test]
    fn test_from_chat_response() {
        let chat = ChatCompletionResponse {
            id: "chatcmpl-nexus-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "gpt-5".to_string(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: "assistant".to_string(),
                    content: Some("Paris.".to_string()),
                    tool_calls: None,
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(ChatUsage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
        };
        let annotation = Annotation {
            annotation_type: "url_citation".to_string(),
            url_citation: UrlCitation {
                start_index: 0,
                end_index: 6,
                url: "https://example.com".to_string(),
                title: "Example".to_string(),
            },
        };

        let resp = from_chat_response(&chat, vec![annotation]);
        assert!(resp.id.starts_with("resp_"));
        assert_eq!(resp.id.len(), 17);
        assert_eq!(resp.status, "completed");
        assert_eq!(resp.created_at, 1_700_000_000);
        assert_eq!(resp.output.len(), 1);
        assert!(resp.output[0].id.starts_with("item_"));
        assert_eq!(resp.output[0].content[0].text, "Paris.");
        assert_eq!(resp.output[0].content[0].annotations.len(), 1);

        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["usage"]["total_tokens"], 5);
        assert_eq!(v["output"][0]["content"][0]["type"], "output_text");
    }

    #[test]
    fn test_usage_total_falls_back_to_sum() {
        let resp = GenerateContentResponse::from_value(json!({
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 6}
        }))
        .unwrap();
        assert_eq!(usage_from_chunk(&resp).unwrap().total_tokens, 10);
        let resp = GenerateContentResponse::from_value(json!({})).unwrap();
        assert!(usage_from_chunk(&resp).is_none());
    }
}
