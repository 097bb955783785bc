//! Wire types for the Cloud Code `v1internal` generate-content API.
//!
//! Every client protocol is translated into a [`CloudCodeRequest`] and every
//! backend reply is read back as a [`GenerateContentResponse`]. Replies may be
//! wrapped as `{"response": {...}}` or arrive bare; [`GenerateContentResponse::from_value`]
//! accepts both.

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity preamble the backend expects in `systemInstruction` for agent traffic.
pub const IDENTITY_PROMPT: &str = "You are Antigravity, a powerful agentic AI coding assistant designed by the Google Deepmind team working on Advanced Agentic Coding.You are pair programming with a USER to solve their coding task. The task may require creating a new codebase, modifying or debugging an existing codebase, or simply answering a question.**Absolute paths only****Proactiveness**";

/// Marker accepted in place of a real thought signature on replayed tool calls.
pub const SKIP_THOUGHT_SIGNATURE: &str = "skip_thought_signature_validator";

pub const USER_AGENT: &str = "antigravity";
pub const REQUEST_TYPE: &str = "agent";

// ---------------------------------------------------------------------------
// Request types (what we send TO the backend)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCodeRequest {
    pub project: String,
    pub request_id: String,
    pub model: String,
    pub user_agent: String,
    pub request_type: String,
    pub request: GenerateContentRequest,
}

impl CloudCodeRequest {
    pub fn new(
        project: impl Into<String>,
        request_id: impl Into<String>,
        model: impl Into<String>,
        request: GenerateContentRequest,
    ) -> Self {
        Self {
            project: project.into(),
            request_id: request_id.into(),
            model: model.into(),
            user_agent: USER_AGENT.to_string(),
            request_type: REQUEST_TYPE.to_string(),
            request,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "thought_signature")]
    pub thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "inline_data")]
    pub inline_data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    pub thinking_level: String,
}

/// One backend tool entry: either a group of function declarations or the
/// built-in search grounding tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_declarations: Option<Vec<FunctionDeclaration>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub google_search: Option<Value>,
}

impl Tool {
    pub fn functions(declarations: Vec<FunctionDeclaration>) -> Self {
        Self {
            function_declarations: Some(declarations),
            google_search: None,
        }
    }

    pub fn google_search() -> Self {
        Self {
            function_declarations: None,
            google_search: Some(Value::Object(serde_json::Map::new())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallingConfig {
    pub mode: String,
}

impl ToolConfig {
    pub fn mode(mode: &str) -> Self {
        Self {
            function_calling_config: FunctionCallingConfig {
                mode: mode.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Response types (what the backend sends back)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
    #[serde(default)]
    pub grounding_supports: Vec<GroundingSupport>,
    #[serde(default)]
    pub web_search_queries: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroundingChunk {
    #[serde(default)]
    pub web: Option<WebSource>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSource {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingSupport {
    #[serde(default)]
    pub segment: Segment,
    #[serde(default)]
    pub grounding_chunk_indices: Vec<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    #[serde(default)]
    pub start_index: u64,
    #[serde(default)]
    pub end_index: u64,
}

impl GenerateContentResponse {
    /// Parse a backend payload, unwrapping the `{"response": ...}` envelope when present.
    pub fn from_value(value: Value) -> Result<Self> {
        let inner = match value {
            Value::Object(mut map) => match map.remove("response") {
                Some(inner @ Value::Object(_)) => inner,
                Some(other) => {
                    map.insert("response".to_string(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            },
            other => {
                return Err(GatewayError::conversion(format!(
                    "backend payload is not an object: {}",
                    other
                )))
            }
        };
        serde_json::from_value(inner)
            .map_err(|e| GatewayError::conversion(format!("unparseable backend payload: {}", e)))
    }

    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::conversion(format!("unparseable backend payload: {}", e)))?;
        Self::from_value(value)
    }

    fn first_candidate(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    /// Parts of the first candidate; empty when the backend sent none.
    pub fn parts(&self) -> &[Part] {
        self.first_candidate()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.as_slice())
            .unwrap_or(&[])
    }

    pub fn role(&self) -> Option<&str> {
        self.first_candidate()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.role.as_str())
            .filter(|r| !r.is_empty())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.first_candidate()
            .and_then(|c| c.finish_reason.as_deref())
            .filter(|r| !r.is_empty())
    }

    pub fn grounding_metadata(&self) -> Option<&GroundingMetadata> {
        self.first_candidate()
            .and_then(|c| c.grounding_metadata.as_ref())
    }

    /// Concatenated non-thought text of the first candidate.
    pub fn text(&self) -> String {
        self.parts()
            .iter()
            .filter(|p| !p.is_thought())
            .filter_map(|p| p.text.as_deref())
            .collect()
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts().iter().filter_map(|p| p.function_call.as_ref())
    }
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_thought(&self) -> bool {
        self.thought.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Grounding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub annotation_type: String,
    pub url_citation: UrlCitation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlCitation {
    pub start_index: u64,
    pub end_index: u64,
    pub url: String,
    pub title: String,
}

/// `url_citation` annotations for each grounding support, citing the first
/// chunk it references. Supports pointing at chunks without a web URI are skipped.
pub fn grounding_annotations(metadata: &GroundingMetadata) -> Vec<Annotation> {
    metadata
        .grounding_supports
        .iter()
        .filter_map(|support| {
            let first = *support.grounding_chunk_indices.first()?;
            let web = metadata.grounding_chunks.get(first)?.web.as_ref()?;
            if web.uri.is_empty() {
                return None;
            }
            Some(Annotation {
                annotation_type: "url_citation".to_string(),
                url_citation: UrlCitation {
                    start_index: support.segment.start_index,
                    end_index: support.segment.end_index,
                    url: web.uri.clone(),
                    title: web.title.clone(),
                },
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unwraps_response_envelope() {
        let wrapped = json!({
            "response": {
                "candidates": [{"content": {"role": "model", "parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
            },
            "traceId": "t-1"
        });
        let resp = GenerateContentResponse::from_value(wrapped).unwrap();
        assert_eq!(resp.text(), "hi");
        assert_eq!(resp.role(), Some("model"));
        assert_eq!(resp.finish_reason(), Some("STOP"));
        assert_eq!(resp.usage_metadata.unwrap().total_token_count, 4);

        let bare = json!({"candidates": [{"content": {"parts": [{"text": "yo"}]}}]});
        let resp = GenerateContentResponse::from_value(bare).unwrap();
        assert_eq!(resp.text(), "yo");
        assert_eq!(resp.finish_reason(), None);
    }

    #[test]
    fn test_rejects_non_object() {
        let err = GenerateContentResponse::from_value(json!([1, 2])).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(GenerateContentResponse::from_slice(b"not json").is_err());
    }

    #[test]
    fn test_part_field_names() {
        let part: Part = serde_json::from_value(json!({
            "thought_signature": "sig",
            "inline_data": {"mimeType": "image/png", "data": "AA=="},
            "functionCall": {"name": "f", "args": {"a": 1}}
        }))
        .unwrap();
        assert_eq!(part.thought_signature.as_deref(), Some("sig"));
        assert!(part.inline_data.is_some());

        let out = serde_json::to_value(&part).unwrap();
        assert!(out.get("thoughtSignature").is_some());
        assert!(out.get("inlineData").is_some());
        assert_eq!(out["functionCall"], json!({"name": "f", "args": {"a": 1}}));
    }

    #[test]
    fn test_thoughts_excluded_from_text() {
        let resp = GenerateContentResponse::from_value(json!({
            "candidates": [{"content": {"parts": [
                {"text": "pondering", "thought": true},
                {"text": "answer"}
            ]}}]
        }))
        .unwrap();
        assert_eq!(resp.text(), "answer");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let req = CloudCodeRequest::new(
            "proj",
            "agent-1",
            "gemini-3-pro-high",
            GenerateContentRequest {
                contents: vec![Content {
                    role: "user".to_string(),
                    parts: vec![Part::text("hello")],
                }],
                tools: Some(vec![Tool::google_search()]),
                tool_config: Some(ToolConfig::mode("AUTO")),
                session_id: Some("-1".to_string()),
                ..Default::default()
            },
        );
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["requestId"], "agent-1");
        assert_eq!(v["userAgent"], "antigravity");
        assert_eq!(v["requestType"], "agent");
        assert_eq!(v["request"]["sessionId"], "-1");
        assert_eq!(v["request"]["tools"][0], json!({"googleSearch": {}}));
        assert_eq!(v["request"]["toolConfig"]["functionCallingConfig"]["mode"], "AUTO");
        assert!(v["request"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_grounding_annotations_use_first_chunk() {
        let metadata: GroundingMetadata = serde_json::from_value(json!({
            "groundingChunks": [
                {"web": {"uri": "https://a.example", "title": "A"}},
                {"web": {"uri": "https://b.example", "title": "B"}},
                {}
            ],
            "groundingSupports": [
                {"segment": {"startIndex": 0, "endIndex": 10}, "groundingChunkIndices": [1, 0]},
                {"segment": {"endIndex": 5}, "groundingChunkIndices": []},
                {"segment": {"startIndex": 3, "endIndex": 7}, "groundingChunkIndices": [2]}
            ]
        }))
        .unwrap();

        let annotations = grounding_annotations(&metadata);
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].annotation_type, "url_citation");
        assert_eq!(annotations[0].url_citation.url, "https://b.example");
        assert_eq!(annotations[0].url_citation.title, "B");
        assert_eq!(annotations[0].url_citation.end_index, 10);
    }
}
