//! Google GenAI passthrough: client bodies are already in the backend's
//! `generateContent` shape and only need the Cloud Code envelope.

use super::gemini_types::{REQUEST_TYPE, USER_AGENT};
use crate::error::{GatewayError, Result};
use crate::tool_id;

use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Claude-family targets need ids on every function call and response.
pub fn needs_tool_ids(model: &str) -> bool {
    model.to_lowercase().contains("claude")
}

/// Wrap a client body as `{project, requestId, request, model, userAgent, requestType}`.
pub fn wrap_request(body: Value, project_id: &str, request_id: &str, model: &str) -> Result<Value> {
    let Value::Object(mut request) = body else {
        return Err(GatewayError::validation("Request body must be a JSON object"));
    };
    request
        .entry("sessionId")
        .or_insert_with(|| Value::String(session_id()));

    if needs_tool_ids(model) {
        inject_tool_ids(&mut request);
        drop_search_tools(&mut request);
    }

    Ok(json!({
        "project": project_id,
        "requestId": request_id,
        "request": Value::Object(request),
        "model": model,
        "userAgent": USER_AGENT,
        "requestType": REQUEST_TYPE,
    }))
}

pub(crate) fn session_id() -> String {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("-{}", nanos)
}

fn parts_mut(request: &mut Map<String, Value>) -> impl Iterator<Item = &mut Map<String, Value>> {
    request
        .get_mut("contents")
        .and_then(Value::as_array_mut)
        .into_iter()
        .flatten()
        .filter_map(|content| content.get_mut("parts").and_then(Value::as_array_mut))
        .flatten()
        .filter_map(Value::as_object_mut)
}

/// Give every functionCall an encoded id, then point each functionResponse
/// at the most recent call of the same name.
pub fn inject_tool_ids(request: &mut Map<String, Value>) {
    let mut call_ids: HashMap<String, String> = HashMap::new();

    for part in parts_mut(request) {
        if let Some(Value::Object(call)) = part.get_mut("functionCall") {
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
            let id = match call.get("id").and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => {
                    let id = tool_id::encode(&name);
                    tracing::debug!(tool_call_id = %id, "Added id to functionCall");
                    call.insert("id".to_string(), Value::String(id.clone()));
                    id
                }
            };
            call_ids.insert(name, id);
            continue;
        }

        if let Some(Value::Object(response)) = part.get_mut("functionResponse") {
            if response.get("id").and_then(Value::as_str).is_some_and(|id| !id.is_empty()) {
                continue;
            }
            let name = response.get("name").and_then(Value::as_str).unwrap_or_default();
            let id = match call_ids.get(name) {
                Some(id) => id.clone(),
                None if tool_id::is_encoded(name) => name.to_string(),
                None => {
                    tracing::warn!(function = %name, "No matching functionCall, minting a new id");
                    tool_id::encode(name)
                }
            };
            response.insert("id".to_string(), Value::String(id));
        }
    }
}

fn drop_search_tools(request: &mut Map<String, Value>) {
    let Some(Value::Array(tools)) = request.get_mut("tools") else {
        return;
    };
    let before = tools.len();
    tools.retain(|tool| match tool {
        Value::String(s) => s != "googleSearch" && s != "google_search",
        Value::Object(obj) => !obj.contains_key("googleSearch") && !obj.contains_key("google_search"),
        _ => true,
    });
    if tools.len() != before {
        tracing::warn!("Removed googleSearch tool, not supported for Claude targets");
    }
    if tools.is_empty() {
        request.remove("tools");
    }
}

/// Strip the `{"response": ...}` envelope from a non-streaming reply.
pub fn unwrap_response(body: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value {
        Value::Object(mut map) => map.remove("response"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_adds_envelope_and_session() {
        let payload = wrap_request(json!({"contents": []}), "proj", "req-1", "gemini-2.5-flash").unwrap();
        assert_eq!(payload["project"], "proj");
        assert_eq!(payload["requestId"], "req-1");
        assert_eq!(payload["userAgent"], "antigravity");
        assert_eq!(payload["requestType"], "agent");
        assert!(payload["request"]["sessionId"].as_str().unwrap().starts_with('-'));

        let payload = wrap_request(json!({"sessionId": "keep"}), "p", "r", "m").unwrap();
        assert_eq!(payload["request"]["sessionId"], "keep");
        assert!(wrap_request(json!("text"), "p", "r", "m").is_err());
    }

    #[test]
    fn test_claude_ids_injected_in_order() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "read", "args": {}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "read", "response": {}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "orphan", "response": {}}}]}
            ],
            "tools": [{"googleSearch": {}}]
        });
        let payload = wrap_request(body, "p", "r", "claude-sonnet-4-5").unwrap();
        let contents = &payload["request"]["contents"];
        let call_id = contents[0]["parts"][0]["functionCall"]["id"].as_str().unwrap();
        assert_eq!(tool_id::decode(call_id), "read");
        assert_eq!(contents[1]["parts"][0]["functionResponse"]["id"], call_id);
        let orphan = contents[2]["parts"][0]["functionResponse"]["id"].as_str().unwrap();
        assert_eq!(tool_id::decode(orphan), "orphan");
        assert!(payload["request"].get("tools").is_none());
    }

    #[test]
    fn test_non_claude_untouched() {
        let body = json!({"contents": [{"role": "model", "parts": [{"functionCall": {"name": "f"}}]}]});
        let payload = wrap_request(body, "p", "r", "gemini-3-flash").unwrap();
        assert!(payload["request"]["contents"][0]["parts"][0]["functionCall"].get("id").is_none());
    }

    #[test]
    fn test_unwrap_response() {
        assert_eq!(
            unwrap_response(br#"{"response":{"candidates":[]},"traceId":"t"}"#),
            Some(json!({"candidates": []}))
        );
        assert_eq!(unwrap_response(br#"{"candidates":[]}"#), None);
    }
}
