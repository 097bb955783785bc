//! Cloud Code `v1internal` client.
//!
//! [`UpstreamClient`] is the seam the proxy talks to. [`CloudCodeClient`] is the
//! real implementation: it tries each configured endpoint in turn and sends the
//! headers the backend expects. The `smart_*` variants apply the extra request
//! shaping premium models (Claude, gemini-3-pro) need.

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};
use crate::translate::gemini_types::{IDENTITY_PROMPT, REQUEST_TYPE, USER_AGENT};

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use std::pin::Pin;
use std::time::Duration;

pub type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Status, headers and a body that has not been read yet.
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    /// A response with an in-memory body.
    pub fn from_bytes(status: u16, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        let body = body.into();
        Self {
            status,
            headers,
            body: Box::pin(stream::once(async move { Ok(body) })),
        }
    }

    pub fn from_reqwest(resp: reqwest::Response) -> Self {
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes_stream().map(|r| r.map_err(std::io::Error::other));
        Self {
            status,
            headers,
            body: Box::pin(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = Vec::new();
        while let Some(chunk) = body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn generate_content(&self, token: &str, payload: Value) -> Result<UpstreamResponse>;

    async fn stream_generate_content(&self, token: &str, payload: Value) -> Result<UpstreamResponse>;

    /// Premium models only answer reliably on the streaming endpoint, so their
    /// stream is read here and merged into one JSON body.
    async fn smart_generate_content(&self, token: &str, mut payload: Value) -> Result<UpstreamResponse> {
        if !is_premium_model(payload_model(&payload)) {
            ensure_tool_config(&mut payload);
            return self.generate_content(token, payload).await;
        }

        enhance_for_premium(&mut payload);
        tracing::info!(model = %payload_model(&payload), "Premium model in non-stream mode, merging streamed reply");
        let resp = self.stream_generate_content(token, payload).await?;
        if resp.status != 200 {
            return Ok(resp);
        }
        let merged = merge_sse_body(resp.body).await?;
        Ok(UpstreamResponse::from_bytes(
            200,
            "application/json",
            serde_json::to_vec(&merged)?,
        ))
    }

    async fn smart_stream_generate_content(&self, token: &str, mut payload: Value) -> Result<UpstreamResponse> {
        if is_premium_model(payload_model(&payload)) {
            enhance_for_premium(&mut payload);
        } else {
            ensure_tool_config(&mut payload);
        }
        self.stream_generate_content(token, payload).await
    }
}

// ---------------------------------------------------------------------------
// Payload shaping
// ---------------------------------------------------------------------------

pub fn payload_model(payload: &Value) -> &str {
    payload.get("model").and_then(Value::as_str).unwrap_or_default()
}

pub fn is_premium_model(model: &str) -> bool {
    model.to_lowercase().contains("claude") || model.contains("gemini-3-pro")
}

fn validated_tool_config() -> Value {
    json!({"functionCallingConfig": {"mode": "VALIDATED"}})
}

fn inner_request(payload: &mut Value) -> Option<&mut Map<String, Value>> {
    payload.get_mut("request").and_then(Value::as_object_mut)
}

/// Add a VALIDATED `toolConfig` when the request has none.
pub fn ensure_tool_config(payload: &mut Value) {
    if let Some(req) = inner_request(payload) {
        req.entry("toolConfig").or_insert_with(validated_tool_config);
    }
}

/// Fill in `sessionId`, `toolConfig` and the identity `systemInstruction` when absent.
pub fn enhance_for_premium(payload: &mut Value) {
    let Some(req) = inner_request(payload) else {
        return;
    };
    req.entry("sessionId")
        .or_insert_with(|| Value::String(format!("-{}", rand::random::<u64>() >> 1)));
    req.entry("toolConfig").or_insert_with(validated_tool_config);
    req.entry("systemInstruction").or_insert_with(|| {
        json!({
            "role": "user",
            "parts": [
                {"text": IDENTITY_PROMPT},
                {"text": format!("Please ignore following [ignore]{}[/ignore]", IDENTITY_PROMPT)}
            ]
        })
    });
}

/// Default `userAgent`/`requestType`, and force VALIDATED function calling when
/// the request declares tools.
pub fn ensure_request_format(payload: &mut Value) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    obj.entry("userAgent")
        .or_insert_with(|| Value::String(USER_AGENT.to_string()));
    obj.entry("requestType")
        .or_insert_with(|| Value::String(REQUEST_TYPE.to_string()));

    let Some(req) = inner_request(payload) else {
        return;
    };
    let has_tools = req
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());
    if !has_tools {
        return;
    }
    let tool_config = req.entry("toolConfig").or_insert_with(validated_tool_config);
    if let Some(tc) = tool_config.as_object_mut() {
        match tc.get_mut("functionCallingConfig").and_then(Value::as_object_mut) {
            Some(fcc) => {
                fcc.insert("mode".to_string(), Value::String("VALIDATED".to_string()));
            }
            None => {
                tc.insert(
                    "functionCallingConfig".to_string(),
                    json!({"mode": "VALIDATED"}),
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stream merging
// ---------------------------------------------------------------------------

/// Folds streamed chunks into one `{"response": ...}` body. Adjacent text parts
/// are joined; thought, functionCall and inlineData parts stay separate.
#[derive(Debug, Default)]
pub struct SseMerger {
    last: Option<Map<String, Value>>,
    parts: Vec<Value>,
    text: String,
    trace_id: Option<String>,
    finish_reason: Option<String>,
    usage: Option<Value>,
    role: Option<String>,
}

impl SseMerger {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            let text = std::mem::take(&mut self.text);
            self.parts.push(json!({ "text": text }));
        }
    }

    pub fn push(&mut self, chunk: Value) {
        let Value::Object(chunk) = chunk else {
            return;
        };
        if let Some(tid) = chunk.get("traceId").and_then(Value::as_str).filter(|t| !t.is_empty()) {
            self.trace_id = Some(tid.to_string());
        }
        let resp = match chunk.get("response") {
            Some(Value::Object(inner)) => inner.clone(),
            _ => chunk.clone(),
        };
        self.last = Some(chunk);

        if let Some(usage) = resp.get("usageMetadata").filter(|u| u.is_object()) {
            self.usage = Some(usage.clone());
        }
        let Some(candidate) = resp
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
        else {
            return;
        };
        if let Some(fr) = candidate.get("finishReason").and_then(Value::as_str).filter(|f| !f.is_empty()) {
            self.finish_reason = Some(fr.to_string());
        }
        let Some(content) = candidate.get("content") else {
            return;
        };
        if let Some(role) = content.get("role").and_then(Value::as_str).filter(|r| !r.is_empty()) {
            self.role = Some(role.to_string());
        }
        let Some(parts) = content.get("parts").and_then(Value::as_array) else {
            return;
        };

        for part in parts {
            let Some(p) = part.as_object() else { continue };
            let mut p = p.clone();
            if let Some(inline) = p.remove("inline_data") {
                p.insert("inlineData".to_string(), inline);
            }
            let special = p.contains_key("functionCall") || p.contains_key("inlineData");
            let thought = p.get("thought").and_then(Value::as_bool).unwrap_or(false);

            match p.get("text").and_then(Value::as_str) {
                Some(text) if !special && !thought => self.text.push_str(text),
                _ => {
                    self.flush_text();
                    self.parts.push(Value::Object(p));
                }
            }
        }
    }

    pub fn finish(mut self) -> Value {
        self.flush_text();
        let Some(mut last) = self.last.take() else {
            return json!({"response": {"candidates": [{"content": {"parts": [{"text": ""}], "role": "model"}}]}});
        };
        if self.parts.is_empty() {
            self.parts.push(json!({"text": ""}));
        }

        if let Some(Value::Object(resp)) = last.get_mut("response") {
            if let Some(Value::Object(candidate)) = resp
                .get_mut("candidates")
                .and_then(Value::as_array_mut)
                .and_then(|c| c.first_mut())
            {
                if let Some(Value::Object(content)) = candidate.get_mut("content") {
                    content.insert("parts".to_string(), Value::Array(self.parts));
                    if let Some(role) = self.role {
                        content.insert("role".to_string(), Value::String(role));
                    }
                }
                if let Some(fr) = self.finish_reason {
                    candidate.insert("finishReason".to_string(), Value::String(fr));
                }
            }
            if let Some(usage) = self.usage {
                resp.insert("usageMetadata".to_string(), usage);
            }
        }
        if let Some(tid) = self.trace_id {
            last.insert("traceId".to_string(), Value::String(tid));
        }
        Value::Object(last)
    }
}

/// Read an SSE body to the end and merge its chunks.
pub async fn merge_sse_body(body: ByteStream) -> Result<Value> {
    let mut events = body.eventsource();
    let mut merger = SseMerger::new();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| GatewayError::upstream(format!("failed to merge SSE stream: {}", e)))?;
        if event.data == "[DONE]" {
            break;
        }
        match serde_json::from_str::<Value>(&event.data) {
            Ok(chunk) => merger.push(chunk),
            Err(e) => tracing::debug!(error = %e, "Skipping unparseable chunk while merging"),
        }
    }
    Ok(merger.finish())
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

const API_CLIENT: &str = "google-cloud-sdk vscode_cloudshelleditor/0.1";
const CLIENT_METADATA: &str =
    r#"{"ideType":"IDE_UNSPECIFIED","platform":"PLATFORM_UNSPECIFIED","pluginType":"GEMINI"}"#;

#[derive(Debug, Clone)]
pub struct CloudCodeClient {
    http: reqwest::Client,
    base_urls: Vec<String>,
    user_agent: String,
}

impl CloudCodeClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            http,
            base_urls: config.base_urls.clone(),
            user_agent: config.user_agent.clone(),
        }
    }

    fn should_fall_back(status: u16) -> bool {
        status == 429 || status == 403 || status >= 500
    }

    async fn post_with_fallback(
        &self,
        method: &str,
        stream: bool,
        token: &str,
        mut payload: Value,
    ) -> Result<UpstreamResponse> {
        ensure_request_format(&mut payload);
        let body = serde_json::to_vec(&payload)?;

        let mut last_resp: Option<reqwest::Response> = None;
        let mut last_err: Option<GatewayError> = None;

        for (i, base) in self.base_urls.iter().enumerate() {
            let url = if stream {
                format!("{}:{}?alt=sse", base, method)
            } else {
                format!("{}:{}", base, method)
            };

            let resp = self
                .http
                .post(&url)
                .bearer_auth(token)
                .header(CONTENT_TYPE, "application/json")
                .header("User-Agent", &self.user_agent)
                .header("X-Goog-Api-Client", API_CLIENT)
                .header("Client-Metadata", CLIENT_METADATA)
                .body(body.clone())
                .send()
                .await;

            let resp = match resp {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(endpoint = i + 1, base = %base, error = %e, "Endpoint failed");
                    last_err = Some(GatewayError::upstream(format!("request failed: {}", e)));
                    continue;
                }
            };

            let status = resp.status().as_u16();
            if status == 200 {
                if i > 0 {
                    tracing::info!(endpoint = i + 1, "Fallback endpoint succeeded");
                }
                return Ok(UpstreamResponse::from_reqwest(resp));
            }
            if Self::should_fall_back(status) {
                tracing::warn!(endpoint = i + 1, status, "Endpoint returned retryable status, trying next");
                last_resp = Some(resp);
                continue;
            }
            return Ok(UpstreamResponse::from_reqwest(resp));
        }

        match (last_resp, last_err) {
            (Some(resp), _) => Ok(UpstreamResponse::from_reqwest(resp)),
            (None, Some(err)) => Err(err),
            (None, None) => Err(GatewayError::config("no upstream endpoints configured")),
        }
    }
}

#[async_trait]
impl UpstreamClient for CloudCodeClient {
    async fn generate_content(&self, token: &str, payload: Value) -> Result<UpstreamResponse> {
        self.post_with_fallback("generateContent", false, token, payload).await
    }

    async fn stream_generate_content(&self, token: &str, payload: Value) -> Result<UpstreamResponse> {
        self.post_with_fallback("streamGenerateContent", true, token, payload).await
    }
}
