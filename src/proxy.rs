use crate::config::CompatProviderConfig;
use crate::credentials::CachedCredential;
use crate::error::{GatewayError, Result};
use crate::logging::{RequestRecord, SharedLogger};
use crate::router::{ResolvedRoute, RouteProtocol};
use crate::server::AppState;
use crate::stream_safety::StreamSafetyChecker;
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest};
use crate::translate::codex::{self as codex_translate, CodexCollector, CodexEvent, FILTERED_PARAMS_HEADER};
use crate::translate::gemini_types::{grounding_annotations, GenerateContentResponse};
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse};
use crate::translate::responses::{CompatContext, COMPAT_HEADER, COMPAT_HEADER_VALUE};
use crate::translate::responses_types::ResponsesRequest;
use crate::translate::streaming::{
    AnthropicReframer, ChatChunkReframer, CodexChatReframer, GenAiReframer, Reframer, ResponsesReframer, SseEvent,
};
use crate::translate::{anthropic, genai, openai_chat, responses};
use crate::upstream::{ByteStream, UpstreamResponse};

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::stream::{self, Stream};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Instant;

/// Longest single SSE line accepted from Cloud Code.
const CLOUD_CODE_MAX_LINE: usize = 8 * 1024 * 1024;
/// Codex sends whole responses in `response.completed`, so it gets more room.
const CODEX_MAX_LINE: usize = 10 * 1024 * 1024;

/// Client protocol of an inbound request; decides the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Anthropic,
    OpenAi,
    Responses,
    GenAi,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Anthropic => "anthropic",
            Protocol::OpenAi => "openai",
            Protocol::Responses => "responses",
            Protocol::GenAi => "genai",
        }
    }

    /// Error body in this protocol's own envelope.
    pub fn error_body(&self, status: u16, message: &str) -> Value {
        match self {
            Protocol::Anthropic => {
                serde_json::to_value(ErrorResponse::for_status(status, message)).unwrap_or_default()
            }
            Protocol::OpenAi | Protocol::Responses => {
                serde_json::to_value(ChatErrorResponse::new(status, message)).unwrap_or_default()
            }
            Protocol::GenAi => json!({
                "error": {
                    "code": status,
                    "message": message,
                    "status": genai_status(status),
                }
            }),
        }
    }
}

fn genai_status(status: u16) -> &'static str {
    match status {
        400 | 422 => "INVALID_ARGUMENT",
        401 => "UNAUTHENTICATED",
        403 => "PERMISSION_DENIED",
        404 => "NOT_FOUND",
        429 => "RESOURCE_EXHAUSTED",
        503 => "UNAVAILABLE",
        504 => "DEADLINE_EXCEEDED",
        _ => "INTERNAL",
    }
}

/// Stream of SSE frames for the client.
pub type SseStream = Pin<Box<dyn Stream<Item = std::result::Result<SseEvent, std::io::Error>> + Send>>;

pub enum ProxyBody {
    Json(Value),
    Sse(SseStream),
    /// Upstream bytes relayed untouched.
    Relay { content_type: String, body: ByteStream },
}

/// What the server writes back for one proxied request.
pub struct ProxyResult {
    pub status: u16,
    pub headers: Vec<(&'static str, String)>,
    pub body: ProxyBody,
}

impl ProxyResult {
    fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: 200,
            headers: Vec::new(),
            body: ProxyBody::Json(serde_json::to_value(value)?),
        })
    }

    fn sse(events: SseStream) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: ProxyBody::Sse(events),
        }
    }

    fn relay(status: u16, content_type: impl Into<String>, body: ByteStream) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ProxyBody::Relay {
                content_type: content_type.into(),
                body,
            },
        }
    }

    pub fn error_status(protocol: Protocol, status: u16, message: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ProxyBody::Json(protocol.error_body(status, message)),
        }
    }

    pub fn error(protocol: Protocol, err: &GatewayError) -> Self {
        // Responses clients expect "no accounts" as unavailable, not unauthorized.
        let status = match (protocol, err) {
            (Protocol::Responses, GatewayError::NoValidCredential) => 503,
            _ => err.status_code(),
        };
        Self::error_status(protocol, status, &err.to_string())
    }

    fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn with_filtered_params(self, filtered: &[String]) -> Self {
        if filtered.is_empty() {
            self
        } else {
            self.with_header(FILTERED_PARAMS_HEADER, filtered.join(","))
        }
    }
}

/// Per-request values taken from the inbound headers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    /// `X-Nexus-Account`: explicit account id or email.
    pub account: Option<String>,
}

/// Builds the monitor record for one request. Streaming paths hand it off to
/// the stream, which records once the stream has ended.
pub struct RequestTrace {
    logger: SharedLogger,
    record: RequestRecord,
    started: Instant,
    handed_off: bool,
}

impl RequestTrace {
    pub fn new(logger: &SharedLogger, request_id: &str, protocol: Protocol) -> Self {
        Self {
            logger: logger.clone(),
            record: RequestRecord {
                request_id: request_id.to_string(),
                timestamp: chrono::Utc::now(),
                protocol: protocol.as_str().to_string(),
                ..Default::default()
            },
            started: Instant::now(),
            handed_off: false,
        }
    }

    fn start(&mut self, client_model: &str, stream: bool) {
        self.record.client_model = client_model.to_string();
        self.record.stream = stream;
    }

    fn route(&mut self, route: &ResolvedRoute) {
        self.record.mapped_model = route.target_model.clone();
        self.record.provider = route.provider.clone();
    }

    fn tokens(&mut self, input: u64, output: u64) {
        self.record.input_tokens = input;
        self.record.output_tokens = output;
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.record.error = Some(message.into());
    }

    fn hand_off(&mut self) -> RequestTrace {
        self.handed_off = true;
        RequestTrace {
            logger: self.logger.clone(),
            record: self.record.clone(),
            started: self.started,
            handed_off: false,
        }
    }

    fn finish(mut self, status: u16) {
        if self.handed_off {
            return;
        }
        self.record.status = status;
        self.record.duration_ms = self.started.elapsed().as_millis() as u64;
        let r = &self.record;
        tracing::info!(
            request_id = %r.request_id,
            protocol = %r.protocol,
            model = %r.client_model,
            mapped = %r.mapped_model,
            provider = %r.provider,
            status = r.status,
            duration_ms = r.duration_ms,
            input_tokens = r.input_tokens,
            output_tokens = r.output_tokens,
            "Request finished"
        );
        self.logger.record(self.record);
    }

    /// Render the outcome for the client and record it.
    fn settle(mut self, protocol: Protocol, result: Result<ProxyResult>) -> ProxyResult {
        match result {
            Ok(result) => {
                if result.status >= 400 && self.record.error.is_none() {
                    self.fail(format!("status {}", result.status));
                }
                self.finish(result.status);
                result
            }
            Err(e) => {
                tracing::warn!(request_id = %self.record.request_id, error = %e, "Request failed");
                self.logger
                    .warn("proxy", format!("{} {}: {}", protocol.as_str(), self.record.request_id, e));
                let result = ProxyResult::error(protocol, &e);
                self.fail(e.to_string());
                self.finish(result.status);
                result
            }
        }
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| GatewayError::validation(format!("Invalid request body: {}", e)))
}

fn log_payload(state: &AppState, label: &str, payload: &Value) {
    if state.config.verbose {
        tracing::debug!(payload = %payload, "{}", label);
    }
}

async fn credential(state: &AppState, ctx: &RequestContext, trace: &mut RequestTrace) -> Result<CachedCredential> {
    let cred = match ctx.account.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        Some(identifier) => state.credentials.select_by_identifier(identifier).await?,
        None => state.credentials.select_primary_or_default().await?,
    };
    trace.record.account_email = cred.email.clone();
    Ok(cred)
}

async fn call_cloud_code(state: &AppState, token: &str, payload: Value, stream: bool) -> Result<UpstreamResponse> {
    if stream {
        state.upstream.smart_stream_generate_content(token, payload).await
    } else {
        state.upstream.smart_generate_content(token, payload).await
    }
}

/// Pass a non-2xx upstream body through verbatim, before any SSE has started.
async fn relay_upstream_error(resp: UpstreamResponse, trace: &mut RequestTrace) -> Result<ProxyResult> {
    let status = resp.status;
    let body = resp.bytes().await?;
    let text = String::from_utf8_lossy(&body);
    tracing::warn!(status, body = %truncate(&text, 300), "Upstream returned an error");
    trace.fail(format!("upstream status {}: {}", status, truncate(&text, 200)));
    Ok(ProxyResult::relay(status, "application/json", once(body)))
}

fn once(body: Bytes) -> ByteStream {
    Box::pin(stream::once(async move { Ok(body) }))
}

fn codex_unavailable(protocol: Protocol, trace: &mut RequestTrace) -> Result<ProxyResult> {
    trace.fail("Codex provider not initialized");
    Ok(ProxyResult::error_status(protocol, 503, "Codex provider not initialized"))
}

// ---------------------------------------------------------------------------
// Anthropic Messages
// ---------------------------------------------------------------------------

pub async fn anthropic_messages(state: &AppState, ctx: &RequestContext, body: &[u8]) -> ProxyResult {
    let mut trace = RequestTrace::new(&state.logger, &ctx.request_id, Protocol::Anthropic);
    let result = anthropic_inner(state, ctx, body, &mut trace).await;
    trace.settle(Protocol::Anthropic, result)
}

async fn anthropic_inner(
    state: &AppState,
    ctx: &RequestContext,
    body: &[u8],
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let req: MessagesRequest = parse_body(body)?;
    let stream = req.stream.unwrap_or(false);
    trace.start(&req.model, stream);

    let route = state
        .router
        .resolve_for_protocol(&req.model, RouteProtocol::Anthropic)?;
    trace.route(&route);
    let cred = credential(state, ctx, trace).await?;

    let payload = anthropic::build_request(
        &req,
        &route.target_model,
        &cred.project_id,
        &ctx.request_id,
        state.config.schema_strictness(),
    );
    let payload = serde_json::to_value(&payload)?;
    log_payload(state, "Anthropic request translated", &payload);

    state.logger.info(
        "proxy",
        format!(
            "anthropic model={} -> {} streaming={} messages={}",
            req.model,
            route.target_model,
            stream,
            req.messages.len()
        ),
    );

    let resp = call_cloud_code(state, &cred.access_token, payload, stream).await?;
    if !resp.is_success() {
        return relay_upstream_error(resp, trace).await;
    }

    if stream {
        let events = reframe(
            resp.body,
            AnthropicReframer::new(&req.model),
            Some(StreamSafetyChecker::default()),
            CLOUD_CODE_MAX_LINE,
            trace.hand_off(),
        );
        return Ok(ProxyResult::sse(events));
    }

    let body = resp.bytes().await?;
    let reply = GenerateContentResponse::from_slice(&body)?;
    let message = anthropic::from_response(&reply, &req.model);
    trace.tokens(message.usage.input_tokens, message.usage.output_tokens);
    ProxyResult::json(&message)
}

// ---------------------------------------------------------------------------
// OpenAI Chat Completions
// ---------------------------------------------------------------------------

pub async fn chat_completions(state: &AppState, ctx: &RequestContext, body: &[u8]) -> ProxyResult {
    let mut trace = RequestTrace::new(&state.logger, &ctx.request_id, Protocol::OpenAi);
    let result = chat_inner(state, ctx, body, &mut trace).await;
    trace.settle(Protocol::OpenAi, result)
}

async fn chat_inner(
    state: &AppState,
    ctx: &RequestContext,
    body: &[u8],
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let req: ChatCompletionRequest = parse_body(body)?;
    let stream = req.stream.unwrap_or(false);
    trace.start(&req.model, stream);

    let route = state
        .router
        .resolve_for_protocol(&req.model, RouteProtocol::OpenAi)?;
    trace.route(&route);

    if route.provider == "codex" {
        return chat_via_codex(state, &req, &route, trace).await;
    }
    if state.router.policy().is_compat_provider(&route.provider) {
        if let Some(provider) = state.config.compat_provider(&route.provider) {
            return chat_via_compat(state, provider, body, &route, trace).await;
        }
    }

    let cred = credential(state, ctx, trace).await?;
    let payload = openai_chat::build_request(
        &req,
        &route.target_model,
        &cred.project_id,
        &ctx.request_id,
        state.config.schema_strictness(),
    );
    let payload = serde_json::to_value(&payload)?;
    log_payload(state, "Chat request translated", &payload);

    let resp = call_cloud_code(state, &cred.access_token, payload, stream).await?;
    if !resp.is_success() {
        return relay_upstream_error(resp, trace).await;
    }

    if stream {
        let events = reframe(
            resp.body,
            ChatChunkReframer::new(&req.model),
            Some(StreamSafetyChecker::default()),
            CLOUD_CODE_MAX_LINE,
            trace.hand_off(),
        );
        return Ok(ProxyResult::sse(events));
    }

    let body = resp.bytes().await?;
    let reply = GenerateContentResponse::from_slice(&body)?;
    let completion = openai_chat::from_response(&reply, &req.model);
    if let Some(usage) = &completion.usage {
        trace.tokens(usage.prompt_tokens, usage.completion_tokens);
    }
    ProxyResult::json(&completion)
}

async fn chat_via_codex(
    state: &AppState,
    req: &ChatCompletionRequest,
    route: &ResolvedRoute,
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let Some(backend) = state.codex.clone() else {
        return codex_unavailable(Protocol::OpenAi, trace);
    };
    let stream = req.stream.unwrap_or(false);

    let mut payload = codex_translate::chat_to_responses(req);
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".to_string(), Value::String(route.target_model.clone()));
    }
    let filtered = codex_translate::prepare_payload(&mut payload)?;
    if !filtered.is_empty() {
        tracing::info!(params = %filtered.join(","), "Removed parameters Codex does not accept");
    }
    log_payload(state, "Codex payload", &payload);

    let resp = backend.stream_responses(payload).await?;
    let result = if !resp.is_success() {
        relay_upstream_error(resp, trace).await?
    } else if stream {
        ProxyResult::sse(reframe(
            resp.body,
            CodexChatReframer::new(&req.model),
            None,
            CODEX_MAX_LINE,
            trace.hand_off(),
        ))
    } else {
        let collector = collect_codex(resp.body).await?;
        let completion = collector.finish(&trace.record.request_id, &req.model);
        if let Some(usage) = &completion.usage {
            trace.tokens(usage.prompt_tokens, usage.completion_tokens);
        }
        ProxyResult::json(&completion)?
    };
    Ok(result.with_filtered_params(&filtered))
}

/// Read a Codex SSE body up to `response.completed`.
async fn collect_codex(body: ByteStream) -> Result<CodexCollector> {
    let mut events = body.eventsource();
    let mut collector = CodexCollector::new();
    while let Some(event) = events.next().await {
        let event = event.map_err(|e| GatewayError::upstream(format!("Codex stream error: {}", e)))?;
        if event.data == "[DONE]" {
            break;
        }
        match CodexEvent::parse(&event.data) {
            Ok(parsed) => {
                let completed = matches!(parsed, CodexEvent::Completed { .. });
                collector.push(parsed);
                if completed {
                    break;
                }
            }
            Err(e) => tracing::debug!(error = %e, "Skipping unparseable Codex event"),
        }
    }
    Ok(collector)
}

/// Forward the raw chat body to an OpenAI-compatible provider.
async fn chat_via_compat(
    state: &AppState,
    provider: &CompatProviderConfig,
    body: &[u8],
    route: &ResolvedRoute,
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let api_key = provider.resolve_api_key()?;
    let mut payload: Value = parse_body(body)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("model".to_string(), Value::String(route.target_model.clone()));
    }

    let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));
    state
        .logger
        .info("proxy", format!("Compat POST {} model={}", url, route.target_model));

    let response = state
        .client
        .post(&url)
        .bearer_auth(api_key)
        .header("Content-Type", "application/json")
        .json(&payload)
        .send()
        .await
        .map_err(|e| GatewayError::upstream(format!("{} request failed: {}", provider.id, e)))?;

    let resp = UpstreamResponse::from_reqwest(response);
    let content_type = resp
        .headers
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    if !resp.is_success() {
        trace.fail(format!("{} returned status {}", provider.id, resp.status));
    }
    Ok(ProxyResult::relay(resp.status, content_type, resp.body))
}

// ---------------------------------------------------------------------------
// OpenAI Responses
// ---------------------------------------------------------------------------

pub async fn responses(state: &AppState, ctx: &RequestContext, body: &[u8]) -> ProxyResult {
    let mut trace = RequestTrace::new(&state.logger, &ctx.request_id, Protocol::Responses);
    let result = responses_inner(state, ctx, body, &mut trace).await;
    trace.settle(Protocol::Responses, result)
}

async fn responses_inner(
    state: &AppState,
    ctx: &RequestContext,
    body: &[u8],
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let req: ResponsesRequest = parse_body(body)?;
    let stream = req.is_stream();
    trace.start(&req.model, stream);

    let route = state.router.resolve(&req.model, &state.config.default_provider);
    trace.route(&route);

    if route.provider == "codex" {
        return responses_via_codex(state, body, &route, trace).await;
    }

    let cred = credential(state, ctx, trace).await?;
    let (upstream_request_id, smuggled) = CompatContext::from_request(&req).encode_request_id(&ctx.request_id);
    let chat = responses::to_chat_request(&req);
    let payload = openai_chat::build_request(
        &chat,
        &route.target_model,
        &cred.project_id,
        &upstream_request_id,
        state.config.schema_strictness(),
    );
    let payload = serde_json::to_value(&payload)?;
    log_payload(state, "Responses request translated", &payload);

    let resp = call_cloud_code(state, &cred.access_token, payload, stream).await?;
    if !resp.is_success() {
        return relay_upstream_error(resp, trace).await;
    }

    let compat = CompatContext::decode_request_id(&upstream_request_id);
    let result = if stream {
        ProxyResult::sse(reframe(
            resp.body,
            ResponsesReframer::new(&req.model, compat),
            Some(StreamSafetyChecker::default()),
            CLOUD_CODE_MAX_LINE,
            trace.hand_off(),
        ))
    } else {
        let body = resp.bytes().await?;
        let reply = GenerateContentResponse::from_slice(&body)?;
        let chat = openai_chat::from_response(&reply, &req.model);
        let annotations = reply
            .grounding_metadata()
            .map(grounding_annotations)
            .unwrap_or_default();
        let mut out = responses::from_chat_response(&chat, annotations);
        compat.apply(&mut out);
        if let Some(usage) = &out.usage {
            trace.tokens(usage.prompt_tokens, usage.completion_tokens);
        }
        ProxyResult::json(&out)?
    };

    Ok(if smuggled {
        result.with_header(COMPAT_HEADER, COMPAT_HEADER_VALUE)
    } else {
        result
    })
}

/// Normalize the client's Responses body and relay the Codex SSE untouched.
async fn responses_via_codex(
    state: &AppState,
    body: &[u8],
    route: &ResolvedRoute,
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let Some(backend) = state.codex.clone() else {
        return codex_unavailable(Protocol::Responses, trace);
    };

    let mut payload: Value = parse_body(body)?;
    codex_translate::normalize_responses_payload(&mut payload, &route.target_model)?;
    let filtered = codex_translate::prepare_payload(&mut payload)?;
    log_payload(state, "Codex passthrough payload", &payload);

    let resp = backend.stream_responses(payload).await?;
    let result = if resp.is_success() {
        ProxyResult::relay(resp.status, "text/event-stream", resp.body)
    } else {
        relay_upstream_error(resp, trace).await?
    };
    Ok(result.with_filtered_params(&filtered))
}

// ---------------------------------------------------------------------------
// GenAI passthrough
// ---------------------------------------------------------------------------

/// `model_action` is the `{model}:{method}` path segment.
pub async fn genai(state: &AppState, ctx: &RequestContext, model_action: &str, body: &[u8]) -> ProxyResult {
    let mut trace = RequestTrace::new(&state.logger, &ctx.request_id, Protocol::GenAi);
    let result = genai_inner(state, ctx, model_action, body, &mut trace).await;
    trace.settle(Protocol::GenAi, result)
}

async fn genai_inner(
    state: &AppState,
    ctx: &RequestContext,
    model_action: &str,
    body: &[u8],
    trace: &mut RequestTrace,
) -> Result<ProxyResult> {
    let (model, method) = model_action
        .split_once(':')
        .ok_or_else(|| GatewayError::validation(format!("expected {{model}}:{{method}}, got \"{}\"", model_action)))?;
    let stream = match method {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(GatewayError::validation(format!("unsupported method \"{}\"", other)));
        }
    };
    trace.start(model, stream);

    let route = state
        .router
        .resolve_for_protocol(model, RouteProtocol::GenAi)?;
    trace.route(&route);

    let body: Value = parse_body(body)?;
    let cred = credential(state, ctx, trace).await?;
    let payload = genai::wrap_request(body, &cred.project_id, &ctx.request_id, &route.target_model)?;
    log_payload(state, "GenAI request wrapped", &payload);

    let resp = call_cloud_code(state, &cred.access_token, payload, stream).await?;
    if !resp.is_success() {
        return relay_upstream_error(resp, trace).await;
    }

    if stream {
        return Ok(ProxyResult::sse(reframe(
            resp.body,
            GenAiReframer::new(),
            Some(StreamSafetyChecker::default()),
            CLOUD_CODE_MAX_LINE,
            trace.hand_off(),
        )));
    }

    let body = resp.bytes().await?;
    let inner = genai::unwrap_response(&body)
        .ok_or_else(|| GatewayError::conversion("backend reply has no response field"))?;
    if let Some(usage) = GenerateContentResponse::from_value(inner.clone())
        .ok()
        .and_then(|r| r.usage_metadata)
    {
        trace.tokens(usage.prompt_token_count, usage.candidates_token_count);
    }
    ProxyResult::json(&inner)
}

// ---------------------------------------------------------------------------
// Stream loop
// ---------------------------------------------------------------------------

fn sse_data(line: &str) -> Option<&str> {
    if let Some(stripped) = line.strip_prefix("data: ") {
        Some(stripped.trim())
    } else {
        line.strip_prefix("data:").map(str::trim)
    }
}

/// Read backend SSE lines one at a time and re-emit them through `reframer`.
///
/// Terminal framing is always emitted, whether the backend sent `[DONE]`,
/// ended abruptly, failed mid-read or tripped the safety checker.
fn reframe<R: Reframer + 'static>(
    mut body: ByteStream,
    mut reframer: R,
    mut safety: Option<StreamSafetyChecker>,
    max_line: usize,
    mut trace: RequestTrace,
) -> SseStream {
    Box::pin(async_stream::stream! {
        let mut buffer: Vec<u8> = Vec::new();
        // Bytes of `buffer` already known to hold no newline.
        let mut scanned = 0usize;

        'read: while let Some(chunk_result) = body.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(request_id = %trace.record.request_id, error = %e, "Upstream stream read failed");
                    trace.fail(format!("stream read error: {}", e));
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);

            while let Some(offset) = buffer[scanned..].iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=scanned + offset).collect();
                scanned = 0;
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let Some(data) = sse_data(&line) else {
                    continue;
                };

                if data == "[DONE]" {
                    break 'read;
                }

                if let Some(checker) = safety.as_mut() {
                    if let Some(abort) = checker.check(data.as_bytes()) {
                        tracing::warn!(request_id = %trace.record.request_id, reason = %abort, "Stream aborted by safety check");
                        trace.fail(abort.to_string());
                        break 'read;
                    }
                }

                let parsed = match R::parse(data) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping unparseable chunk");
                        continue;
                    }
                };

                for event in reframer.process_chunk(&parsed) {
                    yield Ok(event);
                }
                if reframer.is_complete() {
                    break 'read;
                }
            }

            scanned = buffer.len();

            if buffer.len() > max_line {
                tracing::error!(request_id = %trace.record.request_id, len = buffer.len(), "SSE line exceeds limit");
                trace.fail("SSE line exceeds limit");
                break;
            }
        }

        for event in reframer.finish() {
            yield Ok(event);
        }

        let (input, output) = reframer.tokens();
        trace.tokens(input, output);
        trace.logger.debug("stream", format!("Stream completed: {}", trace.record.request_id));
        trace.finish(200);
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_of(chunks: Vec<&'static str>) -> ByteStream {
        Box::pin(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))),
        ))
    }

    fn trace(dir: &tempfile::TempDir) -> (SharedLogger, RequestTrace) {
        let logger = SharedLogger::new(dir.path().join("requests.jsonl")).unwrap();
        let mut trace = RequestTrace::new(&logger, "req-1", Protocol::OpenAi);
        trace.start("gpt-4o", true);
        (logger, trace)
    }

    async fn collect(events: SseStream) -> Vec<SseEvent> {
        events.map(|e| e.unwrap()).collect().await
    }

    #[test]
    fn test_error_envelopes() {
        let body = Protocol::Anthropic.error_body(401, "no token");
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["message"], "no token");

        let body = Protocol::OpenAi.error_body(502, "down");
        assert_eq!(body["error"]["message"], "down");
        assert_eq!(body["error"]["type"], "api_error");
        assert_eq!(body["error"]["code"], 502);

        let body = Protocol::GenAi.error_body(400, "bad");
        assert_eq!(body["error"]["code"], 400);
        assert_eq!(body["error"]["status"], "INVALID_ARGUMENT");
    }

    #[test]
    fn test_error_result_uses_status_code() {
        let result = ProxyResult::error(Protocol::Responses, &GatewayError::NoValidCredential);
        assert_eq!(result.status, 503);
        match result.body {
            ProxyBody::Json(v) => assert_eq!(v["error"]["code"], 503),
            _ => panic!("expected json body"),
        }
    }

    #[test]
    fn test_missing_credential_is_unauthorized_outside_responses() {
        for protocol in [Protocol::Anthropic, Protocol::OpenAi, Protocol::GenAi] {
            let result = ProxyResult::error(protocol, &GatewayError::NoValidCredential);
            assert_eq!(result.status, 401, "{:?}", protocol);
        }
        let result = ProxyResult::error(Protocol::Anthropic, &GatewayError::NoValidCredential);
        match result.body {
            ProxyBody::Json(v) => assert_eq!(v["error"]["type"], "authentication_error"),
            _ => panic!("expected json body"),
        }
    }

    #[test]
    fn test_sse_data_prefixes() {
        assert_eq!(sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(sse_data("data:[DONE]"), Some("[DONE]"));
        assert_eq!(sse_data("event: ping"), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[tokio::test]
    async fn test_reframe_single_done_with_terminator() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, trace) = trace(&dir);
        let body = body_of(vec![
            "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hi\"}]}}]}}\n\n",
            "data: [DONE]\n\n",
        ]);
        let events = collect(reframe(body, ChatChunkReframer::new("gpt-4o"), None, CLOUD_CODE_MAX_LINE, trace)).await;
        assert_eq!(events.iter().filter(|e| e.is_done()).count(), 1);
        assert!(events.last().unwrap().is_done());
        assert_eq!(logger.recent(1)[0].status, 200);
    }

    #[tokio::test]
    async fn test_reframe_split_lines_and_bad_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (_logger, trace) = trace(&dir);
        let body = body_of(vec![
            "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",",
            "\"parts\":[{\"text\":\"Hi\"}]}}]}}\n\ndata: not json\n\n",
        ]);
        let events = collect(reframe(body, ChatChunkReframer::new("gpt-4o"), None, CLOUD_CODE_MAX_LINE, trace)).await;
        assert_eq!(events.len(), 2);
        let chunk: Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(chunk["choices"][0]["delta"]["content"], "Hi");
        assert!(events[1].is_done());
    }

    #[tokio::test]
    async fn test_reframe_line_trickled_byte_by_byte() {
        let dir = tempfile::tempdir().unwrap();
        let (_logger, trace) = trace(&dir);
        let first = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}}\n\n";
        let mut chunks: Vec<Bytes> = first.bytes().map(|b| Bytes::copy_from_slice(&[b])).collect();
        chunks.push(Bytes::from_static(
            b"data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\" there\"}]}}]}}\n\ndata: [DONE]\n\n",
        ));
        let body: ByteStream = Box::pin(stream::iter(chunks.into_iter().map(Ok::<Bytes, std::io::Error>)));

        let events = collect(reframe(body, ChatChunkReframer::new("gpt-4o"), None, CLOUD_CODE_MAX_LINE, trace)).await;
        assert_eq!(events.len(), 3);
        let texts: Vec<String> = events[..2]
            .iter()
            .map(|e| {
                let chunk: Value = serde_json::from_str(&e.data).unwrap();
                chunk["choices"][0]["delta"]["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(texts, vec!["Hi", " there"]);
        assert!(events[2].is_done());
    }

    #[tokio::test]
    async fn test_reframe_safety_abort_still_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, trace) = trace(&dir);
        let line = "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"x\"}]}}]}}\n\n";
        let body = body_of(vec![line; 20]);
        let events = collect(reframe(
            body,
            ChatChunkReframer::new("gpt-4o"),
            Some(StreamSafetyChecker::default()),
            CLOUD_CODE_MAX_LINE,
            trace,
        ))
        .await;
        assert!(events.len() < 20);
        assert!(events.last().unwrap().is_done());
        assert_eq!(
            logger.recent(1)[0].error.as_deref(),
            Some("repeated chunk detected")
        );
    }

    #[tokio::test]
    async fn test_reframe_codex_stops_at_completed() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, trace) = trace(&dir);
        let body = body_of(vec![
            "event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"He\"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"llo\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":3,\"output_tokens\":2,\"total_tokens\":5}}}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"late\"}\n\n",
        ]);
        let events = collect(reframe(body, CodexChatReframer::new("gpt-5"), None, CODEX_MAX_LINE, trace)).await;
        assert_eq!(events.len(), 3);
        let first: Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(first["id"], "msg_1");
        assert!(events[2].is_done());
        let record = &logger.recent(1)[0];
        assert_eq!((record.input_tokens, record.output_tokens), (3, 2));
    }

    #[tokio::test]
    async fn test_reframe_oversized_line_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (logger, trace) = trace(&dir);
        let body = body_of(vec!["data: 0123456789", "0123456789"]);
        let events = collect(reframe(body, ChatChunkReframer::new("gpt-4o"), None, 8, trace)).await;
        assert_eq!(events, vec![SseEvent::done()]);
        assert!(logger.recent(1)[0].error.is_some());
    }

    #[tokio::test]
    async fn test_collect_codex() {
        let body = body_of(vec![
            "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"delta\":\"Hello \"}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"delta\":\"world\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":{\"input_tokens\":4,\"output_tokens\":2,\"total_tokens\":6}}}\n\n",
        ]);
        let completion = collect_codex(body).await.unwrap().finish("req-9", "gpt-5");
        let value = serde_json::to_value(&completion).unwrap();
        assert_eq!(value["id"], "chatcmpl-codex-req-9");
        assert_eq!(value["choices"][0]["message"]["content"], "Hello world");
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert_eq!(value["usage"], json!({"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}));
    }
}
