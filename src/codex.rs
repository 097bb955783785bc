//! Codex (ChatGPT backend) provider.
//!
//! Credentials come from the Codex CLI's `auth.json`. The access token is a JWT
//! whose claims carry the account email, plan and expiry; it is refreshed with
//! the stored refresh token shortly before it expires and written back.

use crate::config::CodexConfig;
use crate::error::{GatewayError, Result};
use crate::translate::codex::SUPPORTED_MODELS;
use crate::upstream::UpstreamResponse;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

pub const TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

const CLI_VERSION: &str = "0.94.0";
const CLI_USER_AGENT: &str = "codex_cli_rs/0.94.0 (Mac OS 26.0.1; arm64)";
const ORIGINATOR: &str = "codex_cli_rs";

fn refresh_margin() -> Duration {
    Duration::minutes(5)
}

// ---------------------------------------------------------------------------
// auth.json and JWT claims
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthFile {
    #[serde(rename = "OPENAI_API_KEY", default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub tokens: Option<TokenData>,
    #[serde(default)]
    pub last_refresh: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenData {
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub account_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct JwtClaims {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub exp: i64,
    #[serde(rename = "https://api.openai.com/auth", default)]
    pub auth: OpenAiAuthClaims,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OpenAiAuthClaims {
    #[serde(default)]
    pub chatgpt_account_id: String,
    #[serde(default)]
    pub chatgpt_plan_type: String,
}

/// Decode the payload segment of a JWT. The signature is not checked.
pub fn parse_jwt(token: &str) -> Result<JwtClaims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(GatewayError::auth(format!(
            "invalid JWT format: expected 3 parts, got {}",
            segments.len()
        )));
    }
    let raw = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| GatewayError::auth(format!("failed to decode JWT payload: {}", e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| GatewayError::auth(format!("failed to parse JWT claims: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodexQuota {
    pub email: String,
    pub plan_type: String,
    pub account_id: String,
    pub has_access: bool,
    pub models: Vec<String>,
}

pub fn plan_has_access(plan: &str) -> bool {
    matches!(plan, "plus" | "pro" | "team")
}

// ---------------------------------------------------------------------------
// Token source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AuthState {
    auth: AuthFile,
    email: String,
    plan_type: String,
    expires_at: Option<DateTime<Utc>>,
}

impl AuthState {
    fn from_file(auth: AuthFile) -> Result<Self> {
        let tokens = auth
            .tokens
            .as_ref()
            .filter(|t| !t.access_token.is_empty())
            .ok_or_else(|| GatewayError::auth("no valid tokens in auth.json"))?;

        let id_claims = parse_jwt(&tokens.id_token).ok();
        let expires_at = parse_jwt(&tokens.access_token)
            .ok()
            .and_then(|c| Utc.timestamp_opt(c.exp, 0).single());

        Ok(Self {
            email: id_claims.as_ref().map(|c| c.email.clone()).unwrap_or_default(),
            plan_type: id_claims
                .map(|c| c.auth.chatgpt_plan_type)
                .unwrap_or_default(),
            expires_at,
            auth,
        })
    }

    fn tokens(&self) -> Option<&TokenData> {
        self.auth.tokens.as_ref()
    }

    fn fresh_token(&self, now: DateTime<Utc>) -> Option<String> {
        let expires_at = self.expires_at?;
        if now < expires_at - refresh_margin() {
            self.tokens().map(|t| t.access_token.clone())
        } else {
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    id_token: String,
    #[serde(default)]
    expires_in: i64,
}

/// Reads, refreshes and persists the Codex CLI credentials.
pub struct CodexTokenSource {
    http: reqwest::Client,
    auth_path: PathBuf,
    token_url: String,
    state: RwLock<Option<AuthState>>,
}

impl CodexTokenSource {
    pub fn new(http: reqwest::Client, auth_path: impl Into<PathBuf>) -> Self {
        Self {
            http,
            auth_path: auth_path.into(),
            token_url: TOKEN_URL.to_string(),
            state: RwLock::new(None),
        }
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn auth_path(&self) -> &Path {
        &self.auth_path
    }

    fn read_file(&self) -> Result<AuthState> {
        let raw = std::fs::read(&self.auth_path)
            .map_err(|e| GatewayError::auth(format!("failed to read {}: {}", self.auth_path.display(), e)))?;
        let auth: AuthFile = serde_json::from_slice(&raw)
            .map_err(|e| GatewayError::auth(format!("failed to parse auth.json: {}", e)))?;
        AuthState::from_file(auth)
    }

    pub fn load(&self) -> Result<()> {
        let state = self.read_file()?;
        tracing::info!(
            email = %state.email,
            plan = %state.plan_type,
            expires_at = ?state.expires_at,
            "Codex auth loaded"
        );
        *self.state.write() = Some(state);
        Ok(())
    }

    /// (email, plan type, account id) of the loaded credentials.
    pub fn account_info(&self) -> Option<(String, String, String)> {
        let state = self.state.read();
        let state = state.as_ref()?;
        let account_id = state.tokens().map(|t| t.account_id.clone()).unwrap_or_default();
        Some((state.email.clone(), state.plan_type.clone(), account_id))
    }

    pub fn account_id(&self) -> Option<String> {
        self.account_info()
            .map(|(_, _, id)| id)
            .filter(|id| !id.is_empty())
    }

    /// A token valid for at least the refresh margin, refreshing if needed.
    pub async fn access_token(&self) -> Result<String> {
        let now = Utc::now();
        if let Some(token) = self.state.read().as_ref().and_then(|s| s.fresh_token(now)) {
            return Ok(token);
        }

        // The Codex CLI may have refreshed the file itself.
        if let Ok(state) = self.read_file() {
            let token = state.fresh_token(now);
            *self.state.write() = Some(state);
            if let Some(token) = token {
                return Ok(token);
            }
        }

        self.refresh().await
    }

    async fn refresh(&self) -> Result<String> {
        let refresh_token = self
            .state
            .read()
            .as_ref()
            .and_then(|s| s.tokens().map(|t| t.refresh_token.clone()))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::auth("no Codex auth data loaded"))?;

        tracing::info!("Refreshing Codex access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", CLIENT_ID),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("scope", "openid profile email"),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Codex refresh request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(GatewayError::auth(format!(
                "Codex refresh failed ({}): {}",
                status.as_u16(),
                body
            )));
        }
        let refreshed: RefreshResponse = serde_json::from_str(&body)?;

        let snapshot = {
            let mut guard = self.state.write();
            let state = guard
                .as_mut()
                .ok_or_else(|| GatewayError::auth("no Codex auth data loaded"))?;
            let tokens = state.auth.tokens.get_or_insert_with(TokenData::default);
            tokens.access_token = refreshed.access_token.clone();
            tokens.id_token = refreshed.id_token.clone();
            if !refreshed.refresh_token.is_empty() {
                tokens.refresh_token = refreshed.refresh_token.clone();
            }
            state.auth.last_refresh = Utc::now().to_rfc3339();
            state.expires_at = Some(Utc::now() + Duration::seconds(refreshed.expires_in));
            if let Ok(claims) = parse_jwt(&refreshed.id_token) {
                state.email = claims.email;
                state.plan_type = claims.auth.chatgpt_plan_type;
            }
            state.auth.clone()
        };

        if let Err(e) = write_auth_file(&self.auth_path, &snapshot) {
            tracing::warn!(error = %e, "Failed to save refreshed auth.json");
        }
        tracing::info!("Codex token refreshed");
        Ok(refreshed.access_token)
    }
}

/// Write `auth` atomically with owner-only permissions.
pub fn write_auth_file(path: &Path, auth: &AuthFile) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(auth)?)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

#[async_trait]
pub trait CodexBackend: Send + Sync {
    /// POST a prepared Responses payload and return the raw SSE response.
    async fn stream_responses(&self, payload: Value) -> Result<UpstreamResponse>;

    fn quota(&self) -> Result<CodexQuota>;
}

pub struct CodexClient {
    http: reqwest::Client,
    base_url: String,
    tokens: CodexTokenSource,
}

impl CodexClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, tokens: CodexTokenSource) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            tokens,
        }
    }

    /// Build a client from config, loading `auth.json`. Returns `None` when the
    /// provider is disabled or has no usable credentials.
    pub fn from_config(http: reqwest::Client, config: &CodexConfig, auth_file: Option<PathBuf>) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let path = auth_file?;
        let tokens = CodexTokenSource::new(http.clone(), path);
        match tokens.load() {
            Ok(()) => Some(Self::new(http, config.base_url.clone(), tokens)),
            Err(e) => {
                tracing::info!(error = %e, "Codex provider not available");
                None
            }
        }
    }
}

#[async_trait]
impl CodexBackend for CodexClient {
    async fn stream_responses(&self, payload: Value) -> Result<UpstreamResponse> {
        let token = self.tokens.access_token().await?;
        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));

        let mut request = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .header("User-Agent", CLI_USER_AGENT)
            .header("Version", CLI_VERSION)
            .header("Openai-Beta", "responses=experimental")
            .header("Originator", ORIGINATOR);
        if let Some(account_id) = self.tokens.account_id() {
            request = request.header("Chatgpt-Account-Id", account_id);
        }

        let response = request
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(format!("Codex request failed: {}", e)))?;
        Ok(UpstreamResponse::from_reqwest(response))
    }

    fn quota(&self) -> Result<CodexQuota> {
        let (email, plan_type, account_id) = self
            .tokens
            .account_info()
            .ok_or_else(|| GatewayError::auth("no Codex auth data loaded"))?;
        Ok(CodexQuota {
            has_access: plan_has_access(&plan_type),
            email,
            plan_type,
            account_id,
            models: SUPPORTED_MODELS.iter().map(|m| m.to_string()).collect(),
        })
    }
}
