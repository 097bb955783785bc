use crate::error::{GatewayError, Result};
use crate::schema::Strictness;
use crate::store::ModelRoute;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_request_log")]
    pub request_log: PathBuf,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub routes: Vec<ModelRoute>,
    #[serde(default = "default_compat_providers")]
    pub compat_providers: Vec<CompatProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_urls")]
    pub base_urls: Vec<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_accounts_file")]
    pub accounts_file: PathBuf,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_window_secs")]
    pub refresh_window_secs: u64,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_client_secret_env")]
    pub client_secret_env: String,
    #[serde(default = "default_project_id")]
    pub default_project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodexConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_codex_base_url")]
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelScope {
    AllModels,
    UnknownPrefixOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatProviderConfig {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    pub api_key_env: String,
    #[serde(default = "default_model_scope")]
    pub model_scope: ModelScope,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

pub const OPENAI_CHAT_CAPABILITY: &str = "openai.chat";

fn default_port() -> u16 {
    8086
}

fn default_provider() -> String {
    "google".to_string()
}

fn default_request_log() -> PathBuf {
    PathBuf::from("nexus-requests.jsonl")
}

fn default_true() -> bool {
    true
}

fn default_base_urls() -> Vec<String> {
    vec![
        "https://daily-cloudcode-pa.googleapis.com/v1internal".to_string(),
        "https://cloudcode-pa.googleapis.com/v1internal".to_string(),
        "https://daily-cloudcode-pa.sandbox.googleapis.com/v1internal".to_string(),
    ]
}

fn default_user_agent() -> String {
    "antigravity/1.11.9 windows/amd64".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_accounts_file() -> PathBuf {
    PathBuf::from("nexus-accounts.json")
}

fn default_refresh_interval_secs() -> u64 {
    15 * 60
}

fn default_refresh_window_secs() -> u64 {
    20 * 60
}

fn default_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_client_id() -> String {
    "1071006060591-tmhssin2h21lcre235vtolojh4g403ep.apps.googleusercontent.com".to_string()
}

fn default_client_secret_env() -> String {
    "NEXUS_GOOGLE_CLIENT_SECRET".to_string()
}

fn default_project_id() -> String {
    "bamboo-precept-lgxtn".to_string()
}

fn default_codex_base_url() -> String {
    "https://chatgpt.com/backend-api/codex".to_string()
}

fn default_model_scope() -> ModelScope {
    ModelScope::AllModels
}

fn default_capabilities() -> Vec<String> {
    vec![OPENAI_CHAT_CAPABILITY.to_string()]
}

fn default_compat_providers() -> Vec<CompatProviderConfig> {
    vec![
        CompatProviderConfig {
            id: "openrouter".to_string(),
            enabled: true,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            model_scope: ModelScope::AllModels,
            capabilities: default_capabilities(),
        },
        CompatProviderConfig {
            id: "nvidia".to_string(),
            enabled: true,
            base_url: "https://integrate.api.nvidia.com/v1".to_string(),
            api_key_env: "NVIDIA_API_KEY".to_string(),
            model_scope: ModelScope::UnknownPrefixOnly,
            capabilities: default_capabilities(),
        },
    ]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            default_provider: default_provider(),
            request_log: default_request_log(),
            verbose: false,
            upstream: UpstreamConfig::default(),
            credentials: CredentialsConfig::default(),
            codex: CodexConfig::default(),
            schema: SchemaConfig::default(),
            routes: Vec::new(),
            compat_providers: default_compat_providers(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_urls: default_base_urls(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            accounts_file: default_accounts_file(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_window_secs: default_refresh_window_secs(),
            token_url: default_token_url(),
            client_id: default_client_id(),
            client_secret_env: default_client_secret_env(),
            default_project_id: default_project_id(),
        }
    }
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: default_codex_base_url(),
            auth_file: None,
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Search standard locations for a config file.
    /// Priority: CLI arg > CWD > XDG config > home dir. No file means defaults.
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn validate(&self) -> Result<()> {
        if self.upstream.base_urls.is_empty() {
            return Err(GatewayError::config("upstream.base_urls must not be empty"));
        }
        for provider in &self.compat_providers {
            let id = provider.id.as_str();
            let well_formed = id
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                && id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
            if !well_formed {
                return Err(GatewayError::config(format!(
                    "Invalid compat provider id '{}': use lowercase letters, digits and '-'",
                    id
                )));
            }
        }
        Ok(())
    }

    pub fn schema_strictness(&self) -> Strictness {
        if self.schema.strict {
            Strictness::Strict
        } else {
            Strictness::Standard
        }
    }

    /// Resolve the Google OAuth client secret from the configured environment variable.
    pub fn client_secret(&self) -> Option<String> {
        std::env::var(&self.credentials.client_secret_env)
            .ok()
            .filter(|s| !s.is_empty())
    }

    pub fn codex_auth_file(&self) -> Option<PathBuf> {
        self.codex
            .auth_file
            .clone()
            .or_else(|| dirs_path().map(|home| home.join(".codex").join("auth.json")))
    }

    pub fn compat_provider(&self, id: &str) -> Option<&CompatProviderConfig> {
        self.compat_providers
            .iter()
            .find(|p| p.enabled && p.id.eq_ignore_ascii_case(id.trim()))
    }
}

impl CompatProviderConfig {
    /// Resolve the API key from the configured environment variable
    pub fn resolve_api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).map_err(|_| {
            GatewayError::config(format!(
                "Environment variable '{}' not set for provider '{}'",
                self.api_key_env, self.id
            ))
        })
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // CWD
    paths.push(PathBuf::from("nexus.toml"));

    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        paths.push(PathBuf::from(xdg).join("nexus").join("config.toml"));
    }
    if let Some(home) = dirs_path() {
        paths.push(home.join(".config").join("nexus").join("config.toml"));
        paths.push(home.join(".nexus.toml"));
    }

    paths
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 9000

[credentials]
accounts_file = "/var/lib/nexus/accounts.json"
refresh_window_secs = 600

[schema]
strict = true

[[routes]]
client_model = "gpt-4o"
target_provider = "google"
target_model = "gemini-3-pro-high"

[[compat_providers]]
id = "local-llm"
base_url = "http://localhost:8000/v1"
api_key_env = "LOCAL_KEY"
model_scope = "unknown_prefix_only"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.credentials.refresh_window_secs, 600);
        assert_eq!(config.credentials.refresh_interval_secs, 900);
        assert_eq!(config.schema_strictness(), Strictness::Strict);
        assert_eq!(config.routes.len(), 1);
        assert!(config.routes[0].is_active);
        assert_eq!(config.compat_providers.len(), 1);
        assert_eq!(
            config.compat_providers[0].model_scope,
            ModelScope::UnknownPrefixOnly
        );
        assert_eq!(config.upstream.base_urls.len(), 3);
    }

    #[test]
    fn test_defaults() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 8086);
        assert_eq!(config.default_provider, "google");
        assert!(config.upstream.base_urls[0].contains("daily-cloudcode-pa.googleapis.com"));
        assert_eq!(config.credentials.default_project_id, "bamboo-precept-lgxtn");
        let ids: Vec<_> = config.compat_providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["openrouter", "nvidia"]);
        assert!(config.compat_provider("OpenRouter").is_some());
    }

    #[test]
    fn test_rejects_bad_provider_id() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
[[compat_providers]]
id = "Bad Id"
base_url = "http://x"
api_key_env = "K"
"#
        )
        .unwrap();
        assert!(GatewayConfig::load(f.path()).is_err());
    }
}
